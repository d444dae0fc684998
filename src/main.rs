//! tether daemon entry point.

use log::{error, info};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

mod config;
mod extract;
mod group;
mod reconcile;
mod render;
mod runtime;
mod supervisor;
mod types;

use config::Config;
use reconcile::Reconciler;
use render::Renderer;
use runtime::DockerRuntime;
use supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting tether daemon with config: {:?}", cfg);
    if cfg.stats_port > 0 {
        info!("Statistics port is {}", cfg.stats_port);
    }
    info!(
        "Container refresh interval check is {} seconds",
        cfg.poll_interval
    );

    // First termination message decides the process exit code.
    let (exit_tx, mut exit_rx) = mpsc::channel::<i32>(1);

    let runtime = DockerRuntime::connect()?;
    let renderer = Renderer::new(&cfg)?;
    let supervisor = Supervisor::new(&cfg, exit_tx.clone())?;

    // Reconciliation loop
    let reconciler = Reconciler::new(&cfg, runtime, renderer, supervisor.clone());
    let loop_exit = exit_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = reconciler.run().await {
            error!("Reconciliation failed: {:#}", e);
            let _ = loop_exit.send(1).await;
        }
    });

    // Termination signals
    let signal_supervisor = supervisor.clone();
    tokio::spawn(async move {
        match wait_for_termination().await {
            Ok(()) => {
                info!("Exit signal received");
                signal_supervisor.terminate().await;
                let _ = exit_tx.send(0).await;
            }
            Err(e) => {
                error!("Unable to listen for shutdown signals: {}", e);
            }
        }
    });

    let code = exit_rx.recv().await.unwrap_or(1);
    info!("tether terminated");
    std::process::exit(code);
}

/// Resolves on the first of SIGHUP, SIGINT, SIGTERM or SIGQUIT.
async fn wait_for_termination() -> std::io::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = hangup.recv() => {}
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }
    Ok(())
}
