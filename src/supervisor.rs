//! Lifecycle of the external HAProxy process.
//!
//! The supervisor writes rendered configuration to disk, launches a
//! master-worker HAProxy against it, and on every configuration change
//! launches a replacement master that takes over the listening sockets
//! (`-x <sock> -sf <pid>`) while the old one drains and exits on its own
//! schedule.  The PID file on disk is the canonical record of the running
//! instance, so a restarted controller re-attaches to a master it did not
//! spawn.  Unexpected exits are retried with a bounded budget; exhausting
//! it terminates the whole controller.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use log::{error, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use crate::config::Config;

/// Consecutive unexpected exits tolerated before the controller gives up.
const MAX_CONSECUTIVE_RESTARTS: u32 = 5;
/// Pause before relaunching a crashed instance.
const RESTART_COOLDOWN: Duration = Duration::from_secs(1);

/// The reconciler-facing apply operation: persist the rendered text and
/// make the load balancer serve it.  The production implementation is
/// [`Supervisor`]; tests substitute a counting fake.
#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply(&self, text: &str) -> anyhow::Result<()>;
}

/// What the exit monitor should do after observing a process exit.
#[derive(Debug, PartialEq, Eq)]
enum ExitAction {
    /// Superseded by a newer master, or stopped on purpose.
    Expected,
    /// Unexpected exit within budget.
    Restart,
    /// Unexpected exit past the budget.
    GiveUp,
}

#[derive(Debug)]
struct State {
    /// Bumped on every launch; an exiting instance compares its own
    /// generation against this to tell a handover drain from a crash.
    generation: u64,
    desired_running: bool,
    consecutive_crashes: u32,
}

impl State {
    fn new() -> Self {
        Self {
            generation: 0,
            desired_running: false,
            consecutive_crashes: 0,
        }
    }

    fn on_exit(&mut self, exited_generation: u64) -> ExitAction {
        if exited_generation != self.generation || !self.desired_running {
            return ExitAction::Expected;
        }
        self.consecutive_crashes += 1;
        if self.consecutive_crashes > MAX_CONSECUTIVE_RESTARTS {
            ExitAction::GiveUp
        } else {
            ExitAction::Restart
        }
    }
}

struct Inner {
    binary: PathBuf,
    config_file: PathBuf,
    pid_file: PathBuf,
    sock_file: PathBuf,
    state: Mutex<State>,
    shutdown: mpsc::Sender<i32>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Resolves the load-balancer binary up front; a missing binary is a
    /// fatal startup error.
    pub fn new(cfg: &Config, shutdown: mpsc::Sender<i32>) -> anyhow::Result<Self> {
        let binary = resolve_binary(&cfg.binary)
            .ok_or_else(|| anyhow::anyhow!("{} executable not found on PATH", cfg.binary))?;
        info!("Using load balancer binary {}", binary.display());

        Ok(Self {
            inner: Arc::new(Inner {
                binary,
                config_file: cfg.config_file.clone(),
                pid_file: cfg.pid_file.clone(),
                sock_file: cfg.sock_file.clone(),
                state: Mutex::new(State::new()),
                shutdown,
            }),
        })
    }

    /// Controller shutdown: stop restarting and forcefully kill whatever
    /// instance the PID file points at.
    pub async fn terminate(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.desired_running = false;
        }
        if let Some(pid) = find_running_pid(&self.inner.pid_file) {
            info!("Sending SIGKILL to haproxy pid {}", pid);
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!("Failed to kill pid {}: {}", pid, e);
            }
        }
    }

    fn launch_argv(&self, takeover_pid: Option<i32>) -> Vec<String> {
        let mut args = vec![
            "-W".to_string(),
            "-f".to_string(),
            self.inner.config_file.display().to_string(),
        ];
        if let Some(pid) = takeover_pid {
            args.push("-x".to_string());
            args.push(self.inner.sock_file.display().to_string());
            args.push("-sf".to_string());
            args.push(pid.to_string());
        }
        args
    }

    /// Spawns a new master.  If a previous instance is alive according to
    /// the PID file, the new master is told to take over its listening
    /// sockets and let it drain; the supervisor never waits for the old
    /// master and never signals it itself.
    // Returns a boxed `Send` future rather than an `async fn`'s opaque type:
    // `launch` spawns a monitor that calls back into `handle_exit`, which calls
    // `launch` again, and this concrete return type breaks the recursive opaque
    // cycle that would otherwise block the monitor future from being `Send`.
    fn launch(
        &self,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + '_>,
    > {
        Box::pin(async move {
            let takeover = find_running_pid(&self.inner.pid_file);
            let args = self.launch_argv(takeover);

            info!(
                "Starting new instance: {} {}",
                self.inner.binary.display(),
                args.join(" ")
            );

            // Stdio is inherited so operator-visible output is not lost.
            let mut child = Command::new(&self.inner.binary)
                .args(&args)
                .spawn()
                .with_context(|| {
                    format!("Failed to start {}", self.inner.binary.display())
                })?;

            let generation = {
                let mut state = self.inner.state.lock().await;
                state.generation += 1;
                state.generation
            };

            let spawned_pid = child.id();
            let supervisor = self.clone();
            tokio::spawn(async move {
                let status = child.wait().await;
                supervisor.handle_exit(generation, spawned_pid, status).await;
            });

            Ok(())
        })
    }

    async fn handle_exit(
        &self,
        generation: u64,
        pid: Option<u32>,
        status: std::io::Result<ExitStatus>,
    ) {
        let (action, crashes) = {
            let mut state = self.inner.state.lock().await;
            let action = state.on_exit(generation);
            (action, state.consecutive_crashes)
        };

        match action {
            ExitAction::Expected => {
                info!(
                    "Master instance pid {:?} has finished ({:?})",
                    pid, status
                );
            }
            ExitAction::Restart => {
                warn!(
                    "Master instance pid {:?} exited unexpectedly ({:?}); restart {}/{}",
                    pid, status, crashes, MAX_CONSECUTIVE_RESTARTS
                );
                sleep(RESTART_COOLDOWN).await;
                if let Err(e) = self.launch().await {
                    error!("Failed to relaunch load balancer: {:#}", e);
                    let _ = self.inner.shutdown.send(1).await;
                }
            }
            ExitAction::GiveUp => {
                error!(
                    "Load balancer crashed {} times in a row; giving up",
                    crashes
                );
                let _ = self.inner.shutdown.send(1).await;
            }
        }
    }
}

#[async_trait]
impl Applier for Supervisor {
    /// Write-then-launch is a strict sequence: the configuration file is
    /// fully written before the new master is spawned against it.
    async fn apply(&self, text: &str) -> anyhow::Result<()> {
        tokio::fs::write(&self.inner.config_file, text)
            .await
            .with_context(|| {
                format!(
                    "Failed to write configuration to {}",
                    self.inner.config_file.display()
                )
            })?;
        info!(
            "Wrote {} bytes to {}",
            text.len(),
            self.inner.config_file.display()
        );

        {
            // A planned start resets the crash budget.
            let mut state = self.inner.state.lock().await;
            state.desired_running = true;
            state.consecutive_crashes = 0;
        }

        self.launch().await
    }
}

/// Re-discovers an already-running instance from the PID file: first line
/// parsed as an integer, liveness confirmed with a zero-effect signal
/// probe.  Any failure means "no running instance", never an error.
pub fn find_running_pid(path: &Path) -> Option<i32> {
    let content = std::fs::read_to_string(path).ok()?;
    let pid: i32 = content.lines().next()?.trim().parse().ok()?;
    if pid <= 0 {
        return None;
    }
    kill(Pid::from_raw(pid), None).ok()?;
    Some(pid)
}

fn resolve_binary(name: &str) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.is_absolute() {
        return direct.exists().then(|| direct.to_path_buf());
    }
    let path_env = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_env) {
        let candidate = dir.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}
