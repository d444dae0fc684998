//! The top-level reconciliation loop.
//!
//! Each cycle takes one inventory snapshot, derives the deterministic
//! service topology, renders it, and applies the result only when the
//! fingerprint moved.  Cycles are strictly sequential; the fixed-interval
//! sleep is the only scheduling primitive.

use std::time::Duration;

use log::{info, warn};
use tokio::time::sleep;

use crate::config::Config;
use crate::extract::extract_all;
use crate::group::group_services;
use crate::render::Renderer;
use crate::runtime::docker::ENABLE_LABEL;
use crate::runtime::ContainerRuntime;
use crate::supervisor::Applier;
use crate::types::WholeConfiguration;

pub struct Reconciler<R, A> {
    stats_port: i32,
    poll_interval: Duration,
    runtime: R,
    renderer: Renderer,
    applier: A,
    /// Fingerprint of the last applied configuration; `None` until the
    /// first successful apply.
    last_fingerprint: Option<String>,
    /// Latches the "no containers" message so an empty streak logs once.
    empty_logged: bool,
}

impl<R, A> Reconciler<R, A>
where
    R: ContainerRuntime + Send + Sync,
    A: Applier,
{
    pub fn new(cfg: &Config, runtime: R, renderer: Renderer, applier: A) -> Self {
        Self {
            stats_port: cfg.stats_port,
            poll_interval: Duration::from_secs(cfg.poll_interval),
            runtime,
            renderer,
            applier,
            last_fingerprint: None,
            empty_logged: false,
        }
    }

    /// Runs forever until a fatal error propagates out.  The baseline
    /// apply keeps a listener up from the very start, even before the
    /// first inventory snapshot.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.apply_baseline().await?;
        loop {
            self.cycle().await?;
            sleep(self.poll_interval).await;
        }
    }

    async fn apply_baseline(&mut self) -> anyhow::Result<()> {
        let whole = WholeConfiguration {
            services: Vec::new(),
            stats_port: self.stats_port,
        };
        let rendered = self.renderer.render(&whole)?;
        self.applier.apply(&rendered.text).await?;
        self.last_fingerprint = Some(rendered.fingerprint);
        Ok(())
    }

    async fn cycle(&mut self) -> anyhow::Result<()> {
        let workloads = self.runtime.list_enabled().await?;

        let (extracted, skipped) = extract_all(&workloads);
        for (name, err) in &skipped {
            warn!("Container {} skipped due to error: {}", name, err);
        }

        let services = group_services(extracted);
        if services.is_empty() {
            if !self.empty_logged {
                info!("No container found with label {}", ENABLE_LABEL);
                self.empty_logged = true;
            }
        } else {
            self.empty_logged = false;
        }

        let whole = WholeConfiguration {
            services,
            stats_port: self.stats_port,
        };
        let rendered = self.renderer.render(&whole)?;

        if self.last_fingerprint.as_deref() != Some(rendered.fingerprint.as_str()) {
            log_topology(&whole);
            self.applier.apply(&rendered.text).await?;
            self.last_fingerprint = Some(rendered.fingerprint);
        }

        Ok(())
    }
}

fn log_topology(whole: &WholeConfiguration) {
    info!("Backend change detected. Reconfiguring load balancer with:");
    for service in &whole.services {
        let bind = if service.publish.bind_address.is_empty() {
            "*"
        } else {
            service.publish.bind_address.as_str()
        };
        if service.publish.ssl_cert.is_empty() {
            info!("Publish {}:{} HTTP", bind, service.publish.port);
        } else {
            info!(
                "Publish {}:{} SSL {}",
                bind, service.publish.port, service.publish.ssl_cert
            );
        }
        for backend in &service.backends {
            info!(
                "  |- Backend {} at {} port {}",
                backend.name, backend.address, backend.port
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Workload;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct FakeRuntime {
        /// One entry per cycle; the last entry repeats once exhausted.
        batches: Vec<Vec<Workload>>,
        calls: AtomicUsize,
    }

    impl FakeRuntime {
        fn new(batches: Vec<Vec<Workload>>) -> Self {
            Self {
                batches,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn list_enabled(&self) -> Result<Vec<Workload>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let idx = call.min(self.batches.len() - 1);
            Ok(self.batches[idx].clone())
        }
    }

    struct FailingRuntime;

    #[async_trait]
    impl ContainerRuntime for FailingRuntime {
        async fn list_enabled(&self) -> Result<Vec<Workload>> {
            Err(anyhow::anyhow!("daemon unreachable"))
        }
    }

    #[derive(Clone, Default)]
    struct CountingApplier {
        applies: Arc<AtomicUsize>,
        last_text: Arc<Mutex<String>>,
    }

    #[async_trait]
    impl Applier for CountingApplier {
        async fn apply(&self, text: &str) -> Result<()> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            *self.last_text.lock().unwrap() = text.to_string();
            Ok(())
        }
    }

    fn workload(name: &str, publish: &str, target: &str, address: &str) -> Workload {
        Workload {
            name: name.to_string(),
            labels: [
                ("lb.publish".to_string(), publish.to_string()),
                ("lb.target".to_string(), target.to_string()),
            ]
            .into_iter()
            .collect(),
            addresses: BTreeMap::from([("net".to_string(), address.to_string())]),
        }
    }

    fn reconciler<R: ContainerRuntime + Send + Sync>(
        runtime: R,
        applier: CountingApplier,
    ) -> Reconciler<R, CountingApplier> {
        let cfg = Config {
            template_file: PathBuf::from("/nonexistent/haproxy.tmpl"),
            ..Config::default()
        };
        let renderer = Renderer::new(&cfg).expect("renderer");
        Reconciler::new(&cfg, runtime, renderer, applier)
    }

    #[tokio::test]
    async fn same_topology_twice_applies_once() {
        let batch = vec![workload("web", "80", "8080", "10.0.0.2")];
        let applier = CountingApplier::default();
        let mut rec = reconciler(FakeRuntime::new(vec![batch]), applier.clone());

        rec.cycle().await.unwrap();
        rec.cycle().await.unwrap();
        rec.cycle().await.unwrap();

        assert_eq!(applier.applies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn topology_change_triggers_reapply() {
        let applier = CountingApplier::default();
        let mut rec = reconciler(
            FakeRuntime::new(vec![
                vec![workload("web", "80", "8080", "10.0.0.2")],
                vec![
                    workload("web", "80", "8080", "10.0.0.2"),
                    workload("web-2", "80", "8080", "10.0.0.3"),
                ],
            ]),
            applier.clone(),
        );

        rec.cycle().await.unwrap();
        rec.cycle().await.unwrap();

        assert_eq!(applier.applies.load(Ordering::SeqCst), 2);
        assert!(applier
            .last_text
            .lock()
            .unwrap()
            .contains("server web-2 10.0.0.3:8080"));
    }

    #[tokio::test]
    async fn empty_inventory_applies_empty_config_once() {
        let applier = CountingApplier::default();
        let mut rec = reconciler(FakeRuntime::new(vec![vec![]]), applier.clone());

        // Baseline keeps a listener up, then repeated empty cycles
        // fingerprint identically and never re-apply.
        rec.apply_baseline().await.unwrap();
        rec.cycle().await.unwrap();
        rec.cycle().await.unwrap();
        rec.cycle().await.unwrap();

        assert_eq!(applier.applies.load(Ordering::SeqCst), 1);
        assert!(!applier.last_text.lock().unwrap().contains("frontend"));
    }

    #[tokio::test]
    async fn scale_to_zero_reapplies_empty_config() {
        let applier = CountingApplier::default();
        let mut rec = reconciler(
            FakeRuntime::new(vec![
                vec![workload("web", "80", "8080", "10.0.0.2")],
                vec![],
            ]),
            applier.clone(),
        );

        rec.cycle().await.unwrap();
        rec.cycle().await.unwrap();

        // The balancer keeps running with zero backends.
        assert_eq!(applier.applies.load(Ordering::SeqCst), 2);
        assert!(!applier.last_text.lock().unwrap().contains("frontend"));
    }

    #[tokio::test]
    async fn malformed_container_is_isolated() {
        let mut batch: Vec<Workload> = (0..9)
            .map(|i| {
                workload(
                    &format!("svc-{i}"),
                    "80",
                    "8080",
                    &format!("10.0.0.{}", i + 2),
                )
            })
            .collect();
        batch.push(workload("broken", "abc", "8080", "10.0.0.99"));

        let applier = CountingApplier::default();
        let mut rec = reconciler(FakeRuntime::new(vec![batch]), applier.clone());
        rec.cycle().await.unwrap();

        let text = applier.last_text.lock().unwrap().clone();
        assert_eq!(text.matches("server svc-").count(), 9);
        assert!(!text.contains("broken"));
    }

    #[tokio::test]
    async fn permuted_inventory_does_not_reapply() {
        let a = workload("alpha", "80", "8080", "10.0.0.2");
        let b = workload("beta", "80", "8080", "10.0.0.3");
        let applier = CountingApplier::default();
        let mut rec = reconciler(
            FakeRuntime::new(vec![
                vec![a.clone(), b.clone()],
                vec![b, a],
            ]),
            applier.clone(),
        );

        rec.cycle().await.unwrap();
        rec.cycle().await.unwrap();

        assert_eq!(applier.applies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inventory_query_error_is_fatal() {
        let applier = CountingApplier::default();
        let mut rec = reconciler(FailingRuntime, applier.clone());

        assert!(rec.cycle().await.is_err());
        assert_eq!(applier.applies.load(Ordering::SeqCst), 0);
    }
}
