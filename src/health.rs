//! # HealthMonitor: periodic backend liveness probes
//!
//! ## Responsibility
//! Call every registered adapter's `health_check` on a fixed interval and
//! write the result into the registry's health flags, independent of
//! request traffic.
//!
//! ## Guarantees
//! - Isolated: one probe hanging or failing only affects that backend's
//!   flag; every probe is bounded by a timeout
//! - Supervised: the loop runs in a spawned task that exits when
//!   [`MonitorHandle::shutdown`] is awaited
//! - Quota-neutral: never reads or writes active task counts
//!
//! ## NOT Responsible For
//! - Marking backends unhealthy after request failures (see: `dispatcher`)

use crate::backend::HealthReport;
use crate::registry::BackendRegistry;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Periodic health prober over a shared registry.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    interval: Duration,
    check_timeout: Duration,
}

impl HealthMonitor {
    /// Monitor probing every `interval`, each probe bounded by 10 seconds.
    pub fn new(registry: Arc<BackendRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            check_timeout: Duration::from_secs(10),
        }
    }

    /// Bound each probe by `timeout`.
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Probe period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one pass over every backend, concurrently.
    ///
    /// A probe that exceeds the check timeout counts as unhealthy.
    /// Transitions are logged; steady states are logged at debug level.
    ///
    /// # Returns
    ///
    /// Number of backends healthy after the pass.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn check_all(&self) -> usize {
        let probes = self.registry.iter().map(|(_, slot)| {
            let adapter = Arc::clone(slot.adapter());
            let timeout = self.check_timeout;
            async move {
                match tokio::time::timeout(timeout, adapter.health_check()).await {
                    Ok(report) => report,
                    Err(_) => HealthReport::unhealthy(format!(
                        "health check timed out after {}s",
                        timeout.as_secs()
                    )),
                }
            }
        });
        let reports = join_all(probes).await;

        let mut healthy = 0;
        for ((_, slot), report) in self.registry.iter().zip(reports) {
            let previous = slot.record_health(&report);
            if report.healthy {
                healthy += 1;
            }
            match (previous, report.healthy) {
                (true, false) => tracing::warn!(
                    backend = slot.name(),
                    detail = %report.detail,
                    "backend became unhealthy"
                ),
                (false, true) => tracing::info!(
                    backend = slot.name(),
                    detail = %report.detail,
                    "backend recovered"
                ),
                _ => tracing::debug!(
                    backend = slot.name(),
                    healthy = report.healthy,
                    "health unchanged"
                ),
            }
        }
        healthy
    }

    /// Start the background loop. The first pass runs immediately.
    ///
    /// # Returns
    ///
    /// A [`MonitorHandle`] that stops and joins the loop.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.interval;
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_s = interval.as_secs(), "health monitor started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let healthy = self.check_all().await;
                        tracing::debug!(
                            healthy,
                            total = self.registry.len(),
                            "health pass complete"
                        );
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("health monitor shutdown signal received");
                        break;
                    }
                }
            }
        });
        MonitorHandle { shutdown_tx, join }
    }
}

/// Handle to a running [`HealthMonitor`] loop.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    /// `true` once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the loop to stop and wait for it to exit.
    ///
    /// An in-progress pass finishes first; no timer outlives this call.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "health monitor task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, VideoBackend};
    use crate::registry::Priority;
    use async_trait::async_trait;

    fn registry_with(mocks: &[Arc<MockBackend>]) -> Arc<BackendRegistry> {
        let mut r = BackendRegistry::new();
        for m in mocks {
            r.register(m.name(), Priority::Primary, true, 1, Arc::clone(m) as Arc<dyn VideoBackend>)
                .expect("test: register");
        }
        Arc::new(r)
    }

    #[tokio::test]
    async fn test_check_all_flips_only_the_failing_backend() {
        let a = Arc::new(MockBackend::new("a"));
        let b = Arc::new(MockBackend::new("b"));
        b.set_healthy(false);
        let registry = registry_with(&[Arc::clone(&a), Arc::clone(&b)]);
        let monitor = HealthMonitor::new(Arc::clone(&registry), Duration::from_secs(60));

        assert_eq!(monitor.check_all().await, 1);
        assert!(registry.get(0).expect("test: slot").is_healthy());
        assert!(!registry.get(1).expect("test: slot").is_healthy());
        assert_eq!(registry.get(1).expect("test: slot").active(), 0);

        b.set_healthy(true);
        assert_eq!(monitor.check_all().await, 2);
        assert!(registry.get(1).expect("test: slot").is_healthy());
    }

    struct Hanging(crate::capabilities::BackendCapabilities);

    #[async_trait]
    impl VideoBackend for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }
        fn capabilities(&self) -> &crate::capabilities::BackendCapabilities {
            &self.0
        }
        fn poll_settings(&self) -> crate::backend::PollSettings {
            crate::backend::PollSettings::new(Duration::from_secs(1), Duration::from_secs(1))
        }
        async fn submit(
            &self,
            _task: &crate::task::GenerationTask,
        ) -> Result<crate::task::RemoteHandle, crate::DispatchError> {
            Err(crate::DispatchError::Other("unused".into()))
        }
        async fn poll(
            &self,
            _handle: &crate::task::RemoteHandle,
        ) -> Result<crate::task::TaskSnapshot, crate::DispatchError> {
            Err(crate::DispatchError::Other("unused".into()))
        }
        async fn cancel(
            &self,
            _handle: &crate::task::RemoteHandle,
        ) -> Result<bool, crate::DispatchError> {
            Ok(false)
        }
        async fn health_check(&self) -> HealthReport {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            HealthReport::healthy("never")
        }
    }

    #[tokio::test]
    async fn test_hanging_probe_times_out_as_unhealthy() {
        let mut r = BackendRegistry::new();
        r.register("hanging", Priority::Primary, true, 1, Arc::new(Hanging(MockBackend::default_capabilities("hanging"))))
            .expect("test: register");
        let registry = Arc::new(r);
        let monitor = HealthMonitor::new(Arc::clone(&registry), Duration::from_secs(60))
            .with_check_timeout(Duration::from_millis(20));
        assert_eq!(monitor.check_all().await, 0);
        let slot = registry.get(0).expect("test: slot");
        assert!(!slot.is_healthy());
        assert!(slot
            .last_health()
            .is_some_and(|h| h.detail.contains("timed out")));
    }

    #[tokio::test]
    async fn test_spawned_loop_probes_and_shuts_down() {
        let a = Arc::new(MockBackend::new("a"));
        a.set_healthy(false);
        let registry = registry_with(&[Arc::clone(&a)]);
        let handle =
            HealthMonitor::new(Arc::clone(&registry), Duration::from_millis(10)).spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!registry.get(0).expect("test: slot").is_healthy());
        assert!(a.health_check_count() >= 2);

        let result = tokio::time::timeout(Duration::from_secs(5), handle.shutdown()).await;
        assert!(result.is_ok(), "shutdown must join the loop");
        let checks = a.health_check_count();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(a.health_check_count(), checks, "no probes after shutdown");
    }
}
