//! Prometheus metrics for the video dispatcher.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup **before** building the
//! dispatcher. The helper functions (`record_outcome`, `inc_failover`, …) are
//! no-ops if `init_metrics` was never called, so dispatch is always safe to
//! run and observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `video_dispatch_requests_total` | Counter | `backend`, `outcome` |
//! | `video_dispatch_failovers_total` | Counter | `backend` |
//! | `video_dispatch_backend_healthy` | Gauge | `backend` |
//! | `video_dispatch_active_tasks` | Gauge | `backend` |
//! | `video_dispatch_generation_duration_seconds` | Histogram | `backend` |

use crate::DispatchError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the dispatcher, bundled together so they can
/// be stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Terminal dispatch outcomes per backend.
    pub requests_total: CounterVec,
    /// Failovers away from a backend.
    pub failovers_total: CounterVec,
    /// 1 when the backend is healthy, 0 otherwise.
    pub backend_healthy: IntGaugeVec,
    /// Reserved quota slots per backend.
    pub active_tasks: IntGaugeVec,
    /// Wall time from submit to terminal status.
    pub generation_duration: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn init_err(e: prometheus::Error) -> DispatchError {
    DispatchError::Other(format!("metrics init failed: {e}"))
}

fn register_err(e: prometheus::Error) -> DispatchError {
    DispatchError::Other(format!("metrics registration failed: {e}"))
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`DispatchError::Other`] if metric construction or registry
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), DispatchError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = CounterVec::new(
        Opts::new(
            "video_dispatch_requests_total",
            "Terminal dispatch outcomes per backend",
        ),
        &["backend", "outcome"],
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(requests_total.clone()))
        .map_err(register_err)?;

    let failovers_total = CounterVec::new(
        Opts::new(
            "video_dispatch_failovers_total",
            "Failovers away from a backend after a backend failure",
        ),
        &["backend"],
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(failovers_total.clone()))
        .map_err(register_err)?;

    let backend_healthy = IntGaugeVec::new(
        Opts::new(
            "video_dispatch_backend_healthy",
            "Backend health flag (1 healthy, 0 unhealthy)",
        ),
        &["backend"],
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(backend_healthy.clone()))
        .map_err(register_err)?;

    let active_tasks = IntGaugeVec::new(
        Opts::new("video_dispatch_active_tasks", "In-flight tasks per backend"),
        &["backend"],
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(active_tasks.clone()))
        .map_err(register_err)?;

    let generation_duration = HistogramVec::new(
        HistogramOpts::new(
            "video_dispatch_generation_duration_seconds",
            "Time from submit to terminal status",
        )
        .buckets(vec![5.0, 15.0, 30.0, 60.0, 120.0, 240.0, 600.0]),
        &["backend"],
    )
    .map_err(init_err)?;
    registry
        .register(Box::new(generation_duration.clone()))
        .map_err(register_err)?;

    let _ = METRICS.set(Metrics {
        registry,
        requests_total,
        failovers_total,
        backend_healthy,
        active_tasks,
        generation_duration,
    });

    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count one terminal outcome (`completed`, `failed`, `timeout`, …) for a
/// backend. No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn record_outcome(backend: &str, outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .requests_total
            .get_metric_with_label_values(&[backend, outcome])
        {
            c.inc();
        }
    }
}

/// Count one failover away from `backend`.
///
/// No-op if metrics have not been initialised.
pub fn inc_failover(backend: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.failovers_total.get_metric_with_label_values(&[backend]) {
            c.inc();
        }
    }
}

/// Set the health gauge for `backend`.
///
/// No-op if metrics have not been initialised.
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.backend_healthy.get_metric_with_label_values(&[backend]) {
            g.set(i64::from(healthy));
        }
    }
}

/// Set the in-flight gauge for `backend`.
///
/// No-op if metrics have not been initialised.
pub fn set_active_tasks(backend: &str, active: usize) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.active_tasks.get_metric_with_label_values(&[backend]) {
            g.set(i64::try_from(active).unwrap_or(i64::MAX));
        }
    }
}

/// Record how long a generation took on `backend`.
///
/// No-op if metrics have not been initialised.
pub fn record_generation_duration(backend: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m
            .generation_duration
            .get_metric_with_label_values(&[backend])
        {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Outcome counts keyed by `"backend:outcome"`.
///
/// Returns an empty map if metrics have not been initialised.
pub fn outcome_counts() -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    let Some(m) = metrics() else {
        return counts;
    };
    for family in m.requests_total.collect() {
        for metric in family.get_metric() {
            let label = |name: &str| {
                metric
                    .get_label()
                    .iter()
                    .find(|l| l.get_name() == name)
                    .map_or("unknown", |l| l.get_value())
                    .to_string()
            };
            let key = format!("{}:{}", label("backend"), label("outcome"));
            counts.insert(key, metric.get_counter().get_value() as u64);
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent_second_call_is_noop() {
        let _ = init_metrics();
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_helpers_before_or_after_init_do_not_panic() {
        record_outcome("pre-init", "completed");
        inc_failover("pre-init");
        set_backend_healthy("pre-init", true);
        set_active_tasks("pre-init", 3);
        record_generation_duration("pre-init", Duration::from_millis(5));
    }

    #[test]
    fn test_record_outcome_is_visible_in_counts() {
        let _ = init_metrics();
        record_outcome("metrics-test-backend", "completed");
        record_outcome("metrics-test-backend", "completed");
        let counts = outcome_counts();
        assert!(counts
            .get("metrics-test-backend:completed")
            .is_some_and(|&v| v >= 2));
    }

    #[test]
    fn test_gather_metrics_contains_metric_names_after_observation() {
        let _ = init_metrics();
        set_backend_healthy("gather-test", true);
        let text = gather_metrics();
        assert!(text.contains("video_dispatch_backend_healthy"));
    }

    #[test]
    fn test_isolated_histogram_records_observation() {
        let registry = Registry::new();
        let h = HistogramVec::new(HistogramOpts::new("t_gen_seconds", "test"), &["backend"])
            .expect("test: histogram");
        registry
            .register(Box::new(h.clone()))
            .expect("test: register");
        h.get_metric_with_label_values(&["svd"])
            .expect("test: labels")
            .observe(12.0);
        let families = registry.gather();
        let count = families[0].get_metric()[0]
            .get_histogram()
            .get_sample_count();
        assert_eq!(count, 1);
    }
}
