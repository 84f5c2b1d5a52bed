//! # Declarative Dispatcher Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that declares the registered backends
//! (kind, priority tier, concurrency cap, credentials, polling overrides),
//! the dispatcher knobs (failover, health interval, batch gate) and the
//! observability settings.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `VideoConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Ordered: `[[backends]]` order is registration order, which breaks
//!   priority ties during selection
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Constructing adapters (that belongs to `backend::build_backend`)
//! - Building the dispatcher (that belongs to `dispatcher`)

pub mod loader;
pub mod validation;

use crate::registry::Priority;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Default value functions ──────────────────────────────────────────────

/// Default health probe period: 60 seconds.
fn default_health_interval_s() -> u64 {
    60
}

/// Default bound on a single health probe: 10 seconds.
fn default_health_check_timeout_s() -> u64 {
    10
}

/// Default batch-wide concurrency gate.
fn default_max_concurrent_requests() -> usize {
    2
}

/// Default tolerance for consecutive poll errors.
fn default_max_poll_errors() -> u32 {
    3
}

/// Default number of finished tasks kept for status lookups.
fn default_finished_task_capacity() -> usize {
    crate::dispatcher::DEFAULT_FINISHED_CAPACITY
}

/// Default per-backend concurrency cap.
fn default_max_concurrent() -> usize {
    3
}

/// Default enabled state: true.
fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a dispatcher instance.
///
/// # Example
///
/// ```toml
/// [dispatcher]
/// fallback_enabled = true
///
/// [[backends]]
/// name = "svd"
/// kind = "svd"
/// priority = "primary"
///
/// [[backends]]
/// name = "runway"
/// kind = "runway"
/// priority = "secondary"
/// api_key_env = "RUNWAY_API_KEY"
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct VideoConfig {
    /// Dispatcher-wide behaviour.
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    /// Logging and metrics endpoint.
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Registered backends in registration order.
    pub backends: Vec<BackendConfig>,
}

// ── Dispatcher ───────────────────────────────────────────────────────────

/// Dispatcher-wide settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DispatcherSection {
    /// Retry on another backend after a backend failure.
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    /// Seconds between health monitor passes.
    #[serde(default = "default_health_interval_s")]
    pub health_interval_s: u64,
    /// Upper bound (seconds) on one backend's health probe.
    #[serde(default = "default_health_check_timeout_s")]
    pub health_check_timeout_s: u64,
    /// Batch-wide in-flight limit, independent of per-backend caps.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Consecutive poll errors tolerated before an attempt fails over.
    #[serde(default = "default_max_poll_errors")]
    pub max_poll_errors: u32,
    /// Finished tasks kept for status lookups; older ones are evicted.
    #[serde(default = "default_finished_task_capacity")]
    pub finished_task_capacity: usize,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            fallback_enabled: default_true(),
            health_interval_s: default_health_interval_s(),
            health_check_timeout_s: default_health_check_timeout_s(),
            max_concurrent_requests: default_max_concurrent_requests(),
            max_poll_errors: default_max_poll_errors(),
            finished_task_capacity: default_finished_task_capacity(),
        }
    }
}

// ── Backends ─────────────────────────────────────────────────────────────

/// Supported adapter kinds.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Self-hosted Stable Video Diffusion server.
    Svd,
    /// Runway ML API.
    Runway,
    /// Pika Labs API.
    Pika,
    /// Luma Dream Machine API.
    Luma,
    /// In-process scripted backend for testing and demos.
    Mock,
}

/// One `[[backends]]` entry.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BackendConfig {
    /// Unique registry name.
    pub name: String,
    /// Which adapter to build.
    pub kind: BackendKind,
    /// Selection tier.
    pub priority: Priority,
    /// Whether the selector may use this backend.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Concurrency cap for this backend.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// API root or server address. Provider default when `None`.
    pub base_url: Option<String>,
    /// Inline API key.
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    /// Provider model name.
    pub model: Option<String>,
    /// Poll interval override in seconds.
    pub poll_interval_s: Option<u64>,
    /// Maximum wait override in seconds.
    pub max_wait_s: Option<u64>,
    /// HTTP request timeout in seconds.
    pub request_timeout_s: Option<u64>,
}

// ── Observability ────────────────────────────────────────────────────────

/// Observability configuration: logging and metrics endpoint.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Port for the metrics HTTP endpoint. `None` disables it.
    pub metrics_port: Option<u16>,
}

/// Log output format.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

impl LogFormat {
    /// The `LOG_FORMAT` spelling of this format.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

/// Export the JSON Schema for `VideoConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(VideoConfig);
    serde_json::to_string_pretty(&schema)
}
