//! # tokio-video-orchestrator
//!
//! Multi-backend video generation dispatcher over Tokio.
//!
//! ## Architecture
//!
//! Every request flows through capability matching, priority selection and
//! failover before reaching a provider adapter:
//! ```text
//! GenerationTask → Matcher → Selector(priority, health, quota) → Adapter
//!                                 ↑                                  │
//!                                 └──── failover on backend error ───┘
//! HealthMonitor (periodic) ──→ Registry.healthy flags
//! BatchCoordinator ──→ bounded fan-out over Dispatcher::generate
//! ```

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![warn(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod backend;
pub mod batch;
pub mod capabilities;
pub mod config;
pub mod dispatcher;
pub mod health;
pub mod matcher;
pub mod metrics;
pub mod registry;
pub mod selector;
pub mod task;

#[cfg(feature = "metrics-server")]
pub mod metrics_server;

// Re-exports for convenience
pub use backend::{
    LumaBackend, MockBackend, PikaBackend, RunwayBackend, SvdBackend, VideoBackend,
};
pub use batch::{BatchCoordinator, BatchResult, Scene};
pub use capabilities::BackendCapabilities;
pub use dispatcher::{BackendInfo, Dispatcher, HealthSnapshot, OverallHealth};
pub use health::{HealthMonitor, MonitorHandle};
pub use registry::{BackendRegistry, Priority};
pub use task::{GenerationTask, RemoteHandle, TaskSnapshot, TaskStatus};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`DispatchError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```no_run
/// # use tokio_video_orchestrator::{init_tracing, DispatchError};
/// # fn example() -> Result<(), DispatchError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), DispatchError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    init_tracing_with_format(&format)
}

/// Like [`init_tracing`] but with the format passed explicitly
/// (`"json"` or `"pretty"`), e.g. from the config file.
///
/// # Errors
///
/// Returns [`DispatchError::Other`] if a global subscriber is already set.
pub fn init_tracing_with_format(format: &str) -> Result<(), DispatchError> {
    let result = match format {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| DispatchError::Other(format!("tracing init failed: {e}")))
}

/// Top-level dispatcher errors.
///
/// Adapters, the dispatcher and the batch coordinator all report through
/// this type. The failover loop uses [`DispatchError::is_backend_failure`]
/// to decide whether to mark a backend unhealthy and move on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// A backend is misconfigured (missing credential, bad URL).
    ///
    /// Adapters still construct with a bad credential (logging a warning);
    /// this is returned from `submit` and reported by the health check.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The task's parameters were rejected before any remote call.
    #[error("validation error: {0}")]
    Validation(String),

    /// The provider answered with a non-success status.
    #[error("{backend} API error (HTTP {status}): {message}")]
    RemoteApi {
        /// Registry name of the backend.
        backend: String,
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The provider could not be reached or answered with garbage.
    #[error("{backend} transport error: {message}")]
    Transport {
        /// Registry name of the backend.
        backend: String,
        /// Underlying error text.
        message: String,
    },

    /// The job did not reach a terminal state within the backend's limit.
    #[error("{backend} timed out after {waited_s}s")]
    Timeout {
        /// Registry name of the backend.
        backend: String,
        /// Seconds waited before giving up.
        waited_s: u64,
    },

    /// No enabled, healthy backend with free quota can run the task.
    #[error("no backend available: {0}")]
    NoBackendAvailable(String),

    /// The task was cancelled while in flight.
    #[error("task cancelled")]
    Cancellation,

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl DispatchError {
    /// `true` for errors that say something about the backend itself
    /// (remote error, transport failure, unusable configuration); these
    /// trigger failover and mark the backend unhealthy.
    ///
    /// Timeouts are not backend failures: the remote job may still be
    /// running, so the attempt ends as a local `Failed`.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Self::RemoteApi { .. } | Self::Transport { .. } | Self::Configuration(_)
        )
    }

    /// Short label used as the `outcome` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Validation(_) => "validation",
            Self::RemoteApi { .. } => "remote_api",
            Self::Transport { .. } => "transport",
            Self::Timeout { .. } => "timeout",
            Self::NoBackendAvailable(_) => "no_backend",
            Self::Cancellation => "cancelled",
            Self::Other(_) => "other",
        }
    }
}
