//! # Backend adapters: one implementation per remote provider
//!
//! ## Responsibility
//! Define the [`VideoBackend`] contract (capabilities, validate, submit,
//! poll, cancel, health check), the shared submit-then-wait algorithm, and a
//! configuration-driven factory that turns a `[[backends]]` entry into an
//! `Arc<dyn VideoBackend>`.
//!
//! ## Guarantees
//! - Object-safe: adapters are used as `Arc<dyn VideoBackend>`
//! - Fail fast: `submit` never retries internally; non-2xx becomes
//!   [`DispatchError::RemoteApi`]
//! - Bounded wait: [`wait_for_completion`] stops after the provider's
//!   maximum wait and marks the task `Failed` with `"timeout"`
//! - Health checks never return an error; failures become an unhealthy
//!   [`HealthReport`]
//!
//! ## NOT Responsible For
//! - Choosing between backends (see: `selector`)
//! - Failover (see: `dispatcher`)

use crate::capabilities::BackendCapabilities;
use crate::config::{BackendConfig, BackendKind};
use crate::matcher::clamp_duration;
use crate::task::{GenerationTask, RemoteHandle, TaskSnapshot, TaskStatus};
use crate::DispatchError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod luma;
pub mod mock;
pub mod pika;
pub mod runway;
pub mod svd;

pub use luma::LumaBackend;
pub use mock::{MockBackend, MockBehavior};
pub use pika::PikaBackend;
pub use runway::RunwayBackend;
pub use svd::SvdBackend;

/// Consecutive poll errors tolerated by [`wait_for_completion`] by default.
pub const DEFAULT_MAX_POLL_ERRORS: u32 = 3;

/// Default HTTP request timeout for provider calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Provider-specific polling constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Delay between status checks.
    pub interval: Duration,
    /// Longest time to wait for a terminal status.
    pub max_wait: Duration,
    /// Consecutive poll errors tolerated before the attempt fails.
    pub max_poll_errors: u32,
}

impl PollSettings {
    /// Settings with the default poll-error tolerance.
    pub fn new(interval: Duration, max_wait: Duration) -> Self {
        Self {
            interval,
            max_wait,
            max_poll_errors: DEFAULT_MAX_POLL_ERRORS,
        }
    }
}

/// Outcome of a liveness probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// `true` if the provider can take work.
    pub healthy: bool,
    /// Human-readable detail (provider info or failure reason).
    pub detail: String,
}

impl HealthReport {
    /// A passing report.
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            detail: detail.into(),
        }
    }

    /// A failing report.
    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
        }
    }
}

/// Contract every provider adapter satisfies.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via
/// `Arc<dyn VideoBackend>`.
#[async_trait]
pub trait VideoBackend: Send + Sync {
    /// Registry name of this backend instance.
    fn name(&self) -> &str;

    /// Static capability declaration.
    fn capabilities(&self) -> &BackendCapabilities;

    /// Poll interval and maximum wait for this provider.
    fn poll_settings(&self) -> PollSettings;

    /// Reject a task whose parameters fall outside the declared
    /// capabilities. Never mutates the task.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Validation`] naming the first violation.
    fn validate(&self, task: &GenerationTask) -> Result<(), DispatchError> {
        validate_against(task, self.capabilities())
    }

    /// Translate the task to the provider's wire format and send it.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Configuration`] for a missing credential
    /// - [`DispatchError::RemoteApi`] for a non-success response
    /// - [`DispatchError::Transport`] when the provider is unreachable
    async fn submit(&self, task: &GenerationTask) -> Result<RemoteHandle, DispatchError>;

    /// One status check, mapped onto [`TaskStatus`].
    ///
    /// # Errors
    ///
    /// Same classes as [`VideoBackend::submit`].
    async fn poll(&self, handle: &RemoteHandle) -> Result<TaskSnapshot, DispatchError>;

    /// Best-effort cancellation.
    ///
    /// Returns `true` if the job is now cancelled (remotely, or in local
    /// bookkeeping for providers without a cancel endpoint).
    ///
    /// # Errors
    ///
    /// Transport or remote errors from the cancel call itself.
    async fn cancel(&self, handle: &RemoteHandle) -> Result<bool, DispatchError>;

    /// Drop local bookkeeping for a job the caller has stopped waiting on
    /// (finished, timed out or cancelled). Never contacts the provider.
    fn release(&self, _handle: &RemoteHandle) {}

    /// Lightweight liveness probe, distinct from task polling.
    async fn health_check(&self) -> HealthReport;
}

/// Check `task` against hard capability bounds without adapting it.
///
/// # Errors
///
/// Returns [`DispatchError::Validation`] for unsupported image input,
/// resolution, frame rate, or an over-long duration.
///
/// # Panics
///
/// This function never panics.
pub fn validate_against(
    task: &GenerationTask,
    caps: &BackendCapabilities,
) -> Result<(), DispatchError> {
    if task.requires_image_input() && !caps.supports_image_to_video {
        return Err(DispatchError::Validation(format!(
            "{} does not support image-to-video",
            caps.name
        )));
    }
    if !task.requires_image_input() && !caps.supports_text_to_video {
        return Err(DispatchError::Validation(format!(
            "{} does not support text-to-video",
            caps.name
        )));
    }
    if !caps.supports_resolution(&task.resolution) {
        return Err(DispatchError::Validation(format!(
            "{} does not support resolution {}",
            caps.name, task.resolution
        )));
    }
    if !caps.supports_fps(task.fps) {
        return Err(DispatchError::Validation(format!(
            "{} does not support {} fps",
            caps.name, task.fps
        )));
    }
    if task.duration == 0 || task.duration > caps.max_duration_seconds {
        return Err(DispatchError::Validation(format!(
            "duration {}s outside 1..={}s for {}",
            task.duration, caps.max_duration_seconds, caps.name
        )));
    }
    Ok(())
}

/// Clamp `task.duration` to the backend maximum, logging when it changes.
pub fn clamp_task_duration(task: &mut GenerationTask, caps: &BackendCapabilities) {
    let clamped = clamp_duration(task.duration, caps.max_duration_seconds);
    if clamped != task.duration {
        tracing::warn!(
            task_id = %task.task_id,
            backend = %caps.name,
            requested = task.duration,
            clamped,
            "duration exceeds backend maximum, clamping"
        );
        task.duration = clamped;
    }
}

/// Poll `handle` until the task is terminal, the wait budget runs out, or
/// `cancelled` is raised.
///
/// # Arguments
/// * `backend`: Adapter that owns `handle`.
/// * `handle`: Provider job id returned by `submit`.
/// * `task`: Updated in place from each snapshot.
/// * `settings`: Interval, budget and poll-error tolerance.
/// * `cancelled`: Local cancellation flag, checked before every poll.
///
/// # Returns
/// - `Ok(())`: the task reached a terminal status (including a
///   provider-reported `Failed` and a local `Cancelled`)
/// - `Err(DispatchError::Timeout)`: budget exhausted; task is `Failed`
///   with `"timeout"` and the remote job is left running
/// - `Err(e)`: more than `max_poll_errors` consecutive poll errors
///
/// # Panics
///
/// This function never panics.
pub async fn wait_for_completion(
    backend: &dyn VideoBackend,
    handle: &RemoteHandle,
    task: &mut GenerationTask,
    settings: PollSettings,
    cancelled: &AtomicBool,
) -> Result<(), DispatchError> {
    let started = tokio::time::Instant::now();
    let mut consecutive_errors = 0u32;

    loop {
        if cancelled.load(Ordering::SeqCst) {
            task.cancel();
            tracing::info!(
                task_id = %task.task_id,
                backend = backend.name(),
                "wait ended by local cancellation"
            );
            return Ok(());
        }

        let waited = started.elapsed();
        if waited >= settings.max_wait {
            task.fail("timeout");
            tracing::warn!(
                task_id = %task.task_id,
                backend = backend.name(),
                remote_id = %handle,
                waited_s = waited.as_secs(),
                "max wait exceeded; remote job orphaned"
            );
            return Err(DispatchError::Timeout {
                backend: backend.name().to_string(),
                waited_s: waited.as_secs(),
            });
        }

        match backend.poll(handle).await {
            Ok(snapshot) => {
                consecutive_errors = 0;
                task.apply_snapshot(&snapshot);
                tracing::debug!(
                    task_id = %task.task_id,
                    backend = backend.name(),
                    status = %task.status,
                    progress = task.progress,
                    "polled"
                );
                if task.status.is_terminal() {
                    return Ok(());
                }
            }
            Err(e) => {
                consecutive_errors += 1;
                tracing::warn!(
                    task_id = %task.task_id,
                    backend = backend.name(),
                    error = %e,
                    consecutive_errors,
                    "poll failed"
                );
                if consecutive_errors > settings.max_poll_errors {
                    return Err(e);
                }
            }
        }

        tokio::time::sleep(settings.interval).await;
    }
}

/// Run one complete attempt on a single backend without failover: clamp,
/// validate, submit, then wait.
///
/// # Errors
///
/// Validation and submit errors are returned before any waiting; wait
/// errors as in [`wait_for_completion`]. On `submit` failure the task is
/// marked `Failed` with the error text.
pub async fn generate_on(
    backend: &dyn VideoBackend,
    task: &mut GenerationTask,
) -> Result<(), DispatchError> {
    clamp_task_duration(task, backend.capabilities());
    backend.validate(task)?;
    let handle = match backend.submit(task).await {
        Ok(handle) => handle,
        Err(e) => {
            task.fail(e.to_string());
            return Err(e);
        }
    };
    task.remote_id = Some(handle.as_str().to_string());
    task.backend_used = Some(backend.name().to_string());
    task.transition(TaskStatus::Processing);
    let cancelled = AtomicBool::new(false);
    let waited =
        wait_for_completion(backend, &handle, task, backend.poll_settings(), &cancelled).await;
    backend.release(&handle);
    waited
}

// ============================================================================
// Shared adapter plumbing
// ============================================================================

/// Local record of jobs an adapter has submitted and not yet seen finish.
///
/// Lets adapters answer `cancel` for providers without a remote cancel
/// endpoint, and keeps a locally cancelled job from being reported as
/// running by later polls. Entries leave the book once a poll reports a
/// terminal status; a locally cancelled entry stays until one poll has
/// reported the cancellation.
#[derive(Debug, Default)]
pub struct JobBook {
    jobs: DashMap<String, TaskStatus>,
}

impl JobBook {
    /// Empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly submitted job.
    pub fn record_submitted(&self, handle: &RemoteHandle) {
        self.jobs
            .insert(handle.as_str().to_string(), TaskStatus::Processing);
    }

    /// Record the latest polled status.
    ///
    /// A terminal status removes the job. A local cancellation is never
    /// overwritten.
    pub fn record_status(&self, handle: &RemoteHandle, status: TaskStatus) {
        if status.is_terminal() {
            self.jobs
                .remove_if(handle.as_str(), |_, current| !current.is_terminal());
            return;
        }
        if let Some(mut entry) = self.jobs.get_mut(handle.as_str()) {
            if !entry.is_terminal() {
                *entry = status;
            }
        }
    }

    /// Mark a known, non-terminal job cancelled.
    ///
    /// Returns `true` if the local state changed.
    pub fn mark_cancelled(&self, handle: &RemoteHandle) -> bool {
        match self.jobs.get_mut(handle.as_str()) {
            Some(mut entry) if !entry.is_terminal() => {
                *entry = TaskStatus::Cancelled;
                true
            }
            _ => false,
        }
    }

    /// Consume a local cancellation.
    ///
    /// Returns `true` (and forgets the job) if it was cancelled locally;
    /// the caller reports `Cancelled` for this poll.
    pub fn take_cancelled(&self, handle: &RemoteHandle) -> bool {
        self.jobs
            .remove_if(handle.as_str(), |_, status| *status == TaskStatus::Cancelled)
            .is_some()
    }

    /// Forget a job regardless of its state.
    pub fn forget(&self, handle: &RemoteHandle) {
        self.jobs.remove(handle.as_str());
    }

    /// Number of jobs not yet terminal.
    pub fn active(&self) -> usize {
        self.jobs.iter().filter(|e| !e.value().is_terminal()).count()
    }

    /// Number of jobs still tracked, including cancellations not yet
    /// reported by a poll.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// `true` if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// `true` for empty keys and template placeholders such as
/// `your-runway-api-key-here`.
pub fn is_placeholder_key(key: &str) -> bool {
    let key = key.trim();
    key.is_empty() || (key.starts_with("your-") && key.ends_with("-here"))
}

/// Resolve an API key from an inline value or an environment variable.
///
/// Logs a warning (but does not fail) when the result is missing or a
/// placeholder.
pub fn resolve_api_key(
    backend: &str,
    inline: Option<&str>,
    env_var: Option<&str>,
) -> Option<String> {
    let key = inline
        .map(str::to_string)
        .or_else(|| env_var.and_then(|var| std::env::var(var).ok()));
    match key.as_deref() {
        Some(k) if !is_placeholder_key(k) => key,
        _ => {
            tracing::warn!(
                backend,
                env_var = env_var.unwrap_or(""),
                "API key missing or placeholder; backend will report unhealthy"
            );
            None
        }
    }
}

/// Return the key or a configuration error.
pub(crate) fn require_key<'a>(
    backend: &str,
    key: &'a Option<String>,
) -> Result<&'a str, DispatchError> {
    key.as_deref().ok_or_else(|| {
        DispatchError::Configuration(format!("{backend}: API key missing or placeholder"))
    })
}

/// Map a reqwest error onto [`DispatchError::Transport`].
pub(crate) fn transport_error(backend: &str, err: reqwest::Error) -> DispatchError {
    DispatchError::Transport {
        backend: backend.to_string(),
        message: err.to_string(),
    }
}

/// Turn a non-success response into [`DispatchError::RemoteApi`].
pub(crate) async fn ensure_success(
    backend: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, DispatchError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    Err(DispatchError::RemoteApi {
        backend: backend.to_string(),
        status,
        message,
    })
}

/// Decode a JSON body, mapping decode failures onto
/// [`DispatchError::Transport`].
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    backend: &str,
    response: reqwest::Response,
) -> Result<T, DispatchError> {
    response.json::<T>().await.map_err(|e| DispatchError::Transport {
        backend: backend.to_string(),
        message: format!("failed to parse response: {e}"),
    })
}

/// Map a provider status string through `table`, logging and defaulting
/// to `Pending` for anything unrecognised.
pub(crate) fn map_status(
    backend: &str,
    raw: &str,
    table: fn(&str) -> Option<TaskStatus>,
) -> TaskStatus {
    table(raw).unwrap_or_else(|| {
        tracing::warn!(backend, status = raw, "unrecognised remote status, treating as pending");
        TaskStatus::Pending
    })
}

/// Aspect ratio label for a `WIDTHxHEIGHT` string (`16:9` when unknown).
pub fn aspect_ratio(resolution: &str) -> &'static str {
    match crate::matcher::parse_resolution(resolution) {
        Some((w, h)) if w == h => "1:1",
        Some((w, h)) if w < h => "9:16",
        _ => "16:9",
    }
}

/// Build an adapter from one `[[backends]]` config entry.
///
/// # Errors
///
/// Returns [`DispatchError::Configuration`] only for entries that cannot be
/// turned into an adapter at all; a missing credential still constructs.
///
/// # Panics
///
/// This function never panics.
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn VideoBackend>, DispatchError> {
    let api_key = || {
        resolve_api_key(
            &config.name,
            config.api_key.as_deref(),
            config.api_key_env.as_deref(),
        )
    };
    let timeout = config
        .request_timeout_s
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

    let backend: Arc<dyn VideoBackend> = match config.kind {
        BackendKind::Svd => {
            let mut b = SvdBackend::new(&config.name).with_timeout(timeout);
            if let Some(url) = &config.base_url {
                b = b.with_base_url(url);
            }
            let settings = poll_settings_for(config, b.poll_settings());
            Arc::new(b.with_poll_settings(settings))
        }
        BackendKind::Runway => {
            let mut b = RunwayBackend::new(&config.name, api_key()).with_timeout(timeout);
            if let Some(url) = &config.base_url {
                b = b.with_base_url(url);
            }
            if let Some(model) = &config.model {
                b = b.with_model(model);
            }
            let settings = poll_settings_for(config, b.poll_settings());
            Arc::new(b.with_poll_settings(settings))
        }
        BackendKind::Pika => {
            let mut b = PikaBackend::new(&config.name, api_key()).with_timeout(timeout);
            if let Some(url) = &config.base_url {
                b = b.with_base_url(url);
            }
            if let Some(model) = &config.model {
                b = b.with_model(model);
            }
            let settings = poll_settings_for(config, b.poll_settings());
            Arc::new(b.with_poll_settings(settings))
        }
        BackendKind::Luma => {
            let mut b = LumaBackend::new(&config.name, api_key()).with_timeout(timeout);
            if let Some(url) = &config.base_url {
                b = b.with_base_url(url);
            }
            if let Some(model) = &config.model {
                b = b.with_model(model);
            }
            let settings = poll_settings_for(config, b.poll_settings());
            Arc::new(b.with_poll_settings(settings))
        }
        BackendKind::Mock => {
            let b = MockBackend::new(&config.name);
            let settings = poll_settings_for(config, b.poll_settings());
            Arc::new(b.with_poll_settings(settings))
        }
    };

    tracing::info!(
        backend = %config.name,
        kind = ?config.kind,
        "backend adapter constructed"
    );
    Ok(backend)
}

fn poll_settings_for(config: &BackendConfig, defaults: PollSettings) -> PollSettings {
    PollSettings {
        interval: config
            .poll_interval_s
            .map(Duration::from_secs)
            .unwrap_or(defaults.interval),
        max_wait: config
            .max_wait_s
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_wait),
        max_poll_errors: defaults.max_poll_errors,
    }
}
