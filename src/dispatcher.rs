//! # Dispatcher: select, reserve, invoke, fail over
//!
//! ## Responsibility
//! Run one [`GenerationTask`] to a terminal status: ask the selector for a
//! backend, reserve a quota slot, apply the capability adaptation, submit
//! and wait, and on a backend failure mark that backend unhealthy and try
//! the next one. Also answers status, cancellation, listing and health
//! queries against the same registry.
//!
//! ## Guarantees
//! - Terminating: every attempt adds its backend to the exclusion set, so a
//!   chain makes at most N attempts for N registered backends
//! - Leak-free: the quota reservation is a guard dropped at the end of the
//!   attempt, whatever the outcome
//! - Non-throwing: `generate` always returns the task in a terminal status;
//!   errors become `Failed` with a readable reason
//! - Bounded: at most `finished_capacity` finished tasks are kept for
//!   `get_status`; older ones are evicted first
//! - One in-flight task per `task_id`: a second `generate` with an id that
//!   is still running fails immediately
//!
//! ## NOT Responsible For
//! - Probing health in the background (see: `health`)
//! - Bounding batch-wide concurrency (see: `batch`)

use crate::backend::{self, VideoBackend};
use crate::capabilities::BackendCapabilities;
use crate::config::VideoConfig;
use crate::matcher::Adaptation;
use crate::metrics;
use crate::registry::{BackendId, BackendRegistry, Priority};
use crate::selector;
use crate::task::{GenerationTask, RemoteHandle, TaskStatus};
use crate::DispatchError;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Metadata keys holding pre-adaptation values.
const REQUESTED_RESOLUTION: &str = "requested_resolution";
const REQUESTED_FPS: &str = "requested_fps";
const REQUESTED_DURATION: &str = "requested_duration";
const ESTIMATED_COST: &str = "estimated_cost";

/// Finished tasks kept for `get_status` unless configured otherwise.
pub const DEFAULT_FINISHED_CAPACITY: usize = 1024;

/// One row of [`Dispatcher::list_backends`].
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    /// Registry name.
    pub name: String,
    /// Whether the selector may use it.
    pub enabled: bool,
    /// Last known health.
    pub healthy: bool,
    /// In-flight tasks right now.
    pub active_tasks: usize,
    /// Concurrency cap.
    pub max_tasks: usize,
    /// Selection tier.
    pub priority: Priority,
    /// Declared capabilities.
    pub capabilities: BackendCapabilities,
}

/// Aggregate health across all backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    /// Every backend is healthy.
    Healthy,
    /// Some, but not all, backends are unhealthy.
    Degraded,
    /// Every backend is unhealthy, or none is registered.
    Unhealthy,
}

impl fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health of one backend inside a [`HealthSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    /// Registry name.
    pub name: String,
    /// Current health flag.
    pub healthy: bool,
    /// Whether the backend is enabled.
    pub enabled: bool,
    /// In-flight tasks right now.
    pub active_tasks: usize,
    /// Detail text from the last probe, if one has run.
    pub detail: Option<String>,
    /// When the last probe finished.
    pub checked_at: Option<DateTime<Utc>>,
}

/// Point-in-time health of the whole dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Aggregate status.
    pub overall: OverallHealth,
    /// Per-backend detail in registration order.
    pub per_backend: Vec<BackendHealth>,
}

/// Counters returned by [`Dispatcher::statistics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Registered backends.
    pub total_backends: usize,
    /// Backends whose health flag is set.
    pub healthy_backends: usize,
    /// Sum of in-flight tasks across backends.
    pub total_active_tasks: usize,
    /// Whether failover is on.
    pub fallback_enabled: bool,
}

/// Dispatcher-side record of a task it has seen.
#[derive(Debug)]
struct TaskEntry {
    seq: u64,
    backend: Option<BackendId>,
    handle: Option<RemoteHandle>,
    task: GenerationTask,
    cancelled: Arc<AtomicBool>,
}

/// How one attempt ended.
enum AttemptOutcome {
    /// The task reached a terminal status on this backend.
    Finished,
    /// The backend failed; try another one.
    BackendFailed(DispatchError),
    /// The adapted task was rejected before any remote call.
    Rejected(DispatchError),
    /// The attempt ended with an error that does not warrant failover.
    Abandoned(DispatchError),
}

/// Multi-backend dispatcher.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tokio_video_orchestrator::{BackendRegistry, Dispatcher, GenerationTask, MockBackend, Priority};
///
/// # async fn example() -> Result<(), tokio_video_orchestrator::DispatchError> {
/// let mut registry = BackendRegistry::new();
/// registry.register("local", Priority::Primary, true, 2, Arc::new(MockBackend::new("local")))?;
/// let dispatcher = Dispatcher::new(Arc::new(registry));
/// let task = dispatcher.generate(GenerationTask::new("scene-1", "a lighthouse at dusk")).await;
/// println!("{} via {:?}", task.status, task.backend_used);
/// # Ok(()) }
/// ```
pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    fallback_enabled: bool,
    max_poll_errors: Option<u32>,
    tasks: DashMap<String, TaskEntry>,
    finished: Mutex<VecDeque<(String, u64)>>,
    finished_capacity: usize,
    next_seq: AtomicU64,
}

impl Dispatcher {
    /// Dispatcher over `registry` with failover on and provider poll-error
    /// tolerances.
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            fallback_enabled: true,
            max_poll_errors: None,
            tasks: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            finished_capacity: DEFAULT_FINISHED_CAPACITY,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Keep at most `capacity` finished tasks (minimum 1) for `get_status`.
    pub fn with_finished_capacity(mut self, capacity: usize) -> Self {
        self.finished_capacity = capacity.max(1);
        self
    }

    /// Turn failover on or off.
    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    /// Override every backend's consecutive poll-error tolerance.
    pub fn with_max_poll_errors(mut self, max: u32) -> Self {
        self.max_poll_errors = Some(max);
        self
    }

    /// Build adapters and the registry from a validated config.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] if an adapter cannot be
    /// built or a registration is rejected.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn from_config(config: &VideoConfig) -> Result<Self, DispatchError> {
        let mut registry = BackendRegistry::new();
        for entry in &config.backends {
            let adapter = backend::build_backend(entry)?;
            registry.register(
                entry.name.clone(),
                entry.priority,
                entry.enabled,
                entry.max_concurrent,
                adapter,
            )?;
        }
        Ok(Self::new(Arc::new(registry))
            .with_fallback(config.dispatcher.fallback_enabled)
            .with_max_poll_errors(config.dispatcher.max_poll_errors)
            .with_finished_capacity(config.dispatcher.finished_task_capacity))
    }

    /// The shared registry (for the health monitor and status surfaces).
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Whether failover is on.
    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled
    }

    /// Tasks currently known to `get_status` and `cancel`, in flight or
    /// finished.
    pub fn tracked_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Run `task` to a terminal status, failing over between backends.
    ///
    /// The returned task keeps the caller's `task_id`. On success
    /// `backend_used` names the backend that produced the result; when no
    /// backend could take the task the status is `Failed` with an error
    /// starting `"no backend available"`. If another task with the same
    /// `task_id` is still running, the task fails at once with a
    /// validation error and the running one is left alone.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn generate(&self, mut task: GenerationTask) -> GenerationTask {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let fresh = TaskEntry {
            seq,
            backend: None,
            handle: None,
            task: task.clone(),
            cancelled: Arc::clone(&cancelled),
        };
        match self.tasks.entry(task.task_id.clone()) {
            Entry::Occupied(running) if !running.get().task.status.is_terminal() => {
                drop(running);
                let err = DispatchError::Validation(format!(
                    "task id {} is already in flight",
                    task.task_id
                ));
                tracing::warn!(task_id = %task.task_id, "duplicate task id rejected");
                metrics::record_outcome("none", err.kind());
                task.force_fail(err.to_string());
                return task;
            }
            Entry::Occupied(mut previous) => {
                previous.insert(fresh);
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
            }
        }

        let requested = task.clone();
        let mut tried: HashSet<BackendId> = HashSet::new();
        let mut last_error: Option<DispatchError> = None;

        loop {
            if cancelled.load(Ordering::SeqCst) {
                tracing::info!(
                    task_id = %task.task_id,
                    tried = tried.len(),
                    "cancelled before next attempt"
                );
                metrics::record_outcome("none", &TaskStatus::Cancelled.to_string());
                task.force_cancel();
                break;
            }

            let selection = match selector::select(&self.registry, &requested, &tried) {
                Ok(selection) => selection,
                Err(none) => {
                    let reason = match &last_error {
                        Some(e) => format!("{}; last error: {e}", none.describe()),
                        None => none.describe(),
                    };
                    let err = DispatchError::NoBackendAvailable(reason);
                    tracing::warn!(
                        task_id = %task.task_id,
                        tried = tried.len(),
                        error = %err,
                        "dispatch exhausted"
                    );
                    metrics::record_outcome("none", err.kind());
                    task.force_fail(err.to_string());
                    break;
                }
            };

            tried.insert(selection.backend);
            let Some(slot) = self.registry.get(selection.backend) else {
                continue;
            };
            let Some(_guard) = slot.try_reserve() else {
                tracing::debug!(
                    task_id = %task.task_id,
                    backend = slot.name(),
                    "backend filled up before reservation, skipping"
                );
                continue;
            };

            task.reset_for_attempt();
            record_adaptation(&mut task, &requested, &selection.adaptation);
            selection.adaptation.apply(&mut task);
            let adapter = Arc::clone(slot.adapter());
            task.metadata.insert(
                ESTIMATED_COST.to_string(),
                serde_json::json!(adapter.capabilities().estimate_cost(task.duration)),
            );

            tracing::info!(
                task_id = %task.task_id,
                backend = slot.name(),
                priority = %slot.priority(),
                attempt = tried.len(),
                resolution = %task.resolution,
                fps = task.fps,
                duration = task.duration,
                "dispatching"
            );

            let started = Instant::now();
            let outcome = self
                .attempt(selection.backend, slot.name(), &adapter, &mut task, &cancelled)
                .await;
            metrics::record_generation_duration(slot.name(), started.elapsed());

            match outcome {
                AttemptOutcome::Finished => {
                    metrics::record_outcome(slot.name(), &task.status.to_string());
                    tracing::info!(
                        task_id = %task.task_id,
                        backend = slot.name(),
                        status = %task.status,
                        "generation finished"
                    );
                    break;
                }
                AttemptOutcome::BackendFailed(err) => {
                    metrics::record_outcome(slot.name(), err.kind());
                    if slot.set_healthy(false) {
                        tracing::warn!(
                            backend = slot.name(),
                            error = %err,
                            "backend marked unhealthy after failure"
                        );
                    }
                    task.fail(err.to_string());
                    if !self.fallback_enabled {
                        tracing::warn!(
                            task_id = %task.task_id,
                            backend = slot.name(),
                            "failover disabled, giving up"
                        );
                        break;
                    }
                    metrics::inc_failover(slot.name());
                    tracing::warn!(
                        task_id = %task.task_id,
                        backend = slot.name(),
                        error = %err,
                        "failing over"
                    );
                    last_error = Some(err);
                }
                AttemptOutcome::Rejected(err) => {
                    metrics::record_outcome(slot.name(), err.kind());
                    tracing::warn!(
                        task_id = %task.task_id,
                        backend = slot.name(),
                        error = %err,
                        "adapted task rejected, trying next backend"
                    );
                    last_error = Some(err);
                }
                AttemptOutcome::Abandoned(err) => {
                    metrics::record_outcome(slot.name(), err.kind());
                    if !task.status.is_terminal() {
                        task.fail(err.to_string());
                    }
                    break;
                }
            }
        }

        self.retire(&task, seq);
        task
    }

    /// Store the finished task and evict the oldest finished entries
    /// beyond capacity.
    fn retire(&self, task: &GenerationTask, seq: u64) {
        match self.tasks.get_mut(&task.task_id) {
            Some(mut entry) if entry.seq == seq => {
                entry.task = task.clone();
                entry.handle = None;
            }
            _ => return,
        }

        let evicted: Vec<(String, u64)> = {
            let mut finished = self.finished.lock();
            finished.push_back((task.task_id.clone(), seq));
            let excess = finished.len().saturating_sub(self.finished_capacity);
            finished.drain(..excess).collect()
        };
        for (task_id, seq) in evicted {
            self.tasks
                .remove_if(&task_id, |_, e| e.seq == seq && e.task.status.is_terminal());
        }
    }

    /// One submit-and-wait on a reserved backend.
    async fn attempt(
        &self,
        id: BackendId,
        name: &str,
        adapter: &Arc<dyn VideoBackend>,
        task: &mut GenerationTask,
        cancelled: &AtomicBool,
    ) -> AttemptOutcome {
        if let Err(e) = adapter.validate(task) {
            return AttemptOutcome::Rejected(e);
        }

        let handle = match adapter.submit(task).await {
            Ok(handle) => handle,
            Err(e) if e.is_backend_failure() => return AttemptOutcome::BackendFailed(e),
            Err(e) => return AttemptOutcome::Abandoned(e),
        };

        task.remote_id = Some(handle.as_str().to_string());
        task.backend_used = Some(name.to_string());
        task.transition(TaskStatus::Processing);
        if let Some(mut entry) = self.tasks.get_mut(&task.task_id) {
            entry.backend = Some(id);
            entry.handle = Some(handle.clone());
            entry.task = task.clone();
        }

        let mut settings = adapter.poll_settings();
        if let Some(max) = self.max_poll_errors {
            settings.max_poll_errors = max;
        }

        let waited =
            backend::wait_for_completion(adapter.as_ref(), &handle, task, settings, cancelled)
                .await;

        if task.status == TaskStatus::Cancelled && cancelled.load(Ordering::SeqCst) {
            if let Err(e) = adapter.cancel(&handle).await {
                tracing::warn!(
                    task_id = %task.task_id,
                    backend = name,
                    error = %e,
                    "remote cancel failed; local state is cancelled"
                );
            }
        }
        adapter.release(&handle);

        match waited {
            Ok(()) => AttemptOutcome::Finished,
            Err(e) if e.is_backend_failure() => AttemptOutcome::BackendFailed(e),
            Err(e) => AttemptOutcome::Abandoned(e),
        }
    }

    /// Current view of a task.
    ///
    /// Known tasks that are finished are returned as stored; in-flight ones
    /// are refreshed with one poll. Unknown ids are treated as provider job
    /// ids and looked up on `backend` (or every backend in turn).
    ///
    /// # Returns
    /// - `Some(task)`: the task is known here or to a provider
    /// - `None`: nobody recognises the id
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn get_status(&self, task_id: &str, backend: Option<&str>) -> Option<GenerationTask> {
        let known = self
            .tasks
            .get(task_id)
            .map(|e| (e.task.clone(), e.backend, e.handle.clone()));

        if let Some((mut task, id, handle)) = known {
            if task.status.is_terminal() {
                return Some(task);
            }
            let (Some(id), Some(handle)) = (id, handle) else {
                return Some(task);
            };
            let Some(slot) = self.registry.get(id) else {
                return Some(task);
            };
            match slot.adapter().poll(&handle).await {
                Ok(snapshot) => task.apply_snapshot(&snapshot),
                Err(e) => tracing::warn!(
                    task_id,
                    backend = slot.name(),
                    error = %e,
                    "status refresh failed, returning last known state"
                ),
            }
            return Some(task);
        }

        let handle = RemoteHandle::new(task_id);
        for (_, slot) in self.registry.iter() {
            if backend.is_some_and(|b| b != slot.name()) {
                continue;
            }
            match slot.adapter().poll(&handle).await {
                Ok(snapshot) => {
                    let mut task = GenerationTask::new(task_id, "");
                    task.remote_id = Some(task_id.to_string());
                    task.backend_used = Some(slot.name().to_string());
                    task.apply_snapshot(&snapshot);
                    return Some(task);
                }
                Err(e) => tracing::debug!(
                    task_id,
                    backend = slot.name(),
                    error = %e,
                    "backend does not know this job"
                ),
            }
        }
        None
    }

    /// Cancel a task.
    ///
    /// For a task this dispatcher is still waiting on, raises the local
    /// cancellation flag (the wait loop ends the attempt as `Cancelled`)
    /// and asks the provider to cancel. Unknown ids are treated as provider
    /// job ids.
    ///
    /// # Returns
    /// `true` if the task is, or will shortly be, cancelled. Provider
    /// errors are logged and yield `false` for unknown ids.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn cancel(&self, task_id: &str, backend: Option<&str>) -> bool {
        let known = self.tasks.get(task_id).map(|e| {
            (
                e.task.status.is_terminal(),
                e.backend,
                e.handle.clone(),
                Arc::clone(&e.cancelled),
            )
        });

        if let Some((finished, id, handle, flag)) = known {
            if finished {
                tracing::debug!(task_id, "cancel ignored, task already finished");
                return false;
            }
            flag.store(true, Ordering::SeqCst);
            tracing::info!(task_id, "local cancellation requested");
            if let (Some(slot), Some(handle)) = (id.and_then(|id| self.registry.get(id)), handle)
            {
                if let Err(e) = slot.adapter().cancel(&handle).await {
                    tracing::warn!(
                        task_id,
                        backend = slot.name(),
                        error = %e,
                        "remote cancel failed; local state is cancelled"
                    );
                }
            }
            return true;
        }

        let handle = RemoteHandle::new(task_id);
        for (_, slot) in self.registry.iter() {
            if backend.is_some_and(|b| b != slot.name()) {
                continue;
            }
            match slot.adapter().cancel(&handle).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    task_id,
                    backend = slot.name(),
                    error = %e,
                    "remote cancel failed"
                ),
            }
        }
        false
    }

    /// Enable or disable a backend by name.
    ///
    /// Returns `false` if no backend has that name.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.registry.by_name(name) {
            Some(slot) => {
                slot.set_enabled(enabled);
                tracing::info!(backend = name, enabled, "backend enabled flag changed");
                true
            }
            None => false,
        }
    }

    /// Every registered backend with its live state, in registration order.
    pub fn list_backends(&self) -> Vec<BackendInfo> {
        self.registry
            .iter()
            .map(|(_, slot)| BackendInfo {
                name: slot.name().to_string(),
                enabled: slot.is_enabled(),
                healthy: slot.is_healthy(),
                active_tasks: slot.active(),
                max_tasks: slot.max_concurrent(),
                priority: slot.priority(),
                capabilities: slot.adapter().capabilities().clone(),
            })
            .collect()
    }

    /// Aggregate and per-backend health.
    ///
    /// `unhealthy` when every backend is unhealthy (or none is registered),
    /// `degraded` when only some are, `healthy` otherwise.
    pub fn health_snapshot(&self) -> HealthSnapshot {
        let per_backend: Vec<BackendHealth> = self
            .registry
            .iter()
            .map(|(_, slot)| {
                let last = slot.last_health();
                BackendHealth {
                    name: slot.name().to_string(),
                    healthy: slot.is_healthy(),
                    enabled: slot.is_enabled(),
                    active_tasks: slot.active(),
                    detail: last.as_ref().map(|h| h.detail.clone()),
                    checked_at: last.map(|h| h.checked_at),
                }
            })
            .collect();

        let healthy = per_backend.iter().filter(|b| b.healthy).count();
        let overall = if healthy == 0 {
            OverallHealth::Unhealthy
        } else if healthy < per_backend.len() {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        };

        HealthSnapshot {
            overall,
            per_backend,
        }
    }

    /// Registry-wide counters.
    pub fn statistics(&self) -> DispatcherStats {
        let mut stats = DispatcherStats {
            total_backends: self.registry.len(),
            healthy_backends: 0,
            total_active_tasks: 0,
            fallback_enabled: self.fallback_enabled,
        };
        for (_, slot) in self.registry.iter() {
            if slot.is_healthy() {
                stats.healthy_backends += 1;
            }
            stats.total_active_tasks += slot.active();
        }
        stats
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("fallback_enabled", &self.fallback_enabled)
            .field("tracked_tasks", &self.tasks.len())
            .finish()
    }
}

/// Store the requested value of every field the adaptation changes, and
/// drop keys left over from an earlier attempt that changed something else.
fn record_adaptation(task: &mut GenerationTask, requested: &GenerationTask, adaptation: &Adaptation) {
    for key in [REQUESTED_RESOLUTION, REQUESTED_FPS, REQUESTED_DURATION] {
        task.metadata.remove(key);
    }
    if !adaptation.changes(requested) {
        return;
    }
    if adaptation.resolution != requested.resolution {
        task.metadata.insert(
            REQUESTED_RESOLUTION.to_string(),
            serde_json::json!(requested.resolution),
        );
    }
    if adaptation.fps != requested.fps {
        task.metadata
            .insert(REQUESTED_FPS.to_string(), serde_json::json!(requested.fps));
    }
    if adaptation.duration != requested.duration {
        tracing::warn!(
            task_id = %task.task_id,
            requested = requested.duration,
            clamped = adaptation.duration,
            "duration exceeds backend maximum, clamping"
        );
        task.metadata.insert(
            REQUESTED_DURATION.to_string(),
            serde_json::json!(requested.duration),
        );
    }
    tracing::info!(
        task_id = %task.task_id,
        resolution = %adaptation.resolution,
        fps = adaptation.fps,
        duration = adaptation.duration,
        "task parameters adapted"
    );
}
