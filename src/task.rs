//! # Task model: one video generation request and its lifecycle
//!
//! ## Responsibility
//! Define [`GenerationTask`], its [`TaskStatus`] state machine, and the
//! provider-neutral poll result [`TaskSnapshot`] that adapters return.
//!
//! ## Guarantees
//! - Monotonic: within one attempt a task only moves
//!   `Pending → Processing → {Completed | Failed | Cancelled}`
//! - Stable identity: `task_id` is the caller's id and never changes;
//!   the provider-assigned id lives in `remote_id`
//! - Serializable: round-trips through serde for status surfaces
//!
//! ## NOT Responsible For
//! - Choosing a backend (see: `selector`)
//! - Adapting parameters to a backend (see: `matcher`)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Default clip length (seconds) for a bare task.
pub const DEFAULT_DURATION_S: u32 = 4;
/// Default output resolution for a bare task.
pub const DEFAULT_RESOLUTION: &str = "1280x720";
/// Default frame rate for a bare task.
pub const DEFAULT_FPS: u32 = 24;
/// Default classifier-free guidance scale.
pub const DEFAULT_GUIDANCE_SCALE: f32 = 7.5;
/// Default number of diffusion steps.
pub const DEFAULT_INFERENCE_STEPS: u32 = 25;

/// Lifecycle status of a generation task.
///
/// # Panics
///
/// No methods on this type panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet accepted by a provider.
    Pending,
    /// Accepted by a provider and being rendered.
    Processing,
    /// Finished with a usable artifact.
    Completed,
    /// Finished without an artifact.
    Failed,
    /// Stopped at the caller's request.
    Cancelled,
}

impl TaskStatus {
    /// Returns `true` for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    /// Returns `true` if moving from `self` to `next` keeps the lifecycle
    /// monotonic. Terminal states accept no further transitions; repeating
    /// `Processing` is allowed so progress updates can flow.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Provider-assigned identifier for a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteHandle(pub String);

impl RemoteHandle {
    /// Wrap a provider id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw provider id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a single status check against a provider, already mapped onto
/// the shared [`TaskStatus`] vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// The job this snapshot describes.
    pub handle: RemoteHandle,
    /// Mapped status.
    pub status: TaskStatus,
    /// Progress in percent, `0.0..=100.0`.
    pub progress: f32,
    /// Output reference (URL or path), present once completed.
    pub output_path: Option<String>,
    /// Provider-reported failure reason.
    pub error_message: Option<String>,
}

impl TaskSnapshot {
    /// A snapshot with only a status and progress set.
    pub fn new(handle: RemoteHandle, status: TaskStatus, progress: f32) -> Self {
        Self {
            handle,
            status,
            progress,
            output_path: None,
            error_message: None,
        }
    }
}

/// One request to turn a prompt (plus optional parameters) into a clip.
///
/// # Example
///
/// ```rust
/// use tokio_video_orchestrator::task::{GenerationTask, TaskStatus};
/// let task = GenerationTask::new("scene-1", "a red fox in snow")
///     .with_duration(6)
///     .with_resolution("1920x1080");
/// assert_eq!(task.status, TaskStatus::Pending);
/// assert_eq!(task.duration, 6);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationTask {
    /// Caller-visible identity. Never rewritten by adapters.
    pub task_id: String,
    /// Main text prompt.
    pub prompt: String,
    /// Things the provider should avoid rendering.
    pub negative_prompt: Option<String>,
    /// Requested clip length in seconds.
    pub duration: u32,
    /// Output resolution as `WIDTHxHEIGHT`.
    pub resolution: String,
    /// Output frame rate.
    pub fps: u32,
    /// Style text appended to the prompt.
    pub style_modifier: Option<String>,
    /// Random seed; `None` lets the provider choose.
    pub seed: Option<i64>,
    /// Classifier-free guidance scale.
    pub guidance_scale: f32,
    /// Number of diffusion steps.
    pub inference_steps: u32,
    /// Reference image for image-to-video.
    pub input_image: Option<String>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Progress in percent.
    pub progress: f32,
    /// Human-readable failure reason.
    pub error_message: Option<String>,
    /// Output reference once completed.
    pub output_path: Option<String>,
    /// Registry name of the backend that produced the terminal state.
    pub backend_used: Option<String>,
    /// Provider-assigned job id for the current attempt.
    pub remote_id: Option<String>,
    /// Open key/value annotations.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl GenerationTask {
    /// Create a pending task with default generation parameters.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn new(task_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            prompt: prompt.into(),
            negative_prompt: None,
            duration: DEFAULT_DURATION_S,
            resolution: DEFAULT_RESOLUTION.to_string(),
            fps: DEFAULT_FPS,
            style_modifier: None,
            seed: None,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            inference_steps: DEFAULT_INFERENCE_STEPS,
            input_image: None,
            status: TaskStatus::Pending,
            progress: 0.0,
            error_message: None,
            output_path: None,
            backend_used: None,
            remote_id: None,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a pending task with a fresh UUID v4 id.
    pub fn with_generated_id(prompt: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), prompt)
    }

    /// Set the clip length in seconds.
    pub fn with_duration(mut self, duration: u32) -> Self {
        self.duration = duration;
        self
    }

    /// Set the output resolution (`WIDTHxHEIGHT`).
    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = resolution.into();
        self
    }

    /// Set the frame rate.
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Attach a reference image, turning this into an image-to-video task.
    pub fn with_input_image(mut self, image: impl Into<String>) -> Self {
        self.input_image = Some(image.into());
        self
    }

    /// Set the style modifier.
    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style_modifier = Some(style.into());
        self
    }

    /// Set the negative prompt.
    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative.into());
        self
    }

    /// Set the seed.
    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// `true` if the task carries a reference image.
    pub fn requires_image_input(&self) -> bool {
        self.input_image.is_some()
    }

    /// Prompt as sent to providers: the base prompt followed by the style
    /// modifier, joined with `", "`.
    pub fn full_prompt(&self) -> String {
        match self.style_modifier.as_deref() {
            Some(style) if !style.trim().is_empty() => format!("{}, {}", self.prompt, style),
            _ => self.prompt.clone(),
        }
    }

    /// Move to `next` if the lifecycle allows it.
    ///
    /// Returns `false` (and leaves the task untouched) for a backwards or
    /// post-terminal transition.
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if self.status == next && !next.is_terminal() {
            return true;
        }
        if !self.status.can_transition_to(next) {
            tracing::debug!(
                task_id = %self.task_id,
                from = %self.status,
                to = %next,
                "ignoring non-monotonic status transition"
            );
            return false;
        }
        self.status = next;
        self.touch();
        true
    }

    /// Terminal success with an output reference.
    pub fn complete(&mut self, output_path: Option<String>) {
        if self.transition(TaskStatus::Completed) {
            self.progress = 100.0;
            self.output_path = output_path;
            self.error_message = None;
        }
    }

    /// Terminal failure with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.transition(TaskStatus::Failed) {
            self.error_message = Some(reason.into());
        }
    }

    /// Terminal cancellation.
    pub fn cancel(&mut self) -> bool {
        self.transition(TaskStatus::Cancelled)
    }

    /// Fold a provider snapshot into this task.
    pub fn apply_snapshot(&mut self, snapshot: &TaskSnapshot) {
        if !self.transition(snapshot.status) {
            return;
        }
        self.progress = snapshot.progress.clamp(0.0, 100.0);
        match snapshot.status {
            TaskStatus::Completed => {
                self.progress = 100.0;
                self.output_path = snapshot.output_path.clone();
            }
            TaskStatus::Failed => {
                self.error_message = Some(
                    snapshot
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                );
            }
            _ => {}
        }
    }

    /// Reset attempt-scoped state before (re)trying on a backend.
    ///
    /// Keeps `task_id`, parameters and metadata; bumps the `attempts`
    /// counter in metadata.
    pub fn reset_for_attempt(&mut self) {
        self.status = TaskStatus::Pending;
        self.progress = 0.0;
        self.error_message = None;
        self.output_path = None;
        self.remote_id = None;
        self.backend_used = None;
        let attempts = self
            .metadata
            .get("attempts")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        self.metadata
            .insert("attempts".to_string(), serde_json::json!(attempts + 1));
        self.touch();
    }

    /// Force the task into `Failed` regardless of its current state.
    ///
    /// Used when a dispatch chain ends without any backend accepting the
    /// task; the attempt-level monotonicity does not apply across chains.
    pub fn force_fail(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error_message = Some(reason.into());
        self.touch();
    }

    /// Cancel between attempts, replacing an earlier attempt's failure.
    pub fn force_cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.output_path = None;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_uses_defaults() {
        let task = GenerationTask::new("t1", "prompt");
        assert_eq!(task.duration, DEFAULT_DURATION_S);
        assert_eq!(task.resolution, "1280x720");
        assert_eq!(task.fps, 24);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.metadata.is_empty());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = GenerationTask::with_generated_id("x");
        let b = GenerationTask::with_generated_id("x");
        assert_ne!(a.task_id, b.task_id);
    }

    #[test]
    fn test_full_prompt_appends_style() {
        let task = GenerationTask::new("t", "a cat").with_style("watercolor");
        assert_eq!(task.full_prompt(), "a cat, watercolor");
    }

    #[test]
    fn test_full_prompt_ignores_blank_style() {
        let task = GenerationTask::new("t", "a cat").with_style("   ");
        assert_eq!(task.full_prompt(), "a cat");
    }

    #[test]
    fn test_transition_forward_is_allowed() {
        let mut task = GenerationTask::new("t", "p");
        assert!(task.transition(TaskStatus::Processing));
        assert!(task.transition(TaskStatus::Completed));
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_transition_backwards_is_rejected() {
        let mut task = GenerationTask::new("t", "p");
        task.transition(TaskStatus::Processing);
        assert!(!task.transition(TaskStatus::Pending));
        assert_eq!(task.status, TaskStatus::Processing);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let mut task = GenerationTask::new("t", "p");
        task.fail("boom");
        assert!(!task.transition(TaskStatus::Processing));
        task.complete(Some("out.mp4".into()));
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("boom"));
        assert!(task.output_path.is_none());
    }

    #[test]
    fn test_apply_snapshot_completed_sets_output_and_progress() {
        let mut task = GenerationTask::new("t", "p");
        let mut snap = TaskSnapshot::new(RemoteHandle::new("r1"), TaskStatus::Completed, 80.0);
        snap.output_path = Some("https://cdn/video.mp4".into());
        task.apply_snapshot(&snap);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100.0);
        assert_eq!(task.output_path.as_deref(), Some("https://cdn/video.mp4"));
    }

    #[test]
    fn test_apply_snapshot_failed_without_reason_uses_placeholder() {
        let mut task = GenerationTask::new("t", "p");
        let snap = TaskSnapshot::new(RemoteHandle::new("r1"), TaskStatus::Failed, 0.0);
        task.apply_snapshot(&snap);
        assert_eq!(task.error_message.as_deref(), Some("unknown error"));
    }

    #[test]
    fn test_apply_snapshot_clamps_progress() {
        let mut task = GenerationTask::new("t", "p");
        let snap = TaskSnapshot::new(RemoteHandle::new("r1"), TaskStatus::Processing, 250.0);
        task.apply_snapshot(&snap);
        assert_eq!(task.progress, 100.0);
    }

    #[test]
    fn test_reset_for_attempt_keeps_id_and_counts_attempts() {
        let mut task = GenerationTask::new("caller-id", "p");
        task.reset_for_attempt();
        task.remote_id = Some("remote-1".into());
        task.fail("transport");
        task.reset_for_attempt();
        assert_eq!(task.task_id, "caller-id");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.remote_id.is_none());
        assert!(task.error_message.is_none());
        assert_eq!(task.metadata.get("attempts"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_status_display_is_lowercase() {
        assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(TaskStatus::Processing.to_string(), "processing");
    }

    #[test]
    fn test_status_serializes_to_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Completed).expect("test: serialize");
        assert_eq!(json, "\"completed\"");
    }
}
