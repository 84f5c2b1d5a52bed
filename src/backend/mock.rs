//! Scriptable in-process backend.
//!
//! Used by the `mock` backend kind and by tests that need deterministic
//! provider behaviour (transport failures, slow jobs, flipping health)
//! without a network.

use super::{HealthReport, JobBook, PollSettings, VideoBackend};
use crate::capabilities::BackendCapabilities;
use crate::task::{GenerationTask, RemoteHandle, TaskSnapshot, TaskStatus};
use crate::DispatchError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// What the mock does with each request.
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Report `Processing` for `n - 1` polls, then `Completed`.
    SucceedAfterPolls(u32),
    /// `submit` fails with a transport error.
    SubmitTransportError,
    /// `submit` fails with a remote API error carrying this status.
    SubmitRemoteError(u16),
    /// The job is accepted, then the provider reports `Failed`.
    ReportFailed(String),
    /// The job is accepted and stays `Processing` forever.
    NeverComplete,
    /// The job is accepted; every poll fails with a transport error.
    PollTransportError,
}

/// In-process [`VideoBackend`] with scripted behaviour and counters.
///
/// ## Example
///
/// ```rust
/// use tokio_video_orchestrator::backend::{MockBackend, MockBehavior};
///
/// let flaky = MockBackend::new("primary").with_behavior(MockBehavior::SubmitTransportError);
/// flaky.set_healthy(false);
/// ```
pub struct MockBackend {
    name: String,
    caps: BackendCapabilities,
    poll: PollSettings,
    behavior: Mutex<MockBehavior>,
    healthy: AtomicBool,
    submit_delay: Duration,
    seq: AtomicU64,
    submits: AtomicU64,
    polls: AtomicU64,
    health_checks: AtomicU64,
    poll_counts: DashMap<String, u32>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    jobs: JobBook,
}

impl MockBackend {
    /// A healthy mock that completes on the first poll.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            caps: Self::default_capabilities(&name),
            name,
            poll: PollSettings::new(Duration::from_millis(1), Duration::from_secs(5)),
            behavior: Mutex::new(MockBehavior::SucceedAfterPolls(1)),
            healthy: AtomicBool::new(true),
            submit_delay: Duration::ZERO,
            seq: AtomicU64::new(0),
            submits: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            health_checks: AtomicU64::new(0),
            poll_counts: DashMap::new(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            jobs: JobBook::new(),
        }
    }

    /// Broad capabilities: every common resolution, 24 and 30 fps, 10s.
    pub fn default_capabilities(name: &str) -> BackendCapabilities {
        BackendCapabilities {
            name: format!("Mock ({name})"),
            supports_text_to_video: true,
            supports_image_to_video: true,
            supports_video_to_video: false,
            max_duration_seconds: 10,
            supported_resolutions: [
                "1920x1080",
                "1280x720",
                "1024x576",
                "720x1280",
                "576x1024",
                "1024x1024",
                "768x768",
            ]
            .iter()
            .map(|r| r.to_string())
            .collect(),
            supported_fps: vec![24, 30],
            cost_per_second: 0.0,
            requires_gpu: false,
            is_local: true,
        }
    }

    /// Replace the declared capabilities.
    pub fn with_capabilities(mut self, caps: BackendCapabilities) -> Self {
        self.caps = caps;
        self
    }

    /// Set the scripted behaviour.
    pub fn with_behavior(self, behavior: MockBehavior) -> Self {
        *self.behavior.lock() = behavior;
        self
    }

    /// Override poll interval and maximum wait.
    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// Sleep this long inside every `submit`.
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    /// Change the scripted behaviour at runtime.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Set what the next health checks report.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of `submit` calls so far.
    pub fn submit_count(&self) -> u64 {
        self.submits.load(Ordering::SeqCst)
    }

    /// Number of `poll` calls so far.
    pub fn poll_count(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }

    /// Number of `health_check` calls so far.
    pub fn health_check_count(&self) -> u64 {
        self.health_checks.load(Ordering::SeqCst)
    }

    /// Highest number of jobs that were between submit and a terminal
    /// poll at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Jobs this mock still holds state for.
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.len().max(self.poll_counts.len())
    }

    fn finish(&self, handle: &RemoteHandle) {
        if self.poll_counts.remove(handle.as_str()).is_some() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl VideoBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.caps
    }

    fn poll_settings(&self) -> PollSettings {
        self.poll
    }

    fn release(&self, handle: &RemoteHandle) {
        self.jobs.forget(handle);
        self.finish(handle);
    }

    async fn submit(&self, task: &GenerationTask) -> Result<RemoteHandle, DispatchError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        let behavior = self.behavior.lock().clone();
        match behavior {
            MockBehavior::SubmitTransportError => {
                return Err(DispatchError::Transport {
                    backend: self.name.clone(),
                    message: "connection refused".to_string(),
                })
            }
            MockBehavior::SubmitRemoteError(status) => {
                return Err(DispatchError::RemoteApi {
                    backend: self.name.clone(),
                    status,
                    message: "scripted failure".to_string(),
                })
            }
            _ => {}
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let handle = RemoteHandle::new(format!("{}-{}", self.name, seq));
        self.poll_counts.insert(handle.as_str().to_string(), 0);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.jobs.record_submitted(&handle);
        tracing::debug!(backend = %self.name, task_id = %task.task_id, remote_id = %handle, "mock job accepted");
        Ok(handle)
    }

    async fn poll(&self, handle: &RemoteHandle) -> Result<TaskSnapshot, DispatchError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.jobs.take_cancelled(handle) {
            self.finish(handle);
            return Ok(TaskSnapshot::new(handle.clone(), TaskStatus::Cancelled, 0.0));
        }

        let count = match self.poll_counts.get_mut(handle.as_str()) {
            Some(mut entry) => {
                *entry += 1;
                *entry
            }
            None => {
                return Err(DispatchError::RemoteApi {
                    backend: self.name.clone(),
                    status: 404,
                    message: format!("unknown job {handle}"),
                })
            }
        };

        let behavior = self.behavior.lock().clone();
        let snapshot = match behavior {
            MockBehavior::SucceedAfterPolls(n) if count >= n.max(1) => {
                let mut s = TaskSnapshot::new(handle.clone(), TaskStatus::Completed, 100.0);
                s.output_path = Some(format!("mock://{}/{}.mp4", self.name, handle));
                s
            }
            MockBehavior::SucceedAfterPolls(n) => TaskSnapshot::new(
                handle.clone(),
                TaskStatus::Processing,
                (count as f32 / n.max(1) as f32) * 100.0,
            ),
            MockBehavior::ReportFailed(reason) => {
                let mut s = TaskSnapshot::new(handle.clone(), TaskStatus::Failed, 0.0);
                s.error_message = Some(reason);
                s
            }
            MockBehavior::PollTransportError => {
                return Err(DispatchError::Transport {
                    backend: self.name.clone(),
                    message: "poll connection reset".to_string(),
                })
            }
            MockBehavior::NeverComplete
            | MockBehavior::SubmitTransportError
            | MockBehavior::SubmitRemoteError(_) => {
                TaskSnapshot::new(handle.clone(), TaskStatus::Processing, 10.0)
            }
        };

        self.jobs.record_status(handle, snapshot.status);
        if snapshot.status.is_terminal() {
            self.finish(handle);
        }
        Ok(snapshot)
    }

    async fn cancel(&self, handle: &RemoteHandle) -> Result<bool, DispatchError> {
        Ok(self.jobs.mark_cancelled(handle))
    }

    async fn health_check(&self) -> HealthReport {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            HealthReport::healthy("mock ok")
        } else {
            HealthReport::unhealthy("mock scripted unhealthy")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_succeeds_after_scripted_polls() {
        let mock = MockBackend::new("m").with_behavior(MockBehavior::SucceedAfterPolls(3));
        let task = GenerationTask::new("t", "p");
        let handle = mock.submit(&task).await.expect("test: submit");
        assert_eq!(
            mock.poll(&handle).await.expect("test: poll").status,
            TaskStatus::Processing
        );
        assert_eq!(
            mock.poll(&handle).await.expect("test: poll").status,
            TaskStatus::Processing
        );
        let last = mock.poll(&handle).await.expect("test: poll");
        assert_eq!(last.status, TaskStatus::Completed);
        assert!(last.output_path.is_some());
        assert_eq!(mock.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_submit_transport_error() {
        let mock = MockBackend::new("m").with_behavior(MockBehavior::SubmitTransportError);
        let err = mock
            .submit(&GenerationTask::new("t", "p"))
            .await
            .expect_err("test: must fail");
        assert!(err.is_backend_failure());
        assert_eq!(mock.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_health_flag_is_reported() {
        let mock = MockBackend::new("m");
        assert!(mock.health_check().await.healthy);
        mock.set_healthy(false);
        assert!(!mock.health_check().await.healthy);
        assert_eq!(mock.health_check_count(), 2);
    }

    #[tokio::test]
    async fn test_set_behavior_applies_to_next_submit() {
        let mock = MockBackend::new("m").with_behavior(MockBehavior::SubmitTransportError);
        let task = GenerationTask::new("t", "p");
        assert!(mock.submit(&task).await.is_err());

        mock.set_behavior(MockBehavior::SucceedAfterPolls(1));
        let handle = mock.submit(&task).await.expect("test: submit");
        let snap = mock.poll(&handle).await.expect("test: poll");
        assert_eq!(snap.status, TaskStatus::Completed);
        assert_eq!(mock.tracked_jobs(), 0);
    }

    #[tokio::test]
    async fn test_poll_unknown_job_is_remote_error() {
        let mock = MockBackend::new("m");
        let err = mock
            .poll(&RemoteHandle::new("nope"))
            .await
            .expect_err("test: unknown job");
        assert!(matches!(err, DispatchError::RemoteApi { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_cancel_makes_poll_report_cancelled() {
        let mock = MockBackend::new("m").with_behavior(MockBehavior::NeverComplete);
        let handle = mock
            .submit(&GenerationTask::new("t", "p"))
            .await
            .expect("test: submit");
        assert!(mock.cancel(&handle).await.expect("test: cancel"));
        let snap = mock.poll(&handle).await.expect("test: poll");
        assert_eq!(snap.status, TaskStatus::Cancelled);
        assert_eq!(mock.tracked_jobs(), 0);
    }
}
