//! Local Stable Video Diffusion server adapter.
//!
//! Talks to a self-hosted SVD inference server:
//! - `POST /generate` → `{ "task_id": ... }`
//! - `GET /status/{id}` → `{ status, progress, output_path, error_message }`
//! - `DELETE /cancel/{id}`
//! - `GET /health` → `{ gpu_info, model_loaded, queue_size }`
//!
//! No credential is required. SVD renders at most 25 frames per job.

use super::{
    ensure_success, map_status, read_json, transport_error, HealthReport, JobBook, PollSettings,
    VideoBackend, DEFAULT_REQUEST_TIMEOUT,
};
use crate::capabilities::BackendCapabilities;
use crate::matcher::parse_resolution;
use crate::task::{GenerationTask, RemoteHandle, TaskSnapshot, TaskStatus};
use crate::DispatchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default server address.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Frame ceiling per job.
pub const MAX_FRAMES: u32 = 25;

#[derive(Debug, Serialize)]
struct SvdRequest {
    prompt: String,
    negative_prompt: String,
    num_frames: u32,
    width: u32,
    height: u32,
    num_inference_steps: u32,
    guidance_scale: f32,
    seed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SvdSubmitResponse {
    task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SvdStatusResponse {
    status: String,
    #[serde(default)]
    progress: Option<f32>,
    #[serde(default)]
    output_path: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SvdHealthResponse {
    #[serde(default)]
    model_loaded: bool,
    #[serde(default)]
    queue_size: u64,
    #[serde(default)]
    gpu_info: serde_json::Value,
}

fn status_table(raw: &str) -> Option<TaskStatus> {
    match raw {
        "pending" => Some(TaskStatus::Pending),
        "processing" => Some(TaskStatus::Processing),
        "completed" => Some(TaskStatus::Completed),
        "failed" => Some(TaskStatus::Failed),
        "cancelled" => Some(TaskStatus::Cancelled),
        _ => None,
    }
}

/// Stable Video Diffusion adapter.
///
/// ## Example
///
/// ```no_run
/// use tokio_video_orchestrator::SvdBackend;
///
/// let svd = SvdBackend::new("svd").with_base_url("http://gpu-box:8000");
/// ```
pub struct SvdBackend {
    name: String,
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    poll: PollSettings,
    caps: BackendCapabilities,
    jobs: JobBook,
}

impl SvdBackend {
    /// Create an adapter pointing at [`DEFAULT_BASE_URL`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            poll: PollSettings::new(Duration::from_secs(5), Duration::from_secs(600)),
            caps: Self::default_capabilities(),
            jobs: JobBook::new(),
        }
    }

    /// Declared capabilities of an SVD server.
    pub fn default_capabilities() -> BackendCapabilities {
        BackendCapabilities {
            name: "Stable Video Diffusion".to_string(),
            supports_text_to_video: true,
            supports_image_to_video: true,
            supports_video_to_video: false,
            max_duration_seconds: 8,
            supported_resolutions: vec![
                "576x1024".to_string(),
                "1024x576".to_string(),
                "768x768".to_string(),
            ],
            supported_fps: vec![6, 12, 24],
            cost_per_second: 0.0,
            requires_gpu: true,
            is_local: true,
        }
    }

    /// Point at a different server.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the per-request HTTP timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override poll interval and maximum wait.
    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl VideoBackend for SvdBackend {
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
    }

    async fn submit(&self, task: &GenerationTask) -> Result<RemoteHandle, DispatchError> {
        let (width, height) = parse_resolution(&task.resolution).ok_or_else(|| {
            DispatchError::Validation(format!("malformed resolution {}", task.resolution))
        })?;

        let request = SvdRequest {
            prompt: task.full_prompt(),
            negative_prompt: task.negative_prompt.clone().unwrap_or_default(),
            num_frames: task.duration.saturating_mul(task.fps).min(MAX_FRAMES),
            width,
            height,
            num_inference_steps: task.inference_steps,
            guidance_scale: task.guidance_scale,
            seed: task.seed.unwrap_or(-1),
            image: task.input_image.clone(),
        };

        let response = self
            .client
            .post(self.url("/generate"))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        let response = ensure_success(&self.name, response).await?;
        let body: SvdSubmitResponse = read_json(&self.name, response).await?;

        let handle = RemoteHandle::new(body.task_id.unwrap_or_else(|| task.task_id.clone()));
        self.jobs.record_submitted(&handle);
        tracing::info!(backend = %self.name, task_id = %task.task_id, remote_id = %handle, "SVD job submitted");
        Ok(handle)
    }

    async fn poll(&self, handle: &RemoteHandle) -> Result<TaskSnapshot, DispatchError> {
        if self.jobs.take_cancelled(handle) {
            return Ok(TaskSnapshot::new(handle.clone(), TaskStatus::Cancelled, 0.0));
        }

        let response = self
            .client
            .get(self.url(&format!("/status/{}", handle)))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        let response = ensure_success(&self.name, response).await?;
        let body: SvdStatusResponse = read_json(&self.name, response).await?;

        let status = map_status(&self.name, &body.status, status_table);
        self.jobs.record_status(handle, status);
        Ok(TaskSnapshot {
            handle: handle.clone(),
            status,
            progress: body.progress.unwrap_or(0.0),
            output_path: body.output_path,
            error_message: body.error_message,
        })
    }

    async fn cancel(&self, handle: &RemoteHandle) -> Result<bool, DispatchError> {
        let response = self
            .client
            .delete(self.url(&format!("/cancel/{}", handle)))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        ensure_success(&self.name, response).await?;
        self.jobs.mark_cancelled(handle);
        Ok(true)
    }

    async fn health_check(&self) -> HealthReport {
        let response = match self
            .client
            .get(self.url("/health"))
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return HealthReport::unhealthy(e.to_string()),
        };
        if !response.status().is_success() {
            return HealthReport::unhealthy(format!("HTTP {}", response.status().as_u16()));
        }
        match response.json::<SvdHealthResponse>().await {
            Ok(body) => HealthReport::healthy(format!(
                "model_loaded={} queue_size={} gpu_info={}",
                body.model_loaded, body.queue_size, body.gpu_info
            )),
            Err(e) => HealthReport::unhealthy(format!("unreadable health body: {e}")),
        }
    }
}
