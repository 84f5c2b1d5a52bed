//! Pika Labs hosted API adapter.
//!
//! - `POST /generate` → `{ "id": ... }`
//! - `GET /generate/{id}` → `{ status, progress, video_url, error }`
//! - `DELETE /generate/{id}`
//! - `GET /status` as the liveness probe
//!
//! Pika takes an aspect ratio rather than explicit dimensions.

use super::{
    aspect_ratio, ensure_success, map_status, read_json, require_key, transport_error,
    HealthReport, JobBook, PollSettings, VideoBackend, DEFAULT_REQUEST_TIMEOUT,
};
use crate::capabilities::BackendCapabilities;
use crate::task::{GenerationTask, RemoteHandle, TaskSnapshot, TaskStatus, DEFAULT_GUIDANCE_SCALE};
use crate::DispatchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://api.pika.art/v1";
/// Default model.
pub const DEFAULT_MODEL: &str = "pika-1.0";

#[derive(Debug, Serialize)]
struct PikaRequest {
    model: String,
    prompt: String,
    duration: u32,
    aspect_ratio: &'static str,
    fps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    guidance_scale: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PikaSubmitResponse {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PikaStatusResponse {
    #[serde(default = "default_status")]
    status: String,
    #[serde(default)]
    progress: Option<f32>,
    #[serde(default)]
    video_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn default_status() -> String {
    "pending".to_string()
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

/// Pika Labs adapter.
pub struct PikaBackend {
    name: String,
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    timeout: Duration,
    poll: PollSettings,
    caps: BackendCapabilities,
    jobs: JobBook,
}

impl PikaBackend {
    /// Create an adapter with the given (possibly absent) key.
    pub fn new(name: impl Into<String>, api_key: Option<String>) -> Self {
        let name = name.into();
        let api_key = api_key.filter(|k| !super::is_placeholder_key(k));
        if api_key.is_none() {
            tracing::warn!(backend = %name, "Pika API key not configured");
        }
        Self {
            name,
            client: reqwest::Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            poll: PollSettings::new(Duration::from_secs(5), Duration::from_secs(300)),
            caps: Self::default_capabilities(),
            jobs: JobBook::new(),
        }
    }

    /// Declared capabilities of the Pika API.
    pub fn default_capabilities() -> BackendCapabilities {
        BackendCapabilities {
            name: "Pika Labs".to_string(),
            supports_text_to_video: true,
            supports_image_to_video: true,
            supports_video_to_video: false,
            max_duration_seconds: 4,
            supported_resolutions: vec![
                "1024x576".to_string(),
                "576x1024".to_string(),
                "1024x1024".to_string(),
            ],
            supported_fps: vec![24],
            cost_per_second: 0.35,
            requires_gpu: false,
            is_local: false,
        }
    }

    /// Point at a different API root.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Use a different model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
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
impl VideoBackend for PikaBackend {
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
        let key = require_key(&self.name, &self.api_key)?;
        let request = PikaRequest {
            model: self.model.clone(),
            prompt: task.full_prompt(),
            duration: task.duration,
            aspect_ratio: aspect_ratio(&task.resolution),
            fps: task.fps,
            negative_prompt: task.negative_prompt.clone(),
            guidance_scale: ((task.guidance_scale - DEFAULT_GUIDANCE_SCALE).abs() > f32::EPSILON)
                .then_some(task.guidance_scale),
            seed: task.seed,
            image: task.input_image.clone(),
        };

        let response = self
            .client
            .post(self.url("/generate"))
            .bearer_auth(key)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        let response = ensure_success(&self.name, response).await?;
        let body: PikaSubmitResponse = read_json(&self.name, response).await?;

        let handle = RemoteHandle::new(body.id.unwrap_or_else(|| task.task_id.clone()));
        self.jobs.record_submitted(&handle);
        tracing::info!(backend = %self.name, task_id = %task.task_id, remote_id = %handle, "Pika job submitted");
        Ok(handle)
    }

    async fn poll(&self, handle: &RemoteHandle) -> Result<TaskSnapshot, DispatchError> {
        if self.jobs.take_cancelled(handle) {
            return Ok(TaskSnapshot::new(handle.clone(), TaskStatus::Cancelled, 0.0));
        }
        let key = require_key(&self.name, &self.api_key)?;

        let response = self
            .client
            .get(self.url(&format!("/generate/{}", handle)))
            .bearer_auth(key)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        let response = ensure_success(&self.name, response).await?;
        let body: PikaStatusResponse = read_json(&self.name, response).await?;

        let status = map_status(&self.name, &body.status, status_table);
        self.jobs.record_status(handle, status);

        let mut snapshot = TaskSnapshot::new(handle.clone(), status, 0.0);
        match status {
            TaskStatus::Completed => {
                snapshot.progress = 100.0;
                snapshot.output_path = body.video_url;
            }
            TaskStatus::Processing => snapshot.progress = body.progress.unwrap_or(50.0),
            TaskStatus::Failed => {
                snapshot.error_message =
                    Some(body.error.unwrap_or_else(|| "unknown error".to_string()));
            }
            _ => snapshot.progress = body.progress.unwrap_or(0.0),
        }
        Ok(snapshot)
    }

    async fn cancel(&self, handle: &RemoteHandle) -> Result<bool, DispatchError> {
        let key = require_key(&self.name, &self.api_key)?;
        let response = self
            .client
            .delete(self.url(&format!("/generate/{}", handle)))
            .bearer_auth(key)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        ensure_success(&self.name, response).await?;
        self.jobs.mark_cancelled(handle);
        Ok(true)
    }

    async fn health_check(&self) -> HealthReport {
        let Some(key) = self.api_key.as_deref() else {
            return HealthReport::unhealthy("API key not configured");
        };
        match self
            .client
            .get(self.url("/status"))
            .bearer_auth(key)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => {
                HealthReport::healthy(format!("model={} api={}", self.model, self.base_url))
            }
            Ok(r) => HealthReport::unhealthy(format!("HTTP {}", r.status().as_u16())),
            Err(e) => HealthReport::unhealthy(e.to_string()),
        }
    }
}
