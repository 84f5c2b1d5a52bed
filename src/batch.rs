//! # Batch coordinator: bounded fan-out over the dispatcher
//!
//! ## Responsibility
//! Turn an ordered list of scenes into generation tasks, run them through
//! the [`Dispatcher`] with a batch-wide concurrency gate, and collect one
//! result per scene in input order.
//!
//! ## Guarantees
//! - Positional: `results[i]` always describes `scenes[i]`
//! - Isolated: a scene that fails (or whose task panics) becomes a failed
//!   entry; the rest of the batch still runs
//! - Bounded: at most `max_concurrent` scenes are in the dispatcher at once,
//!   independent of per-backend caps
//!
//! ## NOT Responsible For
//! - Backend choice or failover (see: `dispatcher`)

use crate::dispatcher::Dispatcher;
use crate::task::{GenerationTask, TaskStatus};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;

fn default_scene_duration() -> u32 {
    5
}

fn default_scene_resolution() -> String {
    "1280x720".to_string()
}

fn default_scene_fps() -> u32 {
    24
}

/// One scene of a batch, as read from a scenes file.
///
/// # Example
///
/// ```json
/// {"prompt": "a paper boat on a rainy street", "duration": 4, "style": "watercolor"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    /// Caller-chosen task id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Visual prompt.
    pub prompt: String,
    /// Clip length in seconds.
    #[serde(default = "default_scene_duration")]
    pub duration: u32,
    /// Output resolution.
    #[serde(default = "default_scene_resolution")]
    pub resolution: String,
    /// Output frame rate.
    #[serde(default = "default_scene_fps")]
    pub fps: u32,
    /// Style modifier appended to the prompt.
    #[serde(default)]
    pub style: Option<String>,
    /// Negative prompt.
    #[serde(default)]
    pub negative_prompt: Option<String>,
    /// Seed.
    #[serde(default)]
    pub seed: Option<i64>,
    /// Reference image for image-to-video.
    #[serde(default)]
    pub input_image: Option<String>,
}

impl Scene {
    /// A scene with default duration, resolution and frame rate.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: None,
            prompt: prompt.into(),
            duration: default_scene_duration(),
            resolution: default_scene_resolution(),
            fps: default_scene_fps(),
            style: None,
            negative_prompt: None,
            seed: None,
            input_image: None,
        }
    }

    /// The generation task for the scene at `index`.
    pub fn to_task(&self, index: usize) -> GenerationTask {
        let id = self
            .id
            .clone()
            .unwrap_or_else(|| format!("scene-{index}-{}", uuid::Uuid::new_v4()));
        let mut task = GenerationTask::new(id, self.prompt.clone())
            .with_duration(self.duration)
            .with_resolution(self.resolution.clone())
            .with_fps(self.fps);
        task.style_modifier = self.style.clone();
        task.negative_prompt = self.negative_prompt.clone();
        task.seed = self.seed;
        task.input_image = self.input_image.clone();
        task.metadata
            .insert("scene_index".to_string(), serde_json::json!(index));
        task
    }
}

/// Outcome of one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Position of the scene in the input.
    pub index: usize,
    /// `true` if a clip was produced.
    pub success: bool,
    /// Output reference on success.
    pub video_path: Option<String>,
    /// Failure reason otherwise.
    pub error: Option<String>,
    /// Backend that produced the terminal status.
    pub backend_used: Option<String>,
    /// Duration actually submitted (after clamping).
    pub duration: u32,
    /// Resolution actually submitted (after adaptation).
    pub resolution: String,
    /// Task id the dispatcher tracked.
    pub task_id: String,
}

impl BatchResult {
    fn from_task(index: usize, task: &GenerationTask) -> Self {
        let success = task.status == TaskStatus::Completed;
        Self {
            index,
            success,
            video_path: if success { task.output_path.clone() } else { None },
            error: if success {
                None
            } else {
                Some(
                    task.error_message
                        .clone()
                        .unwrap_or_else(|| format!("task ended {}", task.status)),
                )
            },
            backend_used: task.backend_used.clone(),
            duration: task.duration,
            resolution: task.resolution.clone(),
            task_id: task.task_id.clone(),
        }
    }

    fn failed(index: usize, task: &GenerationTask, error: String) -> Self {
        Self {
            index,
            success: false,
            video_path: None,
            error: Some(error),
            backend_used: None,
            duration: task.duration,
            resolution: task.resolution.clone(),
            task_id: task.task_id.clone(),
        }
    }
}

/// Runs batches of scenes through a shared dispatcher.
#[derive(Debug, Clone)]
pub struct BatchCoordinator {
    dispatcher: Arc<Dispatcher>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl BatchCoordinator {
    /// Coordinator allowing `max_concurrent` scenes in flight (at least 1).
    pub fn new(dispatcher: Arc<Dispatcher>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            dispatcher,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// The batch-wide in-flight limit.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Generate every scene; `results[i]` corresponds to `scenes[i]`.
    ///
    /// Never fails as a whole: per-scene errors, including a panicking
    /// scene task, become failed entries.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn generate_batch(&self, scenes: Vec<Scene>) -> Vec<BatchResult> {
        tracing::info!(
            scenes = scenes.len(),
            max_concurrent = self.max_concurrent,
            "batch started"
        );

        let mut pending = Vec::with_capacity(scenes.len());
        let mut handles = Vec::with_capacity(scenes.len());
        for (index, scene) in scenes.iter().enumerate() {
            let task = scene.to_task(index);
            pending.push(task.clone());
            let coordinator = self.clone();
            handles.push(tokio::spawn(async move { coordinator.run(index, task).await }));
        }

        let joined = join_all(handles).await;
        let results: Vec<BatchResult> = joined
            .into_iter()
            .zip(pending.iter())
            .enumerate()
            .map(|(index, (outcome, task))| match outcome {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(index, task_id = %task.task_id, error = %e, "scene task aborted");
                    BatchResult::failed(index, task, format!("scene task aborted: {e}"))
                }
            })
            .collect();

        let succeeded = results.iter().filter(|r| r.success).count();
        tracing::info!(
            total = results.len(),
            succeeded,
            failed = results.len() - succeeded,
            "batch finished"
        );
        results
    }

    /// Generate a single scene; the result has index 0.
    pub async fn generate_one(&self, scene: Scene) -> BatchResult {
        self.run(0, scene.to_task(0)).await
    }

    async fn run(&self, index: usize, task: GenerationTask) -> BatchResult {
        let _permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                return BatchResult::failed(index, &task, format!("batch gate closed: {e}"));
            }
        };
        tracing::debug!(index, task_id = %task.task_id, "scene admitted");
        let finished = self.dispatcher.generate(task).await;
        BatchResult::from_task(index, &finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_defaults_from_json() {
        let scene: Scene =
            serde_json::from_str(r#"{"prompt": "a fox"}"#).expect("test: scene parses");
        assert_eq!(scene.duration, 5);
        assert_eq!(scene.resolution, "1280x720");
        assert_eq!(scene.fps, 24);
        assert!(scene.style.is_none());
    }

    #[test]
    fn test_scene_to_task_carries_fields() {
        let mut scene = Scene::new("a fox");
        scene.id = Some("fox-1".into());
        scene.style = Some("cinematic".into());
        scene.input_image = Some("fox.png".into());
        let task = scene.to_task(3);
        assert_eq!(task.task_id, "fox-1");
        assert_eq!(task.full_prompt(), "a fox, cinematic");
        assert!(task.requires_image_input());
        assert_eq!(task.metadata.get("scene_index"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let scene = Scene::new("p");
        assert_ne!(scene.to_task(0).task_id, scene.to_task(0).task_id);
    }

    #[test]
    fn test_result_from_failed_task_has_reason() {
        let mut task = GenerationTask::new("t", "p");
        task.fail("boom");
        let result = BatchResult::from_task(2, &task);
        assert!(!result.success);
        assert_eq!(result.index, 2);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert!(result.video_path.is_none());
    }

    #[test]
    fn test_zero_concurrency_is_raised_to_one() {
        let registry = Arc::new(crate::registry::BackendRegistry::new());
        let coordinator = BatchCoordinator::new(Arc::new(Dispatcher::new(registry)), 0);
        assert_eq!(coordinator.max_concurrent(), 1);
    }
}
