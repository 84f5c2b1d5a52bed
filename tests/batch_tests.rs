//! Integration tests for batch generation.
//!
//! These tests verify:
//! - Results are positional regardless of completion order
//! - One failing scene never aborts the batch
//! - The batch-wide gate bounds in-flight work below per-backend caps
//! - Scenes sharing an id never run as two live tasks

use std::sync::Arc;
use std::time::Duration;
use tokio_video_orchestrator::backend::MockBehavior;
use tokio_video_orchestrator::{
    BackendRegistry, BatchCoordinator, Dispatcher, MockBackend, Priority, Scene,
};

fn coordinator(mock: Arc<MockBackend>, cap: usize, gate: usize) -> BatchCoordinator {
    let mut registry = BackendRegistry::new();
    registry
        .register("mock", Priority::Primary, true, cap, mock)
        .expect("test: register");
    BatchCoordinator::new(Arc::new(Dispatcher::new(Arc::new(registry))), gate)
}

fn scenes(n: usize) -> Vec<Scene> {
    (0..n)
        .map(|i| {
            let mut scene = Scene::new(format!("scene number {i}"));
            scene.id = Some(format!("s{i}"));
            scene
        })
        .collect()
}

#[tokio::test]
async fn test_results_preserve_input_order() {
    let mock = Arc::new(
        MockBackend::new("mock")
            .with_behavior(MockBehavior::SucceedAfterPolls(3))
            .with_submit_delay(Duration::from_millis(3)),
    );
    let batch = coordinator(mock, 4, 4);

    let results = batch.generate_batch(scenes(8)).await;

    assert_eq!(results.len(), 8);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.index, i);
        assert_eq!(result.task_id, format!("s{i}"));
        assert!(result.success, "scene {i}: {:?}", result.error);
        assert!(result.video_path.is_some());
        assert_eq!(result.backend_used.as_deref(), Some("mock"));
    }
}

#[tokio::test]
async fn test_failed_scene_does_not_abort_batch() {
    let mock = Arc::new(MockBackend::new("mock"));
    let batch = coordinator(mock, 2, 1);

    let mut input = scenes(3);
    // 640x480 has no equivalent in the mock's resolution set.
    input[1].resolution = "640x480".to_string();

    let results = batch.generate_batch(input).await;

    assert_eq!(results.len(), 3);
    assert!(results[0].success);
    assert!(!results[1].success);
    assert!(results[1]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("no backend available")));
    assert!(results[2].success);
}

#[tokio::test]
async fn test_gate_bounds_in_flight_below_backend_cap() {
    let mock = Arc::new(
        MockBackend::new("mock")
            .with_behavior(MockBehavior::SucceedAfterPolls(5))
            .with_submit_delay(Duration::from_millis(2)),
    );
    let batch = coordinator(Arc::clone(&mock), 8, 2);

    let results = batch.generate_batch(scenes(10)).await;

    assert!(results.iter().all(|r| r.success));
    assert!(mock.max_in_flight() <= 2, "peak {}", mock.max_in_flight());
    assert_eq!(mock.submit_count(), 10);
}

#[tokio::test]
async fn test_generate_one_clamps_and_reports_submitted_values() {
    let mut caps = MockBackend::default_capabilities("mock");
    caps.max_duration_seconds = 4;
    let batch = coordinator(
        Arc::new(MockBackend::new("mock").with_capabilities(caps)),
        1,
        1,
    );

    let mut scene = Scene::new("one shot");
    scene.duration = 9;
    let result = batch.generate_one(scene).await;

    assert_eq!(result.index, 0);
    assert!(result.success);
    assert_eq!(result.duration, 4);
    assert_eq!(result.resolution, "1280x720");
}

#[tokio::test]
async fn test_empty_batch_returns_empty_results() {
    let batch = coordinator(Arc::new(MockBackend::new("mock")), 1, 1);
    assert!(batch.generate_batch(Vec::new()).await.is_empty());
}

#[tokio::test]
async fn test_duplicate_scene_ids_run_once() {
    let mock = Arc::new(
        MockBackend::new("mock")
            .with_behavior(MockBehavior::SucceedAfterPolls(3))
            .with_submit_delay(Duration::from_millis(20)),
    );
    let batch = coordinator(Arc::clone(&mock), 4, 2);

    let mut input = scenes(2);
    input[1].id = Some("s0".to_string());

    let results = batch.generate_batch(input).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results.iter().filter(|r| r.success).count(), 1);
    let rejected = results
        .iter()
        .find(|r| !r.success)
        .expect("test: one scene rejected");
    assert!(rejected
        .error
        .as_deref()
        .is_some_and(|e| e.contains("already in flight")));
    assert_eq!(mock.submit_count(), 1);
}
