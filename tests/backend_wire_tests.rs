//! Wire-level tests for the provider adapters against a local mock server.
//!
//! These tests verify, per provider:
//! - Submit request shape and handle extraction
//! - Status vocabulary mapping and output extraction
//! - Non-2xx responses surface as `RemoteApi` errors (no retry)
//! - Health probes, including missing credentials
//! - Providers without remote cancel only touch local state

use std::time::Duration;
use tokio_video_orchestrator::backend::{generate_on, PollSettings};
use tokio_video_orchestrator::{
    DispatchError, GenerationTask, LumaBackend, PikaBackend, RemoteHandle, RunwayBackend,
    SvdBackend, TaskStatus, VideoBackend,
};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ── Helper functions ──────────────────────────────────────────────

fn fast_poll() -> PollSettings {
    PollSettings::new(Duration::from_millis(5), Duration::from_secs(5))
}

fn task() -> GenerationTask {
    GenerationTask::new("scene-1", "a red fox in snow")
        .with_resolution("1024x576")
        .with_duration(4)
        .with_style("cinematic")
}

// ── SVD ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_svd_submit_sends_frames_and_dimensions() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .and(body_partial_json(serde_json::json!({
            "prompt": "a red fox in snow, cinematic",
            "num_frames": 25,
            "width": 1024,
            "height": 576,
            "seed": -1
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"task_id": "svd-42"})))
        .expect(1)
        .mount(&server)
        .await;

    let svd = SvdBackend::new("svd").with_base_url(server.uri());
    let handle = svd.submit(&task()).await.expect("test: submit");
    assert_eq!(handle.as_str(), "svd-42");
}

#[tokio::test]
async fn test_svd_full_generation_completes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"task_id": "svd-1"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status/svd-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "completed",
            "progress": 100.0,
            "output_path": "/outputs/svd-1.mp4"
        })))
        .mount(&server)
        .await;

    let svd = SvdBackend::new("svd")
        .with_base_url(server.uri())
        .with_poll_settings(fast_poll());
    let mut t = task();
    generate_on(&svd, &mut t).await.expect("test: generation");
    assert_eq!(t.status, TaskStatus::Completed);
    assert_eq!(t.output_path.as_deref(), Some("/outputs/svd-1.mp4"));
    assert_eq!(t.remote_id.as_deref(), Some("svd-1"));
    assert_eq!(t.task_id, "scene-1");
}

#[tokio::test]
async fn test_svd_non_2xx_is_remote_api_error_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("CUDA out of memory"))
        .expect(1)
        .mount(&server)
        .await;

    let svd = SvdBackend::new("svd").with_base_url(server.uri());
    match svd.submit(&task()).await {
        Err(DispatchError::RemoteApi {
            status, message, ..
        }) => {
            assert_eq!(status, 500);
            assert!(message.contains("CUDA"));
        }
        other => panic!("expected RemoteApi, got {other:?}"),
    }
}

#[tokio::test]
async fn test_svd_health_reports_model_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "model_loaded": true,
            "queue_size": 2
        })))
        .mount(&server)
        .await;

    let svd = SvdBackend::new("svd").with_base_url(server.uri());
    let report = svd.health_check().await;
    assert!(report.healthy);
    assert!(report.detail.contains("queue_size=2"));
}

#[tokio::test]
async fn test_svd_unreachable_server_is_transport_error() {
    // Port 9 (discard) is closed on test hosts.
    let svd = SvdBackend::new("svd")
        .with_base_url("http://127.0.0.1:9")
        .with_timeout(Duration::from_secs(2));
    let err = svd.submit(&task()).await.expect_err("test: must fail");
    assert!(matches!(err, DispatchError::Transport { .. }));
    assert!(!svd.health_check().await.healthy);
}

// ── Runway ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_runway_submit_uses_bearer_and_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generations"))
        .and(header("authorization", "Bearer rw-test"))
        .and(body_partial_json(serde_json::json!({
            "model": "gen3a_turbo",
            "duration": 4,
            "resolution": "1024x576"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "rw-9"})))
        .expect(1)
        .mount(&server)
        .await;

    let runway = RunwayBackend::new("runway", Some("rw-test".into())).with_base_url(server.uri());
    let handle = runway.submit(&task()).await.expect("test: submit");
    assert_eq!(handle.as_str(), "rw-9");
}

#[tokio::test]
async fn test_runway_poll_maps_completed_output_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/generations/rw-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "completed",
            "output": {"url": "https://cdn.example/rw-9.mp4"}
        })))
        .mount(&server)
        .await;

    let runway = RunwayBackend::new("runway", Some("rw-test".into())).with_base_url(server.uri());
    let snapshot = runway
        .poll(&RemoteHandle::new("rw-9"))
        .await
        .expect("test: poll");
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.progress, 100.0);
    assert_eq!(
        snapshot.output_path.as_deref(),
        Some("https://cdn.example/rw-9.mp4")
    );
}

#[tokio::test]
async fn test_runway_without_key_fails_submit_and_health() {
    let runway = RunwayBackend::new("runway", None).with_base_url("http://127.0.0.1:9");
    let err = runway.submit(&task()).await.expect_err("test: must fail");
    assert!(matches!(err, DispatchError::Configuration(_)));
    assert!(err.is_backend_failure());
    assert!(!runway.health_check().await.healthy);
}

#[tokio::test]
async fn test_runway_health_uses_models_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let runway = RunwayBackend::new("runway", Some("bad".into())).with_base_url(server.uri());
    let report = runway.health_check().await;
    assert!(!report.healthy);
    assert!(report.detail.contains("401"));
}

// ── Pika ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pika_submit_sends_aspect_ratio() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .and(body_partial_json(serde_json::json!({
            "aspect_ratio": "9:16",
            "model": "pika-1.0"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "pk-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let pika = PikaBackend::new("pika", Some("pk-test".into())).with_base_url(server.uri());
    let handle = pika
        .submit(&task().with_resolution("576x1024"))
        .await
        .expect("test: submit");
    assert_eq!(handle.as_str(), "pk-1");
}

#[tokio::test]
async fn test_pika_poll_maps_failure_reason() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/generate/pk-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "failed",
            "error": "content policy"
        })))
        .mount(&server)
        .await;

    let pika = PikaBackend::new("pika", Some("pk-test".into())).with_base_url(server.uri());
    let snapshot = pika
        .poll(&RemoteHandle::new("pk-1"))
        .await
        .expect("test: poll");
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.error_message.as_deref(), Some("content policy"));
}

#[tokio::test]
async fn test_pika_unknown_status_is_pending() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/generate/pk-2"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "warming_up"})),
        )
        .mount(&server)
        .await;

    let pika = PikaBackend::new("pika", Some("pk-test".into())).with_base_url(server.uri());
    let snapshot = pika
        .poll(&RemoteHandle::new("pk-2"))
        .await
        .expect("test: poll");
    assert_eq!(snapshot.status, TaskStatus::Pending);
}

// ── Luma ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_luma_poll_maps_dreaming_and_assets() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/generations/lu-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "state": "dreaming"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/generations/lu-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "state": "completed",
            "assets": {"video": "https://luma.example/lu-2.mp4"}
        })))
        .mount(&server)
        .await;

    let luma = LumaBackend::new("luma", Some("lu-test".into())).with_base_url(server.uri());
    let dreaming = luma
        .poll(&RemoteHandle::new("lu-1"))
        .await
        .expect("test: poll");
    assert_eq!(dreaming.status, TaskStatus::Processing);
    let done = luma
        .poll(&RemoteHandle::new("lu-2"))
        .await
        .expect("test: poll");
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(
        done.output_path.as_deref(),
        Some("https://luma.example/lu-2.mp4")
    );
}

#[tokio::test]
async fn test_luma_cancel_is_local_only() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generations"))
        .and(body_partial_json(serde_json::json!({"loop": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "lu-3"})))
        .mount(&server)
        .await;

    let luma = LumaBackend::new("luma", Some("lu-test".into())).with_base_url(server.uri());
    let handle = luma.submit(&task()).await.expect("test: submit");

    assert!(luma.cancel(&handle).await.expect("test: cancel"));
    assert!(
        !luma.cancel(&handle).await.expect("test: cancel"),
        "second cancel changes nothing"
    );
    // Polls after a local cancel never hit the server.
    let snapshot = luma.poll(&handle).await.expect("test: poll");
    assert_eq!(snapshot.status, TaskStatus::Cancelled);
    assert!(!luma
        .cancel(&RemoteHandle::new("never-submitted"))
        .await
        .expect("test: cancel"));
}

#[tokio::test]
async fn test_luma_health_uses_user_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .and(header("authorization", "Bearer lu-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "u1"})))
        .mount(&server)
        .await;

    let luma = LumaBackend::new("luma", Some("lu-test".into()))
        .with_base_url(server.uri())
        .with_model("ray-2");
    let report = luma.health_check().await;
    assert!(report.healthy);
    assert!(report.detail.contains("model=ray-2"), "{}", report.detail);
}
