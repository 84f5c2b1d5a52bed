//! `video-dispatch`: run a batch of scenes through the configured backends.
//!
//! ```text
//! video-dispatch <config.toml> <scenes.json>
//! ```
//!
//! Prints one JSON result per scene, in input order, to stdout.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG=info`: log level filter
//! - Provider API keys named by `api_key_env` in the config

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_video_orchestrator::{
    config::loader, init_tracing_with_format, metrics, BatchCoordinator, Dispatcher,
    HealthMonitor, Scene,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let (Some(config_path), Some(scenes_path)) = (args.next(), args.next()) else {
        eprintln!("usage: video-dispatch <config.toml> <scenes.json>");
        std::process::exit(2);
    };

    let config = loader::load_from_file(&PathBuf::from(&config_path))?;

    // A subscriber set by an embedding harness is fine.
    let _ = init_tracing_with_format(config.observability.log_format.as_str());
    metrics::init_metrics()?;

    let scenes_text = std::fs::read_to_string(&scenes_path)?;
    let scenes: Vec<Scene> = serde_json::from_str(&scenes_text)?;

    let dispatcher = Arc::new(Dispatcher::from_config(&config)?);
    info!(
        backends = dispatcher.registry().len(),
        scenes = scenes.len(),
        config = %config_path,
        "dispatcher ready"
    );

    #[cfg(feature = "metrics-server")]
    let server = config.observability.metrics_port.map(|port| {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let addr = format!("0.0.0.0:{port}");
            if let Err(e) =
                tokio_video_orchestrator::metrics_server::start_server(&addr, dispatcher).await
            {
                tracing::error!(error = %e, "metrics server stopped");
            }
        })
    });
    #[cfg(not(feature = "metrics-server"))]
    if config.observability.metrics_port.is_some() {
        tracing::warn!("metrics_port set but built without the metrics-server feature");
    }

    let monitor = HealthMonitor::new(
        Arc::clone(dispatcher.registry()),
        Duration::from_secs(config.dispatcher.health_interval_s),
    )
    .with_check_timeout(Duration::from_secs(config.dispatcher.health_check_timeout_s))
    .spawn();

    let coordinator = BatchCoordinator::new(
        Arc::clone(&dispatcher),
        config.dispatcher.max_concurrent_requests,
    );
    let results = coordinator.generate_batch(scenes).await;

    println!("{}", serde_json::to_string_pretty(&results)?);

    monitor.shutdown().await;
    #[cfg(feature = "metrics-server")]
    if let Some(server) = server {
        server.abort();
    }

    let failed = results.iter().filter(|r| !r.success).count();
    info!(total = results.len(), failed, "batch complete - shutting down");
    Ok(())
}
