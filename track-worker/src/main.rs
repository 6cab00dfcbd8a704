//! Process entrypoint: constructs the three capability ports as explicit
//! owned collaborators (no globals), wires them into a `TrackProcessor`
//! behind a `JobQueue`, and serves a `/health` endpoint.
//!
//! The ingestion HTTP surface that accepts raw samples and calls
//! `queue.enqueue(rawSampleId)` is out of scope here; this binary only
//! proves the worker pool runs and can be polled for liveness.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use serde_json::json;
use tracing::{info, warn};

use track_core::mapmatch::{FakeMapMatcher, MapMatcher, OsrmClient};
use track_core::{Config, InMemoryStore, JobQueue, KalmanSmoother, QueueConfig, TrackProcessor};

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn build_matcher(config: &Config) -> Arc<dyn MapMatcher> {
    match &config.osrm_base_url {
        Some(base_url) => Arc::new(OsrmClient::new(base_url.clone(), config.osrm_request_timeout)),
        None => {
            warn!("OSRM_BASE_URL not set, map-matching will always fall back to kalman");
            Arc::new(FakeMapMatcher::unreachable())
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "track_worker=info,track_core=info".into()),
        )
        .init();

    info!("track-worker v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    let store = Arc::new(InMemoryStore::new());
    let matcher = build_matcher(&config);
    let kalman = Arc::new(KalmanSmoother::new(track_core::KalmanParams {
        q: config.kalman_q,
        r: config.kalman_r,
    }));

    let processor = Arc::new(TrackProcessor::new(
        store.clone(),
        matcher.clone(),
        kalman.clone(),
        config.clone(),
    ));

    let queue_config = QueueConfig {
        concurrency: config.worker_concurrency,
        rate_limit: config.queue_rate_limit,
        ..QueueConfig::default()
    };
    let queue = JobQueue::new(processor, queue_config);

    let health_port = std::env::var("HEALTH_PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("0.0.0.0:{health_port}");
    let app = Router::new().route("/health", get(health_check));

    info!("health endpoint listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(queue))
        .await
        .unwrap();
}

async fn shutdown_signal(queue: JobQueue) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining job queue");
    queue.drain().await;
    info!("job queue drained, exiting");
}
