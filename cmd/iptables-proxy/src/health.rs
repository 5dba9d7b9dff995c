//! `/healthz` and `/metrics`.

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use pkg_metrics::MetricsRegistry;
use pkg_proxy::health::HealthState;

#[derive(Clone)]
struct HealthServerState {
    health: Arc<HealthState>,
    metrics: Arc<MetricsRegistry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthzBody {
    last_updated: Option<String>,
    current_time: String,
}

/// GET /healthz: 200 while syncs keep up, 503 once a queued update is overdue.
async fn healthz(State(state): State<HealthServerState>) -> impl IntoResponse {
    let now = Utc::now();
    let body = HealthzBody {
        last_updated: state.health.last_updated().map(|t| t.to_rfc3339()),
        current_time: now.to_rfc3339(),
    };
    let status = if state.health.is_healthy_at(now) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// GET /metrics in Prometheus text format.
async fn metrics(State(state): State<HealthServerState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

fn router(health: Arc<HealthState>, metrics_registry: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(HealthServerState {
            health,
            metrics: metrics_registry,
        })
}

pub async fn serve(
    addr: SocketAddr,
    health: Arc<HealthState>,
    metrics_registry: Arc<MetricsRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(health, metrics_registry);
    info!("Starting health server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}
