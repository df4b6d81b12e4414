//! Health and metrics listener.
//!
//! Routes: `/healthz` (component liveness), `/health/dependencies` (live
//! probe of the store), `/metrics` (Prometheus text format). Consumers only
//! read JSON bodies and status codes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::future::BoxFuture;
use serde_json::json;
use tracing::info;

use crate::metrics::PipeMetrics;

/// Async probe of an external dependency: (healthy, detail).
pub type DependencyProbe =
    Arc<dyn Fn() -> BoxFuture<'static, (bool, serde_json::Value)> + Send + Sync>;

#[derive(Clone)]
pub struct ObserveState {
    pub component: &'static str,
    pub pipeline_version: String,
    pub metrics: Arc<PipeMetrics>,
    pub dependency_probe: Option<DependencyProbe>,
}

async fn healthz(State(state): State<ObserveState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "component": state.component,
        "pipeline_version": state.pipeline_version,
    }))
}

async fn health_dependencies(State(state): State<ObserveState>) -> impl IntoResponse {
    match &state.dependency_probe {
        None => (
            StatusCode::OK,
            Json(json!({"ok": true, "detail": "no probe configured"})),
        ),
        Some(probe) => {
            let (ok, detail) = probe().await;
            let status = if ok {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (status, Json(json!({"ok": ok, "detail": detail})))
        }
    }
}

async fn metrics(State(state): State<ObserveState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub fn router(state: ObserveState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/health/dependencies", get(health_dependencies))
        .route("/metrics", get(metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits. Spawn this on its own task.
pub async fn serve(bind: &str, port: u16, state: ObserveState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let component = state.component;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, component, "observability listener started");
    axum::serve(listener, app).await?;
    Ok(())
}
