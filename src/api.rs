//! Read-only HTTP status surface.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::system::{HealthLevel, ReplySystem};

#[derive(Clone)]
pub struct AppState {
    pub system: Arc<ReplySystem>,
    /// `None` when no recorder is installed (tests); `/metrics` is then 404.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(system: Arc<ReplySystem>) -> Self {
        Self {
            system,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/sources", get(sources))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.system.health().await;
    let code = if report.level == HealthLevel::Critical {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.system.status().await)
}

async fn sources(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.system.aggregator().sources_by_priority().await)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(h) => (StatusCode::OK, h.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()),
    }
}
