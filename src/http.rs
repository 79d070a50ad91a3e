//! Operational HTTP surface: health and metrics.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::health::health_handler;
use crate::Gateway;

pub fn create_router(state: Arc<Gateway>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

/// `GET /metrics` in Prometheus text exposition format.
async fn handle_metrics(State(state): State<Arc<Gateway>>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry) {
        Ok(()) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        )
            .into_response(),
    }
}
