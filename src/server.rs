//! Web server module for the exporter.
//!
//! Serves the metric exposition, the device diagnostics and a liveness check.

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

use crate::collector::{DeviceRegistry, DeviceSummary};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub metrics: Registry,
    pub devices: Arc<DeviceRegistry>,
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

/// Diagnostics response.
#[derive(Serialize)]
struct DebugResponse {
    devices: Vec<DeviceSummary>,
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/debug", get(debug_handler))
        .route("/healthz", get(healthz_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .with_state(app_state)
}

/// Liveness check.
async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Text exposition of every registered metric.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();

    match encoder.encode(&state.metrics.gather(), &mut body) {
        Ok(()) => ([(header::CONTENT_TYPE, encoder.format_type())], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response()
        }
    }
}

/// Snapshot of the device registry.
async fn debug_handler(State(state): State<Arc<AppState>>) -> Json<DebugResponse> {
    Json(DebugResponse {
        devices: state.devices.devices_info().await,
    })
}
