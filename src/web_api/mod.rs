//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - HTTP API routes
//! - Request validation
//! - Response formatting

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let camera = state.camera.status().await;
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds().max(0) as u64;

    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: uptime,
        camera_initialized: camera.initialized,
        hls_active: state.hls.is_active().await,
    };

    Json(response)
}

/// Status endpoint (device common)
pub async fn device_status(State(_state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "device_type": "fluidic-gateway",
        "firmware_version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}
