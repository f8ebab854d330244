//! API Routes

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::broadcaster;
use crate::error::{Error, Result};
use crate::frame_source::CameraProfile;
use crate::models::{
    ApiResponse, CameraConfigRequest, CameraStatusResponse, HlsStatusResponse,
    PumpCommandRequest, PumpCommandResponse, SyringeCommandRequest, SyringeCommandResponse,
    TelemetryResponse,
};
use crate::peristaltic::TelemetryKind;
use crate::state::AppState;
use crate::syringe::{self, SyringeCommand};

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/healthz", get(super::health_check))
        .route("/api/status", get(super::device_status))
        // Camera
        .route("/video_feed", get(video_feed))
        .route("/api/snapshot", get(snapshot))
        .route("/api/camera/status", get(camera_status))
        .route("/api/camera/config", get(get_camera_config))
        .route("/api/camera/config", put(update_camera_config))
        .route("/api/camera/restart", post(restart_camera))
        // HLS
        .route("/api/hls/start", post(start_hls))
        .route("/api/hls/stop", post(stop_hls))
        .route("/api/hls/status", get(hls_status))
        .route("/hls/index.m3u8", get(hls_playlist))
        .route("/hls/:segment", get(hls_segment))
        // Peristaltic pumps
        .route("/api/pumps/:id/command", post(pump_command))
        .route("/api/pumps/:id/frame", get(pump_frame))
        .route("/api/pumps/:id/telemetry", get(pump_telemetry))
        // Syringe pumps
        .route("/api/syringe/:id/command", post(syringe_command))
        // Legacy control endpoint (query-string command form)
        .route("/control", get(legacy_control))
        .with_state(state)
}

// ---- Camera ----

/// MJPEG multipart stream. One broadcaster stream per connection; the
/// stream ends when the client disconnects.
async fn video_feed(State(state): State<AppState>) -> impl IntoResponse {
    let stream = state.broadcaster.clone().stream();
    (
        [
            (header::CONTENT_TYPE, broadcaster::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
}

async fn snapshot(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let jpeg = state.camera.snapshot().await?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg))
}

async fn camera_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.camera.status().await;
    Json(ApiResponse::success(CameraStatusResponse {
        initialized: status.initialized,
        backend: status.backend.map(|b| b.as_str().to_string()),
        width: status.profile.width,
        height: status.profile.height,
        fps: status.profile.fps,
        stream_errors: state.broadcaster.error_count(),
    }))
}

async fn get_camera_config(State(state): State<AppState>) -> impl IntoResponse {
    let profile = state.camera.profile().await;
    Json(ApiResponse::success(json!({
        "width": profile.width,
        "height": profile.height,
        "fps": profile.fps,
    })))
}

/// Partial update: omitted fields keep their current value. Applying a
/// config restarts the active backend.
async fn update_camera_config(
    State(state): State<AppState>,
    Json(req): Json<CameraConfigRequest>,
) -> Result<impl IntoResponse> {
    let current = state.camera.profile().await;
    let profile = CameraProfile {
        width: req.width.unwrap_or(current.width),
        height: req.height.unwrap_or(current.height),
        fps: req.fps.unwrap_or(current.fps),
    };
    state.camera.set_profile(profile).await?;
    Ok(Json(ApiResponse::success(json!({
        "width": profile.width,
        "height": profile.height,
        "fps": profile.fps,
    }))))
}

async fn restart_camera(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let backend = state.camera.restart().await?;
    Ok(Json(ApiResponse::success(json!({
        "backend": backend.as_str(),
    }))))
}

// ---- HLS ----

async fn start_hls(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.hls.start().await?;
    Ok(Json(ApiResponse::success(json!({
        "playlist_url": "/hls/index.m3u8",
    }))))
}

async fn stop_hls(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.hls.stop().await?;
    Ok(Json(ApiResponse::success(json!({ "stopped": true }))))
}

async fn hls_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.hls.status().await;
    Json(ApiResponse::success(HlsStatusResponse {
        active: status.active,
        playlist_url: status.active.then(|| "/hls/index.m3u8".to_string()),
        segment_count: status.segment_count,
        started_at: status.started_at,
    }))
}

async fn hls_playlist(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let playlist = state.hls.playlist().await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        playlist,
    ))
}

async fn hls_segment(
    State(state): State<AppState>,
    Path(segment): Path<String>,
) -> Result<impl IntoResponse> {
    let data = state.hls.segment(&segment).await?;
    Ok(([(header::CONTENT_TYPE, "video/mp2t")], data))
}

// ---- Peristaltic pumps ----

/// Send one command frame. The frame bytes come back in hex even when
/// the transmit fails, so the caller can always see what went on the
/// wire (or would have).
async fn pump_command(
    State(state): State<AppState>,
    Path(pump_id): Path<u8>,
    Json(req): Json<PumpCommandRequest>,
) -> Result<impl IntoResponse> {
    let (port, address, frame) = state.peristaltic.build(pump_id, req.action, req.value)?;
    let outcome = state.peristaltic.send_frame(&port, &frame, pump_id).await;
    Ok(Json(ApiResponse::success(PumpCommandResponse {
        pump: pump_id,
        port,
        address,
        frame_hex: frame.to_hex(),
        sent: outcome.is_ok(),
        error: outcome.err().map(|e| e.to_string()),
    })))
}

#[derive(Debug, Deserialize)]
struct PumpFrameQuery {
    action: char,
    #[serde(default)]
    value: u32,
}

/// Build-only endpoint: resolve the mapping and return the frame that
/// `pump_command` would send, without touching the port.
async fn pump_frame(
    State(state): State<AppState>,
    Path(pump_id): Path<u8>,
    Query(query): Query<PumpFrameQuery>,
) -> Result<impl IntoResponse> {
    let (port, address, frame) = state.peristaltic.build(pump_id, query.action, query.value)?;
    Ok(Json(ApiResponse::success(PumpCommandResponse {
        pump: pump_id,
        port,
        address,
        frame_hex: frame.to_hex(),
        sent: false,
        error: None,
    })))
}

#[derive(Debug, Deserialize)]
struct TelemetryQuery {
    #[serde(default = "default_telemetry_kind")]
    kind: String,
}

fn default_telemetry_kind() -> String {
    "current".to_string()
}

async fn pump_telemetry(
    State(state): State<AppState>,
    Path(pump_id): Path<u8>,
    Query(query): Query<TelemetryQuery>,
) -> Result<impl IntoResponse> {
    let kind = match query.kind.as_str() {
        "current" => TelemetryKind::Current,
        "rpm" => TelemetryKind::Rpm,
        other => {
            return Err(Error::Validation(format!(
                "Unknown telemetry kind: {}",
                other
            )))
        }
    };
    let telemetry = state.peristaltic.read_telemetry(pump_id, kind).await?;
    Ok(Json(ApiResponse::success(TelemetryResponse {
        pump: pump_id,
        kind: kind.as_str().to_string(),
        value: telemetry.value,
    })))
}

// ---- Syringe pumps ----

async fn syringe_command(
    State(state): State<AppState>,
    Path(pump_id): Path<u8>,
    Json(req): Json<SyringeCommandRequest>,
) -> Result<impl IntoResponse> {
    let command = match req {
        SyringeCommandRequest::Initialize => SyringeCommand::Initialize,
        SyringeCommandRequest::MoveUp { steps } => SyringeCommand::MoveUp(steps),
        SyringeCommandRequest::MoveDown { steps } => SyringeCommand::MoveDown(steps),
        SyringeCommandRequest::Stop => SyringeCommand::Stop,
        SyringeCommandRequest::Loop { down, up, count } => {
            SyringeCommand::Loop { down, up, count }
        }
        SyringeCommandRequest::StatusQuery => SyringeCommand::StatusQuery,
    };

    let controller = state.syringe.controller(pump_id)?;
    let command_string = command.to_command_string();
    // Pump slots map one-to-one onto protocol addresses on the shared port
    let (outcome, frame) = controller.send(&command_string, pump_id).await;

    Ok(Json(ApiResponse::success(SyringeCommandResponse {
        pump: pump_id,
        address: pump_id,
        command: command_string,
        frame_hex: syringe::hex_string(&frame),
        sent: outcome.is_ok(),
        error: outcome.err().map(|e| e.to_string()),
    })))
}

// ---- Legacy ----

#[derive(Debug, Deserialize)]
struct LegacyControlQuery {
    pump: u8,
    action: String,
    #[serde(default)]
    value: u32,
}

/// Query-string command form kept for existing clients. Same semantics
/// as `pump_command`, different surface.
async fn legacy_control(
    State(state): State<AppState>,
    Query(query): Query<LegacyControlQuery>,
) -> Result<impl IntoResponse> {
    let action = query
        .action
        .chars()
        .next()
        .ok_or_else(|| Error::Validation("Action must not be empty".to_string()))?;
    if query.action.chars().count() != 1 {
        return Err(Error::Validation(format!(
            "Action must be a single character, got {:?}",
            query.action
        )));
    }

    let (port, address, frame) = state.peristaltic.build(query.pump, action, query.value)?;
    let outcome = state.peristaltic.send_frame(&port, &frame, query.pump).await;
    Ok(Json(ApiResponse::success(PumpCommandResponse {
        pump: query.pump,
        port,
        address,
        frame_hex: frame.to_hex(),
        sent: outcome.is_ok(),
        error: outcome.err().map(|e| e.to_string()),
    })))
}
