//! Shared API models

use serde::{Deserialize, Serialize};

/// Standard API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ApiError) -> ApiResponse<T> {
        ApiResponse {
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

/// API error
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub camera_initialized: bool,
    pub hls_active: bool,
}

/// Camera status response
#[derive(Debug, Serialize, Deserialize)]
pub struct CameraStatusResponse {
    pub initialized: bool,
    pub backend: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub stream_errors: u64,
}

/// Camera config update request
#[derive(Debug, Deserialize)]
pub struct CameraConfigRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
}

/// HLS session status response
#[derive(Debug, Serialize, Deserialize)]
pub struct HlsStatusResponse {
    pub active: bool,
    pub playlist_url: Option<String>,
    pub segment_count: usize,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Peristaltic pump command request
#[derive(Debug, Deserialize)]
pub struct PumpCommandRequest {
    /// Single ASCII action character (e.g. M, S, F, R)
    pub action: char,
    /// Command value, 0..=999999
    #[serde(default)]
    pub value: u32,
}

/// Pump command response (frame always included for audit)
#[derive(Debug, Serialize)]
pub struct PumpCommandResponse {
    pub pump: u8,
    pub port: String,
    pub address: u8,
    pub frame_hex: String,
    pub sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Telemetry response
#[derive(Debug, Serialize)]
pub struct TelemetryResponse {
    pub pump: u8,
    pub kind: String,
    pub value: i32,
}

/// Syringe pump command request
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SyringeCommandRequest {
    Initialize,
    MoveUp { steps: u32 },
    MoveDown { steps: u32 },
    Stop,
    Loop { down: u32, up: u32, count: u32 },
    StatusQuery,
}

/// Syringe pump command response
#[derive(Debug, Serialize)]
pub struct SyringeCommandResponse {
    pub pump: u8,
    pub address: u8,
    pub command: String,
    pub frame_hex: String,
    pub sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
