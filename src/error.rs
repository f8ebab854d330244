//! Error handling for the fluidic camserver

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Capture device or serial port failed to open
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Transient capture miss (no frame available this iteration)
    #[error("No frame available")]
    NoFrame,

    /// Write failed on an open port
    #[error("Transmit error: {0}")]
    Transmit(String),

    /// Command attempted on an unopened/misconfigured port
    #[error("Port unavailable: {0}")]
    PortUnavailable(String),

    /// Port lease wait timed out (another command in flight)
    #[error("Port busy: {0}")]
    PortBusy(String),

    /// Telemetry poll timed out with no data
    #[error("No response from pump")]
    NoResponse,

    /// Response checksum mismatch
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    /// Malformed response payload
    #[error("Parse error: {0}")]
    Parse(String),

    /// Encoder child process failed to start or died immediately
    #[error("Encoder spawn error: {0}")]
    EncoderSpawn(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error
    #[error("Serial error: {0}")]
    Serial(#[from] serialport::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::DeviceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "DEVICE_UNAVAILABLE",
                msg.clone(),
            ),
            Error::NoFrame => (
                StatusCode::GATEWAY_TIMEOUT,
                "NO_FRAME",
                "No frame available".to_string(),
            ),
            Error::Transmit(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "TRANSMIT_ERROR",
                msg.clone(),
            ),
            Error::PortUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "PORT_UNAVAILABLE",
                msg.clone(),
            ),
            Error::PortBusy(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "PORT_BUSY",
                msg.clone(),
            ),
            Error::NoResponse => (
                StatusCode::GATEWAY_TIMEOUT,
                "NO_RESPONSE",
                "No response from pump".to_string(),
            ),
            Error::Checksum { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CHECKSUM_ERROR",
                self.to_string(),
            ),
            Error::Parse(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "PARSE_ERROR",
                msg.clone(),
            ),
            Error::EncoderSpawn(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ENCODER_SPAWN_ERROR",
                msg.clone(),
            ),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
            Error::Io(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO_ERROR",
                e.to_string(),
            ),
            Error::Serial(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIAL_ERROR",
                e.to_string(),
            ),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
