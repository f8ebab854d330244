//! Application state
//!
//! Holds all shared components and configuration

use crate::broadcaster::FrameBroadcaster;
use crate::frame_source::CameraService;
use crate::hls_supervisor::HlsSupervisor;
use crate::peristaltic::response::LayoutSetting;
use crate::peristaltic::PeristalticBus;
use crate::port_manager::PortManager;
use crate::syringe::SyringeBank;
use std::sync::Arc;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Default camera width
    pub camera_width: u32,
    /// Default camera height
    pub camera_height: u32,
    /// Default camera frame rate
    pub camera_fps: u32,
    /// V4L2 device candidates for the generic backend
    pub capture_devices: Vec<String>,
    /// JPEG quality for the MJPEG stream
    pub stream_quality: u8,
    /// JPEG quality for single snapshots
    pub snapshot_quality: u8,
    /// Peristaltic serial port paths, one per pump group
    pub peristaltic_ports: Vec<String>,
    /// Peristaltic baud rate
    pub peristaltic_baud: u32,
    /// Logical pumps served by each peristaltic port
    pub pumps_per_port: usize,
    /// Telemetry read timeout in milliseconds
    pub telemetry_timeout_ms: u64,
    /// Telemetry poll interval in milliseconds
    pub telemetry_poll_ms: u64,
    /// Response frame layout expectation
    pub response_layout: LayoutSetting,
    /// Syringe pump shared serial port path
    pub syringe_port: String,
    /// Syringe baud rate
    pub syringe_baud: u32,
    /// Number of syringe pump controllers
    pub syringe_pump_count: u8,
    /// HLS segment duration in seconds
    pub hls_segment_sec: u32,
    /// HLS playlist window size (rolling segment count)
    pub hls_window: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5000),
            camera_width: env_parse("CAMERA_WIDTH", 640),
            camera_height: env_parse("CAMERA_HEIGHT", 480),
            camera_fps: env_parse("CAMERA_FPS", 30),
            capture_devices: env_csv("CAPTURE_DEVICES", "/dev/video0,/dev/video1"),
            stream_quality: env_parse("STREAM_QUALITY", 80),
            snapshot_quality: env_parse("SNAPSHOT_QUALITY", 90),
            peristaltic_ports: env_csv("PERISTALTIC_PORTS", "/dev/ttyUSB0,/dev/ttyUSB1"),
            peristaltic_baud: env_parse("PERISTALTIC_BAUD", 9600),
            pumps_per_port: env_parse("PUMPS_PER_PORT", 3),
            telemetry_timeout_ms: env_parse("TELEMETRY_TIMEOUT_MS", 1000),
            telemetry_poll_ms: env_parse("TELEMETRY_POLL_MS", 50),
            response_layout: std::env::var("RESPONSE_LAYOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(LayoutSetting::Auto),
            syringe_port: std::env::var("SYRINGE_PORT")
                .unwrap_or_else(|_| "/dev/ttyUSB2".to_string()),
            syringe_baud: env_parse("SYRINGE_BAUD", 9600),
            syringe_pump_count: env_parse("SYRINGE_PUMP_COUNT", 6),
            hls_segment_sec: env_parse("HLS_SEGMENT_SEC", 2),
            hls_window: env_parse("HLS_WINDOW", 5),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_csv(key: &str, default: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// CameraService (frame source)
    pub camera: Arc<CameraService>,
    /// FrameBroadcaster (MJPEG stream factory)
    pub broadcaster: Arc<FrameBroadcaster>,
    /// HlsSupervisor (external encoder session)
    pub hls: Arc<HlsSupervisor>,
    /// PortManager (serial port registry)
    pub ports: Arc<PortManager>,
    /// PeristalticBus (fixed-frame pump protocol)
    pub peristaltic: Arc<PeristalticBus>,
    /// SyringeBank (variable-frame pump protocol)
    pub syringe: Arc<SyringeBank>,
    /// Server start time (for uptime reporting)
    pub started_at: chrono::DateTime<chrono::Utc>,
}
