//! Fluidic Camserver Library
//!
//! Device-control gateway for a fluidics bench: camera feed plus serial
//! pump buses behind one HTTP surface.
//!
//! ## Architecture (8 Components)
//!
//! 1. CameraService - frame acquisition from a prioritized backend list
//! 2. FrameBroadcaster - MJPEG multipart streaming
//! 3. HlsSupervisor - external HLS encoder process management
//! 4. PortManager - serial port registry with per-port leases
//! 5. PeristalticBus - fixed-frame pump protocol (11-byte command, 10-byte telemetry)
//! 6. SyringeBank - variable-frame ASCII pump protocol on one shared port
//! 7. WebAPI - REST API endpoints
//! 8. Models - shared request/response types
//!
//! ## Design Principles
//!
//! - One owner per device handle: ports and capture children are only
//!   reached through their manager
//! - Frame builders are pure; transmit failures still return the frame

pub mod broadcaster;
pub mod frame_source;
pub mod hls_supervisor;
pub mod peristaltic;
pub mod port_manager;
pub mod syringe;
pub mod web_api;
pub mod models;
pub mod error;
pub mod state;

pub use error::{Error, Result};
pub use state::AppState;
