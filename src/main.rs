//! Fluidic Camserver - device-control gateway
//!
//! Main entry point for the gateway application.

use fluidic_camserver::{
    broadcaster::FrameBroadcaster,
    frame_source::{CameraProfile, CameraService},
    hls_supervisor::{HlsConfig, HlsSupervisor},
    peristaltic::{PeristalticBus, PumpAddressMap},
    port_manager::PortManager,
    state::{AppConfig, AppState},
    syringe::SyringeBank,
    web_api,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fluidic_camserver=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Fluidic Camserver v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        host = %config.host,
        port = config.port,
        capture_devices = ?config.capture_devices,
        peristaltic_ports = ?config.peristaltic_ports,
        syringe_port = %config.syringe_port,
        "Configuration loaded"
    );

    // Serial port registry. Ports that fail to open are logged and left
    // closed; pump endpoints report PortUnavailable until they appear.
    let ports = Arc::new(PortManager::new());
    for path in &config.peristaltic_ports {
        if let Err(e) = ports.open(path, config.peristaltic_baud).await {
            tracing::warn!(port = %path, error = %e, "Peristaltic port not available at boot");
        }
    }
    if let Err(e) = ports.open(&config.syringe_port, config.syringe_baud).await {
        tracing::warn!(port = %config.syringe_port, error = %e, "Syringe port not available at boot");
    }

    // Camera: probe at boot, but keep serving pump traffic without one
    let profile = CameraProfile {
        width: config.camera_width,
        height: config.camera_height,
        fps: config.camera_fps,
    };
    let camera = Arc::new(CameraService::new(
        profile,
        &config.capture_devices,
        config.snapshot_quality,
    ));
    match camera.init().await {
        Ok(backend) => tracing::info!(backend = backend.as_str(), "Camera initialized"),
        Err(e) => tracing::warn!(error = %e, "Camera not available at boot, continuing without it"),
    }

    let broadcaster = Arc::new(FrameBroadcaster::new(camera.clone(), config.stream_quality));
    let hls = Arc::new(HlsSupervisor::new(
        camera.clone(),
        HlsConfig {
            segment_sec: config.hls_segment_sec,
            window: config.hls_window,
        },
    ));

    let pump_map = PumpAddressMap::new(config.peristaltic_ports.clone(), config.pumps_per_port)?;
    let peristaltic = Arc::new(PeristalticBus::new(
        pump_map,
        ports.clone(),
        Duration::from_millis(config.telemetry_timeout_ms),
        Duration::from_millis(config.telemetry_poll_ms),
        config.response_layout,
    ));
    tracing::info!(pumps = peristaltic.pump_count(), "Peristaltic bus ready");

    let syringe = Arc::new(SyringeBank::new(
        config.syringe_pump_count,
        config.syringe_port.clone(),
        ports.clone(),
    ));
    tracing::info!(pumps = syringe.pump_count(), "Syringe bank ready");

    let state = AppState {
        config: config.clone(),
        camera: camera.clone(),
        broadcaster,
        hls: hls.clone(),
        ports,
        peristaltic,
        syringe,
        started_at: chrono::Utc::now(),
    };

    let app = web_api::create_router(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 終了時は必ず外部プロセスとデバイスハンドルを解放する
    tracing::info!("Shutting down");
    if let Err(e) = hls.stop().await {
        tracing::warn!(error = %e, "Encoder shutdown failed");
    }
    camera.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
