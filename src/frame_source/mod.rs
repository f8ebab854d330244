//! CameraService - frame acquisition from a prioritized backend list
//!
//! ## Responsibilities
//!
//! - Startup probe: first backend that opens and yields a non-empty frame
//! - `capture()` → latest frame or typed `NoFrame` (caller decides retry)
//! - Runtime profile swap + restart without leaking the previous handle
//! - Shared hardware-encoded JPEG buffer (lock + copy-out, never in-place)
//! - Single-frame snapshot encoding

pub mod backend;

use crate::error::{Error, Result};
use backend::{ActiveBackend, BackendKind, ProbeCandidate};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::ImageEncoder;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// How long the probe waits for a first frame from each candidate
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Probe poll interval
const PROBE_POLL: Duration = Duration::from_millis(100);
/// Frames older than this count as a capture miss
const MAX_FRAME_AGE_SEC: i64 = 2;

fn max_frame_age() -> chrono::Duration {
    chrono::Duration::seconds(MAX_FRAME_AGE_SEC)
}

/// One raw frame: RGB8 pixel buffer plus capture timestamp
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

/// Runtime camera configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl CameraProfile {
    /// Raw RGB24 frame byte length
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Soft pacing interval derived from the target rate
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.fps.max(1) as u64)
    }
}

pub(crate) type SharedFrame = Arc<Mutex<Option<Frame>>>;
pub(crate) type SharedJpeg = Arc<Mutex<Option<(Vec<u8>, DateTime<Utc>)>>>;

/// Camera status snapshot
#[derive(Debug, Clone)]
pub struct CameraStatus {
    pub initialized: bool,
    pub backend: Option<BackendKind>,
    pub profile: CameraProfile,
}

/// CameraService instance
pub struct CameraService {
    /// Probe list, priority order
    candidates: Vec<ProbeCandidate>,
    /// Active backend (None when uninitialized)
    active: tokio::sync::Mutex<Option<ActiveBackend>>,
    /// Current profile
    profile: tokio::sync::RwLock<CameraProfile>,
    /// Latest raw frame (generic backend)
    latest: SharedFrame,
    /// Latest hardware-encoded JPEG (hardware backend)
    latest_jpeg: SharedJpeg,
    /// Snapshot JPEG quality
    snapshot_quality: u8,
}

impl CameraService {
    /// Build the service with the hardware backend first in the probe
    /// list, followed by each configured generic device.
    pub fn new(profile: CameraProfile, generic_devices: &[String], snapshot_quality: u8) -> Self {
        let mut candidates = vec![ProbeCandidate {
            kind: BackendKind::HardwareCamera,
            device: "libcamera".to_string(),
        }];
        for device in generic_devices {
            candidates.push(ProbeCandidate {
                kind: BackendKind::GenericCamera,
                device: device.clone(),
            });
        }

        Self {
            candidates,
            active: tokio::sync::Mutex::new(None),
            profile: tokio::sync::RwLock::new(profile),
            latest: Arc::new(Mutex::new(None)),
            latest_jpeg: Arc::new(Mutex::new(None)),
            snapshot_quality,
        }
    }

    /// Probe the candidate list and keep the first backend that yields a
    /// non-empty test frame. Idempotent: an already-active backend is
    /// released first.
    pub async fn init(&self) -> Result<BackendKind> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.shutdown().await;
            self.clear_buffers();
        }

        let profile = *self.profile.read().await;

        for candidate in &self.candidates {
            let spawned = ActiveBackend::spawn(
                candidate,
                profile,
                self.latest.clone(),
                self.latest_jpeg.clone(),
            );
            let backend = match spawned {
                Ok(backend) => backend,
                Err(e) => {
                    tracing::debug!(
                        backend = candidate.kind.as_str(),
                        device = %candidate.device,
                        error = %e,
                        "Probe candidate failed to spawn"
                    );
                    continue;
                }
            };

            if self.wait_for_first_frame().await {
                tracing::info!(
                    backend = backend.kind.as_str(),
                    device = %backend.device,
                    "Capture backend selected"
                );
                let kind = backend.kind;
                *active = Some(backend);
                return Ok(kind);
            }

            tracing::warn!(
                backend = candidate.kind.as_str(),
                device = %candidate.device,
                "Probe candidate produced no frame, trying next"
            );
            backend.shutdown().await;
            self.clear_buffers();
        }

        Err(Error::DeviceUnavailable(
            "No capture backend yielded a frame".to_string(),
        ))
    }

    async fn wait_for_first_frame(&self) -> bool {
        let deadline = tokio::time::Instant::now() + PROBE_TIMEOUT;
        loop {
            if self.has_fresh_frame() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            sleep(PROBE_POLL).await;
        }
    }

    fn has_fresh_frame(&self) -> bool {
        let raw = self
            .latest
            .lock()
            .map(|g| g.as_ref().map(|f| !f.data.is_empty()).unwrap_or(false))
            .unwrap_or(false);
        if raw {
            return true;
        }
        self.latest_jpeg
            .lock()
            .map(|g| g.as_ref().map(|(j, _)| !j.is_empty()).unwrap_or(false))
            .unwrap_or(false)
    }

    fn clear_buffers(&self) {
        if let Ok(mut guard) = self.latest.lock() {
            *guard = None;
        }
        if let Ok(mut guard) = self.latest_jpeg.lock() {
            *guard = None;
        }
    }

    /// Return a copy of the most recent frame, or `NoFrame` when nothing
    /// fresh is available. Never panics mid-stream; the caller decides
    /// whether to retry.
    pub async fn capture(&self) -> Result<Frame> {
        // Raw buffer first (generic backend path)
        let raw = self
            .latest
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        if let Some(frame) = raw {
            if Utc::now() - frame.captured_at < max_frame_age() {
                return Ok(frame);
            }
        }

        // Hardware path: decode the most recent encoded frame
        if let Some((jpeg, ts)) = self.copy_encoded_with_time() {
            if Utc::now() - ts < max_frame_age() {
                return decode_jpeg(&jpeg, ts);
            }
        }

        Err(Error::NoFrame)
    }

    /// Copy out the hardware-encoded JPEG buffer, if it holds a fresh
    /// image. A stale buffer (the capture child died) is a miss, under
    /// the same age bound `capture` applies to the raw buffer.
    pub fn copy_encoded(&self) -> Option<Vec<u8>> {
        self.copy_encoded_with_time()
            .filter(|(_, ts)| Utc::now() - *ts < max_frame_age())
            .map(|(jpeg, _)| jpeg)
    }

    #[cfg(test)]
    pub(crate) fn inject_encoded(&self, jpeg: Vec<u8>, captured_at: DateTime<Utc>) {
        if let Ok(mut guard) = self.latest_jpeg.lock() {
            *guard = Some((jpeg, captured_at));
        }
    }

    fn copy_encoded_with_time(&self) -> Option<(Vec<u8>, DateTime<Utc>)> {
        self.latest_jpeg.lock().ok().and_then(|guard| guard.clone())
    }

    /// Encode one frame as a standalone snapshot.
    pub async fn snapshot(&self) -> Result<Vec<u8>> {
        let frame = self.capture().await?;
        encode_jpeg(&frame, self.snapshot_quality)
    }

    /// Release the current device handle completely, then re-probe.
    pub async fn restart(&self) -> Result<BackendKind> {
        tracing::info!("Camera restart requested");
        self.init().await
    }

    /// Swap the camera profile. Applied by restarting the active backend;
    /// applying the same profile twice is a no-op restart.
    pub async fn set_profile(&self, profile: CameraProfile) -> Result<()> {
        if profile.width == 0 || profile.height == 0 || profile.fps == 0 {
            return Err(Error::Validation(
                "Camera profile fields must be non-zero".to_string(),
            ));
        }
        {
            let mut current = self.profile.write().await;
            *current = profile;
        }
        let initialized = self.active.lock().await.is_some();
        if initialized {
            self.init().await?;
        }
        Ok(())
    }

    pub async fn profile(&self) -> CameraProfile {
        *self.profile.read().await
    }

    pub async fn status(&self) -> CameraStatus {
        let active = self.active.lock().await;
        CameraStatus {
            initialized: active.is_some(),
            backend: active.as_ref().map(|a| a.kind),
            profile: *self.profile.read().await,
        }
    }

    /// Release the active backend (used at shutdown).
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        if let Some(backend) = active.take() {
            backend.shutdown().await;
        }
        self.clear_buffers();
    }
}

/// Encode an RGB8 frame to JPEG at the given quality.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder
        .write_image(
            &frame.data,
            frame.width,
            frame.height,
            image::ColorType::Rgb8,
        )
        .map_err(|e| Error::Internal(format!("JPEG encode failed: {}", e)))?;
    Ok(buf)
}

fn decode_jpeg(jpeg: &[u8], captured_at: DateTime<Utc>) -> Result<Frame> {
    let img = image::load_from_memory(jpeg)
        .map_err(|e| Error::Parse(format!("JPEG decode failed: {}", e)))?
        .to_rgb8();
    let (width, height) = img.dimensions();
    Ok(Frame {
        data: img.into_raw(),
        width,
        height,
        captured_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_profile() -> CameraProfile {
        CameraProfile {
            width: 640,
            height: 480,
            fps: 30,
        }
    }

    #[test]
    fn test_profile_derivations() {
        let profile = test_profile();
        assert_eq!(profile.frame_len(), 640 * 480 * 3);
        assert_eq!(profile.frame_interval(), Duration::from_millis(33));
    }

    #[tokio::test]
    async fn test_capture_without_backend_is_no_frame() {
        let service = CameraService::new(test_profile(), &[], 90);
        assert!(matches!(service.capture().await, Err(Error::NoFrame)));
    }

    #[tokio::test]
    async fn test_stale_frames_are_a_capture_miss() {
        let service = CameraService::new(test_profile(), &[], 90);
        {
            let mut guard = service.latest.lock().unwrap();
            *guard = Some(Frame {
                data: vec![0u8; 12],
                width: 2,
                height: 2,
                captured_at: Utc::now() - chrono::Duration::seconds(10),
            });
        }
        assert!(matches!(service.capture().await, Err(Error::NoFrame)));
    }

    #[tokio::test]
    async fn test_capture_copies_the_fresh_frame_out() {
        let service = CameraService::new(test_profile(), &[], 90);
        {
            let mut guard = service.latest.lock().unwrap();
            *guard = Some(Frame {
                data: vec![7u8; 12],
                width: 2,
                height: 2,
                captured_at: Utc::now(),
            });
        }
        let frame = service.capture().await.unwrap();
        assert_eq!(frame.data, vec![7u8; 12]);

        // The buffer still holds the frame (copy, not move)
        assert!(service.latest.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_set_profile_validates() {
        let service = CameraService::new(test_profile(), &[], 90);
        let bad = CameraProfile {
            width: 0,
            height: 480,
            fps: 30,
        };
        assert!(service.set_profile(bad).await.is_err());

        let good = CameraProfile {
            width: 1280,
            height: 720,
            fps: 15,
        };
        // No active backend: stored without a restart
        service.set_profile(good).await.unwrap();
        assert_eq!(service.profile().await, good);
    }

    #[tokio::test]
    async fn test_stale_encoded_buffer_is_a_miss() {
        let service = CameraService::new(test_profile(), &[], 90);
        let jpeg = vec![0xFF, 0xD8, 0xFF, 0xD9];

        service.inject_encoded(jpeg.clone(), Utc::now() - chrono::Duration::seconds(60));
        assert!(service.copy_encoded().is_none());
        assert!(matches!(service.capture().await, Err(Error::NoFrame)));

        service.inject_encoded(jpeg.clone(), Utc::now());
        assert_eq!(service.copy_encoded(), Some(jpeg));
    }

    #[test]
    fn test_encode_round_trip() {
        let frame = Frame {
            data: vec![128u8; 8 * 8 * 3],
            width: 8,
            height: 8,
            captured_at: Utc::now(),
        };
        let jpeg = encode_jpeg(&frame, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = decode_jpeg(&jpeg, frame.captured_at).unwrap();
        assert_eq!(decoded.width, 8);
        assert_eq!(decoded.height, 8);
    }
}
