//! FrameBroadcaster - MJPEG multipart streaming
//!
//! ## Responsibilities
//!
//! - Lazy, infinite envelope stream per connection (`--frame` boundary)
//! - Prefer the hardware-encoded JPEG buffer, fall back to software encode
//! - Best-effort pacing via an explicit sleep interval (soft; no catch-up)
//! - Skip-and-count on capture/encode failure, never terminate the stream

use crate::frame_source::{encode_jpeg, CameraService};
use bytes::Bytes;
use futures::Stream;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::sleep;

/// Multipart boundary, matching the `multipart/x-mixed-replace` header
pub const BOUNDARY: &str = "frame";

/// MIME type for the streaming response
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// FrameBroadcaster instance
pub struct FrameBroadcaster {
    camera: Arc<CameraService>,
    /// JPEG quality for the software-encode fallback
    quality: u8,
    /// Dropped-iteration counter across all connections
    errors: AtomicU64,
}

impl FrameBroadcaster {
    pub fn new(camera: Arc<CameraService>, quality: u8) -> Self {
        Self {
            camera,
            quality,
            errors: AtomicU64::new(0),
        }
    }

    /// Total iterations skipped due to a missing frame or encode failure
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Produce one connection's envelope stream. The stream has no
    /// explicit cancellation; it ends when the consumer drops it.
    pub fn stream(self: Arc<Self>) -> impl Stream<Item = Result<Bytes, Infallible>> {
        let this = self;
        async_stream::stream! {
            loop {
                let interval = this.camera.profile().await.frame_interval();

                match this.next_jpeg().await {
                    Some(jpeg) => {
                        yield Ok(envelope(&jpeg));
                    }
                    None => {
                        // 失敗イテレーションはエンベロープを出さずに継続
                        this.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }

                sleep(interval).await;
            }
        }
    }

    /// One encoded frame: hardware buffer first, then software encode.
    async fn next_jpeg(&self) -> Option<Vec<u8>> {
        if let Some(jpeg) = self.camera.copy_encoded() {
            return Some(jpeg);
        }

        match self.camera.capture().await {
            Ok(frame) => match encode_jpeg(&frame, self.quality) {
                Ok(jpeg) => Some(jpeg),
                Err(e) => {
                    tracing::debug!(error = %e, "Stream encode failed, skipping frame");
                    None
                }
            },
            Err(e) => {
                tracing::trace!(error = %e, "No frame this iteration");
                None
            }
        }
    }
}

/// Wrap one encoded image in its boundary-delimited envelope.
fn envelope(jpeg: &[u8]) -> Bytes {
    let mut payload = Vec::with_capacity(jpeg.len() + 64);
    payload.extend_from_slice(b"--frame\r\n");
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_source::CameraProfile;
    use chrono::Utc;
    use futures::StreamExt;
    use std::time::Duration;

    fn test_camera() -> Arc<CameraService> {
        Arc::new(CameraService::new(
            CameraProfile {
                width: 640,
                height: 480,
                fps: 30,
            },
            &[],
            90,
        ))
    }

    fn test_broadcaster() -> Arc<FrameBroadcaster> {
        Arc::new(FrameBroadcaster::new(test_camera(), 80))
    }

    #[test]
    fn test_envelope_format() {
        let body = envelope(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let expected = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8\xFF\xD9\r\n";
        assert_eq!(&body[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_stream_survives_repeated_capture_failures() {
        let broadcaster = test_broadcaster();
        let mut stream = Box::pin(broadcaster.clone().stream());

        // No camera: every iteration fails, but the stream keeps going -
        // next() must neither yield an item nor end within the window.
        let result =
            tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
        assert!(result.is_err(), "stream must not yield or terminate");
        assert!(broadcaster.error_count() >= 1);
    }

    #[tokio::test]
    async fn test_fresh_hardware_jpeg_is_streamed() {
        let camera = test_camera();
        let jpeg = vec![0xFF, 0xD8, 0xFF, 0xD9];
        camera.inject_encoded(jpeg.clone(), Utc::now());

        let broadcaster = Arc::new(FrameBroadcaster::new(camera, 80));
        let mut stream = Box::pin(broadcaster.clone().stream());

        let item = tokio::time::timeout(Duration::from_millis(200), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(item, envelope(&jpeg));
        assert_eq!(broadcaster.error_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_hardware_jpeg_is_skipped_not_replayed() {
        // The capture child died a minute ago and left its last image in
        // the encoded buffer. The stream must treat that iteration as a
        // miss, not keep replaying the dead frame as if live.
        let camera = test_camera();
        camera.inject_encoded(
            vec![0xFF, 0xD8, 0xFF, 0xD9],
            Utc::now() - chrono::Duration::seconds(60),
        );

        let broadcaster = Arc::new(FrameBroadcaster::new(camera, 80));
        let mut stream = Box::pin(broadcaster.clone().stream());

        let result =
            tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
        assert!(result.is_err(), "stale frame must not be replayed");
        assert!(broadcaster.error_count() >= 1);
    }
}
