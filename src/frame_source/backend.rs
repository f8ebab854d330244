//! Capture backends
//!
//! Two child-process backends behind one spawn/shutdown surface:
//!
//! - `HardwareCamera`: `rpicam-vid` emitting hardware-encoded MJPEG; the
//!   reader task fills the shared encoded-JPEG buffer.
//! - `GenericCamera`: `ffmpeg` V4L2 capture emitting raw RGB24 frames.

use super::{CameraProfile, SharedFrame, SharedJpeg};
use crate::error::{Error, Result};
use chrono::Utc;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Capture backend variants, probed in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Hardware-accelerated camera pipeline (rpicam-vid, MJPEG out)
    HardwareCamera,
    /// Generic V4L2 device via ffmpeg (raw RGB24 out)
    GenericCamera,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::HardwareCamera => "hardware",
            BackendKind::GenericCamera => "generic",
        }
    }
}

/// One entry in the startup probe list
#[derive(Debug, Clone)]
pub struct ProbeCandidate {
    pub kind: BackendKind,
    /// Device path for the generic backend; ignored by the hardware one
    pub device: String,
}

/// A live capture child process plus its reader task
pub struct ActiveBackend {
    pub kind: BackendKind,
    pub device: String,
    child: Child,
    reader: JoinHandle<()>,
}

impl ActiveBackend {
    /// Spawn the candidate's child process and start its reader task.
    pub fn spawn(
        candidate: &ProbeCandidate,
        profile: CameraProfile,
        latest: SharedFrame,
        latest_jpeg: SharedJpeg,
    ) -> Result<Self> {
        let mut child = match candidate.kind {
            BackendKind::HardwareCamera => spawn_hardware(&profile)?,
            BackendKind::GenericCamera => spawn_generic(&candidate.device, &profile)?,
        };

        let stdout = child.stdout.take().ok_or_else(|| {
            Error::DeviceUnavailable("Capture process has no stdout pipe".to_string())
        })?;

        let reader = match candidate.kind {
            BackendKind::HardwareCamera => tokio::spawn(mjpeg_reader(stdout, latest_jpeg)),
            BackendKind::GenericCamera => tokio::spawn(rawvideo_reader(stdout, profile, latest)),
        };

        tracing::info!(
            backend = candidate.kind.as_str(),
            device = %candidate.device,
            width = profile.width,
            height = profile.height,
            fps = profile.fps,
            "Capture backend spawned"
        );

        Ok(Self {
            kind: candidate.kind,
            device: candidate.device.clone(),
            child,
            reader,
        })
    }

    /// Kill the child and stop the reader. Must complete before a new
    /// backend is probed so the device handle is fully released.
    pub async fn shutdown(mut self) {
        self.reader.abort();
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "Capture process already gone");
        }
        let _ = self.child.wait().await;
        tracing::info!(backend = self.kind.as_str(), "Capture backend released");
    }
}

fn spawn_hardware(profile: &CameraProfile) -> Result<Child> {
    Command::new("rpicam-vid")
        .args([
            "-t", "0",
            "-n",
            "--codec", "mjpeg",
            "--width", &profile.width.to_string(),
            "--height", &profile.height.to_string(),
            "--framerate", &profile.fps.to_string(),
            "-o", "-",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::DeviceUnavailable(format!("rpicam-vid spawn failed: {}", e)))
}

fn spawn_generic(device: &str, profile: &CameraProfile) -> Result<Child> {
    let size = format!("{}x{}", profile.width, profile.height);
    let scale = format!("scale={}:{}", profile.width, profile.height);
    Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel", "error",
            "-f", "video4linux2",
            "-framerate", &profile.fps.to_string(),
            "-video_size", &size,
            "-i", device,
            "-vf", &scale,
            "-pix_fmt", "rgb24",
            "-f", "rawvideo",
            "-",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::DeviceUnavailable(format!("ffmpeg spawn failed: {}", e)))
}

/// Reader for the hardware MJPEG stream: splits the byte stream on JPEG
/// SOI/EOI markers and publishes each complete image to the shared
/// encoded buffer (copy under the lock, consumers copy out).
async fn mjpeg_reader(mut stdout: ChildStdout, latest_jpeg: SharedJpeg) {
    let mut pending: Vec<u8> = Vec::with_capacity(64 * 1024);
    let mut chunk = [0u8; 8192];

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                while let Some(jpeg) = extract_jpeg(&mut pending) {
                    if let Ok(mut guard) = latest_jpeg.lock() {
                        *guard = Some((jpeg, Utc::now()));
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "MJPEG reader stopped");
                break;
            }
        }
    }
}

/// Reader for the generic raw RGB24 stream: one fixed-size frame per read.
async fn rawvideo_reader(mut stdout: ChildStdout, profile: CameraProfile, latest: SharedFrame) {
    let frame_len = profile.frame_len();
    let mut buffer = vec![0u8; frame_len];

    loop {
        match stdout.read_exact(&mut buffer).await {
            Ok(_) => {
                let frame = super::Frame {
                    data: buffer.clone(),
                    width: profile.width,
                    height: profile.height,
                    captured_at: Utc::now(),
                };
                if let Ok(mut guard) = latest.lock() {
                    *guard = Some(frame);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Raw video reader stopped");
                break;
            }
        }
    }
}

/// Pull one complete JPEG (SOI..EOI inclusive) out of the pending buffer.
fn extract_jpeg(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    let soi = find_marker(pending, 0xD8, 0)?;
    let eoi = find_marker(pending, 0xD9, soi + 2)?;
    let jpeg = pending[soi..eoi + 2].to_vec();
    pending.drain(..eoi + 2);
    Some(jpeg)
}

fn find_marker(buf: &[u8], second: u8, from: usize) -> Option<usize> {
    if buf.len() < 2 || from >= buf.len() {
        return None;
    }
    (from..buf.len() - 1).find(|&i| buf[i] == 0xFF && buf[i + 1] == second)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_jpeg_from_stream() {
        let mut pending = Vec::new();
        pending.extend_from_slice(&[0x00, 0x01]); // leading garbage
        pending.extend_from_slice(&[0xFF, 0xD8, 0xAA, 0xBB, 0xFF, 0xD9]);
        pending.extend_from_slice(&[0xFF, 0xD8, 0x11]); // partial next image

        let jpeg = extract_jpeg(&mut pending).unwrap();
        assert_eq!(jpeg, vec![0xFF, 0xD8, 0xAA, 0xBB, 0xFF, 0xD9]);

        // The partial image stays pending until its EOI arrives
        assert!(extract_jpeg(&mut pending).is_none());
        pending.extend_from_slice(&[0xFF, 0xD9]);
        let jpeg2 = extract_jpeg(&mut pending).unwrap();
        assert_eq!(&jpeg2[..2], &[0xFF, 0xD8]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_extract_jpeg_needs_both_markers() {
        let mut pending = vec![0xFF, 0xD8, 0x00, 0x00];
        assert!(extract_jpeg(&mut pending).is_none());
        assert_eq!(pending.len(), 4);
    }
}
