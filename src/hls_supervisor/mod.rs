//! HlsSupervisor - external encoder process management
//!
//! ## Responsibilities
//!
//! - At most one ffmpeg HLS child at a time, fed raw frames over stdin
//! - Temporary working directory bound exactly to the session lifetime
//! - Liveness probe shortly after spawn, with captured diagnostics
//! - Idempotent stop: graceful EOF, bounded wait, then force kill
//!
//! 停止時・シグナル受信時・スポーン失敗時のいずれでも作業ディレクトリを
//! 必ず削除する（TempDirはDropでも消えるためクラッシュ時も残らない）。

use crate::error::{Error, Result};
use crate::frame_source::CameraService;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Delay before the post-spawn liveness probe
const LIVENESS_PROBE_DELAY: Duration = Duration::from_millis(300);
/// Graceful shutdown wait before force kill
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Diagnostic tail kept from the encoder's stderr
const STDERR_TAIL_BYTES: usize = 4096;

/// Playlist file name inside the session directory
pub const PLAYLIST_NAME: &str = "index.m3u8";

/// Encoder settings
#[derive(Debug, Clone, Copy)]
pub struct HlsConfig {
    /// Segment duration in seconds
    pub segment_sec: u32,
    /// Rolling playlist window (segment count)
    pub window: u32,
}

/// One live encoder session
struct HlsSession {
    child: Child,
    feeder: JoinHandle<()>,
    stderr_tail: Arc<StdMutex<String>>,
    dir: TempDir,
    started_at: DateTime<Utc>,
}

/// Session status snapshot
#[derive(Debug, Clone)]
pub struct HlsStatus {
    pub active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub segment_count: usize,
}

/// HlsSupervisor instance
pub struct HlsSupervisor {
    camera: Arc<CameraService>,
    config: HlsConfig,
    session: Mutex<Option<HlsSession>>,
}

impl HlsSupervisor {
    pub fn new(camera: Arc<CameraService>, config: HlsConfig) -> Self {
        Self {
            camera,
            config,
            session: Mutex::new(None),
        }
    }

    /// Start a session. Rejects when one is already active.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(Error::Validation(
                "Encoder session already active".to_string(),
            ));
        }

        let profile = self.camera.profile().await;
        let dir = tempfile::Builder::new()
            .prefix("hls-session-")
            .tempdir()
            .map_err(|e| Error::EncoderSpawn(format!("Working dir creation failed: {}", e)))?;

        let playlist = dir.path().join(PLAYLIST_NAME);
        let segments = dir.path().join("seg%05d.ts");
        let size = format!("{}x{}", profile.width, profile.height);
        let gop = (profile.fps * self.config.segment_sec).max(1).to_string();

        let mut child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel", "error",
                "-f", "rawvideo",
                "-pix_fmt", "rgb24",
                "-video_size", &size,
                "-framerate", &profile.fps.to_string(),
                "-i", "-",
                "-c:v", "libx264",
                "-preset", "veryfast",
                "-tune", "zerolatency",
                "-g", &gop,
                "-f", "hls",
                "-hls_time", &self.config.segment_sec.to_string(),
                "-hls_list_size", &self.config.window.to_string(),
                "-hls_flags", "delete_segments",
                "-hls_segment_filename",
            ])
            .arg(&segments)
            .arg(&playlist)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::EncoderSpawn(format!("ffmpeg spawn failed: {}", e)))?;

        let stderr_tail = Arc::new(StdMutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, stderr_tail.clone()));
        }

        let stdin = child.stdin.take().ok_or_else(|| {
            Error::EncoderSpawn("ffmpeg has no stdin pipe".to_string())
        })?;
        let feeder = tokio::spawn(feed_frames(self.camera.clone(), stdin));

        // Liveness probe: an immediately-dead child means bad arguments
        // or a missing encoder; surface its stderr instead of a silent
        // empty playlist.
        sleep(LIVENESS_PROBE_DELAY).await;
        if let Ok(Some(status)) = child.try_wait() {
            feeder.abort();
            let diag = stderr_tail
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default();
            if let Err(e) = dir.close() {
                tracing::warn!(error = %e, "Failed to remove encoder working dir");
            }
            return Err(Error::EncoderSpawn(format!(
                "ffmpeg exited immediately ({}): {}",
                status,
                diag.trim()
            )));
        }

        tracing::info!(
            dir = %dir.path().display(),
            segment_sec = self.config.segment_sec,
            window = self.config.window,
            "Encoder session started"
        );

        *session = Some(HlsSession {
            child,
            feeder,
            stderr_tail,
            dir,
            started_at: Utc::now(),
        });
        Ok(())
    }

    /// Stop the active session. Idempotent: succeeds with no session,
    /// and always removes the working directory.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        let Some(mut session) = slot.take() else {
            tracing::debug!("Encoder stop requested with no active session");
            return Ok(());
        };

        // Graceful: stop feeding, close stdin (EOF lets ffmpeg finalize
        // the playlist), bounded wait, then force kill.
        session.feeder.abort();
        let _ = session.feeder.await;

        match timeout(STOP_TIMEOUT, session.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(status = %status, "Encoder exited gracefully");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Encoder wait failed");
            }
            Err(_) => {
                tracing::warn!(
                    timeout_sec = STOP_TIMEOUT.as_secs(),
                    "Encoder unresponsive, force killing"
                );
                let _ = session.child.start_kill();
                let _ = session.child.wait().await;
            }
        }

        let diag = session
            .stderr_tail
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        if !diag.trim().is_empty() {
            tracing::debug!(stderr = %diag.trim(), "Encoder diagnostics");
        }

        if let Err(e) = session.dir.close() {
            tracing::warn!(error = %e, "Failed to remove encoder working dir");
        } else {
            tracing::info!("Encoder session stopped, working dir removed");
        }
        Ok(())
    }

    /// Read the current playlist.
    pub async fn playlist(&self) -> Result<Vec<u8>> {
        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Err(Error::NotFound("No active encoder session".to_string()));
        };
        let path = session.dir.path().join(PLAYLIST_NAME);
        tokio::fs::read(&path)
            .await
            .map_err(|_| Error::NotFound("Playlist not ready yet".to_string()))
    }

    /// Read one named segment. The filename is validated against the
    /// segment pattern; anything else is rejected before touching disk.
    pub async fn segment(&self, name: &str) -> Result<Vec<u8>> {
        if !is_valid_segment_name(name) {
            return Err(Error::Validation(format!(
                "Invalid segment name: {}",
                name
            )));
        }
        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Err(Error::NotFound("No active encoder session".to_string()));
        };
        let path = session.dir.path().join(name);
        tokio::fs::read(&path)
            .await
            .map_err(|_| Error::NotFound(format!("Segment {} not found", name)))
    }

    /// Session status, including the rolling segment count.
    pub async fn status(&self) -> HlsStatus {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(session) => HlsStatus {
                active: true,
                started_at: Some(session.started_at),
                segment_count: count_segments(session.dir.path().to_path_buf()).await,
            },
            None => HlsStatus {
                active: false,
                started_at: None,
                segment_count: 0,
            },
        }
    }

    /// Whether a session is currently active
    pub async fn is_active(&self) -> bool {
        self.session.lock().await.is_some()
    }
}

/// Pull frames from the camera at the profile rate and write them to the
/// encoder stdin. Frames with a mismatched byte length (profile swapped
/// mid-session) are skipped.
async fn feed_frames(camera: Arc<CameraService>, mut stdin: tokio::process::ChildStdin) {
    loop {
        let profile = camera.profile().await;
        match camera.capture().await {
            Ok(frame) => {
                if frame.data.len() == profile.frame_len() {
                    if let Err(e) = stdin.write_all(&frame.data).await {
                        tracing::warn!(error = %e, "Encoder stdin closed, feeder stopping");
                        break;
                    }
                }
            }
            Err(_) => {
                // transient miss; keep the cadence
            }
        }
        sleep(profile.frame_interval()).await;
    }
}

/// Keep a bounded tail of the encoder's stderr for diagnostics.
async fn drain_stderr(
    mut stderr: tokio::process::ChildStderr,
    tail: Arc<StdMutex<String>>,
) {
    let mut chunk = [0u8; 1024];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if let Ok(mut guard) = tail.lock() {
                    guard.push_str(&String::from_utf8_lossy(&chunk[..n]));
                    if guard.len() > STDERR_TAIL_BYTES {
                        let cut = guard.len() - STDERR_TAIL_BYTES;
                        guard.drain(..cut);
                    }
                }
            }
            Err(_) => break,
        }
    }
}

async fn count_segments(dir: PathBuf) -> usize {
    let mut count = 0;
    if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.path().extension().map(|e| e == "ts").unwrap_or(false) {
                count += 1;
            }
        }
    }
    count
}

/// Segment names are exactly what the encoder writes: `seg` + digits +
/// `.ts`. Everything else (traversal attempts included) is rejected.
fn is_valid_segment_name(name: &str) -> bool {
    let Some(stem) = name.strip_prefix("seg") else {
        return false;
    };
    let Some(digits) = stem.strip_suffix(".ts") else {
        return false;
    };
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_source::CameraProfile;

    fn test_supervisor() -> HlsSupervisor {
        let camera = Arc::new(CameraService::new(
            CameraProfile {
                width: 640,
                height: 480,
                fps: 30,
            },
            &[],
            90,
        ));
        HlsSupervisor::new(
            camera,
            HlsConfig {
                segment_sec: 2,
                window: 5,
            },
        )
    }

    #[tokio::test]
    async fn test_stop_without_session_is_ok() {
        let supervisor = test_supervisor();
        supervisor.stop().await.unwrap();
        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_active().await);
    }

    #[tokio::test]
    async fn test_status_with_no_session() {
        let supervisor = test_supervisor();
        let status = supervisor.status().await;
        assert!(!status.active);
        assert_eq!(status.segment_count, 0);
        assert!(status.started_at.is_none());
    }

    #[tokio::test]
    async fn test_playlist_requires_session() {
        let supervisor = test_supervisor();
        assert!(matches!(
            supervisor.playlist().await,
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_segment_name_validation() {
        assert!(is_valid_segment_name("seg00001.ts"));
        assert!(is_valid_segment_name("seg42.ts"));

        assert!(!is_valid_segment_name("seg.ts"));
        assert!(!is_valid_segment_name("../etc/passwd"));
        assert!(!is_valid_segment_name("seg00001.ts/../x"));
        assert!(!is_valid_segment_name("index.m3u8"));
        assert!(!is_valid_segment_name("segAB.ts"));
        assert!(!is_valid_segment_name(""));
    }
}
