//! PortManager - serial port registry and per-port access control
//!
//! ## Responsibilities
//!
//! - Own every open serial handle (explicit open/close, no ambient globals)
//! - Serialize access per port: at most one in-flight command at a time
//! - Bounded wait for a busy port, then `PortBusy`
//!
//! 同一ポートへの同時書き込みはリースで直列化する。

use crate::error::{Error, Result};
use serialport::SerialPort;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::timeout;

/// Default lease wait timeout (2 seconds)
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 2000;

/// Serial open timeout applied to each handle
const SERIAL_IO_TIMEOUT_MS: u64 = 100;

type Handle = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

/// PortManager - owns serial handles and hands out exclusive leases
pub struct PortManager {
    /// ポートパスごとのハンドル（未オープンはNone）
    ports: RwLock<HashMap<String, Handle>>,
    /// Lease wait timeout
    wait_timeout: Duration,
}

impl PortManager {
    pub fn new() -> Self {
        Self {
            ports: RwLock::new(HashMap::new()),
            wait_timeout: Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS),
        }
    }

    pub fn with_timeout(timeout_ms: u64) -> Self {
        Self {
            ports: RwLock::new(HashMap::new()),
            wait_timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Open a serial port and register the handle.
    ///
    /// An already-open port is rejected; callers must `close()` first
    /// (close-before-reopen invariant).
    pub async fn open(&self, path: &str, baud: u32) -> Result<()> {
        let handle = self.get_or_create_handle(path).await;
        let mut guard = handle.lock().await;

        if guard.is_some() {
            return Err(Error::Validation(format!(
                "Port {} already open; close it before reopening",
                path
            )));
        }

        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(SERIAL_IO_TIMEOUT_MS))
            .open()
            .map_err(|e| Error::DeviceUnavailable(format!("{}: {}", path, e)))?;

        *guard = Some(port);
        tracing::info!(port = %path, baud = baud, "Serial port opened");
        Ok(())
    }

    /// Close a port, dropping the handle. Safe to call when not open.
    pub async fn close(&self, path: &str) {
        let handle = self.get_or_create_handle(path).await;
        let mut guard = handle.lock().await;
        if guard.take().is_some() {
            tracing::info!(port = %path, "Serial port closed");
        }
    }

    /// Whether the port currently holds an open handle
    pub async fn is_open(&self, path: &str) -> bool {
        let ports = self.ports.read().await;
        match ports.get(path) {
            Some(handle) => handle.lock().await.is_some(),
            None => false,
        }
    }

    /// Acquire exclusive access to a port (bounded wait).
    ///
    /// The returned lease releases on drop. A lease can be acquired for a
    /// port that is not open; `PortLease::port_mut` reports that case.
    pub async fn acquire(&self, path: &str) -> Result<PortLease> {
        let handle = self.get_or_create_handle(path).await;

        match timeout(self.wait_timeout, handle.lock_owned()).await {
            Ok(guard) => {
                tracing::debug!(port = %path, "Port lease acquired");
                Ok(PortLease {
                    path: path.to_string(),
                    guard,
                })
            }
            Err(_) => {
                tracing::warn!(
                    port = %path,
                    timeout_ms = self.wait_timeout.as_millis(),
                    "Port lease timeout - command already in flight"
                );
                Err(Error::PortBusy(path.to_string()))
            }
        }
    }

    async fn get_or_create_handle(&self, path: &str) -> Handle {
        {
            let ports = self.ports.read().await;
            if let Some(handle) = ports.get(path) {
                return handle.clone();
            }
        }

        let mut ports = self.ports.write().await;
        ports
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Registered port count (debug)
    pub async fn port_count(&self) -> usize {
        self.ports.read().await.len()
    }

    /// Register a pre-built handle without touching real hardware.
    #[cfg(test)]
    pub(crate) async fn insert(&self, path: &str, port: Box<dyn SerialPort>) {
        let handle = self.get_or_create_handle(path).await;
        *handle.lock().await = Some(port);
    }
}

impl Default for PortManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive port lease - releases on drop
pub struct PortLease {
    path: String,
    guard: OwnedMutexGuard<Option<Box<dyn SerialPort>>>,
}

impl PortLease {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Mutable access to the underlying handle, or `PortUnavailable`
    /// when the port was never opened (or has been closed).
    pub fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        let path = self.path.clone();
        self.guard
            .as_mut()
            .ok_or(Error::PortUnavailable(path))
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        tracing::debug!(port = %self.path, "Port lease released");
    }
}
