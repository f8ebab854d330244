//! PeristalticBus - fixed-frame pump protocol over multiple serial ports
//!
//! ## Responsibilities
//!
//! - Logical pump id → (physical port, protocol address) remapping
//! - Command frame build / build-and-send with audit logging
//! - Telemetry readback (current, RPM) with bounded polling
//!
//! ポンプはポートごとに固定サイズのグループへ分割される。ワイヤ上の
//! アドレスは常にグループ内の位置（1..k）であり、論理IDそのものではない。

pub mod frame;
pub mod response;

use crate::error::{Error, Result};
use crate::port_manager::PortManager;
use frame::CommandFrame;
use response::{LayoutSetting, Telemetry, RESPONSE_FRAME_LEN};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Telemetry query kinds sharing the response decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryKind {
    Current,
    Rpm,
}

impl TelemetryKind {
    /// Action character of the query command
    pub fn action_code(&self) -> char {
        match self {
            TelemetryKind::Current => 'C',
            TelemetryKind::Rpm => 'R',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::Current => "current",
            TelemetryKind::Rpm => "rpm",
        }
    }
}

/// Logical-id → (port, in-group address) mapping
#[derive(Debug, Clone)]
pub struct PumpAddressMap {
    ports: Vec<String>,
    group_size: usize,
}

impl PumpAddressMap {
    pub fn new(ports: Vec<String>, group_size: usize) -> Result<Self> {
        if ports.is_empty() {
            return Err(Error::Validation(
                "At least one peristaltic port must be configured".to_string(),
            ));
        }
        if !(1..=9).contains(&group_size) {
            // the wire address is a single ASCII digit
            return Err(Error::Validation(format!(
                "Pumps per port must be 1..=9, got {}",
                group_size
            )));
        }
        Ok(Self { ports, group_size })
    }

    /// Total logical pump count
    pub fn pump_count(&self) -> usize {
        self.ports.len() * self.group_size
    }

    /// Resolve a logical pump id to its port path and protocol address.
    /// Ids outside the configured range are rejected before any I/O.
    pub fn resolve(&self, pump_id: u8) -> Result<(&str, u8)> {
        let id = pump_id as usize;
        if id == 0 || id > self.pump_count() {
            return Err(Error::Validation(format!(
                "Pump id {} out of configured range 1..={}",
                pump_id,
                self.pump_count()
            )));
        }
        let group = (id - 1) / self.group_size;
        let address = ((id - 1) % self.group_size + 1) as u8;
        Ok((self.ports[group].as_str(), address))
    }
}

/// PeristalticBus instance
pub struct PeristalticBus {
    map: PumpAddressMap,
    ports: Arc<PortManager>,
    telemetry_timeout: Duration,
    poll_interval: Duration,
    layout: LayoutSetting,
}

impl PeristalticBus {
    pub fn new(
        map: PumpAddressMap,
        ports: Arc<PortManager>,
        telemetry_timeout: Duration,
        poll_interval: Duration,
        layout: LayoutSetting,
    ) -> Self {
        Self {
            map,
            ports,
            telemetry_timeout,
            poll_interval,
            layout,
        }
    }

    pub fn pump_count(&self) -> usize {
        self.map.pump_count()
    }

    /// Pure frame construction: resolves the mapping and builds the frame
    /// without touching any port, so callers can always inspect what would
    /// be sent.
    pub fn build(&self, pump_id: u8, action: char, value: u32) -> Result<(String, u8, CommandFrame)> {
        let (port, address) = self.map.resolve(pump_id)?;
        let frame = CommandFrame::build(address, action, value)?;
        Ok((port.to_string(), address, frame))
    }

    /// Build a frame and transmit it on the pump's port.
    pub async fn build_and_send(
        &self,
        pump_id: u8,
        action: char,
        value: u32,
    ) -> Result<(String, u8, CommandFrame)> {
        let (port_path, address, frame) = self.build(pump_id, action, value)?;
        self.send_frame(&port_path, &frame, pump_id).await?;
        Ok((port_path, address, frame))
    }

    /// Transmit an already-built frame, so callers that need the frame
    /// bytes regardless of the transmit outcome build once and send once.
    pub async fn send_frame(
        &self,
        port_path: &str,
        frame: &CommandFrame,
        pump_id: u8,
    ) -> Result<()> {
        let mut lease = self.ports.acquire(port_path).await?;
        self.write_frame(&mut lease, frame, pump_id)
    }

    /// Send a telemetry query and decode the 10-byte response.
    ///
    /// After the query goes out, the port's inbound byte count is polled at
    /// a fixed interval until at least one full response frame is available
    /// or the timeout elapses (`NoResponse`).
    pub async fn read_telemetry(&self, pump_id: u8, kind: TelemetryKind) -> Result<Telemetry> {
        let (port_path, _address, frame) = self.build(pump_id, kind.action_code(), 0)?;

        let mut lease = self.ports.acquire(&port_path).await?;

        // 前回クエリの残りバイトが今回の応答を壊さないように捨てる
        {
            let port = lease.port_mut()?;
            let _ = port.clear(serialport::ClearBuffer::Input);
        }

        self.write_frame(&mut lease, &frame, pump_id)?;

        let deadline = Instant::now() + self.telemetry_timeout;
        loop {
            let available = {
                let port = lease.port_mut()?;
                port.bytes_to_read()? as usize
            };
            if available >= RESPONSE_FRAME_LEN {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    pump = pump_id,
                    port = %port_path,
                    timeout_ms = self.telemetry_timeout.as_millis(),
                    "Telemetry poll timed out"
                );
                return Err(Error::NoResponse);
            }
            sleep(self.poll_interval).await;
        }

        let mut raw = [0u8; RESPONSE_FRAME_LEN];
        {
            let port = lease.port_mut()?;
            port.read_exact(&mut raw)
                .map_err(|e| Error::Transmit(format!("Response read failed: {}", e)))?;
        }

        let telemetry = response::decode(&raw, self.layout)?;
        tracing::debug!(
            pump = pump_id,
            kind = kind.as_str(),
            value = telemetry.value,
            layout = ?telemetry.layout,
            "Telemetry decoded"
        );
        Ok(telemetry)
    }

    /// Write a frame through a held lease, logging the full hex frame and
    /// target port on every send regardless of the caller.
    fn write_frame(
        &self,
        lease: &mut crate::port_manager::PortLease,
        frame: &CommandFrame,
        pump_id: u8,
    ) -> Result<()> {
        let path = lease.path().to_string();
        let port = lease.port_mut()?;
        port.write_all(frame.as_bytes())
            .map_err(|e| Error::Transmit(format!("{}: {}", path, e)))?;

        tracing::info!(
            pump = pump_id,
            port = %path,
            frame = %frame.to_hex(),
            "Pump command sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_port_map() -> PumpAddressMap {
        PumpAddressMap::new(
            vec!["/dev/ttyUSB0".to_string(), "/dev/ttyUSB1".to_string()],
            3,
        )
        .unwrap()
    }

    #[test]
    fn test_group_remapping() {
        let map = two_port_map();

        // Port serving ids 4-6 with group size 3
        assert_eq!(map.resolve(4).unwrap(), ("/dev/ttyUSB1", 1));
        assert_eq!(map.resolve(5).unwrap(), ("/dev/ttyUSB1", 2));
        assert_eq!(map.resolve(6).unwrap(), ("/dev/ttyUSB1", 3));

        assert_eq!(map.resolve(1).unwrap(), ("/dev/ttyUSB0", 1));
        assert_eq!(map.resolve(3).unwrap(), ("/dev/ttyUSB0", 3));
    }

    #[test]
    fn test_out_of_range_ids_rejected() {
        let map = two_port_map();
        assert!(map.resolve(0).is_err());
        assert!(map.resolve(7).is_err());
    }

    #[test]
    fn test_invalid_group_size_rejected() {
        assert!(PumpAddressMap::new(vec!["/dev/ttyUSB0".to_string()], 0).is_err());
        assert!(PumpAddressMap::new(vec!["/dev/ttyUSB0".to_string()], 10).is_err());
        assert!(PumpAddressMap::new(vec![], 3).is_err());
    }

    fn test_bus_with(ports: Arc<PortManager>) -> PeristalticBus {
        PeristalticBus::new(
            two_port_map(),
            ports,
            Duration::from_millis(100),
            Duration::from_millis(10),
            LayoutSetting::Auto,
        )
    }

    fn test_bus() -> PeristalticBus {
        test_bus_with(Arc::new(PortManager::new()))
    }

    #[test]
    fn test_build_works_with_closed_ports() {
        let bus = test_bus();

        let (port, address, frame) = bus.build(5, 'M', 1500).unwrap();
        assert_eq!(port, "/dev/ttyUSB1");
        assert_eq!(address, 2);
        assert_eq!(frame.address(), 2);
        assert_eq!(frame.action(), 'M');
        assert_eq!(frame.value(), 1500);
    }

    #[tokio::test]
    async fn test_send_to_unmapped_pump_never_touches_a_port() {
        let bus = test_bus();

        let result = bus.build_and_send(7, 'M', 0).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_send_on_unopened_port_fails_cleanly() {
        let bus = test_bus();

        let result = bus.build_and_send(1, 'S', 0).await;
        assert!(matches!(result, Err(Error::PortUnavailable(_))));
    }

    #[test]
    fn test_telemetry_query_codes() {
        assert_eq!(TelemetryKind::Current.action_code(), 'C');
        assert_eq!(TelemetryKind::Rpm.action_code(), 'R');
    }

    use crate::port_manager::testing::FakeSerialPort;
    use super::frame::{xor_checksum, ETX, STX};

    fn response_frame(address: u8, field: &[u8; 6]) -> [u8; 10] {
        let mut raw = [0u8; 10];
        raw[0] = STX;
        raw[1] = b'0' + address;
        raw[2..8].copy_from_slice(field);
        raw[8] = xor_checksum(&raw[1..8]);
        raw[9] = ETX;
        raw
    }

    #[tokio::test]
    async fn test_telemetry_times_out_on_a_silent_pump() {
        let ports = Arc::new(PortManager::new());
        let fake = FakeSerialPort::new();
        ports.insert("/dev/ttyUSB0", Box::new(fake.clone())).await;
        let bus = test_bus_with(ports);

        // The pump never answers: the query still goes out, the poll
        // window elapses with zero bytes, and the caller gets NoResponse.
        let result = bus.read_telemetry(1, TelemetryKind::Current).await;
        assert!(matches!(result, Err(Error::NoResponse)));

        let query = CommandFrame::build(1, 'C', 0).unwrap();
        assert_eq!(fake.written(), query.as_bytes());
    }

    #[tokio::test]
    async fn test_telemetry_round_trip_on_a_remapped_pump() {
        let ports = Arc::new(PortManager::new());
        let fake = FakeSerialPort::new();
        ports.insert("/dev/ttyUSB1", Box::new(fake.clone())).await;
        let bus = test_bus_with(ports);

        // Pump 5 lives on the second port as in-group address 2; the
        // scripted device answers the query with a 10-byte frame.
        fake.respond_with(&response_frame(2, b"001250"));

        let telemetry = bus.read_telemetry(5, TelemetryKind::Rpm).await.unwrap();
        assert_eq!(telemetry.address, 2);
        assert_eq!(telemetry.value, 1250);

        let query = CommandFrame::build(2, 'R', 0).unwrap();
        assert_eq!(fake.written(), query.as_bytes());
    }

    #[tokio::test]
    async fn test_send_frame_writes_the_built_frame_once() {
        let ports = Arc::new(PortManager::new());
        let fake = FakeSerialPort::new();
        ports.insert("/dev/ttyUSB1", Box::new(fake.clone())).await;
        let bus = test_bus_with(ports);

        let (port, address, frame) = bus.build(5, 'M', 1500).unwrap();
        assert_eq!(address, 2);
        bus.send_frame(&port, &frame, 5).await.unwrap();

        assert_eq!(fake.written(), frame.as_bytes());
    }

    #[tokio::test]
    async fn test_send_frame_reports_the_failure_reason() {
        let bus = test_bus();

        let (port, _address, frame) = bus.build(1, 'S', 0).unwrap();
        let err = bus.send_frame(&port, &frame, 1).await.unwrap_err();
        assert!(matches!(err, Error::PortUnavailable(_)));
    }
}
