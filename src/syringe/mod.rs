//! SyringeBank - variable-frame pump protocol on one shared serial port
//!
//! ## Responsibilities
//!
//! - ASCII command vocabulary composed as strings, not binary opcodes
//! - Frame build: STX + ADDR + 0x31 + COMMAND + ETX + trailing checksum
//! - One persistent controller per pump slot
//!
//! チェックサムはSTXからETXまで（両マーカーを含む）全バイトのXOR。
//! 送信に失敗してもフレームは常に返す（監査表示のため）。

use crate::error::{Error, Result};
use crate::port_manager::PortManager;
use std::sync::Arc;

/// Start marker
pub const STX: u8 = 0x02;
/// End marker
pub const ETX: u8 = 0x03;
/// Fixed separator byte between address and command body
pub const SEPARATOR: u8 = 0x31;

/// Syringe command vocabulary. New commands are added by composing
/// strings here rather than extending the frame format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyringeCommand {
    /// Home / initialize the plunger
    Initialize,
    /// Move the plunger up by N steps
    MoveUp(u32),
    /// Move the plunger down by N steps
    MoveDown(u32),
    /// Stop the current motion
    Stop,
    /// Repeat a down/up cycle `count` times
    Loop { down: u32, up: u32, count: u32 },
    /// Query device status
    StatusQuery,
}

impl SyringeCommand {
    /// The ASCII command string carried in the frame body
    pub fn to_command_string(&self) -> String {
        match self {
            SyringeCommand::Initialize => "ZR".to_string(),
            SyringeCommand::MoveUp(steps) => format!("D{}R", steps),
            SyringeCommand::MoveDown(steps) => format!("P{}R", steps),
            SyringeCommand::Stop => "TR".to_string(),
            SyringeCommand::Loop { down, up, count } => {
                format!("gP{}D{}G{}R", down, up, count)
            }
            SyringeCommand::StatusQuery => "Q".to_string(),
        }
    }
}

/// Build the variable-length command frame for one command string.
///
/// Layout: STX, one ASCII address byte, separator 0x31, the command
/// encoded as ASCII, ETX, then the XOR checksum over every preceding
/// byte including both markers.
pub fn build_frame(command: &str, address: u8) -> Result<Vec<u8>> {
    if !(1..=9).contains(&address) {
        return Err(Error::Validation(format!(
            "Syringe address {} out of range 1..=9",
            address
        )));
    }
    if !command.is_ascii() || command.is_empty() {
        return Err(Error::Validation(format!(
            "Syringe command {:?} must be non-empty ASCII",
            command
        )));
    }

    let mut frame = Vec::with_capacity(command.len() + 4);
    frame.push(STX);
    frame.push(b'0' + address);
    frame.push(SEPARATOR);
    frame.extend_from_slice(command.as_bytes());
    frame.push(ETX);
    let checksum = frame.iter().fold(0u8, |acc, b| acc ^ b);
    frame.push(checksum);
    Ok(frame)
}

/// One controller bound to a single pump slot and the shared port
pub struct SyringePumpController {
    pump_number: u8,
    port_path: String,
    ports: Arc<PortManager>,
}

impl SyringePumpController {
    pub fn new(pump_number: u8, port_path: String, ports: Arc<PortManager>) -> Self {
        Self {
            pump_number,
            port_path,
            ports,
        }
    }

    pub fn pump_number(&self) -> u8 {
        self.pump_number
    }

    /// Send a command string to the given protocol address.
    ///
    /// The attempted frame bytes are always returned, even when the
    /// transmit fails, so the caller can display the command regardless
    /// of hardware state.
    pub async fn send(&self, command: &str, address: u8) -> (Result<()>, Vec<u8>) {
        let frame = match build_frame(command, address) {
            Ok(frame) => frame,
            Err(e) => return (Err(e), Vec::new()),
        };

        let outcome = self.transmit(&frame).await;
        match &outcome {
            Ok(()) => {
                tracing::info!(
                    pump = self.pump_number,
                    address = address,
                    port = %self.port_path,
                    frame = %hex_string(&frame),
                    "Syringe command sent"
                );
            }
            Err(e) => {
                tracing::warn!(
                    pump = self.pump_number,
                    address = address,
                    port = %self.port_path,
                    frame = %hex_string(&frame),
                    error = %e,
                    "Syringe command transmit failed"
                );
            }
        }
        (outcome, frame)
    }

    async fn transmit(&self, frame: &[u8]) -> Result<()> {
        let mut lease = self.ports.acquire(&self.port_path).await?;
        let path = lease.path().to_string();
        let port = lease.port_mut()?;
        port.write_all(frame)
            .map_err(|e| Error::Transmit(format!("{}: {}", path, e)))?;
        Ok(())
    }
}

/// SyringeBank - persistent controllers for the deployed pump slots
pub struct SyringeBank {
    controllers: Vec<SyringePumpController>,
}

impl SyringeBank {
    pub fn new(pump_count: u8, port_path: String, ports: Arc<PortManager>) -> Self {
        let controllers = (1..=pump_count)
            .map(|n| SyringePumpController::new(n, port_path.clone(), ports.clone()))
            .collect();
        Self { controllers }
    }

    pub fn pump_count(&self) -> usize {
        self.controllers.len()
    }

    /// Controller for a logical pump id (1..=N)
    pub fn controller(&self, pump_id: u8) -> Result<&SyringePumpController> {
        self.controllers
            .get(pump_id.checked_sub(1).unwrap_or(u8::MAX) as usize)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "Syringe pump id {} out of configured range 1..={}",
                    pump_id,
                    self.controllers.len()
                ))
            })
    }
}

/// Space-separated uppercase hex for audit logging
pub fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout_and_checksum() {
        // For "ZR" at address 1 the checksum is the XOR of
        // 0x02, '1', 0x31, 'Z', 'R', 0x03
        let frame = build_frame("ZR", 1).unwrap();
        let expected_cs = 0x02 ^ b'1' ^ 0x31 ^ b'Z' ^ b'R' ^ 0x03;

        assert_eq!(frame[0], STX);
        assert_eq!(frame[1], b'1');
        assert_eq!(frame[2], SEPARATOR);
        assert_eq!(&frame[3..5], b"ZR");
        assert_eq!(frame[5], ETX);
        assert_eq!(frame[6], expected_cs);
        assert_eq!(frame.len(), 7);
    }

    #[test]
    fn test_variable_length_frames() {
        let short = build_frame("Q", 2).unwrap();
        let long = build_frame("gP300D300G5R", 2).unwrap();
        assert_eq!(short.len(), 1 + 1 + 1 + 1 + 1 + 1);
        assert_eq!(long.len(), 12 + 5);
    }

    #[test]
    fn test_command_vocabulary() {
        assert_eq!(SyringeCommand::Initialize.to_command_string(), "ZR");
        assert_eq!(SyringeCommand::MoveUp(250).to_command_string(), "D250R");
        assert_eq!(SyringeCommand::MoveDown(250).to_command_string(), "P250R");
        assert_eq!(SyringeCommand::Stop.to_command_string(), "TR");
        assert_eq!(
            SyringeCommand::Loop {
                down: 300,
                up: 300,
                count: 5
            }
            .to_command_string(),
            "gP300D300G5R"
        );
        assert_eq!(SyringeCommand::StatusQuery.to_command_string(), "Q");
    }

    #[test]
    fn test_invalid_input_rejected() {
        assert!(build_frame("ZR", 0).is_err());
        assert!(build_frame("ZR", 10).is_err());
        assert!(build_frame("", 1).is_err());
        assert!(build_frame("ZÄR", 1).is_err());
    }

    #[tokio::test]
    async fn test_send_returns_frame_even_on_transmit_failure() {
        // Port never opened: transmit fails but the frame must come back
        let ports = Arc::new(PortManager::new());
        let controller =
            SyringePumpController::new(1, "/dev/ttyTEST".to_string(), ports);

        let (outcome, frame) = controller.send("ZR", 1).await;
        assert!(outcome.is_err());
        assert_eq!(frame, build_frame("ZR", 1).unwrap());
    }

    #[test]
    fn test_bank_resolves_controllers() {
        let ports = Arc::new(PortManager::new());
        let bank = SyringeBank::new(6, "/dev/ttyTEST".to_string(), ports);

        assert_eq!(bank.pump_count(), 6);
        assert_eq!(bank.controller(1).unwrap().pump_number(), 1);
        assert_eq!(bank.controller(6).unwrap().pump_number(), 6);
        assert!(bank.controller(0).is_err());
        assert!(bank.controller(7).is_err());
    }
}
