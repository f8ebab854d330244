//! Fixed 11-byte command frame for the peristaltic pump protocol
//!
//! Layout: STX(0x02) + [ADDR ASCII digit] + [ACTION ASCII] + [VALUE 6 ASCII
//! digits, zero-padded] + [CS: XOR of bytes 1-8] + ETX(0x03)

use crate::error::{Error, Result};

/// Start marker
pub const STX: u8 = 0x02;
/// End marker
pub const ETX: u8 = 0x03;
/// Fixed command frame length
pub const COMMAND_FRAME_LEN: usize = 11;
/// Width of the zero-padded decimal value field
pub const VALUE_WIDTH: usize = 6;
/// Largest value the 6-digit field can carry
pub const MAX_VALUE: u32 = 999_999;

/// XOR of all bytes in the slice
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// One validated 11-byte command frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    bytes: [u8; COMMAND_FRAME_LEN],
}

impl CommandFrame {
    /// Build a frame from a protocol address (1..=9), a single ASCII action
    /// character and a value. The checksum is computed here, every time.
    pub fn build(address: u8, action: char, value: u32) -> Result<Self> {
        if !(1..=9).contains(&address) {
            return Err(Error::Validation(format!(
                "Protocol address {} out of range 1..=9",
                address
            )));
        }
        if !action.is_ascii_graphic() {
            return Err(Error::Validation(format!(
                "Action code {:?} is not a printable ASCII character",
                action
            )));
        }
        if value > MAX_VALUE {
            return Err(Error::Validation(format!(
                "Value {} exceeds the 6-digit field (max {})",
                value, MAX_VALUE
            )));
        }

        let mut bytes = [0u8; COMMAND_FRAME_LEN];
        bytes[0] = STX;
        bytes[1] = b'0' + address;
        bytes[2] = action as u8;
        let digits = format!("{:0width$}", value, width = VALUE_WIDTH);
        bytes[3..9].copy_from_slice(digits.as_bytes());
        bytes[9] = xor_checksum(&bytes[1..9]);
        bytes[10] = ETX;

        Ok(Self { bytes })
    }

    /// Validate a raw byte sequence as a command frame.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() != COMMAND_FRAME_LEN {
            return Err(Error::Parse(format!(
                "Command frame must be {} bytes, got {}",
                COMMAND_FRAME_LEN,
                raw.len()
            )));
        }
        if raw[0] != STX {
            return Err(Error::Parse("Missing start marker".to_string()));
        }
        if raw[10] != ETX {
            return Err(Error::Parse("Missing end marker".to_string()));
        }
        let expected = xor_checksum(&raw[1..9]);
        if raw[9] != expected {
            return Err(Error::Checksum {
                expected,
                actual: raw[9],
            });
        }
        if !raw[3..9].iter().all(|b| b.is_ascii_digit()) {
            return Err(Error::Parse("Value field is not numeric".to_string()));
        }

        let mut bytes = [0u8; COMMAND_FRAME_LEN];
        bytes.copy_from_slice(raw);
        Ok(Self { bytes })
    }

    /// Protocol address embedded in the frame
    pub fn address(&self) -> u8 {
        self.bytes[1] - b'0'
    }

    /// Action character embedded in the frame
    pub fn action(&self) -> char {
        self.bytes[2] as char
    }

    /// Decoded value field
    pub fn value(&self) -> u32 {
        // build/parse guarantee ASCII digits here
        std::str::from_utf8(&self.bytes[3..9])
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Space-separated uppercase hex, for audit logging
    pub fn to_hex(&self) -> String {
        self.bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_layout() {
        let frame = CommandFrame::build(1, 'M', 42).unwrap();
        let bytes = frame.as_bytes();

        assert_eq!(bytes.len(), COMMAND_FRAME_LEN);
        assert_eq!(bytes[0], STX);
        assert_eq!(bytes[1], b'1');
        assert_eq!(bytes[2], b'M');
        assert_eq!(&bytes[3..9], b"000042");
        assert_eq!(bytes[10], ETX);
    }

    #[test]
    fn test_checksum_is_xor_of_bytes_1_to_8() {
        for (address, action, value) in [(1, 'M', 0), (3, 'S', 999_999), (9, 'F', 123)] {
            let frame = CommandFrame::build(address, action, value).unwrap();
            let bytes = frame.as_bytes();
            let expected = bytes[1..9].iter().fold(0u8, |acc, b| acc ^ b);
            assert_eq!(bytes[9], expected);
        }
    }

    #[test]
    fn test_round_trip() {
        let frame = CommandFrame::build(5, 'R', 6500).unwrap();
        let parsed = CommandFrame::parse(frame.as_bytes()).unwrap();

        assert_eq!(parsed.address(), 5);
        assert_eq!(parsed.action(), 'R');
        assert_eq!(parsed.value(), 6500);
    }

    #[test]
    fn test_parse_rejects_corrupted_checksum() {
        let frame = CommandFrame::build(2, 'M', 100).unwrap();
        let mut raw = frame.as_bytes().to_vec();
        raw[4] ^= 0x01; // flip one payload bit

        assert!(matches!(
            CommandFrame::parse(&raw),
            Err(Error::Checksum { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_non_digit_value_field() {
        // Corrupt a value byte but keep the checksum consistent: the
        // digit check has to catch what the checksum cannot.
        let frame = CommandFrame::build(2, 'M', 100).unwrap();
        let mut raw = frame.as_bytes().to_vec();
        raw[4] = b'A';
        raw[9] = xor_checksum(&raw[1..9]);

        assert!(matches!(CommandFrame::parse(&raw), Err(Error::Parse(_))));
    }

    #[test]
    fn test_build_rejects_invalid_input() {
        assert!(CommandFrame::build(0, 'M', 0).is_err());
        assert!(CommandFrame::build(10, 'M', 0).is_err());
        assert!(CommandFrame::build(1, '\n', 0).is_err());
        assert!(CommandFrame::build(1, 'M', MAX_VALUE + 1).is_err());
    }

    #[test]
    fn test_hex_audit_format() {
        let frame = CommandFrame::build(1, 'S', 0).unwrap();
        let hex = frame.to_hex();
        assert!(hex.starts_with("02 31 53 30"));
        assert!(hex.ends_with("03"));
    }
}
