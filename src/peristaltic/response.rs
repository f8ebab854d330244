//! 10-byte telemetry response decoding
//!
//! Two frame generations exist in the field, differing only in whether the
//! checksum byte precedes or follows the end marker:
//!
//! - `ChecksumBeforeEtx`: STX, ADDR, VALUE(6), CS, ETX
//! - `ChecksumAfterEtx`:  STX, ADDR, VALUE(6), ETX, CS
//!
//! どちらが現行ハードウェアの正か不明なため設定で選択する（既定は自動判別）。
//! The checksum covers the address and value field (bytes 1-7) in both.

use super::frame::{xor_checksum, ETX, STX};
use crate::error::{Error, Result};

/// Fixed response frame length
pub const RESPONSE_FRAME_LEN: usize = 10;

/// Concrete response frame layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLayout {
    /// Checksum at offset 8, ETX at offset 9
    ChecksumBeforeEtx,
    /// ETX at offset 8, checksum at offset 9
    ChecksumAfterEtx,
}

/// Configured layout expectation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutSetting {
    /// Detect the layout from the marker positions
    Auto,
    Fixed(ResponseLayout),
}

impl std::str::FromStr for LayoutSetting {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(LayoutSetting::Auto),
            "cs-before-etx" => Ok(LayoutSetting::Fixed(ResponseLayout::ChecksumBeforeEtx)),
            "cs-after-etx" => Ok(LayoutSetting::Fixed(ResponseLayout::ChecksumAfterEtx)),
            other => Err(format!("Unknown response layout: {}", other)),
        }
    }
}

/// Decoded telemetry response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Telemetry {
    /// Protocol address echoed by the pump
    pub address: u8,
    /// Decoded signed telemetry value (current or RPM)
    pub value: i32,
    /// Layout the frame actually used
    pub layout: ResponseLayout,
}

/// Decode a 10-byte response frame.
///
/// Marker validation first, then checksum (recomputed, never cached),
/// then the ASCII numeric field. Both the current-reading and RPM-reading
/// queries share this decoder.
pub fn decode(raw: &[u8], setting: LayoutSetting) -> Result<Telemetry> {
    if raw.len() != RESPONSE_FRAME_LEN {
        return Err(Error::Parse(format!(
            "Response frame must be {} bytes, got {}",
            RESPONSE_FRAME_LEN,
            raw.len()
        )));
    }
    if raw[0] != STX {
        return Err(Error::Parse("Missing start marker".to_string()));
    }

    let layout = detect_layout(raw, setting)?;
    let checksum_byte = match layout {
        ResponseLayout::ChecksumBeforeEtx => raw[8],
        ResponseLayout::ChecksumAfterEtx => raw[9],
    };

    let expected = xor_checksum(&raw[1..8]);
    if checksum_byte != expected {
        return Err(Error::Checksum {
            expected,
            actual: checksum_byte,
        });
    }

    let address = raw[1].wrapping_sub(b'0');
    let value = decode_value(&raw[2..8])?;

    Ok(Telemetry {
        address,
        value,
        layout,
    })
}

fn detect_layout(raw: &[u8], setting: LayoutSetting) -> Result<ResponseLayout> {
    match setting {
        LayoutSetting::Fixed(layout) => {
            let etx_offset = match layout {
                ResponseLayout::ChecksumBeforeEtx => 9,
                ResponseLayout::ChecksumAfterEtx => 8,
            };
            if raw[etx_offset] != ETX {
                return Err(Error::Parse(format!(
                    "Missing end marker at offset {}",
                    etx_offset
                )));
            }
            Ok(layout)
        }
        LayoutSetting::Auto => {
            if raw[9] == ETX {
                Ok(ResponseLayout::ChecksumBeforeEtx)
            } else if raw[8] == ETX {
                Ok(ResponseLayout::ChecksumAfterEtx)
            } else {
                Err(Error::Parse("Missing end marker".to_string()))
            }
        }
    }
}

/// Decode the 6-character ASCII telemetry field. The first character may
/// carry a sign; everything else must be a digit.
fn decode_value(field: &[u8]) -> Result<i32> {
    let text = std::str::from_utf8(field)
        .map_err(|_| Error::Parse("Telemetry field is not ASCII".to_string()))?;

    let valid = text
        .char_indices()
        .all(|(i, c)| c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+')));
    if !valid {
        return Err(Error::Parse(format!(
            "Telemetry field {:?} is not numeric",
            text
        )));
    }

    text.parse::<i32>()
        .map_err(|_| Error::Parse(format!("Telemetry field {:?} is not numeric", text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_response(address: u8, field: &[u8; 6], layout: ResponseLayout) -> [u8; 10] {
        let mut raw = [0u8; 10];
        raw[0] = STX;
        raw[1] = b'0' + address;
        raw[2..8].copy_from_slice(field);
        let cs = xor_checksum(&raw[1..8]);
        match layout {
            ResponseLayout::ChecksumBeforeEtx => {
                raw[8] = cs;
                raw[9] = ETX;
            }
            ResponseLayout::ChecksumAfterEtx => {
                raw[8] = ETX;
                raw[9] = cs;
            }
        }
        raw
    }

    #[test]
    fn test_decode_checksum_before_etx() {
        let raw = build_response(2, b"001250", ResponseLayout::ChecksumBeforeEtx);
        let telemetry = decode(&raw, LayoutSetting::Auto).unwrap();

        assert_eq!(telemetry.address, 2);
        assert_eq!(telemetry.value, 1250);
        assert_eq!(telemetry.layout, ResponseLayout::ChecksumBeforeEtx);
    }

    #[test]
    fn test_decode_checksum_after_etx() {
        let raw = build_response(1, b"000042", ResponseLayout::ChecksumAfterEtx);
        let telemetry = decode(&raw, LayoutSetting::Auto).unwrap();

        assert_eq!(telemetry.value, 42);
        assert_eq!(telemetry.layout, ResponseLayout::ChecksumAfterEtx);
    }

    #[test]
    fn test_decode_negative_value() {
        let raw = build_response(3, b"-00150", ResponseLayout::ChecksumBeforeEtx);
        let telemetry = decode(&raw, LayoutSetting::Auto).unwrap();
        assert_eq!(telemetry.value, -150);
    }

    #[test]
    fn test_single_bit_flip_yields_checksum_error() {
        let raw = build_response(2, b"001250", ResponseLayout::ChecksumBeforeEtx);
        for bit in 0..8 {
            let mut corrupted = raw;
            corrupted[4] ^= 1 << bit;
            assert!(matches!(
                decode(&corrupted, LayoutSetting::Auto),
                Err(Error::Checksum { .. })
            ));
        }
    }

    #[test]
    fn test_non_numeric_field_yields_parse_error() {
        let mut raw = [0u8; 10];
        raw[0] = STX;
        raw[1] = b'1';
        raw[2..8].copy_from_slice(b"00AB00");
        raw[8] = xor_checksum(&raw[1..8]);
        raw[9] = ETX;

        assert!(matches!(
            decode(&raw, LayoutSetting::Auto),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_missing_markers_rejected() {
        let mut raw = build_response(1, b"000001", ResponseLayout::ChecksumBeforeEtx);
        raw[9] = 0x00;
        raw[8] = 0x00;
        assert!(matches!(
            decode(&raw, LayoutSetting::Auto),
            Err(Error::Parse(_))
        ));

        let raw = build_response(1, b"000001", ResponseLayout::ChecksumAfterEtx);
        // Fixed expectation disagrees with the frame on the wire
        assert!(decode(
            &raw,
            LayoutSetting::Fixed(ResponseLayout::ChecksumBeforeEtx)
        )
        .is_err());
    }

    #[test]
    fn test_layout_setting_parse() {
        assert_eq!("auto".parse::<LayoutSetting>(), Ok(LayoutSetting::Auto));
        assert_eq!(
            "cs-before-etx".parse::<LayoutSetting>(),
            Ok(LayoutSetting::Fixed(ResponseLayout::ChecksumBeforeEtx))
        );
        assert_eq!(
            "cs-after-etx".parse::<LayoutSetting>(),
            Ok(LayoutSetting::Fixed(ResponseLayout::ChecksumAfterEtx))
        );
        assert!("csum".parse::<LayoutSetting>().is_err());
    }
}
