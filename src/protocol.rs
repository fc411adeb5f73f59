//! Feetech STS3215 wire protocol: framing, checksums, register map.
//!
//! The protocol is half-duplex command/response over 8-N-1 serial at
//! 1 000 000 baud. Every frame, command or status, has the shape
//! `[0xFF, 0xFF, id, length, code, params..., checksum]` where `length`
//! counts everything after itself (code + params + checksum) and the
//! checksum is the bitwise NOT of the byte sum from `id` onward.
//!
//! This module only builds and parses byte sequences; it never touches
//! the serial line.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Packet header bytes.
pub const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Broadcast ID addressing every servo on the bus at once.
pub const BROADCAST_ID: u8 = 0xFE;

pub const INST_PING: u8 = 0x01;
pub const INST_READ: u8 = 0x02;
pub const INST_WRITE: u8 = 0x03;
pub const INST_SYNC_WRITE: u8 = 0x83;

// Register addresses for STS3215. All values written through this
// runtime are 2 bytes, little-endian.
pub const ADDR_MIN_POSITION_LIMIT: u8 = 9;
pub const ADDR_MAX_POSITION_LIMIT: u8 = 11;
pub const ADDR_HOMING_OFFSET: u8 = 31;
pub const ADDR_TORQUE_ENABLE: u8 = 40;
pub const ADDR_GOAL_POSITION: u8 = 42;
pub const ADDR_PRESENT_POSITION: u8 = 56;

/// Position resolution: 12-bit, 0..=4095.
pub const RESOLUTION: u16 = 4096;
/// Highest addressable position.
pub const MAX_POSITION: u16 = RESOLUTION - 1;
/// Mechanical midpoint of the position range.
pub const MID_POSITION: u16 = (RESOLUTION - 1) / 2;

/// Largest magnitude representable by the 12-bit sign-magnitude
/// Homing_Offset encoding.
pub const MAX_HOMING_OFFSET: i32 = 0x7FF;

/// A parsed frame. For commands `code` is the instruction; for status
/// responses it is the servo's error byte (0 = success).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u8,
    pub code: u8,
    pub params: Vec<u8>,
}

/// Feetech checksum: `~(id + length + code + Σ params) & 0xFF`.
///
/// `data` covers everything between the header and the checksum byte.
pub fn checksum(data: &[u8]) -> u8 {
    let sum: u32 = data.iter().map(|&b| b as u32).sum();
    !(sum as u8)
}

/// Build a complete frame for `id` with the given instruction and params.
pub fn build_frame(id: u8, instruction: u8, params: &[u8]) -> Vec<u8> {
    let length = (params.len() + 2) as u8; // instruction + checksum
    let mut packet = Vec::with_capacity(6 + params.len());
    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push(length);
    packet.push(instruction);
    packet.extend_from_slice(params);
    packet.push(checksum(&packet[2..]));
    packet
}

/// READ_DATA frame: read `count` bytes starting at `addr`.
pub fn build_read(id: u8, addr: u8, count: u8) -> Vec<u8> {
    build_frame(id, INST_READ, &[addr, count])
}

/// WRITE_DATA frame for a 2-byte register, value little-endian.
pub fn build_write_u16(id: u8, addr: u8, value: u16) -> Vec<u8> {
    let mut bytes = [0u8; 2];
    LittleEndian::write_u16(&mut bytes, value);
    build_frame(id, INST_WRITE, &[addr, bytes[0], bytes[1]])
}

/// PING frame, no params.
pub fn build_ping(id: u8) -> Vec<u8> {
    build_frame(id, INST_PING, &[])
}

/// SYNC_WRITE frame writing the same 2-byte register on many servos.
pub fn build_sync_write_u16(addr: u8, targets: &[(u8, u16)]) -> Vec<u8> {
    let mut params = Vec::with_capacity(2 + targets.len() * 3);
    params.push(addr);
    params.push(2); // bytes per servo
    for &(id, value) in targets {
        let mut bytes = [0u8; 2];
        LittleEndian::write_u16(&mut bytes, value);
        params.push(id);
        params.push(bytes[0]);
        params.push(bytes[1]);
    }
    build_frame(BROADCAST_ID, INST_SYNC_WRITE, &params)
}

/// Status frame as a servo would produce it. `error` 0 means success.
/// Used by in-memory transports and tests to fabricate responses.
pub fn build_status(id: u8, error: u8, params: &[u8]) -> Vec<u8> {
    build_frame(id, error, params)
}

/// Parse one frame from `bytes`, validating header, declared length and
/// checksum. Trailing bytes beyond the declared length are ignored.
pub fn parse_frame(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < 6 {
        return Err(Error::Protocol {
            id: 0,
            reason: format!("frame too short ({} bytes)", bytes.len()),
        });
    }
    if bytes[0..2] != HEADER {
        return Err(Error::Protocol {
            id: 0,
            reason: format!("bad header {:02X} {:02X}", bytes[0], bytes[1]),
        });
    }
    let id = bytes[2];
    let length = bytes[3] as usize;
    if length < 2 || bytes.len() < 4 + length {
        return Err(Error::Protocol {
            id,
            reason: format!("declared length {length} exceeds {} received bytes", bytes.len()),
        });
    }
    let code = bytes[4];
    let params = bytes[5..4 + length - 1].to_vec();
    let received = bytes[4 + length - 1];
    let computed = checksum(&bytes[2..4 + length - 1]);
    if received != computed {
        return Err(Error::Protocol {
            id,
            reason: format!("checksum mismatch: expected {computed:#04x}, got {received:#04x}"),
        });
    }
    Ok(Frame { id, code, params })
}

/// Decode the 2-byte little-endian value of a status frame's params.
pub fn read_u16_param(frame: &Frame) -> Result<u16> {
    if frame.params.len() < 2 {
        return Err(Error::Protocol {
            id: frame.id,
            reason: format!("expected 2 param bytes, got {}", frame.params.len()),
        });
    }
    Ok(LittleEndian::read_u16(&frame.params[..2]))
}

/// Encode a signed homing offset into the servo's 12-bit sign-magnitude
/// format: bit 11 is the sign, bits 0–10 the magnitude.
pub fn encode_sign_magnitude(value: i32) -> Result<u16> {
    if value.abs() > MAX_HOMING_OFFSET {
        return Err(Error::Configuration(format!(
            "homing offset {value} out of range ±{MAX_HOMING_OFFSET}"
        )));
    }
    let magnitude = value.unsigned_abs() as u16;
    if value < 0 {
        Ok(magnitude | 0x800)
    } else {
        Ok(magnitude)
    }
}

/// Decode a 12-bit sign-magnitude word back into a signed value.
pub fn decode_sign_magnitude(word: u16) -> i32 {
    let magnitude = (word & 0x7FF) as i32;
    if word & 0x800 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_formula() {
        // ~(1 + 4 + 3 + 30 + 0 + 2) = ~40 = 215
        assert_eq!(checksum(&[1, 4, 0x03, 30, 0, 2]), 215);
    }

    #[test]
    fn write_frame_round_trips() {
        for (id, addr, value) in [(1u8, 42u8, 0u16), (3, 31, 0x0801), (6, 11, 4095)] {
            let packet = build_write_u16(id, addr, value);
            let frame = parse_frame(&packet).unwrap();
            assert_eq!(frame.id, id);
            assert_eq!(frame.code, INST_WRITE);
            assert_eq!(frame.params[0], addr);
            assert_eq!(
                u16::from_le_bytes([frame.params[1], frame.params[2]]),
                value
            );
        }
    }

    #[test]
    fn write_checksum_closed_form() {
        let id = 2u8;
        let (addr, lo, hi) = (31u8, 0x01u8, 0x08u8);
        let packet = build_write_u16(id, addr, 0x0801);
        let expected =
            !(id as u32 + 5 + 3 + addr as u32 + lo as u32 + hi as u32) as u8;
        assert_eq!(*packet.last().unwrap(), expected);
    }

    #[test]
    fn read_frame_shape() {
        let packet = build_read(1, ADDR_PRESENT_POSITION, 2);
        assert_eq!(packet, vec![0xFF, 0xFF, 1, 4, 0x02, 56, 2, !(1u32 + 4 + 2 + 56 + 2) as u8]);
    }

    #[test]
    fn parse_rejects_corrupt_checksum() {
        let mut packet = build_write_u16(1, 42, 2048);
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        assert!(matches!(
            parse_frame(&packet),
            Err(Error::Protocol { id: 1, .. })
        ));
    }

    #[test]
    fn parse_rejects_truncated_frame() {
        let packet = build_write_u16(1, 42, 2048);
        assert!(parse_frame(&packet[..5]).is_err());
    }

    #[test]
    fn parse_ignores_trailing_garbage() {
        let mut packet = build_status(4, 0, &[0x00, 0x08]);
        packet.extend_from_slice(&[0xAA, 0xBB]);
        let frame = parse_frame(&packet).unwrap();
        assert_eq!(frame.id, 4);
        assert_eq!(read_u16_param(&frame).unwrap(), 2048);
    }

    #[test]
    fn sign_magnitude_round_trips() {
        for v in -2047..=2047 {
            assert_eq!(decode_sign_magnitude(encode_sign_magnitude(v).unwrap()), v);
        }
    }

    #[test]
    fn sign_magnitude_known_values() {
        assert_eq!(encode_sign_magnitude(0).unwrap(), 0);
        assert_eq!(encode_sign_magnitude(53).unwrap(), 53);
        assert_eq!(encode_sign_magnitude(-1).unwrap(), 0x801);
        assert_eq!(encode_sign_magnitude(-2047).unwrap(), 0xFFF);
        assert_eq!(decode_sign_magnitude(0x801), -1);
    }

    #[test]
    fn sign_magnitude_rejects_overflow() {
        assert!(encode_sign_magnitude(2048).is_err());
        assert!(encode_sign_magnitude(-2048).is_err());
    }

    #[test]
    fn sync_write_layout() {
        let packet = build_sync_write_u16(ADDR_GOAL_POSITION, &[(1, 2048), (2, 1000)]);
        let frame = parse_frame(&packet).unwrap();
        assert_eq!(frame.id, BROADCAST_ID);
        assert_eq!(frame.code, INST_SYNC_WRITE);
        assert_eq!(frame.params, vec![42, 2, 1, 0x00, 0x08, 2, 0xE8, 0x03]);
    }
}
