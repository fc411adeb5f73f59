//! Per-motor register access with the retry discipline the shared
//! half-duplex line needs.
//!
//! STS3215 servos occasionally drop a frame on a busy bus. Rather than
//! failing a whole calibration or teleoperation pass over one silent
//! read, the bus retries with widening timeouts and, in fan-out reads,
//! substitutes the mid-range fallback so callers always get a full
//! vector. Fan-outs pace their frames so responses never collide.

use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol;
use crate::transport::SharedTransport;

/// Read attempts before giving up on a motor.
pub const MAX_RETRIES: u32 = 3;
/// Response window for attempt `k` is `READ_TIMEOUT_STEP * k`.
pub const READ_TIMEOUT_STEP: Duration = Duration::from_millis(100);
/// Pause before attempt `k + 1` is `RETRY_BACKOFF_STEP * k`.
pub const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(50);
/// Gap between frames addressed to different motors.
pub const INTER_MOTOR_DELAY: Duration = Duration::from_millis(10);
/// How long a write waits for the optional ack before moving on.
const WRITE_ACK_TIMEOUT: Duration = Duration::from_millis(200);

/// Substituted when a motor never answers: `floor((RESOLUTION - 1) / 2)`.
pub const FALLBACK_POSITION: u16 = protocol::MID_POSITION;

/// Register access for every servo behind one transport.
///
/// Cloning is cheap; clones share the underlying line and serialize
/// their frame exchanges through it.
#[derive(Clone)]
pub struct MotorBus {
    transport: SharedTransport,
}

impl MotorBus {
    pub fn new(transport: SharedTransport) -> Self {
        Self { transport }
    }

    /// Read Present_Position. Retries up to [`MAX_RETRIES`] times with a
    /// progressive timeout; `None` after the ladder is exhausted.
    pub fn read_position(&self, id: u8) -> Option<u16> {
        for attempt in 1..=MAX_RETRIES {
            match self.try_read_position(id, attempt) {
                Ok(position) => return Some(position),
                Err(err) => {
                    tracing::debug!(motor = id, attempt, %err, "position read failed");
                }
            }
            if attempt < MAX_RETRIES {
                thread::sleep(RETRY_BACKOFF_STEP * attempt);
            }
        }
        tracing::warn!(motor = id, "no response after {MAX_RETRIES} attempts");
        None
    }

    fn try_read_position(&self, id: u8, attempt: u32) -> Result<u16> {
        let mut transport = self.transport.lock().expect("transport mutex poisoned");
        // A late reply from a previous attempt must not be taken for
        // this one's.
        transport.clear_input()?;
        transport.write(&protocol::build_read(id, protocol::ADDR_PRESENT_POSITION, 2))?;
        let response = transport.read_once(READ_TIMEOUT_STEP * attempt)?;
        if response.len() < 7 {
            return Err(Error::Protocol {
                id,
                reason: format!("short response ({} bytes)", response.len()),
            });
        }
        let frame = protocol::parse_frame(&response)?;
        if frame.id != id {
            return Err(Error::Protocol {
                id,
                reason: format!("response from motor {} instead", frame.id),
            });
        }
        if frame.code != 0 {
            return Err(Error::Protocol {
                id,
                reason: format!("servo error status {:#04x}", frame.code),
            });
        }
        protocol::read_u16_param(&frame)
    }

    /// Read every motor in order, substituting [`FALLBACK_POSITION`] for
    /// the ones that never answer. Sequential on purpose: the bus is
    /// half-duplex.
    pub fn read_all_positions(&self, ids: &[u8]) -> Vec<u16> {
        let mut positions = Vec::with_capacity(ids.len());
        for (i, &id) in ids.iter().enumerate() {
            positions.push(self.read_position(id).unwrap_or(FALLBACK_POSITION));
            if i + 1 < ids.len() {
                thread::sleep(INTER_MOTOR_DELAY);
            }
        }
        positions
    }

    /// Write a 2-byte register. The servo may or may not ack; a short
    /// wait swallows the ack if present, and success does not depend on
    /// it.
    pub fn write_register(&self, id: u8, addr: u8, value: u16) -> Result<()> {
        let mut transport = self.transport.lock().expect("transport mutex poisoned");
        transport.write(&protocol::build_write_u16(id, addr, value))?;
        let _ = transport.read_once(WRITE_ACK_TIMEOUT);
        Ok(())
    }

    pub fn write_goal_position(&self, id: u8, position: u16) -> Result<()> {
        self.write_register(id, protocol::ADDR_GOAL_POSITION, position)
    }

    /// One broadcast frame carrying goal positions for many motors.
    /// No per-motor acks come back from a sync write.
    pub fn sync_write_goal_positions(&self, targets: &[(u8, u16)]) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let mut transport = self.transport.lock().expect("transport mutex poisoned");
        transport.write(&protocol::build_sync_write_u16(
            protocol::ADDR_GOAL_POSITION,
            targets,
        ))
    }

    /// Drop torque so the motor can be moved by hand.
    pub fn release_motor(&self, id: u8) -> Result<()> {
        self.write_register(id, protocol::ADDR_TORQUE_ENABLE, 0)
    }

    /// Re-engage torque.
    pub fn lock_motor(&self, id: u8) -> Result<()> {
        self.write_register(id, protocol::ADDR_TORQUE_ENABLE, 1)
    }

    pub fn release_motors(&self, ids: &[u8]) -> Result<()> {
        for (i, &id) in ids.iter().enumerate() {
            self.release_motor(id)?;
            if i + 1 < ids.len() {
                thread::sleep(INTER_MOTOR_DELAY);
            }
        }
        Ok(())
    }

    pub fn lock_motors(&self, ids: &[u8]) -> Result<()> {
        for (i, &id) in ids.iter().enumerate() {
            self.lock_motor(id)?;
            if i + 1 < ids.len() {
                thread::sleep(INTER_MOTOR_DELAY);
            }
        }
        Ok(())
    }

    /// Liveness probe: true when the motor acks a PING within one read
    /// window.
    pub fn ping(&self, id: u8) -> bool {
        let mut transport = match self.transport.lock() {
            Ok(t) => t,
            Err(_) => return false,
        };
        if transport.clear_input().is_err() {
            return false;
        }
        if transport.write(&protocol::build_ping(id)).is_err() {
            return false;
        }
        match transport.read_once(READ_TIMEOUT_STEP) {
            Ok(response) => protocol::parse_frame(&response)
                .map(|frame| frame.id == id && frame.code == 0)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{share, MockTransport};

    fn position_responder(
        positions: impl Fn(u8) -> Option<u16> + Send + 'static,
    ) -> MockTransport {
        MockTransport::new(Box::new(move |frame| {
            let parsed = protocol::parse_frame(frame).ok()?;
            match parsed.code {
                protocol::INST_READ => {
                    let position = positions(parsed.id)?;
                    Some(protocol::build_status(parsed.id, 0, &position.to_le_bytes()))
                }
                protocol::INST_WRITE => Some(protocol::build_status(parsed.id, 0, &[])),
                _ => None,
            }
        }))
    }

    #[test]
    fn happy_path_read_takes_one_attempt() {
        let mock = position_responder(|id| (id == 1).then_some(2048));
        let writes = mock.writes();
        let bus = MotorBus::new(share(Box::new(mock)));

        assert_eq!(bus.read_position(1), Some(2048));
        assert_eq!(writes.lock().unwrap().len(), 1);
    }

    #[test]
    fn ladder_succeeds_on_late_attempt() {
        let mut calls = 0u32;
        let mock = MockTransport::new(Box::new(move |frame| {
            let parsed = protocol::parse_frame(frame).ok()?;
            calls += 1;
            // Silent for the first two attempts, answers on the third.
            (calls >= 3).then(|| protocol::build_status(parsed.id, 0, &[0xE8, 0x03]))
        }));
        let writes = mock.writes();
        let bus = MotorBus::new(share(Box::new(mock)));

        assert_eq!(bus.read_position(1), Some(1000));
        assert_eq!(writes.lock().unwrap().len(), 3);
    }

    #[test]
    fn exhausted_ladder_returns_none_and_leaks_nothing() {
        let mock = MockTransport::silent();
        let writes = mock.writes();
        let bus = MotorBus::new(share(Box::new(mock)));

        assert_eq!(bus.read_position(2), None);
        assert_eq!(writes.lock().unwrap().len(), MAX_RETRIES as usize);
    }

    #[test]
    fn corrupt_checksum_counts_as_a_failed_attempt() {
        let mock = MockTransport::new(Box::new(|frame| {
            let parsed = protocol::parse_frame(frame).ok()?;
            let mut response = protocol::build_status(parsed.id, 0, &[0x00, 0x08]);
            let last = response.len() - 1;
            response[last] ^= 0xFF;
            Some(response)
        }));
        let bus = MotorBus::new(share(Box::new(mock)));
        assert_eq!(bus.read_position(1), None);
    }

    #[test]
    fn mismatched_id_counts_as_a_failed_attempt() {
        let mock = MockTransport::new(Box::new(|frame| {
            let parsed = protocol::parse_frame(frame).ok()?;
            Some(protocol::build_status(parsed.id.wrapping_add(1), 0, &[0x00, 0x08]))
        }));
        let bus = MotorBus::new(share(Box::new(mock)));
        assert_eq!(bus.read_position(1), None);
    }

    #[test]
    fn fan_out_read_substitutes_fallback() {
        let bus = MotorBus::new(share(Box::new(MockTransport::silent())));
        assert_eq!(
            bus.read_all_positions(&[1, 2, 3, 4, 5, 6]),
            vec![2047; 6]
        );
    }

    #[test]
    fn homing_offset_write_frame_is_bit_exact() {
        let mock = position_responder(|_| None);
        let writes = mock.writes();
        let bus = MotorBus::new(share(Box::new(mock)));

        let encoded = protocol::encode_sign_magnitude(-1).unwrap();
        assert_eq!(encoded, 0x801);
        bus.write_register(2, protocol::ADDR_HOMING_OFFSET, encoded)
            .unwrap();

        let log = writes.lock().unwrap();
        let frame = protocol::parse_frame(&log[0]).unwrap();
        assert_eq!(frame.params, vec![31, 0x01, 0x08]);
        let expected_checksum = !(2u32 + 5 + 3 + 31 + 1 + 8) as u8;
        assert_eq!(*log[0].last().unwrap(), expected_checksum);
    }

    #[test]
    fn ping_reports_liveness() {
        let mock = MockTransport::new(Box::new(|frame| {
            let parsed = protocol::parse_frame(frame).ok()?;
            (parsed.id == 1).then(|| protocol::build_status(1, 0, &[]))
        }));
        let bus = MotorBus::new(share(Box::new(mock)));
        assert!(bus.ping(1));
        assert!(!bus.ping(2));
    }
}
