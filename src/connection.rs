//! The logical handle for one physical arm.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::profile::RobotType;
use crate::transport::{share, SharedTransport, Transport};

/// USB descriptor fields captured at discovery time, where the OS
/// exposes them.
#[derive(Debug, Clone, Serialize)]
pub struct UsbMetadata {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// One arm: exclusive ownership of its serial line plus the identity
/// used to find it again.
///
/// Created by `find_port` or `connect`; the only mutation is flipping
/// connection state. The transport is never handed out directly —
/// engines go through a [`crate::MotorBus`], which serializes access.
pub struct RobotConnection {
    pub robot_type: RobotType,
    pub robot_id: String,
    /// Stable device identity: the USB serial number where available,
    /// otherwise synthesized at discovery time.
    pub serial_number: String,
    pub port_path: Option<String>,
    pub usb: Option<UsbMetadata>,
    /// Why discovery failed, for entries that never got a port.
    pub error: Option<String>,
    transport: Option<SharedTransport>,
    connected: Arc<AtomicBool>,
    engine_active: Arc<AtomicBool>,
}

impl RobotConnection {
    pub fn new(
        transport: Box<dyn Transport>,
        robot_type: RobotType,
        robot_id: impl Into<String>,
        serial_number: impl Into<String>,
        port_path: Option<String>,
        usb: Option<UsbMetadata>,
    ) -> Self {
        Self {
            robot_type,
            robot_id: robot_id.into(),
            serial_number: serial_number.into(),
            port_path,
            usb,
            error: None,
            transport: Some(share(transport)),
            connected: Arc::new(AtomicBool::new(true)),
            engine_active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A connection over a caller-supplied transport — hosts running
    /// against [`crate::MockTransport`] use this.
    pub fn with_transport(
        transport: Box<dyn Transport>,
        robot_type: RobotType,
        robot_id: impl Into<String>,
    ) -> Self {
        let robot_id = robot_id.into();
        let serial = format!("local-{robot_id}");
        Self::new(transport, robot_type, robot_id, serial, None, None)
    }

    /// A discovery entry that never reached a port.
    pub(crate) fn failed(
        robot_type: RobotType,
        robot_id: impl Into<String>,
        serial_number: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            robot_type,
            robot_id: robot_id.into(),
            serial_number: serial_number.into(),
            port_path: None,
            usb: None,
            error: Some(error.into()),
            transport: None,
            connected: Arc::new(AtomicBool::new(false)),
            engine_active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Shared transport handle for a bus. Fails before any I/O when the
    /// connection is closed or was never established.
    pub(crate) fn transport(&self) -> Result<SharedTransport> {
        if !self.is_connected() {
            return Err(Error::Configuration(format!(
                "robot '{}' is not connected",
                self.robot_id
            )));
        }
        self.transport
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("robot '{}' has no open port", self.robot_id)))
    }

    /// A register-level bus over this connection's line. Cheap; all
    /// buses on one connection share the line and serialize access.
    pub fn bus(&self) -> Result<crate::bus::MotorBus> {
        Ok(crate::bus::MotorBus::new(self.transport()?))
    }

    pub(crate) fn connected_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.connected)
    }

    /// Claim this connection for one engine. Calibration and
    /// teleoperation each hold the claim for their whole lifetime;
    /// overlapping engines on one arm are a usage error.
    pub(crate) fn begin_engine(&self) -> Result<EngineGuard> {
        if self
            .engine_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Configuration(format!(
                "an engine is already running on robot '{}'",
                self.robot_id
            )));
        }
        Ok(EngineGuard {
            flag: Arc::clone(&self.engine_active),
        })
    }

    /// Release the port. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if let Some(transport) = &self.transport {
            transport
                .lock()
                .expect("transport mutex poisoned")
                .close();
        }
        self.connected.store(false, Ordering::Release);
        tracing::info!(robot = %self.robot_id, "disconnected");
    }
}

/// Clears the engine-active claim when the engine winds down, on every
/// exit path.
pub(crate) struct EngineGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn disconnect_flips_state_and_closes_port() {
        let mut conn = RobotConnection::with_transport(
            Box::new(MockTransport::silent()),
            RobotType::Follower,
            "arm",
        );
        assert!(conn.is_connected());
        assert!(conn.transport().is_ok());

        conn.disconnect();
        assert!(!conn.is_connected());
        assert!(matches!(conn.transport(), Err(Error::Configuration(_))));
        conn.disconnect(); // idempotent
    }

    #[test]
    fn only_one_engine_at_a_time() {
        let conn = RobotConnection::with_transport(
            Box::new(MockTransport::silent()),
            RobotType::Follower,
            "arm",
        );
        let guard = conn.begin_engine().unwrap();
        assert!(conn.begin_engine().is_err());
        drop(guard);
        assert!(conn.begin_engine().is_ok());
    }

    #[test]
    fn failed_entries_carry_the_error() {
        let conn = RobotConnection::failed(RobotType::Leader, "left", "serial-1", "not found");
        assert!(!conn.is_connected());
        assert_eq!(conn.error.as_deref(), Some("not found"));
        assert!(conn.transport().is_err());
    }
}
