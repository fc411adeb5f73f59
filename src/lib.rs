//! SO-ARM runtime — discovery, calibration and teleoperation of 6-DOF
//! arms driven by Feetech STS3215 bus servos over USB serial.
//!
//! The runtime owns the wire protocol, the calibration state machine,
//! the teleoperation control loop and the persisted calibration format.
//! Hosts (CLIs, desktop apps, services) drive it through five coarse
//! operations:
//!
//! - [`find_port`] — match logical robots to physical serial ports,
//!   interactively or by saved device identity
//! - [`connect`] — open a specific port directly
//! - [`release_motors`] — drop torque so an arm can be moved by hand
//! - [`calibrate`] — record homing offsets and range of motion, persist
//!   the artifact
//! - [`teleoperate`] — drive the arm from held keys or direct position
//!   commands
//!
//! Long-running operations hand back a process handle (a worker thread
//! plus a cooperative stop flag); everything else is a plain blocking
//! call. One connection supports one engine at a time, and all frames
//! to one arm go out in strict order.
//!
//! Rendering, key-event sourcing and persistence of anything other than
//! the calibration artifact are the host's job; the runtime only emits
//! callbacks.

pub mod bus;
pub mod calibration;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod profile;
pub mod protocol;
pub mod store;
pub mod teleop;
pub mod transport;

pub use bus::MotorBus;
pub use calibration::{
    calibrate, CalibrationOptions, CalibrationProcess, LiveCalibration, LiveCalibrationEntry,
};
pub use connection::{RobotConnection, UsbMetadata};
pub use discovery::{
    connect, diff_port_snapshots, find_port, list_port_paths, FindPortOptions, PortCandidate,
    RobotConfigEntry,
};
pub use error::{Error, Result};
pub use profile::{KeyBinding, MotorSpec, RobotProfile, RobotType};
pub use store::{Calibration, MotorCalibration};
pub use teleop::{
    teleoperate, MotorConfig, TeleopMode, TeleopOptions, TeleopProcess, TeleoperationState,
};
pub use transport::{MockTransport, SerialTransport, Transport};

/// Advisory progress callback. Strings are human-readable UTF-8 and not
/// part of any machine contract.
pub type ProgressFn = Box<dyn Fn(&str) + Send>;

/// Drop torque on the given motors (default: all of them) so the arm
/// can be posed by hand — the usual prelude to [`calibrate`].
pub fn release_motors(robot: &RobotConnection, motor_ids: Option<&[u8]>) -> Result<()> {
    let bus = MotorBus::new(robot.transport()?);
    let profile = RobotProfile::for_type(robot.robot_type);
    let default_ids;
    let ids = match motor_ids {
        Some(ids) => ids,
        None => {
            default_ids = profile.motor_ids();
            &default_ids
        }
    };
    bus.release_motors(ids)?;
    tracing::info!(robot = %robot.robot_id, count = ids.len(), "motors released");
    Ok(())
}
