//! The calibration engine: a strict linear pass over one arm.
//!
//! ```text
//! reset-offsets → set-homing → record-range → write-limits → persist
//! ```
//!
//! The operator must have released the motors and parked the arm at its
//! mechanical midpoint before the engine starts; resetting the stored
//! homing offsets then makes Present_Position report true physical
//! ticks, the midpoint delta becomes the new offset, and the recording
//! loop tracks the extremes the operator sweeps through. The resulting
//! limits are burned into the servos so later teleoperation cannot push
//! past them even if software clamping were bypassed.
//!
//! Writes to the servos are not rolled back on failure or stop: offsets
//! already programmed stay programmed, matching what a power cycle
//! would leave behind.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;

use crate::bus::{MotorBus, INTER_MOTOR_DELAY};
use crate::connection::RobotConnection;
use crate::error::{Error, Result};
use crate::profile::RobotProfile;
use crate::protocol;
use crate::store::{self, Calibration, MotorCalibration};
use crate::ProgressFn;

/// Record-phase sampling period (~10 Hz).
pub const RECORD_LOOP_PERIOD: Duration = Duration::from_millis(100);
/// Settle time after the offset-reset sweep before positions are
/// trusted again.
const OFFSET_SETTLE_DELAY: Duration = Duration::from_secs(1);
/// Extra pause after the stale-position flush read.
const FLUSH_DELAY: Duration = Duration::from_millis(200);

/// Transient per-motor view emitted while the range is being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiveCalibrationEntry {
    pub current: u16,
    pub min: u16,
    pub max: u16,
    pub range: u16,
}

/// One live snapshot: motor name → entry, ~10 Hz during recording.
pub type LiveCalibration = BTreeMap<&'static str, LiveCalibrationEntry>;

pub type LiveUpdateFn = Box<dyn Fn(&LiveCalibration) + Send>;

#[derive(Default)]
pub struct CalibrationOptions {
    /// Where to persist the artifact; defaults to the conventional path
    /// for the robot's type and id.
    pub output_path: Option<PathBuf>,
    pub on_progress: Option<ProgressFn>,
    pub on_live_update: Option<LiveUpdateFn>,
}

/// Handle onto a running calibration.
///
/// `stop` aborts cooperatively: the engine notices at its next
/// suspension point and the result completes with
/// [`Error::Stopped`] unless the hardware limits were already written.
/// `finish` is the "operator is done sweeping" signal that ends the
/// record phase normally.
pub struct CalibrationProcess {
    stop: Arc<AtomicBool>,
    finish: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<Calibration>>>,
}

impl CalibrationProcess {
    /// Request an abort. Non-blocking and idempotent.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// End the record phase and let the engine write limits and persist.
    pub fn finish(&self) {
        self.finish.store(true, Ordering::Release);
    }

    /// Wait for the engine and take its result.
    pub fn join(mut self) -> Result<Calibration> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::Transport("calibration worker panicked".into()))?,
            None => Err(Error::Configuration("calibration already joined".into())),
        }
    }
}

/// Start calibrating `robot`. The engine claims the connection for its
/// whole run; a second engine on the same arm is rejected.
pub fn calibrate(
    robot: &RobotConnection,
    options: CalibrationOptions,
) -> Result<CalibrationProcess> {
    let transport = robot.transport()?;
    let guard = robot.begin_engine()?;
    let profile = RobotProfile::for_type(robot.robot_type);
    let output_path = options
        .output_path
        .unwrap_or_else(|| store::calibration_path(robot.robot_type, &robot.robot_id));

    let stop = Arc::new(AtomicBool::new(false));
    let finish = Arc::new(AtomicBool::new(false));
    let worker = Worker {
        bus: MotorBus::new(transport),
        profile,
        stop: Arc::clone(&stop),
        finish: Arc::clone(&finish),
        on_progress: options.on_progress,
        on_live_update: options.on_live_update,
        output_path,
    };

    let handle = thread::Builder::new()
        .name("soarm-calibration".into())
        .spawn(move || {
            let _guard = guard;
            worker.run()
        })
        .map_err(|e| Error::Transport(format!("spawning calibration worker: {e}")))?;

    Ok(CalibrationProcess {
        stop,
        finish,
        handle: Some(handle),
    })
}

struct Worker {
    bus: MotorBus,
    profile: &'static RobotProfile,
    stop: Arc<AtomicBool>,
    finish: Arc<AtomicBool>,
    on_progress: Option<ProgressFn>,
    on_live_update: Option<LiveUpdateFn>,
    output_path: PathBuf,
}

impl Worker {
    fn say(&self, msg: &str) {
        if let Some(on_progress) = &self.on_progress {
            on_progress(msg);
        }
        tracing::info!("{msg}");
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn run(&self) -> Result<Calibration> {
        let ids = self.profile.motor_ids();

        // Step 1: zero the stored offsets so reads report physical
        // positions.
        self.say("resetting homing offsets");
        for (i, &id) in ids.iter().enumerate() {
            self.bus
                .write_register(id, protocol::ADDR_HOMING_OFFSET, 0)?;
            if i + 1 < ids.len() {
                thread::sleep(INTER_MOTOR_DELAY);
            }
        }
        thread::sleep(OFFSET_SETTLE_DELAY);
        // The servos cache Present_Position; one discarded sweep
        // flushes it.
        let _ = self.bus.read_all_positions(&ids);
        thread::sleep(FLUSH_DELAY);
        if self.stopped() {
            return Err(Error::Stopped);
        }

        // Step 2: center the logical coordinate system on the arm's
        // current pose.
        self.say("setting homing offsets from the current position");
        let positions = self.bus.read_all_positions(&ids);
        let mut offsets = Vec::with_capacity(ids.len());
        for (i, &id) in ids.iter().enumerate() {
            let offset = positions[i] as i32 - protocol::MID_POSITION as i32;
            let encoded = protocol::encode_sign_magnitude(offset)?;
            self.bus
                .write_register(id, protocol::ADDR_HOMING_OFFSET, encoded)?;
            offsets.push(offset);
            if i + 1 < ids.len() {
                thread::sleep(INTER_MOTOR_DELAY);
            }
        }
        if self.stopped() {
            return Err(Error::Stopped);
        }

        // Step 3: record the range of motion until the operator is done.
        self.say("recording range of motion: move every joint to its limits");
        let (mins, maxs) = self.record_range(&ids)?;

        // Step 4: burn the observed envelope into the servos.
        self.say("writing position limits");
        for (i, &id) in ids.iter().enumerate() {
            self.bus
                .write_register(id, protocol::ADDR_MIN_POSITION_LIMIT, mins[i])?;
            self.bus
                .write_register(id, protocol::ADDR_MAX_POSITION_LIMIT, maxs[i])?;
            if i + 1 < ids.len() {
                thread::sleep(INTER_MOTOR_DELAY);
            }
        }

        // Step 5: persist. Motors stay released; locking is the host's
        // call.
        let mut calibration = Calibration::new();
        for (i, motor) in self.profile.motors.iter().enumerate() {
            calibration.insert(
                motor.name.to_string(),
                MotorCalibration {
                    id: motor.id,
                    drive_mode: motor.drive_mode,
                    homing_offset: offsets[i],
                    range_min: mins[i],
                    range_max: maxs[i],
                },
            );
        }
        store::save(&self.output_path, &calibration)?;
        self.say(&format!("calibration saved to {}", self.output_path.display()));
        Ok(calibration)
    }

    fn record_range(&self, ids: &[u8]) -> Result<(Vec<u16>, Vec<u16>)> {
        let initial = self.bus.read_all_positions(ids);
        let mut mins = initial.clone();
        let mut maxs = initial;

        loop {
            if self.stopped() {
                return Err(Error::Stopped);
            }
            if self.finish.load(Ordering::Acquire) {
                return Ok((mins, maxs));
            }

            let positions = self.bus.read_all_positions(ids);
            for (i, &position) in positions.iter().enumerate() {
                mins[i] = mins[i].min(position);
                maxs[i] = maxs[i].max(position);
            }

            if let Some(on_live_update) = &self.on_live_update {
                let snapshot: LiveCalibration = self
                    .profile
                    .motors
                    .iter()
                    .enumerate()
                    .map(|(i, motor)| {
                        (
                            motor.name,
                            LiveCalibrationEntry {
                                current: positions[i],
                                min: mins[i],
                                max: maxs[i],
                                range: maxs[i] - mins[i],
                            },
                        )
                    })
                    .collect();
                on_live_update(&snapshot);
            }

            spin_sleep::sleep(RECORD_LOOP_PERIOD);
        }
    }
}
