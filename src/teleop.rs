//! Live human-driven control of one arm.
//!
//! Two input variants share the engine. The keyboard variant runs a
//! fixed-rate loop fed by `update_key_state` calls from the host; held
//! keys step their motor every tick, released keys decay after a short
//! timeout, and a first press wakes the loop immediately so the arm
//! reacts before the next tick. The direct variant has no loop at all:
//! each `move_motor` clamps, writes and returns.
//!
//! Every write goes through the calibrated clamp. `Escape` halts the
//! loop unconditionally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;

use crate::bus::MotorBus;
use crate::connection::{EngineGuard, RobotConnection};
use crate::error::{Error, Result};
use crate::profile::{RobotProfile, EMERGENCY_STOP_KEY};
use crate::protocol;
use crate::store::Calibration;
use crate::transport::SharedTransport;

/// Ticks per step for held keys.
pub const STEP_SIZE_DEFAULT: i32 = 25;
/// Loop rate for the keyboard variant.
pub const UPDATE_RATE_HZ_DEFAULT: u32 = 120;
/// A key not refreshed within this window counts as released.
pub const KEY_TIMEOUT_DEFAULT: Duration = Duration::from_millis(150);

/// Runtime view of one motor: where it is and how far it may go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MotorConfig {
    pub id: u8,
    pub name: String,
    pub current_position: u16,
    pub min_position: u16,
    pub max_position: u16,
}

impl MotorConfig {
    fn clamp(&self, target: i32) -> u16 {
        target.clamp(self.min_position as i32, self.max_position as i32) as u16
    }
}

/// Input variant for one teleoperation run.
#[derive(Debug, Clone)]
pub enum TeleopMode {
    Keyboard {
        step_size: i32,
        update_rate_hz: u32,
        key_timeout: Duration,
    },
    Direct,
}

impl TeleopMode {
    /// Keyboard control with the native defaults.
    pub fn keyboard() -> Self {
        TeleopMode::Keyboard {
            step_size: STEP_SIZE_DEFAULT,
            update_rate_hz: UPDATE_RATE_HZ_DEFAULT,
            key_timeout: KEY_TIMEOUT_DEFAULT,
        }
    }
}

impl Default for TeleopMode {
    fn default() -> Self {
        Self::keyboard()
    }
}

/// Snapshot handed to `on_state_update` and `get_state` callers.
#[derive(Debug, Clone, Serialize)]
pub struct TeleoperationState {
    pub is_active: bool,
    pub motors: Vec<MotorConfig>,
    /// Keys currently held, keyboard variant only.
    pub pressed_keys: Vec<String>,
    /// Milliseconds since the Unix epoch of the last meaningful change.
    pub last_update_ms: u64,
}

pub type StateFn = Box<dyn Fn(&TeleoperationState) + Send + Sync>;

#[derive(Default)]
pub struct TeleopOptions {
    /// Calibrated ranges; without them the full 0..=4095 range applies
    /// and a warning is logged.
    pub calibration: Option<Calibration>,
    pub mode: TeleopMode,
    pub on_state_update: Option<StateFn>,
}

struct Shared {
    motors: Vec<MotorConfig>,
    /// Held keys and when each was last refreshed.
    keys: HashMap<String, Instant>,
    is_active: bool,
    last_update_ms: u64,
}

impl Shared {
    fn snapshot(&self) -> TeleoperationState {
        TeleoperationState {
            is_active: self.is_active,
            motors: self.motors.clone(),
            pressed_keys: self.keys.keys().cloned().collect(),
            last_update_ms: self.last_update_ms,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Handle onto one teleoperation run.
pub struct TeleopProcess {
    bus: MotorBus,
    mode: TeleopMode,
    profile: &'static RobotProfile,
    shared: Arc<Mutex<Shared>>,
    stop: Arc<AtomicBool>,
    nudge_tx: Sender<()>,
    nudge_rx: Receiver<()>,
    on_state_update: Arc<Option<StateFn>>,
    handle: Option<JoinHandle<()>>,
    transport: SharedTransport,
    connected: Arc<AtomicBool>,
    _engine: EngineGuard,
}

/// Prepare teleoperation of `robot`: build the motor table from the
/// profile (and calibration, when given) and refresh current positions
/// from the bus. Call [`TeleopProcess::start`] to begin moving.
pub fn teleoperate(robot: &RobotConnection, options: TeleopOptions) -> Result<TeleopProcess> {
    let transport = robot.transport()?;
    let engine = robot.begin_engine()?;
    let profile = RobotProfile::for_type(robot.robot_type);
    let bus = MotorBus::new(Arc::clone(&transport));

    if options.calibration.is_none() {
        tracing::warn!(
            robot = %robot.robot_id,
            "no calibration data; motors move across the full 0..={} range",
            protocol::MAX_POSITION
        );
    }

    let mut motors = Vec::with_capacity(profile.motors.len());
    for spec in profile.motors {
        let (min_position, max_position) = options
            .calibration
            .as_ref()
            .and_then(|calibration| calibration.get(spec.name))
            .map(|m| (m.range_min, m.range_max))
            .unwrap_or_else(|| {
                if options.calibration.is_some() {
                    tracing::warn!(motor = spec.name, "missing from calibration; using full range");
                }
                (0, protocol::MAX_POSITION)
            });
        motors.push(MotorConfig {
            id: spec.id,
            name: spec.name.to_string(),
            current_position: protocol::MID_POSITION,
            min_position,
            max_position,
        });
    }

    // The runtime table starts from where the arm actually is.
    let positions = bus.read_all_positions(&profile.motor_ids());
    for (motor, position) in motors.iter_mut().zip(positions) {
        motor.current_position = motor.clamp(position as i32);
    }

    let (nudge_tx, nudge_rx) = bounded::<()>(1);
    Ok(TeleopProcess {
        bus,
        mode: options.mode,
        profile,
        shared: Arc::new(Mutex::new(Shared {
            motors,
            keys: HashMap::new(),
            is_active: false,
            last_update_ms: now_ms(),
        })),
        stop: Arc::new(AtomicBool::new(false)),
        nudge_tx,
        nudge_rx,
        on_state_update: Arc::new(options.on_state_update),
        handle: None,
        transport,
        connected: robot.connected_flag(),
        _engine: engine,
    })
}

impl TeleopProcess {
    /// Activate the engine. For the keyboard variant this spawns the
    /// fixed-rate update loop; for direct it only flips the active flag.
    pub fn start(&mut self) -> Result<()> {
        {
            let mut shared = self.shared.lock().expect("teleop state poisoned");
            if shared.is_active {
                return Ok(());
            }
            shared.is_active = true;
            shared.last_update_ms = now_ms();
        }
        self.stop.store(false, Ordering::Release);

        if let TeleopMode::Keyboard {
            step_size,
            update_rate_hz,
            key_timeout,
        } = self.mode
        {
            // A previous run's loop has already observed the stop flag;
            // reap it before spawning the next.
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            let loop_body = KeyboardLoop {
                bus: self.bus.clone(),
                profile: self.profile,
                shared: Arc::clone(&self.shared),
                stop: Arc::clone(&self.stop),
                nudge_rx: self.nudge_rx.clone(),
                on_state_update: Arc::clone(&self.on_state_update),
                step_size,
                period: Duration::from_secs_f64(1.0 / update_rate_hz as f64),
                key_timeout,
            };
            let handle = thread::Builder::new()
                .name("soarm-teleop".into())
                .spawn(move || loop_body.run())
                .map_err(|e| Error::Transport(format!("spawning teleop loop: {e}")))?;
            self.handle = Some(handle);
            tracing::info!(rate_hz = update_rate_hz, step = step_size, "teleoperation active");
        }
        Ok(())
    }

    /// Deactivate. Non-blocking and idempotent: the loop notices the
    /// flag at its next wake-up. Key state is cleared.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.nudge_tx.try_send(());
        let mut shared = self.shared.lock().expect("teleop state poisoned");
        shared.is_active = false;
        shared.keys.clear();
    }

    pub fn get_state(&self) -> TeleoperationState {
        self.shared.lock().expect("teleop state poisoned").snapshot()
    }

    /// Feed one key transition from the host's event source.
    pub fn update_key_state(&self, key: &str, pressed: bool) {
        let mut shared = self.shared.lock().expect("teleop state poisoned");
        if pressed {
            let newly_pressed = !shared.keys.contains_key(key);
            shared.keys.insert(key.to_string(), Instant::now());
            // A fresh press moves the arm now, not a tick later.
            if newly_pressed && shared.is_active {
                let _ = self.nudge_tx.try_send(());
            }
        } else {
            shared.keys.remove(key);
        }
    }

    /// Direct variant: clamp and write one motor. `Ok(true)` when the
    /// write went out, `Ok(false)` when the bus failed.
    pub fn move_motor(&self, motor_name: &str, position: u16) -> Result<bool> {
        self.require_direct()?;
        let mut shared = self.shared.lock().expect("teleop state poisoned");
        let Some(motor) = shared.motors.iter_mut().find(|m| m.name == motor_name) else {
            return Err(Error::Configuration(format!("unknown motor '{motor_name}'")));
        };
        let target = motor.clamp(position as i32);
        match self.bus.write_goal_position(motor.id, target) {
            Ok(()) => {
                motor.current_position = target;
                shared.last_update_ms = now_ms();
                Ok(true)
            }
            Err(err) => {
                tracing::warn!(motor = motor_name, %err, "goal write failed");
                Ok(false)
            }
        }
    }

    /// Direct variant: clamp and write many motors in one broadcast
    /// frame. Unknown names report `false` without blocking the rest.
    pub fn move_motors(&self, targets: &HashMap<String, u16>) -> Result<HashMap<String, bool>> {
        self.require_direct()?;
        let mut shared = self.shared.lock().expect("teleop state poisoned");
        let mut results = HashMap::with_capacity(targets.len());
        let mut frame_targets = Vec::new();
        let mut clamped: Vec<(String, u16)> = Vec::new();

        for (name, &position) in targets {
            match shared.motors.iter().find(|m| m.name == *name) {
                Some(motor) => {
                    let target = motor.clamp(position as i32);
                    frame_targets.push((motor.id, target));
                    clamped.push((name.clone(), target));
                }
                None => {
                    results.insert(name.clone(), false);
                }
            }
        }

        let ok = self.bus.sync_write_goal_positions(&frame_targets).is_ok();
        for (name, target) in clamped {
            if ok {
                if let Some(motor) = shared.motors.iter_mut().find(|m| m.name == name) {
                    motor.current_position = target;
                }
            }
            results.insert(name, ok);
        }
        if ok && !frame_targets.is_empty() {
            shared.last_update_ms = now_ms();
        }
        Ok(results)
    }

    /// Stop the engine and release the underlying port.
    pub fn disconnect(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.transport
            .lock()
            .expect("transport mutex poisoned")
            .close();
        self.connected.store(false, Ordering::Release);
        tracing::info!("teleoperation disconnected");
    }

    fn require_direct(&self) -> Result<()> {
        match self.mode {
            TeleopMode::Direct => Ok(()),
            TeleopMode::Keyboard { .. } => Err(Error::Configuration(
                "move_motor is only available in direct mode".into(),
            )),
        }
    }
}

impl Drop for TeleopProcess {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.nudge_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct KeyboardLoop {
    bus: MotorBus,
    profile: &'static RobotProfile,
    shared: Arc<Mutex<Shared>>,
    stop: Arc<AtomicBool>,
    nudge_rx: Receiver<()>,
    on_state_update: Arc<Option<StateFn>>,
    step_size: i32,
    period: Duration,
    key_timeout: Duration,
}

impl KeyboardLoop {
    fn run(mut self) {
        loop {
            let tick_start = Instant::now();
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let (snapshot, emergency) = self.tick();
            if let (Some(on_state_update), Some(state)) = (self.on_state_update.as_ref(), &snapshot)
            {
                on_state_update(state);
            }
            if emergency {
                self.stop.store(true, Ordering::Release);
                tracing::info!("emergency stop");
                break;
            }

            // Sleep out the remainder of the tick, but wake early for a
            // fresh key press.
            let elapsed = tick_start.elapsed();
            let wait = self.period.saturating_sub(elapsed);
            match self.nudge_rx.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// One update: expire keys, resolve bindings, accumulate and clamp
    /// targets, write what changed. Returns the state snapshot and
    /// whether the emergency stop fired.
    fn tick(&mut self) -> (Option<TeleoperationState>, bool) {
        let mut shared = self.shared.lock().expect("teleop state poisoned");
        if !shared.is_active {
            return (None, false);
        }

        let now = Instant::now();
        let key_timeout = self.key_timeout;
        shared
            .keys
            .retain(|_, refreshed| now.duration_since(*refreshed) <= key_timeout);

        if shared.keys.contains_key(EMERGENCY_STOP_KEY) {
            shared.is_active = false;
            shared.keys.clear();
            shared.last_update_ms = now_ms();
            return (Some(shared.snapshot()), true);
        }

        // Accumulate per-motor targets; several keys on one motor sum,
        // opposing keys cancel.
        let mut targets: Vec<i32> = shared
            .motors
            .iter()
            .map(|m| m.current_position as i32)
            .collect();
        let mut touched = vec![false; targets.len()];
        for key in shared.keys.keys() {
            let Some(binding) = self.profile.binding(key) else {
                continue;
            };
            if binding.direction == 0 {
                continue;
            }
            if let Some(index) = shared.motors.iter().position(|m| m.name == binding.motor) {
                targets[index] += binding.direction * self.step_size;
                touched[index] = true;
            }
        }

        let mut moved = false;
        for index in 0..targets.len() {
            if !touched[index] {
                continue;
            }
            let motor = &shared.motors[index];
            let target = motor.clamp(targets[index]);
            if target == motor.current_position {
                continue;
            }
            match self.bus.write_goal_position(motor.id, target) {
                Ok(()) => {
                    shared.motors[index].current_position = target;
                    moved = true;
                }
                Err(err) => {
                    tracing::warn!(motor = %shared.motors[index].name, %err, "goal write failed");
                }
            }
        }
        if moved {
            shared.last_update_ms = now_ms();
        }
        (Some(shared.snapshot()), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::RobotType;
    use crate::store::MotorCalibration;
    use crate::transport::MockTransport;

    /// Acks everything, reports every motor at 2048.
    fn steady_transport() -> MockTransport {
        MockTransport::new(Box::new(|frame| {
            let parsed = protocol::parse_frame(frame).ok()?;
            match parsed.code {
                protocol::INST_READ => {
                    Some(protocol::build_status(parsed.id, 0, &2048u16.to_le_bytes()))
                }
                protocol::INST_WRITE => Some(protocol::build_status(parsed.id, 0, &[])),
                _ => None,
            }
        }))
    }

    fn narrow_calibration() -> Calibration {
        let mut calibration = Calibration::new();
        calibration.insert(
            "shoulder_pan".to_string(),
            MotorCalibration {
                id: 1,
                drive_mode: 0,
                homing_offset: 0,
                range_min: 1000,
                range_max: 3000,
            },
        );
        calibration
    }

    fn goal_writes(log: &[Vec<u8>]) -> Vec<(u8, u16)> {
        log.iter()
            .filter_map(|bytes| {
                let frame = protocol::parse_frame(bytes).ok()?;
                (frame.code == protocol::INST_WRITE
                    && frame.params.first() == Some(&protocol::ADDR_GOAL_POSITION))
                .then(|| {
                    (
                        frame.id,
                        u16::from_le_bytes([frame.params[1], frame.params[2]]),
                    )
                })
            })
            .collect()
    }

    #[test]
    fn direct_move_clamps_to_the_calibrated_range() {
        let mock = steady_transport();
        let writes = mock.writes();
        let robot =
            RobotConnection::with_transport(Box::new(mock), RobotType::Follower, "arm");
        let mut process = teleoperate(
            &robot,
            TeleopOptions {
                calibration: Some(narrow_calibration()),
                mode: TeleopMode::Direct,
                on_state_update: None,
            },
        )
        .unwrap();
        process.start().unwrap();

        assert!(process.move_motor("shoulder_pan", 9999).unwrap());
        let goals = goal_writes(&writes.lock().unwrap());
        assert_eq!(goals.last(), Some(&(1, 3000)));

        assert!(process.move_motor("shoulder_pan", 0).unwrap());
        let goals = goal_writes(&writes.lock().unwrap());
        assert_eq!(goals.last(), Some(&(1, 1000)));

        let state = process.get_state();
        let pan = state.motors.iter().find(|m| m.name == "shoulder_pan").unwrap();
        assert_eq!(pan.current_position, 1000);
    }

    #[test]
    fn clamp_invariant_holds_for_every_motor() {
        let robot = RobotConnection::with_transport(
            Box::new(steady_transport()),
            RobotType::Follower,
            "arm",
        );
        let mut process = teleoperate(
            &robot,
            TeleopOptions {
                calibration: Some(narrow_calibration()),
                mode: TeleopMode::Direct,
                on_state_update: None,
            },
        )
        .unwrap();
        process.start().unwrap();

        for position in [0u16, 500, 2048, 4095, 9999] {
            let _ = process.move_motor("shoulder_pan", position).unwrap();
            let _ = process.move_motor("gripper", position).unwrap();
            for motor in process.get_state().motors {
                assert!(motor.min_position <= motor.current_position);
                assert!(motor.current_position <= motor.max_position);
            }
        }
    }

    #[test]
    fn move_motors_broadcasts_one_frame() {
        let mock = steady_transport();
        let writes = mock.writes();
        let robot =
            RobotConnection::with_transport(Box::new(mock), RobotType::Follower, "arm");
        let mut process = teleoperate(
            &robot,
            TeleopOptions {
                mode: TeleopMode::Direct,
                ..Default::default()
            },
        )
        .unwrap();
        process.start().unwrap();
        let before = writes.lock().unwrap().len();

        let mut targets = HashMap::new();
        targets.insert("shoulder_pan".to_string(), 2100u16);
        targets.insert("elbow_flex".to_string(), 1900u16);
        targets.insert("bogus".to_string(), 1000u16);
        let results = process.move_motors(&targets).unwrap();

        assert_eq!(results["shoulder_pan"], true);
        assert_eq!(results["elbow_flex"], true);
        assert_eq!(results["bogus"], false);

        let log = writes.lock().unwrap();
        assert_eq!(log.len(), before + 1);
        let frame = protocol::parse_frame(log.last().unwrap()).unwrap();
        assert_eq!(frame.id, protocol::BROADCAST_ID);
        assert_eq!(frame.code, protocol::INST_SYNC_WRITE);
    }

    #[test]
    fn move_motor_requires_direct_mode() {
        let robot = RobotConnection::with_transport(
            Box::new(steady_transport()),
            RobotType::Follower,
            "arm",
        );
        let process = teleoperate(&robot, TeleopOptions::default()).unwrap();
        assert!(matches!(
            process.move_motor("shoulder_pan", 2048),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn held_key_steps_its_motor() {
        let mock = steady_transport();
        let writes = mock.writes();
        let robot =
            RobotConnection::with_transport(Box::new(mock), RobotType::Follower, "arm");
        let mut process = teleoperate(&robot, TeleopOptions::default()).unwrap();
        process.start().unwrap();

        process.update_key_state("w", true);
        thread::sleep(Duration::from_millis(60));
        process.stop();

        let goals = goal_writes(&writes.lock().unwrap());
        assert!(!goals.is_empty());
        // elbow_flex is id 3, stepping up from 2048 in STEP_SIZE strides.
        assert_eq!(goals[0].0, 3);
        assert_eq!(goals[0].1, 2048 + STEP_SIZE_DEFAULT as u16);
        let state = process.get_state();
        let elbow = state.motors.iter().find(|m| m.name == "elbow_flex").unwrap();
        assert!(elbow.current_position > 2048);
    }

    #[test]
    fn opposing_keys_cancel() {
        let mock = steady_transport();
        let writes = mock.writes();
        let robot =
            RobotConnection::with_transport(Box::new(mock), RobotType::Follower, "arm");
        let mut process = teleoperate(&robot, TeleopOptions::default()).unwrap();
        // Both keys held before the loop starts, so every tick sees the
        // conflicting pair.
        process.update_key_state("q", true);
        process.update_key_state("e", true);
        process.start().unwrap();
        thread::sleep(Duration::from_millis(40));
        process.stop();

        assert!(goal_writes(&writes.lock().unwrap()).is_empty());
    }

    #[test]
    fn keys_expire_after_the_timeout() {
        let robot = RobotConnection::with_transport(
            Box::new(steady_transport()),
            RobotType::Follower,
            "arm",
        );
        let mut process = teleoperate(&robot, TeleopOptions::default()).unwrap();
        process.start().unwrap();

        process.update_key_state("w", true);
        assert!(process.get_state().pressed_keys.contains(&"w".to_string()));
        thread::sleep(KEY_TIMEOUT_DEFAULT + Duration::from_millis(60));
        assert!(process.get_state().pressed_keys.is_empty());
        process.stop();
    }

    #[test]
    fn escape_halts_within_a_tick() {
        let mock = steady_transport();
        let writes = mock.writes();
        let robot =
            RobotConnection::with_transport(Box::new(mock), RobotType::Follower, "arm");
        let mut process = teleoperate(&robot, TeleopOptions::default()).unwrap();
        process.start().unwrap();
        assert!(process.get_state().is_active);

        process.update_key_state(EMERGENCY_STOP_KEY, true);
        thread::sleep(Duration::from_millis(50));

        assert!(!process.get_state().is_active);
        let count = goal_writes(&writes.lock().unwrap()).len();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(goal_writes(&writes.lock().unwrap()).len(), count);
    }

    #[test]
    fn stop_is_idempotent_and_clears_keys() {
        let robot = RobotConnection::with_transport(
            Box::new(steady_transport()),
            RobotType::Follower,
            "arm",
        );
        let mut process = teleoperate(&robot, TeleopOptions::default()).unwrap();
        process.start().unwrap();
        process.update_key_state("w", true);
        process.stop();
        process.stop();

        let state = process.get_state();
        assert!(!state.is_active);
        assert!(state.pressed_keys.is_empty());
    }

    #[test]
    fn uncalibrated_arms_get_the_full_range() {
        let robot = RobotConnection::with_transport(
            Box::new(steady_transport()),
            RobotType::Leader,
            "arm",
        );
        let process = teleoperate(&robot, TeleopOptions::default()).unwrap();
        for motor in process.get_state().motors {
            assert_eq!(motor.min_position, 0);
            assert_eq!(motor.max_position, protocol::MAX_POSITION);
            assert_eq!(motor.current_position, 2048);
        }
    }

    #[test]
    fn disconnect_releases_the_connection() {
        let robot = RobotConnection::with_transport(
            Box::new(steady_transport()),
            RobotType::Follower,
            "arm",
        );
        let mut process = teleoperate(&robot, TeleopOptions::default()).unwrap();
        process.start().unwrap();
        process.disconnect();
        assert!(!robot.is_connected());
    }
}
