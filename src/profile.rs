//! Fixed tables describing the SO-ARM robot family.
//!
//! One profile covers both arms of a teleoperation pair: the follower
//! (the arm being driven) and the leader (the arm a human moves). They
//! share the same six-motor layout and default controls.

use serde::{Deserialize, Serialize};

/// Which side of a teleoperation pair a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotType {
    Follower,
    Leader,
}

impl std::fmt::Display for RobotType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RobotType::Follower => f.write_str("follower"),
            RobotType::Leader => f.write_str("leader"),
        }
    }
}

/// One motor slot: bus id, joint name, drive mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorSpec {
    pub id: u8,
    pub name: &'static str,
    pub drive_mode: u8,
}

/// A key bound to a motor and a direction. `direction` 0 marks
/// non-motion controls (emergency stop).
#[derive(Debug, Clone, Copy)]
pub struct KeyBinding {
    pub key: &'static str,
    pub motor: &'static str,
    pub direction: i32,
    pub description: &'static str,
}

/// The key that unconditionally halts teleoperation.
pub const EMERGENCY_STOP_KEY: &str = "Escape";

static SO_ARM_MOTORS: [MotorSpec; 6] = [
    MotorSpec { id: 1, name: "shoulder_pan", drive_mode: 0 },
    MotorSpec { id: 2, name: "shoulder_lift", drive_mode: 0 },
    MotorSpec { id: 3, name: "elbow_flex", drive_mode: 0 },
    MotorSpec { id: 4, name: "wrist_flex", drive_mode: 0 },
    MotorSpec { id: 5, name: "wrist_roll", drive_mode: 0 },
    MotorSpec { id: 6, name: "gripper", drive_mode: 0 },
];

static SO_ARM_KEYMAP: [KeyBinding; 13] = [
    KeyBinding { key: "ArrowUp", motor: "shoulder_lift", direction: 1, description: "shoulder up" },
    KeyBinding { key: "ArrowDown", motor: "shoulder_lift", direction: -1, description: "shoulder down" },
    KeyBinding { key: "ArrowLeft", motor: "shoulder_pan", direction: -1, description: "pan left" },
    KeyBinding { key: "ArrowRight", motor: "shoulder_pan", direction: 1, description: "pan right" },
    KeyBinding { key: "w", motor: "elbow_flex", direction: 1, description: "elbow up" },
    KeyBinding { key: "s", motor: "elbow_flex", direction: -1, description: "elbow down" },
    KeyBinding { key: "a", motor: "wrist_flex", direction: -1, description: "wrist down" },
    KeyBinding { key: "d", motor: "wrist_flex", direction: 1, description: "wrist up" },
    KeyBinding { key: "q", motor: "wrist_roll", direction: -1, description: "roll left" },
    KeyBinding { key: "e", motor: "wrist_roll", direction: 1, description: "roll right" },
    KeyBinding { key: "o", motor: "gripper", direction: 1, description: "gripper open" },
    KeyBinding { key: "c", motor: "gripper", direction: -1, description: "gripper close" },
    KeyBinding { key: EMERGENCY_STOP_KEY, motor: "emergency_stop", direction: 0, description: "emergency stop" },
];

static SO_ARM_PROFILE: RobotProfile = RobotProfile {
    motors: &SO_ARM_MOTORS,
    keymap: &SO_ARM_KEYMAP,
};

/// Immutable description of a robot family: motor layout plus default
/// controls. Selected by [`RobotType`]; leader and follower currently
/// share one table.
#[derive(Debug, Clone, Copy)]
pub struct RobotProfile {
    pub motors: &'static [MotorSpec],
    pub keymap: &'static [KeyBinding],
}

impl RobotProfile {
    pub fn for_type(_robot_type: RobotType) -> &'static RobotProfile {
        &SO_ARM_PROFILE
    }

    /// Bus ids in canonical motor order.
    pub fn motor_ids(&self) -> Vec<u8> {
        self.motors.iter().map(|m| m.id).collect()
    }

    pub fn motor(&self, name: &str) -> Option<&'static MotorSpec> {
        self.motors.iter().find(|m| m.name == name)
    }

    pub fn binding(&self, key: &str) -> Option<&'static KeyBinding> {
        self.keymap.iter().find(|b| b.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_motor_order() {
        let profile = RobotProfile::for_type(RobotType::Follower);
        let names: Vec<&str> = profile.motors.iter().map(|m| m.name).collect();
        assert_eq!(
            names,
            ["shoulder_pan", "shoulder_lift", "elbow_flex", "wrist_flex", "wrist_roll", "gripper"]
        );
        assert_eq!(profile.motor_ids(), vec![1, 2, 3, 4, 5, 6]);
        assert!(profile.motors.iter().all(|m| m.drive_mode == 0));
    }

    #[test]
    fn every_motion_key_resolves_to_a_motor() {
        let profile = RobotProfile::for_type(RobotType::Leader);
        for binding in profile.keymap {
            if binding.direction != 0 {
                assert!(
                    profile.motor(binding.motor).is_some(),
                    "key {} bound to unknown motor {}",
                    binding.key,
                    binding.motor
                );
            }
        }
    }

    #[test]
    fn escape_is_the_emergency_stop() {
        let profile = RobotProfile::for_type(RobotType::Follower);
        let binding = profile.binding(EMERGENCY_STOP_KEY).unwrap();
        assert_eq!(binding.motor, "emergency_stop");
        assert_eq!(binding.direction, 0);
    }
}
