//! Persisted calibration artifacts.
//!
//! The artifact is a JSON object keyed by motor name, written where the
//! Python lerobot tooling keeps its calibrations so the two can read
//! each other's files:
//!
//! ```text
//! $HF_HOME/lerobot/calibration/robots/<robot_type>/<robot_id>.json
//! ```
//!
//! `HF_HOME` defaults to `$HOME/.cache/huggingface`; the
//! `HF_LEROBOT_HOME` and `HF_LEROBOT_CALIBRATION` variables override
//! progressively more specific roots.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::profile::RobotType;

/// Per-motor calibration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorCalibration {
    pub id: u8,
    pub drive_mode: u8,
    /// Signed 12-bit sign-magnitude value as decoded, |v| ≤ 2047.
    pub homing_offset: i32,
    pub range_min: u16,
    pub range_max: u16,
}

/// The whole artifact: one record per motor name.
pub type Calibration = BTreeMap<String, MotorCalibration>;

/// Root directory calibrations live under.
pub fn calibration_dir() -> PathBuf {
    dir_from(|key| env::var(key).ok())
}

fn dir_from(get: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(dir) = get("HF_LEROBOT_CALIBRATION") {
        return PathBuf::from(dir);
    }
    if let Some(home) = get("HF_LEROBOT_HOME") {
        return Path::new(&home).join("calibration");
    }
    let hf_home = get("HF_HOME").map(PathBuf::from).unwrap_or_else(|| {
        let home = get("HOME").unwrap_or_else(|| ".".to_string());
        Path::new(&home).join(".cache").join("huggingface")
    });
    hf_home.join("lerobot").join("calibration")
}

/// Conventional artifact path for one robot.
pub fn calibration_path(robot_type: RobotType, robot_id: &str) -> PathBuf {
    calibration_dir()
        .join("robots")
        .join(robot_type.to_string())
        .join(format!("{robot_id}.json"))
}

/// Write the artifact atomically: parent dirs, temp file, rename.
pub fn save(path: &Path, calibration: &Calibration) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Store(format!("creating {}: {e}", parent.display())))?;
    }
    let json = serde_json::to_string_pretty(calibration)
        .map_err(|e| Error::Store(format!("encoding calibration: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| Error::Store(format!("writing {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::Store(format!("replacing {}: {e}", path.display())))?;
    tracing::info!(path = %path.display(), "calibration saved");
    Ok(())
}

pub fn load(path: &Path) -> Result<Calibration> {
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::Store(format!("reading {}: {e}", path.display())))?;
    serde_json::from_str(&contents)
        .map_err(|e| Error::Store(format!("parsing {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Calibration {
        let mut calibration = Calibration::new();
        calibration.insert(
            "shoulder_pan".to_string(),
            MotorCalibration {
                id: 1,
                drive_mode: 0,
                homing_offset: 53,
                range_min: 1500,
                range_max: 2700,
            },
        );
        calibration.insert(
            "gripper".to_string(),
            MotorCalibration {
                id: 6,
                drive_mode: 0,
                homing_offset: -12,
                range_min: 0,
                range_max: 4095,
            },
        );
        calibration
    }

    #[test]
    fn artifact_round_trips_through_disk() {
        let path = env::temp_dir()
            .join(format!("soarm-store-{:08x}", rand::random::<u32>()))
            .join("robots")
            .join("follower")
            .join("arm.json");
        let calibration = sample();
        save(&path, &calibration).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, calibration);
        // No temp file left behind after the rename.
        assert!(!path.with_extension("json.tmp").exists());
        fs::remove_dir_all(path.ancestors().nth(3).unwrap()).ok();
    }

    #[test]
    fn artifact_json_shape_matches_python_tooling() {
        let json = serde_json::to_string_pretty(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let pan = &value["shoulder_pan"];
        assert_eq!(pan["id"], 1);
        assert_eq!(pan["drive_mode"], 0);
        assert_eq!(pan["homing_offset"], 53);
        assert_eq!(pan["range_min"], 1500);
        assert_eq!(pan["range_max"], 2700);
    }

    #[test]
    fn env_override_precedence() {
        let get = |vars: &'static [(&'static str, &'static str)]| {
            move |key: &str| {
                vars.iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.to_string())
            }
        };

        assert_eq!(
            dir_from(get(&[
                ("HF_LEROBOT_CALIBRATION", "/custom/cal"),
                ("HF_LEROBOT_HOME", "/custom/lerobot"),
                ("HF_HOME", "/custom/hf"),
            ])),
            PathBuf::from("/custom/cal")
        );
        assert_eq!(
            dir_from(get(&[("HF_LEROBOT_HOME", "/custom/lerobot"), ("HF_HOME", "/custom/hf")])),
            PathBuf::from("/custom/lerobot/calibration")
        );
        assert_eq!(
            dir_from(get(&[("HF_HOME", "/custom/hf")])),
            PathBuf::from("/custom/hf/lerobot/calibration")
        );
        assert_eq!(
            dir_from(get(&[("HOME", "/home/op")])),
            PathBuf::from("/home/op/.cache/huggingface/lerobot/calibration")
        );
    }

    #[test]
    fn conventional_path_layout() {
        let path = calibration_path(RobotType::Leader, "left_arm");
        let tail: PathBuf = path.iter().rev().take(3).collect::<Vec<_>>().into_iter().rev().collect();
        assert_eq!(tail, PathBuf::from("robots/leader/left_arm.json"));
    }
}
