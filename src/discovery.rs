//! Matching logical robots to physical serial ports.
//!
//! Two modes share one entry point. Interactive discovery hands the
//! host an enumeration of candidate ports and lets it pick one (the
//! prompting is the host's job; this runtime renders no UI).
//! Auto-reconnect matches previously saved device identities against
//! whatever is currently plugged in and verifies each match by reading
//! a position from motor 1 — enumeration metadata alone does not prove
//! there is a live arm on the other end of the cable.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serialport::SerialPortType;

use crate::bus::MotorBus;
use crate::connection::{RobotConnection, UsbMetadata};
use crate::error::{Error, Result};
use crate::profile::{RobotProfile, RobotType};
use crate::transport::SerialTransport;
use crate::ProgressFn;

/// A saved identity for auto-reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotConfigEntry {
    pub robot_type: RobotType,
    pub robot_id: String,
    pub serial_number: String,
}

/// One enumerated port, with whatever identity the USB descriptors gave
/// us.
#[derive(Debug, Clone)]
pub struct PortCandidate {
    pub path: String,
    /// Derived identity; `None` for ports without usable USB metadata
    /// (those can never match a saved identity).
    pub serial_number: Option<String>,
    pub usb: Option<UsbMetadata>,
}

/// Host callback choosing one port path out of the candidates.
pub type SelectPortFn = Box<dyn Fn(&[PortCandidate]) -> Option<String> + Send>;

#[derive(Default)]
pub struct FindPortOptions {
    /// When set, discovery runs in auto-reconnect mode against these
    /// saved identities; otherwise it is interactive and `select_port`
    /// must be supplied.
    pub robot_configs: Option<Vec<RobotConfigEntry>>,
    pub on_message: Option<ProgressFn>,
    pub select_port: Option<SelectPortFn>,
}

/// Discover arms. Returns one entry per requested config (auto mode) or
/// a single user-selected connection (interactive mode); individual
/// failures are recorded per entry and never abort the whole call.
pub fn find_port(options: FindPortOptions) -> Result<Vec<RobotConnection>> {
    let say = |msg: &str| {
        if let Some(on_message) = &options.on_message {
            on_message(msg);
        }
        tracing::info!("{msg}");
    };

    match &options.robot_configs {
        Some(configs) => auto_reconnect(configs, &say),
        None => interactive(options.select_port.as_ref(), &say),
    }
}

/// Open a specific path directly.
pub fn connect(port_path: &str, robot_type: RobotType, robot_id: &str) -> Result<RobotConnection> {
    // Enumeration only supplies metadata here; a failure to enumerate
    // must not stop us from opening a path the caller already knows.
    let candidate = candidates()
        .unwrap_or_default()
        .into_iter()
        .find(|c| c.path == port_path);
    let transport = SerialTransport::open(port_path)?;
    let (serial, usb) = match candidate {
        Some(c) => (
            c.serial_number.unwrap_or_else(fallback_serial),
            c.usb,
        ),
        None => (fallback_serial(), None),
    };
    tracing::info!(port = port_path, robot = robot_id, "connected");
    Ok(RobotConnection::new(
        Box::new(transport),
        robot_type,
        robot_id,
        serial,
        Some(port_path.to_string()),
        usb,
    ))
}

/// Snapshot of currently visible port paths, for the unplug/replug
/// pairing flow: snapshot, have the operator pull the cable, snapshot
/// again, then [`diff_port_snapshots`].
pub fn list_port_paths() -> Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}

/// The one path present before but missing after. Zero or several
/// missing paths both fail, with an explanation.
pub fn diff_port_snapshots(before: &[String], after: &[String]) -> Result<String> {
    let missing: Vec<&String> = before.iter().filter(|p| !after.contains(p)).collect();
    match missing.as_slice() {
        [path] => Ok((*path).clone()),
        [] => Err(Error::NotFound(
            "no port disappeared between snapshots; unplug the arm's cable and retry".into(),
        )),
        several => Err(Error::Configuration(format!(
            "{} ports disappeared at once ({}); unplug only the arm's cable",
            several.len(),
            several
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Enumerate ports with their derived identities.
pub fn candidates() -> Result<Vec<PortCandidate>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|port| {
            let usb = match port.port_type {
                SerialPortType::UsbPort(info) => Some(UsbMetadata {
                    vendor_id: info.vid,
                    product_id: info.pid,
                    serial_number: info.serial_number,
                    manufacturer: info.manufacturer,
                    product: info.product,
                }),
                _ => None,
            };
            PortCandidate {
                serial_number: usb.as_ref().and_then(derive_serial),
                path: port.port_name,
                usb,
            }
        })
        .collect())
}

/// Stable identity from USB descriptors: the device serial where the OS
/// exposes one, otherwise vendor/product/name. Two arms of the same
/// model without device serials cannot be told apart — the vid/pid form
/// still lets a single-arm setup reconnect.
fn derive_serial(usb: &UsbMetadata) -> Option<String> {
    if let Some(serial) = &usb.serial_number {
        if !serial.is_empty() {
            return Some(serial.clone());
        }
    }
    if usb.vendor_id != 0 || usb.product_id != 0 {
        let label = usb
            .product
            .as_deref()
            .or(usb.manufacturer.as_deref())
            .unwrap_or("usb");
        return Some(format!("{:04x}:{:04x}:{label}", usb.vendor_id, usb.product_id));
    }
    None
}

fn fallback_serial() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("fallback-{millis}-{:04x}", rand::random::<u16>())
}

fn interactive(
    select_port: Option<&SelectPortFn>,
    say: &dyn Fn(&str),
) -> Result<Vec<RobotConnection>> {
    let select_port = select_port.ok_or_else(|| {
        Error::Configuration("interactive discovery needs a select_port callback".into())
    })?;
    let candidates = candidates()?;
    if candidates.is_empty() {
        return Err(Error::NotFound("no serial ports are visible".into()));
    }
    say(&format!("{} serial port(s) visible", candidates.len()));

    let path = select_port(&candidates).ok_or(Error::Stopped)?;
    let chosen = candidates
        .into_iter()
        .find(|c| c.path == path)
        .ok_or_else(|| Error::NotFound(format!("selected port {path} is not available")))?;

    let transport = SerialTransport::open(&chosen.path)?;
    let serial = chosen.serial_number.clone().unwrap_or_else(fallback_serial);
    say(&format!("opened {} ({serial})", chosen.path));

    // robot_id is a placeholder; the caller renames the arm.
    Ok(vec![RobotConnection::new(
        Box::new(transport),
        RobotType::Follower,
        "robot",
        serial,
        Some(chosen.path),
        chosen.usb,
    )])
}

fn auto_reconnect(
    configs: &[RobotConfigEntry],
    say: &dyn Fn(&str),
) -> Result<Vec<RobotConnection>> {
    let candidates = candidates()?;
    let mut connections = Vec::with_capacity(configs.len());

    for config in configs {
        let candidate = candidates
            .iter()
            .find(|c| c.serial_number.as_deref() == Some(config.serial_number.as_str()));

        let Some(candidate) = candidate else {
            say(&format!("{}: not found", config.robot_id));
            connections.push(RobotConnection::failed(
                config.robot_type,
                &config.robot_id,
                &config.serial_number,
                "not found",
            ));
            continue;
        };

        let transport = match SerialTransport::open(&candidate.path) {
            Ok(t) => t,
            Err(e) => {
                say(&format!("{}: {e}", config.robot_id));
                connections.push(RobotConnection::failed(
                    config.robot_type,
                    &config.robot_id,
                    &config.serial_number,
                    e.to_string(),
                ));
                continue;
            }
        };

        let mut connection = RobotConnection::new(
            Box::new(transport),
            config.robot_type,
            &config.robot_id,
            &config.serial_number,
            Some(candidate.path.clone()),
            candidate.usb.clone(),
        );

        // Metadata matched; make sure an arm actually answers.
        let first_motor = RobotProfile::for_type(config.robot_type).motors[0].id;
        let bus = MotorBus::new(connection.transport()?);
        if bus.read_position(first_motor).is_some() {
            say(&format!("{}: connected on {}", config.robot_id, candidate.path));
            connections.push(connection);
        } else {
            say(&format!("{}: no motor response on {}", config.robot_id, candidate.path));
            connection.disconnect();
            connections.push(RobotConnection::failed(
                config.robot_type,
                &config.robot_id,
                &config.serial_number,
                "no motor response",
            ));
        }
    }

    Ok(connections)
}
