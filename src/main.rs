//! Host CLI for the SO-ARM runtime.
//!
//! A thin collaborator over the library: argument parsing and terminal
//! output live here, all behavior in `soarm_runtime`.
//!
//! Usage:
//!   soarm-runtime ports
//!   soarm-runtime probe --port /dev/ttyACM0
//!   soarm-runtime release --port /dev/ttyACM0
//!   soarm-runtime calibrate --port /dev/ttyACM0 --robot-id my_arm
//!   soarm-runtime move --port /dev/ttyACM0 --motor gripper --position 2500

use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use soarm_runtime::{
    calibrate, connect, release_motors, store, teleoperate, CalibrationOptions, RobotProfile,
    RobotType, TeleopMode, TeleopOptions,
};

#[derive(Parser, Debug)]
#[command(name = "soarm-runtime")]
#[command(about = "Discover, calibrate and drive SO-ARM robot arms")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List visible serial ports and their device identities.
    Ports,
    /// Check which motors answer on a port.
    Probe {
        #[arg(long)]
        port: String,
    },
    /// Drop torque so the arm can be moved by hand.
    Release {
        #[arg(long)]
        port: String,
        #[arg(long, value_enum, default_value = "follower")]
        robot_type: CliRobotType,
    },
    /// Record homing offsets and range of motion, then save the artifact.
    Calibrate {
        #[arg(long)]
        port: String,
        #[arg(long, value_enum, default_value = "follower")]
        robot_type: CliRobotType,
        #[arg(long, default_value = "so_arm")]
        robot_id: String,
        /// Override the conventional artifact path.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Send one motor to an absolute position (clamped to calibration).
    Move {
        #[arg(long)]
        port: String,
        #[arg(long, value_enum, default_value = "follower")]
        robot_type: CliRobotType,
        #[arg(long, default_value = "so_arm")]
        robot_id: String,
        #[arg(long)]
        motor: String,
        #[arg(long)]
        position: u16,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliRobotType {
    Follower,
    Leader,
}

impl From<CliRobotType> for RobotType {
    fn from(value: CliRobotType) -> Self {
        match value {
            CliRobotType::Follower => RobotType::Follower,
            CliRobotType::Leader => RobotType::Leader,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    match Args::parse().command {
        Command::Ports => ports(),
        Command::Probe { port } => probe(&port),
        Command::Release { port, robot_type } => release(&port, robot_type.into()),
        Command::Calibrate {
            port,
            robot_type,
            robot_id,
            output,
        } => run_calibration(&port, robot_type.into(), &robot_id, output),
        Command::Move {
            port,
            robot_type,
            robot_id,
            motor,
            position,
        } => move_motor(&port, robot_type.into(), &robot_id, &motor, position),
    }
}

fn ports() -> Result<()> {
    let candidates = soarm_runtime::discovery::candidates().context("enumerating serial ports")?;
    if candidates.is_empty() {
        println!("no serial ports visible");
        return Ok(());
    }
    for candidate in candidates {
        match candidate.serial_number {
            Some(serial) => println!("{}  {serial}", candidate.path),
            None => println!("{}  (no usb identity)", candidate.path),
        }
    }
    Ok(())
}

fn probe(port: &str) -> Result<()> {
    let robot = connect(port, RobotType::Follower, "probe")
        .with_context(|| format!("opening {port}"))?;
    let bus = robot.bus().context("building motor bus")?;
    for motor in RobotProfile::for_type(robot.robot_type).motors {
        match bus.read_position(motor.id) {
            Some(position) => println!("{:>13} (id {}): {}", motor.name, motor.id, position),
            None => println!("{:>13} (id {}): no response", motor.name, motor.id),
        }
    }
    Ok(())
}

fn release(port: &str, robot_type: RobotType) -> Result<()> {
    let robot = connect(port, robot_type, "release")?;
    release_motors(&robot, None).context("releasing motors")?;
    println!("motors released — the arm can be moved by hand");
    Ok(())
}

fn run_calibration(
    port: &str,
    robot_type: RobotType,
    robot_id: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let robot = connect(port, robot_type, robot_id)?;
    release_motors(&robot, None).context("releasing motors")?;

    println!("Hold the arm at its mechanical midpoint, then press Enter to start.");
    wait_for_enter()?;

    let process = calibrate(
        &robot,
        CalibrationOptions {
            output_path: output,
            on_progress: Some(Box::new(|msg| println!("{msg}"))),
            on_live_update: Some(Box::new(|snapshot| {
                print!("\r");
                for (name, entry) in snapshot {
                    print!("  {name}:[{:>4}–{:>4}]", entry.min, entry.max);
                }
                io::stdout().flush().ok();
            })),
        },
    )
    .context("starting calibration")?;

    // Background thread waits for Enter so the live readout keeps
    // flowing.
    println!("Move every joint through its full range. Press Enter when done.");
    let done = Arc::new(AtomicBool::new(false));
    let done_flag = Arc::clone(&done);
    std::thread::spawn(move || {
        let mut buf = [0u8; 1];
        let _ = io::stdin().read(&mut buf);
        done_flag.store(true, Ordering::Relaxed);
    });
    while !done.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    process.finish();

    let calibration = process.join().context("calibration failed")?;
    println!();
    for (name, motor) in &calibration {
        println!(
            "  {name:>13}: offset={:>5}  range=[{:>4}, {:>4}]",
            motor.homing_offset, motor.range_min, motor.range_max
        );
    }
    Ok(())
}

fn move_motor(
    port: &str,
    robot_type: RobotType,
    robot_id: &str,
    motor: &str,
    position: u16,
) -> Result<()> {
    let robot = connect(port, robot_type, robot_id)?;
    let calibration_path = store::calibration_path(robot_type, robot_id);
    let calibration = store::load(&calibration_path).ok();
    if calibration.is_none() {
        eprintln!(
            "no calibration at {}; moving across the full range",
            calibration_path.display()
        );
    }

    let mut process = teleoperate(
        &robot,
        TeleopOptions {
            calibration,
            mode: TeleopMode::Direct,
            on_state_update: None,
        },
    )
    .context("starting teleoperation")?;
    process.start()?;

    if process.move_motor(motor, position)? {
        let state = process.get_state();
        let config = state
            .motors
            .iter()
            .find(|m| m.name == motor)
            .context("motor missing from state")?;
        println!("{motor} → {}", config.current_position);
    } else {
        println!("{motor}: write failed");
    }
    process.disconnect();
    Ok(())
}

fn wait_for_enter() -> Result<()> {
    let mut line = String::new();
    io::stdin().read_line(&mut line).context("reading stdin")?;
    Ok(())
}
