// Rig diagnostic: checks every configured device once
//
// The stage and servo are only read. The panel has no read-only request, so
// it is sent the configured signal and brightness (the same frame the
// runtime sends every tick).
//
// Usage: cargo run --example rig_diagnostic -- [config]
// Example: cargo run --example rig_diagnostic -- rig.toml

use rig_runtime::config::{OffsetStore, RigConfig};
use rig_runtime::link::{PortLink, available_ports};
use rig_runtime::panel::PanelBus;
use rig_runtime::panel::frame::{switch_one, switch_two};
use rig_runtime::servo::{ServoBus, ServoDriver, position_to_angle};
use rig_runtime::stage::{ModbusBus, RegisterMap, StageDriver};
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse()?),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("rig.toml"));

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                 Rig Diagnostic (one pass)                    ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    println!("Step 1: Serial ports");
    match available_ports() {
        Ok(ports) if ports.is_empty() => println!("  (none found)"),
        Ok(ports) => {
            for port in ports {
                println!("  - {}", port);
            }
        }
        Err(e) => println!("  ✗ Cannot list ports: {}", e),
    }
    println!();

    println!("Step 2: Loading {}", path.display());
    let config = RigConfig::load(&path)?;
    println!("  ✓ Config valid");
    println!();

    if let Some(stage) = &config.stage {
        println!("Step 3: Stage on {} (slave {})", stage.port, stage.slave_id);
        match PortLink::open(&stage.port_settings()) {
            Ok(link) => {
                let bus = ModbusBus::with_retries(link, stage.slave_id, stage.retries);
                let mut driver = StageDriver::new(bus, RegisterMap::DEFAULT, stage.units());
                let zero = OffsetStore::new(&stage.offset_path).load_or(stage.zero_offset);
                match driver.poll() {
                    Ok(poll) => {
                        let units = driver.units();
                        println!(
                            "  ready={} running={} fault={} homed={}",
                            poll.ready, poll.running, poll.faulted, poll.homed
                        );
                        println!(
                            "  position {} cnt = {:+.3} deg (zero {})",
                            poll.position,
                            units.counts_to_degrees(poll.position, zero),
                            zero
                        );
                        println!(
                            "  velocity {} cnt/s = {:.3} deg/s, torque {}",
                            poll.velocity,
                            units.counts_per_sec_to_degrees_per_sec(f64::from(poll.velocity)),
                            poll.torque
                        );
                    }
                    Err(e) => println!("  ✗ Poll failed: {}", e),
                }
                match driver.read_path_status() {
                    Ok(status) => println!("  path status: {:?}", status),
                    Err(e) => println!("  ✗ Path status failed: {}", e),
                }
            }
            Err(e) => println!("  ✗ Cannot open port: {}", e),
        }
        println!();
    }

    if let Some(panel) = &config.panel {
        println!("Step 4: Panel on {}", panel.port);
        match PortLink::open(&panel.port_settings()) {
            Ok(link) => match PanelBus::new(link).exchange(panel.signal, panel.brightness) {
                Ok(response) => {
                    println!("  digital output: {}", response.digital_output);
                    println!("  brightness echo: {:?}", response.payload);
                    println!(
                        "  switches: {:#010b} (switch 1 {}, switch 2 {})",
                        response.switch_bits,
                        switch_one(response.switch_bits),
                        switch_two(response.switch_bits)
                    );
                }
                Err(e) => println!("  ✗ Exchange failed: {}", e),
            },
            Err(e) => println!("  ✗ Cannot open port: {}", e),
        }
        println!();
    }

    if let Some(servo) = &config.servo {
        println!(
            "Step 5: Servo on {} (scan {}..={})",
            servo.port, servo.scan_first, servo.scan_last
        );
        match PortLink::open(&servo.port_settings()) {
            Ok(link) => {
                let mut driver = ServoDriver::new(ServoBus::new(link));
                match driver.scan(servo.scan_first..=servo.scan_last) {
                    Ok(found) => {
                        for (id, model) in &found {
                            println!("  ✓ id {} responding (model {})", id, model);
                        }
                        if !found.iter().any(|(id, _)| *id == servo.motor_id) {
                            println!("  ⚠ configured id {} did not respond", servo.motor_id);
                        }
                    }
                    Err(e) => println!("  ✗ Scan failed: {}", e),
                }
                match driver.get_status(servo.motor_id) {
                    Ok(status) => {
                        println!(
                            "  position {} ({:.1} deg), velocity {}, current {}",
                            status.position,
                            position_to_angle(status.position),
                            status.velocity,
                            status.current
                        );
                        println!(
                            "  {} C, {:.1} V, moving={}",
                            status.temperature, status.voltage, status.moving
                        );
                    }
                    Err(e) => println!("  ✗ Status failed: {}", e),
                }
            }
            Err(e) => println!("  ✗ Cannot open port: {}", e),
        }
        println!();
    }

    println!("Diagnostic complete.");
    Ok(())
}
