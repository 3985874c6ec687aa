/*
 * This file is part of Vortec.
 *
 * Copyright (C) 2026 Vortec contributors
 *
 * Vortec is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Vortec is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Vortec. If not, see <https://www.gnu.org/licenses/>.
 */

//! Vortec Daemon (vortecd)
//!
//! Wires the fan-control core to a machine: opens the EC driver, loads the
//! model descriptor, settings and user-profile curve overrides, starts the
//! controller, and optionally launches the sensor sidecar. SIGINT/SIGTERM
//! stop the controller, which hands every fan back to the BIOS before the
//! process exits.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{error, info, warn};

use vortec::config::{self, Config};
use vortec::controller::FanController;
use vortec::ec::EcDriver;
use vortec::mock::MockEc;
use vortec::sensors::{AcpiThermalProbe, SensorSource};
use vortec::settings::Settings;
use vortec::sidecar::{SidecarEvent, SidecarMonitor};

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Args {
    config_path: PathBuf,
    settings_path: Option<PathBuf>,
    profiles_path: Option<PathBuf>,
    sidecar_path: Option<PathBuf>,
    mock: bool,
}

fn print_help() {
    eprintln!("vortecd {} - notebook fan control daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    vortecd -c CONFIG [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH     Model descriptor (JSON, required)");
    eprintln!("    -S, --settings PATH   Settings file (JSON)");
    eprintln!("    -P, --profiles PATH   User fan-curve overrides (JSON)");
    eprintln!("    -s, --sidecar PATH    Sensor sidecar executable");
    eprintln!("        --mock            Drive a simulated EC (no root needed)");
    eprintln!("    -v, --version         Print version");
    eprintln!("    -h, --help            Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    VORTEC_LOG            Log level (trace, debug, info, warn, error)");
}

fn parse_args() -> anyhow::Result<Args> {
    let argv: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut settings_path = None;
    let mut profiles_path = None;
    let mut sidecar_path = None;
    let mut mock = false;

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                println!("vortecd {}", VERSION);
                std::process::exit(0);
            }
            "--mock" => mock = true,
            "-c" | "--config" => {
                i += 1;
                config_path = Some(PathBuf::from(
                    argv.get(i).context("--config requires a path")?,
                ));
            }
            "-S" | "--settings" => {
                i += 1;
                settings_path = Some(PathBuf::from(
                    argv.get(i).context("--settings requires a path")?,
                ));
            }
            "-P" | "--profiles" => {
                i += 1;
                profiles_path = Some(PathBuf::from(
                    argv.get(i).context("--profiles requires a path")?,
                ));
            }
            "-s" | "--sidecar" => {
                i += 1;
                sidecar_path = Some(PathBuf::from(
                    argv.get(i).context("--sidecar requires a path")?,
                ));
            }
            arg => bail!("unknown argument: {}", arg),
        }
        i += 1;
    }

    Ok(Args {
        config_path: config_path.context("missing required --config PATH (see --help)")?,
        settings_path,
        profiles_path,
        sidecar_path,
        mock,
    })
}

/// Initialize tracing: journald when systemd is around, stdout otherwise.
fn init_logging() {
    let log_level = std::env::var("VORTEC_LOG").unwrap_or_else(|_| "info".to_string());

    if std::path::Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("failed to create journald layer: {}, logging to stdout", e);
            }
        }
    }
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(&log_level)
        .init();
}

fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        eprintln!("PANIC at {}: {}", location, panic_info);
    }));

    let args = parse_args()?;
    init_logging();
    info!("STARTUP: vortecd {} starting", VERSION);

    // SAFETY: geteuid only returns the process's effective user id.
    let euid = unsafe { libc::geteuid() };
    if !args.mock && euid != 0 {
        error!("vortecd needs root for EC port access (run with --mock to simulate)");
        bail!("not running as root (euid={})", euid);
    }

    // The EC driver is the one hard dependency: without it there is nothing
    // to control, so failure here is fatal.
    let driver = if args.mock {
        info!("STARTUP: using simulated EC");
        let (mock, _journal) = MockEc::new();
        Arc::new(EcDriver::with_port_io(Box::new(mock)))
    } else {
        Arc::new(EcDriver::open().context("cannot initialize EC driver")?)
    };

    let settings = match &args.settings_path {
        Some(path) => Settings::from_json_file(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => Settings::default(),
    };

    let mut model_config = Config::from_json_file(&args.config_path).with_context(|| {
        format!(
            "failed to load model descriptor from {}",
            args.config_path.display()
        )
    })?;

    // Per-fan curve overrides are applied by the host, before the config
    // reaches the controller.
    if let Some(path) = &args.profiles_path {
        let profiles = config::load_user_profiles(path)
            .with_context(|| format!("failed to load user profiles from {}", path.display()))?;
        if profiles.contains_key(&model_config.model_name) {
            info!(
                "applying user profile overrides for '{}'",
                model_config.model_name
            );
        }
        config::apply_user_profiles(&mut model_config, &profiles);
    }

    let probe = Arc::new(AcpiThermalProbe::new());
    let controller = FanController::new(driver.clone(), probe, |tooltip| {
        info!("{}", tooltip);
    });
    controller.update_settings(settings);
    controller
        .load_config(model_config)
        .context("model descriptor rejected")?;

    // Prefer the pushed source when a sidecar is configured; fall back to
    // the polled source on its first fatal error, once per run.
    let mut monitor = None;
    if let Some(path) = args.sidecar_path {
        controller.set_sensor_source(SensorSource::Pushed);
        let (sidecar, events) = SidecarMonitor::spawn(path);
        monitor = Some(sidecar);

        let ingress_controller = controller.clone();
        std::thread::Builder::new()
            .name("vortec-ingress".into())
            .spawn(move || {
                for event in events {
                    match event {
                        SidecarEvent::Data(temps) => {
                            ingress_controller.update_temperatures(temps.max_cpu, temps.gpu);
                        }
                        SidecarEvent::Failed => {
                            warn!("sensor sidecar lost; switching to polled source");
                            ingress_controller.set_sensor_source(SensorSource::Polled);
                        }
                    }
                }
            })
            .context("failed to spawn ingress thread")?;
    }

    controller.start()?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("failed to install signal handler")?;

    shutdown_rx.recv().ok();
    info!("SIGNAL: shutting down");

    controller.stop();
    if let Some(monitor) = monitor.as_mut() {
        monitor.stop();
    }
    driver.close();
    info!("SHUTDOWN: fans released to BIOS, exiting");
    Ok(())
}
