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

//! Fan Controller
//!
//! The controller owns a periodic tick thread. Each tick it acquires a
//! fresh temperature reading, updates the safety flags, evaluates each
//! fan's target speed, smooths it, and issues the minimum set of EC writes.
//!
//! # Safety Envelope
//! - **Critical temperature**: above the threshold, either hand every fan
//!   back to the BIOS or pin them to 100%, per settings.
//! - **Stale-data watchdog**: sensor silence beyond 20 s forces every fan
//!   to full manual speed.
//! - **Graceful release**: every worker exit path, panic included, hands
//!   the fans back to the BIOS.
//!
//! EC errors inside a tick never tear the loop down: the affected readback
//! is marked invalid, the affected write is skipped, and the tick continues.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Threshold};
use crate::curve;
use crate::ec::EcDriver;
use crate::error::{Result, VortecError};
use crate::sensors::{SensorSource, TemperatureProbe};
use crate::settings::{SafetyAction, Settings};

/// Maximum change of the smoothed output per tick, in percent.
const SMOOTHING_STEP: i32 = 10;
/// Sensor silence beyond this forces every fan to full manual speed.
const STALE_DATA_TIMEOUT: Duration = Duration::from_secs(20);
/// Word value an absent or faulted RPM sensor reads as.
const RPM_NOT_PRESENT: u16 = 0xFFFF;
/// RPM readings at or above this are implausible and rejected.
const RPM_MAX_PLAUSIBLE: u16 = 15000;
/// An accepted RPM reading may not jump more than this from the last
/// valid one.
const RPM_SPIKE_DELTA: u16 = 3000;

/// Operating mode for a single fan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FanMode {
    Auto,
    Manual,
    ReadOnly,
    Disabled,
}

/// Runtime state of a single fan. Mutated only by the controller, on the
/// tick thread or under the state lock.
#[derive(Clone, Debug)]
struct FanState {
    mode: FanMode,
    manual_speed: i32,
    target_speed_percent: i32,
    current_speed: i32,
    last_written_speed: i32,
    /// -1 after a failed readback.
    read_speed_percent: i32,
    current_rpm: u16,
    last_valid_rpm: u16,
    bios_control_released: bool,
}

impl FanState {
    fn new() -> Self {
        Self {
            mode: FanMode::Auto,
            manual_speed: 50,
            target_speed_percent: 0,
            current_speed: 0,
            last_written_speed: 0,
            read_speed_percent: 0,
            current_rpm: 0,
            last_valid_rpm: 0,
            bios_control_released: false,
        }
    }
}

/// Immutable snapshot of one fan for UI consumption.
#[derive(Clone, Debug, Serialize)]
pub struct PublicFanState {
    pub name: String,
    pub mode: FanMode,
    pub manual_speed: i32,
    pub target_speed_percent: i32,
    pub read_speed_percent: i32,
    pub current_rpm: u16,
    pub thresholds: Vec<Threshold>,
}

/// Immutable snapshot of the whole controller for UI consumption. Deep
/// enough a copy that consumers can never observe tearing.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PublicState {
    pub system_temp: f64,
    pub gpu_temp: f64,
    pub model_name: String,
    pub fans: Vec<PublicFanState>,
}

struct ControllerState {
    config: Option<Arc<Config>>,
    settings: Settings,
    fans: Vec<FanState>,
    last_temp: f64,
    last_gpu_temp: f64,
    /// `None` disarms the watchdog until the next successful reading.
    last_successful_update: Option<Instant>,
    source: SensorSource,
    in_critical: bool,
}

struct Worker {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

struct Shared {
    driver: Arc<EcDriver>,
    probe: Arc<dyn TemperatureProbe>,
    state: RwLock<ControllerState>,
    worker: Mutex<Option<Worker>>,
    on_temp_update: Box<dyn Fn(&str) + Send + Sync>,
}

/// The fan controller. Cheap to clone; all clones share one state machine.
#[derive(Clone)]
pub struct FanController {
    shared: Arc<Shared>,
}

impl FanController {
    /// Build an unconfigured controller.
    ///
    /// `probe` is the polled temperature source; `on_temp_update` receives
    /// the formatted tooltip text on every tick. The callback is a leaf: it
    /// must not call back into the controller.
    pub fn new(
        driver: Arc<EcDriver>,
        probe: Arc<dyn TemperatureProbe>,
        on_temp_update: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                driver,
                probe,
                state: RwLock::new(ControllerState {
                    config: None,
                    settings: Settings::default(),
                    fans: Vec::new(),
                    last_temp: 0.0,
                    last_gpu_temp: 0.0,
                    last_successful_update: None,
                    source: SensorSource::Polled,
                    in_critical: false,
                }),
                worker: Mutex::new(None),
                on_temp_update: Box::new(on_temp_update),
            }),
        }
    }

    /// Install a new configuration, stopping any running control loop
    /// first. Thresholds are sorted ascending by `up_threshold` and the
    /// curve shape is validated; the fan-state vector is rebuilt.
    pub fn load_config(&self, mut config: Config) -> Result<()> {
        let mut worker_slot = self.lock_worker();
        stop_worker(&mut worker_slot);

        config.sort_thresholds();
        config.validate()?;

        let fan_count = config.fans.len();
        let model_name = config.model_name.clone();
        let tooltip = {
            let mut st = write_state(&self.shared);
            st.config = Some(Arc::new(config));
            st.fans = (0..fan_count).map(|_| FanState::new()).collect();
            st.in_critical = false;
            format_tooltip(st.last_temp, st.last_gpu_temp)
        };
        (self.shared.on_temp_update)(&tooltip);

        info!("loaded config for '{}' ({} fans)", model_name, fan_count);
        Ok(())
    }

    /// Spawn the periodic control loop. No-op when already running; fails
    /// with [`VortecError::NoConfigLoaded`] when unconfigured.
    pub fn start(&self) -> Result<()> {
        let mut worker_slot = self.lock_worker();
        if worker_slot.is_some() {
            return Ok(());
        }

        let interval = {
            let st = read_state(&self.shared);
            st.config
                .as_ref()
                .ok_or(VortecError::NoConfigLoaded)?
                .poll_interval()
        };

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("vortec-controller".into())
            .spawn(move || {
                // Hands the fans back to the BIOS on every exit path,
                // including a panicking tick.
                let _release = ReleaseGuard {
                    shared: Arc::clone(&shared),
                };
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => run_tick(&shared),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        *worker_slot = Some(Worker { stop_tx, handle });
        info!("fan controller started (tick every {:?})", interval);
        Ok(())
    }

    /// Signal cancellation, wait for the control loop to finish its current
    /// tick and exit, and release all fans to the BIOS. Idempotent.
    pub fn stop(&self) {
        let mut worker_slot = self.lock_worker();
        stop_worker(&mut worker_slot);
    }

    /// Set the operating mode for one fan. Switching to `ReadOnly` or
    /// `Disabled` arms the reset write for the next tick.
    pub fn set_fan_mode(&self, index: usize, mode: FanMode) -> Result<()> {
        let mut st = write_state(&self.shared);
        if st.config.is_none() {
            return Err(VortecError::NoConfigLoaded);
        }
        let fan = st
            .fans
            .get_mut(index)
            .ok_or(VortecError::InvalidFanIndex(index))?;
        fan.mode = mode;
        if matches!(mode, FanMode::ReadOnly | FanMode::Disabled) {
            fan.bios_control_released = false;
        }
        Ok(())
    }

    /// Set the target speed used in `Manual` mode, clamped to [0, 100].
    pub fn set_manual_speed(&self, index: usize, speed: i32) -> Result<()> {
        let mut st = write_state(&self.shared);
        if st.config.is_none() {
            return Err(VortecError::NoConfigLoaded);
        }
        let fan = st
            .fans
            .get_mut(index)
            .ok_or(VortecError::InvalidFanIndex(index))?;
        fan.manual_speed = speed.clamp(0, 100);
        Ok(())
    }

    /// Replace the settings snapshot used by the next tick.
    pub fn update_settings(&self, settings: Settings) {
        write_state(&self.shared).settings = settings;
    }

    /// Select the active temperature source. Changing source disarms the
    /// watchdog until the new source delivers its first reading.
    pub fn set_sensor_source(&self, source: SensorSource) {
        let mut st = write_state(&self.shared);
        if st.source != source {
            info!("sensor source changed to {:?}", source);
            st.source = source;
            st.last_successful_update = None;
        }
    }

    /// Ingress point for the pushed source. Readings are dropped while the
    /// pushed source is not active, so late messages from a disabled
    /// sidecar cannot refresh the watchdog.
    pub fn update_temperatures(&self, cpu: f64, gpu: f64) {
        let mut st = write_state(&self.shared);
        if st.source != SensorSource::Pushed {
            debug!("dropping pushed reading while the polled source is active");
            return;
        }
        st.last_temp = cpu;
        st.last_gpu_temp = gpu;
        st.last_successful_update = Some(Instant::now());
    }

    /// Immutable snapshot of the controller state.
    pub fn public_state(&self) -> PublicState {
        let st = read_state(&self.shared);
        let Some(config) = st.config.as_ref() else {
            return PublicState::default();
        };
        PublicState {
            system_temp: st.last_temp,
            gpu_temp: st.last_gpu_temp,
            model_name: config.model_name.clone(),
            fans: config
                .fans
                .iter()
                .zip(st.fans.iter())
                .map(|(fan_config, fan)| PublicFanState {
                    name: fan_config.display_name.clone(),
                    mode: fan.mode,
                    manual_speed: fan.manual_speed,
                    target_speed_percent: fan.target_speed_percent,
                    read_speed_percent: fan.read_speed_percent,
                    current_rpm: fan.current_rpm,
                    thresholds: fan_config.thresholds.clone(),
                })
                .collect(),
        }
    }

    /// The currently installed configuration.
    pub fn config(&self) -> Result<Arc<Config>> {
        read_state(&self.shared)
            .config
            .clone()
            .ok_or(VortecError::NoConfigLoaded)
    }

    /// Write every reset-required fan's `fan_speed_reset_value`, handing
    /// control back to the BIOS. Errors are logged, not propagated: this
    /// runs on shutdown and panic paths where there is nowhere to report.
    pub fn release_all_fans_to_bios(&self) {
        let config = read_state(&self.shared).config.clone();
        if let Some(config) = config {
            release_fans(&self.shared.driver, &config);
        }
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        self.shared
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct ReleaseGuard {
    shared: Arc<Shared>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let config = read_state(&self.shared).config.clone();
        if let Some(config) = config {
            release_fans(&self.shared.driver, &config);
        }
    }
}

fn stop_worker(slot: &mut Option<Worker>) {
    if let Some(worker) = slot.take() {
        // Dropping the sender ends the loop at the next tick boundary; the
        // exiting thread performs the BIOS release.
        drop(worker.stop_tx);
        if worker.handle.join().is_err() {
            warn!("control loop thread panicked; fans were released by guard");
        }
        info!("fan controller stopped");
    }
}

fn read_state(shared: &Shared) -> RwLockReadGuard<'_, ControllerState> {
    shared
        .state
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_state(shared: &Shared) -> RwLockWriteGuard<'_, ControllerState> {
    shared
        .state
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn format_tooltip(cpu: f64, gpu: f64) -> String {
    if gpu > 0.0 {
        format!("CPU: {:.1}°C | GPU: {:.1}°C", cpu, gpu)
    } else {
        format!("CPU: {:.1}°C", cpu)
    }
}

/// Convert a 0–100 percentage to the raw EC byte for this fan's range.
fn scale_speed_to_ec_value(percent: i32, min_value: u8, max_value: u8) -> u8 {
    if percent <= 0 {
        return min_value;
    }
    if percent >= 100 {
        return max_value;
    }
    let span = f64::from(max_value) - f64::from(min_value);
    (f64::from(min_value) + span * f64::from(percent) / 100.0).round() as u8
}

fn release_fans(driver: &EcDriver, config: &Config) {
    info!("releasing all fans to BIOS control");
    for (index, fan_config) in config.fans.iter().enumerate() {
        if !fan_config.reset_required {
            continue;
        }
        debug!(
            "fan {} ({}): writing reset value {:#04x}",
            index, fan_config.display_name, fan_config.fan_speed_reset_value
        );
        if let Err(e) = driver.write_byte(
            fan_config.write_register,
            fan_config.fan_speed_reset_value,
        ) {
            warn!(
                "fan {} ({}): failed to release to BIOS: {}",
                index, fan_config.display_name, e
            );
        }
    }
}

/// One control cycle.
fn run_tick(shared: &Shared) {
    // The polled source may block on slow platform queries, so it is
    // sampled before the state lock is taken; external readers stay
    // responsive.
    let poll = {
        let st = read_state(shared);
        st.config.is_some() && st.source == SensorSource::Polled
    };
    let polled_temps = if poll { Some(shared.probe.sample()) } else { None };

    let mut st = write_state(shared);
    let Some(config) = st.config.clone() else {
        return;
    };
    let settings = st.settings.clone();
    let now = Instant::now();

    match polled_temps {
        Some(Ok(temps)) => {
            st.last_temp = temps.max_cpu;
            st.last_gpu_temp = temps.gpu;
            st.last_successful_update = Some(now);
        }
        Some(Err(e)) => {
            // Keep the last known reading; a transient query failure must
            // not stop the fans.
            warn!("temperature poll failed: {}; using last known value", e);
        }
        None => {} // Pushed source: the cache is fed by update_temperatures.
    }

    let tooltip = format_tooltip(st.last_temp, st.last_gpu_temp);
    (shared.on_temp_update)(&tooltip);

    // Stale-data watchdog. The forced speeds still go through the write
    // pass below.
    if let Some(last_update) = st.last_successful_update {
        if now.duration_since(last_update) > STALE_DATA_TIMEOUT {
            warn!(
                "no temperature update for {:?}; forcing all fans to 100%",
                now.duration_since(last_update)
            );
            for fan in &mut st.fans {
                fan.mode = FanMode::Manual;
                fan.manual_speed = 100;
            }
        }
    }

    // Safety envelope.
    let effective_temp = st.last_temp.max(st.last_gpu_temp);
    let critical_temp = if settings.critical_temp > 0 {
        settings.critical_temp
    } else {
        config.critical_temperature
    };
    if st.in_critical {
        if settings.enable_critical_temp_recovery
            && effective_temp
                < f64::from(critical_temp - settings.critical_temp_recovery_delta)
        {
            info!(
                "temperature {:.1}°C below recovery threshold; resuming automatic control",
                effective_temp
            );
            for fan in &mut st.fans {
                fan.mode = FanMode::Auto;
            }
            st.in_critical = false;
        }
    } else if effective_temp > f64::from(critical_temp) {
        error!(
            "CRITICAL: temperature {:.1}°C exceeds threshold of {}°C",
            effective_temp, critical_temp
        );
        st.in_critical = true;
        match settings.safety_action {
            SafetyAction::BiosControl => {
                release_fans(&shared.driver, &config);
                for fan in &mut st.fans {
                    fan.mode = FanMode::Disabled;
                }
                return;
            }
            SafetyAction::ForceFullSpeed => {
                for fan in &mut st.fans {
                    fan.mode = FanMode::Manual;
                    fan.manual_speed = 100;
                }
            }
        }
    }

    // Pass 1: readback.
    for (index, (fan_config, fan)) in config.fans.iter().zip(st.fans.iter_mut()).enumerate() {
        if let Some(rpm_register) = fan_config.rpm_register {
            match shared.driver.read_word(rpm_register) {
                Ok(raw) => {
                    if raw != RPM_NOT_PRESENT && raw < RPM_MAX_PLAUSIBLE {
                        if fan.last_valid_rpm == 0
                            || raw.abs_diff(fan.last_valid_rpm) < RPM_SPIKE_DELTA
                        {
                            fan.current_rpm = raw;
                            fan.last_valid_rpm = raw;
                        } else {
                            debug!(
                                "fan {}: rejecting RPM spike {} (last valid {})",
                                index, raw, fan.last_valid_rpm
                            );
                        }
                    }
                }
                Err(e) => debug!("fan {}: RPM read failed: {}", index, e),
            }
        }

        match shared.driver.read_byte(fan_config.read_register) {
            Ok(raw) => {
                fan.read_speed_percent = (f64::from(raw) / 255.0 * 100.0).round() as i32;
            }
            Err(e) => {
                warn!("fan {}: speed readback failed: {}", index, e);
                fan.read_speed_percent = -1;
            }
        }
    }

    // Pass 2: target, smoothing, coalesced write.
    for (index, (fan_config, fan)) in config.fans.iter().zip(st.fans.iter_mut()).enumerate() {
        let target = match fan.mode {
            FanMode::Auto => {
                fan.bios_control_released = false;
                curve::evaluate(
                    effective_temp,
                    fan.target_speed_percent,
                    &fan_config.thresholds,
                )
            }
            FanMode::Manual => {
                fan.bios_control_released = false;
                fan.manual_speed
            }
            FanMode::ReadOnly | FanMode::Disabled => {
                if !fan.bios_control_released {
                    if fan_config.reset_required {
                        info!(
                            "fan {} ({}): releasing control to BIOS (writing {:#04x})",
                            index, fan_config.display_name, fan_config.fan_speed_reset_value
                        );
                        if let Err(e) = shared.driver.write_byte(
                            fan_config.write_register,
                            fan_config.fan_speed_reset_value,
                        ) {
                            warn!("fan {}: reset write failed: {}", index, e);
                        }
                    }
                    fan.bios_control_released = true;
                }
                continue;
            }
        };
        fan.target_speed_percent = target;

        // One-sided smoothing step, clamped so it never overshoots.
        let step = (target - fan.current_speed).clamp(-SMOOTHING_STEP, SMOOTHING_STEP);
        fan.current_speed += step;

        // Coalescing: skip the write when the EC already holds this value.
        if fan.current_speed == fan.last_written_speed {
            continue;
        }
        let value = scale_speed_to_ec_value(
            fan.current_speed,
            fan_config.min_speed_value,
            fan_config.max_speed_value,
        );
        match shared.driver.write_byte(fan_config.write_register, value) {
            Ok(()) => {
                debug!(
                    "fan {}: wrote {:#04x} ({}%)",
                    index, value, fan.current_speed
                );
                fan.last_written_speed = fan.current_speed;
            }
            Err(e) => warn!("fan {}: speed write failed: {}", index, e),
        }
    }
}
