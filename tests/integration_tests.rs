/*
 * Integration tests for Vortec
 *
 * These tests exercise the public library API across module seams: config
 * loading and validation, the controller lifecycle against a simulated EC,
 * and the host-side settings/profile loaders.
 */

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::NamedTempFile;

use vortec::config::{self, Config, FanConfig, Threshold, UserProfile, UserProfiles};
use vortec::controller::{FanController, FanMode};
use vortec::ec::EcDriver;
use vortec::error::VortecError;
use vortec::mock::{EcJournal, MockEc};
use vortec::sensors::{SensorSource, TemperatureProbe, Temperatures};
use vortec::settings::{SafetyAction, Settings};

const WRITE_REG: u8 = 0x93;
const RESET_VALUE: u8 = 0xFF;

/// Fixed-output polled probe.
struct StaticProbe {
    cpu: f64,
    gpu: f64,
}

impl TemperatureProbe for StaticProbe {
    fn sample(&self) -> vortec::Result<Temperatures> {
        Ok(Temperatures {
            max_cpu: self.cpu,
            gpu: self.gpu,
        })
    }
}

fn threshold(up: i32, down: i32, speed: f64) -> Threshold {
    Threshold {
        up_threshold: up,
        down_threshold: down,
        fan_speed: speed,
    }
}

fn test_config(poll_interval_ms: u64) -> Config {
    Config {
        model_name: "Test Notebook".to_string(),
        ec_poll_interval_ms: poll_interval_ms,
        critical_temperature: 85,
        fans: vec![FanConfig {
            display_name: "CPU Fan".to_string(),
            read_register: 0x9A,
            write_register: WRITE_REG,
            rpm_register: None,
            min_speed_value: 0,
            max_speed_value: 255,
            reset_required: true,
            fan_speed_reset_value: RESET_VALUE,
            thresholds: vec![
                threshold(70, 60, 80.0),
                threshold(25, 20, 0.0),
                threshold(50, 40, 30.0),
            ],
        }],
    }
}

fn controller_with(cpu: f64, gpu: f64) -> (FanController, EcJournal) {
    let (mock, journal) = MockEc::new();
    let driver = Arc::new(EcDriver::with_port_io(Box::new(mock)));
    let probe = Arc::new(StaticProbe { cpu, gpu });
    (FanController::new(driver, probe, |_| {}), journal)
}

#[test]
fn load_config_sorts_thresholds_for_get_config() {
    let (controller, _journal) = controller_with(30.0, 0.0);
    controller.load_config(test_config(0)).unwrap();

    let config = controller.config().unwrap();
    let ups: Vec<i32> = config.fans[0]
        .thresholds
        .iter()
        .map(|t| t.up_threshold)
        .collect();
    assert_eq!(ups, vec![25, 50, 70]);
    assert_eq!(config.model_name, "Test Notebook");
}

#[test]
fn config_before_load_is_an_error() {
    let (controller, _journal) = controller_with(30.0, 0.0);
    assert!(matches!(
        controller.config(),
        Err(VortecError::NoConfigLoaded)
    ));
}

#[test]
fn load_config_rejects_non_monotonic_curve() {
    let (controller, _journal) = controller_with(30.0, 0.0);
    let mut config = test_config(0);
    config.fans[0].thresholds = vec![threshold(25, 20, 50.0), threshold(50, 40, 30.0)];
    assert!(matches!(
        controller.load_config(config),
        Err(VortecError::InvalidConfig(_))
    ));
}

#[test]
fn start_requires_config() {
    let (controller, _journal) = controller_with(30.0, 0.0);
    assert!(matches!(
        controller.start(),
        Err(VortecError::NoConfigLoaded)
    ));
}

#[test]
fn running_controller_writes_speeds_and_stop_releases_to_bios() {
    let (controller, journal) = controller_with(55.0, 0.0);
    controller.load_config(test_config(10)).unwrap();
    controller.start().unwrap();

    // 55°C sits on the 30% level; smoothing approaches it 10% per tick.
    std::thread::sleep(Duration::from_millis(300));
    controller.stop();

    let writes = journal.writes_to(WRITE_REG);
    assert!(writes.len() >= 3, "expected speed writes, got {:?}", writes);
    // The very last byte on the write register is the BIOS reset value.
    assert_eq!(journal.last_write_to(WRITE_REG), Some(RESET_VALUE));
    assert_eq!(journal.protocol_errors(), 0);
}

#[test]
fn stop_without_start_is_a_quiet_no_op() {
    let (controller, journal) = controller_with(30.0, 0.0);
    controller.load_config(test_config(0)).unwrap();
    controller.stop();
    controller.stop();
    assert!(journal.writes().is_empty());
}

#[test]
fn start_twice_is_a_no_op() {
    let (controller, _journal) = controller_with(30.0, 0.0);
    controller.load_config(test_config(10)).unwrap();
    controller.start().unwrap();
    controller.start().unwrap();
    controller.stop();
}

#[test]
fn load_config_while_running_restarts_cleanly() {
    let (controller, journal) = controller_with(55.0, 0.0);
    controller.load_config(test_config(10)).unwrap();
    controller.start().unwrap();
    std::thread::sleep(Duration::from_millis(100));

    // Implicit stop: the old worker releases the fans before the new
    // config lands.
    let mut replacement = test_config(10);
    replacement.model_name = "Other Notebook".to_string();
    controller.load_config(replacement).unwrap();
    assert_eq!(journal.last_write_to(WRITE_REG), Some(RESET_VALUE));
    assert_eq!(
        controller.config().unwrap().model_name,
        "Other Notebook"
    );

    // The fan-state vector was rebuilt; the controller is startable again.
    controller.start().unwrap();
    controller.stop();
}

#[test]
fn public_state_reflects_config_and_modes() {
    let (controller, _journal) = controller_with(30.0, 0.0);

    // Unconfigured: an empty snapshot rather than an error.
    let empty = controller.public_state();
    assert!(empty.fans.is_empty());
    assert!(empty.model_name.is_empty());

    controller.load_config(test_config(0)).unwrap();
    controller.set_fan_mode(0, FanMode::Manual).unwrap();
    controller.set_manual_speed(0, 70).unwrap();

    let state = controller.public_state();
    assert_eq!(state.model_name, "Test Notebook");
    assert_eq!(state.fans.len(), 1);
    assert_eq!(state.fans[0].name, "CPU Fan");
    assert_eq!(state.fans[0].mode, FanMode::Manual);
    assert_eq!(state.fans[0].manual_speed, 70);
    // Thresholds are deep-copied into the snapshot, sorted.
    assert_eq!(state.fans[0].thresholds[0].up_threshold, 25);
}

#[test]
fn pushed_readings_surface_in_public_state() {
    let (controller, _journal) = controller_with(30.0, 0.0);
    controller.load_config(test_config(0)).unwrap();
    controller.set_sensor_source(SensorSource::Pushed);
    controller.update_temperatures(61.5, 48.0);

    let state = controller.public_state();
    assert_eq!(state.system_temp, 61.5);
    assert_eq!(state.gpu_temp, 48.0);
}

#[test]
fn tooltip_fires_once_on_load_config() {
    let texts: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let (mock, _journal) = MockEc::new();
    let driver = Arc::new(EcDriver::with_port_io(Box::new(mock)));
    let probe = Arc::new(StaticProbe { cpu: 0.0, gpu: 0.0 });
    let sink = Arc::clone(&texts);
    let controller = FanController::new(driver, probe, move |text| {
        sink.lock().unwrap().push(text.to_string());
    });

    controller.load_config(test_config(0)).unwrap();
    assert_eq!(texts.lock().unwrap().as_slice(), ["CPU: 0.0°C"]);
}

#[test]
fn settings_file_round_trip() {
    let settings = Settings {
        critical_temp: 82,
        safety_action: SafetyAction::ForceFullSpeed,
        enable_critical_temp_recovery: true,
        critical_temp_recovery_delta: 6,
    };
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(serde_json::to_string_pretty(&settings).unwrap().as_bytes())
        .unwrap();
    file.flush().unwrap();

    let loaded = Settings::from_json_file(file.path()).unwrap();
    assert_eq!(loaded.critical_temp, 82);
    assert_eq!(loaded.safety_action, SafetyAction::ForceFullSpeed);
    assert!(loaded.enable_critical_temp_recovery);
    assert_eq!(loaded.critical_temp_recovery_delta, 6);
}

#[test]
fn user_profiles_override_flows_into_controller() {
    // Host-side flow: load descriptor, apply profile overrides, hand the
    // result to the controller, observe the sorted override in GetConfig.
    let mut model_profiles = std::collections::HashMap::new();
    model_profiles.insert(
        "0".to_string(),
        UserProfile {
            thresholds: vec![threshold(65, 55, 100.0), threshold(35, 30, 20.0)],
        },
    );
    let mut profiles = UserProfiles::new();
    profiles.insert("Test Notebook".to_string(), model_profiles);

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(serde_json::to_string(&profiles).unwrap().as_bytes())
        .unwrap();
    file.flush().unwrap();

    let loaded = config::load_user_profiles(file.path()).unwrap();
    let mut model_config = test_config(0);
    config::apply_user_profiles(&mut model_config, &loaded);

    let (controller, _journal) = controller_with(30.0, 0.0);
    controller.load_config(model_config).unwrap();

    let config = controller.config().unwrap();
    let ups: Vec<i32> = config.fans[0]
        .thresholds
        .iter()
        .map(|t| t.up_threshold)
        .collect();
    assert_eq!(ups, vec![35, 65]);
    assert_eq!(config.fans[0].thresholds[1].fan_speed, 100.0);
}
