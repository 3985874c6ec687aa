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

//! Machine model descriptor: which EC registers drive which fan, and the
//! temperature curve for each.
//!
//! The descriptor is immutable after load. Threshold tables may arrive in
//! any order; the controller sorts them ascending by `up_threshold` during
//! `load_config` and validates the curve shape.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VortecError};

/// Fallback tick period when the descriptor omits `ec_poll_interval_ms`.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// One level of a fan curve. The fan runs at `fan_speed` percent once the
/// temperature reaches `up_threshold`, and keeps running at it until the
/// temperature drops below `down_threshold`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub up_threshold: i32,
    pub down_threshold: i32,
    pub fan_speed: f64,
}

/// Register map and curve for a single fan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FanConfig {
    pub display_name: String,
    pub read_register: u8,
    pub write_register: u8,
    /// Word-aligned base register holding raw 16-bit RPM, if the EC has one.
    #[serde(default)]
    pub rpm_register: Option<u8>,
    pub min_speed_value: u8,
    pub max_speed_value: u8,
    pub reset_required: bool,
    /// Byte written to hand the fan back to BIOS control.
    pub fan_speed_reset_value: u8,
    pub thresholds: Vec<Threshold>,
}

/// Per-machine configuration, loaded once and replaced only through
/// `stop` + `load_config`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub model_name: String,
    #[serde(default)]
    pub ec_poll_interval_ms: u64,
    pub critical_temperature: i32,
    pub fans: Vec<FanConfig>,
}

impl Config {
    /// Parse a model descriptor from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Tick period, with the zero-means-default fallback.
    pub fn poll_interval(&self) -> Duration {
        let ms = if self.ec_poll_interval_ms == 0 {
            DEFAULT_POLL_INTERVAL_MS
        } else {
            self.ec_poll_interval_ms
        };
        Duration::from_millis(ms)
    }

    /// Sort every fan's thresholds ascending by `up_threshold`. The curve
    /// evaluator assumes this order.
    pub fn sort_thresholds(&mut self) {
        for fan in &mut self.fans {
            fan.thresholds
                .sort_by_key(|threshold| threshold.up_threshold);
        }
    }

    /// Check the invariants the controller relies on. Expects thresholds
    /// already sorted (see [`sort_thresholds`](Config::sort_thresholds)).
    pub fn validate(&self) -> Result<()> {
        for (index, fan) in self.fans.iter().enumerate() {
            if fan.min_speed_value > fan.max_speed_value {
                return Err(VortecError::config(format!(
                    "fan {}: min_speed_value {} exceeds max_speed_value {}",
                    index, fan.min_speed_value, fan.max_speed_value
                )));
            }
            for threshold in &fan.thresholds {
                if threshold.down_threshold > threshold.up_threshold {
                    return Err(VortecError::config(format!(
                        "fan {}: down_threshold {} above up_threshold {}",
                        index, threshold.down_threshold, threshold.up_threshold
                    )));
                }
                if !(0.0..=100.0).contains(&threshold.fan_speed) {
                    return Err(VortecError::config(format!(
                        "fan {}: fan_speed {} out of range",
                        index, threshold.fan_speed
                    )));
                }
            }
            for pair in fan.thresholds.windows(2) {
                if pair[1].up_threshold <= pair[0].up_threshold {
                    return Err(VortecError::config(format!(
                        "fan {}: up_thresholds must be strictly increasing ({} then {})",
                        index, pair[0].up_threshold, pair[1].up_threshold
                    )));
                }
                if pair[1].fan_speed < pair[0].fan_speed {
                    return Err(VortecError::config(format!(
                        "fan {}: fan_speed must not decrease as temperature rises \
                         ({} at {}°C, {} at {}°C)",
                        index,
                        pair[0].fan_speed,
                        pair[0].up_threshold,
                        pair[1].fan_speed,
                        pair[1].up_threshold
                    )));
                }
            }
        }
        Ok(())
    }
}

/// User-authored replacement curve for one fan of one machine model.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub thresholds: Vec<Threshold>,
}

/// Saved curve overrides, keyed by model name and then by fan index
/// (stringified, as it appears in the profile file).
pub type UserProfiles = HashMap<String, HashMap<String, UserProfile>>;

/// Load user profiles from a JSON file. A missing file is an empty set.
pub fn load_user_profiles(path: impl AsRef<Path>) -> Result<UserProfiles> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(UserProfiles::new());
    }
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Replace per-fan threshold tables with the user's overrides for this
/// model. Performed by the caller before handing the config to the
/// controller.
pub fn apply_user_profiles(config: &mut Config, profiles: &UserProfiles) {
    let Some(model_profiles) = profiles.get(&config.model_name) else {
        return;
    };
    for (index, fan) in config.fans.iter_mut().enumerate() {
        if let Some(profile) = model_profiles.get(&index.to_string()) {
            fan.thresholds = profile.thresholds.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn threshold(up: i32, down: i32, speed: f64) -> Threshold {
        Threshold {
            up_threshold: up,
            down_threshold: down,
            fan_speed: speed,
        }
    }

    fn test_config() -> Config {
        Config {
            model_name: "Aspire 5750G".to_string(),
            ec_poll_interval_ms: 0,
            critical_temperature: 85,
            fans: vec![FanConfig {
                display_name: "CPU Fan".to_string(),
                read_register: 0x9A,
                write_register: 0x93,
                rpm_register: Some(0xC0),
                min_speed_value: 0,
                max_speed_value: 0xAF,
                reset_required: true,
                fan_speed_reset_value: 0xFF,
                thresholds: vec![
                    threshold(70, 60, 80.0),
                    threshold(25, 20, 0.0),
                    threshold(50, 40, 30.0),
                ],
            }],
        }
    }

    #[test]
    fn poll_interval_falls_back_when_zero() {
        let mut config = test_config();
        assert_eq!(config.poll_interval(), Duration::from_millis(1000));
        config.ec_poll_interval_ms = 250;
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn sort_orders_thresholds_ascending() {
        let mut config = test_config();
        config.sort_thresholds();
        let ups: Vec<i32> = config.fans[0]
            .thresholds
            .iter()
            .map(|t| t.up_threshold)
            .collect();
        assert_eq!(ups, vec![25, 50, 70]);
    }

    #[test]
    fn validate_accepts_sorted_config() {
        let mut config = test_config();
        config.sort_thresholds();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_speed_range() {
        let mut config = test_config();
        config.sort_thresholds();
        config.fans[0].min_speed_value = 200;
        config.fans[0].max_speed_value = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_band() {
        let mut config = test_config();
        config.sort_thresholds();
        config.fans[0].thresholds[1].down_threshold = 55;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_up_thresholds() {
        let mut config = test_config();
        config.sort_thresholds();
        config.fans[0].thresholds[1].up_threshold = 25;
        config.sort_thresholds();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_decreasing_fan_speed() {
        let mut config = test_config();
        config.sort_thresholds();
        config.fans[0].thresholds[2].fan_speed = 10.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_speed() {
        let mut config = test_config();
        config.sort_thresholds();
        config.fans[0].thresholds[0].fan_speed = 130.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn descriptor_loads_from_json_file() {
        let config = test_config();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string_pretty(&config).unwrap().as_bytes())
            .unwrap();
        file.flush().unwrap();

        let loaded = Config::from_json_file(file.path()).unwrap();
        assert_eq!(loaded.model_name, "Aspire 5750G");
        assert_eq!(loaded.fans.len(), 1);
        assert_eq!(loaded.fans[0].rpm_register, Some(0xC0));
        assert_eq!(loaded.fans[0].thresholds.len(), 3);
    }

    #[test]
    fn rpm_register_defaults_to_absent() {
        let json = r#"{
            "model_name": "Test",
            "critical_temperature": 80,
            "fans": [{
                "display_name": "Fan",
                "read_register": 146,
                "write_register": 147,
                "min_speed_value": 0,
                "max_speed_value": 255,
                "reset_required": false,
                "fan_speed_reset_value": 0,
                "thresholds": []
            }]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.fans[0].rpm_register, None);
        assert_eq!(config.ec_poll_interval_ms, 0);
    }

    #[test]
    fn user_profile_replaces_matching_fan_curve() {
        let mut config = test_config();
        let mut model_profiles = HashMap::new();
        model_profiles.insert(
            "0".to_string(),
            UserProfile {
                thresholds: vec![threshold(60, 50, 100.0)],
            },
        );
        let mut profiles = UserProfiles::new();
        profiles.insert("Aspire 5750G".to_string(), model_profiles);

        apply_user_profiles(&mut config, &profiles);
        assert_eq!(config.fans[0].thresholds.len(), 1);
        assert_eq!(config.fans[0].thresholds[0].fan_speed, 100.0);
    }

    #[test]
    fn user_profile_for_other_model_is_ignored() {
        let mut config = test_config();
        let mut profiles = UserProfiles::new();
        profiles.insert("Other Model".to_string(), HashMap::new());

        apply_user_profiles(&mut config, &profiles);
        assert_eq!(config.fans[0].thresholds.len(), 3);
    }

    #[test]
    fn missing_profile_file_is_empty_set() {
        let profiles = load_user_profiles("/nonexistent/user_profiles.json").unwrap();
        assert!(profiles.is_empty());
    }
}
