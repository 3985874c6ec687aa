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

//! Runtime settings, mutable from outside the controller.
//!
//! The controller copies the current settings into its state on
//! `update_settings`; the copy is the authoritative view during a tick.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::Result;

/// What the safety envelope does when the critical temperature is exceeded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyAction {
    /// Hand every fan back to the BIOS and stop driving them.
    #[default]
    BiosControl,
    /// Pin every fan to 100%.
    ForceFullSpeed,
}

impl<'de> Deserialize<'de> for SafetyAction {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "bios_control" => SafetyAction::BiosControl,
            "force_full_speed" => SafetyAction::ForceFullSpeed,
            other => {
                // Unrecognized values get the conservative action.
                warn!("unknown safety_action '{}', using bios_control", other);
                SafetyAction::BiosControl
            }
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    /// Critical temperature in °C. Zero defers to the model descriptor's
    /// `critical_temperature`.
    #[serde(default)]
    pub critical_temp: i32,
    #[serde(default)]
    pub safety_action: SafetyAction,
    #[serde(default)]
    pub enable_critical_temp_recovery: bool,
    #[serde(default = "default_recovery_delta")]
    pub critical_temp_recovery_delta: i32,
}

fn default_recovery_delta() -> i32 {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            critical_temp: 0,
            safety_action: SafetyAction::BiosControl,
            enable_critical_temp_recovery: false,
            critical_temp_recovery_delta: default_recovery_delta(),
        }
    }
}

impl Settings {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}
