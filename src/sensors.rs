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

//! Temperature acquisition: the polled source.
//!
//! The polled source queries the platform's thermal zones synchronously on
//! each tick. Zone identifiers containing a GPU keyword are classified as
//! GPU; every other zone contributes to the CPU reading by maximum. Zone
//! temperatures are carried in deci-Kelvin (the ACPI reporting unit) and
//! converted to Celsius at the edge.

use std::fs;
use std::path::PathBuf;

use crate::error::{Result, VortecError};

/// Zone identifiers containing any of these (case-insensitive) are GPU.
const GPU_ZONE_KEYWORDS: &[&str] = &["gpu", "vga", "video", "3d"];

/// A system temperature snapshot in °C. Zero means "not reported".
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Temperatures {
    pub max_cpu: f64,
    pub gpu: f64,
}

/// Which temperature source feeds the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorSource {
    /// Synchronous thermal-zone query on each tick (fallback).
    Polled,
    /// Line-delimited JSON stream from the sensor sidecar (preferred).
    Pushed,
}

/// One thermal zone as reported by the platform.
#[derive(Clone, Debug)]
pub struct ZoneReading {
    pub name: String,
    pub deci_kelvin: u32,
}

/// Convert deci-Kelvin to Celsius, rounded to one decimal.
pub fn deci_kelvin_to_celsius(dk: u32) -> f64 {
    let celsius = (f64::from(dk) - 2732.0) / 10.0;
    (celsius * 10.0).round() / 10.0
}

/// Classify raw zone readings into a [`Temperatures`] snapshot.
///
/// Fails with [`VortecError::SourceUnavailable`] when no zone was
/// discovered. Negative Celsius results are clamped to 0.
pub fn classify_zones(zones: &[ZoneReading]) -> Result<Temperatures> {
    if zones.is_empty() {
        return Err(VortecError::SourceUnavailable(
            "no thermal zones discovered".into(),
        ));
    }

    let mut max_cpu_dk = 0u32;
    let mut max_gpu_dk = 0u32;
    for zone in zones {
        let name = zone.name.to_ascii_lowercase();
        let is_gpu = GPU_ZONE_KEYWORDS.iter().any(|kw| name.contains(kw));
        if is_gpu {
            max_gpu_dk = max_gpu_dk.max(zone.deci_kelvin);
        } else {
            max_cpu_dk = max_cpu_dk.max(zone.deci_kelvin);
        }
    }

    let max_cpu = deci_kelvin_to_celsius(max_cpu_dk).max(0.0);
    let gpu = if max_gpu_dk > 0 {
        deci_kelvin_to_celsius(max_gpu_dk).max(0.0)
    } else {
        0.0
    };
    Ok(Temperatures { max_cpu, gpu })
}

/// Synchronous source of system temperatures.
///
/// The controller holds the probe behind an `Arc` and calls it outside its
/// state lock, since a probe may block on slow platform queries.
pub trait TemperatureProbe: Send + Sync {
    fn sample(&self) -> Result<Temperatures>;
}

/// Probe over the ACPI thermal-zone tree (`/sys/class/thermal`). Kernel
/// readings are millidegrees Celsius; they are normalized to deci-Kelvin
/// before classification so all sources share one conversion path.
pub struct AcpiThermalProbe {
    root: PathBuf,
}

impl AcpiThermalProbe {
    pub fn new() -> Self {
        Self::with_root("/sys/class/thermal")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_zones(&self) -> Result<Vec<ZoneReading>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            VortecError::SourceUnavailable(format!(
                "cannot read {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let mut zones = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let dir_name = entry.file_name();
            if !dir_name.to_string_lossy().starts_with("thermal_zone") {
                continue;
            }
            let Ok(name) = fs::read_to_string(path.join("type")) else {
                continue;
            };
            let Ok(raw) = fs::read_to_string(path.join("temp")) else {
                continue;
            };
            let Ok(millidegrees) = raw.trim().parse::<i64>() else {
                continue;
            };
            let deci_kelvin = (millidegrees / 100 + 2732).max(0) as u32;
            zones.push(ZoneReading {
                name: name.trim().to_string(),
                deci_kelvin,
            });
        }
        Ok(zones)
    }
}

impl Default for AcpiThermalProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl TemperatureProbe for AcpiThermalProbe {
    fn sample(&self) -> Result<Temperatures> {
        classify_zones(&self.read_zones()?)
    }
}
