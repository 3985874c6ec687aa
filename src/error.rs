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

//! Unified error type for all Vortec operations.

use std::io;

/// Result type alias using [`VortecError`].
pub type Result<T> = std::result::Result<T, VortecError>;

#[derive(thiserror::Error, Debug)]
pub enum VortecError {
    /// The EC status byte did not reach the expected state within the
    /// bounded polling window (100 polls at 1 ms).
    #[error("EC timeout while {stage}")]
    EcTimeout { stage: &'static str },

    /// The port I/O primitive could not be obtained, or the driver has
    /// already been closed.
    #[error("EC driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("invalid fan index: {0}")]
    InvalidFanIndex(usize),

    #[error("no configuration loaded")]
    NoConfigLoaded,

    #[error("temperature source unavailable: {0}")]
    SourceUnavailable(String),

    /// Internal watchdog signal; never surfaced through the public API.
    #[error("sensor data is stale")]
    StaleSensorData,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl VortecError {
    /// Create an `InvalidConfig` error from a string.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
