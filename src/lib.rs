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

//! Vortec - notebook fan control core
//!
//! This library provides the fan-control core of a notebook thermal
//! management system: the EC port driver, the curve-driven fan controller
//! with its safety envelope, and temperature acquisition with a
//! pushed/polled fallback policy. Under any failure or unexpected
//! termination, control of the fans is returned to the system BIOS.

pub mod config;
pub mod controller;
pub mod curve;
pub mod ec;
pub mod error;
pub mod mock;
pub mod sensors;
pub mod settings;
pub mod sidecar;

pub use controller::{FanController, FanMode, PublicFanState, PublicState};
pub use error::{Result, VortecError};
