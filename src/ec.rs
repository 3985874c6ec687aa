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

//! EC Port Driver
//!
//! Blocking request/response protocol against the Embedded Controller's
//! command and data ports (0x66/0x62). Every public operation takes an
//! exclusive lock: the EC protocol is a stateful conversation on shared
//! ports, and any concurrent activity can deadlock the handshake or corrupt
//! readings. Each handshake wait polls the status byte up to 100 times at
//! 1 ms intervals, so a wedged EC surfaces as [`VortecError::EcTimeout`]
//! after ~100 ms per wait (~400 ms worst case per operation) instead of a
//! hang.

use std::fs::{File, OpenOptions};
use std::io;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::{Result, VortecError};

/// EC data port. Fixed by the platform, not configuration.
pub const EC_DATA_PORT: u16 = 0x62;
/// EC command/status port.
pub const EC_COMMAND_PORT: u16 = 0x66;

const EC_CMD_READ: u8 = 0x80;
const EC_CMD_WRITE: u8 = 0x81;

/// Output Buffer Full: the EC has deposited a result byte.
const STATUS_OBF: u8 = 0x01;
/// Input Buffer Full: the EC has not yet consumed our last write.
const STATUS_IBF: u8 = 0x02;

const WAIT_POLLS: u32 = 100;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Raw ISA port I/O seam.
///
/// The driver speaks the EC handshake through this trait so that the
/// protocol logic is independent of how port access is obtained. Production
/// uses [`DevPort`]; tests and `--mock` mode use [`crate::mock::MockEc`].
pub trait PortIo: Send {
    fn inb(&mut self, port: u16) -> io::Result<u8>;
    fn outb(&mut self, port: u16, value: u8) -> io::Result<()>;
}

/// Port I/O via `/dev/port`, the kernel's byte-addressable view of the ISA
/// I/O space. Requires root.
pub struct DevPort {
    file: File,
}

impl DevPort {
    pub fn open() -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/port")?;
        Ok(Self { file })
    }
}

impl PortIo for DevPort {
    fn inb(&mut self, port: u16) -> io::Result<u8> {
        use std::os::unix::fs::FileExt;
        let mut buf = [0u8; 1];
        self.file.read_exact_at(&mut buf, u64::from(port))?;
        Ok(buf[0])
    }

    fn outb(&mut self, port: u16, value: u8) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(&[value], u64::from(port))
    }
}

/// Thread-safe driver for the notebook's Embedded Controller.
///
/// There is one EC per machine; the process owns a single long-lived
/// instance and shares it by `Arc`. [`close`](EcDriver::close) releases the
/// underlying handle, after which every operation reports
/// [`VortecError::DriverUnavailable`].
pub struct EcDriver {
    io: Mutex<Option<Box<dyn PortIo>>>,
}

impl EcDriver {
    /// Open the driver on `/dev/port`.
    pub fn open() -> Result<Self> {
        let port = DevPort::open().map_err(|e| {
            VortecError::DriverUnavailable(format!("cannot open /dev/port: {}", e))
        })?;
        Ok(Self::with_port_io(Box::new(port)))
    }

    /// Build a driver over an arbitrary port I/O implementation.
    pub fn with_port_io(io: Box<dyn PortIo>) -> Self {
        Self {
            io: Mutex::new(Some(io)),
        }
    }

    /// Read the byte held in `register`.
    pub fn read_byte(&self, register: u8) -> Result<u8> {
        let mut guard = self.lock_io()?;
        let io = Self::io_mut(&mut guard)?;
        Self::raw_read(io.as_mut(), register)
    }

    /// Set `register` to `value`.
    pub fn write_byte(&self, register: u8, value: u8) -> Result<()> {
        let mut guard = self.lock_io()?;
        let io = Self::io_mut(&mut guard)?;
        Self::raw_write(io.as_mut(), register, value)
    }

    /// Read a 16-bit big-endian value from `register` (high byte) and
    /// `register + 1` (low byte). Used for RPM registers.
    ///
    /// The lock is held across both byte reads so the pair cannot be split
    /// by another caller.
    pub fn read_word(&self, register: u8) -> Result<u16> {
        let mut guard = self.lock_io()?;
        let io = Self::io_mut(&mut guard)?;
        let hi = Self::raw_read(io.as_mut(), register)?;
        let lo = Self::raw_read(io.as_mut(), register.wrapping_add(1))?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    /// Release the underlying port handle. Idempotent.
    pub fn close(&self) {
        if let Ok(mut guard) = self.io.lock() {
            guard.take();
        }
    }

    fn lock_io(&self) -> Result<std::sync::MutexGuard<'_, Option<Box<dyn PortIo>>>> {
        self.io
            .lock()
            .map_err(|_| VortecError::DriverUnavailable("driver lock poisoned".into()))
    }

    fn io_mut<'a>(
        guard: &'a mut std::sync::MutexGuard<'_, Option<Box<dyn PortIo>>>,
    ) -> Result<&'a mut Box<dyn PortIo>> {
        guard
            .as_mut()
            .ok_or_else(|| VortecError::DriverUnavailable("driver is closed".into()))
    }

    fn raw_read(io: &mut dyn PortIo, register: u8) -> Result<u8> {
        Self::wait_ibf_clear(io, "waiting to send read command")?;
        Self::outb(io, EC_COMMAND_PORT, EC_CMD_READ)?;
        Self::wait_ibf_clear(io, "waiting to send register address")?;
        Self::outb(io, EC_DATA_PORT, register)?;
        Self::wait_obf_set(io, "waiting for read data")?;
        Self::inb(io, EC_DATA_PORT)
    }

    fn raw_write(io: &mut dyn PortIo, register: u8, value: u8) -> Result<()> {
        Self::wait_ibf_clear(io, "waiting to send write command")?;
        Self::outb(io, EC_COMMAND_PORT, EC_CMD_WRITE)?;
        Self::wait_ibf_clear(io, "waiting to send register address")?;
        Self::outb(io, EC_DATA_PORT, register)?;
        Self::wait_ibf_clear(io, "waiting to send register value")?;
        Self::outb(io, EC_DATA_PORT, value)
    }

    /// Poll until the Input Buffer Full bit clears: the EC is ready to
    /// accept a command or data byte.
    fn wait_ibf_clear(io: &mut dyn PortIo, stage: &'static str) -> Result<()> {
        for _ in 0..WAIT_POLLS {
            if Self::inb(io, EC_COMMAND_PORT)? & STATUS_IBF == 0 {
                return Ok(());
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
        warn!("EC input buffer did not clear ({})", stage);
        Err(VortecError::EcTimeout { stage })
    }

    /// Poll until the Output Buffer Full bit sets: the EC has data for us.
    fn wait_obf_set(io: &mut dyn PortIo, stage: &'static str) -> Result<()> {
        for _ in 0..WAIT_POLLS {
            if Self::inb(io, EC_COMMAND_PORT)? & STATUS_OBF != 0 {
                return Ok(());
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
        warn!("EC output buffer did not fill ({})", stage);
        Err(VortecError::EcTimeout { stage })
    }

    fn inb(io: &mut dyn PortIo, port: u16) -> Result<u8> {
        io.inb(port)
            .map_err(|e| VortecError::DriverUnavailable(format!("port read failed: {}", e)))
    }

    fn outb(io: &mut dyn PortIo, port: u16, value: u8) -> Result<()> {
        io.outb(port, value)
            .map_err(|e| VortecError::DriverUnavailable(format!("port write failed: {}", e)))
    }
}
