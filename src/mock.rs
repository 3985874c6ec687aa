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

//! Simulated Embedded Controller.
//!
//! [`MockEc`] implements the [`PortIo`] seam with a small state machine that
//! mirrors the real EC handshake: command latch, one-byte data path, IBF/OBF
//! status bits with configurable latencies. It backs the test suite and the
//! daemon's `--mock` mode, so the full control loop can run on machines
//! without EC access.
//!
//! The paired [`EcJournal`] handle shares the simulator state and lets a
//! test seed registers, inject latencies, and inspect the write history.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::ec::{PortIo, EC_COMMAND_PORT, EC_DATA_PORT};

const CMD_READ: u8 = 0x80;
const CMD_WRITE: u8 = 0x81;
const OBF: u8 = 0x01;
const IBF: u8 = 0x02;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitReadRegister,
    AwaitWriteRegister,
    AwaitWriteValue(u8),
    DataReady,
}

struct EcSim {
    registers: [u8; 256],
    phase: Phase,
    pending_value: u8,
    /// IBF stays set until this instant after every host write.
    busy_until: Option<Instant>,
    /// OBF rises at this instant once read data is latched.
    data_ready_at: Option<Instant>,
    ibf_latency: Duration,
    obf_latency: Duration,
    /// When set, IBF never clears. Models a wedged controller.
    wedged: bool,
    io_error: bool,
    writes: Vec<(u8, u8)>,
    protocol_errors: u32,
}

impl EcSim {
    fn status(&self, now: Instant) -> u8 {
        let mut status = 0;
        if self.wedged || self.busy_until.map_or(false, |t| now < t) {
            status |= IBF;
        }
        if self.phase == Phase::DataReady && self.data_ready_at.map_or(false, |t| now >= t) {
            status |= OBF;
        }
        status
    }

    fn consume(&mut self, now: Instant) {
        self.busy_until = Some(now + self.ibf_latency);
    }
}

/// Simulated EC port I/O. Create with [`MockEc::new`], which also returns
/// the [`EcJournal`] observation handle.
pub struct MockEc {
    sim: Arc<Mutex<EcSim>>,
}

impl MockEc {
    pub fn new() -> (Self, EcJournal) {
        let sim = Arc::new(Mutex::new(EcSim {
            registers: [0; 256],
            phase: Phase::Idle,
            pending_value: 0,
            busy_until: None,
            data_ready_at: None,
            ibf_latency: Duration::ZERO,
            obf_latency: Duration::ZERO,
            wedged: false,
            io_error: false,
            writes: Vec::new(),
            protocol_errors: 0,
        }));
        let journal = EcJournal {
            sim: Arc::clone(&sim),
        };
        (Self { sim }, journal)
    }
}

impl PortIo for MockEc {
    fn inb(&mut self, port: u16) -> io::Result<u8> {
        let mut sim = self.sim.lock().unwrap();
        if sim.io_error {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated port failure"));
        }
        let now = Instant::now();
        match port {
            EC_COMMAND_PORT => Ok(sim.status(now)),
            EC_DATA_PORT => {
                if sim.phase == Phase::DataReady && sim.data_ready_at.map_or(false, |t| now >= t) {
                    sim.phase = Phase::Idle;
                    sim.data_ready_at = None;
                    Ok(sim.pending_value)
                } else {
                    sim.protocol_errors += 1;
                    Ok(0)
                }
            }
            _ => {
                sim.protocol_errors += 1;
                Ok(0)
            }
        }
    }

    fn outb(&mut self, port: u16, value: u8) -> io::Result<()> {
        let mut sim = self.sim.lock().unwrap();
        if sim.io_error {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated port failure"));
        }
        let now = Instant::now();
        match port {
            EC_COMMAND_PORT => {
                if sim.phase != Phase::Idle {
                    sim.protocol_errors += 1;
                }
                sim.phase = match value {
                    CMD_READ => Phase::AwaitReadRegister,
                    CMD_WRITE => Phase::AwaitWriteRegister,
                    _ => {
                        sim.protocol_errors += 1;
                        Phase::Idle
                    }
                };
                sim.consume(now);
            }
            EC_DATA_PORT => match sim.phase {
                Phase::AwaitReadRegister => {
                    sim.pending_value = sim.registers[value as usize];
                    sim.phase = Phase::DataReady;
                    sim.data_ready_at = Some(now + sim.obf_latency);
                    sim.consume(now);
                }
                Phase::AwaitWriteRegister => {
                    sim.phase = Phase::AwaitWriteValue(value);
                    sim.consume(now);
                }
                Phase::AwaitWriteValue(register) => {
                    sim.registers[register as usize] = value;
                    sim.writes.push((register, value));
                    sim.phase = Phase::Idle;
                    sim.consume(now);
                }
                _ => {
                    sim.protocol_errors += 1;
                }
            },
            _ => {
                sim.protocol_errors += 1;
            }
        }
        Ok(())
    }
}

/// Observation and configuration handle for a [`MockEc`]. Cloneable; all
/// clones share the same simulator.
#[derive(Clone)]
pub struct EcJournal {
    sim: Arc<Mutex<EcSim>>,
}

impl EcJournal {
    /// Seed an EC register with a value.
    pub fn set_register(&self, register: u8, value: u8) {
        self.sim.lock().unwrap().registers[register as usize] = value;
    }

    /// Seed a 16-bit big-endian value at `register`/`register + 1`.
    pub fn set_word(&self, register: u8, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        let mut sim = self.sim.lock().unwrap();
        sim.registers[register as usize] = hi;
        sim.registers[register.wrapping_add(1) as usize] = lo;
    }

    /// Current value of an EC register.
    pub fn register(&self, register: u8) -> u8 {
        self.sim.lock().unwrap().registers[register as usize]
    }

    /// Handshake latencies: how long IBF stays set after a host write, and
    /// how long the EC takes to raise OBF after latching read data.
    pub fn set_latencies(&self, ibf: Duration, obf: Duration) {
        let mut sim = self.sim.lock().unwrap();
        sim.ibf_latency = ibf;
        sim.obf_latency = obf;
    }

    /// IBF never clears from now on.
    pub fn wedge(&self) {
        self.sim.lock().unwrap().wedged = true;
    }

    /// Make every port access fail at the I/O layer.
    pub fn set_io_error(&self, fail: bool) {
        self.sim.lock().unwrap().io_error = fail;
    }

    /// Complete write history as `(register, value)` pairs.
    pub fn writes(&self) -> Vec<(u8, u8)> {
        self.sim.lock().unwrap().writes.clone()
    }

    /// Values written to one register, in order.
    pub fn writes_to(&self, register: u8) -> Vec<u8> {
        self.sim
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(r, _)| *r == register)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Most recent value written to one register.
    pub fn last_write_to(&self, register: u8) -> Option<u8> {
        self.writes_to(register).last().copied()
    }

    pub fn clear_writes(&self) {
        self.sim.lock().unwrap().writes.clear();
    }

    /// Count of out-of-sequence port interactions observed so far.
    pub fn protocol_errors(&self) -> u32 {
        self.sim.lock().unwrap().protocol_errors
    }
}
