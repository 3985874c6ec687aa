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

//! Temperature acquisition: the pushed source.
//!
//! An external sensor sidecar emits one JSON object per line on stdout at
//! its own cadence. [`SidecarMonitor`] owns the process: it spawns it, reads
//! and parses the stream on a dedicated thread, and forwards readings over a
//! bounded channel as [`SidecarEvent::Data`]. The controller tick never
//! blocks on this source.
//!
//! A sidecar that exits or fails to start is retried once (2 attempts total)
//! with a 2 s backoff. After the final failure a single
//! [`SidecarEvent::Failed`] is emitted and the monitor stays down for the
//! rest of the run; the receiving side is expected to switch the controller
//! to the polled source.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::sensors::Temperatures;

const START_ATTEMPTS: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_secs(2);
/// Bounded ingress queue; at a ~1 Hz tick a handful of slots is plenty.
const CHANNEL_CAPACITY: usize = 8;

/// Events emitted by the sidecar reader thread.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SidecarEvent {
    Data(Temperatures),
    /// The sidecar is gone for good this run.
    Failed,
}

/// One record of the sidecar wire format. Only the fields the core consumes
/// are modeled; the sidecar is free to send more (load, power, memory,
/// battery) and serde ignores them.
#[derive(Debug, Default, Deserialize)]
struct SidecarRecord {
    #[serde(default)]
    cpu: CpuReading,
    #[serde(default)]
    gpu: GpuReading,
}

#[derive(Debug, Default, Deserialize)]
struct CpuReading {
    #[serde(rename = "packageTemp", default)]
    package_temp: f64,
}

#[derive(Debug, Default, Deserialize)]
struct GpuReading {
    #[serde(default)]
    temp: f64,
}

/// Parse one wire line. Empty lines are skipped silently; parse errors on
/// non-empty lines are logged and the line is dropped.
fn parse_line(line: &str) -> Option<Temperatures> {
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<SidecarRecord>(line) {
        Ok(record) => Some(Temperatures {
            max_cpu: record.cpu.package_temp,
            gpu: record.gpu.temp,
        }),
        Err(e) => {
            warn!("ignoring malformed sidecar record: {}", e);
            None
        }
    }
}

/// Owns the sidecar process and its reader thread.
pub struct SidecarMonitor {
    stop: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    worker: Option<JoinHandle<()>>,
}

impl SidecarMonitor {
    /// Launch the sidecar and return the monitor plus the event receiver.
    pub fn spawn(executable: PathBuf) -> (Self, Receiver<SidecarEvent>) {
        Self::spawn_with_policy(executable, START_ATTEMPTS, RETRY_DELAY)
    }

    fn spawn_with_policy(
        executable: PathBuf,
        attempts: u32,
        retry_delay: Duration,
    ) -> (Self, Receiver<SidecarEvent>) {
        let (tx, rx) = mpsc::sync_channel(CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let child = Arc::new(Mutex::new(None));

        let worker = {
            let stop = Arc::clone(&stop);
            let child = Arc::clone(&child);
            let failed_tx = tx.clone();
            match thread::Builder::new()
                .name("vortec-sidecar".into())
                .spawn(move || run_sidecar(executable, tx, stop, child, attempts, retry_delay))
            {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("failed to spawn sidecar reader thread: {}", e);
                    let _ = failed_tx.try_send(SidecarEvent::Failed);
                    None
                }
            }
        };

        (
            Self {
                stop,
                child,
                worker,
            },
            rx,
        )
    }

    /// Kill the sidecar and join the reader thread. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.child.lock() {
            if let Some(child) = slot.as_mut() {
                let _ = child.kill();
            }
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SidecarMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_sidecar(
    executable: PathBuf,
    tx: SyncSender<SidecarEvent>,
    stop: Arc<AtomicBool>,
    child_slot: Arc<Mutex<Option<Child>>>,
    attempts: u32,
    retry_delay: Duration,
) {
    for attempt in 1..=attempts {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        if attempt > 1 {
            thread::sleep(retry_delay);
            if stop.load(Ordering::SeqCst) {
                return;
            }
        }

        info!(
            "starting sensor sidecar {} (attempt {})",
            executable.display(),
            attempt
        );
        let spawned = Command::new(&executable)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("failed to start sensor sidecar: {}", e);
                continue;
            }
        };

        let stdout = child.stdout.take();
        if let Ok(mut slot) = child_slot.lock() {
            *slot = Some(child);
        }

        if let Some(stdout) = stdout {
            read_stream(stdout, &tx, &stop);
        }

        // Reap the process once the pipe closes.
        let status = child_slot
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .map(|mut child| child.wait());

        if stop.load(Ordering::SeqCst) {
            return;
        }
        warn!("sensor sidecar exited ({:?})", status);
    }

    warn!(
        "sensor sidecar gave up after {} attempts; requesting polled fallback",
        attempts
    );
    let _ = tx.try_send(SidecarEvent::Failed);
}

fn read_stream(stdout: impl std::io::Read, tx: &SyncSender<SidecarEvent>, stop: &AtomicBool) {
    let reader = BufReader::new(stdout);
    for line in reader.lines() {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!("sidecar stdout closed: {}", e);
                return;
            }
        };
        if let Some(temps) = parse_line(&line) {
            match tx.try_send(SidecarEvent::Data(temps)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // The consumer is behind; newer data will follow.
                    debug!("sidecar channel full, dropping sample");
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}
