/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Wall-clock and NTP/PTP synchronization status, injected as a trait
//! so tests can substitute a deterministic fake instead of querying the
//! real system clock and a `chronyc`/`ntpq` subprocess.

use libc::{CLOCK_REALTIME, clock_gettime, timespec};
use std::{
    process::Command,
    sync::{Arc, Mutex},
};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClockStatus {
    /// Local-clock-minus-reference offset in milliseconds, when known.
    pub offset_ms: Option<f64>,
    /// True when `offset_ms` is present and within the sync tolerance.
    pub synchronized: bool,
}

/// Tolerance for treating the time authority's reported offset as
/// "synchronized" (spec.md §4.5).
const SYNC_TOLERANCE_MS: f64 = 100.0;

pub trait Clock: Send + Sync {
    /// Current UTC time as fractional seconds since the Unix epoch.
    fn now_utc(&self) -> f64;
    fn status(&self) -> ClockStatus;
    /// Re-query the time authority. Called periodically by the
    /// supervisor; a no-op for clocks that have no external authority.
    fn refresh(&self);
}

/// Queries an external process for the local clock's offset from a
/// reference (NTP/PTP) source. Mirrors the subprocess-wrapping idiom
/// used by the sibling `ptp4l-wrapper` crate, generalized to any
/// command that prints a parseable offset.
pub trait TimeAuthority: Send + Sync {
    /// Returns the offset of the local clock from the reference, in
    /// milliseconds (positive: local clock ahead), or `None` if the
    /// authority could not be queried or reported no lock.
    fn query_offset_ms(&self) -> Option<f64>;
}

pub struct ChronyTimeAuthority {
    command: String,
    args: Vec<String>,
}

impl ChronyTimeAuthority {
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self { command, args }
    }
}

impl TimeAuthority for ChronyTimeAuthority {
    fn query_offset_ms(&self) -> Option<f64> {
        let output = match Command::new(&self.command).args(&self.args).output() {
            Ok(o) => o,
            Err(e) => {
                warn!("could not run time authority command {}: {e}", self.command);
                return None;
            }
        };
        if !output.status.success() {
            warn!("time authority command {} exited unsuccessfully", self.command);
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_chrony_offset_ms(&stdout)
    }
}

/// Parses the `System time` line of `chronyc tracking`, e.g.
/// `System time     : 0.000123456 seconds fast of NTP time`.
fn parse_chrony_offset_ms(stdout: &str) -> Option<f64> {
    for line in stdout.lines() {
        if let Some(rest) = line.split(':').nth(1) {
            if line.starts_with("System time") {
                let rest = rest.trim();
                let mut fields = rest.split_whitespace();
                let seconds: f64 = fields.next()?.parse().ok()?;
                let direction = fields.nth(1)?; // "fast" or "slow"
                let signed = if direction == "slow" { -seconds } else { seconds };
                return Some(signed * 1000.0);
            }
        }
    }
    None
}

struct SystemClockInner {
    authority: Arc<dyn TimeAuthority>,
    status: ClockStatus,
}

pub struct SystemClock {
    inner: Mutex<SystemClockInner>,
}

impl SystemClock {
    pub fn new(authority: Arc<dyn TimeAuthority>) -> Self {
        Self {
            inner: Mutex::new(SystemClockInner {
                authority,
                status: ClockStatus::default(),
            }),
        }
    }

    fn system_timespec() -> timespec {
        let mut tp = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { clock_gettime(CLOCK_REALTIME, &mut tp) } == -1 {
            crate::defect!("clock_gettime(CLOCK_REALTIME) failed");
        }
        tp
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> f64 {
        let tp = Self::system_timespec();
        tp.tv_sec as f64 + tp.tv_nsec as f64 / 1_000_000_000.0
    }

    fn status(&self) -> ClockStatus {
        self.inner.lock().expect("clock mutex poisoned").status
    }

    fn refresh(&self) {
        let mut inner = self.inner.lock().expect("clock mutex poisoned");
        inner.status = match inner.authority.query_offset_ms() {
            Some(offset_ms) => ClockStatus {
                offset_ms: Some(offset_ms),
                synchronized: offset_ms.abs() < SYNC_TOLERANCE_MS,
            },
            None => ClockStatus::default(),
        };
    }
}
