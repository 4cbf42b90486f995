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

//! Periodic process-wide tick (spec.md §4.7): refreshes the clock,
//! polls per-channel liveness, and runs the startup session-boundary
//! scan once before entering the tick loop.

use crate::{
    anchor::AnchorManager,
    archive::container::read_meta_json,
    channel::ChannelProcessor,
    clock::Clock,
    config::SupervisorConfig,
};
use serde::Serialize;
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};
use tracing::{info, warn};

/// Gap beyond which a startup scan records a [`SessionGapEvent`]
/// instead of treating the previous archive as a continuous session
/// (spec.md §4.7 item 3).
const SESSION_GAP_THRESHOLD_SECS: f64 = 120.0;

struct ManagedChannel {
    processor: Arc<ChannelProcessor>,
    anchor_manager: Mutex<AnchorManager>,
}

pub struct Supervisor {
    clock: Arc<dyn Clock>,
    channels: Vec<ManagedChannel>,
    data_root: PathBuf,
    config: SupervisorConfig,
    shutdown: Arc<AtomicBool>,
}

#[derive(Serialize)]
struct SessionGapEvent {
    previous_end_utc: f64,
    current_start_utc: f64,
    gap_seconds: f64,
    detected_at: f64,
}

impl Supervisor {
    pub fn new(
        clock: Arc<dyn Clock>,
        channels: Vec<Arc<ChannelProcessor>>,
        data_root: PathBuf,
        config: SupervisorConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let channels = channels
            .into_iter()
            .map(|processor| {
                let sample_rate = processor.spec().sample_rate;
                ManagedChannel {
                    processor,
                    anchor_manager: Mutex::new(AnchorManager::new(sample_rate, clock.clone())),
                }
            })
            .collect();
        Self {
            clock,
            channels,
            data_root,
            config,
            shutdown,
        }
    }

    /// Blocking loop: run on its own dedicated thread. Returns once
    /// `shutdown` is observed set.
    pub fn run(&self) {
        self.startup_session_boundary_scan();
        while !self.shutdown.load(Ordering::Relaxed) {
            self.tick();
            self.sleep_until_next_tick();
        }
    }

    fn sleep_until_next_tick(&self) {
        let step = Duration::from_millis(250);
        let mut waited = Duration::ZERO;
        while waited < self.config.tick_interval && !self.shutdown.load(Ordering::Relaxed) {
            let remaining = self.config.tick_interval - waited;
            thread::sleep(step.min(remaining));
            waited += step;
        }
    }

    fn tick(&self) {
        self.clock.refresh();
        let now = self.clock.now_utc();

        for ch in &self.channels {
            let health = ch.processor.health();
            let silence = health.last_packet_utc.map(|t| now - t);

            if let Some(silence) = silence {
                if silence > self.config.silence_grace.as_secs_f64() {
                    warn!(
                        channel = %ch.processor.spec().name,
                        silence_secs = silence,
                        "channel silent beyond grace period, flushing to cap the open minute"
                    );
                    if let Err(e) = ch.processor.flush() {
                        warn!(channel = %ch.processor.spec().name, "flush failed: {e}");
                    }
                } else if silence > self.config.silence_threshold.as_secs_f64() {
                    warn!(channel = %ch.processor.spec().name, silence_secs = silence, "channel silent");
                }
            }

            if let Some(snap) = ch.processor.active_snap() {
                let demoted = ch
                    .anchor_manager
                    .lock()
                    .expect("anchor manager mutex poisoned")
                    .check_demotion(snap.rtp_anchor);
                if let Some(demoted) = demoted {
                    info!(channel = %ch.processor.spec().name, "tone lock stale, demoting time_snap");
                    ch.processor.schedule_anchor(demoted);
                }

                info!(
                    channel = %ch.processor.spec().name,
                    received = health.packets_received,
                    dropped = health.packets_dropped,
                    gaps_filled = health.gaps_filled,
                    parse_errors = health.parse_errors,
                    snap_source = ?snap.source,
                    snap_confidence = snap.confidence,
                    snap_age_secs = now - snap.acquired_at,
                    "channel health"
                );
            }
        }
    }

    /// Run once at process startup (spec.md §4.7 item 3): for each
    /// channel, find the most recent sealed archive and, if its
    /// implied end time is more than [`SESSION_GAP_THRESHOLD_SECS`] in
    /// the past, append a [`SessionGapEvent`] to that channel's
    /// `session_boundaries.jsonl` sidecar (spec.md §6.4).
    fn startup_session_boundary_scan(&self) {
        let now = self.clock.now_utc();
        for ch in &self.channels {
            let name = &ch.processor.spec().name;
            let dir = self.data_root.join("archives").join(name);
            let Some(previous_end_utc) = latest_sealed_end_utc(&dir) else {
                continue;
            };
            let gap_seconds = now - previous_end_utc;
            if gap_seconds > SESSION_GAP_THRESHOLD_SECS {
                warn!(
                    channel = %name,
                    gap_seconds,
                    "previous archive ended more than the session-gap threshold before startup"
                );
                if let Err(e) = append_session_gap(
                    &dir,
                    &SessionGapEvent {
                        previous_end_utc,
                        current_start_utc: now,
                        gap_seconds,
                        detected_at: now,
                    },
                ) {
                    warn!(channel = %name, "could not write session gap sidecar: {e}");
                }
            }
        }
    }
}

/// Scans `dir` for the lexicographically-last `*.npz` file (file names
/// embed a `YYYYMMDDTHHMM00Z` timestamp that sorts correctly as a
/// string) and returns its implied end time: the sealed minute's start
/// plus 60 seconds.
fn latest_sealed_end_utc(dir: &Path) -> Option<f64> {
    let entries = fs::read_dir(dir).ok()?;
    let latest = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "npz"))
        .max_by_key(|p| p.file_name().map(|n| n.to_os_string()))?;

    let meta = read_meta_json(&latest).ok()?;
    let minute_utc = meta.get("minute_utc")?.as_i64()?;
    Some(minute_utc as f64 + 60.0)
}

fn append_session_gap(dir: &Path, event: &SessionGapEvent) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join("session_boundaries.jsonl");
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", serde_json::to_string(event)?)
}
