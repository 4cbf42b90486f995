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

//! Minute-boundary-aligned archive writer (spec.md §4.4, §6).

pub mod container;

use crate::{
    clock::{Clock, ClockStatus},
    defect,
    error::IngestError,
    rtp::rtp_timestamp_diff,
};
use container::ArchiveContainer;
use num_complex::Complex32;
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::instrument;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSnapSource {
    WallClock,
    Ntp,
    ToneStartup,
    ToneVerified,
}

impl TimeSnapSource {
    fn as_str(self) -> &'static str {
        match self {
            TimeSnapSource::WallClock => "wall_clock",
            TimeSnapSource::Ntp => "ntp",
            TimeSnapSource::ToneStartup => "tone_startup",
            TimeSnapSource::ToneVerified => "tone_verified",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeSnap {
    pub rtp_anchor: u32,
    pub utc_anchor: f64,
    pub sample_rate: u32,
    pub source: TimeSnapSource,
    pub confidence: f64,
    pub acquired_at: f64,
}

/// A contiguous run of samples to append, either real (decoded from a
/// packet) or synthesized silence for a declared gap.
pub struct SampleBlock {
    pub first_rtp: u32,
    pub samples: Vec<Complex32>,
    pub is_gap: bool,
    /// Number of RTP packets this block accounts for for the purposes
    /// of `packets_received`/`packets_expected` bookkeeping (1 for a
    /// real block, the gap's missing packet count for a gap block).
    pub packet_count: u32,
}

#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub frequency_hz: f64,
    pub sample_rate: u32,
}

struct MinuteState {
    minute_utc: i64,
    first_rtp: u32,
    samples: Vec<Complex32>,
    gap_mask: Vec<u8>,
    active_snap: TimeSnap,
    packets_received: u64,
    packets_expected: u64,
}

pub struct ArchiveWriter {
    channel: ChannelSpec,
    data_root: PathBuf,
    clock: Arc<dyn Clock>,
    state: Option<MinuteState>,
    pending_snap: Option<TimeSnap>,
    next_first_rtp: Option<u32>,
    next_minute_utc: Option<i64>,
    carried_snap: Option<TimeSnap>,
}

fn floor_to_minute(utc_secs: f64) -> i64 {
    (utc_secs as i64) / 60 * 60
}

impl ArchiveWriter {
    pub fn new(channel: ChannelSpec, data_root: PathBuf, clock: Arc<dyn Clock>) -> Self {
        Self {
            channel,
            data_root,
            clock,
            state: None,
            pending_snap: None,
            next_first_rtp: None,
            next_minute_utc: None,
            carried_snap: None,
        }
    }

    fn nominal_len(&self) -> usize {
        self.channel.sample_rate as usize * 60
    }

    fn compute_initial_snap(&self, first_rtp: u32) -> TimeSnap {
        let status = self.clock.status();
        let now = self.clock.now_utc();
        let (source, confidence) = if status.synchronized {
            let offset = status.offset_ms.unwrap_or(0.0).abs();
            (TimeSnapSource::Ntp, (1.0 - offset / 100.0).clamp(0.0, 1.0))
        } else {
            (TimeSnapSource::WallClock, 0.0)
        };
        TimeSnap {
            rtp_anchor: first_rtp,
            utc_anchor: floor_to_minute(now) as f64,
            sample_rate: self.channel.sample_rate,
            source,
            confidence,
            acquired_at: now,
        }
    }

    fn start_new_minute(&mut self, incoming_first_rtp: u32) {
        let first_rtp = self.next_first_rtp.unwrap_or(incoming_first_rtp);
        let minute_utc = self
            .next_minute_utc
            .unwrap_or_else(|| floor_to_minute(self.clock.now_utc()));
        let snap = self
            .pending_snap
            .take()
            .or_else(|| self.carried_snap.clone())
            .unwrap_or_else(|| self.compute_initial_snap(first_rtp));
        let n = self.nominal_len();
        self.state = Some(MinuteState {
            minute_utc,
            first_rtp,
            samples: vec![Complex32::new(0.0, 0.0); n],
            gap_mask: vec![1u8; n],
            active_snap: snap,
            packets_received: 0,
            packets_expected: 0,
        });
    }

    /// Schedules a new time anchor to be installed at the next minute
    /// boundary, per spec.md §4.4/§4.5: never applied mid-file.
    pub fn schedule_anchor(&mut self, snap: TimeSnap) {
        self.pending_snap = Some(snap);
    }

    /// Resets continuity tracking on an SSRC restart: the next minute
    /// opened takes its `first_rtp` from the next appended block
    /// instead of continuing the prior stream's cursor, and its time
    /// anchor is recomputed rather than carried forward.
    pub fn reset_for_restart(&mut self) {
        self.next_first_rtp = None;
        self.carried_snap = None;
    }

    pub fn active_snap(&self) -> Option<&TimeSnap> {
        self.state.as_ref().map(|s| &s.active_snap)
    }

    #[instrument(skip(self, block), fields(channel = %self.channel.name))]
    pub fn append(&mut self, block: SampleBlock) -> Result<(), IngestError> {
        if self.state.is_none() {
            self.start_new_minute(block.first_rtp);
        }
        if let Some(s) = self.state.as_mut() {
            if block.is_gap {
                s.packets_expected += block.packet_count as u64;
            } else {
                s.packets_received += 1;
                s.packets_expected += 1;
            }
        }

        let nominal_len = self.channel.sample_rate as i64 * 60;
        let mut remaining: &[Complex32] = &block.samples;
        let mut cur_rtp = block.first_rtp;
        while !remaining.is_empty() {
            let first_rtp = self.state.as_ref().expect("seeded above").first_rtp;
            let idx = rtp_timestamp_diff(cur_rtp, first_rtp);
            if idx < 0 {
                defect!("append before first_rtp_of_minute: cur_rtp={cur_rtp} first_rtp={first_rtp}");
            }
            if idx >= nominal_len {
                self.seal()?;
                self.start_new_minute(cur_rtp);
                continue;
            }

            let state = self.state.as_mut().expect("seeded above");
            let start = idx as usize;
            let space = state.samples.len() - start;
            let take = remaining.len().min(space);
            state.samples[start..start + take].copy_from_slice(&remaining[..take]);
            for slot in &mut state.gap_mask[start..start + take] {
                *slot = block.is_gap as u8;
            }
            let crossed_boundary = start + take == state.samples.len();

            remaining = &remaining[take..];
            cur_rtp = cur_rtp.wrapping_add(take as u32);
            if crossed_boundary && !remaining.is_empty() {
                self.seal()?;
                self.start_new_minute(cur_rtp);
            }
        }
        Ok(())
    }

    /// Seals the in-progress minute, writing it to disk. A no-op if no
    /// minute is currently open (idempotent: calling `flush`/`seal`
    /// twice in a row with nothing new appended between them emits
    /// exactly one file).
    #[instrument(skip(self), fields(channel = %self.channel.name))]
    pub fn seal(&mut self) -> Result<(), IngestError> {
        let Some(state) = self.state.take() else {
            return Ok(());
        };
        let clock_status = self.clock.status();
        let ntp_wall_clock_at_close = self.clock.now_utc();
        write_minute(&self.data_root, &self.channel, &state, &clock_status, ntp_wall_clock_at_close)
            .map_err(|e| IngestError::Format(e.to_string()))?;
        self.next_first_rtp = Some(state.first_rtp.wrapping_add(self.nominal_len() as u32));
        self.next_minute_utc = Some(state.minute_utc + 60);
        self.carried_snap = Some(state.active_snap.clone());
        Ok(())
    }
}

fn minute_file_name(channel: &ChannelSpec, minute_utc: i64) -> String {
    let dt = chrono::DateTime::from_timestamp(minute_utc, 0).unwrap_or_default();
    format!("{}_{}.npz", channel.name, dt.format("%Y%m%dT%H%M00Z"))
}

fn write_minute(
    data_root: &Path,
    channel: &ChannelSpec,
    state: &MinuteState,
    clock_status: &ClockStatus,
    ntp_wall_clock_at_close: f64,
) -> std::io::Result<()> {
    let dir = data_root.join("archives").join(&channel.name);
    fs::create_dir_all(&dir)?;
    let final_path = dir.join(minute_file_name(channel, state.minute_utc));
    let tmp_path = dir.join(format!(".tmp-{}", minute_file_name(channel, state.minute_utc)));

    let gaps_filled = state.gap_mask.iter().filter(|&&b| b == 1).count() as u64;
    let meta = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "channel_name": channel.name,
        "channel_frequency_hz": channel.frequency_hz,
        "first_rtp": state.first_rtp,
        "sample_rate": channel.sample_rate,
        "minute_utc": state.minute_utc,
        "gaps_filled": gaps_filled,
        "packets_received": state.packets_received,
        "packets_expected": state.packets_expected,
        "time_snap_rtp": state.active_snap.rtp_anchor,
        "time_snap_utc": state.active_snap.utc_anchor,
        "time_snap_source": state.active_snap.source.as_str(),
        "time_snap_confidence": state.active_snap.confidence,
        "time_snap_acquired_at": state.active_snap.acquired_at,
        "ntp_offset_ms": clock_status.offset_ms,
        "ntp_wall_clock_at_close": ntp_wall_clock_at_close,
    });

    {
        let file = File::create(&tmp_path)?;
        let mut container = ArchiveContainer::new(file);
        container.write_complex_array("iq", &state.samples)?;
        container.write_u8_array("gap_mask", &state.gap_mask)?;
        container.write_meta_json(&meta)?;
        container.finish()?;
    }
    let file = File::open(&tmp_path)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::test::FakeClock;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    /// Scratch directory for a single test, removed on drop. A local
    /// stand-in for a dev-dependency on `tempfile` that isn't needed
    /// anywhere else in this crate.
    struct ScratchDir(PathBuf);

    impl ScratchDir {
        fn new() -> Self {
            let n = COUNTER.fetch_add(1, Ordering::SeqCst);
            let path = std::env::temp_dir().join(format!("wwv-ingest-test-{}-{n}", std::process::id()));
            fs::create_dir_all(&path).expect("create scratch dir");
            Self(path)
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for ScratchDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn spec(sample_rate: u32) -> ChannelSpec {
        ChannelSpec {
            name: "wwv10".into(),
            frequency_hz: 10_000_000.0,
            sample_rate,
        }
    }

    fn writer(sample_rate: u32, utc: f64) -> (ArchiveWriter, ScratchDir, Arc<FakeClock>) {
        let dir = ScratchDir::new();
        let clock = Arc::new(FakeClock::new(utc));
        let writer = ArchiveWriter::new(spec(sample_rate), dir.path().to_path_buf(), clock.clone());
        (writer, dir, clock)
    }

    #[test]
    fn appending_exact_minute_seals_with_no_gaps() {
        let (mut w, dir, _clock) = writer(10, 0.0);
        let samples = vec![Complex32::new(1.0, 0.0); 600];
        w.append(SampleBlock {
            first_rtp: 0,
            samples,
            is_gap: false,
            packet_count: 1,
        })
        .unwrap();
        w.seal().unwrap();
        let archived = dir.path().join("archives").join("wwv10");
        let entries: Vec<_> = fs::read_dir(&archived).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn flush_twice_with_no_new_data_writes_once() {
        let (mut w, dir, _clock) = writer(10, 0.0);
        w.append(SampleBlock {
            first_rtp: 0,
            samples: vec![Complex32::new(0.0, 0.0); 10],
            is_gap: false,
            packet_count: 1,
        })
        .unwrap();
        w.seal().unwrap();
        w.seal().unwrap(); // no-op: nothing appended since the first seal
        let archived = dir.path().join("archives").join("wwv10");
        let entries: Vec<_> = fs::read_dir(&archived).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn block_crossing_minute_boundary_splits_across_two_files() {
        let (mut w, dir, _clock) = writer(10, 0.0);
        // 600 samples = one minute at 10 Hz; push 900 in one block.
        w.append(SampleBlock {
            first_rtp: 0,
            samples: vec![Complex32::new(1.0, 0.0); 900],
            is_gap: false,
            packet_count: 1,
        })
        .unwrap();
        w.seal().unwrap();
        let archived = dir.path().join("archives").join("wwv10");
        let entries: Vec<_> = fs::read_dir(&archived).unwrap().collect();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn unfilled_tail_is_marked_as_gap_on_partial_seal() {
        let (mut w, dir, _clock) = writer(10, 0.0);
        w.append(SampleBlock {
            first_rtp: 0,
            samples: vec![Complex32::new(1.0, 0.0); 5],
            is_gap: false,
            packet_count: 1,
        })
        .unwrap();
        w.seal().unwrap();
        let archived = dir.path().join("archives").join("wwv10");
        assert_eq!(fs::read_dir(&archived).unwrap().count(), 1);
    }
}
