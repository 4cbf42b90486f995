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

//! Combines the NTP/PTP time authority with optional tone-detection
//! anchors into the time-anchor lifecycle described in spec.md §4.5.

use crate::{
    archive::{TimeSnap, TimeSnapSource},
    clock::{Clock, ClockStatus},
    rtp::rtp_timestamp_diff,
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionKind {
    Startup,
    Verified,
}

pub struct Detection {
    pub detected_rtp: u32,
    pub detected_utc: f64,
    pub signal_quality: f64,
    pub kind: DetectionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    WallClock,
    NtpSynced,
    ToneLocked,
}

/// Tone anchors older than this are demoted back to NTP/wall-clock
/// authority (spec.md §4.5).
const MAX_TONE_AGE_SECS: f64 = 300.0;
const GROSS_REJECT_TOLERANCE_SECS: f64 = 2.0;
const DISAGREEMENT_TOLERANCE_UNVERIFIED_SECS: f64 = 0.050;
const DISAGREEMENT_TOLERANCE_VERIFIED_SECS: f64 = 0.005;

pub struct AnchorManager {
    sample_rate: u32,
    clock: Arc<dyn Clock>,
    state: LockState,
    last_verified_at: Option<f64>,
}

impl AnchorManager {
    pub fn new(sample_rate: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            sample_rate,
            clock,
            state: LockState::WallClock,
            last_verified_at: None,
        }
    }

    /// Evaluates a tone-detection result against the channel's current
    /// active snap and, if accepted, returns a candidate [`TimeSnap`]
    /// to schedule via [`crate::channel::ChannelProcessor::schedule_anchor`].
    pub fn on_detection(&mut self, detection: Detection, active_snap: &TimeSnap) -> Option<TimeSnap> {
        let wall_now = self.clock.now_utc();
        if self.clock.status().synchronized
            && (detection.detected_utc - wall_now).abs() > GROSS_REJECT_TOLERANCE_SECS
        {
            return None;
        }

        let implied_utc = active_snap.utc_anchor
            + rtp_timestamp_diff(detection.detected_rtp, active_snap.rtp_anchor) as f64
                / active_snap.sample_rate as f64;
        let disagreement = (detection.detected_utc - implied_utc).abs();
        let tolerance = if active_snap.source == TimeSnapSource::ToneVerified {
            DISAGREEMENT_TOLERANCE_VERIFIED_SECS
        } else {
            DISAGREEMENT_TOLERANCE_UNVERIFIED_SECS
        };
        if disagreement > tolerance && detection.signal_quality < active_snap.confidence {
            return None;
        }

        let source = match detection.kind {
            DetectionKind::Startup => TimeSnapSource::ToneStartup,
            DetectionKind::Verified => TimeSnapSource::ToneVerified,
        };
        if matches!(detection.kind, DetectionKind::Verified) {
            self.state = LockState::ToneLocked;
            self.last_verified_at = Some(wall_now);
        }

        Some(TimeSnap {
            rtp_anchor: detection.detected_rtp,
            utc_anchor: detection.detected_utc,
            sample_rate: self.sample_rate,
            source,
            confidence: detection.signal_quality,
            acquired_at: wall_now,
        })
    }

    /// Called periodically by the supervisor: demotes a stale tone lock
    /// back to NTP/wall-clock authority and returns the replacement
    /// snap to schedule, anchored at the channel's current cursor.
    pub fn check_demotion(&mut self, current_rtp_anchor: u32) -> Option<TimeSnap> {
        if self.state != LockState::ToneLocked {
            return None;
        }
        let last_verified_at = self.last_verified_at?;
        let now = self.clock.now_utc();
        if now - last_verified_at <= MAX_TONE_AGE_SECS {
            return None;
        }
        let status = self.clock.status();
        self.state = if status.synchronized {
            LockState::NtpSynced
        } else {
            LockState::WallClock
        };
        let (source, confidence) = demoted_snap_source(&status);
        Some(TimeSnap {
            rtp_anchor: current_rtp_anchor,
            utc_anchor: now,
            sample_rate: self.sample_rate,
            source,
            confidence,
            acquired_at: now,
        })
    }
}

fn demoted_snap_source(status: &ClockStatus) -> (TimeSnapSource, f64) {
    if status.synchronized {
        let offset = status.offset_ms.unwrap_or(0.0).abs();
        (TimeSnapSource::Ntp, (1.0 - offset / 100.0).clamp(0.0, 1.0))
    } else {
        (TimeSnapSource::WallClock, 0.0)
    }
}
