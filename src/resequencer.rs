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

//! Windowed packet reordering and gap detection (spec.md §4.2).

use crate::rtp::sequence_diff;
use num_complex::Complex32;
use std::collections::VecDeque;

pub struct EmittedPacket {
    pub sequence: u16,
    pub rtp_timestamp: u32,
    pub samples: Vec<Complex32>,
}

pub struct GapReport {
    pub start_sequence: u16,
    pub missing_count: u32,
    /// RTP-timestamp span of the missing window, estimated from the
    /// most recently observed packet's frame count.
    pub rtp_span: u32,
    pub rtp_timestamp: u32,
}

pub enum Event {
    Packet(EmittedPacket),
    Gap(GapReport),
}

#[derive(Default)]
pub struct EmissionBatch {
    pub events: Vec<Event>,
}

impl EmissionBatch {
    pub fn gap_count(&self) -> usize {
        self.events.iter().filter(|e| matches!(e, Event::Gap(_))).count()
    }

    pub fn packet_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Packet(_)))
            .count()
    }
}

struct Buffered {
    sequence: u16,
    rtp_timestamp: u32,
    samples: Vec<Complex32>,
}

/// Bounded sliding-window resequencer. Bounded both by packet count
/// (`max_packets`) and by RTP-timestamp span (`max_span_samples`),
/// whichever forces a flush first.
pub struct Resequencer {
    ssrc: u32,
    expected_seq: u16,
    expected_rtp: u32,
    last_frames_per_packet: usize,
    window: VecDeque<Option<Buffered>>,
    max_packets: usize,
    max_span_samples: u32,
    seeded: bool,
    pub dropped_old_or_duplicate: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("packet ssrc {actual:08x} does not match resequencer ssrc {expected:08x}")]
pub struct WrongSsrc {
    pub expected: u32,
    pub actual: u32,
}

impl Resequencer {
    pub fn new(ssrc: u32, max_packets: usize, max_span_samples: u32) -> Self {
        Self {
            ssrc,
            expected_seq: 0,
            expected_rtp: 0,
            last_frames_per_packet: 1,
            window: VecDeque::new(),
            max_packets: max_packets.max(1),
            max_span_samples,
            seeded: false,
            dropped_old_or_duplicate: 0,
        }
    }

    /// Discards any buffered state and reseeds cursors from the next
    /// packet pushed. Used by the channel processor on an SSRC
    /// restart, after draining whatever was already buffered with
    /// [`Resequencer::flush`].
    pub fn reset(&mut self, ssrc: u32) {
        self.ssrc = ssrc;
        self.window.clear();
        self.seeded = false;
    }

    pub fn push(
        &mut self,
        ssrc: u32,
        sequence: u16,
        rtp_timestamp: u32,
        samples: Vec<Complex32>,
    ) -> Result<EmissionBatch, WrongSsrc> {
        if ssrc != self.ssrc {
            return Err(WrongSsrc {
                expected: self.ssrc,
                actual: ssrc,
            });
        }

        let mut batch = EmissionBatch::default();

        if !self.seeded {
            self.seeded = true;
            self.expected_seq = sequence;
            self.expected_rtp = rtp_timestamp;
            self.last_frames_per_packet = samples.len().max(1);
        }

        let diff = sequence_diff(sequence, self.expected_seq);
        if diff < 0 {
            self.dropped_old_or_duplicate += 1;
            return Ok(batch);
        }

        let mut index = diff as usize;
        while index >= self.max_packets {
            self.force_advance_one(&mut batch);
            index -= 1;
        }

        while self.window.len() <= index {
            self.window.push_back(None);
        }
        if self.window[index].is_some() {
            self.dropped_old_or_duplicate += 1;
        } else {
            self.window[index] = Some(Buffered {
                sequence,
                rtp_timestamp,
                samples,
            });
        }

        self.enforce_span_bound(&mut batch);
        self.drain_contiguous(&mut batch);

        Ok(batch)
    }

    /// Forces every buffered slot out, declaring a gap for anything
    /// still missing. Used at shutdown and whenever the channel
    /// processor needs to seal a minute with no further packets
    /// expected.
    pub fn flush(&mut self) -> EmissionBatch {
        let mut batch = EmissionBatch::default();
        while !self.window.is_empty() {
            self.force_advance_one(&mut batch);
        }
        batch
    }

    fn enforce_span_bound(&mut self, batch: &mut EmissionBatch) {
        if self.max_span_samples == 0 {
            return;
        }
        while let Some(Some(buffered)) = self.window.back() {
            let span = buffered.rtp_timestamp.wrapping_sub(self.expected_rtp);
            if span > self.max_span_samples {
                self.force_advance_one(batch);
            } else {
                break;
            }
        }
    }

    fn force_advance_one(&mut self, batch: &mut EmissionBatch) {
        match self.window.pop_front() {
            Some(Some(buffered)) => {
                self.emit(buffered, batch);
            }
            Some(None) | None => {
                self.emit_gap(1, batch);
            }
        }
    }

    fn drain_contiguous(&mut self, batch: &mut EmissionBatch) {
        loop {
            match self.window.front() {
                Some(Some(_)) => {
                    if let Some(Some(buffered)) = self.window.pop_front() {
                        self.emit(buffered, batch);
                    }
                }
                _ => break,
            }
        }
    }

    fn emit(&mut self, buffered: Buffered, batch: &mut EmissionBatch) {
        self.last_frames_per_packet = buffered.samples.len().max(1);
        self.expected_seq = buffered.sequence.wrapping_add(1);
        self.expected_rtp = buffered
            .rtp_timestamp
            .wrapping_add(buffered.samples.len() as u32);
        batch.events.push(Event::Packet(EmittedPacket {
            sequence: buffered.sequence,
            rtp_timestamp: buffered.rtp_timestamp,
            samples: buffered.samples,
        }));
    }

    fn emit_gap(&mut self, count: u32, batch: &mut EmissionBatch) {
        let start_sequence = self.expected_seq;
        let rtp_timestamp = self.expected_rtp;
        let span = count * self.last_frames_per_packet as u32;
        self.expected_seq = self.expected_seq.wrapping_add(count as u16);
        self.expected_rtp = self.expected_rtp.wrapping_add(span);
        batch.events.push(Event::Gap(GapReport {
            start_sequence,
            missing_count: count,
            rtp_span: span,
            rtp_timestamp,
        }));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn samples(n: usize) -> Vec<Complex32> {
        vec![Complex32::new(0.1, 0.1); n]
    }

    #[test]
    fn in_order_packets_emit_immediately() {
        let mut r = Resequencer::new(1, 64, 16_000);
        let batch = r.push(1, 100, 0, samples(320)).unwrap();
        assert_eq!(batch.packet_count(), 1);
        assert_eq!(batch.gap_count(), 0);
        let batch = r.push(1, 101, 320, samples(320)).unwrap();
        assert_eq!(batch.packet_count(), 1);
    }

    #[test]
    fn reordered_pair_emits_in_order_once_complete() {
        let mut r = Resequencer::new(1, 64, 16_000);
        let b1 = r.push(1, 100, 0, samples(320)).unwrap();
        assert_eq!(b1.packet_count(), 1);
        // 102 arrives before 101
        let b2 = r.push(1, 102, 640, samples(320)).unwrap();
        assert_eq!(b2.packet_count(), 0, "must wait for 101");
        let b3 = r.push(1, 101, 320, samples(320)).unwrap();
        assert_eq!(b3.packet_count(), 2, "101 then 102 release together");
        match &b3.events[0] {
            Event::Packet(p) => assert_eq!(p.sequence, 101),
            _ => panic!("expected packet"),
        }
        match &b3.events[1] {
            Event::Packet(p) => assert_eq!(p.sequence, 102),
            _ => panic!("expected packet"),
        }
    }

    #[test]
    fn single_lost_packet_reported_once_window_forces_it() {
        let mut r = Resequencer::new(1, 4, 16_000);
        r.push(1, 100, 0, samples(320)).unwrap();
        // 101 is lost; keep feeding until the window forces the gap out.
        let mut saw_gap = false;
        for (i, seq) in (102u16..110).enumerate() {
            let batch = r
                .push(1, seq, 320 + (i as u32 + 1) * 320, samples(320))
                .unwrap();
            if batch.gap_count() > 0 {
                saw_gap = true;
                match &batch.events[0] {
                    Event::Gap(g) => {
                        assert_eq!(g.start_sequence, 101);
                        assert_eq!(g.missing_count, 1);
                        assert_eq!(g.rtp_span, 320);
                    }
                    _ => panic!("expected gap first"),
                }
                break;
            }
        }
        assert!(saw_gap, "gap must eventually be declared");
    }

    #[test]
    fn duplicate_packet_is_dropped() {
        let mut r = Resequencer::new(1, 64, 16_000);
        r.push(1, 100, 0, samples(320)).unwrap();
        r.push(1, 101, 320, samples(320)).unwrap();
        let before = r.dropped_old_or_duplicate;
        let batch = r.push(1, 100, 0, samples(320)).unwrap();
        assert_eq!(batch.packet_count(), 0);
        assert_eq!(r.dropped_old_or_duplicate, before + 1);
    }

    #[test]
    fn wrong_ssrc_is_rejected() {
        let mut r = Resequencer::new(1, 64, 16_000);
        let err = r.push(2, 100, 0, samples(320)).unwrap_err();
        assert_eq!(err.expected, 1);
        assert_eq!(err.actual, 2);
    }

    #[test]
    fn flush_drains_remaining_window() {
        let mut r = Resequencer::new(1, 64, 16_000);
        r.push(1, 100, 0, samples(320)).unwrap();
        r.push(1, 102, 640, samples(320)).unwrap(); // 101 never arrives
        let batch = r.flush();
        assert_eq!(batch.gap_count(), 1);
        assert_eq!(batch.packet_count(), 1);
    }

    #[test]
    fn reset_reseeds_cursor_from_next_packet() {
        let mut r = Resequencer::new(1, 64, 16_000);
        r.push(1, 100, 0, samples(320)).unwrap();
        r.reset(99);
        let batch = r.push(99, 0, 0, samples(160)).unwrap();
        assert_eq!(batch.packet_count(), 1);
    }
}
