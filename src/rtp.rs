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

//! RTP header parsing and IQ payload decode (spec.md §4.3).

use crate::error::IngestError;
use num_complex::Complex32;
use rtp_rs::RtpReader;

/// Two 16-bit big-endian components (Q, I) per complex sample.
const BYTES_PER_SAMPLE: usize = 4;

pub struct DecodedPacket {
    pub ssrc: u32,
    pub sequence: u16,
    pub rtp_timestamp: u32,
    pub samples: Vec<Complex32>,
}

/// Parses the RTP header with `rtp_rs` (which already accounts for the
/// CSRC count and extension header when locating the payload) and
/// decodes the payload as interleaved signed 16-bit big-endian (Q, I)
/// pairs. The number of complex samples is derived from the payload
/// length, never assumed.
pub fn decode_rtp_packet(raw: &[u8]) -> Result<DecodedPacket, IngestError> {
    let packet = RtpReader::new(raw).map_err(|e| IngestError::Parse(format!("{e:?}")))?;
    let payload = packet.payload();
    if payload.len() % BYTES_PER_SAMPLE != 0 {
        return Err(IngestError::Parse(format!(
            "payload length {} is not a multiple of {BYTES_PER_SAMPLE}",
            payload.len()
        )));
    }
    let samples = payload
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|chunk| {
            let q = i16::from_be_bytes([chunk[0], chunk[1]]);
            let i = i16::from_be_bytes([chunk[2], chunk[3]]);
            Complex32::new(q as f32 / 32768.0, i as f32 / 32768.0)
        })
        .collect();

    Ok(DecodedPacket {
        ssrc: packet.ssrc(),
        sequence: packet.sequence_number().into(),
        rtp_timestamp: packet.timestamp(),
        samples,
    })
}

/// Wrap-aware signed difference `a - b` for 32-bit RTP timestamps:
/// subtract as `u32` (which wraps modulo 2^32) then reinterpret the bit
/// pattern as `i32`. This gives the correct signed distance in
/// `[-2^31, 2^31)` regardless of which side of a wraparound `a` and `b`
/// fall on.
pub fn rtp_timestamp_diff(a: u32, b: u32) -> i64 {
    a.wrapping_sub(b) as i32 as i64
}

/// Wrap-aware signed difference `a - b` for 16-bit RTP sequence numbers.
pub fn sequence_diff(a: u16, b: u16) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}
