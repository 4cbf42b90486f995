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

//! Continuous multi-channel RTP ingest and minute-aligned archive
//! pipeline for HF time-standard stations (WWV, WWVH, CHU). See
//! `SPEC_FULL.md` for the complete requirements this crate implements.

// The crate-wide `clippy::unwrap_used = "deny"` lint (Cargo.toml) is
// about production code paths; test code asserting on known-good fixture
// data is exactly what `unwrap()` is for.
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod anchor;
pub mod archive;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod ingest;
pub mod resequencer;
pub mod rtp;
pub mod socket;
pub mod supervisor;
pub mod utils;
