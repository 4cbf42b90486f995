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

use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("no such network interface for IP {0}")]
    NoSuchNIC(String),
    #[error("invalid channel configuration: {0}")]
    InvalidChannel(String),
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Runtime error taxonomy. A broken invariant is raised with
/// [`crate::defect!`], which panics, rather than returned as a variant
/// here — see SPEC_FULL.md §1.2.
#[derive(Error, Debug, Diagnostic)]
pub enum IngestError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed RTP packet: {0}")]
    Parse(String),

    #[error("packet SSRC {actual:08x} does not match channel SSRC {expected:08x}")]
    WrongSsrc { expected: u32, actual: u32 },

    #[error("archive write error: {0}")]
    Format(String),

    #[error("time authority error: {0}")]
    Clock(String),

    #[error("general error: {0}")]
    Other(String),
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Raise a defect: log the violated invariant and abort the process.
/// Used instead of returning an `Err` for states this crate's
/// contracts guarantee cannot happen; surfacing them as a panic (the
/// release profile sets `panic = "abort"`) keeps a broken invariant
/// from being silently absorbed into a channel's archive.
#[macro_export]
macro_rules! defect {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        tracing::error!("DEFECT: {msg}");
        panic!("defect: {msg}");
    }};
}
