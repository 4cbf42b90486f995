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

use crate::error::ConfigError;
use clap::Parser;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{info, instrument, warn};

#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Args {
    /// Path to config file
    #[arg(short, long, env = "WWV_INGEST_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticastEndpoint {
    pub group: IpAddr,
    pub port: u16,
    #[serde(default = "default_interface")]
    pub interface: IpAddr,
}

fn default_interface() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Wideband,
    NarrowbandCarrier,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfigEntry {
    pub name: String,
    pub ssrc: u32,
    pub frequency_hz: f64,
    pub sample_rate: u32,
    pub kind: ChannelKind,
    /// Overrides the top-level default multicast endpoint when this
    /// channel is carried on its own RTP session. See SPEC_FULL.md §3.
    #[serde(default)]
    pub multicast: Option<MulticastEndpoint>,
    #[serde(default = "default_max_reorder_packets")]
    pub max_reorder_packets: usize,
    #[serde(default = "default_max_reorder_span_samples")]
    pub max_reorder_span_samples: u32,
}

fn default_max_reorder_packets() -> usize {
    64
}

fn default_max_reorder_span_samples() -> u32 {
    8_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    #[serde(default, with = "serde_millis")]
    pub tick_interval: Duration,
    #[serde(default, with = "serde_millis")]
    pub silence_threshold: Duration,
    #[serde(default, with = "serde_millis")]
    pub silence_grace: Duration,
    #[serde(default, with = "serde_millis")]
    pub clock_refresh_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            silence_threshold: Duration::from_secs(60),
            silence_grace: Duration::from_secs(300),
            clock_refresh_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeAuthorityConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for TimeAuthorityConfig {
    fn default() -> Self {
        Self {
            command: "chronyc".to_owned(),
            args: vec!["tracking".to_owned()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub name: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: gethostname().to_string_lossy().to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub instance: InstanceConfig,
    pub data_root: PathBuf,
    #[serde(default)]
    pub default_multicast: Option<MulticastEndpoint>,
    #[serde(default)]
    pub channels: Vec<ChannelConfigEntry>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub time_authority: TimeAuthorityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance: InstanceConfig::default(),
            data_root: PathBuf::from("/var/lib/wwv-ingest"),
            default_multicast: None,
            channels: Vec::new(),
            supervisor: SupervisorConfig::default(),
            time_authority: TimeAuthorityConfig::default(),
        }
    }
}

impl Config {
    #[instrument]
    pub fn load() -> Result<Config, ConfigError> {
        let args = Args::parse();
        info!("loading config");
        Config::load_from_file(args.config.as_deref())
    }

    #[instrument]
    fn load_from_file(path: Option<&Path>) -> Result<Config, ConfigError> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_string_lossy().to_string(),
                    source,
                })?;
                let config = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.to_string_lossy().to_string(),
                    source,
                })?;
                info!("config loaded from {}", path.to_string_lossy());
                Ok(config)
            }
            None => {
                let fallback = if cfg!(debug_assertions) {
                    "./config-dev.yaml"
                } else {
                    "/etc/wwv-ingest/config.yaml"
                };
                warn!("no config file specified, trying {fallback}");
                match std::fs::read_to_string(fallback) {
                    Ok(content) => {
                        let config =
                            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                                path: fallback.to_owned(),
                                source,
                            })?;
                        info!("config loaded from {fallback}");
                        Ok(config)
                    }
                    Err(_) => {
                        warn!("could not read {fallback}, using default config");
                        Ok(Config::default())
                    }
                }
            }
        }
    }

    /// Resolves the effective multicast endpoint for a channel: its
    /// own override if present, otherwise the configuration's default.
    pub fn endpoint_for(&self, channel: &ChannelConfigEntry) -> Result<&MulticastEndpoint, ConfigError> {
        channel
            .multicast
            .as_ref()
            .or(self.default_multicast.as_ref())
            .ok_or_else(|| ConfigError::InvalidChannel(format!("{} has no multicast endpoint", channel.name)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_default() {
        let config = Config::load_from_file(Some(Path::new("/nonexistent/path.yaml")));
        assert!(config.is_err());
    }

    #[test]
    fn endpoint_resolution_prefers_channel_override() {
        let mut config = Config::default();
        config.default_multicast = Some(MulticastEndpoint {
            group: "239.1.1.1".parse().unwrap(),
            port: 5004,
            interface: default_interface(),
        });
        let channel = ChannelConfigEntry {
            name: "wwv10".into(),
            ssrc: 1,
            frequency_hz: 10_000_000.0,
            sample_rate: 16_000,
            kind: ChannelKind::Wideband,
            multicast: Some(MulticastEndpoint {
                group: "239.1.1.2".parse().unwrap(),
                port: 5005,
                interface: default_interface(),
            }),
            max_reorder_packets: 64,
            max_reorder_span_samples: 8_000,
        };
        let endpoint = config.endpoint_for(&channel).unwrap();
        assert_eq!(endpoint.port, 5005);
    }
}
