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

//! RTP receive loop (spec.md §4.6), resolved against SPEC_FULL.md §3: one
//! blocking receive thread per distinct bound multicast endpoint, each
//! dispatching to the small set of [`ChannelProcessor`]s registered
//! against that endpoint's socket.

use crate::{
    channel::ChannelProcessor,
    clock::Clock,
    config::MulticastEndpoint,
    error::IngestError,
    socket::create_rx_socket,
    utils::{find_network_interface, panic_to_string, set_realtime_priority},
};
use dashmap::DashMap;
use std::{
    collections::HashMap,
    net::UdpSocket,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, warn};

const RECV_BUFFER_SIZE: usize = 4096;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// The processors sharing one bound socket, keyed by SSRC. Mirrors a
/// `DashMap<u32, ReceiverApi>`-style per-id receiver registry.
type ProcessorsBySsrc = DashMap<u32, Arc<ChannelProcessor>>;

struct Listener {
    endpoint: MulticastEndpoint,
    socket: UdpSocket,
    processors: ProcessorsBySsrc,
}

/// Owns one socket per distinct bound endpoint and the receive threads
/// that drain them. Holds no per-channel state of its own beyond the
/// endpoint -> processor-set grouping built at construction.
pub struct Ingestor {
    listeners: Vec<Listener>,
}

impl Ingestor {
    /// Groups `processors` (each paired with its channel's configured
    /// endpoint) by distinct endpoint and binds one socket per group.
    pub fn new(processors: &[(MulticastEndpoint, Arc<ChannelProcessor>)]) -> Result<Self, IngestError> {
        let mut groups: HashMap<MulticastEndpoint, Vec<Arc<ChannelProcessor>>> = HashMap::new();
        for (endpoint, processor) in processors {
            groups.entry(endpoint.clone()).or_default().push(processor.clone());
        }

        let mut listeners = Vec::with_capacity(groups.len());
        for (endpoint, group_processors) in groups {
            // An unspecified interface (the configured default) means
            // "let the kernel pick a route"; there is no NIC assigned
            // 0.0.0.0/:: to look up.
            if !endpoint.interface.is_unspecified() {
                find_network_interface(endpoint.interface)?;
            }
            let socket = create_rx_socket(endpoint.group, endpoint.interface, endpoint.port)?;
            info!(
                group = %endpoint.group,
                port = endpoint.port,
                channels = group_processors.len(),
                "bound rx endpoint"
            );
            let processors = ProcessorsBySsrc::new();
            for processor in group_processors {
                processors.insert(processor.spec().ssrc, processor);
            }
            listeners.push(Listener {
                endpoint,
                socket,
                processors,
            });
        }

        Ok(Self { listeners })
    }

    /// Spawns one blocking receive thread per bound endpoint. Threads
    /// exit once `shutdown` is observed set; the returned handles
    /// should be joined after it is.
    pub fn spawn(self, clock: Arc<dyn Clock>, shutdown: Arc<AtomicBool>) -> Vec<JoinHandle<()>> {
        self.listeners
            .into_iter()
            .map(|listener| {
                let clock = clock.clone();
                let shutdown = shutdown.clone();
                let name = format!("ingest-{}:{}", listener.endpoint.group, listener.endpoint.port);
                thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || {
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            run_listener(listener, clock, shutdown);
                        }));
                        if let Err(panic) = result {
                            warn!(thread = %name, "ingest thread panicked: {}", panic_to_string(panic));
                        }
                    })
                    .expect("failed to spawn ingest thread")
            })
            .collect()
    }
}

fn run_listener(mut listener: Listener, clock: Arc<dyn Clock>, shutdown: Arc<AtomicBool>) {
    set_realtime_priority();
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    let mut backoff = INITIAL_BACKOFF;
    let label = format!("{}:{}", listener.endpoint.group, listener.endpoint.port);

    while !shutdown.load(Ordering::Relaxed) {
        match listener.socket.recv_from(&mut buf) {
            Ok((n, _src)) => {
                backoff = INITIAL_BACKOFF;
                let recv_utc = clock.now_utc();
                dispatch(&listener.processors, &buf[..n], recv_utc);
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                warn!(endpoint = %label, "rx socket error: {e}, backing off {backoff:?} before rebind");
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
                match create_rx_socket(listener.endpoint.group, listener.endpoint.interface, listener.endpoint.port) {
                    Ok(socket) => {
                        info!(endpoint = %label, "rx socket rebound after error");
                        listener.socket = socket;
                    }
                    Err(e) => {
                        warn!(endpoint = %label, "rebind failed: {e}");
                    }
                }
            }
        }
    }
    debug!(endpoint = %label, "ingest thread stopping");
}

/// Dispatches one raw datagram to the processor whose SSRC it carries,
/// falling back to the endpoint's sole processor when exactly one is
/// registered (so an SSRC change after an upstream restart still
/// reaches the processor that must detect it, per SPEC_FULL.md §3). On
/// a restart the map is re-keyed under the new SSRC so later packets
/// on a multi-channel endpoint route directly without another
/// fallback lookup. `ChannelSpec.ssrc` (the configured identity) is
/// never touched; only this routing key moves.
fn dispatch(processors: &ProcessorsBySsrc, raw: &[u8], recv_utc: f64) {
    if raw.len() < 12 {
        return;
    }
    let ssrc = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);

    if let Some(entry) = processors.get(&ssrc) {
        let processor = entry.value().clone();
        drop(entry);
        if let Err(e) = processor.push_packet(raw, recv_utc) {
            debug!(ssrc = format!("{ssrc:08x}"), "packet rejected: {e}");
        }
        return;
    }

    if processors.len() != 1 {
        warn!(
            ssrc = format!("{ssrc:08x}"),
            "no channel processor registered for ssrc on this endpoint"
        );
        return;
    }

    let Some((old_key, processor)) = processors.iter().next().map(|e| (*e.key(), e.value().clone())) else {
        return;
    };
    if let Err(e) = processor.push_packet(raw, recv_utc) {
        debug!(ssrc = format!("{ssrc:08x}"), "packet rejected: {e}");
        return;
    }
    processors.remove(&old_key);
    processors.insert(ssrc, processor);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{channel::ChannelSpec, clock::test::FakeClock};

    fn spec(ssrc: u32, name: &str) -> ChannelSpec {
        ChannelSpec {
            ssrc,
            name: name.to_owned(),
            frequency_hz: 10_000_000.0,
            sample_rate: 16_000,
            max_reorder_packets: 64,
            max_reorder_span_samples: 8_000,
        }
    }

    fn packet(seq: u16, ts: u32, ssrc: u32, n_samples: usize) -> Vec<u8> {
        let mut buf = vec![0u8; 12 + n_samples * 4];
        buf[0] = 0x80;
        buf[1] = 96;
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        buf[4..8].copy_from_slice(&ts.to_be_bytes());
        buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        buf
    }

    fn processor(ssrc: u32, name: &str) -> Arc<ChannelProcessor> {
        let dir = std::env::temp_dir().join(format!("wwv-ingest-dispatch-test-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(0.0));
        Arc::new(ChannelProcessor::new(spec(ssrc, name), dir, clock))
    }

    fn registry(processors: impl IntoIterator<Item = (u32, Arc<ChannelProcessor>)>) -> ProcessorsBySsrc {
        let map = ProcessorsBySsrc::new();
        for (ssrc, processor) in processors {
            map.insert(ssrc, processor);
        }
        map
    }

    #[test]
    fn dispatch_routes_by_matching_ssrc() {
        let a = processor(1, "a");
        let b = processor(2, "b");
        let map = registry([(1, a.clone()), (2, b.clone())]);
        dispatch(&map, &packet(1, 0, 2, 320), 0.0);
        assert_eq!(a.health().packets_received, 0);
        assert_eq!(b.health().packets_received, 1);
    }

    #[test]
    fn dispatch_falls_back_to_sole_processor_on_ssrc_mismatch() {
        let a = processor(1, "solo");
        let map = registry([(1, a.clone())]);
        dispatch(&map, &packet(1, 0, 0xffff, 320), 0.0);
        assert_eq!(a.health().packets_received, 1);
        // the restart re-keys the registry under the new ssrc
        assert!(map.get(&0xffff).is_some());
        assert!(map.get(&1).is_none());
    }

    #[test]
    fn dispatch_drops_short_packets() {
        let a = processor(1, "short");
        let map = registry([(1, a.clone())]);
        dispatch(&map, &[0u8; 4], 0.0);
        assert_eq!(a.health().packets_received, 0);
    }
}
