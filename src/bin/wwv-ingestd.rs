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

use miette::{IntoDiagnostic, Result};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};
use tokio_graceful_shutdown::Toplevel;
use tracing::{info, warn};
use wwv_ingest::{
    channel::{ChannelProcessor, ChannelSpec},
    clock::{ChronyTimeAuthority, Clock, SystemClock, TimeAuthority},
    config::{ChannelKind, Config},
    ingest::Ingestor,
    supervisor::Supervisor,
    utils::panic_to_string,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::load().into_diagnostic()?;
    print_startup_banner(&config);

    let shutdown = Arc::new(AtomicBool::new(false));

    let authority: Arc<dyn TimeAuthority> = Arc::new(ChronyTimeAuthority::new(
        config.time_authority.command.clone(),
        config.time_authority.args.clone(),
    ));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(authority));
    clock.refresh();

    let mut endpointed_processors = Vec::with_capacity(config.channels.len());
    let mut processors = Vec::with_capacity(config.channels.len());
    for entry in &config.channels {
        let endpoint = config.endpoint_for(entry).into_diagnostic()?.clone();
        let spec = ChannelSpec {
            ssrc: entry.ssrc,
            name: entry.name.clone(),
            frequency_hz: entry.frequency_hz,
            sample_rate: entry.sample_rate,
            max_reorder_packets: entry.max_reorder_packets,
            max_reorder_span_samples: entry.max_reorder_span_samples,
        };
        let processor = Arc::new(ChannelProcessor::new(spec, config.data_root.clone(), clock.clone()));
        endpointed_processors.push((endpoint, processor.clone()));
        processors.push(processor);
    }

    let ingestor = Ingestor::new(&endpointed_processors).into_diagnostic()?;
    let ingest_handles = ingestor.spawn(clock.clone(), shutdown.clone());

    let supervisor = Supervisor::new(
        clock.clone(),
        processors.clone(),
        config.data_root.clone(),
        config.supervisor.clone(),
        shutdown.clone(),
    );
    let supervisor_handle = thread::Builder::new()
        .name("supervisor".to_owned())
        .spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| supervisor.run()));
            if let Err(panic) = result {
                warn!("supervisor thread panicked: {}", panic_to_string(panic));
            }
        })
        .into_diagnostic()?;

    Toplevel::new(|_| async move {})
        .catch_signals()
        .handle_shutdown_requests(Duration::from_secs(1))
        .await
        .into_diagnostic()?;

    info!("shutdown signal received, flushing channels");
    shutdown.store(true, Ordering::SeqCst);
    for processor in &processors {
        if let Err(e) = processor.flush() {
            warn!(channel = %processor.spec().name, "flush on shutdown failed: {e}");
        }
    }
    for handle in ingest_handles {
        let _ = handle.join();
    }
    let _ = supervisor_handle.join();

    info!("clean shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        instance = %config.instance.name,
        data_root = %config.data_root.display(),
        channels = config.channels.len(),
        "wwv-ingestd starting"
    );
    for channel in &config.channels {
        let kind = match channel.kind {
            ChannelKind::Wideband => "wideband",
            ChannelKind::NarrowbandCarrier => "narrowband-carrier",
        };
        info!(
            channel = %channel.name,
            ssrc = format!("{:08x}", channel.ssrc),
            frequency_hz = channel.frequency_hz,
            sample_rate = channel.sample_rate,
            kind,
            "configured channel"
        );
    }
}
