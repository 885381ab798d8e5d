#![doc = include_str!("../readme.md")]
//! Process wiring: parse the CLI, build the components and hand them to
//! the coordinator's event loop (spec §5–§7).
//!
//! Grounded in `examples/original_source/mlat-client.py`'s top-level
//! `main()`: resolve the receiver and server addresses, build the
//! handshake data, construct `ReceiverConnection`/`ServerConnection`,
//! bind the output listeners, then run the scheduler. Fatal
//! configuration errors (unknown input type, invalid lat/lon/alt,
//! unbindable output port) are surfaced by `clap` or by
//! `outputs::prepare` before any network component starts, matching
//! spec §7's "exit with non-zero status before entering the main loop".

mod aircraft;
mod cli;
mod clock;
mod coordinator;
mod decoder;
mod error;
mod geo;
mod outputs;
mod receiver;
mod server;
mod stats;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use clock::Clock;
use cli::Options;
use coordinator::Coordinator;
use receiver::ReceiverLink;
use server::{HandshakeData, ServerLink};

/// Bounded so a lagging output subscriber drops old fixes instead of
/// the coordinator blocking on a full channel (spec §1: lossy by
/// design).
const POSITION_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::process::ExitCode {
    let options = Options::parse();

    let filter = EnvFilter::try_new(&options.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(options).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "fatal: could not start mlat-client");
            std::process::ExitCode::FAILURE
        }
    }
}

/// Builds the components and drives the coordinator to completion.
/// Split out from `main` so every fallible setup step (currently just
/// binding `--results` outputs) goes through one `anyhow`-wrapped chain
/// instead of a bespoke match per call site.
async fn run(options: Options) -> anyhow::Result<()> {
    let (fixes_tx, _fixes_rx) = broadcast::channel(POSITION_CHANNEL_CAPACITY);

    let prepared_outputs = outputs::prepare(&options.results).await?;
    let _output_tasks = outputs::spawn_all(prepared_outputs, &fixes_tx);

    let clock = Clock::new();

    let receiver = ReceiverLink::new(options.input_connect.0.clone(), options.input_connect.1, options.input_type);

    // Best static guess; a real `MODE_CHANGE` event (spec §4.C format
    // detection) corrects `clock_frequency` once the receiver actually
    // connects, via `server.send_clock_reset`.
    let clock_frequency = receiver::mode_and_frequency(options.input_type)
        .map(|(_, freq)| freq)
        .unwrap_or(12_000_000);

    let handshake = HandshakeData {
        lat: options.lat,
        lon: options.lon,
        alt: options.alt,
        user: options.user.clone(),
        clock_type: cli::clock_type_label(options.input_type).to_string(),
        clock_frequency,
        clock_epoch: 0.0,
        privacy: options.privacy,
    };
    let return_results = !options.results.is_empty();
    let server = ServerLink::new(options.server.clone(), handshake, true, !options.no_udp, return_results);

    let mut coordinator = Coordinator::new(
        clock,
        receiver,
        server,
        fixes_tx,
        !options.no_anon_results,
        !options.no_modeac_results,
    );

    coordinator.run().await;

    Ok(())
}
