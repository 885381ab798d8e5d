//! Fan-out of server-delivered position fixes into local listeners or
//! outbound connections (spec §4.F).
//!
//! Grounded in `examples/original_source/mlat/client/output.py`'s
//! `OutputListener`/`OutputConnector`/`Basic Connection` family. Per
//! Design Note §9(c) each publisher runs as its own Tokio task rather
//! than being polled from the coordinator's `select!`: the coordinator
//! only owns a `broadcast::Sender<PositionFix>` (already wired in
//! [`crate::coordinator`]) and never blocks on a slow or stalled
//! subscriber — a dropped/lagged receiver just means that one output
//! misses some fixes (`tokio::sync::broadcast`'s documented behaviour),
//! matching the protocol's "lossy by design" framing (spec §1).

pub mod basestation;
pub mod beast;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{info, warn};

use crate::cli::{self, OutputDirection, OutputProtocol, OutputSpec};
use crate::error::OutputError;

const CONNECTOR_RETRY_INTERVAL: f64 = 30.0;
const BASESTATION_HEARTBEAT: Duration = Duration::from_secs(30);
const BEAST_KEEPALIVE: Duration = Duration::from_secs(60);

/// A server-computed position fix, ready to format for any output
/// protocol (spec §4.D `result`, converted and forwarded by
/// [`crate::coordinator::Coordinator::server_mlat_result`]).
#[derive(Debug, Clone)]
pub struct PositionFix {
    pub timestamp: f64,
    pub address: u32,
    pub lat: f64,
    pub lon: f64,
    pub alt_ft: f64,
    pub nsvel: Option<f64>,
    pub ewvel: Option<f64>,
    pub vrate: Option<f64>,
    pub callsign: Option<String>,
    pub squawk: Option<String>,
    pub error_est: f64,
    pub nstations: Option<u32>,
    pub anon: bool,
    pub modeac: bool,
}

impl PositionFix {
    fn has_position(&self) -> bool {
        // lat/lon are always populated by the coordinator today, but the
        // Beast encoder still needs an explicit "position absent" path
        // for parity with `make_altitude_only_frame` (spec §4.F), which
        // the original client reaches when only cov-less altitude data
        // is available.
        self.lat.is_finite() && self.lon.is_finite()
    }
}

/// A `--results` spec, resolved to something we can actually bind or
/// dial. Binding for `listen` specs happens here, eagerly, so an
/// unbindable port is a fatal startup error (spec §7) rather than a
/// silent background failure.
pub enum Prepared {
    Listener(TcpListener, OutputProtocol),
    Connector(String, u16, OutputProtocol),
}

pub async fn prepare(specs: &[OutputSpec]) -> Result<Vec<Prepared>, OutputError> {
    let mut prepared = Vec::with_capacity(specs.len());
    for spec in specs {
        match spec.direction {
            OutputDirection::Listen => {
                let port: u16 = spec.endpoint.parse().map_err(|_| {
                    OutputError::Bind(
                        spec.endpoint.clone(),
                        std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a port number"),
                    )
                })?;
                let listener = bind_dual_stack(port)
                    .await
                    .map_err(|e| OutputError::Bind(spec.endpoint.clone(), e))?;
                info!(protocol = ?spec.protocol, port, "outputs: listening");
                prepared.push(Prepared::Listener(listener, spec.protocol));
            }
            OutputDirection::Connect => {
                let (host, port) = cli::hostport(&spec.endpoint).map_err(|e| {
                    OutputError::Bind(
                        spec.endpoint.clone(),
                        std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
                    )
                })?;
                prepared.push(Prepared::Connector(host, port, spec.protocol));
            }
        }
    }
    Ok(prepared)
}

/// Bind on `[::]` (accepts both v4 and v6 on most platforms) falling
/// back to `0.0.0.0`, mirroring `OutputListener.__init__`'s AF_INET6
/// with an AF_INET fallback.
async fn bind_dual_stack(port: u16) -> std::io::Result<TcpListener> {
    match TcpListener::bind(("::", port)).await {
        Ok(listener) => Ok(listener),
        Err(_) => TcpListener::bind(("0.0.0.0", port)).await,
    }
}

/// Spawn one background task per prepared output, each subscribing to
/// its own clone of the broadcast receiver.
pub fn spawn_all(prepared: Vec<Prepared>, fixes: &broadcast::Sender<PositionFix>) -> Vec<tokio::task::JoinHandle<()>> {
    prepared
        .into_iter()
        .map(|p| match p {
            Prepared::Listener(listener, protocol) => tokio::spawn(run_listener(listener, protocol, fixes.subscribe())),
            Prepared::Connector(host, port, protocol) => {
                tokio::spawn(run_connector(host, port, protocol, fixes.subscribe()))
            }
        })
        .collect()
}

async fn run_listener(listener: TcpListener, protocol: OutputProtocol, fixes: broadcast::Receiver<PositionFix>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(%addr, ?protocol, "outputs: accepted connection");
                tokio::spawn(run_connection(stream, protocol, fixes.resubscribe()));
            }
            Err(e) => {
                warn!(error = %e, "outputs: accept failed");
            }
        }
    }
}

/// 30s fixed reconnect interval with DNS re-resolution on each attempt,
/// mirroring `OutputConnector.reconnect`'s `getaddrinfo` round-robin.
async fn run_connector(host: String, port: u16, protocol: OutputProtocol, fixes: broadcast::Receiver<PositionFix>) {
    loop {
        let addrs = match cli::resolve(&(host.clone(), port)) {
            Ok(addrs) if !addrs.is_empty() => addrs,
            _ => {
                warn!(host, port, "outputs: DNS resolution failed for results connection");
                sleep(Duration::from_secs_f64(CONNECTOR_RETRY_INTERVAL)).await;
                continue;
            }
        };

        let mut connected = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => warn!(%addr, error = %e, "outputs: connect failed"),
            }
        }

        let Some(stream) = connected else {
            sleep(Duration::from_secs_f64(CONNECTOR_RETRY_INTERVAL)).await;
            continue;
        };

        info!(host, port, ?protocol, "outputs: connected");
        run_connection(stream, protocol, fixes.resubscribe()).await;
        warn!(host, port, "outputs: results connection lost, reconnecting");
        sleep(Duration::from_secs_f64(CONNECTOR_RETRY_INTERVAL)).await;
    }
}

/// Drive one open connection until the peer closes it or a write
/// fails. Bytes read from the peer are discarded (spec §4.F: this is a
/// push-only protocol; the read side only exists to detect a dead
/// connection), matching `BasicConnection.handle_read`.
async fn run_connection(mut stream: TcpStream, protocol: OutputProtocol, mut fixes: broadcast::Receiver<PositionFix>) {
    let heartbeat_period = match protocol {
        OutputProtocol::Beast => BEAST_KEEPALIVE,
        OutputProtocol::Basestation | OutputProtocol::ExtBasestation => BASESTATION_HEARTBEAT,
    };
    let mut heartbeat = interval(heartbeat_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick fires immediately; skip it

    let mut discard = [0u8; 1024];

    loop {
        tokio::select! {
            read = stream.read(&mut discard) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
            fix = fixes.recv() => {
                match fix {
                    Ok(fix) => {
                        if write_fix(&mut stream, protocol, &fix).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "outputs: subscriber lagged, some fixes dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            _ = heartbeat.tick() => {
                if write_heartbeat(&mut stream, protocol).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_heartbeat(stream: &mut TcpStream, protocol: OutputProtocol) -> std::io::Result<()> {
    match protocol {
        OutputProtocol::Basestation | OutputProtocol::ExtBasestation => stream.write_all(b"\n").await,
        OutputProtocol::Beast => stream.write_all(beast::KEEPALIVE).await,
    }
}

async fn write_fix(stream: &mut TcpStream, protocol: OutputProtocol, fix: &PositionFix) -> std::io::Result<()> {
    let now = chrono::Utc::now().timestamp() as f64;
    match protocol {
        OutputProtocol::Basestation => {
            let line = basestation::format_basestation(fix, now);
            stream.write_all(format!("{line}\n").as_bytes()).await
        }
        OutputProtocol::ExtBasestation => {
            let line = basestation::format_ext_basestation(fix, now);
            stream.write_all(format!("{line}\n").as_bytes()).await
        }
        OutputProtocol::Beast => {
            let kind = beast::FrameKind::for_fix(fix.anon, fix.modeac);
            let mut buf = Vec::new();

            if fix.has_position() {
                let (even, odd) = beast::position_frame_pair(kind, fix.address, fix.lat, fix.lon, fix.alt_ft);
                beast::wrap_frame(&even, &mut buf);
                beast::wrap_frame(&odd, &mut buf);
            } else {
                let frame = beast::altitude_only_frame(kind, fix.address, fix.alt_ft);
                beast::wrap_frame(&frame, &mut buf);
            }

            if fix.nsvel.is_some() || fix.ewvel.is_some() || fix.vrate.is_some() {
                let frame = beast::velocity_frame(kind, fix.address, fix.nsvel, fix.ewvel, fix.vrate);
                beast::wrap_frame(&frame, &mut buf);
            }

            stream.write_all(&buf).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix() -> PositionFix {
        PositionFix {
            timestamp: 0.0,
            address: 0xABCDEF,
            lat: 48.8,
            lon: 2.3,
            alt_ft: 35000.0,
            nsvel: None,
            ewvel: None,
            vrate: None,
            callsign: None,
            squawk: None,
            error_est: -1.0,
            nstations: None,
            anon: false,
            modeac: false,
        }
    }

    #[test]
    fn has_position_true_for_finite_coords() {
        assert!(fix().has_position());
    }
}
