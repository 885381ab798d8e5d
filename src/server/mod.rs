//! TCP control channel to the MLAT server (spec §4.D): JSON handshake,
//! compressed line protocol, and the outbound queue that carries
//! aircraft visibility, rate reports and (absent UDP) sync/mlat
//! submissions.
//!
//! Grounded in `examples/original_source/mlat/client/jsonclient.py`'s
//! `JsonServerConnection`. The UDP fast path and the two compression
//! framings live in [`udp`] and [`compress`]; this module owns the
//! handshake, the reconnect state machine and the outbound queue.

pub mod compress;
pub mod udp;

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::decoder::Message;
use crate::geo::{ecef2llh, M_TO_FT};

use compress::{
    consume_zlib2, fill_uncompressed, fill_zlib, new_compressor, new_decompressor, Compression2,
};
use udp::UdpServerConnection;

const RECONNECT_INTERVAL: f64 = 10.0;
const HEARTBEAT_INTERVAL: f64 = 120.0;
const INACTIVITY_TIMEOUT: f64 = 60.0;
const MAX_QUEUE_AGE: f64 = 1.0;
const MAX_QUEUE_BYTES: usize = 65536;
const CLOCK_JUMP_MIN_INTERVAL: f64 = 0.5;
const UUID_PATH: &str = "/boot/adsbx-uuid";

fn client_version() -> String {
    format!("mlat-client-rs/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone)]
pub struct HandshakeData {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub user: String,
    pub clock_type: String,
    pub clock_frequency: u64,
    pub clock_epoch: f64,
    pub privacy: bool,
}

/// A decoded `result` line, already converted to lat/lon/alt-ft and
/// with `anon`/`modeac` forced false (spec §4.D: the JSON protocol
/// never asserts either, unlike the `mirror` dialect this client
/// doesn't speak).
#[derive(Debug, Clone)]
pub struct PositionResult {
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
}

pub enum ServerEvent {
    Connected,
    Disconnected(String),
    Denied(Vec<String>),
    StartSending(Vec<u32>),
    StopSending(Vec<u32>),
    Result(PositionResult),
    None,
}

struct Connected {
    stream: TcpStream,
    compression: Compression2,
    compressor: Option<flate2::Compress>,
    decompressor: Option<flate2::Decompress>,
    udp: Option<UdpServerConnection>,
    split_sync: bool,
    readbuf: Vec<u8>,
    pending: Vec<(String, f64)>,
    writebuf: Vec<u8>,
    last_data_received: f64,
    next_heartbeat: f64,
    last_clock_jump_sent: f64,
    ready: bool,
}

enum State {
    Disconnected,
    Connected(Connected),
}

pub struct ServerLink {
    hostport: (String, u16),
    handshake: HandshakeData,
    offer_zlib: bool,
    offer_udp: bool,
    return_results: bool,
    reconnect_interval: f64,
    state: State,
    next_attempt: f64,
    pending_tx_bytes: u64,
    pending_rx_bytes: u64,
    pending_udp_bytes: u64,
}

/// Traffic deltas accumulated since the last [`ServerLink::take_stats`]
/// call (same rationale as [`crate::receiver::ReceiverStats`]: stats are
/// folded in synchronously after a `next_event` resolves, never passed
/// into it).
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub udp_bytes: u64,
}

impl ServerLink {
    pub fn new(
        hostport: (String, u16),
        handshake: HandshakeData,
        offer_zlib: bool,
        offer_udp: bool,
        return_results: bool,
    ) -> Self {
        ServerLink {
            hostport,
            handshake,
            offer_zlib,
            offer_udp,
            return_results,
            reconnect_interval: RECONNECT_INTERVAL,
            state: State::Disconnected,
            next_attempt: 0.0,
            pending_tx_bytes: 0,
            pending_rx_bytes: 0,
            pending_udp_bytes: 0,
        }
    }

    /// Drains the traffic counters accumulated since the last call.
    pub fn take_stats(&mut self) -> ServerStats {
        ServerStats {
            tx_bytes: std::mem::take(&mut self.pending_tx_bytes),
            rx_bytes: std::mem::take(&mut self.pending_rx_bytes),
            udp_bytes: std::mem::take(&mut self.pending_udp_bytes),
        }
    }

    fn reconnect_delay(&self, clock: &Clock) -> f64 {
        let jitter: f64 = rand::rng().random_range(0.0..5.0);
        clock.now() + self.reconnect_interval + jitter
    }

    pub fn is_connected(&self) -> bool {
        matches!(&self.state, State::Connected(c) if c.ready)
    }

    pub fn udp_negotiated(&self) -> bool {
        matches!(&self.state, State::Connected(c) if c.udp.is_some())
    }

    pub async fn disconnect(&mut self, clock: &Clock, reason: &str) {
        if matches!(self.state, State::Connected(_)) {
            info!(reason, "server: disconnecting");
            self.state = State::Disconnected;
            self.next_attempt = self.reconnect_delay(clock);
        }
    }

    async fn build_handshake(&self) -> Value {
        let mut compress_offers = vec!["none"];
        if self.offer_zlib {
            compress_offers.push("zlib");
            compress_offers.push("zlib2");
        }

        let mut msg = json!({
            "version": 3,
            "client_version": client_version(),
            "compress": compress_offers,
            "selective_traffic": true,
            "heartbeat": true,
            "return_results": self.return_results,
            "return_result_format": "ecef",
            "udp_transport": if self.offer_udp { json!(2) } else { json!(false) },
            "lat": self.handshake.lat,
            "lon": self.handshake.lon,
            "alt": self.handshake.alt,
            "user": self.handshake.user,
            "clock_type": self.handshake.clock_type,
            "clock_frequency": self.handshake.clock_frequency,
            "clock_epoch": self.handshake.clock_epoch,
            "privacy": self.handshake.privacy,
        });

        if let Ok(contents) = tokio::fs::read_to_string(UUID_PATH).await {
            if let Some(uuid) = contents.lines().next() {
                msg["uuid"] = json!(uuid);
            }
        }

        msg
    }

    /// Drive the connect/handshake/read/write state machine until
    /// there's an event worth reporting to the coordinator. Traffic
    /// counters accumulate internally; drain with [`Self::take_stats`].
    pub async fn next_event(&mut self, clock: &Clock) -> ServerEvent {
        loop {
            if matches!(self.state, State::Disconnected) {
                let now = clock.now();
                if now < self.next_attempt {
                    sleep(Duration::from_secs_f64((self.next_attempt - now).max(0.01))).await;
                }
                match self.connect_and_handshake(clock).await {
                    Ok(()) => return ServerEvent::Connected,
                    Err(ServerOutcome::Denied(reasons)) => return ServerEvent::Denied(reasons),
                    Err(ServerOutcome::Retry(reason)) => {
                        warn!(reason, "server: connect/handshake failed");
                        self.next_attempt = self.reconnect_delay(clock);
                        return ServerEvent::Disconnected(reason);
                    }
                }
            }

            let State::Connected(c) = &mut self.state else {
                unreachable!()
            };

            if !c.pending.is_empty() {
                if let Err(reason) = Self::flush_outbound(c, clock.now()) {
                    self.state = State::Disconnected;
                    self.next_attempt = self.reconnect_delay(clock);
                    return ServerEvent::Disconnected(reason);
                }
            }

            if !c.writebuf.is_empty() {
                if let Err(e) = c.stream.write_all(&c.writebuf).await {
                    warn!(error = %e, "server: write failed");
                    self.state = State::Disconnected;
                    self.next_attempt = self.reconnect_delay(clock);
                    return ServerEvent::Disconnected(e.to_string());
                }
                self.pending_tx_bytes += c.writebuf.len() as u64;
                c.writebuf.clear();
            }

            let now = clock.now();
            if now >= c.next_heartbeat {
                let line = json!({"heartbeat": {"client_time": now}}).to_string();
                c.pending.push((line, now));
                c.next_heartbeat = now + HEARTBEAT_INTERVAL;
                continue;
            }

            let remaining = (c.next_heartbeat - now)
                .min(INACTIVITY_TIMEOUT - (now - c.last_data_received))
                .max(0.01);

            let mut buf = [0u8; 4096];
            let read = timeout(Duration::from_secs_f64(remaining), c.stream.read(&mut buf)).await;
            match read {
                Ok(Ok(0)) | Ok(Err(_)) => {
                    self.state = State::Disconnected;
                    self.next_attempt = self.reconnect_delay(clock);
                    return ServerEvent::Disconnected("connection closed".to_string());
                }
                Ok(Ok(n)) => {
                    self.pending_rx_bytes += n as u64;
                    c.readbuf.extend_from_slice(&buf[..n]);
                    c.last_data_received = now;

                    if let Some(event) = self.drain_lines(clock) {
                        return event;
                    }
                }
                Err(_) => {
                    let now = clock.now();
                    if now - c.last_data_received >= INACTIVITY_TIMEOUT {
                        self.state = State::Disconnected;
                        self.next_attempt = self.reconnect_delay(clock);
                        return ServerEvent::Disconnected("inactivity timeout".to_string());
                    }
                    // otherwise the heartbeat deadline fired; loop around.
                }
            }
        }
    }

    fn drain_lines(&mut self, clock: &Clock) -> Option<ServerEvent> {
        let State::Connected(c) = &mut self.state else {
            return None;
        };

        let mut lines: Vec<Vec<u8>> = Vec::new();
        match c.compression {
            Compression2::None => {
                while let Some(pos) = c.readbuf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = c.readbuf.drain(..=pos).collect();
                    lines.push(line[..line.len() - 1].to_vec());
                }
            }
            Compression2::Zlib => {
                // zlib (unframed) shares the newline-delimited read path;
                // decompress the whole buffer opportunistically.
                if let Some(decompressor) = &mut c.decompressor {
                    let mut out = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let before = decompressor.total_out();
                        let status = decompressor
                            .decompress(&c.readbuf, &mut chunk, flate2::FlushDecompress::Sync)
                            .unwrap_or(flate2::Status::StreamEnd);
                        let produced = (decompressor.total_out() - before) as usize;
                        out.extend_from_slice(&chunk[..produced]);
                        if produced == 0 || status == flate2::Status::StreamEnd {
                            break;
                        }
                    }
                    c.readbuf.clear();
                    for line in out.split(|&b| b == b'\n') {
                        if !line.is_empty() {
                            lines.push(line.to_vec());
                        }
                    }
                }
            }
            Compression2::Zlib2 => {
                if let Some(decompressor) = &mut c.decompressor {
                    match consume_zlib2(&c.readbuf, decompressor, &mut lines) {
                        Ok(consumed) => c.readbuf.drain(..consumed),
                        Err(err) => {
                            self.state = State::Disconnected;
                            self.next_attempt = self.reconnect_delay(clock);
                            return Some(ServerEvent::Disconnected(format!("zlib2 decode error: {err}")));
                        }
                    };
                }
            }
        }

        for line in lines {
            if let Ok(value) = serde_json::from_slice::<Value>(&line) {
                if let Some(event) = self.handle_line(&value) {
                    return Some(event);
                }
            } else {
                warn!("server: malformed JSON line, ignoring");
            }
        }
        None
    }

    fn handle_line(&mut self, value: &Value) -> Option<ServerEvent> {
        if let Some(icaos) = value.get("start_sending").and_then(Value::as_array) {
            let addrs = icaos
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|s| u32::from_str_radix(s, 16).ok())
                .collect();
            return Some(ServerEvent::StartSending(addrs));
        }
        if let Some(icaos) = value.get("stop_sending").and_then(Value::as_array) {
            let addrs = icaos
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|s| u32::from_str_radix(s, 16).ok())
                .collect();
            return Some(ServerEvent::StopSending(addrs));
        }
        if value.get("heartbeat").is_some() {
            return None;
        }
        if let Some(result) = value.get("result") {
            if let Some(parsed) = parse_result(result) {
                return Some(ServerEvent::Result(parsed));
            }
            return None;
        }
        None
    }

    async fn connect_and_handshake(&mut self, clock: &Clock) -> Result<(), ServerOutcome> {
        let addrs = crate::cli::resolve(&self.hostport)
            .map_err(|e| ServerOutcome::Retry(format!("DNS resolution failed: {e}")))?;
        let addr = addrs
            .first()
            .ok_or_else(|| ServerOutcome::Retry("no addresses resolved".to_string()))?;

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ServerOutcome::Retry(format!("connect failed: {e}")))?;

        let mut conn = Connected {
            stream,
            compression: Compression2::None,
            compressor: None,
            decompressor: None,
            udp: None,
            split_sync: false,
            readbuf: Vec::new(),
            pending: Vec::new(),
            writebuf: Vec::new(),
            last_data_received: clock.now(),
            next_heartbeat: clock.now() + HEARTBEAT_INTERVAL,
            last_clock_jump_sent: 0.0,
            ready: false,
        };

        let handshake = self.build_handshake().await;
        let mut bytes = serde_json::to_vec(&handshake)
            .map_err(|e| ServerOutcome::Retry(format!("handshake encode failed: {e}")))?;
        bytes.push(b'\n');
        conn.stream
            .write_all(&bytes)
            .await
            .map_err(|e| ServerOutcome::Retry(format!("handshake write failed: {e}")))?;
        self.pending_tx_bytes += bytes.len() as u64;

        let (response, rx_bytes) = Self::read_handshake_response(&mut conn.stream)
            .await
            .map_err(|e| ServerOutcome::Retry(e.to_string()))?;
        self.pending_rx_bytes += rx_bytes;

        if let Some(reconnect_in) = response.get("reconnect_in").and_then(Value::as_f64) {
            self.reconnect_interval = reconnect_in;
        }

        if let Some(deny) = response.get("deny").and_then(Value::as_array) {
            let reasons = deny
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            return Err(ServerOutcome::Denied(reasons));
        }

        if let Some(motd) = response.get("motd").and_then(Value::as_str) {
            info!(motd, "server: message of the day");
        }

        let compress = response
            .get("compress")
            .and_then(Value::as_str)
            .unwrap_or("none");
        conn.compression = match compress {
            "zlib" => Compression2::Zlib,
            "zlib2" => Compression2::Zlib2,
            _ => Compression2::None,
        };
        if conn.compression != Compression2::None {
            conn.compressor = Some(new_compressor());
            conn.decompressor = Some(new_decompressor());
        }

        conn.split_sync = response
            .get("split_sync")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if let Some(udp_transport) = response.get("udp_transport") {
            if let Some(arr) = udp_transport.as_array() {
                if let (Some(host), Some(port), Some(key)) = (
                    arr.first().and_then(Value::as_str),
                    arr.get(1).and_then(Value::as_u64),
                    arr.get(2).and_then(Value::as_u64),
                ) {
                    match UdpServerConnection::connect(host.to_string(), port as u16, key as u32)
                        .await
                    {
                        Ok(udp) => conn.udp = Some(udp),
                        Err(e) => warn!(error = %e, "server: udp_transport connect failed, staying on TCP"),
                    }
                }
            }
        }

        conn.ready = true;
        conn.pending.push((json!({ "rate_report": {} }).to_string(), clock.now()));
        self.state = State::Connected(conn);
        Ok(())
    }

    async fn read_handshake_response(stream: &mut TcpStream) -> std::io::Result<(Value, u64)> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut rx_bytes = 0u64;
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during handshake",
                ));
            }
            rx_bytes += n as u64;
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line = &buf[..pos];
                let value = serde_json::from_slice(line)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                return Ok((value, rx_bytes));
            }
        }
    }

    /// Drops any queued line older than `MAX_QUEUE_AGE`, then flushes
    /// the rest into `writebuf` through whichever compression was
    /// negotiated (spec §4.D: age-based backpressure, not size-based).
    fn flush_outbound(c: &mut Connected, now: f64) -> Result<(), String> {
        c.pending.retain(|(_, t)| now - *t < MAX_QUEUE_AGE);

        let mut lines: Vec<String> = c.pending.drain(..).map(|(line, _)| line).collect();

        match c.compression {
            Compression2::None => fill_uncompressed(&mut lines, &mut c.writebuf),
            Compression2::Zlib | Compression2::Zlib2 => {
                if let Some(compressor) = &mut c.compressor {
                    fill_zlib(&mut lines, compressor, &mut c.writebuf)
                        .map_err(|e| e.to_string())?;
                }
            }
        }

        if c.writebuf.len() > MAX_QUEUE_BYTES {
            return Err("outbound queue exceeded 65536 unsent bytes".to_string());
        }
        Ok(())
    }

    fn queue_line(&mut self, line: String, now: f64) {
        if let State::Connected(c) = &mut self.state {
            c.pending.retain(|(_, t)| now - *t < MAX_QUEUE_AGE);
            c.pending.push((line, now));
        }
    }

    pub fn send_seen(&mut self, clock: &Clock, icaos: &[u32]) {
        if icaos.is_empty() {
            return;
        }
        let hex: Vec<String> = icaos.iter().map(|a| format!("{a:06x}")).collect();
        let line = json!({ "seen": hex }).to_string();
        self.queue_line(line, clock.now());
    }

    pub fn send_lost(&mut self, clock: &Clock, icaos: &[u32]) {
        if icaos.is_empty() {
            return;
        }
        let hex: Vec<String> = icaos.iter().map(|a| format!("{a:06x}")).collect();
        let line = json!({ "lost": hex }).to_string();
        self.queue_line(line, clock.now());
    }

    pub fn send_rate_report(&mut self, clock: &Clock, rates: &HashMap<u32, f64>) {
        if rates.is_empty() {
            return;
        }
        let map: serde_json::Map<String, Value> = rates
            .iter()
            .map(|(icao, rate)| {
                (
                    format!("{icao:06X}"),
                    json!(((rate * 100.0).round()) / 100.0),
                )
            })
            .collect();
        let line = json!({ "rate_report": map }).to_string();
        self.queue_line(line, clock.now());
    }

    pub fn send_input_connected(&mut self, clock: &Clock) {
        let line = json!({ "input_connected": "connected" }).to_string();
        self.queue_line(line, clock.now());
    }

    pub fn send_input_disconnected(&mut self, clock: &Clock) {
        let line = json!({ "input_disconnected": "disconnected" }).to_string();
        self.queue_line(line, clock.now());
    }

    pub fn send_clock_reset(
        &mut self,
        clock: &Clock,
        reason: &str,
        details: Option<(u64, f64, &str)>,
    ) {
        let mut body = json!({ "reason": reason });
        if let Some((frequency, epoch, mode)) = details {
            body["frequency"] = json!(frequency);
            body["epoch"] = json!(epoch);
            body["mode"] = json!(mode);
        }
        let line = json!({ "clock_reset": body }).to_string();
        self.queue_line(line, clock.now());
    }

    /// Rate-limited to one per 0.5s (spec §4.D); a burst of jumps during
    /// a noisy reconnect shouldn't flood the control channel.
    pub fn send_clock_jump(&mut self, clock: &Clock) {
        if let State::Connected(c) = &mut self.state {
            let now = clock.now();
            if now - c.last_clock_jump_sent < CLOCK_JUMP_MIN_INTERVAL {
                return;
            }
            c.last_clock_jump_sent = now;
        } else {
            return;
        }
        let line = json!({ "clock_jump": true }).to_string();
        self.queue_line(line, clock.now());
    }

    /// Prefers the negotiated UDP fast path; falls back to a queued
    /// `mlat` line over the control channel. UDP traffic folds into the
    /// same [`ServerStats::udp_bytes`] counter as the TCP tx/rx ones.
    pub async fn send_mlat(&mut self, clock: &Clock, message: &Message) {
        if let State::Connected(c) = &mut self.state {
            if let Some(udp) = &mut c.udp {
                udp.send_mlat(message).await;
                self.pending_udp_bytes += udp.take_bytes_sent();
                return;
            }
        }
        let line = json!({
            "mlat": { "t": message.timestamp, "m": hex::encode(message.frame.as_slice()) }
        })
        .to_string();
        self.queue_line(line, clock.now());
    }

    pub async fn send_sync(&mut self, clock: &Clock, even: &Message, odd: &Message) {
        if let State::Connected(c) = &mut self.state {
            if let Some(udp) = &mut c.udp {
                udp.send_sync(even, odd).await;
                self.pending_udp_bytes += udp.take_bytes_sent();
                return;
            }
        }
        let line = json!({
            "sync": {
                "et": even.timestamp, "em": hex::encode(even.frame.as_slice()),
                "ot": odd.timestamp, "om": hex::encode(odd.frame.as_slice()),
            }
        })
        .to_string();
        self.queue_line(line, clock.now());
    }

    pub async fn send_split_sync(&mut self, clock: &Clock, message: &Message) {
        if let State::Connected(c) = &mut self.state {
            if let Some(udp) = &mut c.udp {
                udp.send_split_sync(message).await;
                self.pending_udp_bytes += udp.take_bytes_sent();
                return;
            }
        }
        let line = json!({
            "ssync": { "t": message.timestamp, "m": hex::encode(message.frame.as_slice()) }
        })
        .to_string();
        self.queue_line(line, clock.now());
    }

    pub fn split_sync_negotiated(&self) -> bool {
        matches!(&self.state, State::Connected(c) if c.split_sync)
    }
}

enum ServerOutcome {
    Retry(String),
    Denied(Vec<String>),
}

fn parse_result(result: &Value) -> Option<PositionResult> {
    let timestamp = result.get("@").and_then(Value::as_f64)?;
    let addr = result.get("addr").and_then(Value::as_str)?;
    let address = u32::from_str_radix(addr, 16).ok()?;

    let nsvel = result.get("nsvel").and_then(Value::as_f64);
    let ewvel = result.get("ewvel").and_then(Value::as_f64);
    let vrate = result.get("vrate").and_then(Value::as_f64);
    let callsign = result
        .get("callsign")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let squawk = result
        .get("squawk")
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(ecef) = result.get("ecef").and_then(Value::as_array) {
        let x = ecef.first().and_then(Value::as_f64)?;
        let y = ecef.get(1).and_then(Value::as_f64)?;
        let z = ecef.get(2).and_then(Value::as_f64)?;
        let (lat, lon, alt_m) = ecef2llh(x, y, z);

        let error_est = result
            .get("cov")
            .and_then(Value::as_array)
            .and_then(|cov| {
                let v0 = cov.first()?.as_f64()?;
                let v3 = cov.get(3)?.as_f64()?;
                let v5 = cov.get(5)?.as_f64()?;
                let var = v0 + v3 + v5;
                Some(if var >= 0.0 { var.sqrt() } else { -1.0 })
            })
            .unwrap_or(-1.0);

        let nstations = result.get("nd").and_then(Value::as_u64).map(|n| n as u32);

        Some(PositionResult {
            timestamp,
            address,
            lat,
            lon,
            alt_ft: alt_m * M_TO_FT,
            nsvel,
            ewvel,
            vrate,
            callsign,
            squawk,
            error_est,
            nstations,
        })
    } else {
        let lat = result.get("lat").and_then(Value::as_f64)?;
        let lon = result.get("lon").and_then(Value::as_f64)?;
        // The legacy dialect's `alt` is already in feet (`jsonclient.py`:
        // `alt = result['alt']`, no conversion) unlike the `ecef` shape.
        let alt_ft = result.get("alt").and_then(Value::as_f64)?;
        let gdop = result.get("gdop").and_then(Value::as_f64).unwrap_or(-1.0);
        let nstations = result
            .get("nstations")
            .and_then(Value::as_u64)
            .map(|n| n as u32);

        Some(PositionResult {
            timestamp,
            address,
            lat,
            lon,
            alt_ft,
            nsvel,
            ewvel,
            vrate,
            callsign,
            squawk,
            error_est: if gdop >= 0.0 { gdop * 300.0 } else { -1.0 },
            nstations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_result_prefers_ecef_shape() {
        let value = json!({
            "@": 123.0,
            "addr": "abcdef",
            "ecef": [6378137.0, 0.0, 0.0],
            "cov": [1.0, 0.0, 0.0, 4.0, 0.0, 4.0],
            "nd": 3,
        });
        let parsed = parse_result(&value).unwrap();
        assert_eq!(parsed.address, 0xABCDEF);
        assert!((parsed.lat).abs() < 1e-6);
        assert_eq!(parsed.nstations, Some(3));
        assert!((parsed.error_est - 3.0).abs() < 1e-9);
    }

    #[test]
    fn parse_result_falls_back_to_legacy_shape() {
        let value = json!({
            "@": 1.0,
            "addr": "123456",
            "lat": 48.8,
            "lon": 2.3,
            "alt": 1000.0,
            "gdop": 2.0,
            "nstations": 5,
        });
        let parsed = parse_result(&value).unwrap();
        assert_eq!(parsed.address, 0x123456);
        assert!((parsed.error_est - 600.0).abs() < 1e-9);
        assert_eq!(parsed.nstations, Some(5));
        // Legacy `alt` is already feet; must pass through unconverted.
        assert!((parsed.alt_ft - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn parse_result_rejects_missing_address() {
        let value = json!({ "@": 1.0, "lat": 1.0, "lon": 1.0, "alt": 1.0 });
        assert!(parse_result(&value).is_none());
    }
}
