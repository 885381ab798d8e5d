//! TCP client to the physical Mode S/ADS-B receiver (spec §4.C).
//!
//! Connection handling follows the reconnect-with-jitter shape of
//! `examples/original_source/mlat/client/net.py::ReconnectingConnection`;
//! the byte-level framing lives in [`crate::decoder`]. Per Design Note
//! §9(b) this component holds no reference back to the coordinator: it
//! is polled from `main`'s `tokio::select!` loop and returns an event,
//! which `main` then forwards into the coordinator explicitly.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::cli::InputType;
use crate::clock::Clock;
use crate::decoder::framing::{self, Mode};
use crate::decoder::{Decoder, DecoderEvent, Frame, Message, MessageKind, ModeSDecoder};

const INACTIVITY_TIMEOUT: f64 = 150.0;
const RECONNECT_INTERVAL: f64 = 10.0;
const MAX_RESIDUAL: usize = 5120;

/// Receiver firmware reconfiguration strings (spec §9: receiver-specific,
/// preserved verbatim rather than redesigned).
pub const BEAST_SETTINGS_BASE: &[u8] = b"\x1a1C\x1a1d\x1a1f\x1a1j";
pub const BEAST_SETTINGS_MODEAC: &[u8] = b"\x1a1C\x1a1d\x1a1f\x1a1j\x1a1J";

pub enum ReceiverEvent {
    Connected,
    Disconnected(String),
    Messages(Vec<Message>),
}

struct Connected {
    stream: TcpStream,
    decoder: Box<dyn Decoder>,
    last_byte_time: f64,
    detected: bool,
    probe: Vec<u8>,
    pending_mode_change: Option<Message>,
}

enum State {
    Disconnected,
    Connected(Connected),
}

pub struct ReceiverLink {
    host: String,
    port: u16,
    input_type: InputType,
    state: State,
    next_attempt: f64,
    requested_traffic: HashSet<u32>,
    requested_modeac: HashSet<u16>,
    modeac_enabled: bool,
    last_received: u64,
    last_suppressed: u64,
    last_mlat: u64,
    pending_bytes: u64,
    pending_messages: u64,
    pending_filtered: u64,
    pending_mlat_magic: u64,
}

/// Traffic deltas accumulated since the last [`ReceiverLink::take_stats`]
/// call, folded into [`crate::stats::Stats`] by the coordinator after a
/// `next_event` resolves (never passed into `next_event` itself: two
/// `tokio::select!` branches cannot both hold `&mut Stats` at once).
#[derive(Debug, Default, Clone, Copy)]
pub struct ReceiverStats {
    pub bytes: u64,
    pub messages: u64,
    pub filtered: u64,
    pub mlat_magic: u64,
}

pub(crate) fn mode_and_frequency(input_type: InputType) -> Option<(Mode, u64)> {
    match input_type {
        InputType::Auto => None,
        InputType::Dump1090 | InputType::Beast => Some((Mode::Beast, 12_000_000)),
        InputType::Radarcape12Mhz => Some((Mode::Radarcape, 12_000_000)),
        InputType::RadarcapeGps | InputType::Radarcape => Some((Mode::Radarcape, 1_000_000_000)),
        InputType::Sbs => Some((Mode::Sbs, 12_000_000)),
        InputType::AvrMlat => Some((Mode::AvrMlat, 12_000_000)),
    }
}

impl ReceiverLink {
    pub fn new(host: String, port: u16, input_type: InputType) -> Self {
        ReceiverLink {
            host,
            port,
            input_type,
            state: State::Disconnected,
            next_attempt: 0.0,
            requested_traffic: HashSet::new(),
            requested_modeac: HashSet::new(),
            modeac_enabled: false,
            last_received: 0,
            last_suppressed: 0,
            last_mlat: 0,
            pending_bytes: 0,
            pending_messages: 0,
            pending_filtered: 0,
            pending_mlat_magic: 0,
        }
    }

    /// Drains the traffic counters accumulated since the last call.
    pub fn take_stats(&mut self) -> ReceiverStats {
        ReceiverStats {
            bytes: std::mem::take(&mut self.pending_bytes),
            messages: std::mem::take(&mut self.pending_messages),
            filtered: std::mem::take(&mut self.pending_filtered),
            mlat_magic: std::mem::take(&mut self.pending_mlat_magic),
        }
    }


    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected(_))
    }

    /// The per-DF filter set last pushed down via [`Self::update_filter`]
    /// (spec invariant 7: equals the requested set minus the ADS-B-good
    /// aircraft).
    pub fn requested_traffic(&self) -> &HashSet<u32> {
        &self.requested_traffic
    }

    fn reconnect_delay(clock: &Clock) -> f64 {
        let jitter: f64 = rand::rng().random_range(0.0..5.0);
        clock.now() + RECONNECT_INTERVAL + jitter
    }

    /// Idempotent close: a second call while already disconnected is a
    /// no-op (spec §8 round-trip property).
    pub fn disconnect(&mut self, clock: &Clock, reason: &str) {
        if matches!(self.state, State::Connected(_)) {
            info!(reason, "receiver: disconnecting");
            self.state = State::Disconnected;
            self.next_attempt = Self::reconnect_delay(clock);
        }
    }

    /// Replace the per-DF filter: non-DF17 frames are delivered only for
    /// these addresses.
    pub fn update_filter(&mut self, icaos: HashSet<u32>) {
        if let State::Connected(c) = &mut self.state {
            for df in [0, 4, 5, 16, 20, 21] {
                c.decoder.set_specific_filter(df, Some(icaos.clone()));
            }
        }
        self.requested_traffic = icaos;
    }

    /// Replace the Mode A/C whitelist. Toggling empty<->nonempty pushes a
    /// receiver reconfiguration byte string on the wire (spec §9).
    pub async fn update_modeac_filter(&mut self, codes: HashSet<u16>) {
        let was_enabled = self.modeac_enabled;
        let now_enabled = !codes.is_empty();
        self.requested_modeac = codes.clone();
        self.modeac_enabled = now_enabled;

        if let State::Connected(c) = &mut self.state {
            c.decoder.set_modeac_filter(codes);
            if was_enabled != now_enabled {
                let settings = if now_enabled {
                    BEAST_SETTINGS_MODEAC
                } else {
                    BEAST_SETTINGS_BASE
                };
                let _ = c.stream.write_all(settings).await;
            }
        }
    }

    /// Addresses the decoder has observed since the last call, even if
    /// filtered out; draining resets the set (spec §4.C).
    pub fn recent_aircraft(&mut self) -> HashSet<u32> {
        match &mut self.state {
            State::Connected(c) => c.decoder.seen(),
            State::Disconnected => HashSet::new(),
        }
    }

    fn mode_name(mode: Mode) -> &'static str {
        match mode {
            Mode::Beast => "beast",
            Mode::Radarcape => "radarcape",
            Mode::Sbs => "sbs",
            Mode::Avr => "avr",
            Mode::AvrMlat => "avrmlat",
        }
    }

    fn mode_change_message(mode: Mode, frequency: u64) -> Message {
        Message {
            kind: MessageKind::Event(DecoderEvent::ModeChange {
                mode: Self::mode_name(mode),
                frequency,
                epoch: 0.0,
            }),
            timestamp: 0,
            frame: Frame::new(&[]),
        }
    }

    /// Block until there's a connect, disconnect, or message batch to
    /// report. Traffic counters accumulate internally; drain them with
    /// [`Self::take_stats`] (spec §4.B).
    pub async fn next_event(&mut self, clock: &Clock) -> ReceiverEvent {
        loop {
            match &self.state {
                State::Disconnected => {
                    let now = clock.now();
                    if now < self.next_attempt {
                        sleep(Duration::from_secs_f64((self.next_attempt - now).max(0.01))).await;
                    }
                }
                State::Connected(_) => {}
            }

            if matches!(self.state, State::Disconnected) {
                match TcpStream::connect((self.host.as_str(), self.port)).await {
                    Ok(stream) => {
                        let (mode, frequency, detected) = match mode_and_frequency(self.input_type)
                        {
                            Some((mode, frequency)) => (mode, frequency, true),
                            None => (Mode::Beast, 12_000_000, false),
                        };
                        let pending_mode_change = if detected {
                            Some(Self::mode_change_message(mode, frequency))
                        } else {
                            None
                        };
                        self.state = State::Connected(Connected {
                            stream,
                            decoder: Box::new(ModeSDecoder::new(mode, frequency, 0.0)),
                            last_byte_time: clock.now(),
                            detected,
                            probe: Vec::new(),
                            pending_mode_change,
                        });
                        self.last_received = 0;
                        self.last_suppressed = 0;
                        self.last_mlat = 0;
                        return ReceiverEvent::Connected;
                    }
                    Err(e) => {
                        warn!(error = %e, "receiver: connect failed");
                        self.next_attempt = Self::reconnect_delay(clock);
                        continue;
                    }
                }
            }

            let State::Connected(c) = &mut self.state else {
                unreachable!()
            };

            if let Some(event) = c.pending_mode_change.take() {
                return ReceiverEvent::Messages(vec![event]);
            }

            let remaining = (INACTIVITY_TIMEOUT - (clock.now() - c.last_byte_time)).max(0.01);
            let mut buf = [0u8; 4096];
            let read = timeout(Duration::from_secs_f64(remaining), c.stream.read(&mut buf)).await;

            let n = match read {
                Ok(Ok(0)) | Ok(Err(_)) => {
                    self.state = State::Disconnected;
                    self.next_attempt = Self::reconnect_delay(clock);
                    return ReceiverEvent::Disconnected("connection closed".to_string());
                }
                Ok(Ok(n)) => n,
                Err(_) => {
                    self.state = State::Disconnected;
                    self.next_attempt = Self::reconnect_delay(clock);
                    return ReceiverEvent::Disconnected("inactivity timeout".to_string());
                }
            };

            let State::Connected(c) = &mut self.state else {
                unreachable!()
            };
            c.last_byte_time = clock.now();
            self.pending_bytes += n as u64;
            let chunk = buf[..n].to_vec();

            if !c.detected {
                c.probe.extend_from_slice(&chunk);
                match framing::detect(&c.probe) {
                    Ok((mode, offset)) => {
                        c.detected = true;
                        let remainder = c.probe[offset..].to_vec();
                        c.decoder = Box::new(ModeSDecoder::new(mode, 12_000_000, 0.0));
                        let (_, mut messages, _) = c.decoder.feed(&remainder);
                        self.last_received = 0;
                        self.last_suppressed = 0;
                        self.last_mlat = 0;
                        let State::Connected(c) = &mut self.state else {
                            unreachable!()
                        };
                        self.pending_messages += c.decoder.received_messages();
                        self.pending_filtered += c.decoder.suppressed_messages();
                        self.pending_mlat_magic += c.decoder.mlat_messages();
                        self.last_received = c.decoder.received_messages();
                        self.last_suppressed = c.decoder.suppressed_messages();
                        self.last_mlat = c.decoder.mlat_messages();
                        messages.insert(0, Self::mode_change_message(mode, 12_000_000));
                        return ReceiverEvent::Messages(messages);
                    }
                    Err(e) if c.probe.len() >= 512 => {
                        let reason = e.to_string();
                        self.state = State::Disconnected;
                        self.next_attempt = Self::reconnect_delay(clock);
                        return ReceiverEvent::Disconnected(reason);
                    }
                    Err(_) => continue,
                }
            }

            let (_, messages, pending_error) = c.decoder.feed(&chunk);
            if pending_error {
                warn!("receiver: decoder reported a pending parse error");
            }
            let received = c.decoder.received_messages();
            let suppressed = c.decoder.suppressed_messages();
            let mlat = c.decoder.mlat_messages();
            self.pending_messages += received.saturating_sub(self.last_received);
            self.pending_filtered += suppressed.saturating_sub(self.last_suppressed);
            self.pending_mlat_magic += mlat.saturating_sub(self.last_mlat);
            self.last_received = received;
            self.last_suppressed = suppressed;
            self.last_mlat = mlat;
            if c.decoder.residual_len() > MAX_RESIDUAL {
                let reason = "decoder residual buffer exceeded 5120 bytes".to_string();
                warn!("{reason}");
                self.state = State::Disconnected;
                self.next_attempt = Self::reconnect_delay(clock);
                return ReceiverEvent::Disconnected(reason);
            }
            if !messages.is_empty() {
                return ReceiverEvent::Messages(messages);
            }
        }
    }
}
