//! The selection engine (spec §4.E): aircraft registry, per-message
//! dispatch, filter subscription reconciliation and periodic reporting.
//!
//! Grounded in `examples/original_source/mlat/client/coordinator.py`'s
//! `Coordinator`. Per Design Note §9 the `df`-keyed handler table
//! becomes a `match` in [`Coordinator::input_received_messages`] rather
//! than a function-pointer table: the handler set is small and fixed at
//! compile time.

use std::collections::HashMap;
use std::collections::HashSet;

use rand::Rng;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::aircraft::{Icao, Registry};
use crate::clock::Clock;
use crate::decoder::{DecoderEvent, Message, MessageKind};
use crate::outputs::PositionFix;
use crate::receiver::ReceiverEvent;
use crate::receiver::ReceiverLink;
use crate::server::{ServerEvent, ServerLink};
use crate::stats::Stats;

/// Aircraft sweep period, seconds; jittered by `+uniform(0,1)` each pass
/// like `coordinator.py`'s `update_interval`.
const UPDATE_INTERVAL: f64 = 4.5;
/// Number of sweeps between aircraft/rate reports.
const REPORT_INTERVAL: f64 = 4.0;
/// How often [`Coordinator::periodic_stats`] runs.
const STATS_INTERVAL: f64 = 900.0;
/// Minimum gap between consecutive out-of-order-timestamp warnings.
const JUMP_WARNING_INTERVAL: f64 = 300.0;

pub struct Coordinator {
    clock: Clock,
    stats: Stats,
    receiver: ReceiverLink,
    server: ServerLink,
    outputs: broadcast::Sender<PositionFix>,
    registry: Registry,
    requested_traffic: HashSet<u32>,
    requested_modeac: HashSet<u16>,
    clock_frequency: u64,
    allow_anon: bool,
    allow_modeac: bool,
    recent_jumps: u64,
    last_jump_message: f64,
    last_aircraft_update: f64,
    next_aircraft_update: f64,
    /// `None` while disconnected from the server (no reporting cadence
    /// to drive); `Some(tick)` counts sweeps `0..REPORT_INTERVAL`.
    next_report: Option<f64>,
    next_stats: f64,
}

impl Coordinator {
    pub fn new(
        clock: Clock,
        receiver: ReceiverLink,
        server: ServerLink,
        outputs: broadcast::Sender<PositionFix>,
        allow_anon: bool,
        allow_modeac: bool,
    ) -> Self {
        let stats = Stats::new(&clock);
        let now = clock.now();
        Coordinator {
            stats,
            receiver,
            server,
            outputs,
            registry: Registry::new(),
            requested_traffic: HashSet::new(),
            requested_modeac: HashSet::new(),
            clock_frequency: 12_000_000,
            allow_anon,
            allow_modeac,
            recent_jumps: 0,
            last_jump_message: 0.0,
            last_aircraft_update: now,
            next_aircraft_update: now,
            next_report: None,
            next_stats: now + 60.0,
            clock,
        }
    }

    /// Drive the event loop until ctrl-c, disconnecting everything on
    /// the way out (spec §5: "a termination predicate polled by the
    /// loop; on true, call `disconnect` on receiver, server, each
    /// output, then exit").
    pub async fn run(&mut self) {
        let mut heartbeat = tokio::time::interval(std::time::Duration::from_millis(500));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.on_heartbeat().await;
                }
                event = self.receiver.next_event(&self.clock) => {
                    self.handle_receiver_event(event).await;
                    let rs = self.receiver.take_stats();
                    self.stats.receiver_rx_bytes += rs.bytes;
                    self.stats.receiver_rx_messages += rs.messages;
                    self.stats.receiver_rx_filtered += rs.filtered;
                    self.stats.receiver_rx_mlat_magic += rs.mlat_magic;
                }
                event = self.server.next_event(&self.clock) => {
                    self.handle_server_event(event).await;
                    let ss = self.server.take_stats();
                    self.stats.server_tx_bytes += ss.tx_bytes;
                    self.stats.server_rx_bytes += ss.rx_bytes;
                    self.stats.server_udp_bytes += ss.udp_bytes;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.receiver.disconnect(&self.clock, "client shutting down");
        self.server.disconnect(&self.clock, "client shutting down").await;
    }

    async fn on_heartbeat(&mut self) {
        let now = self.clock.now();

        if now >= self.next_aircraft_update {
            let jitter: f64 = rand::rng().random_range(0.0..1.0);
            self.next_aircraft_update = now + UPDATE_INTERVAL + jitter;
            self.update_aircraft(now);

            if let Some(tick) = self.next_report {
                let tick = tick + 1.0;
                if tick >= REPORT_INTERVAL {
                    self.next_report = Some(0.0);
                    self.send_aircraft_report();
                    self.send_rate_report(now);
                } else {
                    self.next_report = Some(tick);
                }
            }
        }

        if now >= self.next_stats {
            self.next_stats = now + STATS_INTERVAL;
            self.periodic_stats(now);
        }
    }

    // ---- aircraft sweep & reporting ------------------------------------

    fn update_aircraft(&mut self, now: f64) {
        for icao in self.receiver.recent_aircraft() {
            if let Some(ac) = self.registry.get_mut(icao) {
                if ac.last_message_time <= self.last_aircraft_update {
                    ac.messages += 1;
                    ac.last_message_time = now;
                }
            } else {
                let requested = self.requested_traffic.contains(&icao);
                self.registry.get_or_create(icao, now, requested);
            }
        }

        let lost = self.registry.expire(now);
        if !lost.is_empty() {
            self.server.send_lost(&self.clock, &lost);
        }

        self.last_aircraft_update = now;
    }

    fn send_aircraft_report(&mut self) {
        let mut seen = Vec::new();
        let mut lost = Vec::new();

        for ac in self.registry.values_mut() {
            let eligible = ac.messages > 1;
            if eligible && !ac.reported {
                ac.reported = true;
                seen.push(ac.icao);
            } else if !eligible && ac.reported {
                ac.reported = false;
                lost.push(ac.icao);
            }
        }

        if !seen.is_empty() {
            self.server.send_seen(&self.clock, &seen);
        }
        if !lost.is_empty() {
            self.server.send_lost(&self.clock, &lost);
        }
    }

    fn send_rate_report(&mut self, now: f64) {
        let mut rates: HashMap<u32, f64> = HashMap::new();
        for ac in self.registry.values_mut() {
            let interval = now - ac.rate_measurement_start;
            if interval > 0.0 && ac.recent_adsb_positions > 0 {
                rates.insert(ac.icao, ac.recent_adsb_positions as f64 / interval);
                ac.rate_measurement_start = now;
                ac.recent_adsb_positions = 0;
            }
        }
        if !rates.is_empty() {
            self.server.send_rate_report(&self.clock, &rates);
        }
    }

    fn periodic_stats(&mut self, now: f64) {
        let receiver_state = if self.receiver.is_connected() { "connected" } else { "disconnected" };
        let server_state = if self.server.is_connected() { "ready" } else { "disconnected" };
        self.stats.log_and_reset(&self.clock, receiver_state, server_state);

        let (mut modes_req, mut modes_total, mut adsb_req, mut adsb_total) = (0u64, 0u64, 0u64, 0u64);
        for (_, ac) in self.registry.iter() {
            if ac.messages < 2 {
                continue;
            }
            if ac.adsb_good(now) {
                adsb_total += 1;
                if ac.requested {
                    adsb_req += 1;
                }
            } else {
                modes_total += 1;
                if ac.requested {
                    modes_req += 1;
                }
            }
        }

        info!(
            modes_req, modes_total, adsb_req, adsb_total,
            "aircraft: {modes_req} of {modes_total} Mode S, {adsb_req} of {adsb_total} ADS-B used"
        );

        if self.recent_jumps > 0 {
            info!(count = self.recent_jumps, "out-of-order timestamps");
            self.recent_jumps = 0;
        }
    }

    // ---- server link callbacks -----------------------------------------

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected => {
                info!("server: connected");
                self.server_connected();
            }
            ServerEvent::Disconnected(reason) => {
                warn!(reason, "server: disconnected");
                self.server_disconnected();
            }
            ServerEvent::Denied(reasons) => {
                warn!(?reasons, "server: denied connection");
                self.server_disconnected();
            }
            ServerEvent::StartSending(icaos) => {
                self.server_start_sending(icaos).await;
            }
            ServerEvent::StopSending(icaos) => {
                self.server_stop_sending(icaos).await;
            }
            ServerEvent::Result(result) => {
                self.server_mlat_result(result);
            }
            ServerEvent::None => {}
        }
    }

    fn server_connected(&mut self) {
        self.requested_traffic.clear();
        self.requested_modeac.clear();
        self.registry.clear();
        let jitter: f64 = rand::rng().random_range(0.0..REPORT_INTERVAL);
        self.next_report = Some(jitter);
    }

    fn server_disconnected(&mut self) {
        self.receiver
            .disconnect(&self.clock, "lost connection to multilateration server, no need for input data");
        self.next_report = None;
    }

    fn server_mlat_result(&mut self, result: crate::server::PositionResult) {
        self.stats.mlat_positions += 1;

        let anon = false;
        let modeac = false;
        if anon && !self.allow_anon {
            return;
        }
        if modeac && !self.allow_modeac {
            return;
        }

        let _ = self.outputs.send(PositionFix {
            timestamp: result.timestamp,
            address: result.address,
            lat: result.lat,
            lon: result.lon,
            alt_ft: result.alt_ft,
            nsvel: result.nsvel,
            ewvel: result.ewvel,
            vrate: result.vrate,
            callsign: result.callsign,
            squawk: result.squawk,
            error_est: result.error_est,
            nstations: result.nstations,
            anon,
            modeac,
        });
    }

    async fn server_start_sending(&mut self, icaos: Vec<u32>) {
        for &icao in &icaos {
            if let Some(ac) = self.registry.get_mut(icao) {
                ac.requested = true;
            }
        }
        self.requested_traffic.extend(icaos);
        self.update_receiver_filter().await;
    }

    async fn server_stop_sending(&mut self, icaos: Vec<u32>) {
        for &icao in &icaos {
            if let Some(ac) = self.registry.get_mut(icao) {
                ac.requested = false;
            }
        }
        for icao in &icaos {
            self.requested_traffic.remove(icao);
        }
        self.update_receiver_filter().await;
    }

    /// Recompute the set the receiver should be asked to forward MLAT
    /// candidates for: requested aircraft that aren't already
    /// ADS-B-good (spec invariant 7).
    async fn update_receiver_filter(&mut self) {
        let now = self.clock.now();
        let mlat_set: HashSet<u32> = self
            .requested_traffic
            .iter()
            .filter(|icao| match self.registry.get(**icao) {
                Some(ac) => !ac.adsb_good(now),
                None => true,
            })
            .copied()
            .collect();

        self.receiver.update_filter(mlat_set);
        self.receiver
            .update_modeac_filter(self.requested_modeac.clone())
            .await;
    }

    // ---- receiver link callbacks ----------------------------------------

    async fn handle_receiver_event(&mut self, event: ReceiverEvent) {
        match event {
            ReceiverEvent::Connected => {
                info!("receiver: connected");
                self.input_connected();
            }
            ReceiverEvent::Disconnected(reason) => {
                warn!(reason, "receiver: disconnected");
                self.input_disconnected();
            }
            ReceiverEvent::Messages(messages) => {
                self.input_received_messages(messages).await;
            }
        }
    }

    fn input_connected(&mut self) {
        self.server.send_input_connected(&self.clock);
    }

    fn input_disconnected(&mut self) {
        self.server.send_input_disconnected(&self.clock);

        let reported: Vec<Icao> = self
            .registry
            .iter()
            .filter(|(_, ac)| ac.reported)
            .map(|(icao, _)| *icao)
            .collect();
        self.registry.clear();
        if !reported.is_empty() {
            self.server.send_lost(&self.clock, &reported);
        }
    }

    async fn input_received_messages(&mut self, messages: Vec<Message>) {
        let now = self.clock.now();
        for message in &messages {
            match &message.kind {
                MessageKind::Event(event) => self.dispatch_event(*event, now).await,
                MessageKind::ModeS { df, .. } => self.dispatch_mode_s(*df, message, now).await,
                MessageKind::ModeAc { code } => self.received_modeac(*code, message).await,
            }
        }
    }

    async fn dispatch_event(&mut self, event: DecoderEvent, now: f64) {
        match event {
            DecoderEvent::ModeChange { mode, frequency, epoch } => {
                self.clock_frequency = frequency;
                self.recent_jumps = 0;
                self.server.send_clock_reset(
                    &self.clock,
                    &format!("Decoder mode changed to {mode}"),
                    Some((frequency, epoch, mode)),
                );
                info!(mode, freq_mhz = frequency as f64 / 1e6, "input format changed");
            }
            DecoderEvent::EpochRollover => {
                self.server
                    .send_clock_reset(&self.clock, "Epoch rollover detected", None);
            }
            DecoderEvent::TimestampJump => {
                self.recent_jumps += 1;
                self.server.send_clock_jump(&self.clock);
                if self.recent_jumps % 9 == 8 && now - self.last_jump_message > JUMP_WARNING_INTERVAL {
                    self.last_jump_message = now;
                    warn!(
                        "the timestamps provided by your receiver do not seem to be self-consistent; \
                         this can happen if you feed data from multiple receivers to a single client"
                    );
                }
            }
            DecoderEvent::RadarcapePosition { lat, lon, alt: _ } => {
                if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) {
                    info!(lat, lon, "receiver-reported antenna position update");
                }
            }
        }
    }

    async fn dispatch_mode_s(&mut self, df: u8, message: &Message, now: f64) {
        match df {
            0 | 4 | 5 | 16 | 20 | 21 => self.received_df_misc(message, now).await,
            11 => self.received_df11(message, now).await,
            17 => self.received_df17(message, now).await,
            _ => {}
        }
    }

    async fn received_df_misc(&mut self, message: &Message, now: f64) {
        let Some(address) = message.address() else { return };

        let send = {
            let Some(ac) = self.registry.get_mut(address) else { return };
            ac.messages += 1;
            ac.last_message_time = now;
            ac.messages >= 10 && ac.requested && !ac.adsb_good(now)
        };

        if send {
            self.server.send_mlat(&self.clock, message).await;
        }
    }

    async fn received_df11(&mut self, message: &Message, now: f64) {
        let Some(address) = message.address() else { return };

        if !self.registry.contains(address) {
            let requested = self.requested_traffic.contains(&address);
            self.registry.get_or_create(address, now, requested);
            return;
        }

        let send = {
            let Some(ac) = self.registry.get_mut(address) else { return };
            ac.messages += 1;
            ac.last_message_time = now;
            ac.messages >= 10 && ac.requested && !ac.adsb_good(now)
        };

        if send {
            self.server.send_mlat(&self.clock, message).await;
        }
    }

    async fn received_df17(&mut self, message: &Message, now: f64) {
        let Some(address) = message.address() else { return };

        if !self.registry.contains(address) {
            let requested = self.requested_traffic.contains(&address);
            self.registry.get_or_create(address, now, requested);
            return;
        }

        let MessageKind::ModeS { even_cpr, odd_cpr, altitude, nuc, valid, .. } = message.kind else {
            return;
        };

        let should_sync = {
            let Some(ac) = self.registry.get_mut(address) else { return };
            ac.messages += 1;
            ac.last_message_time = now;

            if ac.messages < 10 {
                return;
            }
            if (!even_cpr && !odd_cpr) || !valid {
                return;
            }

            if even_cpr {
                ac.even_message = Some(message.clone());
            } else {
                ac.odd_message = Some(message.clone());
            }

            let (Some(even), Some(odd)) = (&ac.even_message, &ac.odd_message) else {
                return;
            };
            if (even.timestamp as i64 - odd.timestamp as i64).unsigned_abs() > 5 * self.clock_frequency {
                return;
            }

            if altitude.is_none() || nuc < 6 {
                return;
            }

            ac.recent_adsb_positions += 1;
            if even_cpr {
                ac.last_even_time = now;
            } else {
                ac.last_odd_time = now;
            }

            ac.requested
        };

        if !should_sync {
            return;
        }

        if self.server.split_sync_negotiated() {
            self.server.send_split_sync(&self.clock, message).await;
        } else {
            let (even, odd) = {
                let ac = self.registry.get(address).unwrap();
                (ac.even_message.clone().unwrap(), ac.odd_message.clone().unwrap())
            };
            self.server.send_sync(&self.clock, &even, &odd).await;
        }
    }

    async fn received_modeac(&mut self, code: u16, message: &Message) {
        if !self.requested_modeac.contains(&code) {
            return;
        }
        self.server.send_mlat(&self.clock, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::InputType;
    use crate::server::HandshakeData;

    fn new_coordinator() -> Coordinator {
        let clock = Clock::new();
        let receiver = ReceiverLink::new("127.0.0.1".to_string(), 1, InputType::Beast);
        let handshake = HandshakeData {
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            user: "test".to_string(),
            clock_type: "beast".to_string(),
            clock_frequency: 12_000_000,
            clock_epoch: 0.0,
            privacy: false,
        };
        let server = ServerLink::new(("127.0.0.1".to_string(), 1), handshake, true, true, false);
        let (tx, _rx) = broadcast::channel(16);
        Coordinator::new(clock, receiver, server, tx, true, true)
    }

    fn mode_s(df: u8, address: u32, even_cpr: bool, odd_cpr: bool, altitude: Option<f64>, nuc: u8) -> Message {
        Message {
            kind: MessageKind::ModeS {
                df,
                address: Some(address),
                even_cpr,
                odd_cpr,
                altitude,
                nuc,
                valid: true,
            },
            timestamp: 0,
            frame: crate::decoder::Frame::new(&[0u8; 14]),
        }
    }

    /// Scenario 1 (spec §8): repeated DF11s for one address create a
    /// single tracked aircraft whose message count climbs, without ever
    /// becoming reportable on the first sighting.
    #[tokio::test]
    async fn repeated_df11_creates_one_aircraft_and_counts_messages() {
        let mut c = new_coordinator();
        let address = 0xABCDEFu32;

        for _ in 0..15 {
            c.input_received_messages(vec![mode_s(11, address, false, false, None, 0)]).await;
        }

        assert!(c.registry.contains(address));
        assert_eq!(c.registry.get(address).unwrap().messages, 15);
        assert!(!c.registry.get(address).unwrap().reported);
    }

    /// Scenario 4 (spec §8): `start_sending`/`stop_sending` churn is
    /// reflected in the receiver's pushed-down filter immediately, with
    /// no aircraft yet in the registry (spec invariant 7's `None` arm).
    #[tokio::test]
    async fn filter_churn_reflected_in_receiver_filter() {
        let mut c = new_coordinator();
        let address = 0xABCDEFu32;

        c.server_start_sending(vec![address]).await;
        assert!(c.receiver.requested_traffic().contains(&address));

        c.server_stop_sending(vec![address]).await;
        assert!(!c.receiver.requested_traffic().contains(&address));
    }

    /// Spec invariant 7: once an aircraft is ADS-B-good, it drops out of
    /// the receiver's requested-MLAT-candidates filter even though it
    /// stays in `requested_traffic`.
    #[tokio::test]
    async fn adsb_good_aircraft_excluded_from_receiver_filter() {
        let mut c = new_coordinator();
        let address = 0xABCDEFu32;

        c.server_start_sending(vec![address]).await;
        let now = c.clock.now();
        c.registry.get_or_create(address, now, true);
        {
            let ac = c.registry.get_mut(address).unwrap();
            ac.last_even_time = now;
            ac.last_odd_time = now;
        }

        c.update_receiver_filter().await;
        assert!(!c.receiver.requested_traffic().contains(&address));
    }

    /// Spec invariant 6: non-DF17 downlink formats never populate the
    /// even/odd reference-pair slots, no matter how many are received.
    #[tokio::test]
    async fn non_df17_messages_never_seed_a_reference_pair() {
        let mut c = new_coordinator();
        let address = 0x123456u32;

        for df in [0u8, 4, 5, 16, 20, 21] {
            for _ in 0..12 {
                c.input_received_messages(vec![mode_s(df, address, false, false, None, 0)]).await;
            }
        }

        let ac = c.registry.get(address).unwrap();
        assert!(ac.even_message.is_none());
        assert!(ac.odd_message.is_none());
    }

    /// Scenario 2 (spec §8): once ten-plus DF17s have been seen, a
    /// matching even/odd CPR pair becomes a reference (both slots
    /// filled); a later DF4 on the same aircraft, with the reference
    /// gone stale (`adsb_good == false`), is recognized as an MLAT
    /// candidate (`messages >= 10 && requested && !adsb_good`).
    #[tokio::test]
    async fn reference_pair_then_stale_df4_is_recognized_as_candidate() {
        let mut c = new_coordinator();
        let address = 0xABCDEFu32;

        c.server_start_sending(vec![address]).await;

        // First DF17 only creates the aircraft (requested=true, since
        // `requested_traffic` already contains it).
        c.input_received_messages(vec![mode_s(17, address, false, false, None, 0)]).await;
        assert!(c.registry.get(address).unwrap().requested);

        // Eight filler DF17s with neither CPR bit set: bump the message
        // count toward the ten-message threshold without touching the
        // reference-pair slots.
        for _ in 0..8 {
            c.input_received_messages(vec![mode_s(17, address, false, false, None, 0)]).await;
        }
        assert_eq!(c.registry.get(address).unwrap().messages, 9);

        // Tenth and eleventh messages: a valid even/odd pair with
        // altitude and nuc >= 6, crossing the threshold.
        c.input_received_messages(vec![mode_s(17, address, true, false, Some(35_000.0), 7)]).await;
        c.input_received_messages(vec![mode_s(17, address, false, true, Some(35_000.0), 7)]).await;

        let ac = c.registry.get(address).unwrap();
        assert_eq!(ac.messages, 11);
        assert!(ac.even_message.is_some());
        assert!(ac.odd_message.is_some());

        // Force the reference stale (spec: "make gap >30s").
        {
            let ac = c.registry.get_mut(address).unwrap();
            ac.last_even_time -= 40.0;
            ac.last_odd_time -= 40.0;
        }
        let now = c.clock.now();
        assert!(!c.registry.get(address).unwrap().adsb_good(now));

        // A DF4 now qualifies as an MLAT candidate.
        c.input_received_messages(vec![mode_s(4, address, false, false, None, 0)]).await;
        let ac = c.registry.get(address).unwrap();
        assert_eq!(ac.messages, 12);
        assert!(ac.requested && !ac.adsb_good(now));
    }
}
