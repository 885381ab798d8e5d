//! Rolling traffic counters, logged and reset periodically.
//!
//! Mirrors `mlat/client/stats.py`'s `Stats`/`global_stats`, but owned by
//! the [`crate::coordinator::Coordinator`] and passed by reference
//! instead of living in module-global state (Design Note: "replace
//! `global_stats` with an owned stats record").

use tracing::{info, warn};

use crate::clock::Clock;

#[derive(Debug, Default)]
pub struct Stats {
    pub server_tx_bytes: u64,
    pub server_rx_bytes: u64,
    pub server_udp_bytes: u64,
    pub receiver_rx_bytes: u64,
    pub receiver_rx_messages: u64,
    pub receiver_rx_filtered: u64,
    pub receiver_rx_mlat_magic: u64,
    pub mlat_positions: u64,
    start: f64,
}

impl Stats {
    pub fn new(clock: &Clock) -> Self {
        Stats {
            start: clock.now(),
            ..Default::default()
        }
    }

    fn reset(&mut self, clock: &Clock) {
        let start = clock.now();
        *self = Stats {
            start,
            ..Default::default()
        };
    }

    /// Emit a human-readable summary and zero all counters.
    ///
    /// `receiver_state` / `server_state` are short state labels (e.g.
    /// `"connected"`), logged the way `log_and_reset` in the original
    /// client printed `coordinator.receiver.state`/`server.state`.
    pub fn log_and_reset(
        &mut self,
        clock: &Clock,
        receiver_state: &str,
        server_state: &str,
    ) {
        let now = clock.now();
        let elapsed = (now - self.start).max(1e-6);

        let processed = self
            .receiver_rx_messages
            .saturating_sub(self.receiver_rx_filtered);
        let pct = if self.receiver_rx_messages == 0 {
            0.0
        } else {
            100.0 * processed as f64 / self.receiver_rx_messages as f64
        };

        info!(
            state = receiver_state,
            received_per_s = self.receiver_rx_messages as f64 / elapsed,
            processed_per_s = processed as f64 / elapsed,
            processed_pct = pct,
            "receiver traffic"
        );

        if self.receiver_rx_mlat_magic > 0 {
            warn!(
                count = self.receiver_rx_mlat_magic,
                "ignored messages with MLAT magic timestamp (is --forward-mlat on upstream?)"
            );
        }

        info!(
            state = server_state,
            rx_kbps = self.server_rx_bytes as f64 / elapsed / 1000.0,
            tx_kbps = (self.server_tx_bytes + self.server_udp_bytes) as f64 / elapsed / 1000.0,
            "server traffic"
        );

        info!(
            positions_per_min = self.mlat_positions as f64 / elapsed * 60.0,
            "mlat results"
        );

        self.reset(clock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_zeroes_counters() {
        let clock = Clock::new();
        let mut stats = Stats::new(&clock);
        stats.server_tx_bytes = 100;
        stats.mlat_positions = 5;
        stats.log_and_reset(&clock, "connected", "ready");
        assert_eq!(stats.server_tx_bytes, 0);
        assert_eq!(stats.mlat_positions, 0);
    }
}
