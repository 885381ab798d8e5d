//! Per-ICAO tracked state and the registry the coordinator owns.
//!
//! Grounded in `examples/original_source/mlat/client/coordinator.py`'s
//! `Aircraft` class and the `all_aircraft`/`reported`/`requested_traffic`
//! set bookkeeping in `Coordinator`.

use std::collections::HashMap;

use crate::decoder::Message;

/// Position freshness window: both even and odd CPR updates must be
/// within this many seconds of each other for `adsb_good` to hold.
pub const POSITION_EXPIRY_AGE: f64 = 30.0;
/// An aircraft not heard from in this long is dropped from the registry.
pub const EXPIRY_AGE: f64 = 120.0;

pub type Icao = u32;

#[derive(Debug, Clone)]
pub struct Aircraft {
    pub icao: Icao,
    pub messages: u64,
    pub last_message_time: f64,
    pub last_even_time: f64,
    pub last_odd_time: f64,
    pub even_message: Option<Message>,
    pub odd_message: Option<Message>,
    pub reported: bool,
    pub requested: bool,
    pub rate_measurement_start: f64,
    pub recent_adsb_positions: u64,
}

impl Aircraft {
    pub fn new(icao: Icao, now: f64, requested: bool) -> Self {
        Aircraft {
            icao,
            messages: 1,
            last_message_time: now,
            last_even_time: f64::NEG_INFINITY,
            last_odd_time: f64::NEG_INFINITY,
            even_message: None,
            odd_message: None,
            reported: false,
            requested,
            rate_measurement_start: now,
            recent_adsb_positions: 0,
        }
    }

    /// Recompute `adsb_good`: both even and odd CPR updates seen within
    /// the last 30 s. Monotone-false once that window elapses without a
    /// matching update (spec invariant 5).
    pub fn adsb_good(&self, now: f64) -> bool {
        now - self.last_even_time < POSITION_EXPIRY_AGE && now - self.last_odd_time < POSITION_EXPIRY_AGE
    }

    pub fn expired(&self, now: f64) -> bool {
        now - self.last_message_time > EXPIRY_AGE
    }
}

/// The coordinator's aircraft registry: owned, single-threaded, mutated
/// only from the event loop.
#[derive(Debug, Default)]
pub struct Registry {
    aircraft: HashMap<Icao, Aircraft>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn get(&self, icao: Icao) -> Option<&Aircraft> {
        self.aircraft.get(&icao)
    }

    pub fn get_mut(&mut self, icao: Icao) -> Option<&mut Aircraft> {
        self.aircraft.get_mut(&icao)
    }

    pub fn get_or_create(&mut self, icao: Icao, now: f64, requested: bool) -> &mut Aircraft {
        self.aircraft
            .entry(icao)
            .or_insert_with(|| Aircraft::new(icao, now, requested))
    }

    pub fn remove(&mut self, icao: Icao) -> Option<Aircraft> {
        self.aircraft.remove(&icao)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Icao, &Aircraft)> {
        self.aircraft.iter()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Aircraft> {
        self.aircraft.values_mut()
    }

    pub fn contains(&self, icao: Icao) -> bool {
        self.aircraft.contains_key(&icao)
    }

    pub fn is_empty(&self) -> bool {
        self.aircraft.is_empty()
    }

    pub fn clear(&mut self) {
        self.aircraft.clear();
    }

    /// ICAOs eligible to be reported: `messages > 1` (spec invariant 2).
    pub fn reportable(&self) -> impl Iterator<Item = Icao> + '_ {
        self.aircraft
            .iter()
            .filter(|(_, ac)| ac.messages > 1)
            .map(|(icao, _)| *icao)
    }

    /// Expire aircraft untouched for more than `EXPIRY_AGE`, returning
    /// the ICAOs that were reported to the server (owed a `lost`).
    pub fn expire(&mut self, now: f64) -> Vec<Icao> {
        let expired: Vec<Icao> = self
            .aircraft
            .iter()
            .filter(|(_, ac)| ac.expired(now))
            .map(|(icao, _)| *icao)
            .collect();

        let mut lost = Vec::new();
        for icao in expired {
            if let Some(ac) = self.aircraft.remove(&icao) {
                if ac.reported {
                    lost.push(icao);
                }
            }
        }
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_starts_at_one() {
        let ac = Aircraft::new(0xABCDEF, 0.0, false);
        assert_eq!(ac.messages, 1);
    }

    #[test]
    fn adsb_good_requires_both_recent() {
        let mut ac = Aircraft::new(1, 0.0, false);
        ac.last_even_time = 100.0;
        ac.last_odd_time = 100.0;
        assert!(ac.adsb_good(110.0));
        assert!(!ac.adsb_good(131.0));
    }

    #[test]
    fn registry_expires_stale_reported_aircraft() {
        let mut reg = Registry::new();
        let ac = reg.get_or_create(1, 0.0, false);
        ac.reported = true;
        ac.messages = 2;
        let lost = reg.expire(121.0);
        assert_eq!(lost, vec![1]);
        assert!(reg.get(1).is_none());
    }

    #[test]
    fn reportable_requires_more_than_one_message() {
        let mut reg = Registry::new();
        reg.get_or_create(1, 0.0, false);
        let ac2 = reg.get_or_create(2, 0.0, false);
        ac2.messages = 2;
        let reportable: Vec<_> = reg.reportable().collect();
        assert_eq!(reportable, vec![2]);
    }
}
