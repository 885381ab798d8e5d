//! External decoder interface (spec §6): turns receiver bytes into
//! timestamped Mode S / Mode A-C messages plus synthetic clock events.
//! The coordinator only ever depends on the [`Decoder`] trait, never on
//! [`ModeSDecoder`] directly, matching the "black box, specified only at
//! its interface" framing of the component it replaces.

pub mod framing;
pub mod modes;

use std::collections::HashSet;

pub use framing::Mode;

/// Synthetic clock/receiver events the decoder can surface alongside
/// ordinary messages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecoderEvent {
    ModeChange {
        mode: &'static str,
        frequency: u64,
        epoch: f64,
    },
    EpochRollover,
    TimestampJump,
    RadarcapePosition { lat: f64, lon: f64, alt: f64 },
}

/// An owned, fixed-capacity buffer for the 2/7/14-byte frame forms, so a
/// message never needs a heap allocation of its own.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    bytes: [u8; 14],
    len: u8,
}

impl Frame {
    pub fn new(data: &[u8]) -> Self {
        let mut bytes = [0u8; 14];
        let len = data.len().min(14);
        bytes[..len].copy_from_slice(&data[..len]);
        Frame {
            bytes,
            len: len as u8,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone)]
pub enum MessageKind {
    ModeS {
        df: u8,
        address: Option<u32>,
        even_cpr: bool,
        odd_cpr: bool,
        altitude: Option<f64>,
        nuc: u8,
        valid: bool,
    },
    ModeAc {
        code: u16,
    },
    Event(DecoderEvent),
}

#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub timestamp: u64,
    pub frame: Frame,
}

impl Message {
    pub fn df(&self) -> Option<u8> {
        match self.kind {
            MessageKind::ModeS { df, .. } => Some(df),
            _ => None,
        }
    }

    pub fn address(&self) -> Option<u32> {
        match self.kind {
            MessageKind::ModeS { address, .. } => address,
            _ => None,
        }
    }

    pub fn valid(&self) -> bool {
        matches!(self.kind, MessageKind::ModeS { valid: true, .. })
    }
}

/// The decoder capability surface (spec §6): construct with one receiver
/// mode, feed raw bytes, get back messages.
pub trait Decoder {
    fn mode(&self) -> Mode;
    fn frequency(&self) -> u64;
    fn epoch(&self) -> f64;

    /// Addresses observed since the last call, including filtered ones.
    /// Draining resets the set, per spec §6.
    fn seen(&mut self) -> HashSet<u32>;

    fn set_default_filter(&mut self, df: usize, allow: bool);
    fn set_specific_filter(&mut self, df: usize, addresses: Option<HashSet<u32>>);
    fn set_modeac_filter(&mut self, codes: HashSet<u16>);

    fn received_messages(&self) -> u64;
    fn suppressed_messages(&self) -> u64;
    fn mlat_messages(&self) -> u64;

    /// Bytes currently buffered waiting for a complete frame. The
    /// receiver link treats a persistently growing residual as a fatal
    /// misconfiguration past 5120 bytes (spec §4.C).
    fn residual_len(&self) -> usize;

    /// Feed newly read bytes in. Returns how many were consumed (always
    /// all of `bytes`, the decoder buffers its own residual), the
    /// decoded messages, and whether a parser error is pending — the
    /// caller must invoke `feed` again (even with an empty slice) so the
    /// error surfaces rather than being silently dropped.
    fn feed(&mut self, bytes: &[u8]) -> (usize, Vec<Message>, bool);
}

pub struct ModeSDecoder {
    mode: Mode,
    frequency: u64,
    epoch: f64,
    seen: HashSet<u32>,
    default_filter: [bool; 32],
    specific_filter: Vec<Option<HashSet<u32>>>,
    modeac_filter: HashSet<u16>,
    received_messages: u64,
    suppressed_messages: u64,
    mlat_messages: u64,
    residual: Vec<u8>,
    last_timestamp: Option<u64>,
}

impl ModeSDecoder {
    pub fn new(mode: Mode, frequency: u64, epoch: f64) -> Self {
        ModeSDecoder {
            mode,
            frequency,
            epoch,
            seen: HashSet::new(),
            default_filter: [true; 32],
            specific_filter: vec![None; 32],
            modeac_filter: HashSet::new(),
            received_messages: 0,
            suppressed_messages: 0,
            mlat_messages: 0,
            residual: Vec::new(),
            last_timestamp: None,
        }
    }

    fn allowed(&self, df: u8, address: Option<u32>) -> bool {
        let df = df as usize;
        if df >= self.default_filter.len() {
            return true;
        }
        if let Some(Some(set)) = self.specific_filter.get(df) {
            return address.is_some_and(|addr| set.contains(&addr));
        }
        self.default_filter[df]
    }

    fn check_timestamp_jump(&mut self, timestamp: u64) -> Option<Message> {
        let event = match self.last_timestamp {
            Some(prev) if timestamp < prev => Some(DecoderEvent::EpochRollover),
            Some(prev) if timestamp.saturating_sub(prev) > self.frequency.saturating_mul(10) => {
                Some(DecoderEvent::TimestampJump)
            }
            _ => None,
        };
        self.last_timestamp = Some(timestamp);
        event.map(|event| Message {
            kind: MessageKind::Event(event),
            timestamp,
            frame: Frame::new(&[]),
        })
    }
}

impl Decoder for ModeSDecoder {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn frequency(&self) -> u64 {
        self.frequency
    }

    fn epoch(&self) -> f64 {
        self.epoch
    }

    fn seen(&mut self) -> HashSet<u32> {
        std::mem::take(&mut self.seen)
    }

    fn set_default_filter(&mut self, df: usize, allow: bool) {
        if df < self.default_filter.len() {
            self.default_filter[df] = allow;
        }
    }

    fn set_specific_filter(&mut self, df: usize, addresses: Option<HashSet<u32>>) {
        if df < self.specific_filter.len() {
            self.specific_filter[df] = addresses;
        }
    }

    fn set_modeac_filter(&mut self, codes: HashSet<u16>) {
        self.modeac_filter = codes;
    }

    fn received_messages(&self) -> u64 {
        self.received_messages
    }

    fn suppressed_messages(&self) -> u64 {
        self.suppressed_messages
    }

    fn mlat_messages(&self) -> u64 {
        self.mlat_messages
    }

    fn residual_len(&self) -> usize {
        self.residual.len()
    }

    fn feed(&mut self, bytes: &[u8]) -> (usize, Vec<Message>, bool) {
        if self.mode == Mode::Avr {
            return (bytes.len(), Vec::new(), true);
        }

        self.residual.extend_from_slice(bytes);
        let consumed = bytes.len();

        let raws = framing::extract_frames(self.mode, &mut self.residual);
        let mut messages = Vec::with_capacity(raws.len());

        for raw in raws {
            self.received_messages += 1;
            if raw.mlat_magic {
                self.mlat_messages += 1;
            }

            if let Some(jump) = self.check_timestamp_jump(raw.timestamp) {
                messages.push(jump);
            }

            let frame = Frame::new(&raw.payload);
            match raw.payload.len() {
                2 => {
                    let code = modes::decode_modeac(&raw.payload);
                    messages.push(Message {
                        kind: MessageKind::ModeAc { code },
                        timestamp: raw.timestamp,
                        frame,
                    });
                }
                7 | 14 => {
                    let fields = modes::decode_mode_s(&raw.payload);
                    if let Some(address) = fields.address {
                        self.seen.insert(address);
                    }
                    if fields.valid && self.allowed(fields.df, fields.address) {
                        messages.push(Message {
                            kind: MessageKind::ModeS {
                                df: fields.df,
                                address: fields.address,
                                even_cpr: fields.even_cpr,
                                odd_cpr: fields.odd_cpr,
                                altitude: fields.altitude,
                                nuc: fields.nuc,
                                valid: fields.valid,
                            },
                            timestamp: raw.timestamp,
                            frame,
                        });
                    } else {
                        self.suppressed_messages += 1;
                    }
                }
                _ => {}
            }
        }

        (consumed, messages, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_short_beast_frame_decodes_mode_ac() {
        let mut decoder = ModeSDecoder::new(Mode::Beast, 12_000_000, 0.0);
        let mut bytes = vec![0x1A, b'1'];
        bytes.extend_from_slice(&[0u8; 6]);
        bytes.push(0xFF);
        bytes.extend_from_slice(&[0x12, 0x34]);
        let (_, messages, pending) = decoder.feed(&bytes);
        assert!(!pending);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0].kind, MessageKind::ModeAc { .. }));
    }

    #[test]
    fn avr_mode_is_rejected_outright() {
        let mut decoder = ModeSDecoder::new(Mode::Avr, 12_000_000, 0.0);
        let (_, messages, pending) = decoder.feed(b"whatever");
        assert!(pending);
        assert!(messages.is_empty());
    }

    fn df11_beast_frame(icao: u32) -> Vec<u8> {
        let mut payload = [0u8; 7];
        payload[0] = 11 << 3;
        payload[1] = ((icao >> 16) & 0xFF) as u8;
        payload[2] = ((icao >> 8) & 0xFF) as u8;
        payload[3] = (icao & 0xFF) as u8;
        let c = crate::geo::crc24(&payload[..4]);
        payload[4] = ((c >> 16) & 0xFF) as u8;
        payload[5] = ((c >> 8) & 0xFF) as u8;
        payload[6] = (c & 0xFF) as u8;

        let mut buf = vec![0x1A, b'1'];
        buf.extend_from_slice(&[0u8; 6]); // timestamp
        buf.push(0xFF); // signal
        buf.extend_from_slice(&payload);
        buf
    }

    #[test]
    fn allowed_df11_is_pushed_and_recorded() {
        let mut decoder = ModeSDecoder::new(Mode::Beast, 12_000_000, 0.0);
        let (_, messages, _) = decoder.feed(&df11_beast_frame(0xABCDEF));
        assert_eq!(messages.len(), 1);
        assert_eq!(decoder.suppressed_messages(), 0);
        assert_eq!(decoder.seen().len(), 1);
    }

    #[test]
    fn filtered_df11_is_suppressed_but_still_seen() {
        let mut decoder = ModeSDecoder::new(Mode::Beast, 12_000_000, 0.0);
        decoder.set_default_filter(11, false);
        let (_, messages, _) = decoder.feed(&df11_beast_frame(0xABCDEF));
        assert!(messages.is_empty());
        assert_eq!(decoder.suppressed_messages(), 1);
        assert_eq!(decoder.seen().len(), 1);
    }
}
