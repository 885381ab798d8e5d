//! Synthetic Beast-binary frame construction (spec §4.F).
//!
//! Grounded in `examples/original_source/mlat/client/synthetic_es.py`'s
//! `make_position_frame`/`make_velocity_frame` and the Beast wrapper in
//! `output.py::BeastConnection.send_frame`. Bit layouts are carried over
//! verbatim; only the CRC and the CPR/altitude/velocity math are shared
//! with [`crate::geo`] instead of duplicated.

use crate::geo::{cpr_encode, crc24, encode_altitude, encode_velocity, encode_vrate};

/// `DF=18, CF=2, IMF=0`: fine TIS-B message with a real 24-bit address.
const DF18: u8 = (18 << 3) | 2;
/// `DF=18, CF=5, IMF=0`: fine TIS-B message, anonymized address.
const DF18ANON: u8 = (18 << 3) | 5;
/// `DF=18, CF=2, IMF=1`: fine TIS-B message, track file number (Mode A/C).
const DF18TRACK: u8 = (18 << 3) | 2;
const IMF_TRACK: u8 = 1;

/// Which synthetic DF18 header this fix should be wrapped in, chosen
/// once per fix and threaded through every frame the coordinator emits
/// for it (position pair, altitude-only, velocity).
#[derive(Debug, Clone, Copy)]
pub struct FrameKind {
    df: u8,
    imf: u8,
}

impl FrameKind {
    pub fn for_fix(anon: bool, modeac: bool) -> Self {
        if modeac {
            FrameKind { df: DF18TRACK, imf: IMF_TRACK }
        } else if anon {
            FrameKind { df: DF18ANON, imf: 0 }
        } else {
            FrameKind { df: DF18, imf: 0 }
        }
    }
}

fn with_crc(mut frame: [u8; 14]) -> [u8; 14] {
    let c = crc24(&frame[..11]);
    frame[11] = ((c >> 16) & 0xFF) as u8;
    frame[12] = ((c >> 8) & 0xFF) as u8;
    frame[13] = (c & 0xFF) as u8;
    frame
}

fn position_frame(kind: FrameKind, addr: u32, metype: u8, elat: u32, elon: u32, ealt: u16, odd: bool) -> [u8; 14] {
    let mut frame = [0u8; 14];
    frame[0] = kind.df;
    frame[1] = ((addr >> 16) & 0xFF) as u8;
    frame[2] = ((addr >> 8) & 0xFF) as u8;
    frame[3] = (addr & 0xFF) as u8;
    frame[4] = (metype << 3) | kind.imf;
    frame[5] = ((ealt >> 4) & 0xFF) as u8;
    frame[6] = ((ealt & 0x0F) << 4) as u8;
    if odd {
        frame[6] |= 0x04;
    }
    frame[6] |= ((elat >> 15) & 0x03) as u8;
    frame[7] = ((elat >> 7) & 0xFF) as u8;
    frame[8] = (((elat & 0x7F) << 1) as u8) | (((elon >> 16) & 1) as u8);
    frame[9] = ((elon >> 8) & 0xFF) as u8;
    frame[10] = (elon & 0xFF) as u8;
    with_crc(frame)
}

/// ME type 0: airborne position, horizontal position unavailable.
pub fn altitude_only_frame(kind: FrameKind, addr: u32, alt_ft: f64) -> [u8; 14] {
    position_frame(kind, addr, 0, 0, 0, encode_altitude(Some(alt_ft)), false)
}

/// ME type 18: airborne position, baro altitude, NUCp=0. Returns the
/// even/odd pair the receiving decoder needs to recover a position.
pub fn position_frame_pair(kind: FrameKind, addr: u32, lat: f64, lon: f64, alt_ft: f64) -> ([u8; 14], [u8; 14]) {
    let ealt = encode_altitude(Some(alt_ft));
    let (even_lat, even_lon) = cpr_encode(lat, lon, false);
    let (odd_lat, odd_lon) = cpr_encode(lat, lon, true);
    let even = position_frame(kind, addr, 18, even_lat, even_lon, ealt, false);
    let odd = position_frame(kind, addr, 18, odd_lat, odd_lon, ealt, true);
    (even, odd)
}

/// ME type 19 subtype 1/2: airborne velocity, ground speed.
pub fn velocity_frame(
    kind: FrameKind,
    addr: u32,
    nsvel: Option<f64>,
    ewvel: Option<f64>,
    vrate: Option<f64>,
) -> [u8; 14] {
    let supersonic = nsvel.is_some_and(|v| v.abs() > 1000.0) || ewvel.is_some_and(|v| v.abs() > 1000.0);
    let e_ns = encode_velocity(nsvel, supersonic);
    let e_ew = encode_velocity(ewvel, supersonic);
    let e_vr = encode_vrate(vrate);

    let mut frame = [0u8; 14];
    frame[0] = kind.df;
    frame[1] = ((addr >> 16) & 0xFF) as u8;
    frame[2] = ((addr >> 8) & 0xFF) as u8;
    frame[3] = (addr & 0xFF) as u8;
    frame[4] = (19 << 3) | if supersonic { 2 } else { 1 };
    frame[5] = (kind.imf << 7) | (((e_ew >> 8) & 0x07) as u8);
    frame[6] = (e_ew & 0xFF) as u8;
    frame[7] = ((e_ns >> 3) & 0xFF) as u8;
    frame[8] = (((e_ns & 0x07) << 5) as u8) | 0x10 | (((e_vr >> 6) & 0x0F) as u8);
    frame[9] = ((e_vr & 0x3F) << 2) as u8;
    frame[10] = 0;
    with_crc(frame)
}

/// Magic-MLAT-timestamp Beast wrapper: `1A '3' FF 00 'MLAT' 00`, then
/// the 14-byte frame with embedded `0x1A` bytes doubled (spec §4.F).
pub fn wrap_frame(frame: &[u8; 14], out: &mut Vec<u8>) {
    out.extend_from_slice(b"\x1A\x33\xFF\x00MLAT\x00");
    for &b in frame {
        if b == 0x1A {
            out.push(b);
        }
        out.push(b);
    }
}

/// Keepalive sent every 60s of silence (spec §4.F).
pub const KEEPALIVE: &[u8] = b"\x1A\x31\x00\x00\x00\x00\x00\x00\x00\x00\x00";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_embedded_matches_computed() {
        let kind = FrameKind::for_fix(false, false);
        let frame = altitude_only_frame(kind, 0xABCDEF, 35000.0);
        let computed = crc24(&frame[..11]);
        let embedded = ((frame[11] as u32) << 16) | ((frame[12] as u32) << 8) | frame[13] as u32;
        assert_eq!(computed, embedded);
    }

    #[test]
    fn position_pair_carries_oddness_bit() {
        let kind = FrameKind::for_fix(false, false);
        let (even, odd) = position_frame_pair(kind, 0x123456, 48.8, 2.3, 35000.0);
        assert_eq!(even[6] & 0x04, 0);
        assert_eq!(odd[6] & 0x04, 0x04);
    }

    #[test]
    fn modeac_frame_uses_track_imf() {
        let kind = FrameKind::for_fix(false, true);
        let frame = altitude_only_frame(kind, 0x7700, 1000.0);
        assert_eq!(frame[4] & 0x07, 1); // imf bit set, metype 0
    }

    #[test]
    fn wrap_frame_doubles_escape_bytes() {
        let mut frame = [0u8; 14];
        frame[0] = 0x1A;
        let mut out = Vec::new();
        wrap_frame(&frame, &mut out);
        // header (8 bytes) + doubled 0x1A + 13 remaining bytes
        assert_eq!(out.len(), 8 + 2 + 13);
        assert_eq!(out[8], 0x1A);
        assert_eq!(out[9], 0x1A);
    }
}
