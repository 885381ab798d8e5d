//! Geodesy, CPR position encoding and the bit-level encodings used to
//! synthesize Beast/DF17/DF18 frames.
//!
//! Grounded in `examples/original_source/mlat/geodesy.py` (WGS84/ECEF)
//! and `examples/original_source/mlat/client/synthetic_es.py` (CPR
//! encode, altitude/velocity encode, the NL lookup table). The CPR_NL
//! table itself matches the one carried by `rsadsb-adsb_deku`'s
//! `libadsb_deku/src/cpr.rs`, which cites the same ICAO 9871 source.

/// WGS84 semi-major axis, metres.
const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening.
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const WGS84_B: f64 = WGS84_A * (1.0 - WGS84_F);

fn wgs84_ecc_sq() -> f64 {
    1.0 - (WGS84_B * WGS84_B) / (WGS84_A * WGS84_A)
}

/// Feet-to-metres conversion factor used throughout the wire protocol.
pub const FT_TO_M: f64 = 0.3038;
/// Metres-to-feet conversion factor (`1.0 / FT_TO_M`).
pub const M_TO_FT: f64 = 1.0 / FT_TO_M;

/// Convert WGS84 lat/lon (degrees) + height (metres) to ECEF (metres).
pub fn llh2ecef(lat_deg: f64, lon_deg: f64, alt_m: f64) -> (f64, f64, f64) {
    let ecc_sq = wgs84_ecc_sq();
    let lat = lat_deg.to_radians();
    let lon = lon_deg.to_radians();

    let (slat, clat) = lat.sin_cos();
    let (slon, clon) = lon.sin_cos();

    let d = (1.0 - slat * slat * ecc_sq).sqrt();
    let rn = WGS84_A / d;

    let x = (rn + alt_m) * clat * clon;
    let y = (rn + alt_m) * clat * slon;
    let z = (rn * (1.0 - ecc_sq) + alt_m) * slat;

    (x, y, z)
}

/// Convert ECEF (metres) to WGS84 lat/lon (degrees) + height (metres).
pub fn ecef2llh(x: f64, y: f64, z: f64) -> (f64, f64, f64) {
    let ecc_sq = wgs84_ecc_sq();
    let ep = ((WGS84_A.powi(2) - WGS84_B.powi(2)) / WGS84_B.powi(2)).sqrt();
    let ep2_b = ep.powi(2) * WGS84_B;
    let e2_a = ecc_sq * WGS84_A;

    let lon = y.atan2(x);
    let p = (x * x + y * y).sqrt();
    let th = (WGS84_A * z).atan2(WGS84_B * p);
    let lat = (z + ep2_b * th.sin().powi(3)).atan2(p - e2_a * th.cos().powi(3));

    let n = WGS84_A / (1.0 - ecc_sq * lat.sin().powi(2)).sqrt();
    let alt = p / lat.cos() - n;

    (lat.to_degrees(), lon.to_degrees(), alt)
}

/// The CPR NL table: number of longitude zones at a given latitude band.
const NL_TABLE: [(f64, u32); 59] = [
    (10.470_471_30, 59),
    (14.828_174_37, 58),
    (18.186_263_57, 57),
    (21.029_394_93, 56),
    (23.545_044_87, 55),
    (25.829_247_07, 54),
    (27.938_987_10, 53),
    (29.911_356_86, 52),
    (31.772_097_08, 51),
    (33.539_934_36, 50),
    (35.228_995_98, 49),
    (36.850_251_08, 48),
    (38.412_418_92, 47),
    (39.922_566_84, 46),
    (41.386_518_32, 45),
    (42.809_140_12, 44),
    (44.194_549_51, 43),
    (45.546_267_23, 42),
    (46.867_332_52, 41),
    (48.160_391_28, 40),
    (49.427_764_39, 39),
    (50.671_501_66, 38),
    (51.893_424_69, 37),
    (53.095_161_53, 36),
    (54.278_174_72, 35),
    (55.443_784_44, 34),
    (56.593_187_56, 33),
    (57.727_473_54, 32),
    (58.847_637_76, 31),
    (59.954_592_77, 30),
    (61.049_177_74, 29),
    (62.132_166_59, 28),
    (63.204_274_79, 27),
    (64.266_165_23, 26),
    (65.318_453_10, 25),
    (66.361_710_08, 24),
    (67.396_467_74, 23),
    (68.423_220_22, 22),
    (69.442_426_31, 21),
    (70.454_510_75, 20),
    (71.459_864_73, 19),
    (72.458_845_45, 18),
    (73.451_774_42, 17),
    (74.438_934_16, 16),
    (75.420_562_57, 15),
    (76.396_843_91, 14),
    (77.367_894_61, 13),
    (78.333_740_83, 12),
    (79.294_282_25, 11),
    (80.249_232_13, 10),
    (81.198_013_49, 9),
    (82.139_569_81, 8),
    (83.071_994_45, 7),
    (83.991_735_63, 6),
    (84.891_661_91, 5),
    (85.755_416_21, 4),
    (86.535_369_98, 3),
    (87.000_000_00, 2),
    (90.000_000_00, 1),
];

/// The NL function: number of longitude zones at a given latitude.
pub fn cpr_nl(lat: f64) -> u32 {
    let lat = lat.abs();
    for (bound, nl) in NL_TABLE {
        if lat <= bound {
            return nl;
        }
    }
    1
}

/// The N function: number of longitude zones at a given latitude/oddness.
fn cpr_n(lat: f64, odd: bool) -> u32 {
    let nl = cpr_nl(lat) as i64 - if odd { 1 } else { 0 };
    nl.max(1) as u32
}

/// Encode an airborne position using CPR with the given odd flag.
///
/// Returns `(lat17, lon17)`, each in `[0, 2^17)`.
pub fn cpr_encode(lat: f64, lon: f64, odd: bool) -> (u32, u32) {
    const NB_POW: f64 = 131_072.0; // 2^17
    let d_lat = 360.0 / if odd { 59.0 } else { 60.0 };

    let yz = (NB_POW * rem_euclid(lat, d_lat) / d_lat + 0.5).floor();
    let r_lat = d_lat * (yz / NB_POW + (lat / d_lat).floor());

    let d_lon = 360.0 / cpr_n(r_lat, odd) as f64;
    let xz = (NB_POW * rem_euclid(lon, d_lon) / d_lon + 0.5).floor();

    ((yz as i64 & 0x1_FFFF) as u32, (xz as i64 & 0x1_FFFF) as u32)
}

fn rem_euclid(a: f64, m: f64) -> f64 {
    let r = a % m;
    if r < 0.0 {
        r + m
    } else {
        r
    }
}

/// Encode an altitude in feet using the DF17/DF18 Q=1 25ft-step form.
pub fn encode_altitude(ft: Option<f64>) -> u16 {
    let Some(ft) = ft else {
        return 0;
    };
    let i = (((ft + 1012.5) / 25.0) as i64).clamp(0, 0x7FF);
    let i = i as u16;
    // insert Q=1 in bit 4
    (((i & 0x7F0) << 1) | 0x010 | (i & 0x00F)) as u16
}

/// Decode the DF17/DF18 Q=1 altitude form back to feet.
pub fn decode_altitude(encoded: u16) -> f64 {
    let i = ((encoded & 0xFE0) >> 1) | (encoded & 0x00F);
    i as f64 * 25.0 - 1000.0
}

/// Encode a groundspeed (knots) for the DF17/18 velocity subfields.
pub fn encode_velocity(kts: Option<f64>, supersonic: bool) -> u16 {
    let Some(kts) = kts else {
        return 0;
    };

    let (signbit, mut kts) = if kts < 0.0 {
        (0x400u16, -kts)
    } else {
        (0u16, kts)
    };

    if supersonic {
        kts /= 4.0;
    }

    let kts = (kts + 1.5) as i64;
    if kts > 1023 {
        1023 | signbit
    } else {
        (kts as u16) | signbit
    }
}

/// Encode a vertical rate (fpm) for the DF17/18 velocity subfields.
pub fn encode_vrate(fpm: Option<f64>) -> u16 {
    let Some(fpm) = fpm else {
        return 0;
    };

    let (signbit, vr) = if fpm < 0.0 {
        (0x200u16, -fpm)
    } else {
        (0u16, fpm)
    };

    let vr = (vr / 64.0 + 1.5) as i64;
    if vr > 511 {
        511 | signbit
    } else {
        (vr as u16) | signbit
    }
}

/// 24-bit Mode S CRC over an 11-byte buffer (the first 11 bytes of a
/// 14-byte extended squitter frame, before the CRC itself).
///
/// The generator polynomial and table are the standard Mode S CRC used
/// across the ADS-B ecosystem (dump1090, readsb, adsb_deku).
pub fn crc24(bytes: &[u8]) -> u32 {
    const POLY: u32 = 0xFFF_409;
    let mut rem: u32 = 0;
    for &byte in bytes {
        rem ^= (byte as u32) << 16;
        for _ in 0..8 {
            if rem & 0x80_0000 != 0 {
                rem = (rem << 1) ^ POLY;
            } else {
                rem <<= 1;
            }
        }
    }
    rem & 0xFF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecef_round_trip() {
        for lat in [-89.0, -45.0, 0.0, 12.34, 45.0, 89.0] {
            for lon in [-179.0, -90.0, 0.0, 90.0, 179.0] {
                let (x, y, z) = llh2ecef(lat, lon, 1000.0);
                let (lat2, lon2, alt2) = ecef2llh(x, y, z);
                assert!((lat - lat2).abs() < 1e-8, "lat {lat} vs {lat2}");
                assert!((lon - lon2).abs() < 1e-8, "lon {lon} vs {lon2}");
                assert!((alt2 - 1000.0).abs() < 1e-3, "alt {alt2}");
            }
        }
    }

    #[test]
    fn cpr_nl_boundaries() {
        assert_eq!(cpr_nl(89.9999), 1);
        assert_eq!(cpr_nl(90.0), 1);
        assert_eq!(cpr_nl(10.470_471_30), 59);
    }

    #[test]
    fn cpr_encode_range_and_stability() {
        let (lat17, lon17) = cpr_encode(48.856, 2.352, false);
        assert!(lat17 < (1 << 17));
        assert!(lon17 < (1 << 17));

        let d_lat = 360.0 / 60.0;
        let (lat17b, lon17b) = cpr_encode(48.856 + d_lat, 2.352, false);
        assert_eq!(lat17, lat17b);
        assert_eq!(lon17, lon17b);
    }

    #[test]
    fn altitude_round_trip_25ft_steps() {
        let mut ft = -1000.0;
        while ft <= 50175.0 {
            let encoded = encode_altitude(Some(ft));
            assert_eq!(decode_altitude(encoded), ft, "failed at {ft}");
            ft += 25.0;
        }
    }

    #[test]
    fn velocity_encoding_boundaries() {
        assert_eq!(encode_velocity(None, false), 0);
        assert_eq!(encode_velocity(Some(2000.0), true), 501);
        assert_eq!(encode_velocity(Some(-1.0), false), 2 | 0x400);
    }

    #[test]
    fn crc_is_deterministic_and_nonzero_for_nonzero_input() {
        let frame = [0x8Du8, 0x48, 0x56, 0x02, 0x58, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let a = crc24(&frame);
        let b = crc24(&frame);
        assert_eq!(a, b);
        assert!(a <= 0xFF_FFFF);
    }
}
