//! Basestation / Extended Basestation CSV formatting (spec §4.F).
//!
//! Grounded in `examples/original_source/mlat/client/output.py`'s
//! `BasestationConnection`/`ExtBasestationConnection` `MSG,3,...`
//! template; field order and rounding are carried over verbatim.

use chrono::{DateTime, Utc};

use super::PositionFix;

fn csv_quote(s: &str) -> String {
    if !s.contains(['\n', '"', ',']) {
        s.to_string()
    } else {
        format!("\"{}\"", s.replace('"', "\"\""))
    }
}

fn format_date(unix: f64) -> String {
    DateTime::<Utc>::from_timestamp(unix as i64, 0)
        .unwrap_or_default()
        .format("%Y/%m/%d")
        .to_string()
}

fn format_time(unix: f64) -> String {
    let dt = DateTime::<Utc>::from_timestamp(unix as i64, 0).unwrap_or_default();
    let millis = ((unix.fract()) * 1000.0).round();
    format!("{}.{millis:03.0}", dt.format("%H:%M:%S"))
}

fn address_field(fix: &PositionFix) -> String {
    let prefix = if fix.modeac {
        "@"
    } else if fix.anon {
        "~"
    } else {
        ""
    };
    format!("{prefix}{:06X}", fix.address)
}

/// `MSG,3,...` line, no trailing newline.
pub fn format_basestation(fix: &PositionFix, now: f64) -> String {
    let timestamp = if fix.timestamp > 0.0 { fix.timestamp } else { now };

    let (speed, heading) = match (fix.nsvel, fix.ewvel) {
        (Some(ns), Some(ew)) => {
            let speed = (ns * ns + ew * ew).sqrt();
            let mut heading = ew.atan2(ns).to_degrees();
            if heading < 0.0 {
                heading += 360.0;
            }
            (Some(speed), Some(heading))
        }
        _ => (None, None),
    };

    let callsign = fix.callsign.as_deref().map(csv_quote).unwrap_or_default();
    let squawk = fix.squawk.as_deref().map(csv_quote).unwrap_or_default();
    let speed = speed.map(|v| (v as i64).to_string()).unwrap_or_default();
    let heading = heading.map(|v| (v as i64).to_string()).unwrap_or_default();
    let vrate = fix.vrate.map(|v| (v as i64).to_string()).unwrap_or_default();

    format!(
        "MSG,3,1,1,{addr},1,{rcv_date},{rcv_time},{now_date},{now_time},{callsign},{alt},{speed},{heading},{lat:.4},{lon:.4},{vrate},{squawk},,,,",
        addr = address_field(fix),
        rcv_date = format_date(timestamp),
        rcv_time = format_time(timestamp),
        now_date = format_date(now),
        now_time = format_time(now),
        callsign = callsign,
        alt = fix.alt_ft as i64,
        speed = speed,
        heading = heading,
        lat = fix.lat,
        lon = fix.lon,
        vrate = vrate,
        squawk = squawk,
    )
}

/// Same as [`format_basestation`] plus `nstations` and rounded `error_est`.
pub fn format_ext_basestation(fix: &PositionFix, now: f64) -> String {
    let base = format_basestation(fix, now);
    let nstations = fix.nstations.map(|n| n.to_string()).unwrap_or_default();
    let line = base.replacen("MSG", "MLAT", 1);
    format!("{line},{nstations},,{error:.0}", error = fix.error_est)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix() -> PositionFix {
        PositionFix {
            timestamp: 1_700_000_000.0,
            address: 0xABCDEF,
            lat: 48.8566,
            lon: 2.3522,
            alt_ft: 35000.0,
            nsvel: Some(300.0),
            ewvel: Some(-40.0),
            vrate: Some(-64.0),
            callsign: Some("AFR123".to_string()),
            squawk: Some("1000".to_string()),
            error_est: 123.4,
            nstations: Some(4),
            anon: false,
            modeac: false,
        }
    }

    #[test]
    fn basestation_line_starts_with_msg3() {
        let line = format_basestation(&fix(), 1_700_000_001.0);
        assert!(line.starts_with("MSG,3,1,1,ABCDEF,1,"));
        assert!(line.contains("AFR123"));
    }

    #[test]
    fn ext_basestation_line_starts_with_mlat3_and_has_nstations() {
        let line = format_ext_basestation(&fix(), 1_700_000_001.0);
        assert!(line.starts_with("MLAT,3,1,1,ABCDEF,1,"));
        assert!(line.ends_with(",4,,123"));
    }

    #[test]
    fn modeac_address_is_at_prefixed() {
        let mut f = fix();
        f.modeac = true;
        let line = format_basestation(&f, 1.0);
        assert!(line.contains("@ABCDEF"));
    }

    #[test]
    fn anon_address_is_tilde_prefixed() {
        let mut f = fix();
        f.anon = true;
        let line = format_basestation(&f, 1.0);
        assert!(line.contains("~ABCDEF"));
    }
}
