//! Command-line surface (spec §6): one flag per option the original
//! `mlat-client` exposed via `optparse` in
//! `examples/original_source/mlat/client/options.py`, ported to a
//! `clap` derive `Options` struct following `jet1090/src/cli.rs`'s
//! `Source: FromStr` pattern for the repeatable `--results` flag.

use std::net::ToSocketAddrs;
use std::str::FromStr;

use clap::Parser;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Auto,
    Dump1090,
    Beast,
    Radarcape12Mhz,
    RadarcapeGps,
    Radarcape,
    Sbs,
    AvrMlat,
}

impl FromStr for InputType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(InputType::Auto),
            "dump1090" => Ok(InputType::Dump1090),
            "beast" => Ok(InputType::Beast),
            "radarcape_12mhz" => Ok(InputType::Radarcape12Mhz),
            "radarcape_gps" => Ok(InputType::RadarcapeGps),
            "radarcape" => Ok(InputType::Radarcape),
            "sbs" => Ok(InputType::Sbs),
            "avrmlat" => Ok(InputType::AvrMlat),
            other => Err(ConfigError::InputType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputProtocol {
    Basestation,
    ExtBasestation,
    Beast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDirection {
    Connect,
    Listen,
}

/// One `--results protocol,connect|listen,endpoint` entry.
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub protocol: OutputProtocol,
    pub direction: OutputDirection,
    pub endpoint: String,
}

impl FromStr for OutputSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(3, ',').collect();
        let [protocol, direction, endpoint] = parts[..] else {
            return Err(ConfigError::OutputSpec(
                s.to_string(),
                "expected protocol,connect|listen,endpoint".to_string(),
            ));
        };

        let protocol = match protocol {
            "basestation" => OutputProtocol::Basestation,
            "ext_basestation" => OutputProtocol::ExtBasestation,
            "beast" => OutputProtocol::Beast,
            other => {
                return Err(ConfigError::OutputSpec(
                    s.to_string(),
                    format!("unknown protocol '{other}'"),
                ))
            }
        };

        let direction = match direction {
            "connect" => OutputDirection::Connect,
            "listen" => OutputDirection::Listen,
            other => {
                return Err(ConfigError::OutputSpec(
                    s.to_string(),
                    format!("unknown direction '{other}'"),
                ))
            }
        };

        Ok(OutputSpec {
            protocol,
            direction,
            endpoint: endpoint.to_string(),
        })
    }
}

pub fn latitude(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|_| format!("'{s}' is not a number"))?;
    if !(-90.0..=90.0).contains(&v) {
        return Err(ConfigError::Latitude(v).to_string());
    }
    Ok(v)
}

pub fn longitude(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|_| format!("'{s}' is not a number"))?;
    if !(-180.0..=360.0).contains(&v) {
        return Err(ConfigError::Longitude(v).to_string());
    }
    Ok(if v > 180.0 { v - 360.0 } else { v })
}

/// Accepts a bare number (metres), or a number suffixed `m`/`ft`.
pub fn altitude(s: &str) -> Result<f64, String> {
    let (value, meters) = if let Some(v) = s.strip_suffix("ft") {
        (v, false)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, true)
    } else {
        (s, true)
    };

    let v: f64 = value.parse().map_err(|_| format!("'{s}' is not a number"))?;
    let meters_value = if meters { v } else { v * crate::geo::FT_TO_M };

    if !(-420.0..=5100.0).contains(&meters_value) {
        return Err(ConfigError::Altitude(meters_value).to_string());
    }
    Ok(meters_value)
}

pub fn hostport(s: &str) -> Result<(String, u16), String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::HostPort(s.to_string()).to_string())?;
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::HostPort(s.to_string()).to_string())?;
    Ok((host.to_string(), port))
}

/// The server-facing clock type label for a given `--input-type` (spec
/// §4.D handshake `clock_type`): used by the server to set per-source
/// clock jitter bounds. Ground: `mlat/client/options.py`'s
/// `_receiver_types` table.
pub fn clock_type_label(input_type: InputType) -> &'static str {
    match input_type {
        InputType::Auto | InputType::AvrMlat => "unknown",
        InputType::Dump1090 => "dump1090",
        InputType::Beast => "beast",
        InputType::Radarcape12Mhz => "radarcape_12mhz",
        InputType::RadarcapeGps => "radarcape_gps",
        InputType::Radarcape => "radarcape",
        InputType::Sbs => "sbs",
    }
}

/// Resolve a validated `host:port` pair, used right before a connection
/// attempt rather than at parse time (DNS may legitimately be flaky).
pub fn resolve(hostport: &(String, u16)) -> std::io::Result<Vec<std::net::SocketAddr>> {
    (hostport.0.as_str(), hostport.1).to_socket_addrs().map(Iterator::collect)
}

#[derive(Debug, Parser)]
#[command(
    name = "mlat-client",
    version,
    about = "ADS-B/Mode S multilateration edge client"
)]
pub struct Options {
    /// Receiver input framing; `auto` sniffs the first bytes.
    #[arg(long, default_value = "auto", value_parser = InputType::from_str)]
    pub input_type: InputType,

    /// `host:port` of the local receiver.
    #[arg(long, value_parser = hostport)]
    pub input_connect: (String, u16),

    /// Receiver antenna latitude, degrees.
    #[arg(long, value_parser = latitude)]
    pub lat: f64,

    /// Receiver antenna longitude, degrees.
    #[arg(long, value_parser = longitude)]
    pub lon: f64,

    /// Receiver antenna altitude (suffix `m` or `ft`, default metres).
    #[arg(long, value_parser = altitude)]
    pub alt: f64,

    /// Account identifier presented to the server.
    #[arg(long)]
    pub user: String,

    /// `host:port` of the MLAT server.
    #[arg(long, value_parser = hostport)]
    pub server: (String, u16),

    /// Disable the UDP fast path; use TCP for everything.
    #[arg(long, default_value = "false")]
    pub no_udp: bool,

    /// Ask the server to anonymize this receiver in public output.
    #[arg(long, default_value = "false")]
    pub privacy: bool,

    /// `protocol,connect|listen,endpoint`; repeatable.
    #[arg(long = "results", value_parser = OutputSpec::from_str)]
    pub results: Vec<OutputSpec>,

    /// Suppress results for anonymized aircraft.
    #[arg(long, default_value = "false")]
    pub no_anon_results: bool,

    /// Suppress results for Mode A/C-only aircraft.
    #[arg(long, default_value = "false")]
    pub no_modeac_results: bool,

    /// Tracing filter, e.g. `info`, `mlat_client=debug`.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn longitude_normalizes_above_180() {
        assert_eq!(longitude("350").unwrap(), -10.0);
    }

    #[test]
    fn longitude_rejects_out_of_range() {
        assert!(longitude("361").is_err());
    }

    #[test]
    fn altitude_accepts_feet_suffix() {
        let meters = altitude("1000ft").unwrap();
        assert!((meters - 1000.0 * crate::geo::FT_TO_M).abs() < 1e-9);
    }

    #[test]
    fn output_spec_parses_three_fields() {
        let spec = OutputSpec::from_str("beast,listen,30005").unwrap();
        assert_eq!(spec.protocol, OutputProtocol::Beast);
        assert_eq!(spec.direction, OutputDirection::Listen);
        assert_eq!(spec.endpoint, "30005");
    }

    #[test]
    fn hostport_splits_last_colon() {
        assert_eq!(hostport("mlat.example.com:40147").unwrap(), ("mlat.example.com".to_string(), 40147));
    }
}
