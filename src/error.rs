//! Typed component errors, following the `thiserror` style used by
//! `adsb-client`'s `protocol::ParseError` (`ccustine-airjedi-desktop`),
//! layered under `anyhow::Result` at the `main` boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("connect to receiver failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("receiver read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    FormatDetection(#[from] crate::decoder::framing::DetectError),

    #[error("decoder residual buffer exceeded 5120 bytes; receiver is misbehaving")]
    ResidualOverflow,

    #[error("no more bytes in {0}s; inactivity timeout")]
    Inactivity(f64),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("connect to server failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("server I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON from server: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server denied connection: {0:?}")]
    Denied(Vec<String>),

    #[error("unsupported compression method offered by server: {0}")]
    UnsupportedCompression(String),

    #[error("outbound queue exceeded 65536 unsent bytes")]
    QueueOverflow,

    #[error("no data from server in {0}s; disconnecting")]
    Inactivity(f64),
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("bind failed for output listener on {0}: {1}")]
    Bind(String, #[source] std::io::Error),

    #[error("output connection failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid latitude {0}: must be within [-90, 90]")]
    Latitude(f64),

    #[error("invalid longitude {0}: must be within [-180, 360]")]
    Longitude(f64),

    #[error("invalid altitude {0}m: must be within [-420, 5100]")]
    Altitude(f64),

    #[error("unknown input type: {0}")]
    InputType(String),

    #[error("invalid host:port '{0}'")]
    HostPort(String),

    #[error("invalid output spec '{0}': {1}")]
    OutputSpec(String, String),
}
