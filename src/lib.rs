#![ doc = include_str!( concat!( env!( "CARGO_MANIFEST_DIR" ), "/", "README.md" ) ) ]
use std::{io, num::TryFromIntError};

use tracing::debug;

pub mod protocol;
mod sender;
pub mod tls;
mod value;

pub use protocol::{MetricRecord, ProtocolOptions, ServerResponse, WireRequest};
pub use sender::{Sender, SenderBuilder, Session, DEFAULT_PORT};
pub use tls::TlsConfig;
pub use value::{make_records, Value};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("unable to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("tls error: {0}")]
    Tls(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("short write: the peer stopped accepting data")]
    ShortWrite,
    #[error("bad header: {0:02x?}")]
    BadHeader([u8; 5]),
    #[error("response too large: {len} bytes (max {max})")]
    ResponseTooLarge { len: u64, max: u64 },
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("unable to determine the host name")]
    Hostname,
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The peer does not speak the trapper protocol (wrong service or port).
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::BadHeader(_) | Error::ResponseTooLarge { .. })
    }
    pub fn is_connect(&self) -> bool {
        matches!(self, Error::Connect { .. })
    }
}

impl From<TryFromIntError> for Error {
    fn from(error: TryFromIntError) -> Self {
        Self::Other(error.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(error: rustls::Error) -> Self {
        Self::Tls(error.to_string())
    }
}

/// Returns the host name records should be reported for.
///
/// A non-empty `explicit` name is used as-is, otherwise the operating system is asked.
pub fn resolve_hostname(explicit: Option<&str>) -> Result<String, Error> {
    if let Some(name) = explicit.map(str::trim).filter(|h| !h.is_empty()) {
        return Ok(name.to_owned());
    }
    match hostname::get() {
        Ok(name) => Some(name.to_string_lossy().trim().to_owned())
            .filter(|h| !h.is_empty())
            .ok_or(Error::Hostname),
        Err(error) => {
            debug!(%error, "failed to query the host name");
            Err(Error::Hostname)
        }
    }
}
