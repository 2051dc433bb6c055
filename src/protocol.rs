//! Trapper envelope codec.
//!
//! Every message is framed as `ZBXD\x01`, an unsigned 64-bit little-endian body length, then a
//! minified JSON body. The collector's JSON reader is not a general parser: keys must come in a
//! fixed order and no whitespace may follow `:` or `,`.
use std::{
    io::{self, Read, Write},
    time::{SystemTime, UNIX_EPOCH},
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Value};

/// Protocol magic followed by the protocol version.
pub const HEADER: [u8; 5] = *b"ZBXD\x01";

/// Header plus the length field.
pub const PREFIX_LEN: usize = HEADER.len() + 8;

/// The collector refuses to receive more than this in a single message.
pub const DEFAULT_MAX_RESPONSE_LEN: u64 = 1 << 30;

pub const REQUEST_SENDER_DATA: &str = "sender data";

const BODY_OPEN: &[u8] = br#"{"request":"sender data","data":"#;
const CLOCK_FIELD: &[u8] = br#","clock":"#;
const NS_FIELD: &[u8] = br#","ns":"#;
const BODY_CLOSE: u8 = b'}';

static COUNTERS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)processed:?\s*(\d+);?\s*failed:?\s*(\d+)").ok());

/// Capability switches for the protocol variants collectors have shipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolOptions {
    /// Append the encode-time nanoseconds (`ns`) after the top-level `clock`.
    pub nanoseconds: bool,
    /// Extract the processed/failed counters from the response `info` text.
    pub parse_counts: bool,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            nanoseconds: true,
            parse_counts: true,
        }
    }
}

/// A single observation pushed to a trapper item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub host: String,
    pub key: String,
    /// Unix seconds, zero or `None` is left out of the wire form.
    #[serde(default, skip_serializing_if = "is_unset")]
    pub clock: Option<i64>,
    /// Nanosecond part of `clock`, zero or `None` is left out of the wire form.
    #[serde(default, skip_serializing_if = "is_unset")]
    pub ns: Option<u32>,
    pub value: String,
}

fn is_unset<T: Default + PartialEq>(v: &Option<T>) -> bool {
    v.as_ref().map_or(true, |v| *v == T::default())
}

impl MetricRecord {
    pub fn new<H, K, V>(host: H, key: K, value: V) -> Self
    where
        H: Into<String>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            host: host.into(),
            key: key.into(),
            clock: None,
            ns: None,
            value: value.into().to_string(),
        }
    }
    pub fn with_clock(mut self, clock: i64) -> Self {
        self.clock = Some(clock);
        self
    }
    pub fn with_ns(mut self, ns: u32) -> Self {
        self.ns = Some(ns);
        self
    }
    /// Stamps the record with both seconds and nanoseconds of `ts`.
    ///
    /// Instants before the Unix epoch are left unset.
    pub fn with_timestamp(mut self, ts: SystemTime) -> Self {
        if let Ok(d) = ts.duration_since(UNIX_EPOCH) {
            self.clock = i64::try_from(d.as_secs()).ok();
            self.ns = Some(d.subsec_nanos());
        }
        self
    }
}

/// A fully framed `sender data` request.
///
/// The buffer is allocated once at its final size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireRequest(Vec<u8>);

impl WireRequest {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
    /// The JSON body, without header and length.
    pub fn body(&self) -> &[u8] {
        &self.0[PREFIX_LEN..]
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn capacity(&self) -> usize {
        self.0.capacity()
    }
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl AsRef<[u8]> for WireRequest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Encodes `records` into a framed request stamped with `now`.
pub fn encode_request(
    records: &[MetricRecord],
    now: SystemTime,
    options: &ProtocolOptions,
) -> Result<WireRequest, Error> {
    let data = serde_json::to_vec(records).map_err(Error::Encode)?;
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let clock = since_epoch.as_secs().to_string();
    let ns = options
        .nanoseconds
        .then(|| since_epoch.subsec_nanos().to_string());
    let body_len = BODY_OPEN.len()
        + data.len()
        + CLOCK_FIELD.len()
        + clock.len()
        + ns.as_ref().map_or(0, |ns| NS_FIELD.len() + ns.len())
        + 1;
    let mut buf = Vec::with_capacity(PREFIX_LEN + body_len);
    buf.extend_from_slice(&HEADER);
    buf.extend_from_slice(&u64::try_from(body_len)?.to_le_bytes());
    buf.extend_from_slice(BODY_OPEN);
    buf.extend_from_slice(&data);
    buf.extend_from_slice(CLOCK_FIELD);
    buf.extend_from_slice(clock.as_bytes());
    if let Some(ns) = ns {
        buf.extend_from_slice(NS_FIELD);
        buf.extend_from_slice(ns.as_bytes());
    }
    buf.push(BODY_CLOSE);
    debug_assert_eq!(buf.len(), PREFIX_LEN + body_len);
    Ok(WireRequest(buf))
}

/// The body of a `sender data` request as seen by a collector.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RequestBody {
    pub request: String,
    #[serde(default)]
    pub data: Vec<MetricRecord>,
    #[serde(default)]
    pub clock: Option<i64>,
    #[serde(default)]
    pub ns: Option<u32>,
}

pub fn decode_request(body: &[u8]) -> Result<RequestBody, Error> {
    serde_json::from_slice(body).map_err(Error::Decode)
}

/// The collector's acknowledgement.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ServerResponse {
    /// `"success"` when the collector accepted the request.
    #[serde(rename = "response")]
    pub status: String,
    #[serde(default)]
    pub info: String,
    /// Parsed from `info` on a best-effort basis, zero when absent.
    #[serde(skip)]
    pub processed: u64,
    /// Parsed from `info` on a best-effort basis, zero when absent.
    #[serde(skip)]
    pub failed: u64,
}

impl ServerResponse {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Decodes a response body. Unknown fields are ignored.
///
/// An `info` text without recognizable counters is not an error.
pub fn decode_response(body: &[u8], options: &ProtocolOptions) -> Result<ServerResponse, Error> {
    let mut response: ServerResponse = serde_json::from_slice(body).map_err(Error::Decode)?;
    if options.parse_counts {
        if let Some((processed, failed)) = parse_counts(&response.info) {
            response.processed = processed;
            response.failed = failed;
        }
    }
    Ok(response)
}

/// Extracts `(processed, failed)` from texts like `Processed 2; Failed 0; Total 2; ...`.
pub fn parse_counts(info: &str) -> Option<(u64, u64)> {
    let caps = COUNTERS.as_ref()?.captures(info)?;
    let processed = caps.get(1)?.as_str().parse().ok()?;
    let failed = caps.get(2)?.as_str().parse().ok()?;
    Some((processed, failed))
}

/// Reads one framed message and returns its body.
///
/// Fails with [`Error::BadHeader`] when the peer does not start with [`HEADER`] and with
/// [`Error::ResponseTooLarge`] when the declared length exceeds `max_len`.
pub fn read_frame<R>(mut stream: R, max_len: u64) -> Result<Vec<u8>, Error>
where
    R: Read,
{
    let mut header = [0u8; HEADER.len()];
    stream.read_exact(&mut header)?;
    if header != HEADER {
        return Err(Error::BadHeader(header));
    }
    let buf = &mut [0u8; 8];
    stream.read_exact(buf)?;
    let len = u64::from_le_bytes(*buf);
    if len > max_len {
        return Err(Error::ResponseTooLarge { len, max: max_len });
    }
    let mut body = vec![0u8; usize::try_from(len)?];
    stream.read_exact(&mut body)?;
    Ok(body)
}

/// Writes a whole encoded request.
///
/// A peer that stops accepting bytes midway is reported as [`Error::ShortWrite`], other failures
/// as [`Error::Io`].
pub fn write_request<W>(mut stream: W, request: &WireRequest) -> Result<(), Error>
where
    W: Write,
{
    match stream.write_all(request.as_bytes()) {
        Err(e) if e.kind() == io::ErrorKind::WriteZero => return Err(Error::ShortWrite),
        res => res?,
    }
    stream.flush()?;
    Ok(())
}

/// Writes `body` as one framed message.
pub fn write_frame<W>(mut stream: W, body: &[u8]) -> Result<(), Error>
where
    W: Write,
{
    stream.write_all(&HEADER)?;
    stream.write_all(&u64::try_from(body.len())?.to_le_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}
