use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    sync::Arc,
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use rustls::{ClientConnection, StreamOwned};
use tracing::{debug, trace};

use crate::{
    protocol::{self, MetricRecord, ProtocolOptions, ServerResponse, WireRequest},
    tls::{TlsConfig, TlsConnector},
    Error,
};

/// Default trapper port of the collector.
pub const DEFAULT_PORT: u16 = 10051;

pub struct SenderBuilder {
    addr: String,
    timeout: Option<Duration>,
    tls: Option<TlsConfig>,
    options: ProtocolOptions,
    max_response_len: u64,
}

impl SenderBuilder {
    /// `addr` is `HOST[:PORT]`, the port defaults to [`DEFAULT_PORT`].
    pub fn new<A: Into<String>>(addr: A) -> Self {
        Self {
            addr: with_default_port(addr.into()),
            timeout: None,
            tls: None,
            options: ProtocolOptions::default(),
            max_response_len: protocol::DEFAULT_MAX_RESPONSE_LEN,
        }
    }
    /// Applied to connect, read and write. A zero timeout means none.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
    pub fn with_options(mut self, options: ProtocolOptions) -> Self {
        self.options = options;
        self
    }
    pub fn with_nanoseconds(mut self, nanoseconds: bool) -> Self {
        self.options.nanoseconds = nanoseconds;
        self
    }
    pub fn with_status_parsing(mut self, parse_counts: bool) -> Self {
        self.options.parse_counts = parse_counts;
        self
    }
    pub fn with_max_response_len(mut self, max: u64) -> Self {
        self.max_response_len = max;
        self
    }
    /// Loads TLS material, if any. Nothing is dialed here.
    pub fn build(self) -> Result<Sender, Error> {
        let tls = self.tls.as_ref().map(TlsConfig::build).transpose()?;
        Ok(Sender {
            addr: self.addr,
            timeout: self.timeout,
            tls: tls.map(Arc::new),
            options: self.options,
            max_response_len: self.max_response_len,
        })
    }
}

fn with_default_port(addr: String) -> String {
    let has_port = match addr.rsplit_once(':') {
        Some((host, port)) => {
            !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    };
    if has_port {
        addr
    } else if addr.contains(':') && !addr.starts_with('[') {
        format!("[{}]:{}", addr, DEFAULT_PORT)
    } else {
        format!("{}:{}", addr, DEFAULT_PORT)
    }
}

/// Pushes batches to a collector, dialing a fresh connection for every call.
#[derive(Clone)]
pub struct Sender {
    addr: String,
    timeout: Option<Duration>,
    tls: Option<Arc<TlsConnector>>,
    options: ProtocolOptions,
    max_response_len: u64,
}

impl Sender {
    pub fn addr(&self) -> &str {
        &self.addr
    }
    pub fn options(&self) -> &ProtocolOptions {
        &self.options
    }
    fn host(&self) -> &str {
        let host = self
            .addr
            .rsplit_once(':')
            .map_or(self.addr.as_str(), |(host, _)| host);
        host.trim_start_matches('[').trim_end_matches(']')
    }

    /// Encodes a batch stamped with the current time.
    pub fn encode(&self, records: &[MetricRecord]) -> Result<WireRequest, Error> {
        protocol::encode_request(records, SystemTime::now(), &self.options)
    }

    pub fn send(&self, records: &[MetricRecord]) -> Result<ServerResponse, Error> {
        self.send_at(records, SystemTime::now())
    }

    /// Sends a batch stamped with `now`. The connection is closed on return, whatever the outcome.
    pub fn send_at(
        &self,
        records: &[MetricRecord],
        now: SystemTime,
    ) -> Result<ServerResponse, Error> {
        let request = protocol::encode_request(records, now, &self.options)?;
        let mut conn = self.dial()?;
        self.exchange(&mut conn, &request)
    }

    fn dial(&self) -> Result<Connection, Error> {
        self.connect().map_err(|error| {
            debug!(addr = %self.addr, stage = ?Stage::Connecting, %error, "exchange failed");
            error
        })
    }

    fn connect(&self) -> Result<Connection, Error> {
        let connect_error = |source| Error::Connect {
            addr: self.addr.clone(),
            source,
        };
        let mut last_error = None;
        let mut stream = None;
        for addr in self.addr.to_socket_addrs().map_err(connect_error)? {
            let res = match self.timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match res {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(error) => {
                    trace!(%addr, %error, "connect attempt failed");
                    last_error = Some(error);
                }
            }
        }
        let stream = stream.ok_or_else(|| {
            connect_error(last_error.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
            }))
        })?;
        stream.set_read_timeout(self.timeout)?;
        stream.set_write_timeout(self.timeout)?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, tls = self.tls.is_some(), "connected");
        Ok(match &self.tls {
            Some(tls) => Connection::Tls(Box::new(tls.connect(self.host(), stream)?)),
            None => Connection::Plain(stream),
        })
    }

    fn exchange(&self, conn: &mut Connection, request: &WireRequest) -> Result<ServerResponse, Error> {
        let mut stage = Stage::Sending;
        let result = self.try_exchange(conn, request, &mut stage);
        if let Err(error) = &result {
            debug!(addr = %self.addr, ?stage, %error, "exchange failed");
        }
        result
    }

    fn try_exchange(
        &self,
        conn: &mut Connection,
        request: &WireRequest,
        stage: &mut Stage,
    ) -> Result<ServerResponse, Error> {
        protocol::write_request(&mut *conn, request)?;
        trace!(len = request.len(), "request sent");
        *stage = Stage::Receiving;
        let body = protocol::read_frame(&mut *conn, self.max_response_len)?;
        trace!(len = body.len(), "response received");
        *stage = Stage::Decoding;
        let response = protocol::decode_response(&body, &self.options)?;
        debug!(
            addr = %self.addr,
            status = %response.status,
            processed = response.processed,
            failed = response.failed,
            "collector replied"
        );
        Ok(response)
    }
}

#[derive(Clone, Copy, Debug)]
enum Stage {
    Connecting,
    Sending,
    Receiving,
    Decoding,
}

enum Connection {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Connection {
    fn socket(&self) -> &TcpStream {
        match self {
            Connection::Plain(s) => s,
            Connection::Tls(s) => &s.sock,
        }
    }

    /// Whether the peer has neither closed the connection nor sent anything unsolicited.
    fn is_reusable(&self) -> bool {
        let sock = self.socket();
        if sock.set_nonblocking(true).is_err() {
            return false;
        }
        let idle = matches!(
            sock.peek(&mut [0u8; 1]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock
        );
        sock.set_nonblocking(false).is_ok() && idle
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(s) => s.read(buf),
            Connection::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(s) => s.write(buf),
            Connection::Tls(s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Plain(s) => s.flush(),
            Connection::Tls(s) => s.flush(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Connection::Tls(s) = self {
            s.conn.send_close_notify();
            let _ = s.flush();
        }
    }
}

/// A sender keeping its connection open between calls.
///
/// Calls are serialized on an internal lock. Collectors usually close the connection after
/// replying: a held connection the peer has closed is dropped and a new one dialed before
/// sending. A failed exchange drops the connection as well.
pub struct Session {
    sender: Sender,
    conn: Mutex<Option<Connection>>,
}

impl Session {
    pub fn new(sender: Sender) -> Self {
        Self {
            sender,
            conn: Mutex::new(None),
        }
    }
    /// Opens a connection, replacing a held one.
    pub fn dial(&self) -> Result<(), Error> {
        let mut conn = self.conn.lock();
        *conn = Some(self.sender.dial()?);
        Ok(())
    }
    pub fn is_connected(&self) -> bool {
        self.conn.lock().is_some()
    }
    pub fn send(&self, records: &[MetricRecord]) -> Result<ServerResponse, Error> {
        self.send_at(records, SystemTime::now())
    }
    pub fn send_at(
        &self,
        records: &[MetricRecord],
        now: SystemTime,
    ) -> Result<ServerResponse, Error> {
        let request = protocol::encode_request(records, now, &self.sender.options)?;
        let mut held = self.conn.lock();
        let mut conn = match held.take() {
            Some(conn) if conn.is_reusable() => conn,
            Some(_) => {
                debug!(addr = %self.sender.addr, "held connection closed by peer, redialing");
                self.sender.dial()?
            }
            None => self.sender.dial()?,
        };
        let response = self.sender.exchange(&mut conn, &request)?;
        *held = Some(conn);
        Ok(response)
    }
    pub fn close(&self) {
        self.conn.lock().take();
    }
}
