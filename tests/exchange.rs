use std::{
    io::Write,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::mpsc,
    thread,
    time::Duration,
};

use zabbix_sender::{
    make_records,
    protocol::{self, RequestBody, DEFAULT_MAX_RESPONSE_LEN},
    Error, MetricRecord, Sender, SenderBuilder, Session, Value,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts a single connection and hands it to `handler`.
fn stub<F>(handler: F) -> SocketAddr
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        handler(stream);
    });
    addr
}

/// Answers one request with `reply` and reports what it received.
fn collector(reply: &'static str) -> (SocketAddr, mpsc::Receiver<RequestBody>) {
    let (tx, rx) = mpsc::channel();
    let addr = stub(move |mut stream| {
        let body = protocol::read_frame(&mut stream, DEFAULT_MAX_RESPONSE_LEN).unwrap();
        tx.send(protocol::decode_request(&body).unwrap()).unwrap();
        protocol::write_frame(&mut stream, reply.as_bytes()).unwrap();
    });
    (addr, rx)
}

fn sender(addr: SocketAddr) -> Sender {
    SenderBuilder::new(addr.to_string())
        .with_timeout(TIMEOUT)
        .build()
        .unwrap()
}

#[test]
fn end_to_end() {
    let (addr, rx) = collector(
        r#"{"response":"success","info":"Processed 2; Failed 0; Total 2; Seconds spent 0.000012"}"#,
    );
    let records = make_records(
        "localhost",
        [("rpm", Value::from(42.12)), ("errors", Value::from(1))],
        None,
    );
    let response = sender(addr).send(&records).unwrap();
    assert_eq!(response.status, "success");
    assert!(response.is_success());
    assert_eq!(response.processed, 2);
    assert_eq!(response.failed, 0);

    let request = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(request.request, "sender data");
    assert!(request.clock.is_some());
    assert!(request.ns.is_some());
    assert_eq!(request.data.len(), 2);
    assert_eq!(request.data[0].key, "rpm");
    assert_eq!(request.data[0].value, "42.120000");
    assert_eq!(request.data[1].key, "errors");
    assert_eq!(request.data[1].value, "1");
    assert!(request.data.iter().all(|r| r.clock.is_none() && r.ns.is_none()));
}

#[test]
fn record_timestamps_reach_the_collector() {
    let (addr, rx) = collector(r#"{"response":"success","info":"processed: 1; failed: 0"}"#);
    let sender = SenderBuilder::new(addr.to_string())
        .with_nanoseconds(false)
        .build()
        .unwrap();
    let records = [MetricRecord::new("h", "k", -1.5).with_clock(1_700_000_000).with_ns(7)];
    let response = sender.send(&records).unwrap();
    assert_eq!((response.processed, response.failed), (1, 0));

    let request = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(request.ns, None);
    assert_eq!(request.data[0].clock, Some(1_700_000_000));
    assert_eq!(request.data[0].ns, Some(7));
    assert_eq!(request.data[0].value, "-1.500000");
}

#[test]
fn failure_status_is_not_an_error() {
    let (addr, _rx) = collector(r#"{"response":"failed","info":"Processed 0; Failed 1; Total 1"}"#);
    let response = sender(addr).send(&[MetricRecord::new("h", "k", 1)]).unwrap();
    assert!(!response.is_success());
    assert_eq!((response.processed, response.failed), (0, 1));
}

#[test]
fn bad_header() {
    let addr = stub(|mut stream| {
        protocol::read_frame(&mut stream, DEFAULT_MAX_RESPONSE_LEN).unwrap();
        stream
            .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
            .unwrap();
    });
    let err = sender(addr).send(&[MetricRecord::new("h", "k", 1)]).unwrap_err();
    assert!(err.is_protocol(), "{err}");
    assert!(matches!(err, Error::BadHeader(h) if &h == b"HTTP/"));
}

#[test]
fn malformed_response() {
    let (addr, _rx) = collector(r#"{"response":"#);
    let err = sender(addr).send(&[]).unwrap_err();
    assert!(matches!(err, Error::Decode(_)), "{err}");
}

#[test]
fn truncated_response() {
    let addr = stub(|mut stream| {
        protocol::read_frame(&mut stream, DEFAULT_MAX_RESPONSE_LEN).unwrap();
        stream.write_all(&protocol::HEADER).unwrap();
        stream.write_all(&100u64.to_le_bytes()).unwrap();
        stream.write_all(br#"{"respon"#).unwrap();
    });
    let err = sender(addr).send(&[]).unwrap_err();
    assert!(
        matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof),
        "{err}"
    );
}

#[test]
fn oversized_response() {
    let addr = stub(|mut stream| {
        protocol::read_frame(&mut stream, DEFAULT_MAX_RESPONSE_LEN).unwrap();
        stream.write_all(&protocol::HEADER).unwrap();
        stream.write_all(&u64::MAX.to_le_bytes()).unwrap();
    });
    let sender = SenderBuilder::new(addr.to_string())
        .with_max_response_len(1024)
        .build()
        .unwrap();
    let err = sender.send(&[]).unwrap_err();
    assert!(matches!(
        err,
        Error::ResponseTooLarge {
            len: u64::MAX,
            max: 1024
        }
    ));
}

#[test]
fn connection_refused() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let err = sender(addr).send(&[]).unwrap_err();
    assert!(err.is_connect(), "{err}");
}

#[test]
fn unresolvable_address() {
    let sender = SenderBuilder::new("host.invalid:10051").build().unwrap();
    let err = sender.send(&[]).unwrap_err();
    assert!(err.is_connect(), "{err}");
}

#[test]
fn session_reuses_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for _ in 0..2 {
            let (mut stream, _) = listener.accept().unwrap();
            let mut served = 0;
            while protocol::read_frame(&mut stream, DEFAULT_MAX_RESPONSE_LEN).is_ok() {
                served += 1;
                let reply = format!(
                    r#"{{"response":"success","info":"Processed {served}; Failed 0; Total {served}"}}"#
                );
                if protocol::write_frame(&mut stream, reply.as_bytes()).is_err() {
                    break;
                }
            }
            tx.send(served).unwrap();
        }
    });

    let session = Session::new(sender(addr));
    assert!(!session.is_connected());
    let records = [MetricRecord::new("h", "k", 1)];
    assert_eq!(session.send(&records).unwrap().processed, 1);
    assert!(session.is_connected());
    assert_eq!(session.send(&records).unwrap().processed, 2);
    session.close();
    assert!(!session.is_connected());
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 2);

    session.dial().unwrap();
    assert_eq!(session.send(&records).unwrap().processed, 1);
    session.close();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 1);
}

#[test]
fn session_redials_after_peer_close() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for _ in 0..2 {
            let (mut stream, _) = listener.accept().unwrap();
            protocol::read_frame(&mut stream, DEFAULT_MAX_RESPONSE_LEN).unwrap();
            protocol::write_frame(
                &mut stream,
                br#"{"response":"success","info":"Processed 1; Failed 0; Total 1"}"#,
            )
            .unwrap();
            drop(stream);
            tx.send(()).unwrap();
        }
    });

    let session = Session::new(sender(addr));
    let records = [MetricRecord::new("h", "k", 1)];
    assert_eq!(session.send(&records).unwrap().processed, 1);
    assert!(session.is_connected());
    rx.recv_timeout(TIMEOUT).unwrap();
    // let the FIN reach the client side
    thread::sleep(Duration::from_millis(50));
    assert_eq!(session.send(&records).unwrap().processed, 1);
    rx.recv_timeout(TIMEOUT).unwrap();
}

#[test]
fn session_drops_dead_connection() {
    let addr = stub(|mut stream| {
        protocol::read_frame(&mut stream, DEFAULT_MAX_RESPONSE_LEN).unwrap();
    });
    let session = Session::new(sender(addr));
    assert!(session.send(&[]).is_err());
    assert!(!session.is_connected());
}
