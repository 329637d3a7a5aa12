//! End-to-end engine scenarios driven through a scripted in-memory
//! endpoint: keep-alive, chunked framing, backpressure, protocol errors,
//! peer half-close, and protocol upgrade.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};

use selwire::connection::{Connection, SelectableConnection};
use selwire::endpoint::{EndPoint, Fill, SelectableEndPoint};
use selwire::mem::MemEndPoint;

use selwire_http::{
    Connector, ConnectorConfig, Exchange, Handler, HttpConnection, Result,
};

struct Engine {
    endp: Arc<MemEndPoint>,
    conn: Arc<HttpConnection>,
    connector: Arc<Connector>,
}

fn engine_with<H: Handler>(config: ConnectorConfig, handler: H) -> Engine {
    let endp = Arc::new(MemEndPoint::new());
    let connector = Arc::new(Connector::new(config));
    let selectable: Arc<dyn SelectableEndPoint> = endp.clone();
    let conn = HttpConnection::new(connector.clone(), selectable, Arc::new(handler));
    Engine {
        endp,
        conn,
        connector,
    }
}

fn engine<H: Handler>(handler: H) -> Engine {
    engine_with(ConnectorConfig::default(), handler)
}

fn outstanding(connector: &Connector) -> usize {
    connector.request_buffers().outstanding() + connector.response_buffers().outstanding()
}

#[test]
fn s1_keep_alive_get_pair() {
    let targets = Arc::new(Mutex::new(Vec::new()));
    let seen = targets.clone();
    let engine = engine(move |ex: &mut Exchange<'_>| -> Result<()> {
        seen.lock().unwrap().push(ex.request().target().to_string());
        Ok(())
    });

    engine
        .endp
        .push_input(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n");
    engine.conn.process_input();

    let output = engine.endp.take_output();
    let text = std::str::from_utf8(&output).unwrap();
    let expected = "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
    assert_eq!(text, format!("{expected}{expected}"));

    assert_eq!(*targets.lock().unwrap(), vec!["/a", "/b"]);
    assert!(engine.endp.is_open());
    assert!(engine.conn.is_idle());
    assert_eq!(outstanding(&engine.connector), 0);
}

#[test]
fn s2_chunked_response() {
    let engine = engine(move |ex: &mut Exchange<'_>| -> Result<()> {
        for piece in [&b"abc"[..], &b"def"[..], &b"ghi"[..]] {
            ex.write(Bytes::copy_from_slice(piece), false)?;
            ex.flush_response()?;
        }
        Ok(())
    });

    engine
        .endp
        .push_input(b"GET /stream HTTP/1.1\r\nHost: h\r\n\r\n");
    engine.conn.process_input();

    let output = engine.endp.take_output();
    let text = std::str::from_utf8(&output).unwrap();
    assert_eq!(
        text,
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
         3\r\nabc\r\n3\r\ndef\r\n3\r\nghi\r\n0\r\n\r\n"
    );
    assert!(engine.endp.is_open());
    assert_eq!(outstanding(&engine.connector), 0);
}

#[test]
fn s3_backpressure_blocks_volatile_write() {
    // Small body buffers force the large volatile write onto the
    // pass-through path.
    let config = ConnectorConfig {
        response_buffer_size: 16,
        ..ConnectorConfig::default()
    };

    let body = b"0123456789abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let drained_inside_write = Arc::new(AtomicBool::new(false));

    let endp_probe: Arc<Mutex<Option<Arc<MemEndPoint>>>> = Arc::new(Mutex::new(None));
    let probe = endp_probe.clone();
    let flag = drained_inside_write.clone();
    let engine = engine_with(config, move |ex: &mut Exchange<'_>| -> Result<()> {
        let written = ex.write(Bytes::from_static(body), true)?;
        assert_eq!(written, body.len());
        // The volatile buffer must be fully on the wire before write
        // returns, backpressure or not.
        let endp = probe.lock().unwrap().clone().unwrap();
        let mut wire = Vec::new();
        wire.extend_from_slice(&endp.take_output());
        let text = String::from_utf8(wire).unwrap();
        assert!(text.ends_with("ABCDEFGHIJKLMNOPQRSTUVWXYZ"));
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    *endp_probe.lock().unwrap() = Some(engine.endp.clone());

    // First flush (commit) succeeds, the second hits a full socket buffer.
    engine.endp.push_write_budget(usize::MAX);
    engine.endp.push_write_budget(0);

    // A stand-in selector: signal writability until the engine is done.
    let done = Arc::new(AtomicBool::new(false));
    let selector = {
        let conn = engine.conn.clone();
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(20));
                let _ = conn.on_writeable();
            }
        })
    };

    engine
        .endp
        .push_input(b"GET /big HTTP/1.1\r\nHost: h\r\n\r\n");
    engine.conn.process_input();
    done.store(true, Ordering::SeqCst);
    selector.join().unwrap();

    assert!(drained_inside_write.load(Ordering::SeqCst));
    // At least one flush call was refused outright by the full socket.
    assert!(engine.endp.flush_calls() >= 3);
    assert_eq!(outstanding(&engine.connector), 0);
}

#[test]
fn s4_protocol_error_gets_error_response_and_close() {
    let hits = Arc::new(AtomicUsize::new(0));
    let count = hits.clone();
    let engine = engine(move |_ex: &mut Exchange<'_>| -> Result<()> {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    engine.endp.push_input(b"NOTAMETHOD /\r\n\r\n");
    engine.conn.process_input();

    let output = engine.endp.take_output();
    let text = std::str::from_utf8(&output).unwrap();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(text.contains("Connection: close\r\n"));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    // Non-persistent framing shuts output once the response is flushed.
    assert!(engine.endp.is_output_shutdown());
    assert_eq!(outstanding(&engine.connector), 0);
}

#[test]
fn s5_peer_half_close_mid_request() {
    let engine = engine(move |_ex: &mut Exchange<'_>| -> Result<()> { Ok(()) });

    engine.endp.push_input(b"GET /a HTTP/1.1\r\n");
    engine.conn.process_input();

    // Partial request: nothing written, connection open, parser mid-message.
    assert!(engine.endp.is_open());
    assert!(engine.endp.take_output().is_empty());
    assert!(!engine.conn.is_idle());

    // Peer half-closes. The incomplete message surfaces as an error
    // response rather than a silent drop.
    engine.endp.end_input();
    engine.conn.process_input();

    assert!(engine.endp.is_input_shutdown());
    let output = engine.endp.take_output();
    let text = std::str::from_utf8(&output).unwrap();
    assert!(text.starts_with("HTTP/1.1 400 "));
    assert!(text.contains("Connection: close\r\n"));
    assert_eq!(outstanding(&engine.connector), 0);
}

#[test]
fn clean_eof_between_requests_closes() {
    let engine = engine(move |_ex: &mut Exchange<'_>| -> Result<()> { Ok(()) });

    engine.endp.push_input(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n");
    engine.endp.end_input();
    engine.conn.process_input();

    let output = engine.endp.take_output();
    assert!(output.starts_with(b"HTTP/1.1 200 OK\r\n"));
    // Nothing in flight when EOF was seen: the engine closes the endpoint.
    assert!(!engine.endp.is_open());
    assert_eq!(outstanding(&engine.connector), 0);
}

/// Byte-echoing replacement connection installed by the 101 hand-off.
struct EchoConnection {
    core: SelectableConnection,
    reads: AtomicUsize,
}

impl EchoConnection {
    fn new(endp: Arc<dyn SelectableEndPoint>) -> Arc<Self> {
        Arc::new(EchoConnection {
            core: SelectableConnection::new(endp),
            reads: AtomicUsize::new(0),
        })
    }
}

impl Connection for EchoConnection {
    fn selectable(&self) -> &SelectableConnection {
        &self.core
    }

    fn do_read(self: Arc<Self>) -> selwire::error::Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let endp = self.core.end_point().clone();
        let mut buf = BytesMut::with_capacity(256);
        loop {
            match endp.fill(&mut buf) {
                Fill::Bytes(_) => continue,
                Fill::WouldBlock | Fill::Eof => break,
            }
        }
        if !buf.is_empty() {
            endp.flush(&mut [&mut buf as &mut dyn Buf])?;
        }
        Ok(())
    }
}

#[test]
fn s6_protocol_upgrade_rebinds_connection() {
    let engine = engine(move |ex: &mut Exchange<'_>| -> Result<()> {
        let echo = EchoConnection::new(ex.end_point());
        ex.switch_protocol(echo);
        Ok(())
    });

    engine
        .endp
        .push_input(b"GET /chat HTTP/1.1\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n");
    engine.conn.process_input();

    let output = engine.endp.take_output();
    let text = std::str::from_utf8(&output).unwrap();
    assert_eq!(text, "HTTP/1.1 101 Switching Protocols\r\n\r\n");

    // The endpoint is rebound to the replacement.
    let switched = engine.endp.connection().expect("connection rebound");

    // Subsequent readable events dispatch to the new connection, not the
    // HTTP parser.
    engine.endp.push_input(b"ping");
    match switched.on_readable() {
        Some(selwire::IoTask::Read) => switched.clone().do_read().unwrap(),
        other => panic!("unexpected readiness outcome: {other:?}"),
    }
    assert_eq!(&engine.endp.take_output()[..], b"ping");
    assert!(engine.conn.is_idle());
}

#[test]
fn head_response_suppresses_body() {
    let engine = engine(move |ex: &mut Exchange<'_>| -> Result<()> {
        ex.add_header("Content-Type", "text/plain");
        ex.write(Bytes::from_static(b"invisible"), false)?;
        Ok(())
    });

    engine.endp.push_input(b"HEAD /x HTTP/1.1\r\nHost: h\r\n\r\n");
    engine.conn.process_input();

    let output = engine.endp.take_output();
    let text = std::str::from_utf8(&output).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Length: 9\r\n"));
    assert!(text.ends_with("\r\n\r\n"));
    assert!(!text.contains("invisible"));
}

#[test]
fn request_body_reaches_handler() {
    let engine = engine(move |ex: &mut Exchange<'_>| -> Result<()> {
        let body = Bytes::copy_from_slice(ex.request().content());
        ex.write(body, false)?;
        Ok(())
    });

    engine
        .endp
        .push_input(b"POST /u HTTP/1.1\r\nHost: h\r\nContent-Length: 11\r\n\r\nhello world");
    engine.conn.process_input();

    let output = engine.endp.take_output();
    let text = std::str::from_utf8(&output).unwrap();
    assert!(text.contains("Content-Length: 11\r\n"));
    assert!(text.ends_with("\r\n\r\nhello world"));
    assert_eq!(outstanding(&engine.connector), 0);
}

#[test]
fn handler_error_becomes_error_response() {
    let engine = engine(move |_ex: &mut Exchange<'_>| -> Result<()> {
        Err(selwire_http::HttpError::new(403, "Forbidden").into())
    });

    engine.endp.push_input(b"GET /secret HTTP/1.1\r\nHost: h\r\n\r\n");
    engine.conn.process_input();

    let output = engine.endp.take_output();
    let text = std::str::from_utf8(&output).unwrap();
    assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert!(text.contains("Connection: close\r\n"));
}

#[test]
fn idle_policy_layers_endpoint_connector_and_low_resources() {
    let engine = engine(move |_ex: &mut Exchange<'_>| -> Result<()> { Ok(()) });
    let default_idle = engine.connector.max_idle_time();

    // Unset endpoint idle falls back to the connector default.
    assert_eq!(engine.conn.max_idle_time(), Some(default_idle));

    // An explicit endpoint value wins.
    engine
        .endp
        .set_max_idle_time(Some(Duration::from_secs(7)));
    assert_eq!(engine.conn.max_idle_time(), Some(Duration::from_secs(7)));

    // Low-resource mode only overrides endpoints left at the default.
    engine.connector.set_low_resources(true);
    assert_eq!(engine.conn.max_idle_time(), Some(Duration::from_secs(7)));
    engine.endp.set_max_idle_time(Some(default_idle));
    assert_eq!(
        engine.conn.max_idle_time(),
        Some(engine.connector.low_resource_max_idle_time())
    );
}

#[test]
fn current_connection_is_visible_during_dispatch() {
    let observed = Arc::new(AtomicBool::new(false));
    let seen = observed.clone();
    let engine = engine(move |_ex: &mut Exchange<'_>| -> Result<()> {
        seen.store(HttpConnection::current().is_some(), Ordering::SeqCst);
        Ok(())
    });

    assert!(HttpConnection::current().is_none());
    engine.endp.push_input(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    engine.conn.process_input();
    assert!(observed.load(Ordering::SeqCst));
    assert!(HttpConnection::current().is_none());
}
