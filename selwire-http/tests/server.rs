//! Integration tests: a real server over loopback TCP, driven with plain
//! std sockets through the selector, executor, and acceptor threads.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use bytes::Bytes;
use serial_test::serial;

use selwire_http::{Exchange, Result, Server, ServerBuilder};

fn hello_server() -> Server {
    ServerBuilder::new()
        .bind("127.0.0.1:0".parse().unwrap())
        .workers(2)
        .launch(|ex: &mut Exchange<'_>| -> Result<()> {
            ex.write(Bytes::from_static(b"hello"), false)?;
            Ok(())
        })
        .expect("launch failed")
}

fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    stream.read_exact(&mut out).expect("short read");
    out
}

const HELLO_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

#[test]
#[serial]
fn serves_keep_alive_requests() {
    let server = hello_server();
    let addr = server.local_addr();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    stream
        .write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    assert_eq!(read_exactly(&mut stream, HELLO_RESPONSE.len()), HELLO_RESPONSE);

    // Same socket, second round trip.
    stream
        .write_all(b"GET /b HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    assert_eq!(read_exactly(&mut stream, HELLO_RESPONSE.len()), HELLO_RESPONSE);

    server.shutdown();
}

#[test]
#[serial]
fn pipelined_requests_are_answered_in_order() {
    let server = hello_server();
    let addr = server.local_addr();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    stream
        .write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();

    let both = read_exactly(&mut stream, HELLO_RESPONSE.len() * 2);
    assert_eq!(&both[..HELLO_RESPONSE.len()], HELLO_RESPONSE);
    assert_eq!(&both[HELLO_RESPONSE.len()..], HELLO_RESPONSE);

    server.shutdown();
}

#[test]
#[serial]
fn connection_close_is_honored() {
    let server = hello_server();
    let addr = server.local_addr();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Connection: close\r\n"));
    assert!(text.ends_with("hello"));

    server.shutdown();
}

#[test]
#[serial]
fn malformed_request_gets_error_response() {
    let server = hello_server();
    let addr = server.local_addr();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    stream.write_all(b"NOTAMETHOD /\r\n\r\n").unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(text.contains("Connection: close\r\n"));

    server.shutdown();
}

#[test]
#[serial]
fn post_body_round_trip() {
    let server = ServerBuilder::new()
        .bind("127.0.0.1:0".parse().unwrap())
        .workers(2)
        .launch(|ex: &mut Exchange<'_>| -> Result<()> {
            let body = Bytes::copy_from_slice(ex.request().content());
            ex.write(body, false)?;
            Ok(())
        })
        .expect("launch failed");
    let addr = server.local_addr();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    stream
        .write_all(b"POST /u HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\nConnection: close\r\n\r\nping")
        .unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("\r\n\r\nping"));

    server.shutdown();
}

#[test]
#[serial]
fn idle_connection_is_expired() {
    let server = ServerBuilder::new()
        .bind("127.0.0.1:0".parse().unwrap())
        .workers(1)
        .max_idle_time(Duration::from_millis(300))
        .launch(|_ex: &mut Exchange<'_>| -> Result<()> { Ok(()) })
        .expect("launch failed");
    let addr = server.local_addr();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // Send nothing: the idle sweep half-closes output, observed as EOF.
    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0);

    server.shutdown();
}
