//! Duplex byte-stream endpoints with half-shut semantics.
//!
//! An [`EndPoint`] owns a non-blocking byte channel and exposes `fill` /
//! `flush` primitives that never block, so they may be driven from a
//! selector thread. The half-shut flags let protocol layers distinguish
//! "peer sent EOF" from "we can no longer write".

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::metrics;

/// Outcome of a single non-blocking read into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Bytes were appended to the tail of the buffer.
    Bytes(usize),
    /// The channel has no data at this time.
    WouldBlock,
    /// The stream has ended. The endpoint's input side is now shut.
    Eof,
}

/// A duplex byte-stream abstraction with half-shut semantics and
/// addressability.
///
/// `fill` and `flush` never block. The caller is responsible for pairing
/// them with readiness tracking (see [`SelectableEndPoint`]).
pub trait EndPoint: Send + Sync {
    /// Read bytes into the tail of `buffer`.
    ///
    /// I/O errors are swallowed into [`Fill::Eof`]: the caller treats the
    /// stream as ended and the input side is shut.
    fn fill(&self, buffer: &mut BytesMut) -> Fill;

    /// Write as many bytes as possible in one call.
    ///
    /// A single buffer is written with one write; more than one buffer is
    /// written with a single gather write where the transport supports it,
    /// else buffers are written in order, stopping at the first partial
    /// write. Consumed bytes are advanced out of the buffers. Returns the
    /// total bytes written.
    fn flush(&self, buffers: &mut [&mut dyn Buf]) -> Result<usize>;

    /// Shut the input side. Idempotent; closes the channel if the output
    /// side is already shut.
    fn shutdown_input(&self);

    /// Shut the output side. Idempotent; closes the channel if the input
    /// side is already shut.
    fn shutdown_output(&self);

    /// Close the underlying channel. Idempotent.
    fn close(&self);

    /// Whether the channel is open. Tracks the channel's state, not the
    /// half-shut flags.
    fn is_open(&self) -> bool;

    fn is_input_shutdown(&self) -> bool;
    fn is_output_shutdown(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Idle timeout for this endpoint. `None` means unset.
    fn max_idle_time(&self) -> Option<Duration>;

    /// Store a new idle timeout. The value is not pushed to the underlying
    /// socket; it only affects the selector's idle sweep from here on.
    fn set_max_idle_time(&self, max: Option<Duration>);
}

/// An endpoint that reports readiness events via a selector and exposes
/// interest bits.
pub trait SelectableEndPoint: EndPoint {
    /// Declare or withdraw interest in read readiness.
    fn set_read_interested(&self, interested: bool);

    /// Declare or withdraw interest in write readiness.
    fn set_write_interested(&self, interested: bool);

    fn is_read_interested(&self) -> bool;
    fn is_write_interested(&self) -> bool;

    /// Toggle the idle sweep for this endpoint. Disabled while a dispatch
    /// is in flight so a long handler is not killed for inactivity.
    fn set_check_for_idle(&self, check: bool);
    fn is_checked_for_idle(&self) -> bool;

    /// Time since the last fill or flush made progress.
    fn idle_for(&self) -> Duration;

    /// Replace the connection bound to this endpoint (protocol switch).
    /// Subsequent readiness events are delivered to the new connection.
    fn set_connection(&self, connection: Arc<dyn Connection>);
}

/// Milliseconds on a process-wide monotonic clock.
pub(crate) fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Concrete endpoint over a non-blocking TCP stream.
///
/// Holds the stream plus the half-shut flags and cached addresses. `close`
/// shuts both directions and marks the endpoint closed; the descriptor is
/// released when the last reference drops.
pub struct ChannelEndPoint {
    stream: TcpStream,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    ishut: AtomicBool,
    oshut: AtomicBool,
    open: AtomicBool,
    /// Idle timeout in ms; 0 = unset.
    max_idle_ms: AtomicU64,
    /// Timestamp (monotonic ms) of the last successful fill or flush.
    last_activity_ms: AtomicU64,
}

impl ChannelEndPoint {
    /// Wrap a stream. The stream must already be in non-blocking mode.
    pub fn new(stream: TcpStream, max_idle_time: Option<Duration>) -> Self {
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        ChannelEndPoint {
            stream,
            local,
            remote,
            ishut: AtomicBool::new(false),
            oshut: AtomicBool::new(false),
            open: AtomicBool::new(true),
            max_idle_ms: AtomicU64::new(
                max_idle_time.map(|d| d.as_millis() as u64).unwrap_or(0),
            ),
            last_activity_ms: AtomicU64::new(monotonic_ms()),
        }
    }

    pub(crate) fn record_activity(&self) {
        self.last_activity_ms.store(monotonic_ms(), Ordering::Relaxed);
    }

    pub(crate) fn millis_idle(&self) -> u64 {
        monotonic_ms().saturating_sub(self.last_activity_ms.load(Ordering::Relaxed))
    }
}

impl EndPoint for ChannelEndPoint {
    fn fill(&self, buffer: &mut BytesMut) -> Fill {
        if self.ishut.load(Ordering::Acquire) {
            return Fill::Eof;
        }

        let start = buffer.len();
        let space = buffer.capacity() - start;
        if space == 0 {
            return Fill::WouldBlock;
        }
        buffer.resize(start + space, 0);

        match (&self.stream).read(&mut buffer[start..]) {
            Ok(0) => {
                buffer.truncate(start);
                self.shutdown_input();
                Fill::Eof
            }
            Ok(n) => {
                buffer.truncate(start + n);
                self.record_activity();
                metrics::BYTES_FILLED.add(n as u64);
                Fill::Bytes(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                buffer.truncate(start);
                Fill::WouldBlock
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                buffer.truncate(start);
                Fill::WouldBlock
            }
            Err(e) => {
                debug!(error = %e, remote = ?self.remote, "fill failed, treating as EOF");
                buffer.truncate(start);
                self.shutdown_input();
                Fill::Eof
            }
        }
    }

    fn flush(&self, buffers: &mut [&mut dyn Buf]) -> Result<usize> {
        if self.oshut.load(Ordering::Acquire) {
            return Err(Error::OutputShutdown);
        }
        if !self.is_open() {
            return Err(Error::Closed);
        }

        let written = if buffers.len() == 1 {
            write_once(&self.stream, buffers[0].chunk())?
        } else {
            let slices: Vec<io::IoSlice<'_>> =
                buffers.iter().map(|b| io::IoSlice::new(b.chunk())).collect();
            write_vectored_once(&self.stream, &slices)?
        };

        // Consume the written bytes in buffer order.
        let mut remaining = written;
        for buf in buffers.iter_mut() {
            if remaining == 0 {
                break;
            }
            let n = remaining.min(buf.remaining());
            buf.advance(n);
            remaining -= n;
        }

        if written > 0 {
            self.record_activity();
            metrics::BYTES_FLUSHED.add(written as u64);
        }
        Ok(written)
    }

    fn shutdown_input(&self) {
        if self.ishut.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(remote = ?self.remote, "ishut");
        if self.open.load(Ordering::Acquire) {
            if let Err(e) = self.stream.shutdown(Shutdown::Read) {
                debug!(error = %e, "shutdown_input");
            }
            if self.oshut.load(Ordering::Acquire) {
                self.close();
            }
        }
    }

    fn shutdown_output(&self) {
        if self.oshut.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(remote = ?self.remote, "oshut");
        if self.open.load(Ordering::Acquire) {
            if let Err(e) = self.stream.shutdown(Shutdown::Write) {
                debug!(error = %e, "shutdown_output");
            }
            if self.ishut.load(Ordering::Acquire) {
                self.close();
            }
        }
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(remote = ?self.remote, "close");
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn is_input_shutdown(&self) -> bool {
        self.ishut.load(Ordering::Acquire) || !self.is_open()
    }

    fn is_output_shutdown(&self) -> bool {
        self.oshut.load(Ordering::Acquire) || !self.is_open()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn max_idle_time(&self) -> Option<Duration> {
        match self.max_idle_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn set_max_idle_time(&self, max: Option<Duration>) {
        self.max_idle_ms.store(
            max.map(|d| d.as_millis() as u64).unwrap_or(0),
            Ordering::Relaxed,
        );
    }
}

fn write_once(mut stream: &TcpStream, chunk: &[u8]) -> Result<usize> {
    match stream.write(chunk) {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
        Err(e) => Err(Error::Io(e)),
    }
}

fn write_vectored_once(mut stream: &TcpStream, slices: &[io::IoSlice<'_>]) -> Result<usize> {
    match stream.write_vectored(slices) {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    #[test]
    fn fill_reads_into_tail() {
        let (mut client, server) = pair();
        let endp = ChannelEndPoint::new(server, None);

        client.write_all(b"hello").unwrap();
        // Give the kernel a moment to deliver on loopback.
        std::thread::sleep(Duration::from_millis(50));

        let mut buf = BytesMut::with_capacity(64);
        buf.extend_from_slice(b"x");
        match endp.fill(&mut buf) {
            Fill::Bytes(5) => {}
            other => panic!("unexpected fill result: {other:?}"),
        }
        assert_eq!(&buf[..], b"xhello");
    }

    #[test]
    fn fill_would_block_when_no_data() {
        let (_client, server) = pair();
        let endp = ChannelEndPoint::new(server, None);
        let mut buf = BytesMut::with_capacity(64);
        assert_eq!(endp.fill(&mut buf), Fill::WouldBlock);
        assert!(buf.is_empty());
    }

    #[test]
    fn fill_after_shutdown_input_is_eof_without_reading() {
        let (mut client, server) = pair();
        let endp = ChannelEndPoint::new(server, None);
        client.write_all(b"pending").unwrap();
        endp.shutdown_input();
        let mut buf = BytesMut::with_capacity(64);
        assert_eq!(endp.fill(&mut buf), Fill::Eof);
        assert!(buf.is_empty());
    }

    #[test]
    fn flush_gathers_in_order() {
        let (mut client, server) = pair();
        let endp = ChannelEndPoint::new(server, None);

        let mut a = BytesMut::from(&b"head"[..]);
        let mut b = BytesMut::from(&b"body"[..]);
        let written = endp
            .flush(&mut [&mut a as &mut dyn Buf, &mut b as &mut dyn Buf])
            .unwrap();
        assert_eq!(written, 8);
        assert!(a.is_empty());
        assert!(b.is_empty());

        let mut out = [0u8; 8];
        client.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"headbody");
    }

    #[test]
    fn flush_after_shutdown_output_fails() {
        let (_client, server) = pair();
        let endp = ChannelEndPoint::new(server, None);
        endp.shutdown_output();
        let mut a = BytesMut::from(&b"x"[..]);
        let err = endp.flush(&mut [&mut a as &mut dyn Buf]).unwrap_err();
        assert!(matches!(err, Error::OutputShutdown));
    }

    #[test]
    fn half_shut_is_idempotent_and_both_sides_close() {
        let (_client, server) = pair();
        let endp = ChannelEndPoint::new(server, None);

        endp.shutdown_input();
        let after_once = (
            endp.is_input_shutdown(),
            endp.is_output_shutdown(),
            endp.is_open(),
        );
        endp.shutdown_input();
        let after_twice = (
            endp.is_input_shutdown(),
            endp.is_output_shutdown(),
            endp.is_open(),
        );
        assert_eq!(after_once, after_twice);
        assert!(endp.is_open());

        endp.shutdown_output();
        assert!(!endp.is_open());
        assert!(endp.is_input_shutdown());
        assert!(endp.is_output_shutdown());
    }

    #[test]
    fn peer_eof_shuts_input() {
        let (client, server) = pair();
        let endp = ChannelEndPoint::new(server, None);
        drop(client);
        std::thread::sleep(Duration::from_millis(50));

        let mut buf = BytesMut::with_capacity(64);
        assert_eq!(endp.fill(&mut buf), Fill::Eof);
        assert!(endp.is_input_shutdown());
        assert!(!endp.is_output_shutdown());
    }

    #[test]
    fn max_idle_time_is_stored_not_pushed() {
        let (_client, server) = pair();
        let endp = ChannelEndPoint::new(server, Some(Duration::from_secs(30)));
        assert_eq!(endp.max_idle_time(), Some(Duration::from_secs(30)));
        endp.set_max_idle_time(Some(Duration::from_secs(5)));
        assert_eq!(endp.max_idle_time(), Some(Duration::from_secs(5)));
        endp.set_max_idle_time(None);
        assert_eq!(endp.max_idle_time(), None);
    }
}
