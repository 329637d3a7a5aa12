//! In-memory endpoint for driving connection engines without a socket.
//!
//! `MemEndPoint` replays a scripted input stream and captures flushed
//! output. Per-call write budgets simulate backpressure, and interest bits
//! are recorded so tests can assert on readiness signalling.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};

use crate::connection::Connection;
use crate::endpoint::{EndPoint, Fill, SelectableEndPoint};
use crate::error::{Error, Result};

#[derive(Default)]
struct MemInner {
    input: BytesMut,
    input_ended: bool,
    output: BytesMut,
    /// One entry per upcoming flush call: max bytes that call may write.
    /// Exhausted budgets mean unlimited. A zero simulates a full socket
    /// buffer.
    write_budgets: VecDeque<usize>,
    flush_calls: usize,
}

/// A scripted in-memory [`SelectableEndPoint`].
pub struct MemEndPoint {
    inner: Mutex<MemInner>,
    ishut: AtomicBool,
    oshut: AtomicBool,
    open: AtomicBool,
    read_interested: AtomicBool,
    write_interested: AtomicBool,
    check_idle: AtomicBool,
    max_idle_ms: AtomicU64,
    last_activity: Mutex<Instant>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
}

impl Default for MemEndPoint {
    fn default() -> Self {
        Self::new()
    }
}

impl MemEndPoint {
    pub fn new() -> Self {
        MemEndPoint {
            inner: Mutex::new(MemInner::default()),
            ishut: AtomicBool::new(false),
            oshut: AtomicBool::new(false),
            open: AtomicBool::new(true),
            read_interested: AtomicBool::new(false),
            write_interested: AtomicBool::new(false),
            check_idle: AtomicBool::new(false),
            max_idle_ms: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            connection: Mutex::new(None),
        }
    }

    /// Append bytes to the scripted input stream.
    pub fn push_input(&self, data: &[u8]) {
        self.inner.lock().unwrap().input.extend_from_slice(data);
    }

    /// Mark the input stream ended: once drained, `fill` returns EOF.
    pub fn end_input(&self) {
        self.inner.lock().unwrap().input_ended = true;
    }

    /// Take everything flushed so far.
    pub fn take_output(&self) -> Bytes {
        self.inner.lock().unwrap().output.split().freeze()
    }

    /// Cap the next flush call at `max` bytes (queued in call order).
    pub fn push_write_budget(&self, max: usize) {
        self.inner.lock().unwrap().write_budgets.push_back(max);
    }

    /// Number of flush calls issued so far.
    pub fn flush_calls(&self) -> usize {
        self.inner.lock().unwrap().flush_calls
    }

    /// The connection currently bound to this endpoint, if any.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.lock().unwrap().clone()
    }
}

impl EndPoint for MemEndPoint {
    fn fill(&self, buffer: &mut BytesMut) -> Fill {
        if self.ishut.load(Ordering::Acquire) {
            return Fill::Eof;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.input.is_empty() {
            if inner.input_ended {
                drop(inner);
                self.shutdown_input();
                return Fill::Eof;
            }
            return Fill::WouldBlock;
        }
        let space = buffer.capacity() - buffer.len();
        if space == 0 {
            return Fill::WouldBlock;
        }
        let n = space.min(inner.input.len());
        let chunk = inner.input.split_to(n);
        buffer.extend_from_slice(&chunk);
        *self.last_activity.lock().unwrap() = Instant::now();
        Fill::Bytes(n)
    }

    fn flush(&self, buffers: &mut [&mut dyn Buf]) -> Result<usize> {
        if self.oshut.load(Ordering::Acquire) {
            return Err(Error::OutputShutdown);
        }
        if !self.is_open() {
            return Err(Error::Closed);
        }
        let mut inner = self.inner.lock().unwrap();
        inner.flush_calls += 1;
        let mut budget = inner.write_budgets.pop_front().unwrap_or(usize::MAX);

        let mut written = 0;
        for buf in buffers.iter_mut() {
            if budget == 0 {
                break;
            }
            let n = budget.min(buf.remaining());
            let mut taken = 0;
            while taken < n {
                let chunk = buf.chunk();
                let take = chunk.len().min(n - taken);
                inner.output.extend_from_slice(&chunk[..take]);
                buf.advance(take);
                taken += take;
            }
            written += n;
            budget -= n;
        }
        if written > 0 {
            *self.last_activity.lock().unwrap() = Instant::now();
        }
        Ok(written)
    }

    fn shutdown_input(&self) {
        if self.ishut.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.oshut.load(Ordering::Acquire) {
            self.close();
        }
    }

    fn shutdown_output(&self) {
        if self.oshut.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.ishut.load(Ordering::Acquire) {
            self.close();
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
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
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
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

impl SelectableEndPoint for MemEndPoint {
    fn set_read_interested(&self, interested: bool) {
        self.read_interested.store(interested, Ordering::Release);
    }

    fn set_write_interested(&self, interested: bool) {
        self.write_interested.store(interested, Ordering::Release);
    }

    fn is_read_interested(&self) -> bool {
        self.read_interested.load(Ordering::Acquire)
    }

    fn is_write_interested(&self) -> bool {
        self.write_interested.load(Ordering::Acquire)
    }

    fn set_check_for_idle(&self, check: bool) {
        self.check_idle.store(check, Ordering::Release);
    }

    fn is_checked_for_idle(&self) -> bool {
        self.check_idle.load(Ordering::Acquire)
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    fn set_connection(&self, connection: Arc<dyn Connection>) {
        *self.connection.lock().unwrap() = Some(connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_input_and_eof() {
        let endp = MemEndPoint::new();
        endp.push_input(b"abc");
        endp.end_input();

        let mut buf = BytesMut::with_capacity(16);
        assert_eq!(endp.fill(&mut buf), Fill::Bytes(3));
        assert_eq!(&buf[..], b"abc");
        assert_eq!(endp.fill(&mut buf), Fill::Eof);
        assert!(endp.is_input_shutdown());
    }

    #[test]
    fn write_budget_limits_one_call() {
        let endp = MemEndPoint::new();
        endp.push_write_budget(3);

        let mut a = BytesMut::from(&b"head"[..]);
        let mut b = BytesMut::from(&b"body"[..]);
        let written = endp
            .flush(&mut [&mut a as &mut dyn Buf, &mut b as &mut dyn Buf])
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(&a[..], b"d");
        assert_eq!(&b[..], b"body");

        // Budget list exhausted: next flush is unlimited.
        let written = endp
            .flush(&mut [&mut a as &mut dyn Buf, &mut b as &mut dyn Buf])
            .unwrap();
        assert_eq!(written, 5);
        assert_eq!(&endp.take_output()[..], b"headbody");
    }
}
