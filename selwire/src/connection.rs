//! Readiness coordination between a selectable endpoint and a connection.
//!
//! The selector is the only producer of readiness events. The block-style
//! APIs here are a façade on top, so a handler may do synchronous I/O
//! without the connection giving up its selector integration.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::endpoint::{EndPoint, SelectableEndPoint};
use crate::error::{Error, Result};
use crate::metrics;

/// Work unit handed back to the selector for dispatch on the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoTask {
    Read,
    Write,
}

/// A protocol driver bound to a selectable endpoint.
///
/// The selector calls [`on_readable`](Connection::on_readable) /
/// [`on_writeable`](Connection::on_writeable); these either wake a blocked
/// caller or hand back a work unit that the selector's executor runs.
pub trait Connection: Send + Sync {
    /// The readiness coordination state shared with the selector.
    fn selectable(&self) -> &SelectableConnection;

    /// Called by the selector on read readiness. Wakes a parked
    /// [`block_readable`](SelectableConnection::block_readable) caller, or
    /// returns the read work unit.
    fn on_readable(&self) -> Option<IoTask> {
        self.selectable().on_readable()
    }

    /// Called by the selector on write readiness. Symmetric with
    /// [`on_readable`](Connection::on_readable).
    fn on_writeable(&self) -> Option<IoTask> {
        self.selectable().on_writeable()
    }

    /// Run a read cycle. Concrete connections override.
    fn do_read(self: Arc<Self>) -> Result<()> {
        Err(Error::IllegalState("connection does not read"))
    }

    /// Run a write cycle. Concrete connections override.
    fn do_write(self: Arc<Self>) -> Result<()> {
        Err(Error::IllegalState("connection does not write"))
    }

    /// Effective idle timeout for this connection.
    fn max_idle_time(&self) -> Option<Duration> {
        self.selectable().max_idle_time()
    }

    /// The selector's idle sweep found this connection idle for `idle_for`.
    fn on_idle_expired(&self, idle_for: Duration) {
        self.selectable().on_idle_expired(idle_for);
    }

    /// The peer shut its write side (`fill` returned EOF).
    fn on_input_shutdown(self: Arc<Self>) {}

    /// The endpoint has been closed.
    fn on_close(&self) {}

    /// Whether the connection has no request or response in flight.
    fn is_idle(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct BlockState {
    /// Thread currently parked in `block_readable`, if any.
    read_blocked: Option<ThreadId>,
    write_blocked: bool,
    read_signal: bool,
    write_signal: bool,
}

/// Coordination state between the selector and a connection: a lock, two
/// condition variables, and at most one parked blocker per direction.
pub struct SelectableConnection {
    endp: Arc<dyn SelectableEndPoint>,
    created: Instant,
    /// Connection-local idle override; `None` inherits the endpoint's.
    max_idle: Mutex<Option<Duration>>,
    state: Mutex<BlockState>,
    readable: Condvar,
    writeable: Condvar,
}

impl SelectableConnection {
    pub fn new(endp: Arc<dyn SelectableEndPoint>) -> Self {
        SelectableConnection {
            endp,
            created: Instant::now(),
            max_idle: Mutex::new(None),
            state: Mutex::new(BlockState::default()),
            readable: Condvar::new(),
            writeable: Condvar::new(),
        }
    }

    pub fn end_point(&self) -> &Arc<dyn SelectableEndPoint> {
        &self.endp
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Deliver read readiness. Returns the read work unit unless a blocked
    /// caller is parked, in which case that caller drains the event.
    pub fn on_readable(&self) -> Option<IoTask> {
        let mut s = self.state.lock().unwrap();
        if s.read_blocked.is_some() {
            s.read_signal = true;
            self.readable.notify_all();
            None
        } else {
            Some(IoTask::Read)
        }
    }

    /// Deliver write readiness. Symmetric with [`on_readable`](Self::on_readable).
    pub fn on_writeable(&self) -> Option<IoTask> {
        let mut s = self.state.lock().unwrap();
        if s.write_blocked {
            s.write_signal = true;
            self.writeable.notify_all();
            None
        } else {
            Some(IoTask::Write)
        }
    }

    /// Park the caller until the selector reports read readiness or
    /// `max_idle` elapses. At most one caller may be parked per direction.
    ///
    /// Returns `Ok(true)` iff woken by a readability signal, `Ok(false)` on
    /// timeout (read interest is withdrawn in that case).
    pub fn block_readable(&self, max_idle: Option<Duration>) -> Result<bool> {
        let mut s = self.state.lock().unwrap();
        if s.read_blocked.is_some() {
            return Err(Error::IllegalState("read already blocked"));
        }
        s.read_blocked = Some(thread::current().id());
        s.read_signal = false;
        self.endp.set_read_interested(true);

        let (mut s, readable) = self.await_signal(s, max_idle, Direction::Read);

        if !readable {
            self.endp.set_read_interested(false);
            metrics::BLOCK_TIMEOUTS.increment();
        }
        s.read_blocked = None;
        s.read_signal = false;
        Ok(readable)
    }

    /// Park the caller until the selector reports write readiness or
    /// `max_idle` elapses. Symmetric with [`block_readable`](Self::block_readable).
    pub fn block_writeable(&self, max_idle: Option<Duration>) -> Result<bool> {
        let mut s = self.state.lock().unwrap();
        if s.write_blocked {
            return Err(Error::IllegalState("write already blocked"));
        }
        s.write_blocked = true;
        s.write_signal = false;
        self.endp.set_write_interested(true);

        let (mut s, writeable) = self.await_signal(s, max_idle, Direction::Write);

        if !writeable {
            self.endp.set_write_interested(false);
            metrics::BLOCK_TIMEOUTS.increment();
        }
        s.write_blocked = false;
        s.write_signal = false;
        Ok(writeable)
    }

    fn await_signal<'a>(
        &self,
        mut s: std::sync::MutexGuard<'a, BlockState>,
        max_idle: Option<Duration>,
        dir: Direction,
    ) -> (std::sync::MutexGuard<'a, BlockState>, bool) {
        let deadline = max_idle.map(|d| Instant::now() + d);
        loop {
            let signalled = match dir {
                Direction::Read => s.read_signal,
                Direction::Write => s.write_signal,
            };
            if signalled {
                return (s, true);
            }
            let cond = match dir {
                Direction::Read => &self.readable,
                Direction::Write => &self.writeable,
            };
            match deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return (s, false);
                    }
                    s = cond.wait_timeout(s, dl - now).unwrap().0;
                }
                None => {
                    s = cond.wait(s).unwrap();
                }
            }
        }
    }

    /// Idle-expiry policy: half-close output to trigger a graceful close,
    /// or close outright if either side is already shut.
    pub fn on_idle_expired(&self, idle_for: Duration) {
        debug!(?idle_for, remote = ?self.endp.remote_addr(), "idle expired");
        metrics::IDLE_EXPIRED.increment();
        if self.endp.is_input_shutdown() || self.endp.is_output_shutdown() {
            self.endp.close();
        } else {
            self.endp.shutdown_output();
        }
    }

    /// Effective idle timeout: the connection-local override if set, else
    /// the endpoint's.
    pub fn max_idle_time(&self) -> Option<Duration> {
        (*self.max_idle.lock().unwrap()).or_else(|| self.endp.max_idle_time())
    }

    /// Set or clear (`None` = inherit from endpoint) the idle override.
    pub fn set_max_idle_time(&self, max: Option<Duration>) {
        *self.max_idle.lock().unwrap() = max;
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}
