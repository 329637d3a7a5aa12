//! Epoll-based readiness loop.
//!
//! A single selector thread owns the registration table. Readiness events
//! either wake a parked blocker or produce a work unit that is run on the
//! executor. Interest bits are one-shot: the selector withdraws an interest
//! when it delivers the event, and the work-unit wrapper re-arms read
//! interest when the dispatch returns.
//!
//! All mutations of the table (register, rebind on protocol switch,
//! deregister, interest refresh) arrive over a command channel paired with
//! an eventfd wake, so only the selector thread touches epoll.

use crate::Fill;
use std::io;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use slab::Slab;
use tracing::{debug, warn};

use crate::config::Config;
use crate::connection::{Connection, IoTask};
use crate::endpoint::{ChannelEndPoint, EndPoint, SelectableEndPoint};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::metrics;

const UNREGISTERED: usize = usize::MAX;
const WAKE_TOKEN: u64 = u64::MAX;

enum Command {
    Register {
        endp: Arc<SelectorEndPoint>,
        connection: Arc<dyn Connection>,
    },
    Refresh {
        token: usize,
    },
    Rebind {
        token: usize,
        connection: Arc<dyn Connection>,
    },
    Deregister {
        token: usize,
    },
    Shutdown,
}

/// Cloneable handle for talking to the selector thread.
#[derive(Clone)]
pub struct SelectorHandle {
    tx: crossbeam_channel::Sender<Command>,
    wake: Arc<WakeFd>,
    active: Arc<AtomicUsize>,
}

impl SelectorHandle {
    /// Register an endpoint/connection pair. Readiness events for the
    /// endpoint will be delivered to the connection from here on.
    pub fn register(
        &self,
        endp: Arc<SelectorEndPoint>,
        connection: Arc<dyn Connection>,
    ) -> Result<()> {
        self.send(Command::Register { endp, connection })
    }

    /// Ask the selector thread to exit. Registered endpoints are closed.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        self.wake.wake();
    }

    /// Connections currently registered.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| Error::SelectorClosed)?;
        self.wake.wake();
        Ok(())
    }

    fn refresh(&self, token: usize) {
        let _ = self.send(Command::Refresh { token });
    }

    fn rebind(&self, token: usize, connection: Arc<dyn Connection>) {
        let _ = self.send(Command::Rebind { token, connection });
    }

    fn deregister(&self, token: usize) {
        let _ = self.send(Command::Deregister { token });
    }
}

/// A [`ChannelEndPoint`] wired to a selector: interest bits, idle-check
/// toggle, and the connection rebinding used by protocol switches.
pub struct SelectorEndPoint {
    inner: ChannelEndPoint,
    fd: RawFd,
    handle: SelectorHandle,
    token: AtomicUsize,
    read_interested: AtomicBool,
    write_interested: AtomicBool,
    check_idle: AtomicBool,
}

impl SelectorEndPoint {
    /// Wrap a non-blocking stream for selector-driven use.
    pub fn new(stream: TcpStream, max_idle: Option<Duration>, handle: SelectorHandle) -> Arc<Self> {
        let fd = stream.as_raw_fd();
        Arc::new(SelectorEndPoint {
            inner: ChannelEndPoint::new(stream, max_idle),
            fd,
            handle,
            token: AtomicUsize::new(UNREGISTERED),
            read_interested: AtomicBool::new(false),
            write_interested: AtomicBool::new(false),
            check_idle: AtomicBool::new(false),
        })
    }

    fn bind(&self, token: usize) {
        self.token.store(token, Ordering::Release);
    }

    fn token(&self) -> Option<usize> {
        match self.token.load(Ordering::Acquire) {
            UNREGISTERED => None,
            t => Some(t),
        }
    }

    fn take_token(&self) -> Option<usize> {
        match self.token.swap(UNREGISTERED, Ordering::AcqRel) {
            UNREGISTERED => None,
            t => Some(t),
        }
    }

    fn request_refresh(&self) {
        if let Some(token) = self.token() {
            self.handle.refresh(token);
        }
    }

    fn deregister_if_closed(&self) {
        if !self.inner.is_open() {
            if let Some(token) = self.take_token() {
                self.handle.deregister(token);
            }
        }
    }
}

impl EndPoint for SelectorEndPoint {
    fn fill(&self, buffer: &mut BytesMut) -> Fill {
        let filled = self.inner.fill(buffer);
        self.deregister_if_closed();
        filled
    }

    fn flush(&self, buffers: &mut [&mut dyn Buf]) -> Result<usize> {
        self.inner.flush(buffers)
    }

    fn shutdown_input(&self) {
        self.inner.shutdown_input();
        self.deregister_if_closed();
    }

    fn shutdown_output(&self) {
        self.inner.shutdown_output();
        self.deregister_if_closed();
    }

    fn close(&self) {
        self.inner.close();
        if let Some(token) = self.take_token() {
            self.handle.deregister(token);
        }
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn is_input_shutdown(&self) -> bool {
        self.inner.is_input_shutdown()
    }

    fn is_output_shutdown(&self) -> bool {
        self.inner.is_output_shutdown()
    }

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.remote_addr()
    }

    fn max_idle_time(&self) -> Option<Duration> {
        self.inner.max_idle_time()
    }

    fn set_max_idle_time(&self, max: Option<Duration>) {
        self.inner.set_max_idle_time(max);
    }
}

impl SelectableEndPoint for SelectorEndPoint {
    fn set_read_interested(&self, interested: bool) {
        if self.read_interested.swap(interested, Ordering::AcqRel) != interested {
            self.request_refresh();
        }
    }

    fn set_write_interested(&self, interested: bool) {
        if self.write_interested.swap(interested, Ordering::AcqRel) != interested {
            self.request_refresh();
        }
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
        Duration::from_millis(self.inner.millis_idle())
    }

    fn set_connection(&self, connection: Arc<dyn Connection>) {
        if let Some(token) = self.token() {
            self.handle.rebind(token, connection);
        }
    }
}

struct Registration {
    endp: Arc<SelectorEndPoint>,
    connection: Arc<dyn Connection>,
    /// A work unit for this connection is queued or running. The selector
    /// never dispatches a second one until the first returns.
    dispatched: Arc<AtomicBool>,
}

/// The selector event loop. Created with [`Selector::spawn`].
pub struct Selector {
    poller: Poller,
    rx: crossbeam_channel::Receiver<Command>,
    handle: SelectorHandle,
    executor: Arc<Executor>,
    registrations: Slab<Registration>,
    config: Config,
    last_sweep: Instant,
}

impl Selector {
    /// Start the selector thread. Returns the command handle and the join
    /// handle for shutdown.
    pub fn spawn(
        config: Config,
        executor: Arc<Executor>,
    ) -> Result<(SelectorHandle, thread::JoinHandle<()>)> {
        config.validate()?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let wake = Arc::new(WakeFd::new().map_err(Error::Io)?);
        let handle = SelectorHandle {
            tx,
            wake,
            active: Arc::new(AtomicUsize::new(0)),
        };

        let poller = Poller::new().map_err(Error::Io)?;
        poller
            .add(handle.wake.fd, WAKE_TOKEN, true, false)
            .map_err(Error::Io)?;

        let mut selector = Selector {
            poller,
            rx,
            handle: handle.clone(),
            executor,
            registrations: Slab::new(),
            config,
            last_sweep: Instant::now(),
        };

        let join = thread::Builder::new()
            .name("selwire-selector".to_string())
            .spawn(move || selector.run())
            .map_err(Error::Io)?;

        Ok((handle, join))
    }

    fn run(&mut self) {
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; 256];
        loop {
            if !self.drain_commands() {
                break;
            }

            let timeout = self.config.sweep_interval.as_millis().min(i32::MAX as u128) as i32;
            let n = match self.poller.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "epoll_wait failed");
                    continue;
                }
            };

            for ev in &events[..n] {
                if ev.u64 == WAKE_TOKEN {
                    self.handle.wake.drain();
                    continue;
                }
                self.handle_event(ev.u64 as usize, ev.events);
            }

            if self.last_sweep.elapsed() >= self.config.sweep_interval {
                self.sweep_idle();
                self.last_sweep = Instant::now();
            }
        }

        // Shutdown: close what is left and tell the connections.
        for reg in self.registrations.drain() {
            reg.endp.inner.close();
            reg.connection.on_close();
        }
    }

    /// Apply queued commands. Returns false on shutdown.
    fn drain_commands(&mut self) -> bool {
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                Command::Register { endp, connection } => self.register(endp, connection),
                Command::Refresh { token } => self.apply_interest(token),
                Command::Rebind { token, connection } => {
                    if let Some(reg) = self.registrations.get_mut(token) {
                        debug!(token, "connection rebound");
                        reg.connection = connection;
                    }
                }
                Command::Deregister { token } => self.deregister(token),
                Command::Shutdown => return false,
            }
        }
        true
    }

    fn register(&mut self, endp: Arc<SelectorEndPoint>, connection: Arc<dyn Connection>) {
        if self.registrations.len() >= self.config.max_connections {
            warn!("connection limit reached, refusing registration");
            endp.inner.close();
            connection.on_close();
            return;
        }

        let fd = endp.fd;
        let read = endp.is_read_interested();
        let write = endp.is_write_interested();
        let entry = self.registrations.vacant_entry();
        let token = entry.key();
        endp.bind(token);
        entry.insert(Registration {
            endp: endp.clone(),
            connection,
            dispatched: Arc::new(AtomicBool::new(false)),
        });

        if let Err(e) = self.poller.add(fd, token as u64, read, write) {
            warn!(error = %e, "epoll add failed");
            let reg = self.registrations.remove(token);
            reg.endp.bind(UNREGISTERED);
            reg.endp.inner.close();
            reg.connection.on_close();
            return;
        }

        self.handle.active.fetch_add(1, Ordering::AcqRel);
        metrics::CONNECTIONS_REGISTERED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();
    }

    fn deregister(&mut self, token: usize) {
        if !self.registrations.contains(token) {
            return;
        }
        let reg = self.registrations.remove(token);
        let _ = self.poller.delete(reg.endp.fd);
        reg.endp.bind(UNREGISTERED);
        self.handle.active.fetch_sub(1, Ordering::AcqRel);
        metrics::CONNECTIONS_DEREGISTERED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();
        reg.connection.on_close();
    }

    fn apply_interest(&self, token: usize) {
        if let Some(reg) = self.registrations.get(token) {
            let _ = self.poller.modify(
                reg.endp.fd,
                token as u64,
                reg.endp.is_read_interested(),
                reg.endp.is_write_interested(),
            );
        }
    }

    fn handle_event(&self, token: usize, events: u32) {
        let Some(reg) = self.registrations.get(token) else {
            return;
        };

        let hangup = events & (libc::EPOLLHUP | libc::EPOLLERR | libc::EPOLLRDHUP) as u32 != 0;
        let readable = events & libc::EPOLLIN as u32 != 0 || hangup;
        let writable = events & libc::EPOLLOUT as u32 != 0;

        let mut refresh = false;

        if readable {
            // One-shot delivery: withdraw the interest, the dispatch
            // re-arms it when done. Hangups are delivered even without
            // declared interest so the engine observes EOF.
            let was_interested = reg.endp.read_interested.swap(false, Ordering::AcqRel);
            refresh |= was_interested;
            if was_interested || hangup {
                if let Some(task) = reg.connection.on_readable() {
                    self.dispatch(reg, task);
                }
            }
        }

        if writable && reg.endp.write_interested.swap(false, Ordering::AcqRel) {
            refresh = true;
            if let Some(task) = reg.connection.on_writeable() {
                self.dispatch(reg, task);
            }
        }

        if refresh {
            self.apply_interest(token);
        }
    }

    fn dispatch(&self, reg: &Registration, task: IoTask) {
        if reg.dispatched.swap(true, Ordering::AcqRel) {
            return;
        }
        let conn = reg.connection.clone();
        let endp = reg.endp.clone();
        let dispatched = reg.dispatched.clone();
        self.executor.execute(move || {
            let result = match task {
                IoTask::Read => conn.clone().do_read(),
                IoTask::Write => conn.clone().do_write(),
            };
            if let Err(e) = result {
                warn!(error = %e, "connection dispatch failed");
                metrics::DISPATCH_FAILURES.increment();
            }
            dispatched.store(false, Ordering::Release);
            // Ready for the next request cycle unless input is done. The
            // rebound connection (after a protocol switch) inherits this.
            if endp.is_open() && !endp.is_input_shutdown() {
                endp.set_read_interested(true);
            }
        });
    }

    fn sweep_idle(&self) {
        let mut expired: Vec<(Arc<dyn Connection>, Duration)> = Vec::new();
        for (_token, reg) in self.registrations.iter() {
            if !reg.endp.is_checked_for_idle() || reg.dispatched.load(Ordering::Acquire) {
                continue;
            }
            let Some(max_idle) = reg.connection.max_idle_time() else {
                continue;
            };
            let idle = reg.endp.idle_for();
            if idle >= max_idle {
                expired.push((reg.connection.clone(), idle));
            }
        }
        for (connection, idle) in expired {
            connection.on_idle_expired(idle);
        }
    }
}

struct Poller {
    epfd: RawFd,
}

impl Poller {
    fn new() -> io::Result<Poller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller { epfd })
    }

    fn add(&self, fd: RawFd, token: u64, read: bool, write: bool) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, read, write)
    }

    fn modify(&self, fd: RawFd, token: u64, read: bool, write: bool) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, read, write)
    }

    fn delete(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, read: bool, write: bool) -> io::Result<()> {
        let mut events: u32 = 0;
        if read {
            events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if write {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event { events, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let ret = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if ret < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(e);
        }
        Ok(ret as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

struct WakeFd {
    fd: RawFd,
}

impl WakeFd {
    fn new() -> io::Result<WakeFd> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WakeFd { fd })
    }

    fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(self.fd, &mut val as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
