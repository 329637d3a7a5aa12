//! The HTTP/1.x connection driver.
//!
//! `HttpConnection` binds a selectable endpoint to the parser, generator,
//! and channel. `process_input` is the parse loop: pull bytes, parse,
//! dispatch, and reset for keep-alive or hand the selector registration to
//! a replacement connection after a 101 response. The generate/flush state
//! machine walks the generator's steps and issues minimum-syscall gather
//! writes over the header, chunk, body, and caller-content buffers.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

use selwire::connection::{Connection, SelectableConnection};
use selwire::endpoint::{EndPoint, Fill, SelectableEndPoint};
use selwire::error::Result as IoResult;

use crate::channel::HttpChannel;
use crate::connector::Connector;
use crate::error::{Error, HttpError, Result};
use crate::generator::{self, Action, HttpGenerator, Step};
use crate::metrics;
use crate::parser::HttpParser;
use crate::request::{Request, SWITCHED_CONNECTION_ATTRIBUTE};

thread_local! {
    static CURRENT: RefCell<Option<Arc<HttpConnection>>> = const { RefCell::new(None) };
}

/// Application entry point: invoked once per parsed request.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, exchange: &mut Exchange<'_>) -> Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&mut Exchange<'_>) -> Result<()> + Send + Sync + 'static,
{
    fn handle(&self, exchange: &mut Exchange<'_>) -> Result<()> {
        self(exchange)
    }
}

/// Which output slots are pending flush. The legal combinations are
/// enumerated in [`Driver::flush`]; anything else is an early runtime
/// error, never a silent misordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlushSet(u8);

impl FlushSet {
    const EMPTY: FlushSet = FlushSet(0);

    fn from_slots(header: bool, chunk: bool, body: bool, content: bool) -> FlushSet {
        FlushSet((header as u8) << 3 | (chunk as u8) << 2 | (body as u8) << 1 | content as u8)
    }

    fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn has_content(self) -> bool {
        self.0 & 1 != 0
    }

    fn bits(self) -> u8 {
        self.0
    }
}

/// The server-side HTTP/1.x protocol driver for one connection.
pub struct HttpConnection {
    core: SelectableConnection,
    endp: Arc<dyn SelectableEndPoint>,
    connector: Arc<Connector>,
    handler: Arc<dyn Handler>,
    state: Mutex<Driver>,
}

impl HttpConnection {
    pub fn new(
        connector: Arc<Connector>,
        endp: Arc<dyn SelectableEndPoint>,
        handler: Arc<dyn Handler>,
    ) -> Arc<Self> {
        Arc::new(HttpConnection {
            core: SelectableConnection::new(endp.clone()),
            endp,
            connector,
            handler,
            state: Mutex::new(Driver::new()),
        })
    }

    /// The connection driving the current thread's dispatch, if any. Set on
    /// entry to `process_input` and cleared on exit.
    pub fn current() -> Option<Arc<HttpConnection>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    pub fn end_point(&self) -> &Arc<dyn SelectableEndPoint> {
        &self.endp
    }

    /// Layered idle policy: low-resource mode overrides an endpoint left at
    /// the connector default; an explicit endpoint value wins otherwise.
    fn effective_max_idle(&self) -> Option<Duration> {
        let endp_idle = self.endp.max_idle_time();
        if self.connector.is_low_resources()
            && endp_idle == Some(self.connector.max_idle_time())
        {
            return Some(self.connector.low_resource_max_idle_time());
        }
        match endp_idle {
            Some(d) if !d.is_zero() => Some(d),
            _ => Some(self.connector.max_idle_time()),
        }
    }

    /// The parse loop: fill, parse, dispatch, and reset until no more
    /// progress can be made, the request suspends, or the connection is
    /// replaced by a protocol switch.
    pub fn process_input(self: &Arc<Self>) {
        let mut driver = self.state.lock().unwrap();
        let _current = CurrentGuard::enter(self.clone());

        // A long in-flight dispatch must not be killed for inactivity.
        self.endp.set_check_for_idle(false);

        let mut progress = true;
        let mut replaced = false;
        let mut eof_seen = false;

        while progress && !replaced {
            progress = false;

            // A request buffer, lazily: header-sized until the parser is
            // mid-body, content-sized from then on.
            let in_content = driver.parser.is_in_content();
            let pool = self.connector.request_buffers();
            let buf = driver.request_buffer.get_or_insert_with(|| {
                if in_content {
                    pool.get_buffer()
                } else {
                    pool.get_header()
                }
            });

            match self.endp.fill(buf) {
                Fill::Bytes(_) => progress = true,
                Fill::WouldBlock => {}
                Fill::Eof => {
                    if !eof_seen {
                        eof_seen = true;
                        // Let the parser observe the end of stream.
                        progress = true;
                        self.input_shutdown_locked(&mut driver);
                    }
                }
            }

            match driver.parse_and_dispatch(self) {
                Ok(_event) => {}
                Err(Error::Http(e)) => {
                    metrics::PROTOCOL_ERRORS.increment();
                    debug!(status = e.status, reason = e.reason, "request rejected");
                    // The parser is dead for this stream and the rest of
                    // the input is not trusted.
                    driver.parser.set_persistent(false);
                    if let Some(buf) = driver.request_buffer.as_mut() {
                        let len = buf.len();
                        buf.advance(len);
                    }
                    if let Err(err) = driver.send_error(self, e.status, e.reason, None, true) {
                        debug!(error = %err, "error response failed, closing");
                        self.endp.close();
                    }
                    break;
                }
                Err(Error::Io(e)) => {
                    // Unrecoverable transport failure mid-cycle.
                    debug!(error = %e, "request cycle failed, closing");
                    self.endp.close();
                    break;
                }
            }

            // Return a fully consumed request buffer.
            if driver.request_buffer.as_ref().is_some_and(|b| b.is_empty()) {
                if let Some(buf) = driver.request_buffer.take() {
                    self.connector.request_buffers().return_buffer(buf);
                }
            }

            // Round trip complete and fully flushed?
            if driver.parser.is_complete() && driver.generator.is_complete() {
                if driver.channel.response().status() == 101 {
                    if let Some(switched) = driver.take_switched_connection() {
                        metrics::PROTOCOL_SWITCHES.increment();
                        self.endp.set_connection(switched);
                        replaced = true;
                    }
                }
                driver.reset(&self.connector);
                progress = true;
            } else if driver.channel.request().is_async_started() {
                debug!("request suspended");
                break;
            }
        }

        if self.endp.is_open() {
            // Drained slots have no further use between dispatches.
            driver.release_empty_buffers(&self.connector);
        } else {
            driver.release_buffers(&self.connector);
        }

        // Re-enable idle checking unless the request owns its own lifetime
        // from here (async continuation).
        if !driver.channel.request().is_async_started() {
            self.endp.set_check_for_idle(true);
        }
    }

    fn input_shutdown_locked(&self, driver: &mut Driver) {
        let nothing_in_flight = driver.generator.is_idle()
            && driver.parser.is_idle()
            && !driver.channel.request().is_async_started();
        if nothing_in_flight {
            self.endp.close();
        } else {
            // Surface EOF on the current message.
            driver.parser.set_persistent(false);
        }
    }
}

impl Connection for HttpConnection {
    fn selectable(&self) -> &SelectableConnection {
        &self.core
    }

    fn do_read(self: Arc<Self>) -> IoResult<()> {
        self.process_input();
        Ok(())
    }

    fn max_idle_time(&self) -> Option<Duration> {
        self.effective_max_idle()
    }

    fn on_input_shutdown(self: Arc<Self>) {
        let mut driver = self.state.lock().unwrap();
        self.input_shutdown_locked(&mut driver);
    }

    fn on_close(&self) {
        match self.state.try_lock() {
            Ok(mut driver) => {
                driver.release_buffers(&self.connector);
                driver.channel.on_close();
            }
            // The owning worker releases buffers on its own exit path.
            Err(_) => debug!("closed while dispatched"),
        }
    }

    fn is_idle(&self) -> bool {
        match self.state.try_lock() {
            Ok(driver) => driver.parser.is_idle() && driver.generator.is_idle(),
            Err(_) => false,
        }
    }
}

struct CurrentGuard;

impl CurrentGuard {
    fn enter(conn: Arc<HttpConnection>) -> CurrentGuard {
        CURRENT.with(|c| *c.borrow_mut() = Some(conn));
        CurrentGuard
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.borrow_mut().take());
    }
}

/// Engine state owned by at most one worker at a time: the parser,
/// generator, channel, and the five buffer slots.
struct Driver {
    parser: HttpParser,
    generator: HttpGenerator,
    channel: HttpChannel,
    request_buffer: Option<BytesMut>,
    response_header: Option<BytesMut>,
    chunk: Option<BytesMut>,
    response_buffer: Option<BytesMut>,
    to_flush: FlushSet,
}

impl Driver {
    fn new() -> Self {
        Driver {
            parser: HttpParser::new(),
            generator: HttpGenerator::new(),
            channel: HttpChannel::new(),
            request_buffer: None,
            response_header: None,
            chunk: None,
            response_buffer: None,
            to_flush: FlushSet::EMPTY,
        }
    }

    fn parse_and_dispatch(&mut self, conn: &Arc<HttpConnection>) -> Result<bool> {
        let made_event = {
            let Some(mut buf) = self.request_buffer.take() else {
                return Ok(false);
            };
            let result = self.parser.parse_next(&mut buf, &mut self.channel);
            self.request_buffer = Some(buf);
            result?
        };
        if made_event {
            self.dispatch(conn)?;
        }
        Ok(made_event)
    }

    fn dispatch(&mut self, conn: &Arc<HttpConnection>) -> Result<()> {
        metrics::REQUESTS_DISPATCHED.increment();

        // The request decides the round's persistence for both machines.
        let keep_alive = self.channel.request_keep_alive();
        self.parser.set_persistent(keep_alive);
        self.generator.set_persistent(keep_alive);

        let handler = conn.handler.clone();
        handler.handle(&mut Exchange { driver: self, conn })?;

        if !self.channel.request().is_async_started() && !self.generator.is_complete() {
            self.generate(conn, None, Action::Complete, false)?;
        }
        Ok(())
    }

    /// Emit a synthesized error response. Fails if the response is already
    /// committed; the caller then forces a non-persistent close.
    fn send_error(
        &mut self,
        conn: &Arc<HttpConnection>,
        status: u16,
        reason: &'static str,
        body: Option<Bytes>,
        close: bool,
    ) -> Result<()> {
        if self.generator.is_committed() {
            return Err(Error::Io(selwire::Error::IllegalState("response committed")));
        }
        let response = self.channel.response_mut();
        response.reset();
        response.set_status(status);
        response.set_reason(reason);
        if close {
            self.generator.set_persistent(false);
        }
        // Header and body slots up front; one COMPLETE pass emits the rest.
        if self.response_header.is_none() {
            self.response_header = Some(conn.connector.response_buffers().get_header());
        }
        if self.response_buffer.is_none() {
            self.response_buffer = Some(conn.connector.response_buffers().get_buffer());
        }
        self.generate(conn, body, Action::Complete, false)?;
        Ok(())
    }

    /// Feed the generator until `action` finishes and `content` is drained,
    /// acquiring buffers and flushing as the steps demand. Returns the
    /// bytes consumed from `content`.
    fn generate(
        &mut self,
        conn: &Arc<HttpConnection>,
        mut content: Option<Bytes>,
        action: Action,
        volatile: bool,
    ) -> Result<usize> {
        if self.generator.is_complete() {
            return Err(Error::Io(selwire::Error::Eof));
        }
        let before = self.generator.content_prepared();

        loop {
            // Backpressure left over from a previous step drains first.
            if !self.to_flush.is_empty() {
                self.flush(conn, true, content.as_mut())?;
            }

            let step = {
                let Driver {
                    generator,
                    channel,
                    response_header,
                    chunk,
                    response_buffer,
                    ..
                } = self;
                let info = channel.response_info();
                generator.generate(
                    &info,
                    response_header.as_mut(),
                    chunk.as_mut(),
                    response_buffer.as_mut(),
                    content.as_mut(),
                    action,
                )?
            };

            match step {
                Step::NeedHeader => {
                    self.response_header =
                        Some(conn.connector.response_buffers().get_header());
                }
                Step::NeedBuffer => {
                    self.response_buffer =
                        Some(conn.connector.response_buffers().get_buffer());
                }
                Step::NeedChunk => {
                    // Chunked responses reuse the header slot for frames.
                    if let Some(header) = self.response_header.take() {
                        conn.connector.response_buffers().return_buffer(header);
                    }
                    self.chunk =
                        Some(conn.connector.response_buffers().get_sized(generator::CHUNK_SIZE));
                }
                Step::Flush => {
                    self.to_flush = FlushSet::from_slots(
                        has_content(&self.response_header),
                        has_content(&self.chunk),
                        has_content(&self.response_buffer),
                        false,
                    );
                    self.flush(conn, false, None)?;
                }
                Step::FlushContent => {
                    self.to_flush = FlushSet::from_slots(
                        has_content(&self.response_header),
                        has_content(&self.chunk),
                        false,
                        content.as_ref().is_some_and(|c| !c.is_empty()),
                    );
                    // A volatile caller buffer may not survive the return,
                    // so its flush must complete synchronously.
                    self.flush(conn, volatile, content.as_mut())?;
                }
                Step::ShutdownOut => conn.endp.shutdown_output(),
                Step::Ok => {}
            }

            let drained = content.as_ref().map_or(true, |c| c.is_empty());
            let finished = match action {
                Action::Prepare | Action::Flush => drained && step == Step::Ok,
                Action::Complete => drained && self.generator.is_complete(),
            };
            if finished {
                if !self.to_flush.is_empty() {
                    self.flush(conn, true, content.as_mut())?;
                }
                break;
            }
        }

        Ok((self.generator.content_prepared() - before) as usize)
    }

    /// Walk the flush set issuing the minimum-syscall gather writes, header
    /// first, then chunk, then body or caller content. With `block`, waits
    /// for writability until the set drains; without, one pass only.
    fn flush(
        &mut self,
        conn: &Arc<HttpConnection>,
        block: bool,
        mut content: Option<&mut Bytes>,
    ) -> Result<()> {
        while !self.to_flush.is_empty() {
            let mask = self.to_flush;
            {
                let Driver {
                    response_header,
                    chunk,
                    response_buffer,
                    ..
                } = self;
                let endp = &conn.endp;
                match mask.bits() {
                    0b1010 => {
                        let (Some(h), Some(b)) =
                            (response_header.as_mut(), response_buffer.as_mut())
                        else {
                            return Err(illegal_flush());
                        };
                        endp.flush(&mut [h as &mut dyn Buf, b as &mut dyn Buf])
                    }
                    0b1001 => {
                        let (Some(h), Some(c)) =
                            (response_header.as_mut(), content.as_deref_mut())
                        else {
                            return Err(illegal_flush());
                        };
                        endp.flush(&mut [h as &mut dyn Buf, c as &mut dyn Buf])
                    }
                    0b1000 => {
                        let Some(h) = response_header.as_mut() else {
                            return Err(illegal_flush());
                        };
                        endp.flush(&mut [h as &mut dyn Buf])
                    }
                    0b0110 => {
                        let (Some(ch), Some(b)) = (chunk.as_mut(), response_buffer.as_mut())
                        else {
                            return Err(illegal_flush());
                        };
                        endp.flush(&mut [ch as &mut dyn Buf, b as &mut dyn Buf])
                    }
                    0b0101 => {
                        let (Some(ch), Some(c)) = (chunk.as_mut(), content.as_deref_mut())
                        else {
                            return Err(illegal_flush());
                        };
                        endp.flush(&mut [ch as &mut dyn Buf, c as &mut dyn Buf])
                    }
                    0b0100 => {
                        let Some(ch) = chunk.as_mut() else {
                            return Err(illegal_flush());
                        };
                        endp.flush(&mut [ch as &mut dyn Buf])
                    }
                    0b0010 => {
                        let Some(b) = response_buffer.as_mut() else {
                            return Err(illegal_flush());
                        };
                        endp.flush(&mut [b as &mut dyn Buf])
                    }
                    0b0001 => {
                        let Some(c) = content.as_deref_mut() else {
                            return Err(illegal_flush());
                        };
                        endp.flush(&mut [c as &mut dyn Buf])
                    }
                    _ => return Err(illegal_flush()),
                }
                .map_err(Error::Io)?;
            }

            self.to_flush = FlushSet::from_slots(
                has_content(&self.response_header),
                has_content(&self.chunk),
                has_content(&self.response_buffer),
                mask.has_content() && content.as_deref().is_some_and(|c| !c.is_empty()),
            );

            if !block {
                break;
            }
            if !self.to_flush.is_empty() {
                let idle = conn.effective_max_idle();
                let writable = conn.core.block_writeable(idle).map_err(Error::Io)?;
                if !writable {
                    return Err(Error::Io(selwire::Error::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "write stalled",
                    ))));
                }
            }
        }
        Ok(())
    }

    fn take_switched_connection(&mut self) -> Option<Arc<dyn Connection>> {
        let boxed = self
            .channel
            .request_mut()
            .take_attribute(SWITCHED_CONNECTION_ATTRIBUTE)?;
        match boxed.downcast::<Arc<dyn Connection>>() {
            Ok(conn) => Some(*conn),
            Err(_) => {
                warn!("switch attribute does not hold a connection");
                None
            }
        }
    }

    /// Keep-alive transition: both machines idle, every pooled buffer back
    /// in its pool, the channel cleared. A request buffer holding pipelined
    /// bytes stays for the next round.
    fn reset(&mut self, connector: &Connector) {
        self.parser.reset();
        self.generator.reset();
        self.channel.reset();

        if self.request_buffer.as_ref().is_some_and(|b| b.is_empty()) {
            if let Some(buf) = self.request_buffer.take() {
                connector.request_buffers().return_buffer(buf);
            }
        }
        for slot in [
            &mut self.response_header,
            &mut self.chunk,
            &mut self.response_buffer,
        ] {
            if let Some(buf) = slot.take() {
                connector.response_buffers().return_buffer(buf);
            }
        }
        self.to_flush = FlushSet::EMPTY;
    }

    /// Return slots whose buffers drained; non-empty slots keep their
    /// bytes (partial request lines, unflushed output).
    fn release_empty_buffers(&mut self, connector: &Connector) {
        if self.request_buffer.as_ref().is_some_and(|b| b.is_empty()) {
            if let Some(buf) = self.request_buffer.take() {
                connector.request_buffers().return_buffer(buf);
            }
        }
        for slot in [
            &mut self.response_header,
            &mut self.chunk,
            &mut self.response_buffer,
        ] {
            if slot.as_ref().is_some_and(|b| b.is_empty()) {
                if let Some(buf) = slot.take() {
                    connector.response_buffers().return_buffer(buf);
                }
            }
        }
    }

    fn release_buffers(&mut self, connector: &Connector) {
        if let Some(buf) = self.request_buffer.take() {
            connector.request_buffers().return_buffer(buf);
        }
        for slot in [
            &mut self.response_header,
            &mut self.chunk,
            &mut self.response_buffer,
        ] {
            if let Some(buf) = slot.take() {
                connector.response_buffers().return_buffer(buf);
            }
        }
        self.to_flush = FlushSet::EMPTY;
    }
}

fn has_content(slot: &Option<BytesMut>) -> bool {
    slot.as_ref().is_some_and(|b| !b.is_empty())
}

fn illegal_flush() -> Error {
    Error::Io(selwire::Error::IllegalState("flush combination"))
}

/// Handler-facing view of the round trip: the parsed request plus the
/// response write path into the connection's generate state machine.
pub struct Exchange<'a> {
    driver: &'a mut Driver,
    conn: &'a Arc<HttpConnection>,
}

impl Exchange<'_> {
    pub fn request(&self) -> &Request {
        self.driver.channel.request()
    }

    pub fn request_mut(&mut self) -> &mut Request {
        self.driver.channel.request_mut()
    }

    pub fn set_status(&mut self, status: u16) {
        self.driver.channel.response_mut().set_status(status);
    }

    pub fn set_reason(&mut self, reason: &str) {
        self.driver.channel.response_mut().set_reason(reason);
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.driver.channel.response_mut().fields_mut().add(name, value);
    }

    pub fn set_content_length(&mut self, length: u64) {
        self.driver.channel.response_mut().set_content_length(length);
    }

    pub fn is_committed(&self) -> bool {
        self.driver.generator.is_committed()
    }

    /// Write response content. With `volatile`, the buffer is fully on the
    /// wire before this returns; without, bytes may aggregate.
    pub fn write(&mut self, content: Bytes, volatile: bool) -> Result<usize> {
        self.driver
            .generate(self.conn, Some(content), Action::Prepare, volatile)
    }

    /// Push everything buffered to the wire, committing if needed.
    pub fn flush_response(&mut self) -> Result<()> {
        self.driver
            .generate(self.conn, None, Action::Flush, false)
            .map(|_| ())
    }

    /// Fail the request with an error response.
    pub fn send_error(&mut self, error: HttpError, close: bool) -> Result<()> {
        self.driver
            .send_error(self.conn, error.status, error.reason, None, close)
    }

    /// Mark the request suspended; the parse loop exits without resetting
    /// and the async continuation owns the connection from here.
    pub fn start_async(&mut self) {
        self.driver.channel.request_mut().set_async_started(true);
    }

    /// Respond 101 and hand the selector registration to `connection` when
    /// the round trip completes.
    pub fn switch_protocol(&mut self, connection: Arc<dyn Connection>) {
        self.set_status(101);
        self.driver
            .channel
            .request_mut()
            .set_attribute(SWITCHED_CONNECTION_ATTRIBUTE, Box::new(connection));
    }

    /// The endpoint under this connection; replacement connections for
    /// [`switch_protocol`](Self::switch_protocol) are built over it.
    pub fn end_point(&self) -> Arc<dyn SelectableEndPoint> {
        self.conn.endp.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.endp.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.endp.remote_addr()
    }
}
