//! Server lifecycle: bind, launch, shutdown.
//!
//! `ServerBuilder::launch` starts the executor pool, the selector thread,
//! and an acceptor thread that wraps each accepted socket in a selector
//! endpoint plus an [`HttpConnection`] and registers the pair.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use selwire::endpoint::SelectableEndPoint;
use selwire::{Executor, Selector, SelectorEndPoint, SelectorHandle};

use crate::connection::{Handler, HttpConnection};
use crate::connector::{Connector, ConnectorConfig};
use crate::error::Result;
use crate::metrics;

/// Accept-poll granularity while waiting for connections or shutdown.
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Top-level server configuration.
#[derive(Clone, Default)]
pub struct ServerConfig {
    /// Selector/executor settings.
    pub io: selwire::Config,
    /// Buffer pools and idle policy.
    pub connector: ConnectorConfig,
}

/// Builder for launching an HTTP server.
///
/// ```no_run
/// use selwire_http::{ServerBuilder, Exchange};
/// use bytes::Bytes;
///
/// let server = ServerBuilder::new()
///     .bind("127.0.0.1:8080".parse().unwrap())
///     .launch(|exchange: &mut Exchange<'_>| -> selwire_http::Result<()> {
///         exchange.write(Bytes::from_static(b"hello"), false)?;
///         Ok(())
///     })
///     .unwrap();
/// server.join_forever();
/// ```
pub struct ServerBuilder {
    config: ServerConfig,
    bind: Option<SocketAddr>,
    tcp_nodelay: bool,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        ServerBuilder {
            config: ServerConfig::default(),
            bind: None,
            tcp_nodelay: true,
        }
    }

    /// Set the listen address.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind = Some(addr);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of executor worker threads. 0 = number of CPUs.
    pub fn workers(mut self, n: usize) -> Self {
        self.config.io.worker_threads = n;
        self
    }

    /// Default idle timeout for accepted connections.
    pub fn max_idle_time(mut self, max: Duration) -> Self {
        self.config.connector.max_idle_time = max;
        self
    }

    /// Enable or disable TCP_NODELAY on accepted connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.tcp_nodelay = enable;
        self
    }

    /// Bind, start the selector, executor, and acceptor, and serve.
    pub fn launch<H: Handler>(self, handler: H) -> Result<Server> {
        let addr = self
            .bind
            .ok_or(selwire::Error::IllegalState("bind address required"))?;

        let executor = Arc::new(Executor::new(self.config.io.worker_threads)?);
        let (selector, selector_join) = Selector::spawn(self.config.io.clone(), executor.clone())?;
        let connector = Arc::new(Connector::new(self.config.connector.clone()));
        let handler: Arc<dyn Handler> = Arc::new(handler);

        let listener = TcpListener::bind(addr).map_err(selwire::Error::Io)?;
        listener.set_nonblocking(true).map_err(selwire::Error::Io)?;
        let local_addr = listener.local_addr().map_err(selwire::Error::Io)?;

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let acceptor = Acceptor {
            listener,
            selector: selector.clone(),
            connector: connector.clone(),
            handler,
            tcp_nodelay: self.tcp_nodelay,
            shutdown: shutdown_flag.clone(),
        };
        let acceptor_join = thread::Builder::new()
            .name("selwire-acceptor".to_string())
            .spawn(move || acceptor.run())
            .map_err(selwire::Error::Io)?;

        Ok(Server {
            local_addr,
            selector,
            executor,
            connector,
            shutdown_flag,
            selector_join: Some(selector_join),
            acceptor_join: Some(acceptor_join),
        })
    }
}

/// A running server. Dropping it does not stop the threads; call
/// [`shutdown`](Server::shutdown).
pub struct Server {
    local_addr: SocketAddr,
    selector: SelectorHandle,
    executor: Arc<Executor>,
    connector: Arc<Connector>,
    shutdown_flag: Arc<AtomicBool>,
    selector_join: Option<thread::JoinHandle<()>>,
    acceptor_join: Option<thread::JoinHandle<()>>,
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    pub fn selector(&self) -> &SelectorHandle {
        &self.selector
    }

    /// Block the calling thread on the selector for the life of the server.
    pub fn join_forever(mut self) {
        if let Some(join) = self.selector_join.take() {
            let _ = join.join();
        }
    }

    /// Stop accepting, close registered connections, and join all threads.
    pub fn shutdown(mut self) {
        self.shutdown_flag.store(true, Ordering::Release);
        if let Some(join) = self.acceptor_join.take() {
            let _ = join.join();
        }
        self.selector.shutdown();
        if let Some(join) = self.selector_join.take() {
            let _ = join.join();
        }
        self.executor.shutdown();
    }
}

struct Acceptor {
    listener: TcpListener,
    selector: SelectorHandle,
    connector: Arc<Connector>,
    handler: Arc<dyn Handler>,
    tcp_nodelay: bool,
    shutdown: Arc<AtomicBool>,
}

impl Acceptor {
    fn run(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.admit(stream, peer) {
                        debug!(error = %e, %peer, "connection refused");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) -> selwire::error::Result<()> {
        stream.set_nonblocking(true)?;
        if self.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        metrics::CONNECTIONS_ACCEPTED.increment();

        self.connector.set_low_resources(
            self.selector.active_connections() >= self.connector.low_resource_connections(),
        );

        let endp = SelectorEndPoint::new(
            stream,
            Some(self.connector.max_idle_time()),
            self.selector.clone(),
        );
        let as_selectable: Arc<dyn SelectableEndPoint> = endp.clone();
        let conn = HttpConnection::new(
            self.connector.clone(),
            as_selectable,
            self.handler.clone(),
        );

        endp.set_check_for_idle(true);
        endp.set_read_interested(true);
        self.selector.register(endp, conn)?;
        debug!(%peer, "connection accepted");
        Ok(())
    }
}
