//! selwire — selector-driven non-blocking I/O core.
//!
//! selwire provides the plumbing under a protocol connection engine: duplex
//! endpoints with half-shut semantics, a readiness coordination layer with
//! blocking helpers, a shared buffer pool, an epoll selector thread, and a
//! fixed executor pool that runs the work units the selector hands back.
//!
//! The flow: the selector detects readiness and calls
//! [`Connection::on_readable`] / [`Connection::on_writeable`]. Those either
//! wake a caller parked in [`SelectableConnection::block_readable`] /
//! [`SelectableConnection::block_writeable`], or return an [`IoTask`] that
//! the [`Executor`] runs as [`Connection::do_read`] / [`Connection::do_write`].
//! Protocol crates (such as `selwire-http`) implement [`Connection`] on top.
//!
//! # Platform
//!
//! Linux only: the selector is built directly on epoll and eventfd.

// ── Modules ─────────────────────────────────────────────────────────────
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod mem;
pub mod metrics;
pub mod pool;
pub mod selector;

// ── Re-exports: endpoints ───────────────────────────────────────────────

/// Concrete endpoint over a non-blocking TCP stream.
pub use endpoint::ChannelEndPoint;
/// Duplex byte-stream abstraction with half-shut semantics.
pub use endpoint::EndPoint;
/// Outcome of a single non-blocking read.
pub use endpoint::Fill;
/// Endpoint variant with readiness interest bits and idle tracking.
pub use endpoint::SelectableEndPoint;

// ── Re-exports: connections ─────────────────────────────────────────────

/// A protocol driver bound to a selectable endpoint.
pub use connection::Connection;
/// Work unit handed back to the selector for dispatch.
pub use connection::IoTask;
/// Readiness coordination state: lock, conditions, blockers.
pub use connection::SelectableConnection;

// ── Re-exports: runtime ─────────────────────────────────────────────────

/// Selector/executor configuration.
pub use config::Config;
/// Builder for [`Config`] with `build()` validation.
pub use config::ConfigBuilder;
/// Core I/O errors.
pub use error::Error;
/// Fixed worker pool running selector work units.
pub use executor::Executor;
/// Shared two-class buffer pool.
pub use pool::BufferPool;
/// The epoll event loop.
pub use selector::Selector;
/// Endpoint wired to the selector.
pub use selector::SelectorEndPoint;
/// Cloneable handle for talking to the selector thread.
pub use selector::SelectorHandle;

// ── Re-exports: test support ────────────────────────────────────────────

/// Scripted in-memory endpoint for driving engines without a socket.
pub use mem::MemEndPoint;
