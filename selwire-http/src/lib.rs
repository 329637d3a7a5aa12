//! selwire-http — HTTP/1.x server connection engine for the selwire core.
//!
//! The engine drives a request/response lifecycle over a non-blocking
//! selectable endpoint: pull bytes, parse requests, dispatch to a
//! [`Handler`], and serialize responses back with correct framing. The
//! [`HttpConnection`] owns the parse loop and a gather-write state machine
//! that flushes header + optional chunk + body in the minimum number of
//! syscalls while honoring backpressure; handlers may write blocking-style
//! through the selwire readiness helpers.
//!
//! # Quick Start
//!
//! ```no_run
//! use bytes::Bytes;
//! use selwire_http::{Exchange, ServerBuilder};
//!
//! fn main() -> selwire_http::Result<()> {
//!     let server = ServerBuilder::new()
//!         .bind("127.0.0.1:8080".parse().unwrap())
//!         .workers(4)
//!         .launch(|exchange: &mut Exchange<'_>| -> selwire_http::Result<()> {
//!             exchange.add_header("Content-Type", "text/plain");
//!             exchange.write(Bytes::from_static(b"hello\n"), false)?;
//!             Ok(())
//!         })?;
//!     server.join_forever();
//!     Ok(())
//! }
//! ```

// ── Modules ─────────────────────────────────────────────────────────────
pub mod channel;
pub mod connection;
pub mod connector;
pub mod error;
pub mod generator;
pub mod metrics;
pub mod parser;
pub mod request;
pub mod response;
pub mod server;

// ── Re-exports: engine ──────────────────────────────────────────────────

/// Handler-facing view of one request/response round trip.
pub use connection::Exchange;
/// Application entry point, one call per parsed request.
pub use connection::Handler;
/// The server-side HTTP/1.x protocol driver.
pub use connection::HttpConnection;

// ── Re-exports: collaborators ───────────────────────────────────────────

/// Per-request state: the parser's sink and the generator's source.
pub use channel::HttpChannel;
/// Buffer pools and idle policy shared by a server's connections.
pub use connector::{Connector, ConnectorConfig};
/// Response serializer state machine.
pub use generator::{Action, HttpGenerator, Step, CHUNK_SIZE};
/// Request parser state machine.
pub use parser::{HttpParser, RequestHandler};

// ── Re-exports: model ───────────────────────────────────────────────────

/// Engine errors: transport or protocol.
pub use error::{Error, HttpError, Result};
/// Request model.
pub use request::{Fields, HttpVersion, Method, Request, SWITCHED_CONNECTION_ATTRIBUTE};
/// Response model.
pub use response::{reason_phrase, Response, ResponseInfo};

// ── Re-exports: server ──────────────────────────────────────────────────

/// A running server.
pub use server::Server;
/// Builder for launching an HTTP server.
pub use server::{ServerBuilder, ServerConfig};
