use std::io;

use thiserror::Error;

/// Errors returned by the selwire I/O core.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The stream ended while more data was required.
    #[error("end of stream")]
    Eof,
    /// Write attempted after the output side was shut down.
    #[error("output shutdown")]
    OutputShutdown,
    /// Operation attempted on a closed endpoint.
    #[error("endpoint closed")]
    Closed,
    /// The selector thread has exited and no longer accepts commands.
    #[error("selector closed")]
    SelectorClosed,
    /// API misuse (double blocker, malformed flush set, write to an idle
    /// generator). Not recoverable.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
}

impl Error {
    /// True for errors that mean the peer or the transport is gone, as
    /// opposed to misuse of the API.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Error::IllegalState(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
