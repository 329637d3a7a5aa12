use thiserror::Error;

/// An HTTP-level protocol error, carrying the status the peer should see.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status} {reason}")]
pub struct HttpError {
    pub status: u16,
    pub reason: &'static str,
}

impl HttpError {
    pub const fn new(status: u16, reason: &'static str) -> Self {
        HttpError { status, reason }
    }

    pub const fn bad_request(reason: &'static str) -> Self {
        HttpError::new(400, reason)
    }
}

/// Errors surfaced by the HTTP connection engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure; the connection is unusable.
    #[error(transparent)]
    Io(#[from] selwire::Error),
    /// Protocol violation; answered with an error response when possible.
    #[error(transparent)]
    Http(#[from] HttpError),
}

pub type Result<T> = std::result::Result<T, Error>;
