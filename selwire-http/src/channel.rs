//! The per-request channel: request/response state for one round trip.
//!
//! The channel is the parser's event sink and the source of the
//! [`ResponseInfo`] view the generator serializes from.

use tracing::debug;

use crate::error::HttpError;
use crate::parser::RequestHandler;
use crate::request::{HttpVersion, Method, Request};
use crate::response::{Response, ResponseInfo};

/// Request/response state for the round trip currently on the connection.
pub struct HttpChannel {
    request: Request,
    response: Response,
}

impl Default for HttpChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpChannel {
    pub fn new() -> Self {
        HttpChannel {
            request: Request::new(),
            response: Response::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    /// Persistence the request asks for: HTTP/1.1 defaults to keep-alive
    /// unless closed, HTTP/1.0 requires an explicit keep-alive token.
    pub fn request_keep_alive(&self) -> bool {
        let connection = self.request.fields().get("connection").unwrap_or("");
        match self.request.version() {
            HttpVersion::Http11 => !has_token(connection, "close"),
            HttpVersion::Http10 => has_token(connection, "keep-alive"),
        }
    }

    /// The view the generator serializes. The version is the request's, so
    /// framing decisions (chunking) respect what the peer can parse.
    pub fn response_info(&self) -> ResponseInfo<'_> {
        ResponseInfo {
            version: self.request.version(),
            status: self.response.status(),
            reason: self.response.reason(),
            fields: self.response.fields(),
            content_length: self.response.content_length(),
            head: self.request.is_head(),
        }
    }

    /// Clear request and response state for the next round trip.
    pub fn reset(&mut self) {
        self.request.reset();
        self.response.reset();
    }

    pub fn on_close(&self) {
        debug!(target = %self.request.target(), "channel closed");
    }
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

impl RequestHandler for HttpChannel {
    fn on_request_line(
        &mut self,
        method: Method,
        target: &str,
        version: HttpVersion,
    ) -> Result<(), HttpError> {
        self.request.set_request_line(method, target, version);
        Ok(())
    }

    fn on_header(&mut self, name: &str, value: &str) -> Result<(), HttpError> {
        self.request.add_field(name, value);
        Ok(())
    }

    fn on_headers_complete(&mut self) -> Result<(), HttpError> {
        Ok(())
    }

    fn on_content(&mut self, content: &[u8]) -> Result<(), HttpError> {
        self.request.append_content(content);
        Ok(())
    }

    fn on_message_complete(&mut self) -> Result<(), HttpError> {
        Ok(())
    }
}
