//! Response-side model: status, reason, fields, and declared length.

use crate::request::{Fields, HttpVersion};

/// Response state built up by the handler for the current round trip.
pub struct Response {
    status: u16,
    reason: Option<String>,
    fields: Fields,
    /// Declared content length; -1 means unknown (the generator decides the
    /// framing at commit).
    content_length: i64,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Response {
            status: 200,
            reason: None,
            fields: Fields::new(),
            content_length: -1,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut Fields {
        &mut self.fields
    }

    pub fn content_length(&self) -> i64 {
        self.content_length
    }

    pub fn set_content_length(&mut self, length: u64) {
        self.content_length = length as i64;
    }

    pub(crate) fn reset(&mut self) {
        self.status = 200;
        self.reason = None;
        self.fields.clear();
        self.content_length = -1;
    }
}

/// Immutable view the generator consumes when serializing a response.
pub struct ResponseInfo<'a> {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: Option<&'a str>,
    pub fields: &'a Fields,
    pub content_length: i64,
    pub head: bool,
}

/// Canonical reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        417 => "Expectation Failed",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let response = Response::new();
        assert_eq!(response.status(), 200);
        assert_eq!(response.content_length(), -1);
        assert!(response.fields().is_empty());
    }

    #[test]
    fn reason_phrases() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(101), "Switching Protocols");
        assert_eq!(reason_phrase(599), "");
    }
}
