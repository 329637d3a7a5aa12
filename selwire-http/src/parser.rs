//! Push parser for HTTP/1.x requests.
//!
//! `parse_next` consumes what it can from the request buffer, fires events
//! on a [`RequestHandler`], and reports message completion. Malformed input
//! is rejected with an [`HttpError`] carrying the response status.

use bytes::{Buf, BytesMut};

use crate::error::HttpError;
use crate::request::{HttpVersion, Method};

/// A single request-line, header, or chunk-size line may not exceed this.
const MAX_LINE: usize = 8192;
/// Header-field count guard.
const MAX_FIELDS: usize = 128;

const EARLY_EOF: HttpError = HttpError::new(400, "Early EOF");

/// Event sink the parser drives. Implemented by the channel.
pub trait RequestHandler {
    fn on_request_line(
        &mut self,
        method: Method,
        target: &str,
        version: HttpVersion,
    ) -> Result<(), HttpError>;

    fn on_header(&mut self, name: &str, value: &str) -> Result<(), HttpError>;

    fn on_headers_complete(&mut self) -> Result<(), HttpError>;

    fn on_content(&mut self, content: &[u8]) -> Result<(), HttpError>;

    fn on_message_complete(&mut self) -> Result<(), HttpError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Headers,
    Content { remaining: u64 },
    ChunkSize,
    ChunkBody { remaining: u64 },
    ChunkBodyEnd,
    ChunkTrailer,
    End,
}

/// Request parser state machine.
pub struct HttpParser {
    state: State,
    persistent: bool,
    content_length: Option<u64>,
    chunked: bool,
    field_count: usize,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpParser {
    pub fn new() -> Self {
        HttpParser {
            state: State::Start,
            persistent: true,
            content_length: None,
            chunked: false,
            field_count: 0,
        }
    }

    /// No message has been started.
    pub fn is_idle(&self) -> bool {
        self.state == State::Start
    }

    /// The current message has been fully parsed.
    pub fn is_complete(&self) -> bool {
        self.state == State::End
    }

    /// Mid-body: the next request buffer should be content-sized.
    pub fn is_in_content(&self) -> bool {
        matches!(
            self.state,
            State::Content { .. }
                | State::ChunkSize
                | State::ChunkBody { .. }
                | State::ChunkBodyEnd
                | State::ChunkTrailer
        )
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// A non-persistent parser starts no new message and surfaces an
    /// incomplete-message error if the current one is cut short.
    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    /// Make the parser idle again for the next message on the stream.
    pub fn reset(&mut self) {
        self.state = State::Start;
        self.content_length = None;
        self.chunked = false;
        self.field_count = 0;
    }

    /// Consume what the buffer allows, firing handler events. Returns true
    /// when a message event completed.
    pub fn parse_next(
        &mut self,
        buf: &mut BytesMut,
        handler: &mut dyn RequestHandler,
    ) -> Result<bool, HttpError> {
        loop {
            match self.state {
                State::Start => {
                    if !self.persistent {
                        return Ok(false);
                    }
                    // Tolerate CRLF between pipelined messages.
                    while buf.first().is_some_and(|b| *b == b'\r' || *b == b'\n') {
                        buf.advance(1);
                    }
                    if buf.is_empty() {
                        return Ok(false);
                    }
                    let Some(eol) = find_crlf(buf) else {
                        return self.need_more(buf);
                    };
                    let line = std::str::from_utf8(&buf[..eol])
                        .map_err(|_| HttpError::bad_request("Bad Request"))?;
                    let (method, target, version) = parse_request_line(line)?;
                    handler.on_request_line(method, target, version)?;
                    buf.advance(eol + 2);
                    self.content_length = None;
                    self.chunked = false;
                    self.field_count = 0;
                    self.state = State::Headers;
                }

                State::Headers => {
                    let Some(eol) = find_crlf(buf) else {
                        return self.need_more(buf);
                    };
                    if eol == 0 {
                        buf.advance(2);
                        handler.on_headers_complete()?;
                        if self.chunked {
                            self.state = State::ChunkSize;
                        } else {
                            match self.content_length {
                                Some(n) if n > 0 => {
                                    self.state = State::Content { remaining: n };
                                }
                                _ => return self.finish(handler),
                            }
                        }
                        continue;
                    }
                    {
                        let line = std::str::from_utf8(&buf[..eol])
                            .map_err(|_| HttpError::bad_request("Bad Request"))?;
                        self.parse_header_line(line, handler)?;
                    }
                    buf.advance(eol + 2);
                }

                State::Content { remaining } => {
                    if buf.is_empty() {
                        return self.need_more(buf);
                    }
                    let n = (remaining as usize).min(buf.len());
                    handler.on_content(&buf[..n])?;
                    buf.advance(n);
                    let left = remaining - n as u64;
                    if left == 0 {
                        return self.finish(handler);
                    }
                    self.state = State::Content { remaining: left };
                }

                State::ChunkSize => {
                    let Some(eol) = find_crlf(buf) else {
                        return self.need_more(buf);
                    };
                    let line = std::str::from_utf8(&buf[..eol])
                        .map_err(|_| HttpError::bad_request("Invalid Chunk"))?;
                    let hex = line.split(';').next().unwrap_or("").trim();
                    if hex.is_empty() || hex.len() > 16 {
                        return Err(HttpError::bad_request("Invalid Chunk"));
                    }
                    let size = u64::from_str_radix(hex, 16)
                        .map_err(|_| HttpError::bad_request("Invalid Chunk"))?;
                    buf.advance(eol + 2);
                    self.state = if size == 0 {
                        State::ChunkTrailer
                    } else {
                        State::ChunkBody { remaining: size }
                    };
                }

                State::ChunkBody { remaining } => {
                    if buf.is_empty() {
                        return self.need_more(buf);
                    }
                    let n = (remaining as usize).min(buf.len());
                    handler.on_content(&buf[..n])?;
                    buf.advance(n);
                    let left = remaining - n as u64;
                    if left == 0 {
                        self.state = State::ChunkBodyEnd;
                    } else {
                        self.state = State::ChunkBody { remaining: left };
                    }
                }

                State::ChunkBodyEnd => {
                    if buf.len() < 2 {
                        return self.need_more(buf);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(HttpError::bad_request("Invalid Chunk"));
                    }
                    buf.advance(2);
                    self.state = State::ChunkSize;
                }

                State::ChunkTrailer => {
                    let Some(eol) = find_crlf(buf) else {
                        return self.need_more(buf);
                    };
                    buf.advance(eol + 2);
                    if eol == 0 {
                        return self.finish(handler);
                    }
                    // Trailer fields are consumed and ignored.
                }

                State::End => return Ok(false),
            }
        }
    }

    fn parse_header_line(
        &mut self,
        line: &str,
        handler: &mut dyn RequestHandler,
    ) -> Result<(), HttpError> {
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(HttpError::bad_request("Bad Request"));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(HttpError::bad_request("Bad Request"))?;
        if name.is_empty() || !name.bytes().all(is_tchar) {
            return Err(HttpError::bad_request("Bad Request"));
        }
        let value = value.trim_matches(|c| c == ' ' || c == '\t');

        if name.eq_ignore_ascii_case("content-length") {
            let n: u64 = value
                .parse()
                .map_err(|_| HttpError::bad_request("Invalid Content-Length"))?;
            match self.content_length {
                Some(prev) if prev != n => {
                    return Err(HttpError::bad_request("Invalid Content-Length"));
                }
                _ => self.content_length = Some(n),
            }
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            let last = value.rsplit(',').next().unwrap_or("").trim();
            if last.eq_ignore_ascii_case("chunked") {
                self.chunked = true;
            } else {
                return Err(HttpError::new(501, "Unsupported Transfer-Encoding"));
            }
        }

        self.field_count += 1;
        if self.field_count > MAX_FIELDS {
            return Err(HttpError::new(431, "Request Header Fields Too Large"));
        }
        handler.on_header(name, value)
    }

    fn finish(&mut self, handler: &mut dyn RequestHandler) -> Result<bool, HttpError> {
        self.state = State::End;
        handler.on_message_complete()?;
        Ok(true)
    }

    /// No progress is possible with the bytes at hand.
    fn need_more(&self, buf: &BytesMut) -> Result<bool, HttpError> {
        if !self.persistent {
            return Err(EARLY_EOF);
        }
        let in_line = matches!(
            self.state,
            State::Start | State::Headers | State::ChunkSize | State::ChunkTrailer
        );
        if in_line && buf.len() >= MAX_LINE {
            return Err(HttpError::new(431, "Request Header Fields Too Large"));
        }
        Ok(false)
    }
}

fn parse_request_line(line: &str) -> Result<(Method, &str, HttpVersion), HttpError> {
    let mut parts = line.split(' ');
    let method = parts.next().unwrap_or("");
    let target = parts
        .next()
        .ok_or(HttpError::bad_request("Bad Request"))?;
    let version = parts
        .next()
        .ok_or(HttpError::bad_request("Bad Request"))?;
    if parts.next().is_some() {
        return Err(HttpError::bad_request("Bad Request"));
    }

    if method.is_empty() || !method.bytes().all(is_tchar) {
        return Err(HttpError::bad_request("Bad Request"));
    }
    if target.is_empty() || !target.bytes().all(|b| (0x21..0x7f).contains(&b)) {
        return Err(HttpError::bad_request("Bad Request"));
    }
    let version = match version {
        "HTTP/1.1" => HttpVersion::Http11,
        "HTTP/1.0" => HttpVersion::Http10,
        v if v.starts_with("HTTP/") => {
            return Err(HttpError::new(505, "HTTP Version Not Supported"));
        }
        _ => return Err(HttpError::bad_request("Bad Request")),
    };

    Ok((Method::from_token(method), target, version))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Events {
        request_line: Option<(Method, String, HttpVersion)>,
        headers: Vec<(String, String)>,
        content: Vec<u8>,
        complete: usize,
    }

    impl RequestHandler for Events {
        fn on_request_line(
            &mut self,
            method: Method,
            target: &str,
            version: HttpVersion,
        ) -> Result<(), HttpError> {
            self.request_line = Some((method, target.to_string(), version));
            Ok(())
        }

        fn on_header(&mut self, name: &str, value: &str) -> Result<(), HttpError> {
            self.headers.push((name.to_string(), value.to_string()));
            Ok(())
        }

        fn on_headers_complete(&mut self) -> Result<(), HttpError> {
            Ok(())
        }

        fn on_content(&mut self, content: &[u8]) -> Result<(), HttpError> {
            self.content.extend_from_slice(content);
            Ok(())
        }

        fn on_message_complete(&mut self) -> Result<(), HttpError> {
            self.complete += 1;
            Ok(())
        }
    }

    fn buf(data: &[u8]) -> BytesMut {
        BytesMut::from(data)
    }

    #[test]
    fn simple_get() {
        let mut parser = HttpParser::new();
        let mut events = Events::default();
        let mut input = buf(b"GET /path HTTP/1.1\r\nHost: h\r\n\r\n");

        assert!(parser.parse_next(&mut input, &mut events).unwrap());
        assert!(parser.is_complete());
        assert!(input.is_empty());

        let (method, target, version) = events.request_line.unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(target, "/path");
        assert_eq!(version, HttpVersion::Http11);
        assert_eq!(events.headers, vec![("Host".to_string(), "h".to_string())]);
        assert_eq!(events.complete, 1);
    }

    #[test]
    fn incremental_delivery() {
        let mut parser = HttpParser::new();
        let mut events = Events::default();
        let mut input = buf(b"GET / HT");

        assert!(!parser.parse_next(&mut input, &mut events).unwrap());
        assert!(!parser.is_idle() || events.request_line.is_none());

        input.extend_from_slice(b"TP/1.1\r\nHost:");
        assert!(!parser.parse_next(&mut input, &mut events).unwrap());
        assert!(events.request_line.is_some());

        input.extend_from_slice(b" h\r\n\r\n");
        assert!(parser.parse_next(&mut input, &mut events).unwrap());
        assert_eq!(events.complete, 1);
    }

    #[test]
    fn content_length_body() {
        let mut parser = HttpParser::new();
        let mut events = Events::default();
        let mut input = buf(b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");

        assert!(parser.parse_next(&mut input, &mut events).unwrap());
        assert_eq!(events.content, b"hello");
    }

    #[test]
    fn chunked_body() {
        let mut parser = HttpParser::new();
        let mut events = Events::default();
        let mut input = buf(
            b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              3\r\nabc\r\n4;ext=1\r\ndefg\r\n0\r\n\r\n",
        );

        assert!(parser.parse_next(&mut input, &mut events).unwrap());
        assert_eq!(events.content, b"abcdefg");
        assert!(input.is_empty());
    }

    #[test]
    fn pipelined_requests_parse_after_reset() {
        let mut parser = HttpParser::new();
        let mut events = Events::default();
        let mut input = buf(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");

        assert!(parser.parse_next(&mut input, &mut events).unwrap());
        assert!(!input.is_empty());

        parser.reset();
        assert!(parser.is_idle());
        assert!(parser.parse_next(&mut input, &mut events).unwrap());
        assert_eq!(events.complete, 2);
        assert_eq!(events.request_line.unwrap().1, "/b");
    }

    #[test]
    fn bad_request_line_is_rejected() {
        let mut parser = HttpParser::new();
        let mut events = Events::default();
        let mut input = buf(b"NOTAMETHOD /\r\n\r\n");

        let err = parser.parse_next(&mut input, &mut events).unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut parser = HttpParser::new();
        let mut events = Events::default();
        let mut input = buf(b"GET / HTTP/2.0\r\n\r\n");

        let err = parser.parse_next(&mut input, &mut events).unwrap_err();
        assert_eq!(err.status, 505);
    }

    #[test]
    fn invalid_content_length_is_rejected() {
        let mut parser = HttpParser::new();
        let mut events = Events::default();
        let mut input = buf(b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n");

        let err = parser.parse_next(&mut input, &mut events).unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[test]
    fn early_eof_surfaces_when_non_persistent() {
        let mut parser = HttpParser::new();
        let mut events = Events::default();
        let mut input = buf(b"GET /a HTTP/1.1\r\n");

        assert!(!parser.parse_next(&mut input, &mut events).unwrap());
        assert!(!parser.is_idle());

        // The connection saw EOF and marked the parser non-persistent.
        parser.set_persistent(false);
        let err = parser.parse_next(&mut input, &mut events).unwrap_err();
        assert_eq!(err, EARLY_EOF);
    }

    #[test]
    fn non_persistent_parser_ignores_new_messages() {
        let mut parser = HttpParser::new();
        let mut events = Events::default();
        parser.set_persistent(false);
        let mut input = buf(b"GET / HTTP/1.1\r\n\r\n");
        assert!(!parser.parse_next(&mut input, &mut events).unwrap());
        assert!(events.request_line.is_none());
    }

    #[test]
    fn oversize_header_line_is_rejected() {
        let mut parser = HttpParser::new();
        let mut events = Events::default();
        let mut line = Vec::from(&b"GET / HTTP/1.1\r\nX-Big: "[..]);
        line.extend(std::iter::repeat(b'a').take(MAX_LINE));
        let mut input = BytesMut::from(&line[..]);

        let err = parser.parse_next(&mut input, &mut events).unwrap_err();
        assert_eq!(err.status, 431);
    }
}
