//! Step state machine serializing HTTP/1.x responses.
//!
//! The connection drives the generator one step at a time: each call either
//! asks for a resource (header, body, or chunk buffer), hands back a flush
//! request, or reports that the action finished. Framing rules: a known
//! content length is emitted as-is; an unknown length at COMPLETE of an
//! uncommitted response is materialized from the aggregated body; an
//! unknown length on a committed streaming response uses chunked
//! transfer-encoding when HTTP/1.1 and persistent, else an EOF-delimited
//! body with `Connection: close` and an output shutdown at completion.
//!
//! Chunk frames are written into the chunk buffer, except the first, which
//! rides the tail of the header buffer so the header and the first body
//! bytes leave in one gather write. Each frame carries the terminating CRLF
//! of the chunk before it.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::request::HttpVersion;
use crate::response::{reason_phrase, ResponseInfo};

/// Size hint for chunk buffers: a CRLF, eight hex digits, and a CRLF.
pub const CHUNK_SIZE: usize = 12;

/// What the caller wants from this generate step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Accept content into the response.
    Prepare,
    /// Push everything buffered to the wire.
    Flush,
    /// Finish the response.
    Complete,
}

/// What the generator needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    NeedHeader,
    NeedBuffer,
    NeedChunk,
    Flush,
    FlushContent,
    ShutdownOut,
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Committed,
    Completing,
    End,
}

/// Response serializer state machine.
pub struct HttpGenerator {
    state: State,
    persistent: bool,
    chunking: bool,
    head: bool,
    content_length: i64,
    content_prepared: u64,
    /// An open chunk needs its terminating CRLF before the next frame.
    need_crlf: bool,
    trailer_written: bool,
    shutdown_sent: bool,
}

impl Default for HttpGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpGenerator {
    pub fn new() -> Self {
        HttpGenerator {
            state: State::Start,
            persistent: true,
            chunking: false,
            head: false,
            content_length: -1,
            content_prepared: 0,
            need_crlf: false,
            trailer_written: false,
            shutdown_sent: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Start && self.content_prepared == 0
    }

    pub fn is_committed(&self) -> bool {
        self.state != State::Start
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::End
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    /// Total bytes accepted from caller content buffers.
    pub fn content_prepared(&self) -> u64 {
        self.content_prepared
    }

    /// Make the generator idle again for the next response.
    pub fn reset(&mut self) {
        *self = HttpGenerator::new();
    }

    /// Advance the response one step. Buffer arguments are the connection's
    /// slots; `content` is the caller-owned body buffer.
    pub fn generate(
        &mut self,
        info: &ResponseInfo<'_>,
        header: Option<&mut BytesMut>,
        chunk: Option<&mut BytesMut>,
        buffer: Option<&mut BytesMut>,
        content: Option<&mut Bytes>,
        action: Action,
    ) -> Result<Step> {
        match self.state {
            State::Start => self.generate_start(info, header, buffer, content, action),
            State::Committed => self.generate_committed(info, header, chunk, buffer, content, action),
            State::Completing => self.generate_completing(chunk),
            State::End => Err(Error::Io(selwire::Error::Eof)),
        }
    }

    fn generate_start(
        &mut self,
        info: &ResponseInfo<'_>,
        header: Option<&mut BytesMut>,
        mut buffer: Option<&mut BytesMut>,
        mut content: Option<&mut Bytes>,
        action: Action,
    ) -> Result<Step> {
        // Aggregate caller content ahead of the commit.
        if content_remaining(&content) > 0 {
            if info.head {
                self.consume_suppressed(&mut content);
            } else {
                let Some(buf) = buffer.as_deref_mut() else {
                    return Ok(Step::NeedBuffer);
                };
                self.aggregate(buf, &mut content);
                if content_remaining(&content) > 0 {
                    // Buffer full: commit and stream the rest.
                    return self.commit(info, header, buffer.as_deref(), true);
                }
            }
        }

        match action {
            Action::Prepare => Ok(Step::Ok),
            Action::Flush => self.commit(info, header, buffer.as_deref(), true),
            Action::Complete => self.commit(info, header, buffer.as_deref(), false),
        }
    }

    fn generate_committed(
        &mut self,
        info: &ResponseInfo<'_>,
        _header: Option<&mut BytesMut>,
        chunk: Option<&mut BytesMut>,
        mut buffer: Option<&mut BytesMut>,
        mut content: Option<&mut Bytes>,
        action: Action,
    ) -> Result<Step> {
        if content_remaining(&content) > 0 {
            if self.head {
                self.consume_suppressed(&mut content);
                return Ok(Step::Ok);
            }

            let pass_through = match buffer.as_deref() {
                Some(buf) => buf.is_empty() && content_remaining(&content) >= buf.capacity(),
                None => true,
            };
            if pass_through {
                if self.chunking {
                    let Some(ch) = chunk else {
                        return Ok(Step::NeedChunk);
                    };
                    let len = content_remaining(&content);
                    self.write_chunk_frame(ch, len);
                }
                self.content_prepared += content_remaining(&content) as u64;
                return Ok(Step::FlushContent);
            }

            // Not pass-through, so a buffer with space is present.
            let mut full = false;
            if let Some(buf) = buffer.as_deref_mut() {
                self.aggregate(buf, &mut content);
                full = buf.len() == buf.capacity();
            }
            if full {
                return self.flush_buffer(chunk, buffer.as_deref_mut());
            }
            if content_remaining(&content) > 0 {
                return Ok(Step::Ok);
            }
        }

        match action {
            Action::Prepare => Ok(Step::Ok),
            Action::Flush => {
                if buffer.as_deref().is_some_and(|b| !b.is_empty()) {
                    self.flush_buffer(chunk, buffer.as_deref_mut())
                } else {
                    Ok(Step::Ok)
                }
            }
            Action::Complete => {
                if buffer.as_deref().is_some_and(|b| !b.is_empty()) {
                    self.flush_buffer(chunk, buffer.as_deref_mut())
                } else {
                    self.state = State::Completing;
                    self.generate_completing(chunk)
                }
            }
        }
    }

    fn generate_completing(&mut self, mut chunk: Option<&mut BytesMut>) -> Result<Step> {
        if self.chunking && !self.trailer_written {
            let Some(ch) = chunk.as_deref_mut() else {
                return Ok(Step::NeedChunk);
            };
            if self.need_crlf {
                ch.extend_from_slice(b"\r\n");
                self.need_crlf = false;
            }
            ch.extend_from_slice(b"0\r\n\r\n");
            self.trailer_written = true;
            return Ok(Step::Flush);
        }
        if !self.persistent && !self.shutdown_sent {
            self.shutdown_sent = true;
            self.state = State::End;
            return Ok(Step::ShutdownOut);
        }
        self.state = State::End;
        Ok(Step::Ok)
    }

    /// Write the header block. Called once; decides the body framing.
    fn commit(
        &mut self,
        info: &ResponseInfo<'_>,
        header: Option<&mut BytesMut>,
        buffer: Option<&BytesMut>,
        streaming: bool,
    ) -> Result<Step> {
        let Some(h) = header else {
            return Ok(Step::NeedHeader);
        };

        self.head = info.head;
        let status = info.status;
        let no_body = status < 200 || status == 204 || status == 304;
        let buffered = buffer.map_or(0, |b| b.len());

        let mut content_length = info.content_length;
        if no_body {
            self.chunking = false;
            content_length = -1;
        } else if content_length < 0 {
            if streaming {
                if self.persistent && info.version == HttpVersion::Http11 {
                    self.chunking = true;
                } else {
                    // EOF-delimited body.
                    self.persistent = false;
                }
            } else {
                content_length = if self.head {
                    self.content_prepared as i64
                } else {
                    buffered as i64
                };
            }
        }
        self.content_length = content_length;

        // Status line.
        h.extend_from_slice(info.version.as_str().as_bytes());
        h.extend_from_slice(b" ");
        h.extend_from_slice(itoa(status as u64).as_bytes());
        h.extend_from_slice(b" ");
        let reason = match info.reason {
            Some(r) if !r.is_empty() => r,
            _ => reason_phrase(status),
        };
        h.extend_from_slice(reason.as_bytes());
        h.extend_from_slice(b"\r\n");

        // Handler-supplied fields.
        for (name, value) in info.fields.iter() {
            h.extend_from_slice(name.as_bytes());
            h.extend_from_slice(b": ");
            h.extend_from_slice(value.as_bytes());
            h.extend_from_slice(b"\r\n");
        }

        // Framing.
        if !no_body {
            if self.chunking {
                h.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
            } else if content_length >= 0 && !info.fields.contains("content-length") {
                h.extend_from_slice(b"Content-Length: ");
                h.extend_from_slice(itoa(content_length as u64).as_bytes());
                h.extend_from_slice(b"\r\n");
            }
        }
        if !self.persistent && !info.fields.contains("connection") {
            h.extend_from_slice(b"Connection: close\r\n");
        }
        h.extend_from_slice(b"\r\n");

        self.state = State::Committed;

        // The first chunk frame rides the header so header plus first body
        // bytes leave in a single gather write.
        if self.chunking && buffered > 0 {
            self.write_chunk_frame(h, buffered);
        }

        Ok(Step::Flush)
    }

    /// Frame buffered body bytes for flushing: chunked responses need a
    /// chunk-size frame first.
    fn flush_buffer(
        &mut self,
        chunk: Option<&mut BytesMut>,
        buffer: Option<&mut BytesMut>,
    ) -> Result<Step> {
        if self.chunking {
            let Some(ch) = chunk else {
                return Ok(Step::NeedChunk);
            };
            let len = buffer.map_or(0, |b| b.len());
            self.write_chunk_frame(ch, len);
        }
        Ok(Step::Flush)
    }

    fn write_chunk_frame(&mut self, out: &mut BytesMut, len: usize) {
        if self.need_crlf {
            out.extend_from_slice(b"\r\n");
        }
        let mut hex = [0u8; 16];
        let mut i = hex.len();
        let mut v = len;
        loop {
            i -= 1;
            hex[i] = b"0123456789abcdef"[v & 0xf];
            v >>= 4;
            if v == 0 {
                break;
            }
        }
        out.extend_from_slice(&hex[i..]);
        out.extend_from_slice(b"\r\n");
        self.need_crlf = true;
    }

    fn aggregate(&mut self, buf: &mut BytesMut, content: &mut Option<&mut Bytes>) {
        let c = match content.as_deref_mut() {
            Some(c) => c,
            None => return,
        };
        let space = buf.capacity() - buf.len();
        let n = space.min(c.len());
        if n > 0 {
            buf.extend_from_slice(&c.chunk()[..n]);
            c.advance(n);
            self.content_prepared += n as u64;
        }
    }

    /// HEAD responses account content without emitting it.
    fn consume_suppressed(&mut self, content: &mut Option<&mut Bytes>) {
        if let Some(c) = content.as_deref_mut() {
            let n = c.remaining();
            self.content_prepared += n as u64;
            c.advance(n);
        }
    }
}

fn content_remaining(content: &Option<&mut Bytes>) -> usize {
    content.as_deref().map_or(0, |c| c.len())
}

fn itoa(mut v: u64) -> String {
    // Small helper to keep the hot path free of format machinery.
    let mut out = [0u8; 20];
    let mut i = out.len();
    loop {
        i -= 1;
        out[i] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    String::from_utf8_lossy(&out[i..]).into_owned()
}
