//! Streaming framer for multi-bulk client requests.
//!
//! [`RequestReader`] is an explicit state machine over the incoming byte
//! stream: argument count, argument length, argument body, argument
//! trailer. It consumes whatever complete pieces sit in the buffer and
//! reports "need more bytes" otherwise, so a caller can drive it from any
//! chunked transport. Argument bodies are length-delimited and may contain
//! CR, LF or NUL bytes.

use bytes::{Buf, Bytes, BytesMut};

/// One parsed client request.
///
/// The first element is the command token; an argument transmitted with a
/// negative bulk length is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Request {
    parts: Vec<Option<Bytes>>,
}

impl Request {
    pub fn new(parts: Vec<Option<Bytes>>) -> Self {
        Request { parts }
    }

    /// The command token, unless the request is empty or the token itself
    /// was transmitted as a null bulk.
    pub fn command(&self) -> Option<&Bytes> {
        self.parts.first().and_then(Option::as_ref)
    }

    /// Everything after the command token.
    pub fn arguments(&self) -> &[Option<Bytes>] {
        self.parts.get(1..).unwrap_or_default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Framing failure. Fatal for the connection: the handler sends the carried
/// message as an error reply and closes the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The request did not open with a parseable `*<count>` line.
    #[error("ERR *<number of arguments> CR LF is expected.")]
    BadArgumentCount,
    /// An argument did not open with a parseable `$<length>` line.
    #[error("ERR $<number of bytes of argument> CR LF is expected.")]
    BadArgumentLength,
}

impl FrameError {
    /// The exact error-reply payload for this failure.
    pub fn message(&self) -> &'static str {
        match self {
            FrameError::BadArgumentCount => "ERR *<number of arguments> CR LF is expected.",
            FrameError::BadArgumentLength => "ERR $<number of bytes of argument> CR LF is expected.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ArgumentCount,
    ArgumentLength,
    ArgumentBody { length: usize },
    ArgumentTrailer,
}

/// Streaming request reader; one per client connection.
#[derive(Debug)]
pub struct RequestReader {
    state: State,
    remaining: usize,
    parts: Vec<Option<Bytes>>,
}

impl Default for RequestReader {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestReader {
    pub fn new() -> Self {
        RequestReader {
            state: State::ArgumentCount,
            remaining: 0,
            parts: Vec::new(),
        }
    }

    /// Consumes as much of `buf` as possible.
    ///
    /// Returns a complete request once all of its arguments have arrived,
    /// or `None` when the buffer ran dry mid-frame. Requests with a
    /// non-positive argument count are completed silently and skipped.
    pub fn feed(&mut self, buf: &mut BytesMut) -> Result<Option<Request>, FrameError> {
        loop {
            match self.state {
                State::ArgumentCount => {
                    let Some(line) = take_line(buf) else {
                        return Ok(None);
                    };
                    let count = parse_marked(&line, b'*').ok_or(FrameError::BadArgumentCount)?;
                    if count <= 0 {
                        // An empty request carries nothing to dispatch.
                        continue;
                    }
                    self.remaining = count as usize;
                    self.parts = Vec::with_capacity(self.remaining);
                    self.state = State::ArgumentLength;
                }
                State::ArgumentLength => {
                    let Some(line) = take_line(buf) else {
                        return Ok(None);
                    };
                    let length = parse_marked(&line, b'$').ok_or(FrameError::BadArgumentLength)?;
                    if length < 0 {
                        self.parts.push(None);
                        self.state = State::ArgumentTrailer;
                    } else {
                        self.state = State::ArgumentBody {
                            length: length as usize,
                        };
                    }
                }
                State::ArgumentBody { length } => {
                    if buf.len() < length {
                        return Ok(None);
                    }
                    let body = buf.split_to(length).freeze();
                    self.parts.push(Some(body));
                    self.state = State::ArgumentTrailer;
                }
                State::ArgumentTrailer => {
                    // Discard through the CRLF that closes the argument.
                    if take_line(buf).is_none() {
                        return Ok(None);
                    }
                    self.remaining -= 1;
                    if self.remaining == 0 {
                        self.state = State::ArgumentCount;
                        let parts = std::mem::take(&mut self.parts);
                        return Ok(Some(Request::new(parts)));
                    }
                    self.state = State::ArgumentLength;
                }
            }
        }
    }
}

/// Splits off everything up to the next CRLF, consuming the CRLF as well.
fn take_line(buf: &mut BytesMut) -> Option<Bytes> {
    let end = buf.windows(2).position(|pair| pair == b"\r\n")?;
    let line = buf.split_to(end).freeze();
    buf.advance(2);
    Some(line)
}

fn parse_marked(line: &[u8], marker: u8) -> Option<i64> {
    let rest = line.strip_prefix(&[marker])?;
    std::str::from_utf8(rest).ok()?.trim().parse().ok()
}
