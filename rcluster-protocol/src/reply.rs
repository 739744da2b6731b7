//! RESP2 reply values and their wire codec.
//!
//! A [`Reply`] is one of the five RESP2 reply kinds (plus the null bulk),
//! paired with a close-after-send flag used by QUIT and by fatal framing
//! errors. Encoding is bit-exact RESP2; [`Reply::parse`] is the inverse of
//! [`Reply::encode`] on well-formed input.

use bytes::{Buf, Bytes, BytesMut};

/// The tagged wire value of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    /// `+<data>\r\n`
    Status(Bytes),
    /// `-<data>\r\n`
    Error(Bytes),
    /// `:<decimal>\r\n`
    Integer(i64),
    /// `$<len>\r\n<data>\r\n`, len ≥ 0
    Bulk(Bytes),
    /// `$-1\r\n`
    Null,
    /// `*<n>\r\n` followed by n encoded replies
    MultiBulk(Vec<Reply>),
}

/// A single reply to a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    kind: ReplyKind,
    close_stream: bool,
}

impl Reply {
    /// Status reply, `+<data>`.
    pub fn status(data: impl Into<Bytes>) -> Self {
        ReplyKind::Status(data.into()).into()
    }

    /// Error reply, `-<data>`.
    pub fn error(data: impl Into<Bytes>) -> Self {
        ReplyKind::Error(data.into()).into()
    }

    /// Integer reply, `:<value>`.
    pub fn integer(value: i64) -> Self {
        ReplyKind::Integer(value).into()
    }

    /// Bulk reply carrying arbitrary bytes.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        ReplyKind::Bulk(data.into()).into()
    }

    /// The null bulk, `$-1`.
    pub fn null() -> Self {
        ReplyKind::Null.into()
    }

    /// Multi-bulk reply of nested replies.
    pub fn multi_bulk(replies: Vec<Reply>) -> Self {
        ReplyKind::MultiBulk(replies).into()
    }

    /// Marks the reply as the last one on its connection: the stream is
    /// closed once the encoded bytes have been flushed.
    #[must_use]
    pub fn close_after_send(mut self) -> Self {
        self.close_stream = true;
        self
    }

    /// Whether the connection closes after this reply is flushed.
    #[inline]
    pub fn closes_stream(&self) -> bool {
        self.close_stream
    }

    /// The tagged wire value.
    #[inline]
    pub fn kind(&self) -> &ReplyKind {
        &self.kind
    }

    /// Appends the RESP2 encoding of this reply to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match &self.kind {
            ReplyKind::Status(data) => encode_line(buf, b'+', data),
            ReplyKind::Error(data) => encode_line(buf, b'-', data),
            ReplyKind::Integer(value) => {
                buf.extend_from_slice(b":");
                buf.extend_from_slice(value.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            ReplyKind::Bulk(data) => {
                buf.extend_from_slice(b"$");
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            ReplyKind::Null => buf.extend_from_slice(b"$-1\r\n"),
            ReplyKind::MultiBulk(replies) => {
                buf.extend_from_slice(b"*");
                buf.extend_from_slice(replies.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for reply in replies {
                    reply.encode(buf);
                }
            }
        }
    }

    /// The RESP2 encoding of this reply as a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes one reply from the front of `input`, returning it together
    /// with the number of bytes consumed.
    ///
    /// A bulk of negative length decodes to [`ReplyKind::Null`]; so does a
    /// multi-bulk of negative count.
    pub fn parse(input: &[u8]) -> Result<(Reply, usize), ParseError> {
        let mut cursor = &input[..];
        let reply = parse_reply(&mut cursor)?;
        Ok((reply, input.len() - cursor.len()))
    }
}

impl From<ReplyKind> for Reply {
    fn from(kind: ReplyKind) -> Self {
        Reply {
            kind,
            close_stream: false,
        }
    }
}

fn encode_line(buf: &mut BytesMut, marker: u8, data: &[u8]) {
    buf.extend_from_slice(&[marker]);
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

/// Reply decoding failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The input ends before the reply does.
    #[error("unexpected end of reply input")]
    Incomplete,
    /// The leading marker byte is not one of `+ - : $ *`.
    #[error("invalid reply marker {0:#04x}")]
    BadMarker(u8),
    /// A decimal field (integer reply, length, count) failed to parse.
    #[error("invalid decimal field in reply")]
    BadDecimal,
    /// A bulk body was not terminated by CRLF.
    #[error("missing bulk terminator")]
    BadTerminator,
}

fn parse_reply(cursor: &mut &[u8]) -> Result<Reply, ParseError> {
    let marker = *cursor.first().ok_or(ParseError::Incomplete)?;
    cursor.advance(1);
    match marker {
        b'+' => Ok(Reply::status(take_line(cursor)?)),
        b'-' => Ok(Reply::error(take_line(cursor)?)),
        b':' => Ok(Reply::integer(parse_decimal(&take_line(cursor)?)?)),
        b'$' => {
            let length = parse_decimal(&take_line(cursor)?)?;
            if length < 0 {
                return Ok(Reply::null());
            }
            let length = length as usize;
            if cursor.len() < length + 2 {
                return Err(ParseError::Incomplete);
            }
            let data = Bytes::copy_from_slice(&cursor[..length]);
            if &cursor[length..length + 2] != b"\r\n" {
                return Err(ParseError::BadTerminator);
            }
            cursor.advance(length + 2);
            Ok(Reply::bulk(data))
        }
        b'*' => {
            let count = parse_decimal(&take_line(cursor)?)?;
            if count < 0 {
                return Ok(Reply::null());
            }
            let mut replies = Vec::with_capacity(count as usize);
            for _ in 0..count {
                replies.push(parse_reply(cursor)?);
            }
            Ok(Reply::multi_bulk(replies))
        }
        other => Err(ParseError::BadMarker(other)),
    }
}

fn take_line(cursor: &mut &[u8]) -> Result<Bytes, ParseError> {
    let end = cursor
        .windows(2)
        .position(|pair| pair == b"\r\n")
        .ok_or(ParseError::Incomplete)?;
    let line = Bytes::copy_from_slice(&cursor[..end]);
    cursor.advance(end + 2);
    Ok(line)
}

fn parse_decimal(line: &[u8]) -> Result<i64, ParseError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or(ParseError::BadDecimal)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_encode_status() {
        assert_eq!(b"+OK\r\n".as_slice(), &Reply::status("OK").to_bytes()[..]);
    }

    #[test]
    fn test_encode_error() {
        assert_eq!(b"-ERR\r\n".as_slice(), &Reply::error("ERR").to_bytes()[..]);
    }

    #[test]
    fn test_encode_integer() {
        assert_eq!(b":1000\r\n".as_slice(), &Reply::integer(1000).to_bytes()[..]);
        assert_eq!(b":-1\r\n".as_slice(), &Reply::integer(-1).to_bytes()[..]);
    }

    #[test]
    fn test_encode_bulk() {
        assert_eq!(
            b"$6\r\nfoobar\r\n".as_slice(),
            &Reply::bulk("foobar").to_bytes()[..]
        );
    }

    #[test]
    fn test_encode_empty_bulk() {
        assert_eq!(b"$0\r\n\r\n".as_slice(), &Reply::bulk("").to_bytes()[..]);
    }

    #[test]
    fn test_encode_null() {
        assert_eq!(b"$-1\r\n".as_slice(), &Reply::null().to_bytes()[..]);
    }

    #[test]
    fn test_encode_multi_bulk() {
        let reply = Reply::multi_bulk(vec![
            Reply::bulk("foo"),
            Reply::bulk("bar"),
            Reply::bulk("Hello"),
            Reply::bulk("World"),
        ]);
        assert_eq!(
            b"*4\r\n$3\r\nfoo\r\n$3\r\nbar\r\n$5\r\nHello\r\n$5\r\nWorld\r\n".as_slice(),
            &reply.to_bytes()[..]
        );
    }

    #[test]
    fn test_parse_status() {
        let (reply, consumed) = Reply::parse(b"+OK Hello World\r\n").unwrap();
        assert_eq!(reply, Reply::status("OK Hello World"));
        assert_eq!(consumed, 17);
    }

    #[test]
    fn test_parse_error() {
        let (reply, _) = Reply::parse(b"-ERR Hello World\r\n").unwrap();
        assert_eq!(reply, Reply::error("ERR Hello World"));
    }

    #[test]
    fn test_parse_integer() {
        let (reply, _) = Reply::parse(b":12345\r\n").unwrap();
        assert_eq!(reply, Reply::integer(12345));
    }

    #[test]
    fn test_parse_trailing_bytes_left_alone() {
        let (reply, consumed) = Reply::parse(b"+PONG\r\n:1\r\n").unwrap();
        assert_eq!(reply, Reply::status("PONG"));
        assert_eq!(consumed, 7);
    }

    #[test]
    fn test_parse_incomplete() {
        assert_eq!(Reply::parse(b"$6\r\nfoo").unwrap_err(), ParseError::Incomplete);
        assert_eq!(Reply::parse(b"*2\r\n+OK\r\n").unwrap_err(), ParseError::Incomplete);
    }

    #[test]
    fn test_parse_bad_marker() {
        assert_eq!(Reply::parse(b"?\r\n").unwrap_err(), ParseError::BadMarker(b'?'));
    }

    #[test]
    fn test_round_trip_all_kinds() {
        let replies = [
            Reply::status("OK Bye!"),
            Reply::error("ERR Unknown command: FOO"),
            Reply::integer(-42),
            Reply::bulk(Bytes::from_static(b"bin\r\n\x00ary")),
            Reply::null(),
            Reply::multi_bulk(vec![
                Reply::bulk("1369405000"),
                Reply::integer(7),
                Reply::null(),
                Reply::multi_bulk(vec![Reply::status("nested")]),
            ]),
        ];
        for reply in replies {
            let encoded = reply.to_bytes();
            let (parsed, consumed) = Reply::parse(&encoded).unwrap();
            assert_eq!(parsed, reply);
            assert_eq!(consumed, encoded.len());
        }
    }
}
