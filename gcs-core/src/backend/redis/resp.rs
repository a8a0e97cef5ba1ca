//! RESP2 encoding and incremental parsing
//!
//! Only what a client needs: commands are always encoded as arrays of bulk
//! strings, and replies are parsed from a growing read buffer.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{GcsError, Result};

const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;
const MAX_ELEMENTS: usize = 1024 * 1024;
const MAX_NESTING_DEPTH: usize = 16;

/// A decoded RESP2 reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK
    SimpleString(String),
    /// -ERR message
    Error(String),
    /// :1000
    Integer(i64),
    /// $6 foobar
    BulkString(Bytes),
    /// *2 ...
    Array(Vec<RespValue>),
    /// $-1 or *-1
    Null,
}

impl RespValue {
    /// Turn an error reply into a backend error, passing everything else through
    pub fn into_result(self) -> Result<RespValue> {
        match self {
            RespValue::Error(message) => Err(GcsError::Backend { message }),
            other => Ok(other),
        }
    }

    pub fn into_integer(self) -> Result<i64> {
        match self.into_result()? {
            RespValue::Integer(n) => Ok(n),
            other => Err(unexpected("integer", &other)),
        }
    }

    pub fn into_optional_bytes(self) -> Result<Option<Bytes>> {
        match self.into_result()? {
            RespValue::Null => Ok(None),
            RespValue::BulkString(bytes) => Ok(Some(bytes)),
            other => Err(unexpected("bulk string", &other)),
        }
    }

    pub fn into_bytes_array(self) -> Result<Vec<Bytes>> {
        match self.into_result()? {
            RespValue::Null => Ok(Vec::new()),
            RespValue::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    RespValue::BulkString(bytes) => Ok(bytes),
                    other => Err(unexpected("bulk string", &other)),
                })
                .collect(),
            other => Err(unexpected("array", &other)),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(bytes) => Some(bytes),
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

fn unexpected(wanted: &str, got: &RespValue) -> GcsError {
    GcsError::InvalidMessage {
        reason: format!("expected {} reply, got {:?}", wanted, got),
    }
}

/// Outcome of trying to parse one value from the front of a buffer
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A complete value and the number of bytes it occupied
    Complete(RespValue, usize),
    /// More bytes are needed
    Incomplete,
    /// The stream is corrupt
    Invalid(String),
}

/// Encode a command as an array of bulk strings
pub fn encode_command(args: &[&[u8]], buf: &mut BytesMut) {
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
}

/// Parse one value from the front of `data`
pub fn parse(data: &[u8]) -> ParseResult {
    parse_value(data, 0)
}

fn parse_value(data: &[u8], depth: usize) -> ParseResult {
    if data.is_empty() {
        return ParseResult::Incomplete;
    }
    if depth > MAX_NESTING_DEPTH {
        return ParseResult::Invalid("maximum nesting depth exceeded".into());
    }

    let Some(line_end) = find_crlf(&data[1..]) else {
        return ParseResult::Incomplete;
    };
    let line = &data[1..1 + line_end];
    // prefix byte + line + CRLF
    let header_len = line_end + 3;

    match data[0] {
        b'+' => ParseResult::Complete(
            RespValue::SimpleString(String::from_utf8_lossy(line).into_owned()),
            header_len,
        ),
        b'-' => ParseResult::Complete(
            RespValue::Error(String::from_utf8_lossy(line).into_owned()),
            header_len,
        ),
        b':' => match parse_int(line) {
            Some(n) => ParseResult::Complete(RespValue::Integer(n), header_len),
            None => ParseResult::Invalid("invalid integer".into()),
        },
        b'$' => match parse_int(line) {
            Some(-1) => ParseResult::Complete(RespValue::Null, header_len),
            Some(len) if len >= 0 && (len as usize) <= MAX_BULK_SIZE => {
                let start = header_len;
                let end = start + len as usize;
                if data.len() < end + 2 {
                    return ParseResult::Incomplete;
                }
                if &data[end..end + 2] != b"\r\n" {
                    return ParseResult::Invalid("missing CRLF after bulk string".into());
                }
                ParseResult::Complete(
                    RespValue::BulkString(Bytes::copy_from_slice(&data[start..end])),
                    end + 2,
                )
            }
            _ => ParseResult::Invalid("invalid bulk string length".into()),
        },
        b'*' => match parse_int(line) {
            Some(-1) => ParseResult::Complete(RespValue::Null, header_len),
            Some(len) if len >= 0 && (len as usize) <= MAX_ELEMENTS => {
                let mut elements = Vec::with_capacity(len as usize);
                let mut offset = header_len;
                for _ in 0..len {
                    match parse_value(&data[offset..], depth + 1) {
                        ParseResult::Complete(value, consumed) => {
                            elements.push(value);
                            offset += consumed;
                        }
                        other => return other,
                    }
                }
                ParseResult::Complete(RespValue::Array(elements), offset)
            }
            _ => ParseResult::Invalid("invalid array length".into()),
        },
        other => ParseResult::Invalid(format!("unexpected type byte {:#04x}", other)),
    }
}

fn parse_int(line: &[u8]) -> Option<i64> {
    std::str::from_utf8(line).ok()?.parse().ok()
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// One TCP connection speaking RESP2
pub struct RespConnection {
    stream: TcpStream,
    endpoint: String,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl RespConnection {
    pub fn new(stream: TcpStream, endpoint: impl Into<String>) -> Self {
        Self {
            stream,
            endpoint: endpoint.into(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(1024),
        }
    }

    fn lost(&self, reason: impl std::fmt::Display) -> GcsError {
        GcsError::ConnectionLost {
            endpoint: self.endpoint.clone(),
            reason: reason.to_string(),
        }
    }

    /// Write a command without waiting for its reply
    pub async fn send(&mut self, args: &[&[u8]]) -> Result<()> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);
        if let Err(e) = self.stream.write_all(&self.write_buf).await {
            return Err(self.lost(e));
        }
        Ok(())
    }

    /// Read the next complete value.
    ///
    /// Cancel safe: partially received bytes stay buffered.
    pub async fn read_value(&mut self) -> Result<RespValue> {
        loop {
            match parse(&self.read_buf) {
                ParseResult::Complete(value, consumed) => {
                    self.read_buf.advance(consumed);
                    return Ok(value);
                }
                ParseResult::Invalid(reason) => {
                    return Err(GcsError::InvalidMessage { reason });
                }
                ParseResult::Incomplete => {}
            }
            match self.stream.read_buf(&mut self.read_buf).await {
                Ok(0) => return Err(self.lost("closed by peer")),
                Ok(_) => {}
                Err(e) => return Err(self.lost(e)),
            }
        }
    }

    /// Send a command and wait for its reply
    pub async fn request(&mut self, args: &[&[u8]]) -> Result<RespValue> {
        self.send(args).await?;
        self.read_value().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        let mut buf = BytesMut::new();
        encode_command(&[b"SET", b"key", b"value"], &mut buf);
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n");
    }

    #[test]
    fn test_parse_scalars() {
        assert_eq!(
            parse(b"+OK\r\n"),
            ParseResult::Complete(RespValue::SimpleString("OK".into()), 5)
        );
        assert_eq!(
            parse(b"-ERR unknown\r\n"),
            ParseResult::Complete(RespValue::Error("ERR unknown".into()), 14)
        );
        assert_eq!(parse(b":42\r\n"), ParseResult::Complete(RespValue::Integer(42), 5));
        assert_eq!(parse(b"$-1\r\n"), ParseResult::Complete(RespValue::Null, 5));
        assert_eq!(
            parse(b"$6\r\nfoobar\r\n"),
            ParseResult::Complete(RespValue::BulkString(Bytes::from_static(b"foobar")), 12)
        );
    }

    #[test]
    fn test_parse_pubsub_message() {
        let data = b"*3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$5\r\nhello\r\n:1\r\n";
        match parse(data) {
            ParseResult::Complete(RespValue::Array(items), consumed) => {
                assert_eq!(consumed, data.len() - 4);
                assert_eq!(items[0].as_bytes(), Some(&b"message"[..]));
                assert_eq!(items[2].as_bytes(), Some(&b"hello"[..]));
            }
            other => panic!("unexpected parse result {:?}", other),
        }
    }

    #[test]
    fn test_parse_incomplete_and_invalid() {
        assert_eq!(parse(b""), ParseResult::Incomplete);
        assert_eq!(parse(b"$6\r\nfoo"), ParseResult::Incomplete);
        assert_eq!(parse(b"*2\r\n:1\r\n"), ParseResult::Incomplete);
        assert!(matches!(parse(b"?what\r\n"), ParseResult::Invalid(_)));
        assert!(matches!(parse(b"$3\r\nfooXX"), ParseResult::Invalid(_)));
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(RespValue::Null.into_optional_bytes().unwrap(), None);
        assert_eq!(RespValue::Integer(3).into_integer().unwrap(), 3);
        assert!(RespValue::Error("ERR boom".into()).into_integer().is_err());
        assert!(RespValue::Integer(1).into_optional_bytes().is_err());
        assert_eq!(
            RespValue::Array(vec![RespValue::BulkString(Bytes::from_static(b"a"))])
                .into_bytes_array()
                .unwrap(),
            vec![Bytes::from_static(b"a")]
        );
    }

    #[tokio::test]
    async fn test_peer_close_is_connection_lost() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let stream = TcpStream::connect(&endpoint).await.unwrap();
        let mut conn = RespConnection::new(stream, endpoint.clone());
        server.await.unwrap();

        match conn.read_value().await {
            Err(GcsError::ConnectionLost { endpoint: lost, .. }) => assert_eq!(lost, endpoint),
            other => panic!("expected a lost connection, got {:?}", other),
        }
    }
}
