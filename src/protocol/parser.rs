//! Resumable RESP Reply Decoder
//!
//! The decoder walks a reply one element at a time and pushes every finished
//! element into an [`Output`]. When the buffer runs dry in the middle of a
//! reply it returns [`Progress::Incomplete`]; the caller appends more bytes
//! and calls again with the same output.
//!
//! ## How the Decoder Works
//!
//! - Each call parses elements from the front of the buffer.
//! - A fully parsed element is consumed from the buffer and delivered to the
//!   output at once, so a retry never re-parses it.
//! - A partially received element (a half-read length line or bulk payload)
//!   is left in the buffer untouched: the read position is rewound to its
//!   first byte.
//! - Open arrays are tracked on an explicit stack of remaining element
//!   counts, which is the only state the decoder keeps between calls.
//! - Grammar violations return a [`ParseError`]. The stream is then out of
//!   sync; the connection must be dropped, not the bytes skipped.

use crate::protocol::output::Output;
use crate::protocol::types::{prefix, CRLF};
use bytes::{Buf, Bytes, BytesMut};
use std::num::ParseIntError;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// Invalid integer format
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string or error message
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative (but not -1 for null)
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Protocol violation (missing CRLF, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The message exceeds maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum element count of a single array reply
pub const MAX_ARRAY_LEN: usize = 128 * 1024 * 1024;

/// Maximum length of a status, error or length line (64 KB, same as Redis)
pub const MAX_LINE_SIZE: usize = 64 * 1024;

/// Maximum array nesting depth
pub const MAX_NESTING_DEPTH: usize = 32;

/// Outcome of one [`ReplyDecoder::decode`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The reply is complete; this call consumed that many bytes.
    Complete(usize),
    /// More bytes are needed. Consumed elements are already in the output.
    Incomplete,
}

/// One element header or scalar as it appears on the wire.
#[derive(Debug)]
enum Item {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<usize>),
}

/// A resumable reply decoder.
///
/// # Example
///
/// ```
/// use flashkv_client::protocol::{CommandOutput, Progress, ReplyDecoder, RespOutput, RespValue};
/// use bytes::BytesMut;
///
/// let mut decoder = ReplyDecoder::new();
/// let mut out = RespOutput::new();
/// let mut buf = BytesMut::from(&b"*2\r\n:1\r\n$3\r\nfo"[..]);
///
/// assert_eq!(decoder.decode(&mut buf, &mut out).unwrap(), Progress::Incomplete);
/// buf.extend_from_slice(b"o\r\n");
/// assert!(matches!(decoder.decode(&mut buf, &mut out).unwrap(), Progress::Complete(_)));
/// assert_eq!(
///     out.finish().unwrap(),
///     RespValue::array(vec![RespValue::Integer(1), RespValue::bulk_string("foo")])
/// );
/// ```
#[derive(Debug, Default)]
pub struct ReplyDecoder {
    /// Remaining element counts of the arrays currently open.
    stack: Vec<usize>,
}

impl ReplyDecoder {
    /// Creates a new decoder instance.
    pub fn new() -> Self {
        Self { stack: Vec::new() }
    }

    /// Returns true if a reply has been started but not finished.
    pub fn in_progress(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Forgets any partially decoded reply.
    pub fn reset(&mut self) {
        self.stack.clear();
    }

    /// Decodes as much of one reply from `buf` into `out` as is available.
    pub fn decode(&mut self, buf: &mut BytesMut, out: &mut dyn Output) -> ParseResult<Progress> {
        let mut consumed = 0;

        loop {
            let (item, len) = match parse_item(&buf[..])? {
                Some(parsed) => parsed,
                None => return Ok(Progress::Incomplete),
            };
            buf.advance(len);
            consumed += len;

            match item {
                Item::Status(s) => out.set_status(s),
                Item::Error(s) => out.set_error(s),
                Item::Integer(n) => out.set_integer(n),
                Item::Bulk(data) => out.set_bulk(data),
                Item::Array(Some(n)) if n > 0 => {
                    if self.stack.len() >= MAX_NESTING_DEPTH {
                        return Err(ParseError::ProtocolError(format!(
                            "maximum nesting depth exceeded: {}",
                            MAX_NESTING_DEPTH
                        )));
                    }
                    out.multi(Some(n));
                    self.stack.push(n);
                    continue;
                }
                Item::Array(len) => out.multi(len),
            }

            // A value just finished at the current depth; close every array
            // it was the last element of.
            out.complete(self.stack.len());
            loop {
                match self.stack.last_mut() {
                    None => return Ok(Progress::Complete(consumed)),
                    Some(remaining) => {
                        *remaining -= 1;
                        if *remaining > 0 {
                            break;
                        }
                    }
                }
                self.stack.pop();
                out.complete(self.stack.len());
            }
        }
    }
}

/// Parses one element header or scalar from the front of `buf`.
///
/// Returns `Ok(None)` when the element is not fully buffered yet.
fn parse_item(buf: &[u8]) -> ParseResult<Option<(Item, usize)>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    // The terminator is only looked for within the line limit.
    let window = &buf[1..buf.len().min(MAX_LINE_SIZE + 3)];
    let Some(line_end) = find_crlf(window) else {
        if window.len() > MAX_LINE_SIZE + 1 {
            return Err(ParseError::MessageTooLarge {
                size: window.len(),
                max: MAX_LINE_SIZE,
            });
        }
        return Ok(None);
    };
    let line = &buf[1..1 + line_end];
    // prefix + line + CRLF
    let header_len = 1 + line_end + 2;

    match first {
        prefix::SIMPLE_STRING => Ok(Some((Item::Status(utf8(line)?), header_len))),
        prefix::ERROR => Ok(Some((Item::Error(utf8(line)?), header_len))),
        prefix::INTEGER => Ok(Some((Item::Integer(integer(line)?), header_len))),
        prefix::BULK_STRING => parse_bulk(buf, line, header_len),
        prefix::ARRAY => {
            let count = integer(line)?;
            match count {
                -1 => Ok(Some((Item::Array(None), header_len))),
                n if n < 0 => Err(ParseError::InvalidArrayLength(n)),
                n if n as u64 > MAX_ARRAY_LEN as u64 => Err(ParseError::MessageTooLarge {
                    size: usize::try_from(n).unwrap_or(usize::MAX),
                    max: MAX_ARRAY_LEN,
                }),
                n => Ok(Some((Item::Array(Some(n as usize)), header_len))),
            }
        }
        other => Err(ParseError::UnknownPrefix(other)),
    }
}

/// Parses a bulk string body once its `$<length>` line is known.
fn parse_bulk(buf: &[u8], line: &[u8], header_len: usize) -> ParseResult<Option<(Item, usize)>> {
    let length = integer(line)?;

    if length == -1 {
        return Ok(Some((Item::Bulk(None), header_len)));
    }
    if length < 0 {
        return Err(ParseError::InvalidBulkLength(length));
    }

    let length = length as usize;
    if length > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }

    let total_needed = header_len + length + 2;
    if buf.len() < total_needed {
        return Ok(None);
    }

    if &buf[header_len + length..total_needed] != CRLF {
        return Err(ParseError::ProtocolError(
            "bulk string missing trailing CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&buf[header_len..header_len + length]);
    Ok(Some((Item::Bulk(Some(data)), total_needed)))
}

fn utf8(line: &[u8]) -> ParseResult<String> {
    std::str::from_utf8(line)
        .map(str::to_string)
        .map_err(|e| ParseError::InvalidUtf8(e.to_string()))
}

fn integer(line: &[u8]) -> ParseResult<i64> {
    let s = std::str::from_utf8(line).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
    s.parse()
        .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}
