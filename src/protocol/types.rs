//! RESP (Redis Serialization Protocol) Data Types
//!
//! This module defines the reply tree the client decodes and the request side
//! of the wire codec: a command is always sent as an array of bulk strings
//! (command name followed by its arguments).
//!
//! ## Protocol Format
//!
//! Each RESP type starts with a type prefix byte:
//! - `+` Simple String
//! - `-` Error
//! - `:` Integer
//! - `$` Bulk String
//! - `*` Array
//!
//! All types are terminated with CRLF (`\r\n`).
//!
//! ## Examples
//!
//! Simple String: `+OK\r\n`
//! Error: `-ERR unknown command\r\n`
//! Integer: `:1000\r\n`
//! Bulk String: `$5\r\nhello\r\n`
//! Array: `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`
//! Null Bulk String: `$-1\r\n`
//! Null Array: `*-1\r\n`

use crate::protocol::output::Output;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A fully materialized reply.
///
/// Null bulk strings and null arrays are distinct absent-value markers; neither
/// is an empty container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+<string>\r\n`
    SimpleString(String),

    /// `-<error message>\r\n`
    Error(String),

    /// `:<integer>\r\n`
    Integer(i64),

    /// `$<length>\r\n<data>\r\n`
    BulkString(Bytes),

    /// `$-1\r\n`
    NullBulk,

    /// `*<count>\r\n<element1><element2>...`
    Array(Vec<RespValue>),

    /// `*-1\r\n`
    NullArray,
}

impl RespValue {
    /// Creates a new simple string value.
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Creates a new error value.
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    /// Creates a new bulk string value.
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Creates an array value.
    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// Common status reply for successful operations
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// Serializes the value to its wire format.
    ///
    /// The client never sends replies; this is what a server (or a test double
    /// standing in for one) writes back.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the value into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::NullBulk => buf.extend_from_slice(b"$-1\r\n"),
            RespValue::Array(values) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
            RespValue::NullArray => buf.extend_from_slice(b"*-1\r\n"),
        }
    }

    /// Replays this value into an output as the decoder would have.
    ///
    /// Used when a reply was parsed into a floating target first and only
    /// afterwards turned out to belong to a queued command.
    pub fn feed(&self, out: &mut dyn Output) {
        self.feed_at(out, 0);
    }

    fn feed_at(&self, out: &mut dyn Output, depth: usize) {
        match self {
            RespValue::SimpleString(s) => out.set_status(s.clone()),
            RespValue::Error(s) => out.set_error(s.clone()),
            RespValue::Integer(n) => out.set_integer(*n),
            RespValue::BulkString(data) => out.set_bulk(Some(data.clone())),
            RespValue::NullBulk => out.set_bulk(None),
            RespValue::NullArray => out.multi(None),
            RespValue::Array(values) => {
                out.multi(Some(values.len()));
                for value in values {
                    value.feed_at(out, depth + 1);
                }
            }
        }
        out.complete(depth);
    }

    /// Returns true if this value is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Attempts to extract the inner integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Attempts to extract the inner array.
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "{}", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "(binary data, {} bytes)", data.len())
                }
            }
            RespValue::NullBulk => write!(f, "(nil)"),
            RespValue::NullArray => write!(f, "(nil array)"),
            RespValue::Array(values) => {
                if values.is_empty() {
                    write!(f, "(empty array)")
                } else {
                    for (i, v) in values.iter().enumerate() {
                        if i > 0 {
                            writeln!(f)?;
                        }
                        write!(f, "{}) {}", i + 1, v)?;
                    }
                    Ok(())
                }
            }
        }
    }
}

/// Identifies the operation a command performs.
///
/// The pipeline only cares about a handful of tags (transactions and the
/// subscribe family); everything else travels as `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandType {
    Auth,
    Select,
    Multi,
    Exec,
    Discard,
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    /// Any other command, by its wire name.
    Other(&'static str),
}

impl CommandType {
    /// The command name as written on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            CommandType::Auth => "AUTH",
            CommandType::Select => "SELECT",
            CommandType::Multi => "MULTI",
            CommandType::Exec => "EXEC",
            CommandType::Discard => "DISCARD",
            CommandType::Subscribe => "SUBSCRIBE",
            CommandType::Unsubscribe => "UNSUBSCRIBE",
            CommandType::PSubscribe => "PSUBSCRIBE",
            CommandType::PUnsubscribe => "PUNSUBSCRIBE",
            CommandType::Other(name) => name,
        }
    }

    /// True for commands that switch the connection into subscribed mode or
    /// are answered with subscription confirmations.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            CommandType::Subscribe
                | CommandType::Unsubscribe
                | CommandType::PSubscribe
                | CommandType::PUnsubscribe
        )
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered argument bytes for one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandArgs {
    args: Vec<Bytes>,
}

impl CommandArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw argument bytes.
    pub fn add(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends an integer argument in its decimal form.
    pub fn add_int(self, n: i64) -> Self {
        self.add(n.to_string())
    }

    /// Appends every argument of an iterator.
    pub fn add_all<I, B>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.args.iter()
    }
}

/// Encodes a command as an array of bulk strings.
///
/// Total and pure: any command and argument list yields well-formed bytes.
pub fn encode_command(command: &CommandType, args: &CommandArgs) -> Bytes {
    let name = command.name().as_bytes();
    let payload: usize = args.iter().map(|a| a.len() + 16).sum();
    let mut buf = BytesMut::with_capacity(32 + name.len() + payload);

    buf.put_u8(prefix::ARRAY);
    buf.put_slice((args.len() + 1).to_string().as_bytes());
    buf.put_slice(CRLF);
    put_bulk(&mut buf, name);
    for arg in args.iter() {
        put_bulk(&mut buf, arg);
    }
    buf.freeze()
}

fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u8(prefix::BULK_STRING);
    buf.put_slice(data.len().to_string().as_bytes());
    buf.put_slice(CRLF);
    buf.put_slice(data);
    buf.put_slice(CRLF);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::output::{CommandOutput, RespOutput};

    #[test]
    fn test_encode_get() {
        let args = CommandArgs::new().add("name");
        let wire = encode_command(&CommandType::Other("GET"), &args);
        assert_eq!(&wire[..], b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
    }

    #[test]
    fn test_encode_no_args() {
        let wire = encode_command(&CommandType::Multi, &CommandArgs::new());
        assert_eq!(&wire[..], b"*1\r\n$5\r\nMULTI\r\n");
    }

    #[test]
    fn test_encode_binary_and_integer_args() {
        let args = CommandArgs::new().add(&b"k\x00\r\n"[..]).add_int(-42);
        let wire = encode_command(&CommandType::Other("SET"), &args);
        assert_eq!(
            &wire[..],
            b"*3\r\n$3\r\nSET\r\n$4\r\nk\x00\r\n\r\n$3\r\n-42\r\n"
        );
    }

    #[test]
    fn test_null_markers_are_distinct() {
        assert_eq!(RespValue::NullBulk.serialize(), b"$-1\r\n");
        assert_eq!(RespValue::NullArray.serialize(), b"*-1\r\n");
        assert_ne!(RespValue::NullBulk, RespValue::NullArray);
        assert_ne!(RespValue::NullArray, RespValue::Array(vec![]));
    }

    #[test]
    fn test_nested_array_serialize() {
        let value = RespValue::array(vec![
            RespValue::Integer(1),
            RespValue::array(vec![RespValue::Integer(2), RespValue::Integer(3)]),
        ]);
        assert_eq!(value.serialize(), b"*2\r\n:1\r\n*2\r\n:2\r\n:3\r\n");
    }

    #[test]
    fn test_feed_rebuilds_tree() {
        let value = RespValue::array(vec![
            RespValue::bulk_string("message"),
            RespValue::NullBulk,
            RespValue::array(vec![RespValue::Integer(7), RespValue::NullArray]),
            RespValue::error("ERR nested"),
        ]);
        let mut out = RespOutput::new();
        value.feed(&mut out);
        assert_eq!(out.finish().unwrap(), value);
    }

    #[test]
    fn test_subscription_tags() {
        assert!(CommandType::PSubscribe.is_subscription());
        assert!(!CommandType::Other("PUBLISH").is_subscription());
        assert_eq!(CommandType::PUnsubscribe.to_string(), "PUNSUBSCRIBE");
    }
}
