//! Decode Targets
//!
//! An [`Output`] is the sink the [`ReplyDecoder`](super::ReplyDecoder) pushes
//! parsed elements into, one event at a time. Because every fully parsed
//! element is handed over immediately, an output carries the partial progress
//! of a reply that spans several reads: "3 of 5 array elements seen" lives
//! here, not in the byte buffer.
//!
//! Event order for `*2\r\n:1\r\n$-1\r\n`:
//!
//! ```text
//! multi(Some(2))
//! set_integer(1)  complete(1)
//! set_bulk(None)  complete(1)
//! complete(0)
//! ```
//!
//! `complete(depth)` fires after every finished value; `depth` counts the
//! arrays enclosing it, so `complete(0)` marks the end of the whole reply.
//!
//! Setters default to ignoring the event. A [`CommandOutput`] that never
//! received the shape it needs reports that from [`CommandOutput::finish`].

use crate::codec::Codec;
use crate::error::{ClientError, Result};
use crate::protocol::types::RespValue;
use bytes::Bytes;
use std::sync::Arc;

/// Receives decode events for one reply.
pub trait Output: Send {
    fn set_status(&mut self, _status: String) {}

    fn set_error(&mut self, _message: String) {}

    fn set_integer(&mut self, _value: i64) {}

    /// `None` is the null bulk string.
    fn set_bulk(&mut self, _data: Option<Bytes>) {}

    /// An array header. `None` is the null array.
    fn multi(&mut self, _len: Option<usize>) {}

    fn complete(&mut self, _depth: usize) {}

    /// Drops any partial progress so the reply can be decoded again from its
    /// first byte.
    fn reset(&mut self);
}

/// An output that materializes a typed value once its reply is complete.
pub trait CommandOutput: Output + 'static {
    type Value: Send + 'static;

    /// Takes the decoded value out of the output.
    fn finish(&mut self) -> Result<Self::Value>;
}

/// Upper bound on capacity reserved from an array header before any element
/// has arrived.
const PREALLOCATE_LIMIT: usize = 1024;

fn shape_mismatch(expected: &str) -> ClientError {
    ClientError::usage(format!("reply did not contain {}", expected))
}

/// Status reply such as `+OK`.
#[derive(Debug, Default)]
pub struct StatusOutput {
    value: Option<String>,
}

impl StatusOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Output for StatusOutput {
    fn set_status(&mut self, status: String) {
        self.value = Some(status);
    }

    fn set_bulk(&mut self, data: Option<Bytes>) {
        if let Some(data) = data {
            self.value = Some(String::from_utf8_lossy(&data).into_owned());
        }
    }

    fn reset(&mut self) {
        self.value = None;
    }
}

impl CommandOutput for StatusOutput {
    type Value = String;

    fn finish(&mut self) -> Result<String> {
        self.value.take().ok_or_else(|| shape_mismatch("a status"))
    }
}

/// Integer reply. Inside an array the last integer wins, which is what
/// subscription confirmations (`[kind, channel, count]`) need.
#[derive(Debug, Default)]
pub struct IntegerOutput {
    value: Option<i64>,
}

impl IntegerOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Output for IntegerOutput {
    fn set_integer(&mut self, value: i64) {
        self.value = Some(value);
    }

    fn reset(&mut self) {
        self.value = None;
    }
}

impl CommandOutput for IntegerOutput {
    type Value = i64;

    fn finish(&mut self) -> Result<i64> {
        self.value.take().ok_or_else(|| shape_mismatch("an integer"))
    }
}

/// Integer reply interpreted as a flag (`:1` / `:0`).
#[derive(Debug, Default)]
pub struct BooleanOutput {
    value: Option<bool>,
}

impl BooleanOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Output for BooleanOutput {
    fn set_integer(&mut self, value: i64) {
        self.value = Some(value != 0);
    }

    fn reset(&mut self) {
        self.value = None;
    }
}

impl CommandOutput for BooleanOutput {
    type Value = bool;

    fn finish(&mut self) -> Result<bool> {
        self.value.take().ok_or_else(|| shape_mismatch("an integer flag"))
    }
}

/// Single bulk reply decoded with the value codec; the null bulk is `None`.
pub struct ValueOutput<C: Codec> {
    codec: Arc<C>,
    value: Option<Option<C::Value>>,
}

impl<C: Codec> ValueOutput<C> {
    pub fn new(codec: Arc<C>) -> Self {
        Self { codec, value: None }
    }
}

impl<C: Codec> Output for ValueOutput<C> {
    fn set_bulk(&mut self, data: Option<Bytes>) {
        self.value = Some(data.map(|bytes| self.codec.decode_value(bytes)));
    }

    fn set_status(&mut self, status: String) {
        let bytes = Bytes::from(status);
        self.value = Some(Some(self.codec.decode_value(bytes)));
    }

    fn reset(&mut self) {
        self.value = None;
    }
}

impl<C: Codec> CommandOutput for ValueOutput<C> {
    type Value = Option<C::Value>;

    fn finish(&mut self) -> Result<Option<C::Value>> {
        self.value.take().ok_or_else(|| shape_mismatch("a bulk string"))
    }
}

/// Array of bulk replies (MGET, LRANGE, ...). A null array yields an empty list.
pub struct ValueListOutput<C: Codec> {
    codec: Arc<C>,
    values: Vec<Option<C::Value>>,
    seen_header: bool,
}

impl<C: Codec> ValueListOutput<C> {
    pub fn new(codec: Arc<C>) -> Self {
        Self {
            codec,
            values: Vec::new(),
            seen_header: false,
        }
    }
}

impl<C: Codec> Output for ValueListOutput<C> {
    fn multi(&mut self, len: Option<usize>) {
        if !self.seen_header {
            self.seen_header = true;
            self.values.reserve(len.unwrap_or(0).min(PREALLOCATE_LIMIT));
        }
    }

    fn set_bulk(&mut self, data: Option<Bytes>) {
        self.values
            .push(data.map(|bytes| self.codec.decode_value(bytes)));
    }

    fn reset(&mut self) {
        self.values.clear();
        self.seen_header = false;
    }
}

impl<C: Codec> CommandOutput for ValueListOutput<C> {
    type Value = Vec<Option<C::Value>>;

    fn finish(&mut self) -> Result<Self::Value> {
        if !self.seen_header {
            return Err(shape_mismatch("an array"));
        }
        self.seen_header = false;
        Ok(std::mem::take(&mut self.values))
    }
}

/// Builds the full [`RespValue`] tree of a reply, errors included.
///
/// This is the shape-agnostic target: floating push decoding, the
/// transaction aggregate and ad-hoc commands all use it.
#[derive(Debug, Default)]
pub struct RespOutput {
    /// Open arrays: collected elements and declared length.
    stack: Vec<(Vec<RespValue>, usize)>,
    root: Option<RespValue>,
}

impl RespOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once a complete top-level value has been built.
    pub fn is_done(&self) -> bool {
        self.root.is_some()
    }

    fn push(&mut self, value: RespValue) {
        let mut value = value;
        loop {
            match self.stack.last_mut() {
                None => {
                    self.root = Some(value);
                    return;
                }
                Some((elements, len)) => {
                    elements.push(value);
                    if elements.len() < *len {
                        return;
                    }
                }
            }
            // The innermost array is full: close it and hand it to its parent.
            let Some((elements, _)) = self.stack.pop() else {
                return;
            };
            value = RespValue::Array(elements);
        }
    }
}

impl Output for RespOutput {
    fn set_status(&mut self, status: String) {
        self.push(RespValue::SimpleString(status));
    }

    fn set_error(&mut self, message: String) {
        self.push(RespValue::Error(message));
    }

    fn set_integer(&mut self, value: i64) {
        self.push(RespValue::Integer(value));
    }

    fn set_bulk(&mut self, data: Option<Bytes>) {
        self.push(match data {
            Some(bytes) => RespValue::BulkString(bytes),
            None => RespValue::NullBulk,
        });
    }

    fn multi(&mut self, len: Option<usize>) {
        match len {
            None => self.push(RespValue::NullArray),
            Some(0) => self.push(RespValue::Array(Vec::new())),
            Some(n) => self
                .stack
                .push((Vec::with_capacity(n.min(PREALLOCATE_LIMIT)), n)),
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.root = None;
    }
}

impl CommandOutput for RespOutput {
    type Value = RespValue;

    fn finish(&mut self) -> Result<RespValue> {
        self.stack.clear();
        self.root.take().ok_or_else(|| shape_mismatch("a complete value"))
    }
}
