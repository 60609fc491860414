//! In-Flight Command Queue
//!
//! Entries sit in wire order: the first entry is always the command the next
//! reply belongs to. Each entry keeps its encoded request so the supervisor
//! can write it again after a reconnect without re-running dispatch.

use crate::connection::command::Pending;
use crate::error::ClientError;
use crate::protocol::CommandType;
use bytes::Bytes;
use std::collections::VecDeque;

/// What part an entry plays in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Plain,
    /// MULTI
    Begin,
    /// A command sent inside MULTI; its reply is the `+QUEUED` acknowledgement.
    Queued,
    /// EXEC or DISCARD: closes the transaction.
    Commit,
}

/// One dispatched command awaiting its reply (or replies).
pub(crate) struct InFlight {
    pub(crate) command: CommandType,
    pub(crate) wire: Bytes,
    pub(crate) role: Role,
    /// Decoded through the floating push target rather than directly.
    pub(crate) push_mode: bool,
    expected: usize,
    remaining: usize,
    pub(crate) pending: Box<dyn Pending>,
}

impl InFlight {
    pub(crate) fn new(command: CommandType, wire: Bytes, pending: Box<dyn Pending>) -> Self {
        Self {
            command,
            wire,
            role: Role::Plain,
            push_mode: false,
            expected: 1,
            remaining: 1,
            pending,
        }
    }

    pub(crate) fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub(crate) fn with_push_mode(mut self, push_mode: bool) -> Self {
        self.push_mode = push_mode;
        self
    }

    /// Number of replies that complete this entry (subscription commands
    /// receive one confirmation per channel).
    pub(crate) fn with_replies(mut self, replies: usize) -> Self {
        self.expected = replies.max(1);
        self.remaining = self.expected;
        self
    }

    /// Records one received reply; true when the entry is done.
    pub(crate) fn reply_received(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }

    pub(crate) fn reset(&mut self) {
        self.remaining = self.expected;
        self.pending.reset();
    }

    pub(crate) fn fail(self, error: ClientError) {
        self.pending.fail(error);
    }
}

/// FIFO of in-flight commands; insertion order is wire order.
#[derive(Default)]
pub(crate) struct InFlightQueue {
    entries: VecDeque<InFlight>,
}

impl InFlightQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_back(&mut self, entry: InFlight) {
        self.entries.push_back(entry);
    }

    /// Inserts ahead of everything queued; used for the reconnect prelude.
    pub(crate) fn push_front(&mut self, entry: InFlight) {
        self.entries.push_front(entry);
    }

    pub(crate) fn head(&self) -> Option<&InFlight> {
        self.entries.front()
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut InFlight> {
        self.entries.front_mut()
    }

    pub(crate) fn pop_front(&mut self) -> Option<InFlight> {
        self.entries.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &InFlight> {
        self.entries.iter()
    }

    /// Appends entries keeping their relative order.
    pub(crate) fn extend(&mut self, entries: impl IntoIterator<Item = InFlight>) {
        self.entries.extend(entries);
    }

    /// Resets every entry's decode progress ahead of a replay.
    pub(crate) fn reset_all(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.reset();
        }
    }

    /// Removes the entries among the first `limit` that match `predicate`,
    /// returning them in order.
    pub(crate) fn remove_leading<F>(&mut self, limit: usize, predicate: F) -> Vec<InFlight>
    where
        F: Fn(&InFlight) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for (index, entry) in self.entries.drain(..).enumerate() {
            if index < limit && predicate(&entry) {
                removed.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        removed
    }

    /// Empties the queue, returning entries in order.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = InFlight> + '_ {
        self.entries.drain(..)
    }
}
