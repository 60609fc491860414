//! Push Channel (pub/sub)
//!
//! Once a subscribe-class command has been issued, replies are decoded into a
//! floating [`RespOutput`] and classified after each complete parse:
//!
//! - `message` / `pmessage` arrays are push notifications: they go to every
//!   listener and consume no queue entry;
//! - subscription confirmations answer the queue head when it is the matching
//!   command, and are pushed otherwise;
//! - anything else is a plain reply for the queue head.

use crate::protocol::{CommandArgs, CommandOutput, CommandType, RespOutput, RespValue};
use bytes::Bytes;
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Which subscription operation a confirmation acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
}

impl SubscriptionKind {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        if tag.eq_ignore_ascii_case(b"subscribe") {
            Some(SubscriptionKind::Subscribe)
        } else if tag.eq_ignore_ascii_case(b"unsubscribe") {
            Some(SubscriptionKind::Unsubscribe)
        } else if tag.eq_ignore_ascii_case(b"psubscribe") {
            Some(SubscriptionKind::PSubscribe)
        } else if tag.eq_ignore_ascii_case(b"punsubscribe") {
            Some(SubscriptionKind::PUnsubscribe)
        } else {
            None
        }
    }

    pub(crate) fn from_command(command: &CommandType) -> Option<Self> {
        match command {
            CommandType::Subscribe => Some(SubscriptionKind::Subscribe),
            CommandType::Unsubscribe => Some(SubscriptionKind::Unsubscribe),
            CommandType::PSubscribe => Some(SubscriptionKind::PSubscribe),
            CommandType::PUnsubscribe => Some(SubscriptionKind::PUnsubscribe),
            _ => None,
        }
    }

    fn command(self) -> CommandType {
        match self {
            SubscriptionKind::Subscribe => CommandType::Subscribe,
            SubscriptionKind::Unsubscribe => CommandType::Unsubscribe,
            SubscriptionKind::PSubscribe => CommandType::PSubscribe,
            SubscriptionKind::PUnsubscribe => CommandType::PUnsubscribe,
        }
    }
}

/// An unsolicited message delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    /// A publication on a subscribed channel.
    Message { channel: Bytes, payload: Bytes },
    /// A publication matched by a subscribed pattern.
    PMessage {
        pattern: Bytes,
        channel: Bytes,
        payload: Bytes,
    },
    /// A subscription confirmation; `count` is the number of subscriptions
    /// still active on the connection.
    Subscription {
        kind: SubscriptionKind,
        channel: Option<Bytes>,
        count: i64,
    },
}

impl PushMessage {
    pub fn channel(&self) -> Option<&Bytes> {
        match self {
            PushMessage::Message { channel, .. } | PushMessage::PMessage { channel, .. } => {
                Some(channel)
            }
            PushMessage::Subscription { channel, .. } => channel.as_ref(),
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            PushMessage::Message { payload, .. } | PushMessage::PMessage { payload, .. } => {
                Some(payload)
            }
            PushMessage::Subscription { .. } => None,
        }
    }

    /// Recognises the fixed notification shapes.
    fn parse(value: &RespValue) -> Option<PushMessage> {
        let elements = value.as_array()?;
        let tag = tag_of(elements.first()?)?;

        if tag.eq_ignore_ascii_case(b"message") && elements.len() == 3 {
            return Some(PushMessage::Message {
                channel: bytes_of(&elements[1])?,
                payload: bytes_of(&elements[2])?,
            });
        }
        if tag.eq_ignore_ascii_case(b"pmessage") && elements.len() == 4 {
            return Some(PushMessage::PMessage {
                pattern: bytes_of(&elements[1])?,
                channel: bytes_of(&elements[2])?,
                payload: bytes_of(&elements[3])?,
            });
        }
        let kind = SubscriptionKind::from_tag(tag)?;
        if elements.len() != 3 {
            return None;
        }
        Some(PushMessage::Subscription {
            kind,
            channel: bytes_of(&elements[1]),
            count: elements[2].as_integer()?,
        })
    }
}

fn tag_of(value: &RespValue) -> Option<&[u8]> {
    match value {
        RespValue::BulkString(data) => Some(data),
        RespValue::SimpleString(s) => Some(s.as_bytes()),
        _ => None,
    }
}

fn bytes_of(value: &RespValue) -> Option<Bytes> {
    match value {
        RespValue::BulkString(data) => Some(data.clone()),
        RespValue::SimpleString(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
        _ => None,
    }
}

/// Receives push messages from one connection.
///
/// Returns `None` once the connection is closed.
#[derive(Debug)]
pub struct PushReceiver {
    rx: mpsc::UnboundedReceiver<PushMessage>,
}

impl PushReceiver {
    pub async fn recv(&mut self) -> Option<PushMessage> {
        self.rx.recv().await
    }

    /// Returns a message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<PushMessage> {
        self.rx.try_recv().ok()
    }
}

/// Subscribed-mode state for one connection.
#[derive(Default)]
pub(crate) struct PushChannel {
    subscribed: bool,
    channels: BTreeSet<Bytes>,
    patterns: BTreeSet<Bytes>,
    listeners: Vec<mpsc::UnboundedSender<PushMessage>>,
    /// Decode target while classifying; replaced after every message.
    floating: RespOutput,
}

impl PushChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Switches to subscribed mode; called when a subscribe-class command is
    /// dispatched.
    pub(crate) fn enter(&mut self) {
        if !self.subscribed {
            debug!("Entering subscribed mode");
        }
        self.subscribed = true;
    }

    pub(crate) fn listen(&mut self) -> PushReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        PushReceiver { rx }
    }

    pub(crate) fn floating(&mut self) -> &mut RespOutput {
        &mut self.floating
    }

    /// Takes the value decoded into the floating output, leaving a fresh one.
    pub(crate) fn take_floating(&mut self) -> Option<RespValue> {
        std::mem::take(&mut self.floating).finish().ok()
    }

    /// Discards a partially decoded floating value.
    pub(crate) fn reset_floating(&mut self) {
        self.floating = RespOutput::new();
    }

    /// Classifies one decoded value. Returns it back when it is a plain reply
    /// for `head`; push messages are delivered and consumed.
    pub(crate) fn route(
        &mut self,
        value: RespValue,
        head: Option<&CommandType>,
    ) -> Option<RespValue> {
        let Some(message) = PushMessage::parse(&value) else {
            return Some(value);
        };

        match message {
            PushMessage::Subscription { kind, ref channel, count } => {
                let answers_head =
                    head.and_then(SubscriptionKind::from_command) == Some(kind);
                if !answers_head && !self.subscribed {
                    // Looks like a confirmation but nothing asked for one.
                    return Some(value);
                }
                self.track(kind, channel.clone(), count);
                self.deliver(message);
                answers_head.then_some(value)
            }
            PushMessage::Message { .. } | PushMessage::PMessage { .. } if self.subscribed => {
                self.deliver(message);
                None
            }
            _ => Some(value),
        }
    }

    fn track(&mut self, kind: SubscriptionKind, channel: Option<Bytes>, count: i64) {
        if let Some(channel) = channel {
            match kind {
                SubscriptionKind::Subscribe => {
                    self.channels.insert(channel);
                }
                SubscriptionKind::Unsubscribe => {
                    self.channels.remove(&channel);
                }
                SubscriptionKind::PSubscribe => {
                    self.patterns.insert(channel);
                }
                SubscriptionKind::PUnsubscribe => {
                    self.patterns.remove(&channel);
                }
            }
        }
        if count == 0 {
            debug!("No subscriptions left, leaving subscribed mode");
            self.subscribed = false;
            self.channels.clear();
            self.patterns.clear();
        }
    }

    fn deliver(&mut self, message: PushMessage) {
        trace!(?message, listeners = self.listeners.len(), "Push message");
        if self.listeners.is_empty() {
            debug!("Push message dropped, nobody is listening");
            return;
        }
        self.listeners
            .retain(|listener| listener.send(message.clone()).is_ok());
    }

    /// Number of confirmations the server sends for one subscription command.
    pub(crate) fn expected_confirmations(&self, command: &CommandType, args: usize) -> usize {
        if args > 0 {
            return args;
        }
        // Without arguments, UNSUBSCRIBE / PUNSUBSCRIBE confirm each
        // subscription dropped, or once if there were none.
        match command {
            CommandType::Unsubscribe => self.channels.len().max(1),
            CommandType::PUnsubscribe => self.patterns.len().max(1),
            _ => 1,
        }
    }

    /// Commands that restore the current subscriptions on a new connection,
    /// with the number of confirmations each expects.
    pub(crate) fn resubscribe(&self) -> Vec<(CommandType, CommandArgs, usize)> {
        let mut commands = Vec::new();
        for (kind, set) in [
            (SubscriptionKind::Subscribe, &self.channels),
            (SubscriptionKind::PSubscribe, &self.patterns),
        ] {
            if !set.is_empty() {
                let args = CommandArgs::new().add_all(set.iter().cloned());
                commands.push((kind.command(), args, set.len()));
            }
        }
        commands
    }

    /// Prepares for a fresh transport: partial decode state is gone, and the
    /// connection is subscribed again only once the resubscribe goes out.
    pub(crate) fn on_reconnect(&mut self) {
        self.reset_floating();
        self.subscribed = !self.channels.is_empty() || !self.patterns.is_empty();
    }

    /// Disconnects every listener.
    pub(crate) fn close(&mut self) {
        self.listeners.clear();
        self.subscribed = false;
    }
}
