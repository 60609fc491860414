//! Command Pipeline
//!
//! All per-connection state that must change together lives in one
//! [`Pipeline`], guarded by one lock in [`Connection`](super::Connection):
//!
//! - the in-flight queue and the side buffer of commands held while
//!   reconnecting;
//! - the live transaction buffer, if any;
//! - the push channel and the reply decoder;
//! - the sending half of the writer task's channel.
//!
//! Dispatch encodes, enqueues and hands bytes to the writer in one critical
//! section, so queue order is always wire order. The reader feeds every
//! received chunk through [`Pipeline::on_read`]; the supervisor drives
//! [`Pipeline::detach`], [`Pipeline::attach`] and [`Pipeline::close`].

use crate::config::{ClientConfig, DisconnectedBehavior};
use crate::connection::command::{Command, Handle, Pending};
use crate::connection::pubsub::{PushChannel, PushReceiver};
use crate::connection::queue::{InFlight, InFlightQueue, Role};
use crate::connection::transaction::TransactionBuffer;
use crate::error::{ClientError, Result};
use crate::protocol::{
    encode_command, CommandArgs, CommandOutput, CommandType, Output, ParseResult, Progress,
    ReplyDecoder, RespOutput, RespValue,
};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Session restore command written ahead of a replay. Nobody waits on it.
struct Prelude {
    command: CommandType,
    reply: RespOutput,
}

impl Pending for Prelude {
    fn output(&mut self) -> &mut dyn Output {
        &mut self.reply
    }

    fn complete(mut self: Box<Self>) {
        match self.reply.finish() {
            Ok(RespValue::Error(message)) => {
                warn!(command = %self.command, error = %message, "Session restore command failed")
            }
            _ => debug!(command = %self.command, "Session restore command acknowledged"),
        }
    }

    fn fail(self: Box<Self>, error: ClientError) {
        debug!(command = %self.command, error = %error, "Session restore command dropped");
    }
}

pub(crate) struct Pipeline {
    state: ConnectionState,
    queue: InFlightQueue,
    /// Dispatched while reconnecting; appended to the queue after the replay.
    held: VecDeque<InFlight>,
    transaction: Option<TransactionBuffer>,
    push: PushChannel,
    decoder: ReplyDecoder,
    /// The reply being decoded goes to the floating output, not the head.
    floating_active: bool,
    /// The floating reply started while nothing was waiting for it.
    floating_unsolicited: bool,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    password: Option<String>,
    database: u32,
    behavior: DisconnectedBehavior,
    default_timeout: Option<Duration>,
}

impl Pipeline {
    /// Creates a pipeline with no transport yet; dispatches are held until
    /// the first [`attach`](Self::attach).
    pub(crate) fn new(config: &ClientConfig) -> Self {
        Self {
            state: ConnectionState::Reconnecting,
            queue: InFlightQueue::new(),
            held: VecDeque::new(),
            transaction: None,
            push: PushChannel::new(),
            decoder: ReplyDecoder::new(),
            floating_active: false,
            floating_unsolicited: false,
            writer: None,
            password: config.password.clone(),
            database: config.database,
            behavior: config.disconnected_behavior,
            default_timeout: config.default_timeout,
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    /// Commands written or held that have not completed yet.
    pub(crate) fn in_flight(&self) -> usize {
        self.queue.len() + self.held.len()
    }

    pub(crate) fn is_transaction_open(&self) -> bool {
        self.transaction.is_some()
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        self.push.is_subscribed()
    }

    pub(crate) fn listen(&mut self) -> PushReceiver {
        self.push.listen()
    }

    pub(crate) fn set_password(&mut self, password: Option<String>) {
        self.password = password;
    }

    pub(crate) fn set_database(&mut self, database: u32) {
        self.database = database;
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn admit(&self) -> Result<()> {
        match self.state {
            ConnectionState::Closed => Err(ClientError::ConnectionClosed),
            ConnectionState::Reconnecting if self.behavior == DisconnectedBehavior::Reject => {
                Err(ClientError::NotConnected)
            }
            _ => Ok(()),
        }
    }

    /// Encodes a command, queues it and hands its bytes to the writer.
    pub(crate) fn dispatch<O: CommandOutput>(
        &mut self,
        command: CommandType,
        args: CommandArgs,
        output: O,
    ) -> Result<Handle<O::Value>> {
        self.admit()?;
        match command {
            CommandType::Exec => {
                return Err(ClientError::usage("EXEC is issued through exec()"));
            }
            CommandType::Multi if self.transaction.is_some() => {
                return Err(ClientError::usage("MULTI calls can not be nested"));
            }
            CommandType::Discard if self.transaction.is_none() => {
                return Err(ClientError::usage("DISCARD without MULTI"));
            }
            _ => {}
        }

        let wire = encode_command(&command, &args);
        let (pending, handle) = Command::new(output, self.default_timeout);

        let entry = match command {
            CommandType::Multi => {
                self.transaction = Some(TransactionBuffer::new());
                InFlight::new(command, wire, Box::new(pending)).with_role(Role::Begin)
            }
            CommandType::Discard => {
                if let Some(buffer) = self.transaction.take() {
                    buffer.abort(ClientError::TransactionAborted);
                }
                InFlight::new(command, wire, Box::new(pending)).with_role(Role::Commit)
            }
            _ => match self.transaction.as_mut() {
                Some(buffer) => {
                    let ack = buffer.add(Box::new(pending));
                    InFlight::new(command, wire, Box::new(ack)).with_role(Role::Queued)
                }
                None if command.is_subscription() => {
                    let replies = self.push.expected_confirmations(&command, args.len());
                    self.push.enter();
                    InFlight::new(command, wire, Box::new(pending)).with_replies(replies)
                }
                None => InFlight::new(command, wire, Box::new(pending)),
            },
        };

        let entry = entry.with_push_mode(self.push.is_subscribed());
        self.submit(entry);
        Ok(handle)
    }

    /// Closes the live transaction with EXEC.
    pub(crate) fn exec(&mut self) -> Result<Handle<Vec<RespValue>>> {
        self.admit()?;
        let buffer = self
            .transaction
            .take()
            .ok_or_else(|| ClientError::usage("EXEC without MULTI"))?;

        let (tx, rx) = oneshot::channel();
        let command = CommandType::Exec;
        let wire = encode_command(&command, &CommandArgs::new());
        let entry = InFlight::new(command, wire, Box::new(buffer.commit(tx)))
            .with_role(Role::Commit)
            .with_push_mode(self.push.is_subscribed());
        self.submit(entry);
        Ok(Handle::new(rx, self.default_timeout))
    }

    fn submit(&mut self, entry: InFlight) {
        let writer = match (self.state, self.writer.as_ref()) {
            (ConnectionState::Connected, Some(writer)) => writer,
            _ => {
                trace!(command = %entry.command, "Holding command until reconnected");
                self.held.push_back(entry);
                return;
            }
        };
        // A dead writer means the transport just went away; the entry stays
        // queued and goes out with the replay.
        if writer.send(entry.wire.clone()).is_err() {
            trace!(command = %entry.command, "Writer gone, command waits for replay");
        }
        self.queue.push_back(entry);
    }

    // =========================================================================
    // Decode loop
    // =========================================================================

    /// Decodes every complete reply in `buf` and completes commands in queue
    /// order. Bytes of an unfinished reply stay in `buf`.
    ///
    /// A protocol error leaves the connection desynchronized; the caller must
    /// drop the transport.
    pub(crate) fn on_read(&mut self, buf: &mut BytesMut) -> ParseResult<()> {
        while !buf.is_empty() {
            if !self.decoder.in_progress() {
                let head = self.queue.head();
                self.floating_unsolicited = head.is_none();
                self.floating_active = match head {
                    Some(head) => head.push_mode || self.push.is_subscribed(),
                    None => true,
                };
            }

            if self.floating_active {
                match self.decoder.decode(buf, self.push.floating())? {
                    Progress::Incomplete => break,
                    Progress::Complete(_) => {
                        self.floating_active = false;
                        self.on_floating_value();
                    }
                }
            } else {
                let Some(head) = self.queue.head_mut() else {
                    break;
                };
                match self.decoder.decode(buf, head.pending.output())? {
                    Progress::Incomplete => break,
                    Progress::Complete(_) => {
                        if head.reply_received() {
                            self.finish_head();
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn on_floating_value(&mut self) {
        let unsolicited = std::mem::take(&mut self.floating_unsolicited);
        let Some(value) = self.push.take_floating() else {
            return;
        };
        // A command dispatched while this reply was arriving did not ask for it.
        let head = match self.queue.head() {
            Some(entry) if !unsolicited => Some(&entry.command),
            _ => None,
        };
        let Some(reply) = self.push.route(value, head) else {
            return;
        };
        let head = match self.queue.head_mut() {
            Some(head) if !unsolicited => head,
            _ => {
                warn!(reply = %reply, "Unsolicited reply with no command waiting");
                return;
            }
        };
        reply.feed(head.pending.output());
        // An error ends a multi-reply command early.
        if head.reply_received() || reply.is_error() {
            self.finish_head();
        }
    }

    fn finish_head(&mut self) {
        if let Some(entry) = self.queue.pop_front() {
            trace!(command = %entry.command, remaining = self.queue.len(), "Command completed");
            entry.pending.complete();
        }
    }

    // =========================================================================
    // Supervision
    // =========================================================================

    /// Stops writing; commands dispatched from now on are held or rejected.
    /// Returns false if the pipeline is closed.
    pub(crate) fn detach(&mut self) -> bool {
        self.writer = None;
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Reconnecting;
        true
    }

    /// Binds a fresh transport: writes the session prelude, replays every
    /// queued command in order, then the held ones. Returns how many commands
    /// were written.
    pub(crate) fn attach(&mut self, writer: mpsc::UnboundedSender<Bytes>) -> Result<usize> {
        if self.state == ConnectionState::Closed {
            return Err(ClientError::ConnectionClosed);
        }

        // Decode progress belonged to the old stream.
        self.decoder.reset();
        self.floating_active = false;
        self.floating_unsolicited = false;
        self.push.on_reconnect();

        let held: Vec<InFlight> = self.held.drain(..).collect();
        self.queue.extend(held);
        self.abort_orphaned_transaction();
        self.queue.reset_all();

        for entry in self.prelude().into_iter().rev() {
            self.queue.push_front(entry);
        }

        let mut written = 0;
        for entry in self.queue.iter() {
            if writer.send(entry.wire.clone()).is_err() {
                break;
            }
            written += 1;
        }

        self.writer = Some(writer);
        self.state = ConnectionState::Connected;
        Ok(written)
    }

    /// A transaction whose MULTI was already acknowledged cannot be resumed
    /// on a new connection: fail what belongs to it.
    fn abort_orphaned_transaction(&mut self) {
        let begin = self.queue.iter().position(|entry| entry.role == Role::Begin);
        let limit = begin.unwrap_or(self.queue.len());
        let orphans = self.queue.remove_leading(limit, |entry| {
            matches!(entry.role, Role::Queued | Role::Commit)
        });

        if !orphans.is_empty() {
            warn!(
                commands = orphans.len(),
                "Transaction interrupted by disconnect, aborting"
            );
        }
        for entry in orphans {
            entry.fail(ClientError::TransactionAborted);
        }

        if begin.is_none() {
            if let Some(buffer) = self.transaction.take() {
                warn!("Open transaction lost with the connection, aborting");
                buffer.abort(ClientError::TransactionAborted);
            }
        }
    }

    /// AUTH, SELECT and resubscriptions, in the order they must be written.
    fn prelude(&self) -> Vec<InFlight> {
        let mut commands = Vec::new();
        if let Some(password) = &self.password {
            commands.push((CommandType::Auth, CommandArgs::new().add(password.clone()), 1));
        }
        if self.database != 0 {
            commands.push((
                CommandType::Select,
                CommandArgs::new().add_int(i64::from(self.database)),
                1,
            ));
        }
        commands.extend(self.push.resubscribe());

        commands
            .into_iter()
            .map(|(command, args, replies)| {
                let wire = encode_command(&command, &args);
                let pending = Prelude {
                    command: command.clone(),
                    reply: RespOutput::new(),
                };
                InFlight::new(command, wire, Box::new(pending))
                    .with_replies(replies)
                    .with_push_mode(self.push.is_subscribed())
            })
            .collect()
    }

    /// Fails everything outstanding with `ConnectionClosed`, in order, and
    /// makes the state terminal. Returns how many commands were failed.
    pub(crate) fn close(&mut self) -> usize {
        self.close_with(ClientError::ConnectionClosed)
    }

    /// Like [`close`](Self::close), but outstanding commands fail with
    /// `error`. Later dispatches still fail with `ConnectionClosed`.
    pub(crate) fn close_with(&mut self, error: ClientError) -> usize {
        if self.state == ConnectionState::Closed {
            return 0;
        }
        self.state = ConnectionState::Closed;
        self.writer = None;
        self.decoder.reset();

        let mut failed = 0;
        for entry in self.queue.drain().chain(self.held.drain(..)) {
            entry.fail(error.clone());
            failed += 1;
        }
        if let Some(buffer) = self.transaction.take() {
            failed += buffer.len();
            buffer.abort(error);
        }
        self.push.close();
        failed
    }
}
