//! Transactions (MULTI / EXEC / DISCARD)
//!
//! While a [`TransactionBuffer`] is live, every dispatched command is split in
//! two:
//!
//! - a [`QueuedAck`] goes into the in-flight queue and absorbs the server's
//!   `+QUEUED` acknowledgement (remembering an error if queuing was refused);
//! - the caller's command itself is parked in the buffer, in dispatch order.
//!
//! EXEC turns the buffer into a [`TransactionCommand`]: its reply is one array
//! whose elements are routed, one per member, into the parked commands'
//! outputs while a copy of every element builds the aggregate result.

use crate::connection::command::Pending;
use crate::error::{ClientError, Result};
use crate::protocol::{CommandOutput, Output, RespOutput, RespValue};
use bytes::Bytes;
use std::sync::{Arc, OnceLock};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// A command parked inside an open transaction.
struct Member {
    pending: Box<dyn Pending>,
    /// Error the server gave instead of `+QUEUED`.
    rejected: Arc<OnceLock<String>>,
}

impl Member {
    fn settle(self, error: Option<ClientError>) {
        let rejected = self.rejected.get().cloned();
        match (rejected, error) {
            (Some(message), _) => self.pending.fail(ClientError::Server(message)),
            (None, Some(error)) => self.pending.fail(error),
            (None, None) => self.pending.complete(),
        }
    }
}

/// Commands collected between MULTI and EXEC/DISCARD.
#[derive(Default)]
pub(crate) struct TransactionBuffer {
    members: Vec<Member>,
}

impl TransactionBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    /// Parks a command and returns the entry that takes its acknowledgement.
    pub(crate) fn add(&mut self, pending: Box<dyn Pending>) -> QueuedAck {
        let rejected = Arc::new(OnceLock::new());
        self.members.push(Member {
            pending,
            rejected: Arc::clone(&rejected),
        });
        QueuedAck {
            error: None,
            rejected,
        }
    }

    /// Fails every parked command; none of them will be completed by EXEC.
    pub(crate) fn abort(self, error: ClientError) {
        debug!(commands = self.members.len(), "Transaction buffer discarded");
        for member in self.members {
            member.pending.fail(error.clone());
        }
    }

    /// Builds the aggregate EXEC command over the parked commands.
    pub(crate) fn commit(
        self,
        tx: oneshot::Sender<Result<Vec<RespValue>>>,
    ) -> TransactionCommand {
        TransactionCommand {
            members: self.members,
            tee: RespOutput::new(),
            header: Header::Pending,
            depth: 0,
            cursor: 0,
            tx,
        }
    }
}

/// Takes the `+QUEUED` reply of one transaction member.
pub(crate) struct QueuedAck {
    error: Option<String>,
    rejected: Arc<OnceLock<String>>,
}

impl Output for QueuedAck {
    fn set_error(&mut self, message: String) {
        self.error = Some(message);
    }

    fn reset(&mut self) {
        self.error = None;
    }
}

impl Pending for QueuedAck {
    fn output(&mut self) -> &mut dyn Output {
        self
    }

    fn complete(self: Box<Self>) {
        if let Some(message) = self.error {
            debug!(error = %message, "Command refused inside transaction");
            // Set at most once per member: a replayed ack is reset first.
            let _ = self.rejected.set(message);
        }
    }

    /// The member itself is failed through its buffer or EXEC entry.
    fn fail(self: Box<Self>, _error: ClientError) {}
}

/// What the top level of the EXEC reply turned out to be.
#[derive(Debug, Clone, PartialEq)]
enum Header {
    Pending,
    Array(usize),
    /// Null array: the transaction was aborted (WATCH).
    Aborted,
    Error(String),
    LengthMismatch(usize),
    Unexpected,
}

/// The EXEC entry: one aggregate reply fanned out to the parked commands.
pub(crate) struct TransactionCommand {
    members: Vec<Member>,
    /// Receives every event to build the aggregate value.
    tee: RespOutput,
    header: Header,
    /// Arrays currently open in the reply.
    depth: usize,
    /// Index of the member receiving the current element.
    cursor: usize,
    tx: oneshot::Sender<Result<Vec<RespValue>>>,
}

impl TransactionCommand {
    /// The member output for an element event, if elements are being routed.
    fn target(&mut self) -> Option<&mut dyn Output> {
        if self.depth == 0 || !matches!(self.header, Header::Array(_)) {
            return None;
        }
        self.members
            .get_mut(self.cursor)
            .map(|member| member.pending.output())
    }

    fn scalar(&mut self, event: impl Fn(&mut dyn Output)) {
        event(&mut self.tee as &mut dyn Output);
        if self.depth == 0 {
            self.header = Header::Unexpected;
        } else if let Some(target) = self.target() {
            event(target);
        }
    }

    fn deliver(self, result: Result<Vec<RespValue>>) {
        if self.tx.send(result).is_err() {
            trace!("Transaction result dropped, caller stopped waiting");
        }
    }
}

impl Output for TransactionCommand {
    fn set_status(&mut self, status: String) {
        self.scalar(|out| out.set_status(status.clone()));
    }

    fn set_error(&mut self, message: String) {
        if self.depth == 0 {
            self.tee.set_error(message.clone());
            self.header = Header::Error(message);
        } else {
            self.scalar(|out| out.set_error(message.clone()));
        }
    }

    fn set_integer(&mut self, value: i64) {
        self.scalar(|out| out.set_integer(value));
    }

    fn set_bulk(&mut self, data: Option<Bytes>) {
        self.scalar(|out| out.set_bulk(data.clone()));
    }

    fn multi(&mut self, len: Option<usize>) {
        self.tee.multi(len);
        if self.depth == 0 {
            self.header = match len {
                None => Header::Aborted,
                Some(n) if n == self.members.len() => Header::Array(n),
                Some(n) => Header::LengthMismatch(n),
            };
        } else if let Some(target) = self.target() {
            target.multi(len);
        }
        if matches!(len, Some(n) if n > 0) {
            self.depth += 1;
        }
    }

    fn complete(&mut self, depth: usize) {
        self.tee.complete(depth);
        if depth >= 1 {
            if let Some(target) = self.target() {
                target.complete(depth - 1);
            }
        }
        self.depth = depth;
        if depth == 1 {
            // An element of the aggregate array is finished.
            self.cursor += 1;
        }
    }

    fn reset(&mut self) {
        self.tee.reset();
        self.header = Header::Pending;
        self.depth = 0;
        self.cursor = 0;
        for member in self.members.iter_mut() {
            member.pending.reset();
        }
    }
}

impl Pending for TransactionCommand {
    fn output(&mut self) -> &mut dyn Output {
        self
    }

    fn complete(mut self: Box<Self>) {
        let header = std::mem::replace(&mut self.header, Header::Pending);
        let members = std::mem::take(&mut self.members);
        let queued = members.len();

        let (member_error, result) = match header {
            Header::Array(_) => {
                let values = match self.tee.finish() {
                    Ok(RespValue::Array(values)) => Ok(values),
                    Ok(other) => Err(ClientError::usage(format!(
                        "EXEC reply was not an array: {:?}",
                        other
                    ))),
                    Err(e) => Err(e),
                };
                (None, values)
            }
            Header::Aborted => (
                Some(ClientError::TransactionAborted),
                Err(ClientError::TransactionAborted),
            ),
            Header::Error(message) => (
                Some(ClientError::Server(message.clone())),
                Err(ClientError::Server(message)),
            ),
            Header::LengthMismatch(n) => {
                let fault = ClientError::usage(format!(
                    "EXEC returned {} replies for {} queued commands",
                    n, queued
                ));
                (Some(fault.clone()), Err(fault))
            }
            Header::Pending | Header::Unexpected => {
                let fault = ClientError::usage("EXEC reply was not an array");
                (Some(fault.clone()), Err(fault))
            }
        };

        debug!(commands = queued, ok = result.is_ok(), "Transaction completed");
        for member in members {
            member.settle(member_error.clone());
        }
        self.deliver(result);
    }

    fn fail(mut self: Box<Self>, error: ClientError) {
        for member in std::mem::take(&mut self.members) {
            member.pending.fail(error.clone());
        }
        self.deliver(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Utf8Codec;
    use crate::connection::command::Command;
    use crate::connection::Handle;
    use crate::protocol::{IntegerOutput, StatusOutput, ValueOutput};

    fn exec_handle() -> (
        oneshot::Sender<Result<Vec<RespValue>>>,
        Handle<Vec<RespValue>>,
    ) {
        let (tx, rx) = oneshot::channel();
        (tx, Handle::new(rx, None))
    }

    /// Answers each acknowledgement entry with the given reply.
    fn acknowledge(acks: Vec<(QueuedAck, RespValue)>) {
        for (ack, reply) in acks {
            let mut ack = Box::new(ack);
            reply.feed(ack.output());
            ack.complete();
        }
    }

    #[test]
    fn test_exec_routes_sub_replies_in_order() {
        let mut buffer = TransactionBuffer::new();
        let (set, mut set_handle) = Command::new(StatusOutput::new(), None);
        let (incr, mut incr_handle) = Command::new(IntegerOutput::new(), None);
        let (get, mut get_handle) = Command::new(ValueOutput::new(Arc::new(Utf8Codec)), None);

        let acks = vec![
            (buffer.add(Box::new(set)), RespValue::simple_string("QUEUED")),
            (buffer.add(Box::new(incr)), RespValue::simple_string("QUEUED")),
            (buffer.add(Box::new(get)), RespValue::simple_string("QUEUED")),
        ];
        acknowledge(acks);

        let (tx, mut exec_handle) = exec_handle();
        let mut exec = Box::new(buffer.commit(tx));
        let reply = RespValue::array(vec![
            RespValue::ok(),
            RespValue::Integer(5),
            RespValue::bulk_string("v"),
        ]);
        reply.feed(exec.output());
        exec.complete();

        assert_eq!(set_handle.try_result().unwrap().unwrap(), "OK");
        assert_eq!(incr_handle.try_result().unwrap().unwrap(), 5);
        assert_eq!(
            get_handle.try_result().unwrap().unwrap(),
            Some("v".to_string())
        );
        assert_eq!(
            exec_handle.try_result().unwrap().unwrap(),
            vec![
                RespValue::ok(),
                RespValue::Integer(5),
                RespValue::bulk_string("v")
            ]
        );
    }

    #[test]
    fn test_exec_element_error_only_fails_that_member() {
        let mut buffer = TransactionBuffer::new();
        let (a, mut a_handle) = Command::new(IntegerOutput::new(), None);
        let (b, mut b_handle) = Command::new(IntegerOutput::new(), None);
        let _ = buffer.add(Box::new(a));
        let _ = buffer.add(Box::new(b));

        let (tx, mut exec_handle) = exec_handle();
        let mut exec = Box::new(buffer.commit(tx));
        RespValue::array(vec![
            RespValue::error("WRONGTYPE Operation against a key"),
            RespValue::Integer(2),
        ])
        .feed(exec.output());
        exec.complete();

        assert!(matches!(
            a_handle.try_result().unwrap(),
            Err(ClientError::Server(_))
        ));
        assert_eq!(b_handle.try_result().unwrap().unwrap(), 2);
        let values = exec_handle.try_result().unwrap().unwrap();
        assert!(values[0].is_error());
    }

    #[test]
    fn test_nested_sub_replies() {
        let mut buffer = TransactionBuffer::new();
        let (lrange, mut lrange_handle) = Command::new(RespOutput::new(), None);
        let (count, mut count_handle) = Command::new(IntegerOutput::new(), None);
        let _ = buffer.add(Box::new(lrange));
        let _ = buffer.add(Box::new(count));

        let (tx, _exec_handle) = exec_handle();
        let mut exec = Box::new(buffer.commit(tx));
        let nested = RespValue::array(vec![
            RespValue::bulk_string("a"),
            RespValue::array(vec![RespValue::Integer(1)]),
        ]);
        RespValue::array(vec![nested.clone(), RespValue::Integer(9)]).feed(exec.output());
        exec.complete();

        assert_eq!(lrange_handle.try_result().unwrap().unwrap(), nested);
        assert_eq!(count_handle.try_result().unwrap().unwrap(), 9);
    }

    #[test]
    fn test_empty_transaction_completes_trivially() {
        let buffer = TransactionBuffer::new();
        let (tx, mut exec_handle) = exec_handle();
        let mut exec = Box::new(buffer.commit(tx));
        RespValue::array(vec![]).feed(exec.output());
        exec.complete();
        assert!(exec_handle.try_result().unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_watch_abort_fails_members() {
        let mut buffer = TransactionBuffer::new();
        let (a, mut a_handle) = Command::new(StatusOutput::new(), None);
        let _ = buffer.add(Box::new(a));

        let (tx, mut exec_handle) = exec_handle();
        let mut exec = Box::new(buffer.commit(tx));
        RespValue::NullArray.feed(exec.output());
        exec.complete();

        assert!(matches!(
            a_handle.try_result().unwrap(),
            Err(ClientError::TransactionAborted)
        ));
        assert!(matches!(
            exec_handle.try_result().unwrap(),
            Err(ClientError::TransactionAborted)
        ));
    }

    #[test]
    fn test_length_mismatch_is_usage_fault() {
        let mut buffer = TransactionBuffer::new();
        let (a, mut a_handle) = Command::new(StatusOutput::new(), None);
        let _ = buffer.add(Box::new(a));

        let (tx, mut exec_handle) = exec_handle();
        let mut exec = Box::new(buffer.commit(tx));
        RespValue::array(vec![RespValue::ok(), RespValue::ok()]).feed(exec.output());
        exec.complete();

        assert!(matches!(
            a_handle.try_result().unwrap(),
            Err(ClientError::UsageFault(_))
        ));
        assert!(matches!(
            exec_handle.try_result().unwrap(),
            Err(ClientError::UsageFault(_))
        ));
    }

    #[test]
    fn test_queue_time_rejection_reported_on_member() {
        let mut buffer = TransactionBuffer::new();
        let (a, mut a_handle) = Command::new(StatusOutput::new(), None);
        let ack = buffer.add(Box::new(a));
        acknowledge(vec![(ack, RespValue::error("ERR unknown command 'FOO'"))]);

        let (tx, mut exec_handle) = exec_handle();
        let mut exec = Box::new(buffer.commit(tx));
        RespValue::error("EXECABORT Transaction discarded because of previous errors.")
            .feed(exec.output());
        exec.complete();

        match a_handle.try_result().unwrap() {
            Err(ClientError::Server(msg)) => assert!(msg.contains("unknown command")),
            other => panic!("unexpected: {:?}", other),
        }
        match exec_handle.try_result().unwrap() {
            Err(ClientError::Server(msg)) => assert!(msg.starts_with("EXECABORT")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_abort_never_completes_through_aggregate() {
        let mut buffer = TransactionBuffer::new();
        let (a, mut a_handle) = Command::new(StatusOutput::new(), None);
        let _ = buffer.add(Box::new(a));
        assert_eq!(buffer.len(), 1);

        buffer.abort(ClientError::TransactionAborted);
        assert!(matches!(
            a_handle.try_result().unwrap(),
            Err(ClientError::TransactionAborted)
        ));
    }

    #[test]
    fn test_reset_before_replay() {
        let mut buffer = TransactionBuffer::new();
        let (a, mut a_handle) = Command::new(IntegerOutput::new(), None);
        let _ = buffer.add(Box::new(a));

        let (tx, _exec_handle) = exec_handle();
        let mut exec = Box::new(buffer.commit(tx));
        // Half a reply, then the connection drops.
        exec.output().multi(Some(1));
        Pending::reset(exec.as_mut());

        RespValue::array(vec![RespValue::Integer(3)]).feed(exec.output());
        exec.complete();
        assert_eq!(a_handle.try_result().unwrap().unwrap(), 3);
    }
}
