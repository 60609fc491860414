//! Commands and Handles
//!
//! A [`Command`] pairs a decode target with the sending half of a oneshot
//! channel; the caller keeps the receiving half as a [`Handle`]. Completing a
//! command consumes it, so a second completion cannot be expressed.

use crate::error::{ClientError, Result};
use crate::protocol::{CommandOutput, Output};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

/// A queue entry's view of a command awaiting its reply.
pub(crate) trait Pending: Send {
    /// The decode target for the reply.
    fn output(&mut self) -> &mut dyn Output;

    /// Delivers the decoded result.
    fn complete(self: Box<Self>);

    /// Delivers a terminal error instead of a result.
    fn fail(self: Box<Self>, error: ClientError);

    /// Discards partial decode progress before the command is replayed.
    fn reset(&mut self) {
        self.output().reset();
    }
}

/// A dispatched command whose result goes to a caller's [`Handle`].
pub(crate) struct Command<O: CommandOutput> {
    output: O,
    /// Top-level error reply, kept apart from the output.
    error: Option<String>,
    /// True once an array header was seen, making later errors nested ones.
    nested: bool,
    tx: oneshot::Sender<Result<O::Value>>,
}

impl<O: CommandOutput> Command<O> {
    pub(crate) fn new(output: O, default_timeout: Option<Duration>) -> (Self, Handle<O::Value>) {
        let (tx, rx) = oneshot::channel();
        let command = Self {
            output,
            error: None,
            nested: false,
            tx,
        };
        (command, Handle::new(rx, default_timeout))
    }
}

impl<O: CommandOutput> Output for Command<O> {
    fn set_status(&mut self, status: String) {
        self.output.set_status(status);
    }

    fn set_error(&mut self, message: String) {
        if self.nested {
            self.output.set_error(message);
        } else {
            self.error = Some(message);
        }
    }

    fn set_integer(&mut self, value: i64) {
        self.output.set_integer(value);
    }

    fn set_bulk(&mut self, data: Option<Bytes>) {
        self.output.set_bulk(data);
    }

    fn multi(&mut self, len: Option<usize>) {
        self.nested = true;
        self.output.multi(len);
    }

    fn complete(&mut self, depth: usize) {
        self.output.complete(depth);
    }

    fn reset(&mut self) {
        self.output.reset();
        self.error = None;
        self.nested = false;
    }
}

impl<O: CommandOutput> Pending for Command<O> {
    fn output(&mut self) -> &mut dyn Output {
        self
    }

    fn complete(mut self: Box<Self>) {
        let result = match self.error.take() {
            Some(message) => Err(ClientError::Server(message)),
            None => self.output.finish(),
        };
        if self.tx.send(result).is_err() {
            trace!("Reply dropped, caller stopped waiting");
        }
    }

    fn fail(self: Box<Self>, error: ClientError) {
        if self.tx.send(Err(error)).is_err() {
            trace!("Failure dropped, caller stopped waiting");
        }
    }
}

/// The caller's side of a dispatched command.
///
/// Awaiting the handle waits without bound. [`Handle::timeout`] and
/// [`Handle::wait`] bound the wait; giving up does not un-send the command,
/// which still completes (and leaves the in-flight queue) when its reply
/// arrives.
#[derive(Debug)]
pub struct Handle<T> {
    rx: oneshot::Receiver<Result<T>>,
    default_timeout: Option<Duration>,
}

impl<T> Handle<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T>>, default_timeout: Option<Duration>) -> Self {
        Self {
            rx,
            default_timeout,
        }
    }

    /// Waits at most `limit` for the result.
    pub async fn timeout(self, limit: Duration) -> Result<T> {
        match tokio::time::timeout(limit, self).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(limit)),
        }
    }

    /// Waits for the result, bounded by the connection's default timeout.
    pub async fn wait(self) -> Result<T> {
        match self.default_timeout {
            Some(limit) => self.timeout(limit).await,
            None => self.await,
        }
    }

    /// Returns the result if it has already arrived.
    pub fn try_result(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ClientError::ConnectionClosed)),
        }
    }
}

impl<T> Future for Handle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The command was dropped without a verdict: only happens when
            // the connection is torn down.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
