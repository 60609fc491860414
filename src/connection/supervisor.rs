//! Connection Supervisor
//!
//! One background task per connection owns the transport. It runs the reader
//! and the writer side by side; when either stops (end of stream, I/O error,
//! or a protocol error from the decoder) it detaches the pipeline, reconnects
//! with backoff and attaches the new stream, which replays everything still
//! in flight.
//!
//! ```text
//!   Connected ──(EOF / I/O / protocol error)──> Reconnecting ──(attach)──┐
//!       ▲                                                                 │
//!       └─────────────────────────────────────────────────────────────────┘
//!   any state ──(close / attempts exhausted / reconnect disabled)──> Closed
//! ```

use crate::connection::transport::Connector;
use crate::connection::Shared;
use crate::error::ClientError;
use crate::protocol::ParseError;
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Counters kept by the supervisor.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Successful reconnects
    pub reconnects: AtomicU64,
    /// Commands written again after a reconnect
    pub commands_replayed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reconnected(&self, replayed: usize) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.commands_replayed
            .fetch_add(replayed as u64, Ordering::Relaxed);
    }

    pub(crate) fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Why a transport stopped being driven.
#[derive(Debug)]
enum Disconnect {
    Eof,
    Io(io::Error),
    Protocol(ParseError),
    /// The connection was closed; nothing to reconnect.
    Shutdown,
}

/// Resolves once shutdown has been signalled.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// The supervisor task: drives the current transport and replaces it when
/// it is lost.
pub(crate) async fn run<C: Connector>(
    shared: Arc<Shared>,
    connector: C,
    stream: C::Stream,
    writes: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = connector.describe();
    let mut stream = stream;
    let mut writes = writes;

    loop {
        // What outstanding commands fail with if there is no reconnect.
        let cause = match drive(&shared, stream, writes, &mut shutdown).await {
            Disconnect::Shutdown => {
                debug!(peer = %peer, "Supervisor stopped");
                return;
            }
            Disconnect::Eof => {
                info!(peer = %peer, "Server closed the connection");
                ClientError::ConnectionClosed
            }
            Disconnect::Io(e) => {
                warn!(peer = %peer, error = %e, "Connection lost");
                ClientError::ConnectionClosed
            }
            Disconnect::Protocol(e) => {
                warn!(peer = %peer, error = %e, "Protocol error, dropping connection");
                ClientError::from(e)
            }
        };

        if !shared.pipeline().detach() {
            return;
        }
        if !shared.config.reconnect.enabled {
            info!(peer = %peer, "Reconnect disabled, closing connection");
            shared.close_with(cause);
            return;
        }

        match reconnect(&shared, &connector, &mut shutdown).await {
            Some((next_stream, next_writes)) => {
                stream = next_stream;
                writes = next_writes;
            }
            None => return,
        }
    }
}

/// Retries the connector with backoff until it succeeds, the policy gives
/// up, or the connection is closed.
async fn reconnect<C: Connector>(
    shared: &Shared,
    connector: &C,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<(C::Stream, mpsc::UnboundedReceiver<Bytes>)> {
    let policy = &shared.config.reconnect;
    let mut attempt = 1;

    while policy.allows(attempt) {
        let delay = policy.backoff_for_attempt(attempt);
        debug!(
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stopped(shutdown) => return None,
        }

        let connected = tokio::select! {
            result = connector.connect() => result,
            _ = stopped(shutdown) => return None,
        };

        match connected {
            Ok(stream) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let attached = shared.pipeline().attach(tx);
                return match attached {
                    Ok(replayed) => {
                        shared.stats.reconnected(replayed);
                        info!(
                            peer = %connector.describe(),
                            attempt = attempt,
                            replayed = replayed,
                            "Reconnected"
                        );
                        Some((stream, rx))
                    }
                    // Closed while we were connecting.
                    Err(_) => None,
                };
            }
            Err(e) => {
                warn!(attempt = attempt, error = %e, "Reconnect attempt failed");
            }
        }
        attempt += 1;
    }

    error!(
        attempts = attempt - 1,
        "Giving up reconnecting, closing connection"
    );
    shared.close();
    None
}

/// Runs the reader and the writer for one transport until it fails.
async fn drive<S>(
    shared: &Shared,
    stream: S,
    mut writes: mpsc::UnboundedReceiver<Bytes>,
    shutdown: &mut watch::Receiver<bool>,
) -> Disconnect
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let mut writer = BufWriter::new(writer);
    let capacity = shared.config.read_buffer_capacity;

    let read_loop = async {
        let mut buf = BytesMut::with_capacity(capacity);
        loop {
            // Ensure we have some capacity
            if buf.capacity() - buf.len() < capacity / 4 {
                buf.reserve(capacity);
            }

            let n = match reader.read_buf(&mut buf).await {
                Ok(0) => return Disconnect::Eof,
                Ok(n) => n,
                Err(e) => return Disconnect::Io(e),
            };
            shared.stats.bytes_read(n);
            trace!(bytes = n, buffered = buf.len(), "Read data");

            let decoded = shared.pipeline().on_read(&mut buf);
            if let Err(e) = decoded {
                return Disconnect::Protocol(e);
            }
        }
    };

    let write_loop = async {
        while let Some(chunk) = writes.recv().await {
            let mut written = chunk.len();
            if let Err(e) = writer.write_all(&chunk).await {
                return Disconnect::Io(e);
            }
            // Batch whatever else is already queued into one flush.
            while let Ok(chunk) = writes.try_recv() {
                written += chunk.len();
                if let Err(e) = writer.write_all(&chunk).await {
                    return Disconnect::Io(e);
                }
            }
            if let Err(e) = writer.flush().await {
                return Disconnect::Io(e);
            }
            shared.stats.bytes_written(written);
            trace!(bytes = written, "Wrote commands");
        }
        // The pipeline dropped its sender: it was closed.
        Disconnect::Shutdown
    };

    tokio::select! {
        reason = read_loop => reason,
        reason = write_loop => reason,
        _ = stopped(shutdown) => Disconnect::Shutdown,
    }
}
