//! Connection Module
//!
//! A [`Connection`] multiplexes many concurrent callers over one persistent
//! byte stream and survives transport failures.
//!
//! ## Architecture
//!
//! ```text
//!   callers ──dispatch()──┐
//!                         ▼
//!   ┌──────────────── Mutex<Pipeline> ────────────────┐
//!   │ encode ─> InFlightQueue ─> writer channel       │
//!   │ TransactionBuffer     PushChannel    Decoder    │
//!   └────────┬───────────────────────────────▲────────┘
//!            │ bytes                         │ on_read()
//!            ▼                               │
//!   ┌──────────── Supervisor task ───────────┴────────┐
//!   │ write loop        read loop       reconnect     │
//!   └─────────────────── transport ───────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flashkv_client::config::ClientConfig;
//! use flashkv_client::connection::Connection;
//! use flashkv_client::protocol::{CommandArgs, CommandType, StatusOutput};
//!
//! let conn = Connection::open("127.0.0.1:6379", ClientConfig::default()).await?;
//! let pong = conn
//!     .dispatch(CommandType::Other("PING"), CommandArgs::new(), StatusOutput::new())?
//!     .await?;
//! ```

mod command;
mod pipeline;
mod pubsub;
mod queue;
mod supervisor;
mod transaction;
mod transport;

pub use command::Handle;
pub use pipeline::ConnectionState;
pub use pubsub::{PushMessage, PushReceiver, SubscriptionKind};
pub use supervisor::ConnectionStats;
pub use transport::{Connector, TcpConnector};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::protocol::{CommandArgs, CommandOutput, CommandType, RespValue};
use pipeline::Pipeline;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::info;

/// State shared between callers and the supervisor task.
pub(crate) struct Shared {
    pipeline: Mutex<Pipeline>,
    config: ClientConfig,
    stats: ConnectionStats,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn pipeline(&self) -> MutexGuard<'_, Pipeline> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails everything outstanding and stops the supervisor.
    fn close(&self) -> usize {
        self.close_with(ClientError::ConnectionClosed)
    }

    fn close_with(&self, error: ClientError) -> usize {
        let failed = self.pipeline().close_with(error);
        self.shutdown.send_replace(true);
        failed
    }
}

/// Closes the connection when the last [`Connection`] clone is dropped.
struct CloseGuard {
    shared: Arc<Shared>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// A pipelined, auto-reconnecting connection.
///
/// Cheap to clone; all clones share the same transport and queue. The
/// connection closes when [`close`](Self::close) is called or the last clone
/// is dropped.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    _guard: Arc<CloseGuard>,
}

impl Connection {
    /// Establishes the first transport and starts the supervisor.
    ///
    /// The initial connect is not retried; reconnect policy applies only to
    /// connections that were once established.
    pub async fn connect<C: Connector>(connector: C, config: ClientConfig) -> Result<Self> {
        let stream = connector.connect().await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            pipeline: Mutex::new(Pipeline::new(&config)),
            config,
            stats: ConnectionStats::new(),
            shutdown,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        shared.pipeline().attach(tx)?;
        info!(peer = %connector.describe(), "Connected");

        tokio::spawn(supervisor::run(
            Arc::clone(&shared),
            connector,
            stream,
            rx,
            shutdown_rx,
        ));

        Ok(Self {
            _guard: Arc::new(CloseGuard {
                shared: Arc::clone(&shared),
            }),
            shared,
        })
    }

    /// Connects over TCP to `addr` (`host:port`).
    pub async fn open(addr: impl Into<String>, config: ClientConfig) -> Result<Self> {
        Self::connect(TcpConnector::new(addr), config).await
    }

    /// Sends a command; the handle resolves with the value decoded by
    /// `output`.
    ///
    /// Returns immediately. While a transaction is open the command is
    /// queued server-side and its handle resolves when EXEC is answered.
    pub fn dispatch<O: CommandOutput>(
        &self,
        command: CommandType,
        args: CommandArgs,
        output: O,
    ) -> Result<Handle<O::Value>> {
        self.shared.pipeline().dispatch(command, args, output)
    }

    /// Commits the open transaction. The handle resolves with every
    /// sub-reply; each queued command's own handle resolves as well.
    pub fn exec(&self) -> Result<Handle<Vec<RespValue>>> {
        self.shared.pipeline().exec()
    }

    /// Registers a listener for push messages.
    pub fn push_messages(&self) -> PushReceiver {
        self.shared.pipeline().listen()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.pipeline().state()
    }

    /// Commands dispatched but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.shared.pipeline().in_flight()
    }

    pub fn is_transaction_open(&self) -> bool {
        self.shared.pipeline().is_transaction_open()
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.pipeline().is_subscribed()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.shared.stats
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Fails every outstanding command with `ConnectionClosed` and stops
    /// reconnecting. Idempotent.
    pub fn close(&self) {
        let failed = self.shared.close();
        info!(failed = failed, "Connection closed");
    }

    /// Sends AUTH with this password again after every reconnect.
    pub(crate) fn remember_password(&self, password: Option<String>) {
        self.shared.pipeline().set_password(password);
    }

    /// Sends SELECT with this index again after every reconnect.
    pub(crate) fn remember_database(&self, database: u32) {
        self.shared.pipeline().set_database(database);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DisconnectedBehavior, ReconnectPolicy};
    use crate::protocol::{
        IntegerOutput, ParseError, Progress, ReplyDecoder, RespOutput, StatusOutput,
    };
    use bytes::BytesMut;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Hands out pre-made in-memory streams, then refuses.
    struct ScriptedConnector {
        streams: Mutex<VecDeque<DuplexStream>>,
    }

    impl ScriptedConnector {
        /// Returns the connector and the server ends of `count` streams.
        fn new(count: usize) -> (Self, Vec<DuplexStream>) {
            let mut clients = VecDeque::new();
            let mut servers = Vec::new();
            for _ in 0..count {
                let (client, server) = tokio::io::duplex(4096);
                clients.push_back(client);
                servers.push(server);
            }
            let connector = Self {
                streams: Mutex::new(clients),
            };
            (connector, servers)
        }
    }

    impl Connector for ScriptedConnector {
        type Stream = DuplexStream;

        fn connect(&self) -> impl std::future::Future<Output = io::Result<DuplexStream>> + Send {
            let next = self.streams.lock().unwrap().pop_front();
            async move {
                next.ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no more streams"))
            }
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn fast_reconnect() -> ClientConfig {
        ClientConfig::builder()
            .reconnect(ReconnectPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                max_attempts: Some(3),
                ..Default::default()
            })
            .default_timeout(Some(Duration::from_secs(5)))
            .build()
    }

    async fn read_exact(server: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        server.read_exact(&mut buf).await.unwrap();
        buf
    }

    fn incr(conn: &Connection) -> Handle<i64> {
        conn.dispatch(
            CommandType::Other("INCR"),
            CommandArgs::new().add("n"),
            IntegerOutput::new(),
        )
        .unwrap()
    }

    const INCR: &[u8] = b"*2\r\n$4\r\nINCR\r\n$1\r\nn\r\n";

    #[tokio::test]
    async fn test_pipelined_round_trip() {
        let (connector, mut servers) = ScriptedConnector::new(1);
        let conn = Connection::connect(connector, fast_reconnect()).await.unwrap();
        let mut server = servers.remove(0);

        let handles: Vec<_> = (0..3).map(|_| incr(&conn)).collect();
        assert_eq!(read_exact(&mut server, 3 * INCR.len()).await, INCR.repeat(3));

        server.write_all(b":1\r\n:2\r\n:3\r\n").await.unwrap();
        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.wait().await.unwrap());
        }
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(conn.in_flight(), 0);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_reconnect_replays_outstanding_commands() {
        let (connector, mut servers) = ScriptedConnector::new(2);
        let conn = Connection::connect(connector, fast_reconnect()).await.unwrap();
        let mut first = servers.remove(0);
        let mut second = servers.remove(0);

        let handles: Vec<_> = (0..3).map(|_| incr(&conn)).collect();
        read_exact(&mut first, 3 * INCR.len()).await;
        first.write_all(b":1\r\n").await.unwrap();
        drop(first);

        // The two unanswered commands are written again on the new stream.
        assert_eq!(read_exact(&mut second, 2 * INCR.len()).await, INCR.repeat(2));
        second.write_all(b":2\r\n:3\r\n").await.unwrap();

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.wait().await.unwrap());
        }
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(conn.stats().reconnects.load(Ordering::Relaxed), 1);
        assert_eq!(conn.stats().commands_replayed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_protocol_error_forces_reconnect() {
        let (connector, mut servers) = ScriptedConnector::new(2);
        let conn = Connection::connect(connector, fast_reconnect()).await.unwrap();
        let mut first = servers.remove(0);
        let mut second = servers.remove(0);

        let handle = incr(&conn);
        read_exact(&mut first, INCR.len()).await;
        first.write_all(b"!bogus\r\n").await.unwrap();

        assert_eq!(read_exact(&mut second, INCR.len()).await, INCR.to_vec());
        second.write_all(b":7\r\n").await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_close_connection() {
        let (connector, mut servers) = ScriptedConnector::new(1);
        let conn = Connection::connect(connector, fast_reconnect()).await.unwrap();
        let mut server = servers.remove(0);

        let handle = incr(&conn);
        read_exact(&mut server, INCR.len()).await;
        drop(server);

        assert!(matches!(handle.wait().await, Err(ClientError::ConnectionClosed)));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.dispatch(CommandType::Other("PING"), CommandArgs::new(), StatusOutput::new()),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_disabled_closes_on_loss() {
        let (connector, mut servers) = ScriptedConnector::new(1);
        let config = ClientConfig::builder()
            .reconnect(ReconnectPolicy::disabled())
            .build();
        let conn = Connection::connect(connector, config).await.unwrap();

        let handle = incr(&conn);
        drop(servers.remove(0));
        assert!(matches!(handle.wait().await, Err(ClientError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_protocol_error_without_reconnect_reaches_handles() {
        let (connector, mut servers) = ScriptedConnector::new(1);
        let config = ClientConfig::builder()
            .reconnect(ReconnectPolicy::disabled())
            .build();
        let conn = Connection::connect(connector, config).await.unwrap();
        let mut server = servers.remove(0);

        let handle = incr(&conn);
        read_exact(&mut server, INCR.len()).await;
        server.write_all(b"!bogus\r\n").await.unwrap();

        assert!(matches!(
            handle.wait().await,
            Err(ClientError::Protocol(ParseError::UnknownPrefix(b'!')))
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.dispatch(CommandType::Other("PING"), CommandArgs::new(), StatusOutput::new()),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_keep_wire_and_queue_order() {
        const TASKS: usize = 8;
        const PER_TASK: usize = 50;

        let (connector, mut servers) = ScriptedConnector::new(1);
        let conn = Connection::connect(connector, fast_reconnect()).await.unwrap();
        let mut server = servers.remove(0);

        // Echo server: answers every request with its first argument.
        let echo = tokio::spawn(async move {
            let mut decoder = ReplyDecoder::new();
            let mut request = RespOutput::new();
            let mut buf = BytesMut::new();
            let mut answered = 0;
            while answered < TASKS * PER_TASK {
                if server.read_buf(&mut buf).await.unwrap() == 0 {
                    break;
                }
                while let Progress::Complete(_) = decoder.decode(&mut buf, &mut request).unwrap() {
                    let args = request.finish().unwrap();
                    let tag = args.as_array().unwrap()[1].clone();
                    server.write_all(&tag.serialize()).await.unwrap();
                    answered += 1;
                }
            }
            server
        });

        let callers: Vec<_> = (0..TASKS)
            .map(|task| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    let mut handles = Vec::new();
                    for i in 0..PER_TASK {
                        let tag = format!("{}-{}", task, i);
                        let handle = conn
                            .dispatch(
                                CommandType::Other("ECHO"),
                                CommandArgs::new().add(tag.clone()),
                                RespOutput::new(),
                            )
                            .unwrap();
                        handles.push((tag, handle));
                        tokio::task::yield_now().await;
                    }
                    for (tag, handle) in handles {
                        assert_eq!(handle.wait().await.unwrap(), RespValue::bulk_string(tag));
                    }
                })
            })
            .collect();

        for caller in callers {
            caller.await.unwrap();
        }
        let _server = echo.await.unwrap();
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_reject_while_reconnecting() {
        let (connector, mut servers) = ScriptedConnector::new(1);
        let config = ClientConfig::builder()
            .disconnected_behavior(DisconnectedBehavior::Reject)
            .reconnect(ReconnectPolicy {
                initial_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(60),
                ..Default::default()
            })
            .build();
        let conn = Connection::connect(connector, config).await.unwrap();
        drop(servers.remove(0));

        while conn.state() != ConnectionState::Reconnecting {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            conn.dispatch(CommandType::Other("PING"), CommandArgs::new(), StatusOutput::new()),
            Err(ClientError::NotConnected)
        ));
        conn.close();
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_is_idempotent() {
        let (connector, _servers) = ScriptedConnector::new(1);
        let conn = Connection::connect(connector, fast_reconnect()).await.unwrap();

        let handle = incr(&conn);
        conn.close();
        conn.close();
        assert!(matches!(handle.await, Err(ClientError::ConnectionClosed)));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_dropping_last_clone_closes() {
        let (connector, _servers) = ScriptedConnector::new(1);
        let conn = Connection::connect(connector, fast_reconnect()).await.unwrap();
        let clone = conn.clone();

        let handle = incr(&conn);
        drop(conn);
        assert_eq!(clone.in_flight(), 1);
        drop(clone);
        assert!(matches!(handle.await, Err(ClientError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_push_messages_reach_listener() {
        let (connector, mut servers) = ScriptedConnector::new(1);
        let conn = Connection::connect(connector, fast_reconnect()).await.unwrap();
        let mut server = servers.remove(0);
        let mut messages = conn.push_messages();

        let subscribed = conn
            .dispatch(CommandType::Subscribe, CommandArgs::new().add("news"), IntegerOutput::new())
            .unwrap();
        read_exact(&mut server, b"*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n".len()).await;
        server
            .write_all(
                b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n\
                  *3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n",
            )
            .await
            .unwrap();

        assert_eq!(subscribed.wait().await.unwrap(), 1);
        assert!(matches!(
            messages.recv().await,
            Some(PushMessage::Subscription { count: 1, .. })
        ));
        assert_eq!(
            messages.recv().await,
            Some(PushMessage::Message {
                channel: bytes::Bytes::from("news"),
                payload: bytes::Bytes::from("hello"),
            })
        );
        assert!(conn.is_subscribed());
    }
}
