//! Typed Command Client
//!
//! One method per server command. Each builds its arguments through the
//! injected [`Codec`], picks the output shape for the reply and dispatches
//! through [`Connection::dispatch`]. Nothing here touches the queue, the
//! decoder or the supervisor.
//!
//! Methods return a [`Handle`] as soon as the command is written, so several
//! commands can be pipelined before any reply is awaited:
//!
//! ```ignore
//! let client = Client::open("127.0.0.1:6379", ClientConfig::default()).await?;
//! let set = client.set(&"k".to_string(), &"v".to_string())?;
//! let get = client.get(&"k".to_string())?;
//! assert_eq!(set.await?, "OK");
//! assert_eq!(get.await?, Some("v".to_string()));
//! ```

use crate::codec::{Codec, Utf8Codec};
use crate::config::ClientConfig;
use crate::connection::{Connection, Handle, PushReceiver};
use crate::error::Result;
use crate::protocol::{
    BooleanOutput, CommandArgs, CommandType, IntegerOutput, RespOutput, RespValue, StatusOutput,
    ValueListOutput, ValueOutput,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// A command client over one [`Connection`].
#[derive(Debug)]
pub struct Client<C: Codec = Utf8Codec> {
    conn: Connection,
    codec: Arc<C>,
}

impl<C: Codec> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl Client<Utf8Codec> {
    /// Connects over TCP with UTF-8 string keys and values.
    pub async fn open(addr: impl Into<String>, config: ClientConfig) -> Result<Self> {
        let conn = Connection::open(addr, config).await?;
        Ok(Self::new(conn, Utf8Codec))
    }
}

impl<C: Codec> Client<C> {
    pub fn new(conn: Connection, codec: C) -> Self {
        Self {
            conn,
            codec: Arc::new(codec),
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn key(&self, key: &C::Key) -> Bytes {
        self.codec.encode_key(key)
    }

    fn keys(&self, keys: &[C::Key]) -> CommandArgs {
        CommandArgs::new().add_all(keys.iter().map(|key| self.key(key)))
    }

    fn value(&self, value: &C::Value) -> Bytes {
        self.codec.encode_value(value)
    }

    fn value_output(&self) -> ValueOutput<C> {
        ValueOutput::new(Arc::clone(&self.codec))
    }

    // =========================================================================
    // Server Commands
    // =========================================================================

    pub fn ping(&self) -> Result<Handle<String>> {
        self.conn
            .dispatch(CommandType::Other("PING"), CommandArgs::new(), StatusOutput::new())
    }

    pub fn echo(&self, message: &C::Value) -> Result<Handle<Option<C::Value>>> {
        let args = CommandArgs::new().add(self.value(message));
        self.conn
            .dispatch(CommandType::Other("ECHO"), args, self.value_output())
    }

    pub fn dbsize(&self) -> Result<Handle<i64>> {
        self.conn
            .dispatch(CommandType::Other("DBSIZE"), CommandArgs::new(), IntegerOutput::new())
    }

    pub fn flushdb(&self) -> Result<Handle<String>> {
        self.conn
            .dispatch(CommandType::Other("FLUSHDB"), CommandArgs::new(), StatusOutput::new())
    }

    /// Authenticates; on success the password is sent again after every
    /// reconnect.
    pub async fn auth(&self, password: &str) -> Result<String> {
        let args = CommandArgs::new().add(password.to_string());
        let reply = self
            .conn
            .dispatch(CommandType::Auth, args, StatusOutput::new())?
            .wait()
            .await?;
        self.conn.remember_password(Some(password.to_string()));
        debug!("AUTH accepted, will be replayed on reconnect");
        Ok(reply)
    }

    /// Switches database; on success the index is selected again after
    /// every reconnect.
    pub async fn select(&self, database: u32) -> Result<String> {
        let args = CommandArgs::new().add_int(i64::from(database));
        let reply = self
            .conn
            .dispatch(CommandType::Select, args, StatusOutput::new())?
            .wait()
            .await?;
        self.conn.remember_database(database);
        debug!(database = database, "SELECT accepted, will be replayed on reconnect");
        Ok(reply)
    }

    // =========================================================================
    // String Commands
    // =========================================================================

    pub fn get(&self, key: &C::Key) -> Result<Handle<Option<C::Value>>> {
        let args = CommandArgs::new().add(self.key(key));
        self.conn
            .dispatch(CommandType::Other("GET"), args, self.value_output())
    }

    pub fn set(&self, key: &C::Key, value: &C::Value) -> Result<Handle<String>> {
        let args = CommandArgs::new().add(self.key(key)).add(self.value(value));
        self.conn
            .dispatch(CommandType::Other("SET"), args, StatusOutput::new())
    }

    pub fn mget(&self, keys: &[C::Key]) -> Result<Handle<Vec<Option<C::Value>>>> {
        let output = ValueListOutput::new(Arc::clone(&self.codec));
        self.conn
            .dispatch(CommandType::Other("MGET"), self.keys(keys), output)
    }

    pub fn append(&self, key: &C::Key, value: &C::Value) -> Result<Handle<i64>> {
        let args = CommandArgs::new().add(self.key(key)).add(self.value(value));
        self.conn
            .dispatch(CommandType::Other("APPEND"), args, IntegerOutput::new())
    }

    pub fn incr(&self, key: &C::Key) -> Result<Handle<i64>> {
        let args = CommandArgs::new().add(self.key(key));
        self.conn
            .dispatch(CommandType::Other("INCR"), args, IntegerOutput::new())
    }

    pub fn incrby(&self, key: &C::Key, delta: i64) -> Result<Handle<i64>> {
        let args = CommandArgs::new().add(self.key(key)).add_int(delta);
        self.conn
            .dispatch(CommandType::Other("INCRBY"), args, IntegerOutput::new())
    }

    // =========================================================================
    // Key Commands
    // =========================================================================

    /// Returns the number of keys removed.
    pub fn del(&self, keys: &[C::Key]) -> Result<Handle<i64>> {
        self.conn
            .dispatch(CommandType::Other("DEL"), self.keys(keys), IntegerOutput::new())
    }

    /// Returns how many of the keys exist.
    pub fn exists(&self, keys: &[C::Key]) -> Result<Handle<i64>> {
        self.conn
            .dispatch(CommandType::Other("EXISTS"), self.keys(keys), IntegerOutput::new())
    }

    pub fn expire(&self, key: &C::Key, seconds: u64) -> Result<Handle<bool>> {
        let args = CommandArgs::new()
            .add(self.key(key))
            .add(seconds.to_string());
        self.conn
            .dispatch(CommandType::Other("EXPIRE"), args, BooleanOutput::new())
    }

    /// Remaining time to live in seconds; `-1` without expiry, `-2` if the
    /// key does not exist.
    pub fn ttl(&self, key: &C::Key) -> Result<Handle<i64>> {
        let args = CommandArgs::new().add(self.key(key));
        self.conn
            .dispatch(CommandType::Other("TTL"), args, IntegerOutput::new())
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Opens a transaction. Until [`exec`](Self::exec) or
    /// [`discard`](Self::discard), commands are queued server-side and their
    /// handles resolve when EXEC is answered.
    pub fn multi(&self) -> Result<Handle<String>> {
        self.conn
            .dispatch(CommandType::Multi, CommandArgs::new(), StatusOutput::new())
    }

    pub fn exec(&self) -> Result<Handle<Vec<RespValue>>> {
        self.conn.exec()
    }

    pub fn discard(&self) -> Result<Handle<String>> {
        self.conn
            .dispatch(CommandType::Discard, CommandArgs::new(), StatusOutput::new())
    }

    pub fn watch(&self, keys: &[C::Key]) -> Result<Handle<String>> {
        self.conn
            .dispatch(CommandType::Other("WATCH"), self.keys(keys), StatusOutput::new())
    }

    pub fn unwatch(&self) -> Result<Handle<String>> {
        self.conn
            .dispatch(CommandType::Other("UNWATCH"), CommandArgs::new(), StatusOutput::new())
    }

    // =========================================================================
    // Pub/Sub
    // =========================================================================

    /// Returns the number of subscribers that received the message.
    pub fn publish(&self, channel: &C::Key, message: &C::Value) -> Result<Handle<i64>> {
        let args = CommandArgs::new()
            .add(self.key(channel))
            .add(self.value(message));
        self.conn
            .dispatch(CommandType::Other("PUBLISH"), args, IntegerOutput::new())
    }

    /// Resolves with the subscription count after the last confirmation.
    pub fn subscribe(&self, channels: &[C::Key]) -> Result<Handle<i64>> {
        self.conn
            .dispatch(CommandType::Subscribe, self.keys(channels), IntegerOutput::new())
    }

    /// Without channels, unsubscribes from all of them.
    pub fn unsubscribe(&self, channels: &[C::Key]) -> Result<Handle<i64>> {
        self.conn
            .dispatch(CommandType::Unsubscribe, self.keys(channels), IntegerOutput::new())
    }

    pub fn psubscribe(&self, patterns: &[C::Key]) -> Result<Handle<i64>> {
        self.conn
            .dispatch(CommandType::PSubscribe, self.keys(patterns), IntegerOutput::new())
    }

    pub fn punsubscribe(&self, patterns: &[C::Key]) -> Result<Handle<i64>> {
        self.conn
            .dispatch(CommandType::PUnsubscribe, self.keys(patterns), IntegerOutput::new())
    }

    /// Registers a listener for published messages and confirmations.
    pub fn push_messages(&self) -> PushReceiver {
        self.conn.push_messages()
    }

    // =========================================================================
    // Generic
    // =========================================================================

    /// Sends any command by name and returns the raw reply tree.
    pub fn raw(&self, name: &'static str, args: CommandArgs) -> Result<Handle<RespValue>> {
        self.conn
            .dispatch(CommandType::Other(name), args, RespOutput::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BytesCodec;
    use crate::error::ClientError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Starts a server that expects each request in turn and answers it with
    /// the paired reply.
    async fn scripted_server(exchanges: Vec<(&'static str, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for (request, reply) in exchanges {
                let mut buf = vec![0u8; request.len()];
                socket.read_exact(&mut buf).await.unwrap();
                assert_eq!(String::from_utf8_lossy(&buf), request);
                socket.write_all(reply.as_bytes()).await.unwrap();
            }
            // Hold the socket open until the client goes away.
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });

        addr.to_string()
    }

    #[tokio::test]
    async fn test_set_get() {
        let addr = scripted_server(vec![
            ("*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$4\r\nAriz\r\n", "+OK\r\n"),
            ("*2\r\n$3\r\nGET\r\n$4\r\nname\r\n", "$4\r\nAriz\r\n"),
        ])
        .await;
        let client = Client::open(addr, ClientConfig::default()).await.unwrap();

        let set = client.set(&"name".to_string(), &"Ariz".to_string()).unwrap();
        let get = client.get(&"name".to_string()).unwrap();
        assert_eq!(set.wait().await.unwrap(), "OK");
        assert_eq!(get.wait().await.unwrap(), Some("Ariz".to_string()));
    }

    #[tokio::test]
    async fn test_get_missing_and_mget() {
        let addr = scripted_server(vec![
            ("*2\r\n$3\r\nGET\r\n$4\r\nnope\r\n", "$-1\r\n"),
            ("*3\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n", "*2\r\n$1\r\n1\r\n$-1\r\n"),
        ])
        .await;
        let client = Client::open(addr, ClientConfig::default()).await.unwrap();

        assert_eq!(client.get(&"nope".to_string()).unwrap().wait().await.unwrap(), None);
        let values = client
            .mget(&["a".to_string(), "b".to_string()])
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(values, vec![Some("1".to_string()), None]);
    }

    #[tokio::test]
    async fn test_integer_and_flag_replies() {
        let addr = scripted_server(vec![
            ("*3\r\n$6\r\nINCRBY\r\n$1\r\nc\r\n$2\r\n10\r\n", ":10\r\n"),
            ("*3\r\n$6\r\nEXPIRE\r\n$1\r\nc\r\n$2\r\n60\r\n", ":1\r\n"),
            ("*2\r\n$3\r\nTTL\r\n$1\r\nc\r\n", ":60\r\n"),
            ("*3\r\n$3\r\nDEL\r\n$1\r\nc\r\n$1\r\nd\r\n", ":1\r\n"),
        ])
        .await;
        let client = Client::open(addr, ClientConfig::default()).await.unwrap();
        let key = "c".to_string();

        let incr = client.incrby(&key, 10).unwrap();
        let expire = client.expire(&key, 60).unwrap();
        let ttl = client.ttl(&key).unwrap();
        let del = client.del(&[key.clone(), "d".to_string()]).unwrap();

        assert_eq!(incr.wait().await.unwrap(), 10);
        assert!(expire.wait().await.unwrap());
        assert_eq!(ttl.wait().await.unwrap(), 60);
        assert_eq!(del.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_server_error_reply() {
        let addr = scripted_server(vec![("*2\r\n$4\r\nINCR\r\n$1\r\ns\r\n", "-ERR value is not an integer or out of range\r\n")])
        .await;
        let client = Client::open(addr, ClientConfig::default()).await.unwrap();

        match client.incr(&"s".to_string()).unwrap().wait().await {
            Err(ClientError::Server(msg)) => assert!(msg.contains("not an integer")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transaction() {
        let addr = scripted_server(vec![
            ("*1\r\n$5\r\nMULTI\r\n", "+OK\r\n"),
            ("*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n", "+QUEUED\r\n"),
            ("*2\r\n$4\r\nINCR\r\n$1\r\nn\r\n", "+QUEUED\r\n"),
            ("*1\r\n$4\r\nEXEC\r\n", "*2\r\n+OK\r\n:1\r\n"),
        ])
        .await;
        let client = Client::open(addr, ClientConfig::default()).await.unwrap();

        let multi = client.multi().unwrap();
        let set = client.set(&"k".to_string(), &"v".to_string()).unwrap();
        let incr = client.incr(&"n".to_string()).unwrap();
        assert!(client.connection().is_transaction_open());
        let exec = client.exec().unwrap();

        assert_eq!(multi.wait().await.unwrap(), "OK");
        assert_eq!(
            exec.wait().await.unwrap(),
            vec![RespValue::ok(), RespValue::Integer(1)]
        );
        assert_eq!(set.wait().await.unwrap(), "OK");
        assert_eq!(incr.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_select_and_auth() {
        let addr = scripted_server(vec![
            ("*2\r\n$4\r\nAUTH\r\n$2\r\npw\r\n", "+OK\r\n"),
            ("*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n", "+OK\r\n"),
        ])
        .await;
        let client = Client::open(addr, ClientConfig::default()).await.unwrap();

        assert_eq!(client.auth("pw").await.unwrap(), "OK");
        assert_eq!(client.select(3).await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn test_bytes_codec_and_raw() {
        let addr = scripted_server(vec![
            ("*2\r\n$4\r\nECHO\r\n$2\r\n\x00\x7f\r\n", "$2\r\n\x00\x7f\r\n"),
            ("*2\r\n$6\r\nLRANGE\r\n$1\r\nl\r\n", "*1\r\n$1\r\nx\r\n"),
        ])
        .await;
        let conn = Connection::open(addr, ClientConfig::default()).await.unwrap();
        let client = Client::new(conn, BytesCodec);

        let echoed = client
            .echo(&Bytes::from_static(b"\x00\x7f"))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(echoed, Some(Bytes::from_static(b"\x00\x7f")));

        let raw = client
            .raw("LRANGE", CommandArgs::new().add("l"))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(raw, RespValue::array(vec![RespValue::bulk_string("x")]));
    }
}
