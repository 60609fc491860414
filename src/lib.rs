//! # FlashKV Client - A Pipelined, Auto-Reconnecting RESP Client
//!
//! `flashkv-client` drives many concurrent callers over a single persistent
//! connection to a RESP (Redis-compatible) key-value server. Commands are
//! written as soon as they are dispatched; replies are matched back to their
//! callers strictly in order.
//!
//! ## Features
//!
//! - **Pipelining**: dispatch returns a handle immediately; no round trip per command
//! - **Resumable decoding**: replies split across any number of reads decode incrementally
//! - **Auto-reconnect**: a lost connection is re-established with backoff and every
//!   unanswered command is replayed in its original order
//! - **Transactions**: `MULTI` / `EXEC` with per-command results and an aggregate
//! - **Pub/Sub**: push messages delivered to listeners alongside ordinary replies
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                           flashkv-client                              │
//! │                                                                       │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐  │
//! │  │   Client    │───>│  Connection (Mutex<Pipeline>)                │  │
//! │  │ (commands)  │    │  ┌──────────┐ ┌─────────────┐ ┌───────────┐  │  │
//! │  └─────────────┘    │  │ InFlight │ │ Transaction │ │   Push    │  │  │
//! │                     │  │  Queue   │ │   Buffer    │ │  Channel  │  │  │
//! │  ┌─────────────┐    │  └──────────┘ └─────────────┘ └───────────┘  │  │
//! │  │    RESP     │<──>│                ReplyDecoder                  │  │
//! │  │  protocol   │    └──────────────────────┬───────────────────────┘  │
//! │  └─────────────┘                           │                          │
//! │                     ┌──────────────────────┴───────────────────────┐  │
//! │                     │        Supervisor (Background Tokio Task)    │  │
//! │                     │    read loop · write loop · reconnect/replay │  │
//! │                     └──────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flashkv_client::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> flashkv_client::Result<()> {
//!     let client = Client::open("127.0.0.1:6379", ClientConfig::default()).await?;
//!
//!     // Both commands are written before either reply arrives.
//!     let set = client.set(&"name".to_string(), &"Ariz".to_string())?;
//!     let get = client.get(&"name".to_string())?;
//!
//!     assert_eq!(set.await?, "OK");
//!     assert_eq!(get.await?, Some("Ariz".to_string()));
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP encoding, the resumable reply decoder and decode targets
//! - [`connection`]: the pipeline, its supervisor and the `Connection` facade
//! - [`commands`]: the typed command catalogue
//! - [`codec`]: key/value conversion to and from wire bytes
//! - [`config`]: connection settings and reconnect policy
//! - [`error`]: the error taxonomy

pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;

// Re-export commonly used types for convenience
pub use codec::{BytesCodec, Codec, Utf8Codec};
pub use commands::Client;
pub use config::{ClientConfig, DisconnectedBehavior, ReconnectPolicy};
pub use connection::{
    Connection, ConnectionState, Handle, PushMessage, PushReceiver, TcpConnector,
};
pub use error::{ClientError, Result};
pub use protocol::{CommandArgs, CommandType, ParseError, ReplyDecoder, RespValue};

/// The default port RESP servers listen on
pub const DEFAULT_PORT: u16 = 6379;

/// The default host the launcher connects to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of the client
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
