//! Command Catalogue
//!
//! The typed surface over the generic dispatch interface. Every method is a
//! thin wrapper: build arguments, choose an output shape, dispatch.
//!
//! ```text
//! Client::get(key)
//!       │  codec.encode_key
//!       ▼
//! Connection::dispatch(CommandType, CommandArgs, ValueOutput)
//!       │
//!       ▼
//! Handle<Option<V>>
//! ```
//!
//! ## Supported Commands
//!
//! ### String Commands
//! - `GET`, `SET`, `MGET`, `APPEND`
//! - `INCR`, `INCRBY`
//!
//! ### Key Commands
//! - `DEL`, `EXISTS`, `EXPIRE`, `TTL`
//!
//! ### Server / Session Commands
//! - `PING`, `ECHO`, `DBSIZE`, `FLUSHDB`
//! - `AUTH`, `SELECT` (remembered and replayed on reconnect)
//!
//! ### Transactions
//! - `MULTI`, `EXEC`, `DISCARD`, `WATCH`, `UNWATCH`
//!
//! ### Pub/Sub
//! - `PUBLISH`, `SUBSCRIBE`, `UNSUBSCRIBE`, `PSUBSCRIBE`, `PUNSUBSCRIBE`

pub mod client;

pub use client::Client;
