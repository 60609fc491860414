//! RESP Wire Codec
//!
//! This module is the stateless edge of the client: it turns commands into
//! request bytes and incrementally turns reply bytes back into values.
//!
//! ## Modules
//!
//! - `types`: `RespValue`, `CommandType`, `CommandArgs` and request encoding
//! - `parser`: the resumable `ReplyDecoder` state machine
//! - `output`: decode targets that receive parsed elements
//!
//! ## Example
//!
//! ```
//! use flashkv_client::protocol::{encode_command, CommandArgs, CommandType};
//!
//! let wire = encode_command(&CommandType::Other("GET"), &CommandArgs::new().add("name"));
//! assert_eq!(&wire[..], b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
//! ```

pub mod output;
pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use output::{
    BooleanOutput, CommandOutput, IntegerOutput, Output, RespOutput, StatusOutput,
    ValueListOutput, ValueOutput,
};
pub use parser::{ParseError, ParseResult, Progress, ReplyDecoder};
pub use types::{encode_command, CommandArgs, CommandType, RespValue};
