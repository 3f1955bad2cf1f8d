//! Wire protocol for peer communication.
//!
//! - Message catalogue (one tagged enum, `command` discriminator)
//! - Line encoding (newline-delimited JSON) and decode error kinds
//! - Request/response correlation keys

pub mod encoding;
pub mod message;

pub use encoding::{ProtocolError, MAX_MESSAGE_SIZE};
pub use message::{Message, COMMANDS};
