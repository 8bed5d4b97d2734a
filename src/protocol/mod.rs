//! Peer wire protocol
//!
//! Message codec, handshake, and length-prefixed framing.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{EncryptionPolicy, Handshake, PROTOCOL_NAME};
pub use message::{Message, MessageId};
pub use wire::Wire;
