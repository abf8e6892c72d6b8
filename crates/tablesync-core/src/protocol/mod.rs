//! Upstream wire protocol: message types, binary codec, sequence numbering.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{decode_message, encode_message, encode_message_now, ProtocolError};
pub use messages::*;
pub use sequence::SequenceCounter;
