//! All upstream table-sync protocol message types.
//!
//! The bridge and its upstream peer exchange these over one TCP connection.
//! Every message is framed with the 24-byte header described in
//! [`crate::protocol::codec`].

use serde::{Deserialize, Serialize};

use crate::domain::value::Value;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Total size of the common message header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Largest payload a peer may announce in a header (16 MiB).
///
/// Anything larger is treated as a corrupt stream rather than buffered.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

// ── Message type codes ────────────────────────────────────────────────────────

/// All message type codes understood on the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    // Session control (0x00–0x0F)
    Hello = 0x01,
    HelloAck = 0x02,
    Snapshot = 0x03,
    Ping = 0x07,
    Pong = 0x08,
    Disconnect = 0x09,
    Error = 0x0A,
    // Table changes (0x10–0x1F)
    EntryUpdate = 0x10,
    EntryDelete = 0x11,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::HelloAck),
            0x03 => Ok(MessageType::Snapshot),
            0x07 => Ok(MessageType::Ping),
            0x08 => Ok(MessageType::Pong),
            0x09 => Ok(MessageType::Disconnect),
            0x0A => Ok(MessageType::Error),
            0x10 => Ok(MessageType::EntryUpdate),
            0x11 => Ok(MessageType::EntryDelete),
            _ => Err(()),
        }
    }
}

// ── Roles ─────────────────────────────────────────────────────────────────────

/// Which side owns the authoritative table after a (re)connect.
///
/// - `Client`: the upstream peer is authoritative; it sends a `Snapshot`
///   after `HelloAck` and the bridge resyncs to it.
/// - `Source`: the bridge is authoritative; it pushes its whole store as a
///   `Snapshot` after `HelloAck`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SyncRole {
    #[default]
    Client = 0x01,
    Source = 0x02,
}

impl TryFrom<u8> for SyncRole {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(SyncRole::Client),
            0x02 => Ok(SyncRole::Source),
            _ => Err(()),
        }
    }
}

// ── Per-message payload structs ───────────────────────────────────────────────

/// HELLO (0x01): sent by the bridge right after the TCP connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Network identity the bridge announces (shown in the peer's client list).
    pub identity: String,
    /// Protocol version the bridge speaks.
    pub protocol_version: u8,
    pub role: SyncRole,
}

/// HELLO_ACK (0x02): the upstream peer's answer to `Hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAckMessage {
    pub server_identity: String,
    pub accepted: bool,
}

/// One key/value/version triple, used by `Snapshot` and `EntryUpdate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub key: String,
    pub value: Value,
    pub version: u64,
}

/// Reason byte carried by DISCONNECT (0x09).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisconnectReason {
    UserInitiated = 0x01,
    ServerShutdown = 0x02,
    Timeout = 0x03,
    ProtocolError = 0x04,
}

impl TryFrom<u8> for DisconnectReason {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(DisconnectReason::UserInitiated),
            0x02 => Ok(DisconnectReason::ServerShutdown),
            0x03 => Ok(DisconnectReason::Timeout),
            0x04 => Ok(DisconnectReason::ProtocolError),
            _ => Err(()),
        }
    }
}

/// Error code carried by ERROR (0x0A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    ProtocolVersionMismatch = 0x01,
    InvalidMessage = 0x02,
    TypeMismatch = 0x03,
    InvalidKey = 0x04,
    InternalError = 0x05,
}

impl From<u8> for ErrorCode {
    /// Unknown codes collapse to [`ErrorCode::InternalError`].
    fn from(value: u8) -> Self {
        match value {
            0x01 => ErrorCode::ProtocolVersionMismatch,
            0x02 => ErrorCode::InvalidMessage,
            0x03 => ErrorCode::TypeMismatch,
            0x04 => ErrorCode::InvalidKey,
            _ => ErrorCode::InternalError,
        }
    }
}

/// ERROR (0x0A): a non-fatal complaint about a previous message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub description: String,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// Every message that can travel over the upstream link.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    Hello(HelloMessage),
    HelloAck(HelloAckMessage),
    /// Full table state, sent by whichever side is authoritative.
    Snapshot(Vec<EntryRecord>),
    Ping(u64),
    Pong(u64),
    Disconnect { reason: DisconnectReason },
    Error(ErrorMessage),
    EntryUpdate(EntryRecord),
    EntryDelete { key: String, version: u64 },
}

impl SyncMessage {
    /// Returns the wire type code for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            SyncMessage::Hello(_) => MessageType::Hello,
            SyncMessage::HelloAck(_) => MessageType::HelloAck,
            SyncMessage::Snapshot(_) => MessageType::Snapshot,
            SyncMessage::Ping(_) => MessageType::Ping,
            SyncMessage::Pong(_) => MessageType::Pong,
            SyncMessage::Disconnect { .. } => MessageType::Disconnect,
            SyncMessage::Error(_) => MessageType::Error,
            SyncMessage::EntryUpdate(_) => MessageType::EntryUpdate,
            SyncMessage::EntryDelete { .. } => MessageType::EntryDelete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_byte_round_trips() {
        let all = [
            MessageType::Hello,
            MessageType::HelloAck,
            MessageType::Snapshot,
            MessageType::Ping,
            MessageType::Pong,
            MessageType::Disconnect,
            MessageType::Error,
            MessageType::EntryUpdate,
            MessageType::EntryDelete,
        ];
        for t in all {
            assert_eq!(MessageType::try_from(t as u8), Ok(t));
        }
    }

    #[test]
    fn test_unknown_message_type_byte_is_rejected() {
        assert!(MessageType::try_from(0x40).is_err());
        assert!(MessageType::try_from(0x00).is_err());
    }

    #[test]
    fn test_unknown_error_code_maps_to_internal_error() {
        assert_eq!(ErrorCode::from(0xEE), ErrorCode::InternalError);
        assert_eq!(ErrorCode::from(0x03), ErrorCode::TypeMismatch);
    }

    #[test]
    fn test_sync_role_defaults_to_client_and_parses_lowercase() {
        assert_eq!(SyncRole::default(), SyncRole::Client);
        let role: SyncRole = serde_json::from_str("\"source\"").unwrap();
        assert_eq!(role, SyncRole::Source);
    }

    #[test]
    fn test_message_type_matches_variant() {
        let msg = SyncMessage::EntryDelete {
            key: "/a".to_string(),
            version: 4,
        };
        assert_eq!(msg.message_type(), MessageType::EntryDelete);
        assert_eq!(SyncMessage::Ping(1).message_type(), MessageType::Ping);
    }
}
