//! Protocol translation between the table store and its two kinds of peers.
//!
//! Pure functions only: no sockets, no tasks, no store mutation.  The
//! infrastructure layer feeds frames in and writes the results out.
//!
//! ```text
//! Browser → Store:   JSON text   → BrowserToBridgeMsg → PeerCommand
//! Store   → Browser: ChangeEvent → BridgeToBrowserMsg → JSON text
//! Store   → Upstream: ChangeEvent / PendingWrite → SyncMessage → binary
//! Upstream → Store:  binary → SyncMessage → UpstreamAction
//! ```

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tracing::{debug, error, warn};

use tablesync_core::protocol::messages::{
    DisconnectReason, EntryRecord, ErrorMessage, HelloMessage, PROTOCOL_VERSION,
};
use tablesync_core::protocol::SyncRole;
use tablesync_core::{encode_message, ChangeEvent, ChangeKind, Entry, ProtocolError, SyncMessage, Value};

use crate::domain::messages::{BridgeToBrowserMsg, BrowserToBridgeMsg, WireValue};

// ── Error type ────────────────────────────────────────────────────────────────

/// A browser frame that cannot be turned into a command.
///
/// The session answers with an `Error` message and keeps going.
#[derive(Debug, Error, PartialEq)]
pub enum TransportError {
    #[error("invalid JSON message: {0}")]
    InvalidJson(String),

    #[error("raw value is not valid base64: {0}")]
    InvalidBase64(String),
}

// ── Values ────────────────────────────────────────────────────────────────────

/// Converts a store value into its JSON form.
pub fn value_to_wire(value: &Value) -> WireValue {
    match value {
        Value::Boolean(b) => WireValue::Boolean(*b),
        Value::Double(d) => WireValue::Double(*d),
        Value::String(s) => WireValue::String(s.clone()),
        Value::Raw(bytes) => WireValue::Raw(BASE64.encode(bytes)),
        Value::BooleanArray(v) => WireValue::BooleanArray(v.clone()),
        Value::DoubleArray(v) => WireValue::DoubleArray(v.clone()),
        Value::StringArray(v) => WireValue::StringArray(v.clone()),
    }
}

/// Converts a JSON value into a store value.
///
/// # Errors
///
/// Returns [`TransportError::InvalidBase64`] for a raw value that does not
/// decode.
pub fn wire_to_value(value: WireValue) -> Result<Value, TransportError> {
    Ok(match value {
        WireValue::Boolean(b) => Value::Boolean(b),
        WireValue::Double(d) => Value::Double(d),
        WireValue::String(s) => Value::String(s),
        WireValue::Raw(encoded) => Value::Raw(
            BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| TransportError::InvalidBase64(e.to_string()))?,
        ),
        WireValue::BooleanArray(v) => Value::BooleanArray(v),
        WireValue::DoubleArray(v) => Value::DoubleArray(v),
        WireValue::StringArray(v) => Value::StringArray(v),
    })
}

// ── Browser → Store ───────────────────────────────────────────────────────────

/// What a browser asked the bridge to do.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    Subscribe(String),
    Unsubscribe(String),
    Set { key: String, value: Value },
    Delete { key: String },
    Ping(u64),
}

/// Parses one browser text frame into a [`PeerCommand`].
///
/// # Errors
///
/// [`TransportError::InvalidJson`] for frames that are not a known message,
/// [`TransportError::InvalidBase64`] for undecodable raw values.
pub fn parse_browser_frame(text: &str) -> Result<PeerCommand, TransportError> {
    let msg: BrowserToBridgeMsg =
        serde_json::from_str(text).map_err(|e| TransportError::InvalidJson(e.to_string()))?;
    debug!("browser → {}", msg.type_name());
    browser_to_command(msg)
}

/// Translates a parsed browser message into a [`PeerCommand`].
///
/// # Errors
///
/// See [`parse_browser_frame`].
pub fn browser_to_command(msg: BrowserToBridgeMsg) -> Result<PeerCommand, TransportError> {
    Ok(match msg {
        BrowserToBridgeMsg::Subscribe { prefix } => PeerCommand::Subscribe(prefix),
        BrowserToBridgeMsg::Unsubscribe { prefix } => PeerCommand::Unsubscribe(prefix),
        BrowserToBridgeMsg::Set { key, value } => PeerCommand::Set {
            key,
            value: wire_to_value(value)?,
        },
        BrowserToBridgeMsg::Delete { key } => PeerCommand::Delete { key },
        BrowserToBridgeMsg::Ping { token } => PeerCommand::Ping(token),
    })
}

// ── Store → Browser ───────────────────────────────────────────────────────────

/// Translates a change event into the browser message that announces it.
pub fn event_to_browser(event: &ChangeEvent) -> BridgeToBrowserMsg {
    match (&event.kind, &event.value) {
        (ChangeKind::Deleted, _) | (_, None) => BridgeToBrowserMsg::EntryDeleted {
            key: event.key.clone(),
            version: event.version,
        },
        (_, Some(value)) => BridgeToBrowserMsg::EntryUpdate {
            key: event.key.clone(),
            value: value_to_wire(value),
            version: event.version,
        },
    }
}

// ── Store → Upstream ──────────────────────────────────────────────────────────

/// The upstream message that replicates a change event.
pub fn event_to_upstream(event: &ChangeEvent) -> SyncMessage {
    match &event.value {
        Some(value) => SyncMessage::EntryUpdate(EntryRecord {
            key: event.key.clone(),
            value: value.clone(),
            version: event.version,
        }),
        None => SyncMessage::EntryDelete {
            key: event.key.clone(),
            version: event.version,
        },
    }
}

/// A full-state `Snapshot` message built from live store entries.
pub fn snapshot_message(entries: &[Entry]) -> SyncMessage {
    SyncMessage::Snapshot(
        entries
            .iter()
            .filter_map(|e| {
                e.value.as_ref().map(|value| EntryRecord {
                    key: e.key.clone(),
                    value: value.clone(),
                    version: e.version,
                })
            })
            .collect(),
    )
}

/// The frames a source-of-truth bridge pushes after connecting.
///
/// Normally one `Snapshot`.  When the whole store does not fit in a single
/// frame, every live entry goes out as its own `EntryUpdate` instead: the
/// peer still receives every value, but keys it holds that are gone here
/// are not removed.  An entry too large for any frame is left out.
pub fn source_snapshot_frames(entries: &[Entry]) -> Vec<SyncMessage> {
    let snapshot = snapshot_message(entries);
    let Err(ProtocolError::PayloadTooLarge { len, max }) = encode_message(&snapshot, 0, 0) else {
        return vec![snapshot];
    };
    error!(
        "snapshot of {} entries is {len} bytes (limit {max}); sending entry updates instead",
        entries.len()
    );
    let SyncMessage::Snapshot(records) = snapshot else {
        return Vec::new();
    };
    records
        .into_iter()
        .filter_map(|record| {
            let key = record.key.clone();
            let msg = SyncMessage::EntryUpdate(record);
            match encode_message(&msg, 0, 0) {
                Ok(_) => Some(msg),
                Err(e) => {
                    warn!("not sending {key:?} upstream: {e}");
                    None
                }
            }
        })
        .collect()
}

/// The `Hello` the bridge opens every upstream connection with.
pub fn hello_message(identity: &str, role: SyncRole) -> SyncMessage {
    SyncMessage::Hello(HelloMessage {
        identity: identity.to_string(),
        protocol_version: PROTOCOL_VERSION,
        role,
    })
}

// ── Upstream → Store ──────────────────────────────────────────────────────────

/// What the supervisor should do with one upstream message.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamAction {
    /// Write `value` under `key`.
    Apply { key: String, value: Value },
    /// Tombstone `key`.
    Remove { key: String },
    /// Replace the table with this authoritative state.
    Resync(Vec<(String, Value)>),
    /// Send this message back upstream.
    Reply(SyncMessage),
    /// The keepalive answer for `token` arrived.
    KeepaliveAck(u64),
    /// Handshake answer.
    Handshake { server_identity: String, accepted: bool },
    /// The peer is closing the connection.
    Closed(DisconnectReason),
    /// The peer complained about something we sent.
    PeerError(ErrorMessage),
    /// Nothing to do (e.g. a `Hello` sent to us by mistake).
    Ignore,
}

/// Translates one decoded upstream message into an [`UpstreamAction`].
pub fn upstream_to_action(msg: SyncMessage) -> UpstreamAction {
    match msg {
        SyncMessage::EntryUpdate(record) => UpstreamAction::Apply {
            key: record.key,
            value: record.value,
        },
        SyncMessage::EntryDelete { key, .. } => UpstreamAction::Remove { key },
        SyncMessage::Snapshot(records) => {
            UpstreamAction::Resync(records.into_iter().map(|r| (r.key, r.value)).collect())
        }
        SyncMessage::Ping(token) => UpstreamAction::Reply(SyncMessage::Pong(token)),
        SyncMessage::Pong(token) => UpstreamAction::KeepaliveAck(token),
        SyncMessage::HelloAck(ack) => UpstreamAction::Handshake {
            server_identity: ack.server_identity,
            accepted: ack.accepted,
        },
        SyncMessage::Disconnect { reason } => UpstreamAction::Closed(reason),
        SyncMessage::Error(err) => UpstreamAction::PeerError(err),
        SyncMessage::Hello(_) => UpstreamAction::Ignore,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_core::protocol::messages::MAX_PAYLOAD_LEN;
    use tablesync_core::WriterId;

    fn change(kind: ChangeKind, value: Option<Value>) -> ChangeEvent {
        ChangeEvent {
            key: "/SmartDashboard/x".to_string(),
            kind,
            value,
            version: 3,
            writer: WriterId::new("test"),
        }
    }

    #[test]
    fn test_raw_values_travel_as_base64() {
        // Arrange
        let value = Value::Raw(vec![0, 1, 2, 255]);

        // Act
        let wire = value_to_wire(&value);

        // Assert
        assert_eq!(wire, WireValue::Raw("AAEC/w==".to_string()));
        assert_eq!(wire_to_value(wire).unwrap(), value);
    }

    #[test]
    fn test_bad_base64_is_rejected() {
        let result = wire_to_value(WireValue::Raw("***".to_string()));
        assert!(matches!(result, Err(TransportError::InvalidBase64(_))));
    }

    #[test]
    fn test_parse_set_frame() {
        // Arrange
        let frame = r#"{"type":"Set","key":"/a","value":{"kind":"boolean","value":true}}"#;

        // Act
        let cmd = parse_browser_frame(frame).unwrap();

        // Assert
        assert_eq!(
            cmd,
            PeerCommand::Set {
                key: "/a".to_string(),
                value: Value::Boolean(true)
            }
        );
    }

    #[test]
    fn test_malformed_frame_is_invalid_json() {
        assert!(matches!(
            parse_browser_frame("{not json"),
            Err(TransportError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_browser_frame(r#"{"type":"Subscribe"}"#),
            Err(TransportError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_delete_event_becomes_entry_deleted() {
        let msg = event_to_browser(&change(ChangeKind::Deleted, None));
        assert_eq!(
            msg,
            BridgeToBrowserMsg::EntryDeleted {
                key: "/SmartDashboard/x".to_string(),
                version: 3
            }
        );
    }

    #[test]
    fn test_update_event_becomes_entry_update() {
        let msg = event_to_browser(&change(ChangeKind::Updated, Some(Value::Double(2.0))));
        assert!(matches!(
            msg,
            BridgeToBrowserMsg::EntryUpdate { version: 3, value: WireValue::Double(d), .. } if d == 2.0
        ));
    }

    #[test]
    fn test_event_to_upstream_maps_tombstone_to_entry_delete() {
        let msg = event_to_upstream(&change(ChangeKind::Deleted, None));
        assert_eq!(
            msg,
            SyncMessage::EntryDelete {
                key: "/SmartDashboard/x".to_string(),
                version: 3
            }
        );
    }

    #[test]
    fn test_upstream_ping_is_answered_with_pong() {
        assert_eq!(
            upstream_to_action(SyncMessage::Ping(77)),
            UpstreamAction::Reply(SyncMessage::Pong(77))
        );
    }

    #[test]
    fn test_upstream_snapshot_becomes_resync() {
        // Arrange
        let msg = SyncMessage::Snapshot(vec![EntryRecord {
            key: "/a".to_string(),
            value: Value::Double(1.0),
            version: 9,
        }]);

        // Act
        let action = upstream_to_action(msg);

        // Assert
        assert_eq!(
            action,
            UpstreamAction::Resync(vec![("/a".to_string(), Value::Double(1.0))])
        );
    }

    #[test]
    fn test_snapshot_message_skips_tombstones() {
        let entries = vec![
            Entry {
                key: "/live".to_string(),
                value: Some(Value::Double(1.0)),
                version: 1,
                writer: WriterId::new("w"),
                modified_us: 0,
            },
            Entry {
                key: "/dead".to_string(),
                value: None,
                version: 2,
                writer: WriterId::new("w"),
                modified_us: 0,
            },
        ];
        let SyncMessage::Snapshot(records) = snapshot_message(&entries) else {
            panic!("expected snapshot");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "/live");
    }

    fn live(key: &str, value: Value) -> Entry {
        Entry {
            key: key.to_string(),
            value: Some(value),
            version: 1,
            writer: WriterId::new("w"),
            modified_us: 0,
        }
    }

    #[test]
    fn test_small_store_is_pushed_as_one_snapshot() {
        let entries = vec![live("/a", Value::Double(1.0)), live("/b", Value::from("x"))];

        let frames = source_snapshot_frames(&entries);

        assert_eq!(frames, vec![snapshot_message(&entries)]);
    }

    #[test]
    fn test_oversized_store_is_pushed_entry_by_entry() {
        // Arrange: one value alone exceeds the frame limit
        let huge = vec![0u8; MAX_PAYLOAD_LEN + 1];
        let entries = vec![
            live("/huge", Value::Raw(huge)),
            live("/small", Value::Double(2.0)),
        ];

        // Act
        let frames = source_snapshot_frames(&entries);

        // Assert
        assert_eq!(
            frames,
            vec![SyncMessage::EntryUpdate(EntryRecord {
                key: "/small".to_string(),
                value: Value::Double(2.0),
                version: 1,
            })]
        );
    }

    #[test]
    fn test_hello_announces_identity_and_role() {
        let SyncMessage::Hello(hello) = hello_message("dash", SyncRole::Source) else {
            panic!("expected hello");
        };
        assert_eq!(hello.identity, "dash");
        assert_eq!(hello.role, SyncRole::Source);
        assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
    }
}
