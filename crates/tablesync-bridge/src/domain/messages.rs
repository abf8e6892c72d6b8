//! JSON message types for the browser-facing WebSocket protocol.
//!
//! The upstream link uses the compact binary codec from `tablesync-core`.
//! Browsers speak JSON, so the bridge exposes a JSON view of the table.
//!
//! # Message flow
//!
//! ```text
//! Browser → Bridge:  JSON text frame  →  BrowserToBridgeMsg
//! Bridge  → Browser: ChangeEvent      →  BridgeToBrowserMsg  →  JSON text frame
//! ```
//!
//! # JSON discriminant
//!
//! Every message is a JSON object with a `"type"` field naming the variant;
//! the variant's fields sit next to it:
//!
//! ```json
//! {"type":"Set","key":"/SmartDashboard/speed","value":{"kind":"double","value":1.5}}
//! ```
//!
//! Values carry their own `"kind"` tag so that a widget never has to guess a
//! type from a JSON number.  Raw bytes travel as base64 strings.

use serde::{Deserialize, Serialize};

use crate::domain::peer::ConnectionState;

// ── Values ────────────────────────────────────────────────────────────────────

/// JSON form of a table value.
///
/// Mirrors `tablesync_core::Value`, except that raw bytes are a base64 string
/// instead of an array of numbers.
///
/// ```json
/// {"kind":"boolean","value":true}
/// {"kind":"raw","value":"AAEC"}
/// {"kind":"string_array","value":["a","b"]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WireValue {
    Boolean(bool),
    Double(f64),
    String(String),
    /// Base64 (standard alphabet, padded).
    Raw(String),
    BooleanArray(Vec<bool>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
}

// ── Browser → Bridge messages ─────────────────────────────────────────────────

/// All messages a browser can send to the bridge.
///
/// ```json
/// {"type":"Subscribe","prefix":"/SmartDashboard/"}
/// {"type":"Delete","key":"/SmartDashboard/old"}
/// {"type":"Ping","token":7}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BrowserToBridgeMsg {
    /// Start receiving changes for keys under `prefix`.
    ///
    /// The bridge first replays the current live entries under the prefix as
    /// `EntryUpdate` messages, then streams changes.
    Subscribe { prefix: String },

    /// Stop receiving changes for `prefix`.  Other subscriptions are kept.
    Unsubscribe { prefix: String },

    /// Write a value.  Applied locally, then forwarded upstream.
    Set { key: String, value: WireValue },

    /// Delete a key.  Applied locally, then forwarded upstream.
    Delete { key: String },

    /// Application-level liveness check; answered with `Pong`.
    Ping { token: u64 },
}

impl BrowserToBridgeMsg {
    /// Short variant name for log lines.
    pub fn type_name(&self) -> &'static str {
        match self {
            BrowserToBridgeMsg::Subscribe { .. } => "Subscribe",
            BrowserToBridgeMsg::Unsubscribe { .. } => "Unsubscribe",
            BrowserToBridgeMsg::Set { .. } => "Set",
            BrowserToBridgeMsg::Delete { .. } => "Delete",
            BrowserToBridgeMsg::Ping { .. } => "Ping",
        }
    }
}

// ── Bridge → Browser messages ─────────────────────────────────────────────────

/// All messages the bridge sends to a browser.
///
/// ```json
/// {"type":"Welcome","peer_id":"2f1c...","upstream":"connected"}
/// {"type":"EntryUpdate","key":"/a","value":{"kind":"double","value":2.0},"version":3}
/// {"type":"EntryDeleted","key":"/a","version":4}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeToBrowserMsg {
    /// First message of every session.
    Welcome {
        peer_id: String,
        upstream: ConnectionState,
    },

    /// A key was created or changed.
    EntryUpdate {
        key: String,
        value: WireValue,
        version: u64,
    },

    /// A key was deleted.
    EntryDeleted { key: String, version: u64 },

    /// The upstream connection changed state.
    UpstreamStatus { state: ConnectionState },

    /// Answer to a browser `Ping`.
    Pong { token: u64 },

    /// A browser request was rejected.  The session stays open.
    Error { message: String },
}

impl BridgeToBrowserMsg {
    pub fn type_name(&self) -> &'static str {
        match self {
            BridgeToBrowserMsg::Welcome { .. } => "Welcome",
            BridgeToBrowserMsg::EntryUpdate { .. } => "EntryUpdate",
            BridgeToBrowserMsg::EntryDeleted { .. } => "EntryDeleted",
            BridgeToBrowserMsg::UpstreamStatus { .. } => "UpstreamStatus",
            BridgeToBrowserMsg::Pong { .. } => "Pong",
            BridgeToBrowserMsg::Error { .. } => "Error",
        }
    }
}
