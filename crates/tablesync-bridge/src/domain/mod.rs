//! Domain layer for tablesync-bridge.
//!
//! Pure types with no I/O: the browser JSON protocol, peer identity and
//! connection state, and the bridge configuration.  Nothing here touches
//! `tokio`, sockets, or the file system.

pub mod config;
pub mod messages;
pub mod peer;

pub use config::{BackoffConfig, BridgeConfig, ConfigError, ConnectTarget};
pub use messages::{BridgeToBrowserMsg, BrowserToBridgeMsg, WireValue};
pub use peer::{ConnectionState, OverflowPolicy, PeerId};
