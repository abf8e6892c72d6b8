//! tablesync-bridge library crate.
//!
//! Keeps a local replica of an upstream key-value table, fans its changes out
//! to browser dashboards over WebSocket, forwards their writes back upstream,
//! and serves the dashboard itself over HTTP.
//!
//! # Architecture
//!
//! ```text
//! Browser (JSON over WebSocket)      Browser (HTTP)
//!         ↕                               ↕
//! [tablesync-bridge]
//!   ├── domain/           Pure types: browser messages, peer ids, BridgeConfig
//!   ├── application/      Router, translation, upstream supervisor, SyncBridge
//!   └── infrastructure/
//!         ├── ws_server/      WebSocket accept loop (tokio-tungstenite)
//!         ├── http_server/    Layout API + static files (axum)
//!         └── upstream_conn/  TCP link to the upstream peer (tablesync-core codec)
//!         ↕
//! Upstream table-sync peer (binary protocol over TCP, port 1735)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `tablesync-core`; only the
//!   supervisor reaches into `infrastructure`, for the upstream socket.
//! - `infrastructure` depends on everything else plus `tokio`, `axum` and
//!   `tungstenite`.

/// Domain layer: pure types (no I/O).
pub mod domain;

/// Application layer: routing, translation and the upstream supervisor.
pub mod application;

/// Infrastructure layer: sockets, HTTP and files.
pub mod infrastructure;

pub use application::{SubscriptionHandle, SyncBridge};
pub use domain::BridgeConfig;
