//! Infrastructure layer for tablesync-bridge.
//!
//! Everything that touches a socket or the file system:
//!
//! - Browser WebSocket accept loop and per-session tasks
//! - The upstream TCP connection and its frame reader
//! - The axum HTTP server (layout API + static files)
//! - Layout and settings files
//!
//! Protocol translation and routing decisions live in the application layer.

pub mod http_server;
pub mod layout_store;
pub mod settings;
pub mod upstream_conn;
pub mod ws_server;

pub use http_server::{build_router, run_http_server, HttpPaths};
pub use layout_store::{LayoutError, LayoutStore};
pub use settings::{load_settings, SettingsFile};
pub use upstream_conn::ConnectionError;
pub use ws_server::run_server;
