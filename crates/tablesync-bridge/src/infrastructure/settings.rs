//! Optional TOML settings file (`--config <path>`).
//!
//! Every field is optional.  Values given on the command line (or through
//! `TABLESYNC_*` environment variables) win over the file; anything set in
//! neither place falls back to [`BridgeConfig::default`].
//!
//! ```toml
//! [server]
//! port = 8888
//! ws_port = 8889
//! bind = "0.0.0.0"
//! html_dir = "www"
//!
//! [upstream]
//! team = 1234
//! identity = "pit-dashboard"
//! role = "client"
//! ping_interval_ms = 1000
//!
//! [peers]
//! queue_capacity = 1024
//! overflow_policy = "drop_oldest"
//! ```
//!
//! [`BridgeConfig::default`]: crate::domain::config::BridgeConfig

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use tablesync_core::protocol::SyncRole;

use crate::domain::config::ConfigError;
use crate::domain::peer::OverflowPolicy;

/// Top-level layout of the settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsFile {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub peers: PeerSettings,
}

/// HTTP / WebSocket listeners and served directories.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    pub port: Option<u16>,
    pub ws_port: Option<u16>,
    pub bind: Option<String>,
    pub html_dir: Option<PathBuf>,
    pub vendor_dir: Option<PathBuf>,
    pub dashboard_dir: Option<PathBuf>,
}

/// Upstream target, identity and link timing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamSettings {
    pub robot: Option<String>,
    pub team: Option<u32>,
    pub port: Option<u16>,
    pub identity: Option<String>,
    pub role: Option<SyncRole>,
    pub io_timeout_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    pub ping_timeout_ms: Option<u64>,
    pub backoff_initial_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
}

/// Per-peer buffering and table housekeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerSettings {
    pub queue_capacity: Option<usize>,
    pub overflow_policy: Option<OverflowPolicy>,
    pub pending_write_limit: Option<usize>,
    pub tombstone_ttl_secs: Option<u64>,
}

/// Loads the settings file at `path`.  A missing file yields the empty
/// settings.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed or has unknown keys.
pub fn load_settings(path: &Path) -> Result<SettingsFile, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no settings file at {}; using defaults", path.display());
            Ok(SettingsFile::default())
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
