//! Bridge configuration types.
//!
//! [`BridgeConfig`] is the single source of truth for all runtime settings.
//! `main.rs` builds it from CLI flags, environment variables and an optional
//! TOML file; tests build it from [`BridgeConfig::default`].
//!
//! No component reads the environment or the file system to configure
//! itself; everything arrives through this struct.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use tablesync_core::protocol::SyncRole;

use crate::domain::peer::OverflowPolicy;

/// Port the upstream table-sync peer listens on.
pub const DEFAULT_UPSTREAM_PORT: u16 = 1735;

/// Fixed USB address of a robot controller.
const USB_ADDRESS: &str = "172.22.11.2";

/// Errors raised while building a [`BridgeConfig`].  Fatal at startup only.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--robot and --team are mutually exclusive")]
    ConflictingTargets,

    #[error("team number {0} is out of range (1-25599)")]
    InvalidTeam(u32),

    #[error("invalid address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Upstream target ───────────────────────────────────────────────────────────

/// Where the upstream table-sync peer lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// A single explicit host name or IP address.
    Host { host: String, port: u16 },
    /// A team number, expanded to the standard robot addresses.
    Team { team: u32, port: u16 },
}

impl ConnectTarget {
    /// Builds a team target.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTeam`] for 0 or for numbers whose
    /// `10.TE.AM.2` form would not be a valid IPv4 address.
    pub fn team(team: u32, port: u16) -> Result<Self, ConfigError> {
        if team == 0 || team / 100 > 255 {
            return Err(ConfigError::InvalidTeam(team));
        }
        Ok(ConnectTarget::Team { team, port })
    }

    pub fn host(host: impl Into<String>, port: u16) -> Self {
        ConnectTarget::Host {
            host: host.into(),
            port,
        }
    }

    /// Addresses to try, in round-robin order, as `host:port` strings.
    ///
    /// A team target expands to `10.TE.AM.2`, `roborio-TEAM-frc.local` and
    /// the USB address `172.22.11.2`.
    pub fn candidates(&self) -> Vec<String> {
        match self {
            ConnectTarget::Host { host, port } => vec![format!("{host}:{port}")],
            ConnectTarget::Team { team, port } => vec![
                format!("10.{}.{}.2:{port}", team / 100, team % 100),
                format!("roborio-{team}-frc.local:{port}"),
                format!("{USB_ADDRESS}:{port}"),
            ],
        }
    }
}

impl std::fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectTarget::Host { host, port } => write!(f, "{host}:{port}"),
            ConnectTarget::Team { team, port } => write!(f, "team {team} (port {port})"),
        }
    }
}

// ── Backoff ───────────────────────────────────────────────────────────────────

/// Exponential backoff between reconnect attempts.
///
/// Delay for attempt `n` (0-based) is `initial * factor^n`, capped at `max`.
/// The attempt counter resets after a successful connection.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

// ── Bridge configuration ──────────────────────────────────────────────────────

/// All runtime configuration for the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// HTTP server (layout API + static files).
    pub http_bind_addr: SocketAddr,
    /// Browser WebSocket server.
    pub ws_bind_addr: SocketAddr,

    pub target: ConnectTarget,
    /// Network identity announced upstream and recorded as the writer of
    /// local host writes.
    pub identity: String,
    pub role: SyncRole,

    /// Dashboard HTML root; `/` serves `index.html` from here.
    pub html_dir: PathBuf,
    /// Third-party assets served under `/vendor/`.
    pub vendor_dir: PathBuf,
    /// Holds `layout.json`.  Created at startup if missing.
    pub dashboard_dir: PathBuf,

    pub backoff: BackoffConfig,
    /// Bound on connects, handshakes and single writes.
    pub io_timeout: Duration,
    /// Upstream keepalive ping period.
    pub ping_interval: Duration,
    /// Upstream silence after which the connection is considered dead.
    pub ping_timeout: Duration,

    /// Events buffered per browser peer.
    pub peer_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Local writes buffered while upstream is down (distinct keys).
    pub pending_write_limit: usize,
    /// Tombstones older than this are garbage-collected.
    pub tombstone_ttl: Duration,
}

impl BridgeConfig {
    /// Path of the persisted layout blob.
    pub fn layout_path(&self) -> PathBuf {
        self.dashboard_dir.join("layout.json")
    }
}

impl Default for BridgeConfig {
    /// | Field            | Default                 |
    /// |------------------|-------------------------|
    /// | http_bind_addr   | `0.0.0.0:8888`          |
    /// | ws_bind_addr     | `0.0.0.0:8889`          |
    /// | target           | `127.0.0.1:1735`        |
    /// | identity         | `tablesync-bridge`      |
    /// | role             | client                  |
    /// | io_timeout       | 5 seconds               |
    /// | ping_interval    | 1 second                |
    /// | ping_timeout     | 5 seconds               |
    fn default() -> Self {
        Self {
            http_bind_addr: SocketAddr::from(([0, 0, 0, 0], 8888)),
            ws_bind_addr: SocketAddr::from(([0, 0, 0, 0], 8889)),
            target: ConnectTarget::host("127.0.0.1", DEFAULT_UPSTREAM_PORT),
            identity: "tablesync-bridge".to_string(),
            role: SyncRole::Client,
            html_dir: PathBuf::from("www"),
            vendor_dir: PathBuf::from("www/vendor"),
            dashboard_dir: PathBuf::from("dashboard"),
            backoff: BackoffConfig::default(),
            io_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(5),
            peer_queue_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
            pending_write_limit: 4096,
            tombstone_ttl: Duration::from_secs(60),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_target_expands_to_standard_candidates() {
        // Arrange
        let target = ConnectTarget::team(1234, 1735).unwrap();

        // Act
        let candidates = target.candidates();

        // Assert
        assert_eq!(
            candidates,
            vec![
                "10.12.34.2:1735".to_string(),
                "roborio-1234-frc.local:1735".to_string(),
                "172.22.11.2:1735".to_string(),
            ]
        );
    }

    #[test]
    fn test_small_team_number_pads_nothing() {
        let target = ConnectTarget::team(42, 1735).unwrap();
        assert_eq!(target.candidates()[0], "10.0.42.2:1735");
    }

    #[test]
    fn test_team_out_of_range_is_rejected() {
        assert!(matches!(ConnectTarget::team(0, 1735), Err(ConfigError::InvalidTeam(0))));
        assert!(matches!(
            ConnectTarget::team(25_600, 1735),
            Err(ConfigError::InvalidTeam(25_600))
        ));
        assert!(ConnectTarget::team(25_599, 1735).is_ok());
    }

    #[test]
    fn test_host_target_has_single_candidate() {
        let target = ConnectTarget::host("10.0.0.5", 1735);
        assert_eq!(target.candidates(), vec!["10.0.0.5:1735".to_string()]);
    }

    #[test]
    fn test_default_ports() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.http_bind_addr.port(), 8888);
        assert_eq!(cfg.ws_bind_addr.port(), 8889);
        assert_eq!(cfg.target, ConnectTarget::host("127.0.0.1", 1735));
    }

    #[test]
    fn test_layout_path_is_inside_dashboard_dir() {
        let cfg = BridgeConfig {
            dashboard_dir: PathBuf::from("/tmp/dash"),
            ..BridgeConfig::default()
        };
        assert_eq!(cfg.layout_path(), PathBuf::from("/tmp/dash/layout.json"));
    }

    #[test]
    fn test_default_backoff_grows_to_thirty_seconds() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.initial, Duration::from_millis(500));
        assert_eq!(backoff.max, Duration::from_secs(30));
        assert!(backoff.factor > 1.0);
    }
}
