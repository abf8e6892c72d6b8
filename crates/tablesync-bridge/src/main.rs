//! tablesync dashboard bridge: entry point.
//!
//! Connects to an upstream table-sync peer (a robot controller, usually),
//! keeps a live replica of its key-value table, and serves a browser
//! dashboard that can watch and edit it.
//!
//! # Usage
//!
//! ```text
//! tablesync-bridge [OPTIONS]
//!
//!   --port <PORT>            HTTP port (dashboard + layout API) [default: 8888]
//!   --ws-port <PORT>         Browser WebSocket port [default: 8889]
//!   --bind <ADDR>            Listen address for both servers [default: 0.0.0.0]
//!   --robot <HOST>           Upstream host [default: 127.0.0.1]
//!   --team <NUMBER>          Team number; expands to the standard robot addresses
//!   --upstream-port <PORT>   Upstream port [default: 1735]
//!   --identity <NAME>        Network identity [default: tablesync-bridge]
//!   --role <client|source>   Who owns the table [default: client]
//!   --config <FILE>          Optional TOML settings file
//!   --verbose                Debug logging
//! ```
//!
//! `--robot` and `--team` are mutually exclusive.  Every option can also be
//! set through a `TABLESYNC_*` environment variable; command-line values
//! win, then the environment, then the settings file, then the defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tablesync_bridge::domain::config::{ConfigError, ConnectTarget, DEFAULT_UPSTREAM_PORT};
use tablesync_bridge::domain::{BackoffConfig, BridgeConfig, OverflowPolicy};
use tablesync_bridge::infrastructure::{load_settings, run_http_server, run_server, SettingsFile};
use tablesync_bridge::SyncBridge;
use tablesync_core::protocol::SyncRole;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Live dashboard bridge for a versioned key-value table.
#[derive(Debug, Parser)]
#[command(
    name = "tablesync-bridge",
    about = "Replicates an upstream key-value table to browser dashboards",
    version
)]
struct Cli {
    /// HTTP port for the dashboard and the layout API.
    #[arg(long, env = "TABLESYNC_PORT")]
    port: Option<u16>,

    /// Port for browser WebSocket sessions.
    #[arg(long, env = "TABLESYNC_WS_PORT")]
    ws_port: Option<u16>,

    /// Address both servers listen on.
    #[arg(long, env = "TABLESYNC_BIND")]
    bind: Option<String>,

    /// Host name or IP address of the upstream peer.
    #[arg(long, env = "TABLESYNC_ROBOT")]
    robot: Option<String>,

    /// Team number; connects to 10.TE.AM.2, roborio-TEAM-frc.local or USB.
    #[arg(long, env = "TABLESYNC_TEAM")]
    team: Option<u32>,

    /// TCP port of the upstream peer.
    #[arg(long, env = "TABLESYNC_UPSTREAM_PORT")]
    upstream_port: Option<u16>,

    /// Identity announced to the upstream peer.
    #[arg(long, env = "TABLESYNC_IDENTITY")]
    identity: Option<String>,

    /// `client` mirrors the upstream table; `source` publishes ours.
    #[arg(long, env = "TABLESYNC_ROLE", value_parser = parse_role)]
    role: Option<SyncRole>,

    /// Enable debug logging (RUST_LOG still takes precedence).
    #[arg(long, env = "TABLESYNC_VERBOSE")]
    verbose: bool,

    /// Directory holding the dashboard's index.html.
    #[arg(long, env = "TABLESYNC_HTML_DIR")]
    html_dir: Option<PathBuf>,

    /// Directory served under /vendor/.
    #[arg(long, env = "TABLESYNC_VENDOR_DIR")]
    vendor_dir: Option<PathBuf>,

    /// Directory holding layout.json; created if missing.
    #[arg(long, env = "TABLESYNC_DASHBOARD_DIR")]
    dashboard_dir: Option<PathBuf>,

    /// TOML settings file.
    #[arg(long, env = "TABLESYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Upstream keepalive period in milliseconds.
    #[arg(long, env = "TABLESYNC_PING_INTERVAL_MS")]
    ping_interval_ms: Option<u64>,

    /// Upstream silence (ms) after which the link is declared dead.
    #[arg(long, env = "TABLESYNC_PING_TIMEOUT_MS")]
    ping_timeout_ms: Option<u64>,

    /// Bound on connects, handshakes and single writes, in milliseconds.
    #[arg(long, env = "TABLESYNC_IO_TIMEOUT_MS")]
    io_timeout_ms: Option<u64>,

    /// First reconnect delay in milliseconds.
    #[arg(long, env = "TABLESYNC_BACKOFF_INITIAL_MS")]
    backoff_initial_ms: Option<u64>,

    /// Longest reconnect delay in milliseconds.
    #[arg(long, env = "TABLESYNC_BACKOFF_MAX_MS")]
    backoff_max_ms: Option<u64>,

    /// Events buffered per browser before the overflow policy applies.
    #[arg(long, env = "TABLESYNC_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// `drop_oldest` or `disconnect`.
    #[arg(long, env = "TABLESYNC_OVERFLOW_POLICY", value_parser = parse_overflow_policy)]
    overflow_policy: Option<OverflowPolicy>,

    /// Local writes kept while the upstream link is down.
    #[arg(long, env = "TABLESYNC_PENDING_WRITE_LIMIT")]
    pending_write_limit: Option<usize>,
}

fn parse_role(s: &str) -> Result<SyncRole, String> {
    match s.to_ascii_lowercase().as_str() {
        "client" => Ok(SyncRole::Client),
        "source" => Ok(SyncRole::Source),
        other => Err(format!("unknown role '{other}' (expected client or source)")),
    }
}

fn parse_overflow_policy(s: &str) -> Result<OverflowPolicy, String> {
    match s.to_ascii_lowercase().replace('-', "_").as_str() {
        "drop_oldest" => Ok(OverflowPolicy::DropOldest),
        "disconnect" => Ok(OverflowPolicy::Disconnect),
        other => Err(format!(
            "unknown overflow policy '{other}' (expected drop_oldest or disconnect)"
        )),
    }
}

impl Cli {
    /// Loads the settings file (if any) and builds the [`BridgeConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if the settings file cannot be read or parsed, or if
    /// [`merge`](Self::merge) rejects the combined settings.
    fn into_bridge_config(self) -> anyhow::Result<BridgeConfig> {
        let file = match &self.config {
            Some(path) => load_settings(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?,
            None => SettingsFile::default(),
        };
        Ok(self.merge(file)?)
    }

    /// Combines command-line values, file values and defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ConflictingTargets`] if both a robot address and a
    /// team number are given, [`ConfigError::InvalidTeam`] or
    /// [`ConfigError::InvalidAddress`] for unusable values.
    fn merge(self, file: SettingsFile) -> Result<BridgeConfig, ConfigError> {
        let defaults = BridgeConfig::default();
        let (server, upstream, peers) = (file.server, file.upstream, file.peers);

        let bind = self
            .bind
            .or(server.bind)
            .unwrap_or_else(|| defaults.http_bind_addr.ip().to_string());
        let http_port = self.port.or(server.port).unwrap_or(defaults.http_bind_addr.port());
        let ws_port = self.ws_port.or(server.ws_port).unwrap_or(defaults.ws_bind_addr.port());
        let http_bind_addr = socket_addr(&bind, http_port)?;
        let ws_bind_addr = socket_addr(&bind, ws_port)?;

        // A target named on the command line replaces the file's entirely.
        let (robot, team) = if self.robot.is_some() || self.team.is_some() {
            (self.robot, self.team)
        } else {
            (upstream.robot, upstream.team)
        };
        let port = self
            .upstream_port
            .or(upstream.port)
            .unwrap_or(DEFAULT_UPSTREAM_PORT);
        let target = match (robot, team) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingTargets),
            (None, Some(team)) => ConnectTarget::team(team, port)?,
            (Some(host), None) => ConnectTarget::host(host, port),
            (None, None) => ConnectTarget::host("127.0.0.1", port),
        };

        let ms = Duration::from_millis;
        let backoff = BackoffConfig {
            initial: self
                .backoff_initial_ms
                .or(upstream.backoff_initial_ms)
                .map_or(defaults.backoff.initial, ms),
            max: self
                .backoff_max_ms
                .or(upstream.backoff_max_ms)
                .map_or(defaults.backoff.max, ms),
            factor: upstream.backoff_factor.unwrap_or(defaults.backoff.factor),
        };

        Ok(BridgeConfig {
            http_bind_addr,
            ws_bind_addr,
            target,
            identity: self.identity.or(upstream.identity).unwrap_or(defaults.identity),
            role: self.role.or(upstream.role).unwrap_or(defaults.role),
            html_dir: self.html_dir.or(server.html_dir).unwrap_or(defaults.html_dir),
            vendor_dir: self.vendor_dir.or(server.vendor_dir).unwrap_or(defaults.vendor_dir),
            dashboard_dir: self
                .dashboard_dir
                .or(server.dashboard_dir)
                .unwrap_or(defaults.dashboard_dir),
            backoff,
            io_timeout: self
                .io_timeout_ms
                .or(upstream.io_timeout_ms)
                .map_or(defaults.io_timeout, ms),
            ping_interval: self
                .ping_interval_ms
                .or(upstream.ping_interval_ms)
                .map_or(defaults.ping_interval, ms),
            ping_timeout: self
                .ping_timeout_ms
                .or(upstream.ping_timeout_ms)
                .map_or(defaults.ping_timeout, ms),
            peer_queue_capacity: self
                .queue_capacity
                .or(peers.queue_capacity)
                .unwrap_or(defaults.peer_queue_capacity),
            overflow_policy: self
                .overflow_policy
                .or(peers.overflow_policy)
                .unwrap_or(defaults.overflow_policy),
            pending_write_limit: self
                .pending_write_limit
                .or(peers.pending_write_limit)
                .unwrap_or(defaults.pending_write_limit),
            tombstone_ttl: peers
                .tombstone_ttl_secs
                .map_or(defaults.tombstone_ttl, Duration::from_secs),
        })
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e: std::net::AddrParseError| ConfigError::InvalidAddress {
            addr: format!("{host}:{port}"),
            reason: e.to_string(),
        })
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = cli.into_bridge_config()?;
    info!(
        "tablesync bridge starting: http={}, ws={}, upstream={}, role={:?}",
        config.http_bind_addr, config.ws_bind_addr, config.target, config.role
    );

    std::fs::create_dir_all(&config.dashboard_dir).with_context(|| {
        format!(
            "failed to create dashboard directory {}",
            config.dashboard_dir.display()
        )
    })?;

    let bridge = Arc::new(SyncBridge::new(config.clone()));
    let running = bridge.running();

    let bridge_for_signal = Arc::clone(&bridge);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                bridge_for_signal.shutdown();
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    bridge.connect(config.target.clone());

    tokio::try_join!(
        run_server(Arc::clone(&bridge), Arc::clone(&running)),
        run_http_server(&config, Arc::clone(&running)),
    )?;

    bridge.shutdown();
    info!("tablesync bridge stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(args: &[&str]) -> Result<BridgeConfig, ConfigError> {
        let mut argv = vec!["tablesync-bridge"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv).merge(SettingsFile::default())
    }

    #[test]
    fn test_defaults_match_bridge_config_defaults() {
        // Arrange / Act
        let config = config_from(&[]).unwrap();

        // Assert
        assert_eq!(config.http_bind_addr.port(), 8888);
        assert_eq!(config.ws_bind_addr.port(), 8889);
        assert_eq!(config.target, ConnectTarget::host("127.0.0.1", 1735));
        assert_eq!(config.identity, "tablesync-bridge");
        assert_eq!(config.role, SyncRole::Client);
    }

    #[test]
    fn test_team_flag_builds_team_target() {
        let config = config_from(&["--team", "1234", "--upstream-port", "5810"]).unwrap();
        assert_eq!(config.target, ConnectTarget::Team { team: 1234, port: 5810 });
    }

    #[test]
    fn test_robot_and_team_are_mutually_exclusive() {
        let result = config_from(&["--robot", "10.0.0.2", "--team", "1234"]);
        assert!(matches!(result, Err(ConfigError::ConflictingTargets)));
    }

    #[test]
    fn test_invalid_bind_address_is_rejected() {
        let result = config_from(&["--bind", "not.an.ip"]);
        assert!(matches!(result, Err(ConfigError::InvalidAddress { .. })));
    }

    #[test]
    fn test_role_and_policy_parse_case_insensitively() {
        let config = config_from(&["--role", "Source", "--overflow-policy", "disconnect"]).unwrap();
        assert_eq!(config.role, SyncRole::Source);
        assert_eq!(config.overflow_policy, OverflowPolicy::Disconnect);
    }

    #[test]
    fn test_unknown_role_is_a_parse_error() {
        let result = Cli::try_parse_from(["tablesync-bridge", "--role", "server"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_command_line_wins_over_settings_file() {
        // Arrange
        let mut file = SettingsFile::default();
        file.server.port = Some(9000);
        file.server.ws_port = Some(9001);
        file.upstream.identity = Some("from-file".to_string());

        // Act
        let config = Cli::parse_from(["tablesync-bridge", "--port", "7000"])
            .merge(file)
            .unwrap();

        // Assert
        assert_eq!(config.http_bind_addr.port(), 7000);
        assert_eq!(config.ws_bind_addr.port(), 9001);
        assert_eq!(config.identity, "from-file");
    }

    #[test]
    fn test_command_line_target_replaces_file_target() {
        let mut file = SettingsFile::default();
        file.upstream.team = Some(1234);

        let config = Cli::parse_from(["tablesync-bridge", "--robot", "10.0.0.9"])
            .merge(file)
            .unwrap();

        assert_eq!(config.target, ConnectTarget::host("10.0.0.9", 1735));
    }

    #[test]
    fn test_tunables_are_milliseconds() {
        let config = config_from(&["--ping-interval-ms", "250", "--backoff-max-ms", "4000"]).unwrap();
        assert_eq!(config.ping_interval, Duration::from_millis(250));
        assert_eq!(config.backoff.max, Duration::from_secs(4));
    }
}
