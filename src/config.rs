//! Configuration loading.
//!
//! Loads `attguard.toml` from `--config`, `$ATTGUARD_CONFIG_PATH`, or the
//! working directory. Environment variables override file values; file
//! values override defaults.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ports::PortRange;

// ── Top-level config ────────────────────────────────────────────

/// Daemon configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AttguardConfig {
    /// Unix socket listener.
    pub server: ServerConfig,
    /// Remote policy service.
    pub policy: PolicyConfig,
    /// Who this daemon speaks as.
    pub identity: IdentityConfig,
    /// Local port range handed to principals.
    pub ports: PortsConfig,
    /// Snapshot persistence.
    pub persistence: PersistenceConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

impl AttguardConfig {
    /// Load with precedence env > file > defaults.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or parsed.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let path = Self::config_path_with(cli_path, |key| std::env::var(key).ok());
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML document without applying env overrides.
    ///
    /// # Errors
    ///
    /// Returns the TOML parse error.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("failed to parse config TOML")
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config file path using a custom env resolver.
    pub fn config_path_with(
        cli_path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> PathBuf {
        if let Some(p) = cli_path {
            return p.to_path_buf();
        }
        if let Some(p) = env("ATTGUARD_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("attguard.toml")
    }

    /// Apply environment overrides.
    ///
    /// Takes a resolver function so tests need not touch the process env.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("ATTGUARD_SOCKET") {
            self.server.socket_path = PathBuf::from(v);
        }
        if let Some(v) = env("ATTGUARD_POLICY_URL") {
            self.policy.url = v;
        }
        if let Some(v) = env("ATTGUARD_SPEAKER") {
            self.identity.speaker = v;
        }
        if let Some(v) = env("ATTGUARD_IP") {
            match v.parse() {
                Ok(ip) => self.identity.ip = ip,
                Err(_) => tracing::warn!(var = "ATTGUARD_IP", value = %v, "ignoring invalid env override"),
            }
        }
        if let Some(v) = env("ATTGUARD_SNAPSHOT") {
            self.persistence.snapshot_path = PathBuf::from(v);
        }
        if let Some(v) = env("ATTGUARD_FLUSH_SECS") {
            match v.parse::<u64>() {
                Ok(n) if n > 0 => self.persistence.flush_interval_secs = n,
                _ => tracing::warn!(
                    var = "ATTGUARD_FLUSH_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("ATTGUARD_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env("ATTGUARD_LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(v));
        }
    }
}

// ── Sections ────────────────────────────────────────────────────

/// `[server]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Filesystem path of the listening socket.
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file.
    pub socket_mode: u32,
    /// Concurrent connection limit.
    pub max_connections: usize,
    /// Largest accepted frame body in bytes.
    pub max_frame_bytes: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/attguard.sock"),
            socket_mode: 0o666,
            max_connections: 256,
            max_frame_bytes: 16_777_216,
        }
    }
}

/// `[policy]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Base URL of the policy service.
    pub url: String,
    /// Speaker used for infrastructure-level statements.
    pub iaas_identity: String,
    /// Speaker used for attestation queries.
    pub attest_identity: String,
    /// Per-request timeout; 0 waits forever.
    pub request_timeout_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:7777/".to_owned(),
            iaas_identity: "iaas".to_owned(),
            attest_identity: "attest".to_owned(),
            request_timeout_secs: 0,
        }
    }
}

/// `[identity]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name this daemon makes statements as.
    pub speaker: String,
    /// Address principals on this host are reachable at.
    pub ip: Ipv4Addr,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            speaker: "attguard".to_owned(),
            ip: Ipv4Addr::LOCALHOST,
        }
    }
}

/// `[ports]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PortsConfig {
    /// First port of the local range.
    pub local_lo: u32,
    /// One past the last port of the local range.
    pub local_hi: u32,
}

impl PortsConfig {
    /// The configured range, or `None` if it is empty.
    pub fn range(&self) -> Option<PortRange> {
        PortRange::try_new(self.local_lo, self.local_hi)
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            local_lo: 20000,
            local_hi: 40000,
        }
    }
}

/// `[persistence]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// JSON snapshot location.
    pub snapshot_path: PathBuf,
    /// Upper bound between flushes.
    pub flush_interval_secs: u64,
}

impl PersistenceConfig {
    /// Flush interval as a [`Duration`].
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("/var/lib/attguard/state.json"),
            flush_interval_secs: 30,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for rotated JSON logs; console only when absent.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: None,
        }
    }
}
