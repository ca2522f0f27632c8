use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Errors that can occur in configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidEnvVar(String, String),

    #[error("Failed to read file: {0}")]
    FileReadError(String),

    #[error("Failed to parse YAML: {0}")]
    YamlParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "ICN_MESH_";

/// Mesh service configuration. Intervals are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Keepalive interval of tunnel owners
    #[serde(default = "default_refresh_path_time")]
    pub refresh_path_time: u64,
    /// Interval between announcements of the local identity
    #[serde(default = "default_id_announce_time")]
    pub id_announce_time: u64,
    #[serde(default = "default_max_msgs_queue")]
    pub max_msgs_queue: u32,
    #[serde(default = "default_max_tunnels")]
    pub max_tunnels: u32,
    #[serde(default = "default_ttl")]
    pub default_ttl: u32,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_dht_replication_level")]
    pub dht_replication_level: u32,
    #[serde(default = "default_initial_poll_time")]
    pub initial_poll_time: u64,
    #[serde(default = "default_max_poll_time")]
    pub max_poll_time: u64,
    #[serde(default = "default_initial_retransmit_time")]
    pub initial_retransmit_time: u64,
    #[serde(default = "default_retransmit_margin")]
    pub retransmit_margin: u32,
    #[serde(default = "default_max_retransmit_time")]
    pub max_retransmit_time: u64,
    /// Unacknowledged reliable payloads a client may have outstanding
    #[serde(default = "default_max_reliable_pending")]
    pub max_reliable_pending: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_refresh_path_time() -> u64 {
    120
}

fn default_id_announce_time() -> u64 {
    3600
}

fn default_max_msgs_queue() -> u32 {
    10_000
}

fn default_max_tunnels() -> u32 {
    1000
}

fn default_ttl() -> u32 {
    64
}

fn default_max_peers() -> usize {
    1000
}

fn default_dht_replication_level() -> u32 {
    3
}

fn default_initial_poll_time() -> u64 {
    1
}

fn default_max_poll_time() -> u64 {
    600
}

fn default_initial_retransmit_time() -> u64 {
    1
}

fn default_retransmit_margin() -> u32 {
    4
}

fn default_max_retransmit_time() -> u64 {
    900
}

fn default_max_reliable_pending() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            refresh_path_time: default_refresh_path_time(),
            id_announce_time: default_id_announce_time(),
            max_msgs_queue: default_max_msgs_queue(),
            max_tunnels: default_max_tunnels(),
            default_ttl: default_ttl(),
            max_peers: default_max_peers(),
            dht_replication_level: default_dht_replication_level(),
            initial_poll_time: default_initial_poll_time(),
            max_poll_time: default_max_poll_time(),
            initial_retransmit_time: default_initial_retransmit_time(),
            retransmit_margin: default_retransmit_margin(),
            max_retransmit_time: default_max_retransmit_time(),
            max_reliable_pending: default_max_reliable_pending(),
            log_level: default_log_level(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from environment variables.
    ///
    /// `ICN_MESH_CONFIG_FILE` names a YAML file to start from; every key can
    /// then be overridden by `ICN_MESH_<KEY>`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`MeshConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(&format!("{}CONFIG_FILE", ENV_PREFIX)) {
            Some(path) if Path::new(&path).exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };

        override_from(&lookup, "REFRESH_PATH_TIME", &mut config.refresh_path_time)?;
        override_from(&lookup, "ID_ANNOUNCE_TIME", &mut config.id_announce_time)?;
        override_from(&lookup, "MAX_MSGS_QUEUE", &mut config.max_msgs_queue)?;
        override_from(&lookup, "MAX_TUNNELS", &mut config.max_tunnels)?;
        override_from(&lookup, "DEFAULT_TTL", &mut config.default_ttl)?;
        override_from(&lookup, "MAX_PEERS", &mut config.max_peers)?;
        override_from(&lookup, "DHT_REPLICATION_LEVEL", &mut config.dht_replication_level)?;
        override_from(&lookup, "INITIAL_POLL_TIME", &mut config.initial_poll_time)?;
        override_from(&lookup, "MAX_POLL_TIME", &mut config.max_poll_time)?;
        override_from(&lookup, "INITIAL_RETRANSMIT_TIME", &mut config.initial_retransmit_time)?;
        override_from(&lookup, "RETRANSMIT_MARGIN", &mut config.retransmit_margin)?;
        override_from(&lookup, "MAX_RETRANSMIT_TIME", &mut config.max_retransmit_time)?;
        override_from(&lookup, "MAX_RELIABLE_PENDING", &mut config.max_reliable_pending)?;
        if let Some(level) = lookup(&format!("{}LOG_LEVEL", ENV_PREFIX)) {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::FileReadError(format!("Failed to read {}: {}", path, e)))?;

        let config: MeshConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("refresh_path_time", self.refresh_path_time == 0 || self.refresh_path_time > u64::MAX / 4),
            ("id_announce_time", self.id_announce_time == 0),
            ("max_msgs_queue", self.max_msgs_queue == 0),
            ("max_tunnels", self.max_tunnels == 0),
            ("default_ttl", self.default_ttl == 0),
            ("max_peers", self.max_peers == 0),
            ("initial_poll_time", self.initial_poll_time == 0),
            ("max_poll_time", self.max_poll_time < self.initial_poll_time),
            ("initial_retransmit_time", self.initial_retransmit_time == 0),
            ("retransmit_margin", self.retransmit_margin == 0),
            ("max_retransmit_time", self.max_retransmit_time < self.initial_retransmit_time),
            ("max_reliable_pending", self.max_reliable_pending == 0),
        ];
        match checks.iter().find(|(_, bad)| *bad) {
            Some((key, _)) => Err(ConfigError::Invalid(format!("{} out of range", key))),
            None => Ok(()),
        }
    }

    /// Per-tunnel admission window
    pub fn queue_max(&self) -> u32 {
        (self.max_msgs_queue / self.max_tunnels.max(1)).saturating_add(1)
    }

    pub fn refresh_path_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_path_time)
    }

    /// Silence after which relays and destinations give a tunnel up
    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_path_time.saturating_mul(4))
    }

    pub fn id_announce_interval(&self) -> Duration {
        Duration::from_secs(self.id_announce_time)
    }

    pub fn initial_poll_interval(&self) -> Duration {
        Duration::from_secs(self.initial_poll_time)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_secs(self.max_poll_time)
    }

    pub fn initial_retransmit_interval(&self) -> Duration {
        Duration::from_secs(self.initial_retransmit_time)
    }

    pub fn max_retransmit_interval(&self) -> Duration {
        Duration::from_secs(self.max_retransmit_time)
    }
}

fn override_from<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{}{}", ENV_PREFIX, key);
    if let Some(raw) = lookup(&name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidEnvVar(name.clone(), e.to_string()))?;
        debug!("{} overridden from environment", name);
    }
    Ok(())
}

/// Install a global `fmt` subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| ConfigError::Other(format!("Invalid log filter {}: {}", level, e)))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| ConfigError::Other(e.to_string()))
}
