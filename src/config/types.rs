//! Configuration type definitions.
//!
//! One section per cluster service. Keys are kebab-case so the recognized
//! option names (`flush-timeout`, `interest-timeout`, `hash-val`, ...)
//! appear in config files exactly as documented.

use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use super::defaults::{
    default_ca_address, default_connect_address, default_database_directory,
    default_database_extension, default_database_tracker, default_dbm_filename,
    default_flush_timeout, default_interest_timeout, default_max_channels, default_max_ids,
    default_md_address, default_min_channels, default_min_ids, default_queue_limit,
    default_version,
};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub server: ServerConfig,
    pub messagedirector: DirectorConfig,
    pub clientagent: AgentConfig,
    pub stateserver: StateConfig,
    pub database: DatabaseConfig,
    pub schema: SchemaConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Process-wide options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerConfig {
    pub log_format: LogFormat,
}

/// Message director section.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DirectorConfig {
    /// Bind endpoint for the routing fabric.
    pub address: SocketAddr,
    /// Flush period in seconds for the routed-message queue.
    pub flush_timeout: f64,
    /// Cap on queued routed messages; overflow is dropped with a warning.
    pub queue_limit: usize,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            address: default_md_address(),
            flush_timeout: default_flush_timeout(),
            queue_limit: default_queue_limit(),
        }
    }
}

impl DirectorConfig {
    pub fn flush_period(&self) -> Duration {
        Duration::from_secs_f64(self.flush_timeout.max(0.0001))
    }
}

/// Client agent section.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AgentConfig {
    /// External bind endpoint for game clients.
    pub address: SocketAddr,
    /// Message director endpoint to connect to.
    pub connect_address: SocketAddr,
    /// Well-known channel the agent itself subscribes.
    pub channel: u64,
    /// Server version string gating `CLIENT_LOGIN_2`.
    pub version: String,
    /// Expected schema hash; 0 means "use the loaded catalog's hash".
    pub hash_val: u32,
    /// Per-connection channel pool bounds.
    pub min_channels: u64,
    pub max_channels: u64,
    /// Seconds before a pending interest handshake is forced complete.
    pub interest_timeout: f64,
    /// Persistent token → account-id store.
    pub dbm_filename: String,
    /// Directory of per-branch visibility files; unset means no street
    /// visibility data (every zone treated standalone).
    pub dna_directory: Option<String>,
    /// Optional name-part dictionary for pattern names.
    pub name_parts_file: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: default_ca_address(),
            connect_address: default_connect_address(),
            channel: otp_proto::CLIENT_AGENT_CHANNEL,
            version: default_version(),
            hash_val: 0,
            min_channels: default_min_channels(),
            max_channels: default_max_channels(),
            interest_timeout: default_interest_timeout(),
            dbm_filename: default_dbm_filename(),
            dna_directory: None,
            name_parts_file: None,
        }
    }
}

impl AgentConfig {
    pub fn interest_timeout_period(&self) -> Duration {
        Duration::from_secs_f64(self.interest_timeout.max(0.01))
    }
}

/// State server section.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StateConfig {
    /// Message director endpoint to connect to.
    pub connect_address: SocketAddr,
    /// Well-known channel the state server subscribes.
    pub channel: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            connect_address: default_connect_address(),
            channel: otp_proto::STATE_SERVER_CHANNEL,
        }
    }
}

/// Database server section.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DatabaseConfig {
    /// Message director endpoint to connect to.
    pub connect_address: SocketAddr,
    /// Well-known channel the database subscribes.
    pub channel: u64,
    /// Directory holding one file per stored object.
    pub directory: String,
    /// Extension appended to object filenames.
    pub extension: String,
    /// Name of the singleton id-tracker file.
    pub tracker: String,
    /// Allocated object-id range.
    pub min_channels: u32,
    pub max_channels: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connect_address: default_connect_address(),
            channel: otp_proto::DATABASE_CHANNEL,
            directory: default_database_directory(),
            extension: default_database_extension(),
            tracker: default_database_tracker(),
            min_channels: default_min_ids(),
            max_channels: default_max_ids(),
        }
    }
}

/// Type-catalog source.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchemaConfig {
    /// Path to a TOML class catalog; unset means the built-in game schema.
    pub file: Option<String>,
}
