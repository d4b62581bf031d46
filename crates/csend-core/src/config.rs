//! Configuration system for csend.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CSEND_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/csend/config.toml
//!   3. ~/.config/csend/config.toml
//!
//! Protocol timings (intervals, timeouts, backoffs) are fixed constants and
//! are deliberately not part of this file.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::wire::{DISCOVERY_PORT, MAX_PEERS, MESSAGING_PORT, PEER_TIMEOUT_SECS};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CsendConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub peers: PeersConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Display name announced to other peers. Must not contain '|'.
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local IPv4 address to announce. Empty = auto-detect.
    pub local_address: String,
    /// Destination for discovery broadcasts.
    pub broadcast_address: String,
    /// UDP port for discovery.
    pub discovery_port: u16,
    /// TCP port for message connections.
    pub messaging_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// Peer table slots.
    pub capacity: usize,
    /// Seconds without a sighting before a peer is evicted.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Which scheduling model drives the node.
    pub scheduler: Scheduler,
    /// Cooperative model only: use the endpoint pool instead of the
    /// single connection slot.
    pub pooled: bool,
    /// Cooperative model only: milliseconds between driver ticks.
    pub tick_interval_ms: u64,
}

/// Scheduling model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheduler {
    /// One task per concern, shared peer table behind a mutex.
    #[default]
    Threaded,
    /// A single driver tick advances everything.
    Cooperative,
}

impl std::str::FromStr for Scheduler {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "threaded" => Ok(Scheduler::Threaded),
            "cooperative" => Ok(Scheduler::Cooperative),
            other => Err(ConfigError::InvalidValue("runtime.scheduler", other.to_string())),
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            username: std::env::var("USER").unwrap_or_else(|_| "anon".to_string()),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            local_address: String::new(),
            broadcast_address: "255.255.255.255".to_string(),
            discovery_port: DISCOVERY_PORT,
            messaging_port: MESSAGING_PORT,
        }
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_PEERS,
            timeout_secs: PEER_TIMEOUT_SECS,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: Scheduler::Threaded,
            pooled: false,
            tick_interval_ms: 50,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("csend")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {0}: {1:?}")]
    InvalidValue(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CsendConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CsendConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a config document. Missing sections fall back to defaults.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CSEND_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CsendConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// The configured local address, if one was set.
    pub fn local_address(&self) -> Result<Option<IpAddr>, ConfigError> {
        if self.network.local_address.is_empty() {
            return Ok(None);
        }
        self.network
            .local_address
            .parse()
            .map(Some)
            .map_err(|_| {
                ConfigError::InvalidValue(
                    "network.local_address",
                    self.network.local_address.clone(),
                )
            })
    }

    /// Reject values the protocol cannot carry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.username.is_empty() || self.identity.username.contains('|') {
            return Err(ConfigError::InvalidValue(
                "identity.username",
                self.identity.username.clone(),
            ));
        }
        if self.peers.capacity == 0 {
            return Err(ConfigError::InvalidValue("peers.capacity", "0".to_string()));
        }
        if self.network.broadcast_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidValue(
                "network.broadcast_address",
                self.network.broadcast_address.clone(),
            ));
        }
        self.local_address()?;
        Ok(())
    }

    /// Apply CSEND_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CSEND_IDENTITY__USERNAME") {
            self.identity.username = v;
        }
        if let Ok(v) = std::env::var("CSEND_NETWORK__LOCAL_ADDRESS") {
            self.network.local_address = v;
        }
        if let Ok(v) = std::env::var("CSEND_NETWORK__DISCOVERY_PORT") {
            if let Ok(p) = v.parse() {
                self.network.discovery_port = p;
            }
        }
        if let Ok(v) = std::env::var("CSEND_NETWORK__MESSAGING_PORT") {
            if let Ok(p) = v.parse() {
                self.network.messaging_port = p;
            }
        }
        if let Ok(v) = std::env::var("CSEND_RUNTIME__SCHEDULER") {
            if let Ok(s) = v.parse() {
                self.runtime.scheduler = s;
            }
        }
        if let Ok(v) = std::env::var("CSEND_RUNTIME__POOLED") {
            self.runtime.pooled = v == "true" || v == "1";
        }
    }
}
