//! Configuration system for Datum.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DATUM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/datum/config.toml
//!   3. ~/.config/datum/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatumConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub transport: TransportConfig,
    pub export: ExportConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name sent in every Hello.
    pub name: String,
    /// Path to the P-256 private key. Auto-generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Rendezvous server, `host:port`.
    pub server_addr: String,
    /// Hex `X‖Y` key of the rendezvous server. Empty = don't verify.
    pub server_public_key: String,
    /// Candidate peer addresses, tried in order.
    pub peer_addresses: Vec<String>,
    /// Pause between the NAT traversal request and our Hello.
    pub nat_settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// First read deadline; doubles on every inner attempt.
    pub initial_timeout_ms: u64,
    pub inner_attempts: u32,
    /// Full resend cycles before giving up.
    pub outer_attempts: u32,
    /// Extra GetDatum attempts after a hash mismatch.
    pub integrity_retries: u32,
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory exported to peers. None = advertise the empty root.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub output_dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: "datum".to_string(),
            keypair_path: config_dir().join("keypair"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_addr: "jch.irif.fr:8082".to_string(),
            server_public_key: String::new(),
            peer_addresses: Vec::new(),
            nat_settle_ms: 1000,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            initial_timeout_ms: 200,
            inner_attempts: 5,
            outer_attempts: 5,
            integrity_retries: 10,
            heartbeat_secs: 30,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: data_dir().join("downloads"),
        }
    }
}

impl NetworkConfig {
    pub fn nat_settle(&self) -> Duration {
        Duration::from_millis(self.nat_settle_ms)
    }
}

impl TransportConfig {
    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("datum")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("datum")
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DatumConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::parse(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            DatumConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DATUM_CONFIG")
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
            let text = toml::to_string_pretty(&DatumConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply DATUM_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("DATUM_IDENTITY__NAME") {
            self.identity.name = v;
        }
        if let Some(v) = lookup("DATUM_NETWORK__SERVER_ADDR") {
            self.network.server_addr = v;
        }
        if let Some(v) = lookup("DATUM_NETWORK__PEER_ADDRESSES") {
            self.network.peer_addresses = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("DATUM_EXPORT__ROOT") {
            self.export.root = if v.is_empty() { None } else { Some(PathBuf::from(v)) };
        }
        if let Some(v) = lookup("DATUM_DOWNLOAD__OUTPUT_DIR") {
            self.download.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("DATUM_TRANSPORT__INITIAL_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.transport.initial_timeout_ms = ms;
            }
        }
    }
}
