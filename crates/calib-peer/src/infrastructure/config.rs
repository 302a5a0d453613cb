//! TOML configuration for a calib-peer node.
//!
//! Read from `calib-peer.toml` in the working directory when present.  Every
//! field has a default, so an empty file (or no file at all) is a valid
//! configuration:
//!
//! ```toml
//! service_type = "example-chat"
//! display_name = "lab-headset-2"
//! discovery_port = 24810
//! announce_interval_ms = 1000
//! peer_timeout_ms = 5000
//! invite_timeout_ms = 10000
//! log_level = "debug"
//! ```
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` take the value of
//! `some_fn()` when absent, which keeps older config files loadable when new
//! fields are added.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use calib_core::SERVICE_TYPE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name looked up in the working directory by [`load_or_default`].
pub const CONFIG_FILE_NAME: &str = "calib-peer.toml";

/// Longest accepted service type.
const MAX_SERVICE_TYPE_LEN: usize = 15;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The service type is not a valid discovery identifier.
    #[error("invalid service type {0:?}: use 1-15 lowercase letters, digits or single hyphens")]
    InvalidServiceType(String),

    /// The bind address is not an IP address.
    #[error("invalid bind address {0:?}")]
    InvalidBindAddress(String),
}

// ── Config schema ─────────────────────────────────────────────────────────────

/// Settings for one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerConfig {
    /// Discovery namespace; only peers with the same value see each other.
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Human-readable name advertised to other peers.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// IP address to bind the transport socket to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// UDP port used for announces and peer traffic.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
    /// Silence after which a peer is considered gone.
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    /// How long an invitation may stay unanswered.
    #[serde(default = "default_invite_timeout_ms")]
    pub invite_timeout_ms: u64,
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_service_type() -> String {
    SERVICE_TYPE.to_string()
}
fn default_display_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "calib-peer".to_string())
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_discovery_port() -> u16 {
    24810
}
fn default_announce_interval_ms() -> u64 {
    1000
}
fn default_peer_timeout_ms() -> u64 {
    5000
}
fn default_invite_timeout_ms() -> u64 {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            display_name: default_display_name(),
            bind_address: default_bind_address(),
            discovery_port: default_discovery_port(),
            announce_interval_ms: default_announce_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
            invite_timeout_ms: default_invite_timeout_ms(),
            log_level: default_log_level(),
        }
    }
}

impl PeerConfig {
    /// Checks the values serde cannot check.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidServiceType`] or [`ConfigError::InvalidBindAddress`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_service_type(&self.service_type)?;
        self.bind_address
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidBindAddress(self.bind_address.clone()))?;
        Ok(())
    }

    /// Parsed bind address; the unspecified address if it does not parse.
    pub fn bind_ip(&self) -> IpAddr {
        self.bind_address
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn invite_timeout(&self) -> Duration {
        Duration::from_millis(self.invite_timeout_ms)
    }
}

/// Validates a discovery service type.
///
/// Accepted: 1–15 characters of lowercase ASCII letters, digits and hyphens,
/// containing at least one letter, with no leading, trailing or doubled hyphen.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidServiceType`] otherwise.
pub fn validate_service_type(service: &str) -> Result<(), ConfigError> {
    let valid = !service.is_empty()
        && service.len() <= MAX_SERVICE_TYPE_LEN
        && service
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && service.chars().any(|c| c.is_ascii_lowercase())
        && !service.starts_with('-')
        && !service.ends_with('-')
        && !service.contains("--");

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidServiceType(service.to_string()))
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads and validates the config at `path`.
///
/// # Errors
///
/// [`ConfigError::Io`] if the file cannot be read, [`ConfigError::Parse`] for
/// malformed TOML, or a validation error.
pub fn load_config(path: &Path) -> Result<PeerConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Loads [`CONFIG_FILE_NAME`] from the working directory, or returns the
/// defaults when it does not exist.
///
/// # Errors
///
/// As [`load_config`], except that a missing file is not an error.
pub fn load_or_default() -> Result<PeerConfig, ConfigError> {
    load_or_default_from(Path::new(CONFIG_FILE_NAME))
}

fn load_or_default_from(path: &Path) -> Result<PeerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_config(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PeerConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn parse_config(content: &str) -> Result<PeerConfig, ConfigError> {
    let config: PeerConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Writes `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &PeerConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
