//! Runtime configuration.
//!
//! Every setting has a default; a handful can be overridden from the
//! environment with [`Config::from_env`].

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::net::codec::MAX_CHUNK_SIZE;
use crate::net::discovery::DiscoveryConfig;
use crate::net::endpoint::NetConfig;
use crate::net::transfer::TransferConfig;

pub const DISCOVERY_PORT_ENV: &str = "LANSHARE_DISCOVERY_PORT";
pub const TRANSFER_PORT_ENV: &str = "LANSHARE_TRANSFER_PORT";
pub const DEVICE_NAME_ENV: &str = "LANSHARE_DEVICE_NAME";
pub const DOWNLOAD_DIR_ENV: &str = "LANSHARE_DOWNLOAD_DIR";
pub const CHUNK_SIZE_ENV: &str = "LANSHARE_CHUNK_SIZE";
pub const MAX_SESSIONS_ENV: &str = "LANSHARE_MAX_SESSIONS";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is not valid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Everything needed to start a node.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub net: NetConfig,
    pub discovery: DiscoveryConfig,
    pub transfer: TransferConfig,
    /// Name announced to peers. Falls back to the persisted or host name.
    pub device_name: Option<String>,
}

impl Config {
    /// Defaults with overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults with overrides from `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = parse::<u16>(&lookup, DISCOVERY_PORT_ENV)? {
            config.net.discovery_port = port;
        }
        if let Some(port) = parse::<u16>(&lookup, TRANSFER_PORT_ENV)? {
            config.net.transfer_port = port;
        }
        if let Some(name) = lookup(DEVICE_NAME_ENV) {
            let name = name.trim();
            if name.is_empty() {
                return Err(invalid(DEVICE_NAME_ENV, name, "must not be empty"));
            }
            config.device_name = Some(name.to_string());
        }
        if let Some(dir) = lookup(DOWNLOAD_DIR_ENV) {
            if dir.is_empty() {
                return Err(invalid(DOWNLOAD_DIR_ENV, &dir, "must not be empty"));
            }
            config.transfer.download_dir = PathBuf::from(dir);
        }
        if let Some(size) = parse::<u32>(&lookup, CHUNK_SIZE_ENV)? {
            if size == 0 || size > MAX_CHUNK_SIZE {
                return Err(invalid(
                    CHUNK_SIZE_ENV,
                    &size.to_string(),
                    "must be between 1 byte and 16 MiB",
                ));
            }
            config.transfer.chunk_size = size;
        }
        if let Some(max) = parse::<usize>(&lookup, MAX_SESSIONS_ENV)? {
            if max == 0 {
                return Err(invalid(MAX_SESSIONS_ENV, "0", "must be at least 1"));
            }
            config.transfer.max_concurrent_sessions = max;
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(var, &raw, "not a number in range")),
    }
}

fn invalid(var: &'static str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason,
    }
}
