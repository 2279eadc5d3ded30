use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::storage::StoreConfig;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address (default: 127.0.0.1:9300)
    pub http_addr: String,
    /// WebSocket listen address (default: 127.0.0.1:1234)
    pub ws_addr: String,
    /// RocksDB settings; `path` comes from ATLAS_DATA_DIR
    pub storage: StoreConfig,
    /// Frames buffered per connection before it is dropped (default: 256)
    pub outbox_capacity: usize,
    /// Upper bound on a single socket write (default: 5s)
    pub send_timeout: Duration,
    /// Users registered at startup as (id, display name)
    pub seed_users: Vec<(String, String)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:9300".to_string(),
            ws_addr: "127.0.0.1:1234".to_string(),
            storage: StoreConfig::default(),
            outbox_capacity: 256,
            send_timeout: Duration::from_millis(5000),
            seed_users: Vec::new(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

impl ServerConfig {
    /// Load configuration from environment variables, reading `.env` first
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let http_addr = lookup("ATLAS_HTTP_ADDR").unwrap_or(defaults.http_addr);
        let ws_addr = lookup("ATLAS_WS_ADDR").unwrap_or(defaults.ws_addr);

        let mut storage = defaults.storage;
        if let Some(dir) = lookup("ATLAS_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            storage.path = PathBuf::from(dir);
        }
        if let Some(value) = lookup("ATLAS_SYNC_WRITES") {
            storage.sync_writes = parse_bool("ATLAS_SYNC_WRITES", &value)?;
        }

        let outbox_capacity = match lookup("ATLAS_OUTBOX_CAPACITY") {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(invalid("ATLAS_OUTBOX_CAPACITY", value)),
            },
            None => defaults.outbox_capacity,
        };

        let send_timeout = match lookup("ATLAS_SEND_TIMEOUT_MS") {
            Some(value) => match value.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => return Err(invalid("ATLAS_SEND_TIMEOUT_MS", value)),
            },
            None => defaults.send_timeout,
        };

        let seed_users = lookup("ATLAS_USERS")
            .map(|v| parse_users(&v))
            .unwrap_or_default();

        Ok(ServerConfig {
            http_addr,
            ws_addr,
            storage,
            outbox_capacity,
            send_timeout,
            seed_users,
        })
    }
}

fn invalid(name: &'static str, value: String) -> ConfigError {
    ConfigError::InvalidValue { name, value }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(invalid(name, value.to_string())),
    }
}

/// `alice:Alice Smith,bob` → [("alice", "Alice Smith"), ("bob", "bob")]
fn parse_users(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| {
            let (id, name) = match entry.split_once(':') {
                Some((id, name)) => (id.trim(), name.trim()),
                None => (entry, entry),
            };
            if id.is_empty() {
                return None;
            }
            let name = if name.is_empty() { id } else { name };
            Some((id.to_string(), name.to_string()))
        })
        .collect()
}
