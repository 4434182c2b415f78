use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, AppResult};

pub const DEFAULT_API_BASE_URL: &str = "https://api.plato.so";
pub const DEFAULT_HUB_BASE_URL: &str = "https://hub.plato.so";
pub const DEFAULT_PROXY_ADDR: &str = "proxy.plato.so:9000";
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Runtime configuration, resolved once at startup and threaded explicitly
/// into every component that needs it.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub api_base_url: String,
    pub hub_base_url: String,
    /// Outbound CONNECT proxy endpoint, `host:port`.
    pub proxy_addr: String,
    pub heartbeat_interval: Duration,
    /// Tool state directory, `~/.plato` unless overridden.
    pub home_dir: PathBuf,
    /// SSH client config file, `~/.ssh/config` unless overridden.
    pub ssh_config_path: PathBuf,
}

impl Config {
    /// Build a config from the environment. A missing API key is an advisory
    /// error: nothing remote works without it, so callers should surface the
    /// message and fall back to read-only behavior.
    pub fn from_env() -> AppResult<Self> {
        let api_key = std::env::var("PLATO_API_KEY").map_err(|_| {
            AppError::Config(
                "PLATO_API_KEY is not set; sandbox operations are unavailable".to_string(),
            )
        })?;

        let home = dirs::home_dir()
            .ok_or_else(|| AppError::Config("could not determine the home directory".to_string()))?;

        let home_dir = std::env::var("PLATO_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".plato"));
        let ssh_config_path = std::env::var("PLATO_SSH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".ssh").join("config"));

        let heartbeat_secs = match std::env::var("PLATO_HEARTBEAT_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                AppError::Config(format!("PLATO_HEARTBEAT_SECS is not a number: {raw}"))
            })?,
            Err(_) => DEFAULT_HEARTBEAT_SECS,
        };

        Ok(Self {
            api_key,
            api_base_url: std::env::var("PLATO_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string()),
            hub_base_url: std::env::var("PLATO_HUB_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_HUB_BASE_URL.to_string()),
            proxy_addr: std::env::var("PLATO_PROXY_ADDR")
                .unwrap_or_else(|_| DEFAULT_PROXY_ADDR.to_string()),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            home_dir,
            ssh_config_path,
        })
    }

    /// Path of the custom DB credential overlay document.
    pub fn custom_db_configs_path(&self) -> PathBuf {
        self.home_dir.join("custom_db_configs.json")
    }

    /// Directory holding the generated SSH keypair.
    pub fn ssh_key_dir(&self) -> PathBuf {
        self.home_dir.join("ssh")
    }
}
