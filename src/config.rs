use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::store::IsolationLevel;

/// Environment variable that overrides `postgres.url`.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Apply the embedded schema migrations on connect
    #[serde(default)]
    pub run_migrations: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

impl PostgresConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            run_migrations: false,
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Transaction behaviour of the ledger store
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    /// Upper bound for a whole transfer transaction. `None` means unbounded.
    #[serde(default)]
    pub tx_timeout_ms: Option<u64>,
}

impl StoreConfig {
    pub fn tx_timeout(&self) -> Option<Duration> {
        self.tx_timeout_ms.map(Duration::from_millis)
    }
}

impl AppConfig {
    /// Load `config/<env>.yaml`, then apply `DATABASE_URL` if it is set.
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path))?;

        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            config.postgres.url = url;
        }
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}
