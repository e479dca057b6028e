//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The encryption key is loaded from the POOL_ENCRYPTION_KEY env var or
//! `encryption.key_file`, never stored in the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var holding the base64url field encryption key.
pub const KEY_ENV: &str = "POOL_ENCRYPTION_KEY";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Public API: select, status reports, health, metrics.
    pub listen_addr: SocketAddr,
    /// Operator API. Keep it off public interfaces.
    pub admin_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
pub struct EncryptionConfig {
    #[serde(skip)]
    pub key: Option<Secret<String>>,
    /// Path to a file containing the key (alternative to POOL_ENCRYPTION_KEY)
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

/// Background job timing
#[derive(Debug, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_expire_interval")]
    pub expire_interval_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            cooldown_secs: default_cooldown(),
            reconcile_interval_secs: default_reconcile_interval(),
            expire_interval_secs: default_expire_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl ScheduleConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn expire_interval(&self) -> Duration {
        Duration::from_secs(self.expire_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_enabled() -> bool {
    true
}

fn default_cooldown() -> u64 {
    60
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_expire_interval() -> u64 {
    3600
}

fn default_shutdown_grace() -> u64 {
    5
}

impl Config {
    /// Load configuration from a TOML file, then resolve the encryption key.
    ///
    /// Key resolution order:
    /// 1. POOL_ENCRYPTION_KEY env var
    /// 2. key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        for (name, value) in [
            ("cooldown_secs", config.schedule.cooldown_secs),
            (
                "reconcile_interval_secs",
                config.schedule.reconcile_interval_secs,
            ),
            ("expire_interval_secs", config.schedule.expire_interval_secs),
        ] {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if let Ok(key) = std::env::var(KEY_ENV) {
            config.encryption.key = Some(Secret::new(key.trim().to_owned()));
        } else if let Some(ref key_file) = config.encryption.key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.encryption.key = Some(Secret::new(key));
            }
        }

        if config.encryption.key.is_none() {
            return Err(common::Error::Config(format!(
                "no encryption key: set {KEY_ENV} or encryption.key_file"
            )));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("identity-pool.toml")
    }
}
