//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The cipher passphrase is loaded from CREDENTIAL_POOL_PASSPHRASE or
//! passphrase_file, never stored in the TOML directly.

use common::Secret;
use credential_pool::PoolConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Environment variable holding the credential cipher passphrase.
pub const PASSPHRASE_ENV: &str = "CREDENTIAL_POOL_PASSPHRASE";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub cipher: CipherConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Credential store location
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

/// At-rest encryption settings
#[derive(Debug, Default, Deserialize)]
pub struct CipherConfig {
    #[serde(skip)]
    pub passphrase: Option<Secret<String>>,
    /// Path to a file containing the passphrase (alternative to the env var)
    #[serde(default)]
    pub passphrase_file: Option<PathBuf>,
}

fn default_max_connections() -> usize {
    256
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Passphrase resolution order:
    /// 1. CREDENTIAL_POOL_PASSPHRASE env var
    /// 2. passphrase_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.server.max_connections == 0 {
            return Err(common::Error::config(
                "max_connections must be greater than 0",
            ));
        }
        config.pool.validate()?;

        if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
            config.cipher.passphrase = Some(Secret::new(passphrase));
        } else if let Some(ref file) = config.cipher.passphrase_file {
            let passphrase = std::fs::read_to_string(file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read passphrase_file {}: {e}",
                    file.display()
                ))
            })?;
            let passphrase = passphrase.trim().to_owned();
            if !passphrase.is_empty() {
                config.cipher.passphrase = Some(Secret::new(passphrase));
            }
        }

        if config.cipher.passphrase.is_none() {
            return Err(common::Error::Config(format!(
                "no cipher passphrase: set {PASSPHRASE_ENV} or cipher.passphrase_file"
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
        PathBuf::from("pool-status.toml")
    }
}
