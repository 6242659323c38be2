use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::controller::SessionPolicy;
use crate::pipeline::providers::ProviderSettings;

/// Application-level constants
pub const APP_NAME: &str = "OrderCheck";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const DATABASE_FILE: &str = "ordercheck.db";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "info,ordercheck=debug"
}

/// Get the application data directory (~/.ordercheck, or the working
/// directory when no home directory is known)
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".ordercheck"))
        .unwrap_or_else(|| PathBuf::from(".ordercheck"))
}

pub fn default_database_path() -> PathBuf {
    app_data_dir().join(DATABASE_FILE)
}

/// Startup configuration: storage, provider priority order and loop bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Providers in failover priority order.
    pub providers: Vec<ProviderSettings>,
    #[serde(default)]
    pub session: SessionPolicy,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::Invalid("at least one provider is required".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(ConfigError::Invalid("provider id must not be empty".into()));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
            if provider.timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "provider '{}' timeout must be positive",
                    provider.id
                )));
            }
        }
        Ok(())
    }
}

/// Load and validate a JSON config file.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: AppConfig = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    tracing::debug!(
        providers = config.providers.len(),
        database = %config.database_path.display(),
        "Configuration loaded"
    );
    Ok(config)
}
