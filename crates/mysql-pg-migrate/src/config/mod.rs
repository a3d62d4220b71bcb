//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{MigrateError, Result};
use std::path::{Path, PathBuf};

/// Environment variable replacing `src.password` when set.
pub const SRC_PASSWORD_ENV: &str = "MYSQL2PG_SRC_PASSWORD";

/// Environment variable replacing `dest.password` when set.
pub const DEST_PASSWORD_ENV: &str = "MYSQL2PG_DEST_PASSWORD";

const DEFAULT_FILE_NAME: &str = ".mysql2pg.yaml";

impl Config {
    /// Load configuration from a YAML file, applying environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Default configuration path: `$HOME/.mysql2pg.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DEFAULT_FILE_NAME))
    }

    /// Replace passwords from the environment. Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(pw) = lookup(SRC_PASSWORD_ENV).filter(|v| !v.is_empty()) {
            self.src.password = pw;
        }
        if let Some(pw) = lookup(DEST_PASSWORD_ENV).filter(|v| !v.is_empty()) {
            self.dest.password = pw;
        }
    }
}

impl TargetConfig {
    /// Build a tokio-postgres config for this destination.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut cfg = tokio_postgres::Config::new();
        cfg.host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.username)
            .password(&self.password)
            .application_name("mysql2pg");
        cfg
    }
}
