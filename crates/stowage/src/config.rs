use crate::error::{Result, StowageError};
use crate::migrate::MigrationOptions;
use crate::resilience::{RateLimiter, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use xdg::BaseDirectories;

pub const DB_ENV_VAR: &str = "STOWAGE_DB";
const APP_PREFIX: &str = "stowage";
const DB_FILE: &str = "stowage.db";
const CONFIG_FILE: &str = "stowage.toml";

pub struct Config {
    pub db_path: PathBuf,
    pub config_path: Option<PathBuf>,
}

impl Config {
    pub fn new(db_override: Option<PathBuf>) -> Result<Self> {
        let db_path = if let Some(path) = db_override {
            path
        } else if let Ok(env_path) = std::env::var(DB_ENV_VAR) {
            PathBuf::from(env_path)
        } else {
            let xdg = BaseDirectories::with_prefix(APP_PREFIX).map_err(|e| {
                StowageError::Config(format!("Failed to initialize XDG directories: {}", e))
            })?;
            xdg.place_data_file(DB_FILE)
                .map_err(|e| StowageError::Config(format!("Failed to create data directory: {}", e)))?
        };

        let config_path = BaseDirectories::with_prefix(APP_PREFIX)
            .ok()
            .and_then(|xdg| xdg.find_config_file(CONFIG_FILE));

        Ok(Self {
            db_path,
            config_path,
        })
    }

    pub fn ensure_db_directory(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Settings from the config file, or defaults when there is none.
    pub fn settings(&self) -> Result<Settings> {
        match &self.config_path {
            Some(path) => Settings::load(path),
            None => Ok(Settings::default()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Directory names never descended into, matched case-insensitively.
    pub excluded_directories: Vec<String>,
    pub rate_limit: RateLimitSettings,
    pub retry: RetrySettings,
    pub migration: MigrationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitSettings {
    pub max_calls: usize,
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_calls: 1000,
            window_secs: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MigrationSettings {
    pub batch_size: usize,
    pub non_destructive: bool,
    pub verify_hashes: bool,
    pub max_retries: u32,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        let defaults = MigrationOptions::default();
        Self {
            batch_size: defaults.batch_size,
            non_destructive: defaults.non_destructive,
            verify_hashes: defaults.verify_hashes,
            max_retries: defaults.max_retries,
        }
    }
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let settings = Self::parse(&content)
            .map_err(|e| StowageError::Config(format!("{}: {}", path.display(), e)))?;
        log::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| StowageError::Config(e.to_string()))
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_millis(self.retry.initial_delay_ms),
            self.retry.backoff_multiplier,
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn rate_limiter(&self) -> Result<RateLimiter> {
        RateLimiter::new(
            self.rate_limit.max_calls,
            Duration::from_secs(self.rate_limit.window_secs),
        )
    }

    pub fn migration_options(&self) -> MigrationOptions {
        MigrationOptions {
            batch_size: self.migration.batch_size.max(1),
            non_destructive: self.migration.non_destructive,
            verify_hashes: self.migration.verify_hashes,
            max_retries: self.migration.max_retries,
            ..MigrationOptions::default()
        }
    }
}
