//! Process configuration loaded from the environment.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::db::PoolSettings;
use crate::jobs::CoordinatorConfig;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const WORKERS: &str = "JOBFORGE_WORKERS";
pub const POLL_INTERVAL_MS: &str = "JOBFORGE_POLL_INTERVAL_MS";
pub const MIGRATIONS_DIR: &str = "JOBFORGE_MIGRATIONS_DIR";
pub const RUN_MIGRATIONS: &str = "JOBFORGE_RUN_MIGRATIONS";

/// Migrations shipped with this crate.
pub const DEFAULT_MIGRATIONS_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/migrations");

/// Configuration error. Fatal at startup; never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Everything a worker process needs to start.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub database_url: String,
    pub pool: PoolSettings,
    pub coordinator: CoordinatorConfig,
    pub migrations_dir: PathBuf,
    pub run_migrations: bool,
}

impl QueueConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load using an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup(DATABASE_URL)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing(DATABASE_URL))?;

        let defaults = CoordinatorConfig::default();
        let workers = match lookup(WORKERS) {
            Some(raw) => parse_positive(WORKERS, &raw)? as usize,
            None => defaults.workers,
        };
        let poll_interval = match lookup(POLL_INTERVAL_MS) {
            Some(raw) => Duration::from_millis(parse_positive(POLL_INTERVAL_MS, &raw)?),
            None => defaults.poll_interval,
        };

        let migrations_dir = lookup(MIGRATIONS_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MIGRATIONS_DIR));
        let run_migrations = match lookup(RUN_MIGRATIONS) {
            Some(raw) => parse_bool(RUN_MIGRATIONS, &raw)?,
            None => true,
        };

        Ok(Self {
            database_url,
            pool: PoolSettings::default(),
            coordinator: CoordinatorConfig {
                workers,
                poll_interval,
                ..defaults
            },
            migrations_dir,
            run_migrations,
        })
    }
}

fn parse_positive(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    let value: u64 = raw.trim().parse().map_err(|e| ConfigError::Invalid {
        var,
        reason: format!("{raw:?}: {e}"),
    })?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(value)
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            var,
            reason: format!("expected a boolean, got {other:?}"),
        }),
    }
}
