//! Configuration management for Lab Sync Server

use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL, or `memory` for the non-persistent in-process store
    pub url: String,
}

/// Limits applied by the sync engine
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Maximum mutations accepted in one push
    pub max_batch_size: usize,
    /// Maximum participants returned by one pull
    pub participant_cap: usize,
    /// Maximum samples returned by one pull
    pub sample_cap: usize,
    /// How many times a mutation is re-resolved after losing an optimistic check
    pub commit_attempts: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            max_batch_size: 100,
            participant_cap: 500,
            sample_cap: 1000,
            commit_attempts: 3,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./labsync.db".to_string(),
            },
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = SyncConfig::default();

        let sync = SyncConfig {
            max_batch_size: parse_var("SYNC_MAX_BATCH", defaults.max_batch_size)?,
            participant_cap: parse_var("SYNC_PARTICIPANT_CAP", defaults.participant_cap)?,
            sample_cap: parse_var("SYNC_SAMPLE_CAP", defaults.sample_cap)?,
            commit_attempts: parse_var("SYNC_COMMIT_ATTEMPTS", defaults.commit_attempts)?,
        };

        if sync.max_batch_size == 0 || sync.participant_cap == 0 || sync.sample_cap == 0 {
            return Err(ConfigError::Invalid(
                "sync limits must be greater than zero".to_string(),
            ));
        }

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("SERVER_PORT", 3000)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite:./labsync.db".to_string()),
            },
            sync: SyncConfig {
                commit_attempts: sync.commit_attempts.max(1),
                ..sync
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidVar { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name, value }),
        Err(_) => Ok(default),
    }
}
