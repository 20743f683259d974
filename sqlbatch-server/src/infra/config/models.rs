use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlbatch_core::batch::{BatchConfig, MetadataTemplates, UserDatabaseMetadata};

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Fully resolved worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis: RedisConfig,
    pub database: DatabaseConfig,
    pub batch: BatchConfig,
    pub users: UsersConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
        }
    }
}

/// Settings for the connections jobs open against tenant databases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub batch_port: u16,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { batch_port: 5432 }
    }
}

/// Where tenant connection details come from.
///
/// With an empty `accounts` table the Redis user records are used;
/// otherwise only the listed accounts can run jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsersConfig {
    #[serde(flatten)]
    pub templates: MetadataTemplates,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub accounts: HashMap<String, UserDatabaseMetadata>,
}

impl UsersConfig {
    pub fn is_static(&self) -> bool {
        !self.accounts.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
