use serde::{Deserialize, Serialize};
use sqlbatch_core::batch::BatchConfig;
use std::path::PathBuf;

use super::models::UsersConfig;

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    pub redis: Option<FileRedisConfig>,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    pub batch: Option<BatchConfig>,
    pub users: Option<UsersConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub url: String,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_port: Option<u16>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub batch_name: Option<String>,
    /// Kept raw so an unknown strategy can be reported.
    pub capacity_strategy: Option<String>,
    pub capacity_fixed_amount: Option<usize>,
    pub capacity_http_url_template: Option<String>,
    pub capacity_http_timeout_ms: Option<u64>,
    pub schedule_interval_ms: Option<u64>,
    pub query_timeout_ms: Option<u64>,
    pub max_queued_jobs: Option<usize>,
    pub finished_jobs_ttl_secs: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
    pub database_batch_port: Option<u16>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the overrides from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let number = |name: &str| text(name).and_then(|raw| raw.trim().parse::<u64>().ok());

        Self {
            config_path: text("SQLBATCH_CONFIG").map(PathBuf::from),
            redis_url: text("REDIS_URL"),
            batch_name: text("BATCH_NAME"),
            capacity_strategy: text("BATCH_CAPACITY_STRATEGY"),
            capacity_fixed_amount: number("BATCH_CAPACITY_FIXED_AMOUNT")
                .map(|value| value as usize),
            capacity_http_url_template: lookup("BATCH_CAPACITY_HTTP_URL_TEMPLATE"),
            capacity_http_timeout_ms: number("BATCH_CAPACITY_HTTP_TIMEOUT_MS"),
            schedule_interval_ms: number("BATCH_SCHEDULE_INTERVAL_MS"),
            query_timeout_ms: number("BATCH_QUERY_TIMEOUT_MS"),
            max_queued_jobs: number("BATCH_MAX_QUEUED_JOBS").map(|value| value as usize),
            finished_jobs_ttl_secs: number("BATCH_FINISHED_JOBS_TTL_SECS"),
            drain_timeout_ms: number("BATCH_DRAIN_TIMEOUT_MS"),
            database_batch_port: text("DATABASE_BATCH_PORT")
                .and_then(|raw| raw.trim().parse().ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> EnvConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn parses_known_variables() {
        let env = env(&[
            ("REDIS_URL", "redis://cache:6379/2"),
            ("BATCH_CAPACITY_FIXED_AMOUNT", "8"),
            ("BATCH_QUERY_TIMEOUT_MS", "0"),
            ("DATABASE_BATCH_PORT", "6432"),
        ]);
        assert_eq!(env.redis_url.as_deref(), Some("redis://cache:6379/2"));
        assert_eq!(env.capacity_fixed_amount, Some(8));
        assert_eq!(env.query_timeout_ms, Some(0));
        assert_eq!(env.database_batch_port, Some(6432));
    }

    #[test]
    fn ignores_blank_and_malformed_values() {
        let env = env(&[
            ("BATCH_NAME", "  "),
            ("BATCH_SCHEDULE_INTERVAL_MS", "soon"),
            ("DATABASE_BATCH_PORT", "70000"),
        ]);
        assert!(env.batch_name.is_none());
        assert!(env.schedule_interval_ms.is_none());
        assert!(env.database_batch_port.is_none());
    }

    #[test]
    fn empty_probe_template_is_preserved() {
        let env = env(&[("BATCH_CAPACITY_HTTP_URL_TEMPLATE", "")]);
        assert_eq!(env.capacity_http_url_template.as_deref(), Some(""));
    }
}
