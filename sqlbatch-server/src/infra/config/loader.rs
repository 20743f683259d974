use std::{
    fs,
    path::{Path, PathBuf},
};

use sqlbatch_core::batch::{BatchConfig, CapacityStrategy};
use thiserror::Error;

use super::{
    models::{Config, ConfigMetadata, DatabaseConfig, RedisConfig},
    sources::{EnvConfig, FileConfig},
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["sqlbatch.toml", "config/sqlbatch.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Loads `.env`, then the TOML file, then applies environment overrides.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        let env_file_loaded = loaded.or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            _ => Err(err),
        })?;

        let mut load = self.load_with_env(EnvConfig::gather())?;
        load.config.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Same as [`ConfigLoader::load`] with an explicit environment and no
    /// `.env` handling.
    pub fn load_with_env(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let (config, warnings) = compose_config(file_config, env, config_path)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => path,
                None => return Ok((None, None)),
            },
        };

        let file_config = read_file_config(&path)?;
        Ok((Some(file_config), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    config_path: Option<PathBuf>,
) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();
    if file_config.is_none() {
        warnings.push_with_hint(
            "No sqlbatch.toml detected; using defaults and environment variables",
            "Create sqlbatch.toml or point SQLBATCH_CONFIG at one",
        );
    }

    let FileConfig {
        redis: file_redis,
        database: file_database,
        batch: file_batch,
        users: file_users,
    } = file_config.unwrap_or_default();

    let redis = env
        .redis_url
        .clone()
        .or(file_redis.map(|redis| redis.url))
        .map(|url| RedisConfig { url })
        .unwrap_or_default();

    let mut users = file_users.unwrap_or_default();
    let database = DatabaseConfig {
        batch_port: env
            .database_batch_port
            .or(file_database.batch_port)
            .unwrap_or(users.templates.batch_port),
    };
    users.templates.batch_port = database.batch_port;

    let batch = apply_batch_overrides(file_batch.unwrap_or_default(), &env)?;

    let config = Config {
        redis,
        database,
        batch,
        users,
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded: false,
        },
    };

    warnings.extend(validation::apply_guard_rails(&config)?);
    Ok((config, warnings))
}

fn apply_batch_overrides(
    mut batch: BatchConfig,
    env: &EnvConfig,
) -> Result<BatchConfig, ConfigLoadError> {
    if let Some(name) = &env.batch_name {
        batch.name = name.clone();
    }
    if let Some(raw) = &env.capacity_strategy {
        batch.capacity.strategy =
            raw.parse::<CapacityStrategy>()
                .map_err(|reason| ConfigLoadError::InvalidEnv {
                    name: "BATCH_CAPACITY_STRATEGY",
                    value: raw.clone(),
                    reason,
                })?;
    }
    if let Some(amount) = env.capacity_fixed_amount {
        batch.capacity.fixed_amount = amount;
    }
    if let Some(template) = &env.capacity_http_url_template {
        batch.capacity.http_url_template = Some(template.clone());
    }
    if let Some(timeout) = env.capacity_http_timeout_ms {
        batch.capacity.http_timeout_ms = timeout;
    }
    if let Some(interval) = env.schedule_interval_ms {
        batch.schedule_interval_ms = interval;
    }
    if let Some(timeout) = env.query_timeout_ms {
        // 0 disables the limit.
        batch.query_timeout_ms = Some(timeout).filter(|ms| *ms > 0);
    }
    if let Some(max) = env.max_queued_jobs {
        batch.max_queued_jobs = max;
    }
    if let Some(ttl) = env.finished_jobs_ttl_secs {
        batch.finished_jobs_ttl_secs = ttl;
    }
    if let Some(timeout) = env.drain_timeout_ms {
        batch.drain_timeout_ms = timeout;
    }
    batch.capacity.fixed_amount = batch.capacity.fixed_amount.max(1);
    Ok(batch)
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value '{value}' for {name}: {reason}")]
    InvalidEnv {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}
