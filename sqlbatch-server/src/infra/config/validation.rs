use sqlbatch_core::batch::CapacityStrategy;
use thiserror::Error;
use url::Url;

use super::models::Config;

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("invalid Redis URL '{url}'")]
    InvalidRedisUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported Redis URL scheme '{scheme}'")]
    UnsupportedRedisScheme { scheme: String },
    #[error("batch name must not be empty")]
    EmptyBatchName,
    #[error("probe URL template '{template}' must contain {{dbhost}}")]
    ProbeTemplateWithoutHost { template: String },
}

/// Rejects configurations the worker cannot run with and reports the
/// questionable ones.
pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    let redis = Url::parse(&config.redis.url).map_err(|source| {
        ConfigGuardRailError::InvalidRedisUrl {
            url: config.redis.url.clone(),
            source,
        }
    })?;
    if !matches!(redis.scheme(), "redis" | "rediss" | "redis+unix" | "unix") {
        return Err(ConfigGuardRailError::UnsupportedRedisScheme {
            scheme: redis.scheme().to_string(),
        });
    }

    if config.batch.name.trim().is_empty() {
        return Err(ConfigGuardRailError::EmptyBatchName);
    }

    let capacity = &config.batch.capacity;
    if capacity.strategy != CapacityStrategy::Fixed {
        match capacity.http_url_template.as_deref().map(str::trim) {
            None | Some("") => warnings.push_with_hint(
                "probed capacity strategy without a probe URL; every host gets capacity 1",
                "Set BATCH_CAPACITY_HTTP_URL_TEMPLATE, e.g. http://{dbhost}:9999/load",
            ),
            Some(template) if !template.contains("{dbhost}") => {
                return Err(ConfigGuardRailError::ProbeTemplateWithoutHost {
                    template: template.to_string(),
                });
            }
            Some(_) => {}
        }
    }

    if config.batch.query_timeout().is_none() {
        warnings.push("query timeout disabled; jobs may run indefinitely");
    }

    if config.batch.schedule_interval_ms < 1_000 {
        warnings.push_with_hint(
            format!(
                "reconciliation every {} ms will keep Redis busy",
                config.batch.schedule_interval_ms
            ),
            "BATCH_SCHEDULE_INTERVAL_MS is usually left at 60000",
        );
    }

    if config.users.is_static() {
        warnings.push(format!(
            "using {} statically configured accounts; Redis user records are ignored",
            config.users.accounts.len()
        ));
    }

    Ok(warnings)
}
