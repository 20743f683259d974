use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{BatchError, Result};

use super::config::{CapacityConfig, CapacityStrategy};

/// Smallest capacity any strategy reports. A host always gets one slot.
pub const MIN_CAPACITY: usize = 1;

/// Number of users that may run concurrently on `host` right now.
///
/// Implementations never fail: anything that goes wrong while computing the
/// value degrades to [`MIN_CAPACITY`].
#[async_trait]
pub trait CapacityProvider: Send + Sync + fmt::Debug {
    async fn capacity(&self, host: &str) -> usize;
}

#[derive(Clone, Copy, Debug)]
pub struct FixedCapacity {
    amount: usize,
}

impl FixedCapacity {
    pub fn new(amount: usize) -> Self {
        Self {
            amount: amount.max(MIN_CAPACITY),
        }
    }
}

#[async_trait]
impl CapacityProvider for FixedCapacity {
    async fn capacity(&self, _host: &str) -> usize {
        self.amount
    }
}

/// How a probe response body is turned into a slot count.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProbeMode {
    /// `{"available_cores": N}`
    AvailableCores,
    /// `{"cores": N, "relative_load": f}`, scaled down by load.
    CoresLoad,
}

#[derive(Deserialize)]
struct AvailableCoresBody {
    available_cores: f64,
}

#[derive(Deserialize)]
struct CoresLoadBody {
    cores: f64,
    relative_load: f64,
}

impl ProbeMode {
    pub fn parse(&self, body: &str) -> Result<usize> {
        let raw = match self {
            ProbeMode::AvailableCores => {
                let body: AvailableCoresBody = serde_json::from_str(body)?;
                body.available_cores
            }
            ProbeMode::CoresLoad => {
                let body: CoresLoadBody = serde_json::from_str(body)?;
                body.cores * (1.0 - body.relative_load)
            }
        };

        if !raw.is_finite() {
            return Err(BatchError::Capacity(format!(
                "probe returned a non-finite value: {raw}"
            )));
        }

        Ok((raw.floor().max(0.0) as usize).max(MIN_CAPACITY))
    }
}

/// Capacity read from a per-host HTTP endpoint. Results are kept for
/// `cache_ttl` so a burst of dispatches does not hammer the probe.
pub struct HttpCapacity {
    client: reqwest::Client,
    url_template: String,
    mode: ProbeMode,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, usize)>>,
}

impl fmt::Debug for HttpCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self
            .cache
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("HttpCapacity")
            .field("url_template", &self.url_template)
            .field("mode", &self.mode)
            .field("cache_ttl", &self.cache_ttl)
            .field("cached_hosts", &cached)
            .finish()
    }
}

impl HttpCapacity {
    pub fn new(
        url_template: impl Into<String>,
        mode: ProbeMode,
        timeout: Duration,
        cache_ttl: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                BatchError::Capacity(format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            url_template: url_template.into(),
            mode,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn url_for(&self, host: &str) -> String {
        self.url_template.replace("{dbhost}", host)
    }

    async fn probe(&self, host: &str) -> Result<usize> {
        let url = self.url_for(host);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| BatchError::Capacity(format!("GET {url} failed: {e}")))?;
        let body = response
            .text()
            .await
            .map_err(|e| BatchError::Capacity(format!("reading {url} failed: {e}")))?;
        self.mode.parse(&body)
    }

    async fn cached(&self, host: &str) -> Option<usize> {
        let guard = self.cache.lock().await;
        guard
            .get(host)
            .filter(|(at, _)| at.elapsed() < self.cache_ttl)
            .map(|(_, value)| *value)
    }
}

#[async_trait]
impl CapacityProvider for HttpCapacity {
    async fn capacity(&self, host: &str) -> usize {
        if let Some(value) = self.cached(host).await {
            return value;
        }

        match self.probe(host).await {
            Ok(value) => {
                debug!(target: "batch::capacity", host = %host, capacity = value, "probed host capacity");
                let mut guard = self.cache.lock().await;
                guard.insert(host.to_string(), (Instant::now(), value));
                value
            }
            Err(err) => {
                warn!(
                    target: "batch::capacity",
                    host = %host,
                    error = %err,
                    "capacity probe failed; using minimum"
                );
                MIN_CAPACITY
            }
        }
    }
}

/// Builds the provider selected by configuration.
pub fn from_config(config: &CapacityConfig) -> Result<Arc<dyn CapacityProvider>> {
    let mode = match config.strategy {
        CapacityStrategy::Fixed => {
            return Ok(Arc::new(FixedCapacity::new(config.fixed_amount)));
        }
        CapacityStrategy::HttpSimple => ProbeMode::AvailableCores,
        CapacityStrategy::HttpLoad => ProbeMode::CoresLoad,
    };

    let template = config
        .http_url_template
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    if template.is_empty() {
        warn!(
            target: "batch::capacity",
            strategy = ?config.strategy,
            capacity = MIN_CAPACITY,
            "no probe url template configured; every probe would fail"
        );
        return Ok(Arc::new(FixedCapacity::new(MIN_CAPACITY)));
    }

    Ok(Arc::new(HttpCapacity::new(
        template,
        mode,
        Duration::from_millis(config.http_timeout_ms),
        Duration::from_millis(config.http_cache_ms),
    )?))
}
