use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs that tune the batch worker.
///
/// All fields carry defaults so deployments only need to override what they
/// care about.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Worker name used in logs.
    pub name: String,
    /// Reconciliation cadence: every interval all non-empty queues are
    /// re-announced to the host scheduler.
    pub schedule_interval_ms: u64,
    /// How many users may run jobs concurrently on one database host.
    pub capacity: CapacityConfig,
    /// Maximum execution time for a single job. `None` disables the limit.
    pub query_timeout_ms: Option<u64>,
    /// Maximum number of jobs a user may have waiting in the queue.
    pub max_queued_jobs: usize,
    /// Retention for finished job records.
    pub finished_jobs_ttl_secs: u64,
    /// How long drain waits for cancelled executions to unwind.
    pub drain_timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            name: "batch".to_string(),
            schedule_interval_ms: 60_000,
            capacity: CapacityConfig::default(),
            query_timeout_ms: Some(12 * 3_600 * 1_000),
            max_queued_jobs: 64,
            finished_jobs_ttl_secs: 2 * 3_600,
            drain_timeout_ms: 30_000,
        }
    }
}

impl BatchConfig {
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms.max(1))
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Strategy names accepted in configuration files and the environment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityStrategy {
    #[default]
    Fixed,
    HttpSimple,
    HttpLoad,
}

impl std::str::FromStr for CapacityStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(CapacityStrategy::Fixed),
            "http-simple" => Ok(CapacityStrategy::HttpSimple),
            "http-load" => Ok(CapacityStrategy::HttpLoad),
            other => Err(format!("unknown capacity strategy '{other}'")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub strategy: CapacityStrategy,
    /// Applies when `strategy = "fixed"`. Values below 1 are raised to 1.
    pub fixed_amount: usize,
    /// Probe endpoint for the http strategies. `{dbhost}` is replaced by the
    /// database host. An empty template falls back to `fixed`.
    pub http_url_template: Option<String>,
    pub http_timeout_ms: u64,
    /// Probe results are reused for this long before asking again.
    pub http_cache_ms: u64,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            strategy: CapacityStrategy::Fixed,
            fixed_amount: 4,
            http_url_template: Some("http://{dbhost}:9999/load".to_string()),
            http_timeout_ms: 2_000,
            http_cache_ms: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_payload_keeps_defaults() {
        let cfg: BatchConfig = serde_json::from_str(
            r#"{"name":"w1","capacity":{"strategy":"http-load"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.name, "w1");
        assert_eq!(cfg.capacity.strategy, CapacityStrategy::HttpLoad);
        assert_eq!(cfg.capacity.fixed_amount, 4);
        assert_eq!(cfg.schedule_interval(), Duration::from_secs(60));
        assert_eq!(cfg.max_queued_jobs, 64);
    }

    #[test]
    fn zero_timeout_disables_limit() {
        let cfg = BatchConfig {
            query_timeout_ms: Some(0),
            ..BatchConfig::default()
        };
        assert!(cfg.query_timeout().is_none());
    }

    #[test]
    fn strategy_parses_from_env_style_names() {
        assert_eq!(
            "HTTP-SIMPLE".parse::<CapacityStrategy>().unwrap(),
            CapacityStrategy::HttpSimple
        );
        assert!("round-robin".parse::<CapacityStrategy>().is_err());
    }
}
