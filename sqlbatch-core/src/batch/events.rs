use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

/// Readiness signal: `user` has new work, optionally on a known `host`.
///
/// Delivery is best-effort and at-most-once. Anything missed here is picked up
/// by the next reconciliation pass.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobReady {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl JobReady {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: None,
        }
    }

    pub fn on_host(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: Some(host.into()),
        }
    }

    /// Wire payload is JSON; a bare user name is also accepted.
    pub fn decode(payload: &str) -> Option<Self> {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('{') {
            return serde_json::from_str::<JobReady>(trimmed)
                .ok()
                .filter(|ready| !ready.user.is_empty());
        }
        Some(JobReady::new(trimmed))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, event: JobReady) -> Result<()>;
}

/// Subscriber side of the readiness channel. `unsubscribe` is idempotent.
#[async_trait]
pub trait JobSubscriber: Send + Sync {
    async fn subscribe(&self) -> Result<broadcast::Receiver<JobReady>>;
    async fn unsubscribe(&self) -> Result<()>;
}
