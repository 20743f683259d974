use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

use super::job::JobId;

/// Per-user FIFO of job ids shared by every worker process.
///
/// `dequeue` must be atomic across workers: a job id is handed to exactly one
/// caller. An `Ok(None)` means the queue is legitimately empty; store failures
/// are reported as errors and must not be read as "empty".
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, user: &str, job_id: &JobId) -> Result<()>;

    /// Priority re-insert at the head of the user's queue. Only drain uses it.
    async fn enqueue_first(&self, user: &str, job_id: &JobId) -> Result<()>;

    async fn dequeue(&self, user: &str) -> Result<Option<JobId>>;

    /// Full scan of the store for users with pending work (startup).
    async fn scan_queues(&self) -> Result<Vec<String>>;

    /// Users with pending work (periodic reconciliation).
    async fn get_queues(&self) -> Result<Vec<String>>;

    async fn size(&self, user: &str) -> Result<usize>;
}

/// Process-local queue. Useful for tests and single-process embedding.
#[derive(Default)]
pub struct InMemoryJobQueue {
    queues: Mutex<HashMap<String, VecDeque<JobId>>>,
}

impl fmt::Debug for InMemoryJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let users = self
            .queues
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryJobQueue")
            .field("user_count", &users)
            .finish()
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordered contents of one user's queue, head first.
    pub async fn snapshot(&self, user: &str) -> Vec<JobId> {
        let guard = self.queues.lock().await;
        guard
            .get(user)
            .map(|queue| queue.iter().copied().collect())
            .unwrap_or_default()
    }

    async fn non_empty_users(&self) -> Vec<String> {
        let guard = self.queues.lock().await;
        guard
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(user, _)| user.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, user: &str, job_id: &JobId) -> Result<()> {
        let mut guard = self.queues.lock().await;
        guard.entry(user.to_string()).or_default().push_back(*job_id);
        Ok(())
    }

    async fn enqueue_first(&self, user: &str, job_id: &JobId) -> Result<()> {
        let mut guard = self.queues.lock().await;
        guard.entry(user.to_string()).or_default().push_front(*job_id);
        Ok(())
    }

    async fn dequeue(&self, user: &str) -> Result<Option<JobId>> {
        let mut guard = self.queues.lock().await;
        let Some(queue) = guard.get_mut(user) else {
            return Ok(None);
        };
        let job_id = queue.pop_front();
        if queue.is_empty() {
            guard.remove(user);
        }
        Ok(job_id)
    }

    async fn scan_queues(&self) -> Result<Vec<String>> {
        Ok(self.non_empty_users().await)
    }

    async fn get_queues(&self) -> Result<Vec<String>> {
        Ok(self.non_empty_users().await)
    }

    async fn size(&self, user: &str) -> Result<usize> {
        let guard = self.queues.lock().await;
        Ok(guard.get(user).map(VecDeque::len).unwrap_or(0))
    }
}
