use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{BatchError, Result};

use super::job::{Job, JobId, JobPatch, JobStatus};

/// Durable home of job records and the work-in-progress mirror.
///
/// `transition` is a compare-and-set: it succeeds only while the stored
/// status still equals `from`, otherwise it reports
/// [`BatchError::InvalidTransition`] carrying the status actually found.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<()>;

    async fn get(&self, job_id: &JobId) -> Result<Job>;

    async fn transition(
        &self,
        job_id: &JobId,
        from: JobStatus,
        to: JobStatus,
        patch: &JobPatch,
    ) -> Result<Job>;

    async fn add_work_in_progress(&self, user: &str, job_id: &JobId) -> Result<()>;

    async fn clear_work_in_progress(&self, user: &str, job_id: &JobId) -> Result<()>;

    /// Every `(user, job_id)` pair currently recorded as in progress.
    async fn list_work_in_progress(&self) -> Result<Vec<(String, JobId)>>;
}

#[derive(Default)]
struct StoreState {
    jobs: HashMap<JobId, Job>,
    wip: HashMap<String, Vec<JobId>>,
}

#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<StoreState>,
}

impl fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryJobStore");
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("job_count", &state.jobs.len())
                    .field("wip_users", &state.wip.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().await;
        state.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> Result<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(job_id)
            .cloned()
            .ok_or(BatchError::JobNotFound(*job_id))
    }

    async fn transition(
        &self,
        job_id: &JobId,
        from: JobStatus,
        to: JobStatus,
        patch: &JobPatch,
    ) -> Result<Job> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or(BatchError::JobNotFound(*job_id))?;

        if job.status != from || !from.can_transition_to(to) {
            return Err(BatchError::InvalidTransition {
                job_id: *job_id,
                from: job.status,
                to,
            });
        }

        job.apply(to, patch);
        Ok(job.clone())
    }

    async fn add_work_in_progress(&self, user: &str, job_id: &JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        let ids = state.wip.entry(user.to_string()).or_default();
        if !ids.contains(job_id) {
            ids.push(*job_id);
        }
        Ok(())
    }

    async fn clear_work_in_progress(&self, user: &str, job_id: &JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(ids) = state.wip.get_mut(user) {
            ids.retain(|id| id != job_id);
            if ids.is_empty() {
                state.wip.remove(user);
            }
        }
        Ok(())
    }

    async fn list_work_in_progress(&self) -> Result<Vec<(String, JobId)>> {
        let state = self.state.lock().await;
        let mut entries: Vec<(String, JobId)> = state
            .wip
            .iter()
            .flat_map(|(user, ids)| ids.iter().map(move |id| (user.clone(), *id)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
