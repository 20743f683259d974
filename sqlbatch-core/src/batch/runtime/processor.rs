use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::batch::job::JobId;
use crate::batch::logger::JobLogger;
use crate::batch::queue::JobQueue;
use crate::batch::runner::JobRunner;
use crate::batch::scheduler::{QueueState, TaskRunner};
use crate::batch::service::JobService;
use crate::error::{BatchError, Result};

/// Jobs this process is executing right now, one per user.
#[derive(Default)]
pub struct WorkInProgress {
    jobs: Mutex<HashMap<String, JobId>>,
    cleared: Notify,
}

impl fmt::Debug for WorkInProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.jobs.try_lock().map(|jobs| jobs.len()).unwrap_or_default();
        f.debug_struct("WorkInProgress")
            .field("users", &count)
            .finish()
    }
}

impl WorkInProgress {
    pub async fn set(&self, user: &str, job_id: JobId) {
        self.jobs.lock().await.insert(user.to_string(), job_id);
    }

    pub async fn get(&self, user: &str) -> Option<JobId> {
        self.jobs.lock().await.get(user).copied()
    }

    /// Only removes the entry if it still refers to `job_id`.
    pub async fn clear(&self, user: &str, job_id: &JobId) {
        let mut jobs = self.jobs.lock().await;
        if jobs.get(user) == Some(job_id) {
            jobs.remove(user);
            self.cleared.notify_waiters();
        }
    }

    /// Resolves once `user` no longer has `job_id` in progress.
    pub async fn wait_cleared(&self, user: &str, job_id: &JobId) {
        loop {
            let cleared = self.cleared.notified();
            tokio::pin!(cleared);
            cleared.as_mut().enable();
            if self.get(user).await != Some(*job_id) {
                return;
            }
            cleared.await;
        }
    }

    pub async fn entries(&self) -> Vec<(String, JobId)> {
        let jobs = self.jobs.lock().await;
        let mut entries: Vec<(String, JobId)> =
            jobs.iter().map(|(user, id)| (user.clone(), *id)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

/// Slot body handed to the host scheduler: takes the user's next job, runs
/// it and keeps the work-in-progress bookkeeping straight.
pub struct JobProcessor {
    queue: Arc<dyn JobQueue>,
    runner: JobRunner,
    jobs: JobService,
    logger: Arc<dyn JobLogger>,
    wip: Arc<WorkInProgress>,
    draining: CancellationToken,
}

impl fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobProcessor")
            .field("runner", &self.runner)
            .field("wip", &self.wip)
            .field("draining", &self.draining.is_cancelled())
            .finish()
    }
}

impl JobProcessor {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        runner: JobRunner,
        jobs: JobService,
        logger: Arc<dyn JobLogger>,
        wip: Arc<WorkInProgress>,
        draining: CancellationToken,
    ) -> Self {
        Self {
            queue,
            runner,
            jobs,
            logger,
            wip,
            draining,
        }
    }

    async fn set_work_in_progress(&self, user: &str, job_id: &JobId) {
        self.wip.set(user, *job_id).await;
        if let Err(err) = self.jobs.add_work_in_progress_job(user, job_id).await {
            warn!(target: "batch::runner", user = %user, job_id = %job_id, error = %err, "could not record work in progress");
        }
    }

    /// The runner stopped a claimed job for a drain. On a failed requeue the
    /// work-in-progress records stay so drain and recovery still see it.
    async fn requeue_handed_back(&self, user: &str, job_id: &JobId) -> Result<QueueState> {
        self.queue.enqueue_first(user, job_id).await?;
        self.clear_work_in_progress(user, job_id).await;
        debug!(target: "batch::drain", user = %user, job_id = %job_id, "draining; claimed job put back");
        Ok(QueueState::Empty)
    }

    async fn clear_work_in_progress(&self, user: &str, job_id: &JobId) {
        self.wip.clear(user, job_id).await;
        if let Err(err) = self.jobs.clear_work_in_progress_job(user, job_id).await {
            warn!(target: "batch::runner", user = %user, job_id = %job_id, error = %err, "could not clear work in progress");
        }
    }
}

#[async_trait]
impl TaskRunner for JobProcessor {
    async fn run(&self, user: &str) -> Result<QueueState> {
        let job_id = match self.queue.dequeue(user).await {
            Ok(Some(job_id)) => job_id,
            Ok(None) => {
                debug!(target: "batch::queue", user = %user, "queue empty");
                return Ok(QueueState::Empty);
            }
            Err(err) => {
                return Err(BatchError::Queue(format!(
                    "Could not get job from \"{user}\". Reason: {err}"
                )));
            }
        };

        if self.draining.is_cancelled() {
            self.queue.enqueue_first(user, &job_id).await?;
            debug!(target: "batch::drain", user = %user, job_id = %job_id, "draining; job put back");
            return Ok(QueueState::Empty);
        }

        self.set_work_in_progress(user, &job_id).await;
        let result = self.runner.run(&job_id).await;
        if matches!(&result, Err(err) if err.is_handed_back()) {
            return self.requeue_handed_back(user, &job_id).await;
        }
        self.clear_work_in_progress(user, &job_id).await;

        match result {
            Ok(job) if job.status.is_terminal() => {
                debug!(
                    target: "batch::runner",
                    job_id = %job.job_id,
                    user = %user,
                    status = %job.status,
                    failed_reason = job.failed_reason.as_deref().unwrap_or_default(),
                    "job completed"
                );
                self.logger.log(&job);
                Ok(QueueState::NotEmpty)
            }
            Ok(job) => {
                debug!(target: "batch::runner", job_id = %job.job_id, user = %user, status = %job.status, "job handed back");
                Ok(QueueState::NotEmpty)
            }
            Err(err) if err.is_not_runnable() => {
                debug!(target: "batch::runner", job_id = %job_id, user = %user, error = %err, "skipping job");
                Ok(QueueState::NotEmpty)
            }
            Err(BatchError::JobNotFound(missing)) => {
                warn!(target: "batch::runner", job_id = %missing, user = %user, "queued job has no record; skipping");
                Ok(QueueState::NotEmpty)
            }
            Err(err) => Err(err),
        }
    }
}
