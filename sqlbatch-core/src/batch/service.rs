use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{BatchError, Result};

use super::events::{JobPublisher, JobReady};
use super::job::{Job, JobId, JobPatch, JobStatus};
use super::metadata::UserDatabaseMetadataService;
use super::queue::JobQueue;
use super::runner::QueryCanceller;
use super::store::JobStore;

/// State-transition authority for jobs.
///
/// Every `set_*` call takes the job as the caller last saw it and only
/// succeeds if the stored status still matches, so a concurrent drain or
/// cancel is never overwritten.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    canceller: Arc<dyn QueryCanceller>,
}

impl fmt::Debug for JobService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobService").finish_non_exhaustive()
    }
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, canceller: Arc<dyn QueryCanceller>) -> Self {
        Self { store, canceller }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub async fn create(
        &self,
        user: impl Into<String>,
        host: impl Into<String>,
        query: impl Into<String>,
    ) -> Result<Job> {
        let job = Job::new(user, host, query);
        self.store.insert(&job).await?;
        debug!(target: "batch::jobs", job_id = %job.job_id, user = %job.user, "job created");
        Ok(job)
    }

    pub async fn get(&self, job_id: &JobId) -> Result<Job> {
        self.store.get(job_id).await
    }

    pub async fn set_running(&self, job: &Job) -> Result<Job> {
        self.store
            .transition(
                &job.job_id,
                job.status,
                JobStatus::Running,
                &JobPatch::now().started(),
            )
            .await
    }

    pub async fn set_done(&self, job: &Job) -> Result<Job> {
        self.store
            .transition(&job.job_id, job.status, JobStatus::Done, &JobPatch::now().ended())
            .await
    }

    pub async fn set_failed(&self, job: &Job, reason: impl Into<String>) -> Result<Job> {
        self.store
            .transition(
                &job.job_id,
                job.status,
                JobStatus::Failed,
                &JobPatch::now().ended().with_failed_reason(reason),
            )
            .await
    }

    pub async fn set_cancelled(&self, job: &Job) -> Result<Job> {
        self.store
            .transition(
                &job.job_id,
                job.status,
                JobStatus::Cancelled,
                &JobPatch::now().ended(),
            )
            .await
    }

    /// User or operator cancellation. A pending job is cancelled in place; a
    /// running one gets its statement cancelled and the runner records the
    /// outcome.
    pub async fn cancel(&self, job_id: &JobId) -> Result<Job> {
        let job = self.store.get(job_id).await?;
        match job.status {
            JobStatus::Pending => match self.set_cancelled(&job).await {
                Err(BatchError::InvalidTransition { from, .. }) if from == JobStatus::Running => {
                    let job = self.store.get(job_id).await?;
                    self.canceller.cancel(&job).await?;
                    Ok(job)
                }
                Err(BatchError::InvalidTransition { from, .. }) => {
                    Err(BatchError::CancelNotAllowed {
                        job_id: *job_id,
                        status: from,
                    })
                }
                other => other,
            },
            JobStatus::Running => {
                self.canceller.cancel(&job).await?;
                info!(target: "batch::jobs", job_id = %job_id, user = %job.user, "cancel requested");
                Ok(job)
            }
            status => Err(BatchError::CancelNotAllowed {
                job_id: *job_id,
                status,
            }),
        }
    }

    /// Hands an in-flight job back to the queue.
    ///
    /// A running job returns to `pending` and its statement is cancelled;
    /// the caller requeues it. If the cancel request fails the record goes
    /// back to `running` and the error is returned. A job that is still
    /// `pending` has been claimed by a runner that has not started it yet;
    /// that runner hands it back itself.
    pub async fn drain(&self, job_id: &JobId) -> Result<DrainedJob> {
        let job = self.store.get(job_id).await?;
        match job.status {
            JobStatus::Pending => return Ok(DrainedJob::NotStarted(job)),
            JobStatus::Running => {}
            status => {
                return Err(BatchError::CancelNotAllowed {
                    job_id: *job_id,
                    status,
                });
            }
        }

        let pending = match self
            .store
            .transition(job_id, JobStatus::Running, JobStatus::Pending, &JobPatch::now())
            .await
        {
            Ok(job) => job,
            Err(BatchError::InvalidTransition { from, .. }) if from == JobStatus::Pending => {
                return Ok(DrainedJob::NotStarted(self.store.get(job_id).await?));
            }
            Err(BatchError::InvalidTransition { from, .. }) => {
                return Err(BatchError::CancelNotAllowed {
                    job_id: *job_id,
                    status: from,
                });
            }
            Err(err) => return Err(err),
        };

        if let Err(err) = self.canceller.cancel(&pending).await {
            warn!(
                target: "batch::drain",
                job_id = %job_id,
                error = %err,
                "cancel failed during drain; restoring running status"
            );
            if let Err(revert) = self
                .store
                .transition(job_id, JobStatus::Pending, JobStatus::Running, &JobPatch::now())
                .await
            {
                warn!(target: "batch::drain", job_id = %job_id, error = %revert, "could not restore running status");
            }
            return Err(err);
        }

        Ok(DrainedJob::HandedBack(pending))
    }

    /// Runner side of a drain: moves a job it just marked running back to
    /// `pending` before any SQL was sent. Whoever wins this transition owns
    /// the requeue.
    pub async fn hand_back(&self, job: &Job) -> Result<Job> {
        self.store
            .transition(&job.job_id, job.status, JobStatus::Pending, &JobPatch::now())
            .await
    }

    pub async fn add_work_in_progress_job(&self, user: &str, job_id: &JobId) -> Result<()> {
        self.store.add_work_in_progress(user, job_id).await
    }

    pub async fn clear_work_in_progress_job(&self, user: &str, job_id: &JobId) -> Result<()> {
        self.store.clear_work_in_progress(user, job_id).await
    }

    pub async fn list_work_in_progress_jobs(&self) -> Result<Vec<(String, JobId)>> {
        self.store.list_work_in_progress().await
    }

    /// Operator recovery after a crash: every job still recorded as in
    /// progress and not yet finished goes back to `pending` at the head of
    /// its user's queue. Run it only while no worker is alive.
    pub async fn recover_orphaned_jobs(&self, queue: &dyn JobQueue) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for (user, job_id) in self.store.list_work_in_progress().await? {
            match self.store.get(&job_id).await {
                Ok(job) if job.status == JobStatus::Running => {
                    self.store
                        .transition(&job_id, JobStatus::Running, JobStatus::Pending, &JobPatch::now())
                        .await?;
                    queue.enqueue_first(&user, &job_id).await?;
                    info!(target: "batch::drain", user = %user, job_id = %job_id, "orphaned job requeued");
                    report.requeued.push(job_id);
                }
                // Claimed but never started. A duplicate queue entry is
                // skipped as not runnable, a missing one would strand it.
                Ok(job) if job.status == JobStatus::Pending => {
                    queue.enqueue_first(&user, &job_id).await?;
                    info!(target: "batch::drain", user = %user, job_id = %job_id, "unstarted job requeued");
                    report.requeued.push(job_id);
                }
                Ok(_) | Err(BatchError::JobNotFound(_)) => {
                    report.cleared.push(job_id);
                }
                Err(err) => return Err(err),
            }
            self.store.clear_work_in_progress(&user, &job_id).await?;
        }

        Ok(report)
    }
}

/// Result of [`JobService::drain`].
#[derive(Clone, Debug, PartialEq)]
pub enum DrainedJob {
    /// Moved back to `pending` by the drain; the caller requeues it.
    HandedBack(Job),
    /// Still `pending`; the runner that claimed it hands it back.
    NotStarted(Job),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: Vec<JobId>,
    /// Stale records for jobs that were no longer running.
    pub cleared: Vec<JobId>,
}

/// Intake path: persists a job, queues it and announces the user.
#[derive(Clone)]
pub struct JobSubmitter {
    jobs: JobService,
    queue: Arc<dyn JobQueue>,
    publisher: Arc<dyn JobPublisher>,
    metadata: Arc<dyn UserDatabaseMetadataService>,
    max_queued_jobs: usize,
}

impl fmt::Debug for JobSubmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSubmitter")
            .field("max_queued_jobs", &self.max_queued_jobs)
            .finish_non_exhaustive()
    }
}

impl JobSubmitter {
    pub fn new(
        jobs: JobService,
        queue: Arc<dyn JobQueue>,
        publisher: Arc<dyn JobPublisher>,
        metadata: Arc<dyn UserDatabaseMetadataService>,
        max_queued_jobs: usize,
    ) -> Self {
        Self {
            jobs,
            queue,
            publisher,
            metadata,
            max_queued_jobs,
        }
    }

    /// Without an explicit `host` the user's metadata decides where the job
    /// runs.
    pub async fn submit(&self, user: &str, query: &str, host: Option<&str>) -> Result<Job> {
        let queued = self.queue.size(user).await?;
        if queued >= self.max_queued_jobs {
            return Err(BatchError::QueueFull {
                user: user.to_string(),
                limit: self.max_queued_jobs,
            });
        }

        let host = match host {
            Some(host) => host.to_string(),
            None => self.metadata.get_user_metadata(user).await?.host,
        };

        let job = self.jobs.create(user, host.as_str(), query).await?;
        self.queue.enqueue(user, &job.job_id).await?;

        if let Err(err) = self.publisher.publish(JobReady::on_host(user, host.as_str())).await {
            // Reconciliation still finds the queue.
            warn!(target: "batch::notifier", user = %user, error = %err, "could not announce job");
        }

        info!(target: "batch::jobs", job_id = %job.job_id, user = %user, host = %host, "job submitted");
        Ok(job)
    }
}
