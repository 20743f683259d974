use std::fmt;

use super::job::{Job, JobStatus};

/// Receives every job that reached a terminal state.
pub trait JobLogger: Send + Sync {
    fn log(&self, job: &Job);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingJobLogger;

impl JobLogger for TracingJobLogger {
    fn log(&self, job: &Job) {
        let elapsed_ms = job.elapsed().map(|d| d.num_milliseconds());
        match job.status {
            JobStatus::Failed => tracing::info!(
                target: "batch::jobs",
                job_id = %job.job_id,
                user = %job.user,
                host = %job.host,
                status = %job.status,
                elapsed_ms,
                failed_reason = job.failed_reason.as_deref().unwrap_or_default(),
                "job finished"
            ),
            _ => tracing::info!(
                target: "batch::jobs",
                job_id = %job.job_id,
                user = %job.user,
                host = %job.host,
                status = %job.status,
                elapsed_ms,
                "job finished"
            ),
        }
    }
}

/// Keeps logged jobs in memory.
#[derive(Default)]
pub struct MemoryJobLogger {
    jobs: std::sync::Mutex<Vec<Job>>,
}

impl fmt::Debug for MemoryJobLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.jobs.try_lock().map(|jobs| jobs.len()).unwrap_or_default();
        f.debug_struct("MemoryJobLogger")
            .field("logged", &count)
            .finish()
    }
}

impl MemoryJobLogger {
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs
            .lock()
            .map(|jobs| jobs.clone())
            .unwrap_or_default()
    }
}

impl JobLogger for MemoryJobLogger {
    fn log(&self, job: &Job) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push(job.clone());
        }
    }
}
