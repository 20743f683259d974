use thiserror::Error;

use crate::batch::job::{JobId, JobStatus};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Notifier error: {0}")]
    Notifier(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Cannot run job {job_id} due to its status is {status}")]
    JobNotRunnable { job_id: JobId, status: JobStatus },

    #[error("Job {job_id} was handed back before its query started")]
    HandedBack { job_id: JobId },

    #[error("Cannot set status from {from} to {to} for job {job_id}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Cannot cancel job {job_id} with status {status}")]
    CancelNotAllowed { job_id: JobId, status: JobStatus },

    #[error("Maximum number of queued jobs ({limit}) reached for user {user}")]
    QueueFull { user: String, limit: usize },

    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("canceling statement due to user request")]
    QueryCanceled,

    #[error("{0}")]
    Execution(String),

    #[error("User metadata error: {0}")]
    Metadata(String),

    #[error("Capacity probe error: {0}")]
    Capacity(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BatchError {
    pub fn is_query_canceled(&self) -> bool {
        matches!(self, BatchError::QueryCanceled)
    }

    pub fn is_cancel_not_allowed(&self) -> bool {
        matches!(self, BatchError::CancelNotAllowed { .. })
    }

    pub fn is_not_runnable(&self) -> bool {
        matches!(self, BatchError::JobNotRunnable { .. })
    }

    pub fn is_handed_back(&self) -> bool {
        matches!(self, BatchError::HandedBack { .. })
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;
