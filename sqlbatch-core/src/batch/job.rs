use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::error::{BatchError, Result};

/// Unique identifier for batch jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Comment appended to the submitted SQL so the running statement can be
    /// found (and cancelled) in `pg_stat_activity`.
    pub fn sql_tag(&self) -> String {
        format!("/* {} */", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(JobId)
            .map_err(|e| BatchError::Internal(format!("invalid job id '{s}': {e}")))
    }
}

/// Lifecycle states. `pending -> running -> {done, failed, cancelled}`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// `running -> pending` is only taken by drain, which hands the job back
    /// to the queue after cancelling its statement.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(BatchError::Internal(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Persisted job record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub user: String,
    pub host: String,
    pub query: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        user: impl Into<String>,
        host: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            user: user.into(),
            host: host.into(),
            query: query.into(),
            status: JobStatus::Pending,
            failed_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        }
    }

    /// SQL text as submitted to the database, tagged with the job id.
    pub fn tagged_query(&self) -> String {
        format!("{} {}", self.query, self.job_id.sql_tag())
    }

    pub fn elapsed(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn apply(&mut self, status: JobStatus, patch: &JobPatch) {
        self.status = status;
        self.updated_at = patch.updated_at;
        if let Some(reason) = &patch.failed_reason {
            self.failed_reason = Some(reason.clone());
        }
        if let Some(started) = patch.started_at {
            self.started_at = Some(started);
        }
        if let Some(ended) = patch.ended_at {
            self.ended_at = Some(ended);
        }
    }
}

/// Field updates carried alongside a status transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn now() -> Self {
        Self {
            updated_at: Utc::now(),
            failed_reason: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn started(mut self) -> Self {
        self.started_at = Some(self.updated_at);
        self
    }

    pub fn ended(mut self) -> Self {
        self.ended_at = Some(self.updated_at);
        self
    }

    pub fn with_failed_reason(mut self, reason: impl Into<String>) -> Self {
        self.failed_reason = Some(reason.into());
        self
    }
}
