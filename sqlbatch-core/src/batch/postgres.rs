use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Executor, Row};
use tracing::{debug, warn};

use crate::error::{BatchError, Result};

use super::job::Job;
use super::metadata::{UserDatabaseMetadata, UserDatabaseMetadataService};
use super::runner::{QueryCanceller, QueryExecutor, QuerySession};

/// SQLSTATE raised when a statement is interrupted by `pg_cancel_backend`.
pub const QUERY_CANCELED: &str = "57014";

const APPLICATION_NAME: &str = "sqlbatch";

fn connect_options(metadata: &UserDatabaseMetadata) -> PgConnectOptions {
    let options = PgConnectOptions::new()
        .host(&metadata.host)
        .port(metadata.port)
        .database(&metadata.dbname)
        .username(&metadata.user)
        .application_name(APPLICATION_NAME);
    if metadata.password.is_empty() {
        options
    } else {
        options.password(&metadata.password)
    }
}

/// Maps a driver error onto the batch taxonomy. Only SQLSTATE 57014 counts
/// as a cancellation; everything the server reports keeps its message.
pub fn classify(err: sqlx::Error) -> BatchError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(QUERY_CANCELED) => {
            BatchError::QueryCanceled
        }
        sqlx::Error::Database(db) => BatchError::Execution(db.message().to_string()),
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => {
            BatchError::Connection(err.to_string())
        }
        _ => BatchError::Database(err),
    }
}

/// Opens one dedicated connection per job; no pooling.
#[derive(Clone, Copy, Debug, Default)]
pub struct PgQueryExecutor;

impl PgQueryExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QueryExecutor for PgQueryExecutor {
    async fn connect(&self, metadata: &UserDatabaseMetadata) -> Result<Box<dyn QuerySession>> {
        let conn = PgConnection::connect_with(&connect_options(metadata))
            .await
            .map_err(|e| BatchError::Connection(e.to_string()))?;
        debug!(target: "batch::runner", host = %metadata.host, dbname = %metadata.dbname, "database connection opened");
        Ok(Box::new(PgQuerySession { conn }))
    }
}

pub struct PgQuerySession {
    conn: PgConnection,
}

impl fmt::Debug for PgQuerySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgQuerySession").finish_non_exhaustive()
    }
}

impl PgQuerySession {
    /// Goes through `Executor::execute`, whose boxed future keeps the
    /// connection borrow out of the `async_trait` future.
    async fn run(&mut self, sql: &str) -> Result<()> {
        let conn: &mut PgConnection = &mut self.conn;
        conn.execute(sqlx::raw_sql(sql))
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

#[async_trait]
impl QuerySession for PgQuerySession {
    async fn disable_statement_timeout(&mut self) -> Result<()> {
        self.run("SET statement_timeout=0").await
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.run(sql).await
    }

    async fn close(self: Box<Self>) {
        if let Err(err) = self.conn.close().await {
            debug!(target: "batch::runner", error = %err, "database connection closed uncleanly");
        }
    }
}

/// Cancels a job's statement by searching `pg_stat_activity` for its id tag.
#[derive(Clone)]
pub struct PgQueryCanceller {
    metadata: Arc<dyn UserDatabaseMetadataService>,
}

impl fmt::Debug for PgQueryCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgQueryCanceller").finish_non_exhaustive()
    }
}

impl PgQueryCanceller {
    pub fn new(metadata: Arc<dyn UserDatabaseMetadataService>) -> Self {
        Self { metadata }
    }

    /// `LIKE` pattern matching the tag appended to the job's SQL.
    pub fn pattern(job: &Job) -> String {
        format!("%{}%", job.job_id.sql_tag())
    }
}

#[async_trait]
impl QueryCanceller for PgQueryCanceller {
    async fn cancel(&self, job: &Job) -> Result<()> {
        let metadata = self.metadata.get_user_metadata(&job.user).await?;
        let mut conn = PgConnection::connect_with(&connect_options(&metadata))
            .await
            .map_err(|e| BatchError::Connection(e.to_string()))?;

        let query = sqlx::query(
            "SELECT pg_cancel_backend(pid) FROM pg_stat_activity \
             WHERE query LIKE $1 AND pid <> pg_backend_pid()",
        )
        .bind(Self::pattern(job));
        let result = (&mut conn)
            .fetch_all(query)
            .await
            .and_then(|rows| {
                rows.iter()
                    .map(|row| row.try_get::<bool, _>(0))
                    .collect::<std::result::Result<Vec<bool>, _>>()
            })
            .map_err(classify);

        if let Err(err) = conn.close().await {
            debug!(target: "batch::runner", error = %err, "cancel connection closed uncleanly");
        }

        let cancelled = result?;
        match cancelled.iter().filter(|ok| **ok).count() {
            0 => {
                warn!(target: "batch::runner", job_id = %job.job_id, "no running statement found to cancel");
            }
            n => {
                debug!(target: "batch::runner", job_id = %job.job_id, backends = n, "cancel signal sent");
            }
        }
        Ok(())
    }
}
