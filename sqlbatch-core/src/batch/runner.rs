use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BatchError, Result};

use super::job::{Job, JobId, JobStatus};
use super::metadata::{UserDatabaseMetadata, UserDatabaseMetadataService};
use super::service::JobService;

/// One dedicated database connection, owned by a single job execution.
#[async_trait]
pub trait QuerySession: Send {
    async fn disable_statement_timeout(&mut self) -> Result<()>;

    /// Runs `sql` to completion. A statement cancelled at the database must
    /// surface as [`BatchError::QueryCanceled`].
    async fn execute(&mut self, sql: &str) -> Result<()>;

    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn connect(&self, metadata: &UserDatabaseMetadata) -> Result<Box<dyn QuerySession>>;
}

/// Cancels the statement a job is running, located by its id tag.
#[async_trait]
pub trait QueryCanceller: Send + Sync {
    async fn cancel(&self, job: &Job) -> Result<()>;
}

/// Executes a single pending job to a terminal state.
pub struct JobRunner {
    jobs: JobService,
    metadata: Arc<dyn UserDatabaseMetadataService>,
    executor: Arc<dyn QueryExecutor>,
    canceller: Arc<dyn QueryCanceller>,
    query_timeout: Option<Duration>,
    draining: CancellationToken,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("query_timeout", &self.query_timeout)
            .field("draining", &self.draining.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    pub fn new(
        jobs: JobService,
        metadata: Arc<dyn UserDatabaseMetadataService>,
        executor: Arc<dyn QueryExecutor>,
        canceller: Arc<dyn QueryCanceller>,
    ) -> Self {
        Self {
            jobs,
            metadata,
            executor,
            canceller,
            query_timeout: None,
            draining: CancellationToken::new(),
        }
    }

    pub fn with_query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Once `token` is cancelled, jobs are handed back instead of started.
    pub fn with_draining(mut self, token: CancellationToken) -> Self {
        self.draining = token;
        self
    }

    /// Fails with [`BatchError::JobNotRunnable`] before touching the
    /// database when the job is not pending. While draining, a job that has
    /// not sent its query yet is left `pending` and reported as
    /// [`BatchError::HandedBack`]; the caller requeues it. Otherwise exactly
    /// one terminal transition is attempted and the resulting record is
    /// returned.
    pub async fn run(&self, job_id: &JobId) -> Result<Job> {
        let job = self.jobs.get(job_id).await?;
        if job.status != JobStatus::Pending {
            return Err(BatchError::JobNotRunnable {
                job_id: *job_id,
                status: job.status,
            });
        }
        if self.draining.is_cancelled() {
            return Err(BatchError::HandedBack { job_id: *job_id });
        }

        let metadata = match self.metadata.get_user_metadata(&job.user).await {
            Ok(metadata) => metadata,
            Err(err) => return self.settle(self.jobs.set_failed(&job, err.to_string()).await).await,
        };

        let mut session = match self.executor.connect(&metadata).await {
            Ok(session) => session,
            Err(err) => {
                warn!(target: "batch::runner", job_id = %job_id, host = %metadata.host, error = %err, "connection failed");
                return self.settle(self.jobs.set_failed(&job, err.to_string()).await).await;
            }
        };

        let result = self.execute(&job, session.as_mut()).await;
        session.close().await;
        result
    }

    async fn execute(&self, job: &Job, session: &mut dyn QuerySession) -> Result<Job> {
        let running = match self.jobs.set_running(job).await {
            Ok(running) => running,
            Err(BatchError::InvalidTransition { from, .. }) => {
                return Err(BatchError::JobNotRunnable {
                    job_id: job.job_id,
                    status: from,
                });
            }
            Err(err) => return Err(err),
        };
        // A drain that started while we were connecting saw this job as
        // pending and left it to us.
        if self.draining.is_cancelled() {
            return match self.jobs.hand_back(&running).await {
                Ok(_) => Err(BatchError::HandedBack {
                    job_id: running.job_id,
                }),
                Err(BatchError::InvalidTransition { .. }) => self.jobs.get(&running.job_id).await,
                Err(err) => Err(err),
            };
        }
        debug!(target: "batch::runner", job_id = %running.job_id, user = %running.user, "job running");

        if let Err(err) = session.disable_statement_timeout().await {
            return self.settle(self.jobs.set_failed(&running, err.to_string()).await).await;
        }

        let sql = running.tagged_query();
        let execution = session.execute(&sql);
        tokio::pin!(execution);

        let result = match self.query_timeout {
            Some(limit) => {
                let finished = tokio::select! {
                    result = &mut execution => Some(result),
                    _ = tokio::time::sleep(limit) => None,
                };
                match finished {
                    Some(result) => result,
                    None => {
                        info!(
                            target: "batch::runner",
                            job_id = %running.job_id,
                            timeout_ms = limit.as_millis() as u64,
                            "query timeout reached; cancelling"
                        );
                        if let Err(err) = self.canceller.cancel(&running).await {
                            warn!(target: "batch::runner", job_id = %running.job_id, error = %err, "timeout cancel failed");
                        }
                        execution.await
                    }
                }
            }
            None => execution.await,
        };

        let transition = match result {
            Ok(()) => self.jobs.set_done(&running).await,
            Err(err) if err.is_query_canceled() => self.jobs.set_cancelled(&running).await,
            Err(err) => self.jobs.set_failed(&running, err.to_string()).await,
        };
        self.settle(transition).await
    }

    /// A rejected terminal transition means someone else (drain, recovery)
    /// already moved the job; report what the store holds now.
    async fn settle(&self, transition: Result<Job>) -> Result<Job> {
        match transition {
            Err(BatchError::InvalidTransition { job_id, from, to }) => {
                debug!(
                    target: "batch::runner",
                    job_id = %job_id,
                    found = %from,
                    wanted = %to,
                    "job moved concurrently"
                );
                self.jobs.get(&job_id).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::metadata::MockUserDatabaseMetadataService;
    use crate::batch::service::DrainedJob;
    use crate::batch::store::{InMemoryJobStore, JobStore};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Clone, Copy)]
    enum Script {
        Succeed,
        Fail,
        Canceled,
        RefuseConnection,
        WaitForCancel,
    }

    struct ScriptedExecutor {
        script: Script,
        connects: AtomicUsize,
        closed: Arc<AtomicUsize>,
        statements: Arc<Mutex<Vec<String>>>,
        cancelled: Arc<Notify>,
        drain_on_connect: Option<CancellationToken>,
    }

    impl ScriptedExecutor {
        fn new(script: Script) -> Self {
            Self {
                script,
                connects: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
                statements: Arc::new(Mutex::new(Vec::new())),
                cancelled: Arc::new(Notify::new()),
                drain_on_connect: None,
            }
        }
    }

    struct ScriptedSession {
        script: Script,
        closed: Arc<AtomicUsize>,
        statements: Arc<Mutex<Vec<String>>>,
        cancelled: Arc<Notify>,
    }

    #[async_trait]
    impl QuerySession for ScriptedSession {
        async fn disable_statement_timeout(&mut self) -> Result<()> {
            self.statements
                .lock()
                .unwrap()
                .push("SET statement_timeout=0".to_string());
            Ok(())
        }

        async fn execute(&mut self, sql: &str) -> Result<()> {
            self.statements.lock().unwrap().push(sql.to_string());
            match self.script {
                Script::Succeed => Ok(()),
                Script::Fail => Err(BatchError::Execution(
                    "relation \"missing\" does not exist".to_string(),
                )),
                Script::Canceled => Err(BatchError::QueryCanceled),
                Script::WaitForCancel => {
                    self.cancelled.notified().await;
                    Err(BatchError::QueryCanceled)
                }
                Script::RefuseConnection => unreachable!(),
            }
        }

        async fn close(self: Box<Self>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl QueryExecutor for ScriptedExecutor {
        async fn connect(&self, _metadata: &UserDatabaseMetadata) -> Result<Box<dyn QuerySession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = &self.drain_on_connect {
                token.cancel();
            }
            if let Script::RefuseConnection = self.script {
                return Err(BatchError::Connection("connection refused".to_string()));
            }
            Ok(Box::new(ScriptedSession {
                script: self.script,
                closed: Arc::clone(&self.closed),
                statements: Arc::clone(&self.statements),
                cancelled: Arc::clone(&self.cancelled),
            }))
        }
    }

    struct NotifyCanceller {
        target: Arc<Notify>,
        called: AtomicBool,
    }

    #[async_trait]
    impl QueryCanceller for NotifyCanceller {
        async fn cancel(&self, _job: &Job) -> Result<()> {
            self.called.store(true, Ordering::SeqCst);
            self.target.notify_one();
            Ok(())
        }
    }

    fn metadata() -> MockUserDatabaseMetadataService {
        let mut mock = MockUserDatabaseMetadataService::new();
        mock.expect_get_user_metadata().returning(|_| {
            Ok(UserDatabaseMetadata {
                host: "h1".to_string(),
                port: 5432,
                dbname: "alice_db".to_string(),
                user: "alice".to_string(),
                password: String::new(),
            })
        });
        mock
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        executor: Arc<ScriptedExecutor>,
        canceller: Arc<NotifyCanceller>,
        runner: JobRunner,
    }

    fn harness(script: Script, timeout: Option<Duration>) -> Harness {
        let store = Arc::new(InMemoryJobStore::new());
        let executor = Arc::new(ScriptedExecutor::new(script));
        let canceller = Arc::new(NotifyCanceller {
            target: Arc::clone(&executor.cancelled),
            called: AtomicBool::new(false),
        });
        let jobs = JobService::new(store.clone(), canceller.clone());
        let runner = JobRunner::new(jobs, Arc::new(metadata()), executor.clone(), canceller.clone())
            .with_query_timeout(timeout);
        Harness {
            store,
            executor,
            canceller,
            runner,
        }
    }

    fn draining_harness(drain_on_connect: bool) -> (Harness, CancellationToken) {
        let token = CancellationToken::new();
        let store = Arc::new(InMemoryJobStore::new());
        let mut executor = ScriptedExecutor::new(Script::Succeed);
        if drain_on_connect {
            executor.drain_on_connect = Some(token.clone());
        } else {
            token.cancel();
        }
        let executor = Arc::new(executor);
        let canceller = Arc::new(NotifyCanceller {
            target: Arc::clone(&executor.cancelled),
            called: AtomicBool::new(false),
        });
        let jobs = JobService::new(store.clone(), canceller.clone());
        let runner = JobRunner::new(jobs, Arc::new(metadata()), executor.clone(), canceller.clone())
            .with_draining(token.clone());
        (
            Harness {
                store,
                executor,
                canceller,
                runner,
            },
            token,
        )
    }

    async fn pending_job(store: &InMemoryJobStore) -> Job {
        let job = Job::new("alice", "h1", "SELECT 1");
        store.insert(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn successful_query_ends_done_with_tagged_sql() {
        let h = harness(Script::Succeed, None);
        let job = pending_job(&h.store).await;

        let finished = h.runner.run(&job.job_id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Done);
        assert!(finished.started_at.is_some() && finished.ended_at.is_some());

        let statements = h.executor.statements.lock().unwrap().clone();
        assert_eq!(statements[0], "SET statement_timeout=0");
        assert_eq!(statements[1], job.tagged_query());
        assert_eq!(h.executor.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn execution_error_is_recorded_verbatim() {
        let h = harness(Script::Fail, None);
        let job = pending_job(&h.store).await;

        let finished = h.runner.run(&job.job_id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(
            finished.failed_reason.as_deref(),
            Some("relation \"missing\" does not exist")
        );
        assert_eq!(h.executor.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn canceled_query_ends_cancelled_not_failed() {
        let h = harness(Script::Canceled, None);
        let job = pending_job(&h.store).await;

        let finished = h.runner.run(&job.job_id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Cancelled);
        assert!(finished.failed_reason.is_none());
    }

    #[tokio::test]
    async fn connection_failure_fails_job_without_running() {
        let h = harness(Script::RefuseConnection, None);
        let job = pending_job(&h.store).await;

        let finished = h.runner.run(&job.job_id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert!(finished.started_at.is_none());
        assert!(finished.failed_reason.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn non_pending_job_is_not_runnable_and_opens_no_connection() {
        let h = harness(Script::Succeed, None);
        let job = pending_job(&h.store).await;
        h.runner.run(&job.job_id).await.unwrap();

        let err = h.runner.run(&job.job_id).await.unwrap_err();
        assert!(err.is_not_runnable());
        assert_eq!(h.executor.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_goes_through_the_cancel_path() {
        let h = harness(Script::WaitForCancel, Some(Duration::from_millis(20)));
        let job = pending_job(&h.store).await;

        let finished = h.runner.run(&job.job_id).await.unwrap();
        assert!(h.canceller.called.load(Ordering::SeqCst));
        assert_eq!(finished.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn drained_job_stays_pending_after_cancellation() {
        let h = harness(Script::WaitForCancel, None);
        let job_id = pending_job(&h.store).await.job_id;
        let jobs = JobService::new(h.store.clone(), h.canceller.clone());

        let runner = h.runner;
        let run = tokio::spawn(async move { runner.run(&job_id).await });
        loop {
            if jobs.get(&job_id).await.unwrap().status == JobStatus::Running {
                break;
            }
            tokio::task::yield_now().await;
        }

        let drained = jobs.drain(&job_id).await.unwrap();
        assert!(matches!(drained, DrainedJob::HandedBack(ref j) if j.status == JobStatus::Pending));

        let finished = run.await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn draining_runner_leaves_pending_job_untouched() {
        let (h, _token) = draining_harness(false);
        let job = pending_job(&h.store).await;

        let err = h.runner.run(&job.job_id).await.unwrap_err();
        assert!(err.is_handed_back());
        assert_eq!(h.executor.connects.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.get(&job.job_id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn drain_during_connect_hands_job_back_before_its_query() {
        let (h, token) = draining_harness(true);
        let job = pending_job(&h.store).await;

        let err = h.runner.run(&job.job_id).await.unwrap_err();
        assert!(token.is_cancelled());
        assert!(err.is_handed_back());
        assert!(h.executor.statements.lock().unwrap().is_empty());
        assert_eq!(h.executor.closed.load(Ordering::SeqCst), 1);
        assert!(!h.canceller.called.load(Ordering::SeqCst));

        let stored = h.store.get(&job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert!(stored.ended_at.is_none());
    }
}
