#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlbatch_core::batch::{
    Batch, BatchConfig, FixedCapacity, InMemoryJobQueue, InMemoryJobStore, InProcJobNotifier, Job,
    JobId, JobStatus, JobSubmitter, MemoryJobLogger, QueryCanceller, QueryExecutor, QuerySession,
    StaticUserMetadataService, UserDatabaseMetadata,
};
use sqlbatch_core::{BatchError, Result};
use tokio::sync::{Notify, oneshot};

/// SQL understood by [`FakeDatabase`].
pub const SQL_OK: &str = "SELECT 1";
pub const SQL_FAIL: &str = "SELECT * FROM missing";
pub const SQL_WAIT: &str = "SELECT pg_sleep(3600)";

pub const FAIL_MESSAGE: &str = "relation \"missing\" does not exist";

#[derive(Debug)]
enum Interrupt {
    Cancel,
    Release,
}

struct Statement {
    sql: String,
    interrupt: oneshot::Sender<Interrupt>,
}

#[derive(Default)]
struct DbState {
    running: Vec<Statement>,
    started: Vec<String>,
    active_hosts: HashMap<String, usize>,
    peak_hosts: HashMap<String, usize>,
    active_users: HashSet<String>,
    overlapping_users: Vec<String>,
    hold_connections: bool,
    connecting: usize,
}

/// In-process stand-in for the tenant databases. Statements equal to
/// [`SQL_WAIT`] block until cancelled or released by the test.
#[derive(Clone, Default)]
pub struct FakeDatabase {
    state: Arc<Mutex<DbState>>,
    connections_opened: Arc<Notify>,
}

impl FakeDatabase {
    /// New connections block until [`FakeDatabase::open_connections`].
    pub fn hold_connections(&self) {
        self.state.lock().unwrap().hold_connections = true;
    }

    pub fn open_connections(&self) {
        self.state.lock().unwrap().hold_connections = false;
        self.connections_opened.notify_waiters();
    }

    /// Connections currently blocked by [`FakeDatabase::hold_connections`].
    pub fn connecting(&self) -> usize {
        self.state.lock().unwrap().connecting
    }

    pub fn started(&self) -> Vec<String> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn peak(&self, host: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .peak_hosts
            .get(host)
            .copied()
            .unwrap_or_default()
    }

    pub fn overlapping_users(&self) -> Vec<String> {
        self.state.lock().unwrap().overlapping_users.clone()
    }

    pub fn is_running(&self, job: &Job) -> bool {
        let tag = job.job_id.sql_tag();
        self.state
            .lock()
            .unwrap()
            .running
            .iter()
            .any(|stmt| stmt.sql.contains(&tag))
    }

    pub async fn wait_running(&self, job: &Job) {
        eventually(|| async { self.is_running(job) }).await;
    }

    fn interrupt(&self, job_id: &JobId, interrupt: Interrupt) -> bool {
        let tag = job_id.sql_tag();
        let mut state = self.state.lock().unwrap();
        match state.running.iter().position(|stmt| stmt.sql.contains(&tag)) {
            Some(index) => {
                let stmt = state.running.remove(index);
                let _ = stmt.interrupt.send(interrupt);
                true
            }
            None => false,
        }
    }

    /// Lets a blocked statement complete successfully.
    pub fn release(&self, job: &Job) {
        assert!(
            self.interrupt(&job.job_id, Interrupt::Release),
            "job {} is not running",
            job.job_id
        );
    }
}

struct FakeSession {
    db: FakeDatabase,
    host: String,
    user: String,
}

impl FakeSession {
    fn enter(&self, sql: &str) {
        let mut state = self.db.state.lock().unwrap();
        state.started.push(sql.to_string());
        let active = state.active_hosts.entry(self.host.clone()).or_default();
        *active += 1;
        let active = *active;
        let peak = state.peak_hosts.entry(self.host.clone()).or_default();
        *peak = (*peak).max(active);
        if !state.active_users.insert(self.user.clone()) {
            state.overlapping_users.push(self.user.clone());
        }
    }

    fn leave(&self) {
        let mut state = self.db.state.lock().unwrap();
        if let Some(active) = state.active_hosts.get_mut(&self.host) {
            *active -= 1;
        }
        state.active_users.remove(&self.user);
    }
}

#[async_trait]
impl QuerySession for FakeSession {
    async fn disable_statement_timeout(&mut self) -> Result<()> {
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.enter(sql);
        let result = if sql.starts_with(SQL_WAIT) {
            let (tx, rx) = oneshot::channel();
            self.db.state.lock().unwrap().running.push(Statement {
                sql: sql.to_string(),
                interrupt: tx,
            });
            match rx.await {
                Ok(Interrupt::Release) => Ok(()),
                Ok(Interrupt::Cancel) | Err(_) => Err(BatchError::QueryCanceled),
            }
        } else if sql.starts_with(SQL_FAIL) {
            Err(BatchError::Execution(FAIL_MESSAGE.to_string()))
        } else {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        };
        self.leave();
        result
    }

    async fn close(self: Box<Self>) {}
}

#[async_trait]
impl QueryExecutor for FakeDatabase {
    async fn connect(&self, metadata: &UserDatabaseMetadata) -> Result<Box<dyn QuerySession>> {
        let opened = self.connections_opened.notified();
        tokio::pin!(opened);
        opened.as_mut().enable();
        let held = {
            let mut state = self.state.lock().unwrap();
            if state.hold_connections {
                state.connecting += 1;
            }
            state.hold_connections
        };
        if held {
            opened.await;
            self.state.lock().unwrap().connecting -= 1;
        }

        Ok(Box::new(FakeSession {
            db: self.clone(),
            host: metadata.host.clone(),
            user: metadata.user.clone(),
        }))
    }
}

#[async_trait]
impl QueryCanceller for FakeDatabase {
    async fn cancel(&self, job: &Job) -> Result<()> {
        self.interrupt(&job.job_id, Interrupt::Cancel);
        Ok(())
    }
}

pub fn user(host: &str, name: &str) -> UserDatabaseMetadata {
    UserDatabaseMetadata {
        host: host.to_string(),
        port: 5432,
        dbname: format!("{name}_db"),
        user: name.to_string(),
        password: String::new(),
    }
}

/// A worker wired entirely with in-process collaborators.
pub struct Harness {
    pub batch: Batch,
    pub submitter: JobSubmitter,
    pub queue: Arc<InMemoryJobQueue>,
    pub store: Arc<InMemoryJobStore>,
    pub notifier: Arc<InProcJobNotifier>,
    pub db: FakeDatabase,
    pub logger: Arc<MemoryJobLogger>,
}

pub fn harness(capacity: usize, configure: impl FnOnce(&mut BatchConfig)) -> Harness {
    let mut config = BatchConfig {
        name: "test-batch".to_string(),
        drain_timeout_ms: 2_000,
        ..BatchConfig::default()
    };
    configure(&mut config);

    let queue = Arc::new(InMemoryJobQueue::new());
    let store = Arc::new(InMemoryJobStore::new());
    let notifier = Arc::new(InProcJobNotifier::default());
    let db = FakeDatabase::default();
    let logger = Arc::new(MemoryJobLogger::default());
    let metadata = Arc::new(
        StaticUserMetadataService::default()
            .with_user("alice", user("h1", "alice"))
            .with_user("bob", user("h1", "bob"))
            .with_user("carol", user("h1", "carol"))
            .with_user("dave", user("h2", "dave")),
    );

    let batch = Batch::builder(config.clone())
        .with_queue(queue.clone())
        .with_subscriber(notifier.clone())
        .with_metadata(metadata.clone())
        .with_store(store.clone())
        .with_executor(Arc::new(db.clone()))
        .with_canceller(Arc::new(db.clone()))
        .with_capacity(Arc::new(FixedCapacity::new(capacity)))
        .with_logger(logger.clone())
        .build()
        .expect("batch builds");

    let submitter = JobSubmitter::new(
        batch.jobs().clone(),
        queue.clone(),
        notifier.clone(),
        metadata,
        config.max_queued_jobs,
    );

    Harness {
        batch,
        submitter,
        queue,
        store,
        notifier,
        db,
        logger,
    }
}

impl Harness {
    pub async fn submit(&self, user: &str, sql: &str) -> Job {
        self.submitter
            .submit(user, sql, None)
            .await
            .expect("submit job")
    }

    pub async fn status(&self, job: &Job) -> JobStatus {
        self.batch
            .jobs()
            .get(&job.job_id)
            .await
            .expect("job exists")
            .status
    }

    pub async fn reload(&self, job: &Job) -> Job {
        self.batch.jobs().get(&job.job_id).await.expect("job exists")
    }

    pub async fn wait_status(&self, job: &Job, status: JobStatus) {
        eventually(|| async { self.status(job).await == status }).await;
    }
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
