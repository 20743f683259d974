use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::batch::capacity::{self, CapacityProvider};
use crate::batch::config::BatchConfig;
use crate::batch::events::{JobReady, JobSubscriber};
use crate::batch::job::{JobId, JobStatus};
use crate::batch::logger::{JobLogger, TracingJobLogger};
use crate::batch::metadata::UserDatabaseMetadataService;
use crate::batch::queue::JobQueue;
use crate::batch::runner::{JobRunner, QueryCanceller, QueryExecutor};
use crate::batch::scheduler::HostScheduler;
use crate::batch::service::{DrainedJob, JobService};
use crate::batch::store::JobStore;
use crate::error::{BatchError, Result};

use super::processor::{JobProcessor, WorkInProgress};

/// Resolves readiness signals to a host and hands them to the scheduler.
#[derive(Clone)]
struct JobRouter {
    name: Arc<str>,
    metadata: Arc<dyn UserDatabaseMetadataService>,
    scheduler: HostScheduler,
}

impl JobRouter {
    async fn route(&self, event: JobReady) {
        let host = match event.host {
            Some(host) => host,
            None => match self.metadata.get_user_metadata(&event.user).await {
                Ok(metadata) => metadata.host,
                Err(err) => {
                    warn!(
                        target: "batch::scheduler",
                        name = %self.name,
                        user = %event.user,
                        error = %err,
                        "could not resolve host for user"
                    );
                    return;
                }
            },
        };

        debug!(target: "batch::scheduler", name = %self.name, user = %event.user, host = %host, "job ready");
        self.scheduler.add(&host, &event.user).await;
    }
}

/// Outcome of [`Batch::drain`], one entry per user that had a job in flight.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Put back at the head of the user's queue, cancelled if its query
    /// had started.
    pub requeued: Vec<(String, JobId)>,
    /// Already finished by the time drain reached them.
    pub skipped: Vec<(String, JobId)>,
    pub failures: Vec<(String, JobId, String)>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

enum DrainOutcome {
    Requeued(String, JobId),
    Skipped(String, JobId),
    Failed(String, JobId, String),
}

/// Worker process lifecycle: intake, reconciliation, dispatch and drain.
pub struct Batch {
    config: BatchConfig,
    queue: Arc<dyn JobQueue>,
    subscriber: Arc<dyn JobSubscriber>,
    jobs: JobService,
    router: JobRouter,
    scheduler: HostScheduler,
    wip: Arc<WorkInProgress>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    stopped: AtomicBool,
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("name", &self.config.name)
            .field("scheduler", &self.scheduler)
            .field("wip", &self.wip)
            .field("background_tasks", &self.tasks.len())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Batch {
    pub fn builder(config: BatchConfig) -> BatchBuilder {
        BatchBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn scheduler(&self) -> &HostScheduler {
        &self.scheduler
    }

    pub fn jobs(&self) -> &JobService {
        &self.jobs
    }

    pub async fn work_in_progress(&self) -> Vec<(String, JobId)> {
        self.wip.entries().await
    }

    /// Seeds the scheduler from a full queue scan, then starts periodic
    /// reconciliation and the notification listener. Only a failing initial
    /// scan or subscription is reported.
    pub async fn start(&self) -> Result<()> {
        let users = self.queue.scan_queues().await?;
        info!(
            target: "batch::reconcile",
            name = %self.config.name,
            users = users.len(),
            "initial queue scan complete"
        );
        join_all(users.into_iter().map(|user| self.router.route(JobReady::new(user)))).await;

        self.spawn_reconciler();

        let receiver = self.subscriber.subscribe().await?;
        self.spawn_listener(receiver);

        info!(target: "batch::scheduler", name = %self.config.name, "batch ready");
        Ok(())
    }

    fn spawn_reconciler(&self) {
        let queue = Arc::clone(&self.queue);
        let router = self.router.clone();
        let shutdown = self.shutdown.clone();
        let period = self.config.schedule_interval();

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match queue.get_queues().await {
                            Ok(users) => {
                                debug!(target: "batch::reconcile", users = users.len(), "reconciling queues");
                                join_all(users.into_iter().map(|user| router.route(JobReady::new(user)))).await;
                            }
                            Err(err) => {
                                warn!(target: "batch::reconcile", name = %router.name, error = %err, "could not list queues");
                            }
                        }
                    }
                }
            }
            debug!(target: "batch::reconcile", "reconciler stopped");
        });
    }

    fn spawn_listener(&self, mut receiver: tokio::sync::broadcast::Receiver<JobReady>) {
        let router = self.router.clone();
        let shutdown = self.shutdown.clone();
        let tasks = self.tasks.clone();

        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = receiver.recv() => match event {
                        Ok(event) => {
                            let router = router.clone();
                            tasks.spawn(async move { router.route(event).await });
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(target: "batch::notifier", skipped, "notification listener lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!(target: "batch::notifier", "notification listener stopped");
        });
    }

    /// Stops intake: no more reconciliation and no more notifications.
    /// Running jobs are left alone. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        if let Err(err) = self.subscriber.unsubscribe().await {
            warn!(target: "batch::notifier", error = %err, "unsubscribe failed");
        }
        info!(target: "batch::scheduler", name = %self.config.name, "intake stopped");
    }

    /// Graceful shutdown. Every in-flight job is requeued at the head of its
    /// user's queue: a running one is cancelled first, one still starting is
    /// handed back by its runner. Jobs that already finished are left
    /// alone. Per-user failures are collected, never short-circuit.
    pub async fn drain(&self) -> DrainReport {
        self.stop().await;
        self.scheduler.close().await;

        let entries = self.wip.entries().await;
        info!(target: "batch::drain", name = %self.config.name, jobs = entries.len(), "draining");

        let outcomes = join_all(
            entries
                .into_iter()
                .map(|(user, job_id)| self.drain_job(user, job_id)),
        )
        .await;

        let mut report = DrainReport::default();
        for outcome in outcomes {
            match outcome {
                DrainOutcome::Requeued(user, id) => report.requeued.push((user, id)),
                DrainOutcome::Skipped(user, id) => report.skipped.push((user, id)),
                DrainOutcome::Failed(user, id, reason) => report.failures.push((user, id, reason)),
            }
        }

        let timeout = self.config.drain_timeout();
        if tokio::time::timeout(timeout, self.scheduler.wait_idle())
            .await
            .is_err()
        {
            warn!(target: "batch::drain", timeout_ms = timeout.as_millis() as u64, "slots still busy after drain timeout");
        }
        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            warn!(target: "batch::drain", "background tasks still running after drain timeout");
        }

        if report.is_clean() {
            info!(
                target: "batch::drain",
                requeued = report.requeued.len(),
                skipped = report.skipped.len(),
                "drain complete"
            );
        } else {
            warn!(
                target: "batch::drain",
                failures = report.failures.len(),
                "drain finished with failures"
            );
        }
        report
    }

    async fn drain_job(&self, user: String, job_id: JobId) -> DrainOutcome {
        match self.jobs.drain(&job_id).await {
            Ok(DrainedJob::NotStarted(_)) => {
                debug!(target: "batch::drain", user = %user, job_id = %job_id, "job not started yet; waiting for its runner");
                self.await_hand_back(user, job_id).await
            }
            Ok(DrainedJob::HandedBack(_)) => match self.queue.enqueue_first(&user, &job_id).await {
                Ok(()) => {
                    info!(target: "batch::drain", user = %user, job_id = %job_id, "job requeued");
                    DrainOutcome::Requeued(user, job_id)
                }
                Err(err) => {
                    warn!(target: "batch::drain", user = %user, job_id = %job_id, error = %err, "could not requeue drained job");
                    DrainOutcome::Failed(user, job_id, err.to_string())
                }
            },
            Err(err) if err.is_cancel_not_allowed() => {
                debug!(target: "batch::drain", user = %user, job_id = %job_id, "job already settled");
                DrainOutcome::Skipped(user, job_id)
            }
            Err(err) => {
                warn!(target: "batch::drain", user = %user, job_id = %job_id, error = %err, "could not drain job");
                DrainOutcome::Failed(user, job_id, err.to_string())
            }
        }
    }

    /// Waits for the runner that claimed a not yet started job to let go of
    /// it, then reports where it ended up.
    async fn await_hand_back(&self, user: String, job_id: JobId) -> DrainOutcome {
        let timeout = self.config.drain_timeout();
        if tokio::time::timeout(timeout, self.wip.wait_cleared(&user, &job_id))
            .await
            .is_err()
        {
            warn!(target: "batch::drain", user = %user, job_id = %job_id, "job still starting after drain timeout");
            return DrainOutcome::Failed(
                user,
                job_id,
                "job was not handed back before the drain timeout".to_string(),
            );
        }
        match self.jobs.get(&job_id).await {
            Ok(job) if job.status == JobStatus::Pending => {
                info!(target: "batch::drain", user = %user, job_id = %job_id, "job requeued");
                DrainOutcome::Requeued(user, job_id)
            }
            Ok(job) if job.status.is_terminal() => DrainOutcome::Skipped(user, job_id),
            Ok(job) => DrainOutcome::Failed(user, job_id, format!("job left {}", job.status)),
            Err(err) => DrainOutcome::Failed(user, job_id, err.to_string()),
        }
    }
}

pub struct BatchBuilder {
    config: BatchConfig,
    queue: Option<Arc<dyn JobQueue>>,
    subscriber: Option<Arc<dyn JobSubscriber>>,
    metadata: Option<Arc<dyn UserDatabaseMetadataService>>,
    store: Option<Arc<dyn JobStore>>,
    executor: Option<Arc<dyn QueryExecutor>>,
    canceller: Option<Arc<dyn QueryCanceller>>,
    capacity: Option<Arc<dyn CapacityProvider>>,
    logger: Option<Arc<dyn JobLogger>>,
}

impl fmt::Debug for BatchBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchBuilder")
            .field("config", &self.config)
            .field("has_queue", &self.queue.is_some())
            .field("has_subscriber", &self.subscriber.is_some())
            .field("has_metadata", &self.metadata.is_some())
            .field("has_store", &self.store.is_some())
            .field("has_executor", &self.executor.is_some())
            .field("has_canceller", &self.canceller.is_some())
            .finish()
    }
}

impl BatchBuilder {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            queue: None,
            subscriber: None,
            metadata: None,
            store: None,
            executor: None,
            canceller: None,
            capacity: None,
            logger: None,
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn JobSubscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn UserDatabaseMetadataService>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_canceller(mut self, canceller: Arc<dyn QueryCanceller>) -> Self {
        self.canceller = Some(canceller);
        self
    }

    /// Overrides the provider built from `config.capacity`.
    pub fn with_capacity(mut self, capacity: Arc<dyn CapacityProvider>) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn JobLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<Batch> {
        let queue = self
            .queue
            .ok_or_else(|| BatchError::Internal("queue dependency missing".into()))?;
        let subscriber = self
            .subscriber
            .ok_or_else(|| BatchError::Internal("job subscriber dependency missing".into()))?;
        let metadata = self
            .metadata
            .ok_or_else(|| BatchError::Internal("user metadata dependency missing".into()))?;
        let store = self
            .store
            .ok_or_else(|| BatchError::Internal("job store dependency missing".into()))?;
        let executor = self
            .executor
            .ok_or_else(|| BatchError::Internal("query executor dependency missing".into()))?;
        let canceller = self
            .canceller
            .ok_or_else(|| BatchError::Internal("query canceller dependency missing".into()))?;
        let capacity = match self.capacity {
            Some(capacity) => capacity,
            None => capacity::from_config(&self.config.capacity)?,
        };
        let logger = self
            .logger
            .unwrap_or_else(|| Arc::new(TracingJobLogger));

        let jobs = JobService::new(store, Arc::clone(&canceller));
        let shutdown = CancellationToken::new();
        let runner = JobRunner::new(jobs.clone(), Arc::clone(&metadata), executor, canceller)
            .with_query_timeout(self.config.query_timeout())
            .with_draining(shutdown.clone());

        let wip = Arc::new(WorkInProgress::default());
        let processor = JobProcessor::new(
            Arc::clone(&queue),
            runner,
            jobs.clone(),
            logger,
            Arc::clone(&wip),
            shutdown.clone(),
        );
        let scheduler = HostScheduler::new(self.config.name.clone(), Arc::new(processor), capacity);
        let router = JobRouter {
            name: Arc::from(self.config.name.as_str()),
            metadata,
            scheduler: scheduler.clone(),
        };

        Ok(Batch {
            config: self.config,
            queue,
            subscriber,
            jobs,
            router,
            scheduler,
            wip,
            shutdown,
            tasks: TaskTracker::new(),
            stopped: AtomicBool::new(false),
        })
    }
}
