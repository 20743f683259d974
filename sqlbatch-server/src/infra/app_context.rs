use std::{fmt, sync::Arc, time::Duration};

use anyhow::Context;
use sqlbatch_core::batch::{
    Batch, JobService, JobSubmitter, PgQueryCanceller, PgQueryExecutor, RedisJobNotifier,
    RedisJobQueue, RedisJobStore, RedisUserMetadataService, StaticUserMetadataService,
    UserDatabaseMetadataService, persistence,
};

use crate::infra::config::Config;

/// Shared infrastructure handles for every subcommand.
#[derive(Clone)]
pub struct AppContext {
    config: Arc<Config>,
    queue: Arc<RedisJobQueue>,
    store: Arc<RedisJobStore>,
    notifier: Arc<RedisJobNotifier>,
    metadata: Arc<dyn UserDatabaseMetadataService>,
    canceller: Arc<PgQueryCanceller>,
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("batch", &self.config.batch.name)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    pub async fn connect(config: Arc<Config>) -> anyhow::Result<Self> {
        let redis_url = config.redis.url.as_str();
        let conn = persistence::connect(redis_url)
            .await
            .with_context(|| format!("failed to connect to Redis at {redis_url}"))?;

        let notifier = RedisJobNotifier::new(redis_url)
            .await
            .context("failed to set up job notifications")?;

        let metadata: Arc<dyn UserDatabaseMetadataService> = if config.users.is_static() {
            Arc::new(StaticUserMetadataService::new(
                config.users.accounts.clone(),
            ))
        } else {
            Arc::new(RedisUserMetadataService::new(
                conn.clone(),
                config.users.templates.clone(),
            ))
        };

        let finished_ttl = Duration::from_secs(config.batch.finished_jobs_ttl_secs);

        Ok(Self {
            queue: Arc::new(RedisJobQueue::new(conn.clone())),
            store: Arc::new(RedisJobStore::new(conn, finished_ttl)),
            notifier: Arc::new(notifier),
            canceller: Arc::new(PgQueryCanceller::new(Arc::clone(&metadata))),
            metadata,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        self.config.as_ref()
    }

    pub fn queue(&self) -> &RedisJobQueue {
        self.queue.as_ref()
    }

    pub fn jobs(&self) -> JobService {
        JobService::new(self.store.clone(), self.canceller.clone())
    }

    pub fn submitter(&self) -> JobSubmitter {
        JobSubmitter::new(
            self.jobs(),
            self.queue.clone(),
            self.notifier.clone(),
            Arc::clone(&self.metadata),
            self.config.batch.max_queued_jobs,
        )
    }

    pub fn batch(&self) -> anyhow::Result<Batch> {
        Batch::builder(self.config.batch.clone())
            .with_queue(self.queue.clone())
            .with_subscriber(self.notifier.clone())
            .with_metadata(Arc::clone(&self.metadata))
            .with_store(self.store.clone())
            .with_executor(Arc::new(PgQueryExecutor::new()))
            .with_canceller(self.canceller.clone())
            .build()
            .context("failed to assemble batch worker")
    }
}
