//! Asynchronous SQL batch execution.
//!
//! Jobs are queued per user in a shared store. Workers learn about new work
//! through a best-effort notification channel and a periodic reconciliation
//! scan, dispatch users onto database hosts under a capacity limit, and run
//! one job per user at a time.

pub mod capacity;
pub mod config;
pub mod events;
pub mod job;
pub mod logger;
pub mod metadata;
pub mod persistence;
pub mod postgres;
pub mod queue;
pub mod runner;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod store;

pub use capacity::{CapacityProvider, FixedCapacity, HttpCapacity, MIN_CAPACITY, ProbeMode};
pub use config::{BatchConfig, CapacityConfig, CapacityStrategy};
pub use events::{JobPublisher, JobReady, JobSubscriber};
pub use job::{Job, JobId, JobPatch, JobStatus};
pub use logger::{JobLogger, MemoryJobLogger, TracingJobLogger};
pub use metadata::{
    MetadataTemplates, RedisUserMetadataService, StaticUserMetadataService, UserDatabaseMetadata,
    UserDatabaseMetadataService,
};
pub use persistence::{RedisJobQueue, RedisJobStore};
pub use postgres::{PgQueryCanceller, PgQueryExecutor};
pub use queue::{InMemoryJobQueue, JobQueue};
pub use runner::{JobRunner, QueryCanceller, QueryExecutor, QuerySession};
pub use runtime::{
    Batch, BatchBuilder, DrainReport, InProcJobNotifier, JobProcessor, RedisJobNotifier,
    WorkInProgress,
};
pub use scheduler::{HostScheduler, HostSnapshot, QueueState, SchedulerEvent, TaskRunner};
pub use service::{DrainedJob, JobService, JobSubmitter, RecoveryReport};
pub use store::{InMemoryJobStore, JobStore};
