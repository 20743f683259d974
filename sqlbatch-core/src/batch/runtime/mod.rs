//! Process-level wiring: readiness channels and the worker supervisor.

pub mod event_bus;
pub mod processor;
pub mod redis_bus;
pub mod supervisor;

pub use event_bus::InProcJobNotifier;
pub use processor::{JobProcessor, WorkInProgress};
pub use redis_bus::RedisJobNotifier;
pub use supervisor::{Batch, BatchBuilder, DrainReport};
