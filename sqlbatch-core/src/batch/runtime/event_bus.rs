use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

use crate::batch::events::{JobPublisher, JobReady, JobSubscriber};
use crate::error::Result;

/// In-process readiness channel. Events published while nobody listens are
/// dropped, matching the semantics of the Redis channel.
pub struct InProcJobNotifier {
    sender: broadcast::Sender<JobReady>,
    capacity: usize,
    subscribed: AtomicBool,
}

impl fmt::Debug for InProcJobNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcJobNotifier")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .field("subscribed", &self.subscribed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for InProcJobNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl InProcJobNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            subscribed: AtomicBool::new(false),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl JobPublisher for InProcJobNotifier {
    async fn publish(&self, event: JobReady) -> Result<()> {
        if !self.is_subscribed() {
            tracing::trace!(target: "batch::notifier", user = %event.user, "no subscriber; event dropped");
            return Ok(());
        }
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[async_trait]
impl JobSubscriber for InProcJobNotifier {
    async fn subscribe(&self) -> Result<broadcast::Receiver<JobReady>> {
        self.subscribed.store(true, Ordering::Release);
        Ok(self.sender.subscribe())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.subscribed.store(false, Ordering::Release);
        Ok(())
    }
}
