use std::{fmt, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use redis::{
    AsyncCommands,
    aio::{ConnectionManager, PubSub},
};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::events::{JobPublisher, JobReady, JobSubscriber};
use crate::error::{BatchError, Result};

pub const DEFAULT_CHANNEL: &str = "batch:users";

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Readiness channel over Redis pub/sub.
///
/// Redis does not buffer pub/sub messages: anything published while the
/// listener is disconnected is lost, which reconciliation tolerates.
#[derive(Clone)]
pub struct RedisJobNotifier {
    client: redis::Client,
    conn: ConnectionManager,
    channel: String,
    sender: broadcast::Sender<JobReady>,
    listener: std::sync::Arc<Mutex<Option<CancellationToken>>>,
}

impl fmt::Debug for RedisJobNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisJobNotifier")
            .field("channel", &self.channel)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl RedisJobNotifier {
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::with_channel(redis_url, DEFAULT_CHANNEL).await
    }

    pub async fn with_channel(redis_url: &str, channel: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            BatchError::Notifier(format!("Failed to create Redis client: {e}"))
        })?;
        let conn = ConnectionManager::new(client.clone()).await.map_err(|e| {
            BatchError::Notifier(format!("Failed to connect to Redis: {e}"))
        })?;
        let (sender, _) = broadcast::channel(1024);

        Ok(Self {
            client,
            conn,
            channel: channel.to_string(),
            sender,
            listener: std::sync::Arc::new(Mutex::new(None)),
        })
    }

    async fn open_pubsub(client: &redis::Client, channel: &str) -> Result<PubSub> {
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| BatchError::Notifier(format!("Failed to open pub/sub connection: {e}")))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BatchError::Notifier(format!("SUBSCRIBE {channel} failed: {e}")))?;
        Ok(pubsub)
    }

    /// `first` is the already subscribed connection; later ones are opened
    /// here with a fixed delay between attempts.
    async fn listen(
        client: redis::Client,
        channel: String,
        sender: broadcast::Sender<JobReady>,
        token: CancellationToken,
        mut first: Option<PubSub>,
    ) {
        loop {
            if token.is_cancelled() {
                break;
            }

            let pubsub = match first.take() {
                Some(pubsub) => pubsub,
                None => match Self::open_pubsub(&client, &channel).await {
                    Ok(pubsub) => pubsub,
                    Err(err) => {
                        warn!(target: "batch::notifier", error = %err, channel = %channel, "pub/sub reconnect failed; retrying");
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                        }
                    }
                },
            };
            info!(target: "batch::notifier", channel = %channel, "subscribed to job notifications");

            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    next = messages.next() => {
                        let Some(msg) = next else {
                            warn!(target: "batch::notifier", "pub/sub stream closed; reconnecting");
                            break;
                        };
                        let payload: String = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(err) => {
                                debug!(target: "batch::notifier", error = %err, "ignoring non-text payload");
                                continue;
                            }
                        };
                        match JobReady::decode(&payload) {
                            Some(event) => {
                                let _ = sender.send(event);
                            }
                            None => {
                                debug!(target: "batch::notifier", payload = %payload, "ignoring malformed payload");
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl JobPublisher for RedisJobNotifier {
    async fn publish(&self, event: JobReady) -> Result<()> {
        let payload = event.encode()?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(&self.channel, payload)
            .await
            .map_err(|e| BatchError::Notifier(format!("Redis PUBLISH failed: {e}")))?;
        debug!(target: "batch::notifier", user = %event.user, receivers, "published job readiness");
        Ok(())
    }
}

#[async_trait]
impl JobSubscriber for RedisJobNotifier {
    async fn subscribe(&self) -> Result<broadcast::Receiver<JobReady>> {
        let mut guard = self.listener.lock().await;
        if guard.is_none() {
            let pubsub = Self::open_pubsub(&self.client, &self.channel).await?;
            let token = CancellationToken::new();
            tokio::spawn(Self::listen(
                self.client.clone(),
                self.channel.clone(),
                self.sender.clone(),
                token.clone(),
                Some(pubsub),
            ));
            *guard = Some(token);
        }
        Ok(self.sender.subscribe())
    }

    async fn unsubscribe(&self) -> Result<()> {
        let mut guard = self.listener.lock().await;
        if let Some(token) = guard.take() {
            token.cancel();
            info!(target: "batch::notifier", channel = %self.channel, "unsubscribed from job notifications");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_redis_fails_the_subscription() {
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let err = RedisJobNotifier::open_pubsub(&client, DEFAULT_CHANNEL)
            .await
            .err()
            .expect("subscription to unreachable redis should fail");
        assert!(matches!(err, BatchError::Notifier(_)), "{err:?}");
    }
}
