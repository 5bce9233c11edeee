//! Redis pub/sub implementation of the fan-out channel.

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::Pool;
use futures_util::StreamExt;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use wiseup_core::{FanoutChannel, FanoutError, FanoutMessage};

const TOPIC_CAPACITY: usize = 256;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Publishes through the shared connection pool; each subscribed topic gets a
/// dedicated pub/sub connection that reconnects with exponential backoff and
/// re-broadcasts into process-local receivers.
pub struct RedisFanout {
    pool: Pool,
    redis_url: String,
    topics: DashMap<String, broadcast::Sender<FanoutMessage>>,
    cancel: CancellationToken,
}

impl RedisFanout {
    pub fn new(pool: Pool, redis_url: impl Into<String>) -> Self {
        Self {
            pool,
            redis_url: redis_url.into(),
            topics: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop every topic listener.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn spawn_listener(&self, topic: String, sender: broadcast::Sender<FanoutMessage>) {
        let url = self.redis_url.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    r = listen(&url, &topic, &sender) => r,
                };
                match result {
                    Ok(()) => backoff = INITIAL_BACKOFF,
                    Err(e) => {
                        tracing::error!(
                            topic = %topic,
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "fan-out listener error, reconnecting"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        });
    }
}

async fn listen(
    url: &str,
    topic: &str,
    sender: &broadcast::Sender<FanoutMessage>,
) -> Result<(), redis::RedisError> {
    let client = redis::Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(topic).await?;
    tracing::info!(topic, "subscribed to fan-out topic");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: Vec<u8> = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(topic, error = %e, "unreadable fan-out payload");
                continue;
            }
        };
        // No local receivers is not an error.
        let _ = sender.send(FanoutMessage {
            topic: topic.to_string(),
            payload: Arc::new(payload),
        });
    }
    Err(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "pub/sub connection closed",
    )))
}

#[async_trait]
impl FanoutChannel for RedisFanout {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), FanoutError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| FanoutError::Unavailable(e.to_string()))?;
        conn.publish::<_, _, ()>(topic, payload)
            .await
            .map_err(|e| FanoutError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<FanoutMessage> {
        if let Some(sender) = self.topics.get(topic) {
            return sender.subscribe();
        }
        let entry = self.topics.entry(topic.to_string());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(o) => o.get().subscribe(),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let (sender, receiver) = broadcast::channel(TOPIC_CAPACITY);
                self.spawn_listener(topic.to_string(), sender.clone());
                v.insert(sender);
                receiver
            }
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

impl Drop for RedisFanout {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
