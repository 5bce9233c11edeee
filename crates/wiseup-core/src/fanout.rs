//! Cross-instance pub/sub.
//!
//! Every server process publishes immutable byte payloads on named topics and
//! receives what every process (itself included) published. Cache invalidation
//! notices and dashboard snapshots both travel over this abstraction; the Redis
//! implementation lives in `wiseup-cache`, the in-process one here.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

const DEFAULT_TOPIC_CAPACITY: usize = 256;

/// One message received from the fan-out channel.
#[derive(Debug, Clone)]
pub struct FanoutMessage {
    pub topic: String,
    pub payload: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FanoutError {
    #[error("fan-out channel unavailable: {0}")]
    Unavailable(String),

    #[error("fan-out publish timed out")]
    Timeout,
}

#[async_trait]
pub trait FanoutChannel: Send + Sync {
    /// Publish a payload to every subscriber of `topic` on every instance.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), FanoutError>;

    /// Subscribe to a topic. Lagging receivers lose the oldest messages.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<FanoutMessage>;

    /// Backend name for logs and health output.
    fn name(&self) -> &'static str;
}

pub type DynFanout = Arc<dyn FanoutChannel>;

/// In-process fan-out bus.
///
/// Clones share the same topics, so several service graphs built in one
/// process behave like a fleet of instances on a shared channel.
#[derive(Clone)]
pub struct MemoryFanout {
    topics: Arc<DashMap<String, broadcast::Sender<FanoutMessage>>>,
    capacity: usize,
    available: Arc<AtomicBool>,
}

impl MemoryFanout {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate a partition: publishes fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<FanoutMessage> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FanoutChannel for MemoryFanout {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), FanoutError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(FanoutError::Unavailable("memory bus partitioned".into()));
        }
        let message = FanoutMessage {
            topic: topic.to_string(),
            payload: Arc::new(payload),
        };
        // No receivers is not an error for pub/sub.
        let _ = self.sender(topic).send(message);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<FanoutMessage> {
        self.sender(topic).subscribe()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
