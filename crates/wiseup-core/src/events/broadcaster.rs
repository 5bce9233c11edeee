use std::sync::Arc;
use tokio::sync::broadcast;

use super::types::AuthEvent;

/// Events beyond this limit are dropped for slow receivers.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Broadcast bus for [`AuthEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct AuthEventBus {
    sender: broadcast::Sender<AuthEvent>,
}

impl AuthEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Publish an event. Returns the number of subscribers that received it,
    /// 0 when nobody is listening.
    pub fn publish(&self, event: AuthEvent) -> usize {
        self.sender.send(event).unwrap_or_default()
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for AuthEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AuthEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthEventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AuthEventType;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = AuthEventBus::new();
        assert_eq!(bus.publish(AuthEvent::new(AuthEventType::LoginFailed)), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = AuthEventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let delivered = bus.publish(AuthEvent::token_rotated("u1", "f1"));
        assert_eq!(delivered, 2);

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.event_type, AuthEventType::TokenRotated);
        assert_eq!(e2.family_id.as_deref(), Some("f1"));
    }
}
