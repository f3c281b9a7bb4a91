use lockwatch_types::Notification;
use tokio::sync::broadcast;

/// Receives every notification the engine emits. Delivery is best effort.
pub trait NotificationSink: Send + Sync + 'static {
    fn publish(&self, notification: Notification);
}

/// In-process fan-out over a broadcast channel.
///
/// Slow subscribers lag and lose the oldest messages; the engine never waits
/// on them.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationSink for BroadcastPublisher {
    fn publish(&self, notification: Notification) {
        // No subscribers is not an error.
        let _ = self.tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use lockwatch_types::{AutoResolutionAck, Notification};

    use super::*;

    fn ack(enabled: bool) -> Notification {
        Notification::ConfigChange {
            payload: AutoResolutionAck {
                auto_resolution_enabled: enabled,
                message: String::new(),
                timestamp_ms: 0,
            },
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_message() {
        let publisher = BroadcastPublisher::new(8);
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 2);

        publisher.publish(ack(true));
        publisher.publish(ack(false));

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await.unwrap(), ack(true));
            assert_eq!(rx.recv().await.unwrap(), ack(false));
        }
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let publisher = BroadcastPublisher::default();
        publisher.publish(ack(true));
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
