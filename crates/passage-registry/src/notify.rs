//! Tunnel-creation notification channel
//!
//! A broadcast topic carrying the full record of every tunnel the control
//! plane creates. Data-plane proxies subscribe to materialize listeners at
//! runtime; tunnels created before a subscriber attached are picked up by its
//! startup recovery instead.

use passage_proto::TunnelRecord;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 64;

/// Publish/subscribe topic for tunnel-creation events
#[derive(Debug, Clone)]
pub struct CreationBus {
    sender: broadcast::Sender<TunnelRecord>,
}

impl CreationBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { sender }
    }

    /// Publish a freshly created tunnel record to all subscribers
    ///
    /// Publishing with no subscribers is not an error; the proxy recovers
    /// pre-existing tunnels from the active set when it starts.
    pub fn publish(&self, record: TunnelRecord) {
        let subscribers = self.sender.receiver_count();
        tracing::debug!(id = %record.id, subscribers, "Publishing tunnel creation");
        let _ = self.sender.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelRecord> {
        self.sender.subscribe()
    }
}

impl Default for CreationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use passage_proto::TunnelState;

    fn create_test_record(id: &str) -> TunnelRecord {
        TunnelRecord {
            id: id.to_string(),
            subdomain: "abc123".to_string(),
            status: TunnelState::Active,
            created_at: Utc::now(),
            port: 2000,
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_published_records() {
        let bus = CreationBus::new();
        let mut rx = bus.subscribe();

        bus.publish(create_test_record("t1"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, "t1");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = CreationBus::new();
        bus.publish(create_test_record("t1"));
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_records() {
        let bus = CreationBus::new();
        bus.publish(create_test_record("t1"));

        let mut rx = bus.subscribe();
        bus.publish(create_test_record("t2"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, "t2");
    }
}
