use std::collections::HashMap;

use berth_instance::{InstanceEvent, InstanceId};
use tokio::sync::{Mutex, broadcast};

const CHANNEL_CAPACITY: usize = 256;

/// Per-instance fan-out of lifecycle and log events.
///
/// One broadcast channel per instance id, created lazily on first subscribe
/// or publish. Channels with no remaining receivers are pruned on the next
/// publish, so disconnected consumers never leak senders.
#[derive(Debug, Default)]
pub struct EventHub {
    channels: Mutex<HashMap<String, broadcast::Sender<InstanceEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, id: &InstanceId) -> broadcast::Receiver<InstanceEvent> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(id.0.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub async fn publish(&self, event: InstanceEvent) {
        let key = event.instance_id().0.clone();
        let mut channels = self.channels.lock().await;
        let Some(tx) = channels.get(&key) else {
            return;
        };
        if tx.send(event).is_err() {
            // All receivers dropped; reclaim the slot.
            channels.remove(&key);
        }
    }

    /// Drop the channel for a deleted instance. Live receivers observe
    /// a closed stream.
    pub async fn remove(&self, id: &InstanceId) {
        self.channels.lock().await.remove(&id.0);
    }

    pub async fn subscriber_count(&self, id: &InstanceId) -> usize {
        self.channels
            .lock()
            .await
            .get(&id.0)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let hub = EventHub::new();
        let id = InstanceId("a".into());
        hub.publish(InstanceEvent::Started { id: id.clone() }).await;
        assert_eq!(hub.subscriber_count(&id).await, 0);
    }

    #[tokio::test]
    async fn events_reach_every_subscriber() {
        let hub = EventHub::new();
        let id = InstanceId("a".into());
        let mut rx1 = hub.subscribe(&id).await;
        let mut rx2 = hub.subscribe(&id).await;

        hub.publish(InstanceEvent::Started { id: id.clone() }).await;

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                InstanceEvent::Started { id: got } => assert_eq!(got, id),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dropped_receivers_prune_the_channel() {
        let hub = EventHub::new();
        let id = InstanceId("a".into());
        let rx = hub.subscribe(&id).await;
        drop(rx);

        hub.publish(InstanceEvent::Started { id: id.clone() }).await;
        assert_eq!(hub.subscriber_count(&id).await, 0);
        assert!(hub.channels.lock().await.is_empty());
    }
}
