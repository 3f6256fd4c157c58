use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-cottage change feed. Only committed events are published.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a cottage's feed, creating the channel on first use.
    pub fn subscribe(&self, cottage_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(cottage_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish to a cottage's subscribers. No-op if nobody is listening.
    pub fn send(&self, cottage_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&cottage_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a deleted cottage's channel. Open receivers see `Closed`.
    pub fn remove(&self, cottage_id: &Ulid) {
        self.channels.remove(cottage_id);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let cid = Ulid::new();
        let mut rx = hub.subscribe(cid);

        let event = Event::AmenityAttached {
            cottage_id: cid,
            amenity_id: Ulid::new(),
        };
        hub.send(cid, &event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn feeds_are_per_cottage() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(a);
        let _rx_b = hub.subscribe(b);

        hub.send(b, &Event::CottageDeleted { id: b });
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let cid = Ulid::new();
        hub.send(cid, &Event::CottageDeleted { id: cid });
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn remove_closes_receivers() {
        let hub = NotifyHub::new();
        let cid = Ulid::new();
        let mut rx = hub.subscribe(cid);
        hub.remove(&cid);
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }
}
