use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events, keyed by venue. Downstream consumers
/// (messaging dispatch, email) subscribe here; a send is fire-and-forget and
/// never affects the booking or status change that produced it.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a venue's events. Creates the channel if needed.
    pub fn subscribe(&self, venue_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(venue_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, venue_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&venue_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a venue is torn down).
    #[allow(dead_code)]
    pub fn remove(&self, venue_id: &Ulid) {
        self.channels.remove(venue_id);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocationPolicy;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let venue_id = Ulid::new();
        let mut rx = hub.subscribe(venue_id);

        let event = Event::VenueCreated {
            id: venue_id,
            name: None,
            policy: LocationPolicy::default(),
        };
        hub.send(venue_id, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let venue_id = Ulid::new();
        // No subscriber — should not panic
        hub.send(
            venue_id,
            &Event::ShiftRemoved {
                id: Ulid::new(),
                venue_id,
            },
        );
    }

    #[tokio::test]
    async fn venues_have_independent_channels() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(a);
        let _rx_b = hub.subscribe(b);

        hub.send(
            b,
            &Event::VenueCreated {
                id: b,
                name: None,
                policy: LocationPolicy::default(),
            },
        );
        assert!(rx_a.try_recv().is_err());
    }
}
