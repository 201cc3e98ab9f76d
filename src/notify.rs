use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-coach change feed. Calendars subscribe to a coach and receive every
/// committed event touching that coach's hours or reservations.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, coach_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(coach_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fan out to the event's coach. No-op without subscribers.
    pub fn publish(&self, event: &Event) {
        let Some(coach_id) = event.coach_id() else {
            return;
        };
        if let Some(sender) = self.channels.get(&coach_id) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn remove(&self, coach_id: &Ulid) {
        self.channels.remove(coach_id);
    }

    pub fn subscribed_coaches(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coach_feed_receives_own_events_only() {
        let hub = NotifyHub::new();
        let kim = Ulid::new();
        let lee = Ulid::new();
        let mut rx = hub.subscribe(kim);

        hub.publish(&Event::CoachCreated { id: lee, name: None });
        let event = Event::CoachDeleted { id: kim };
        hub.publish(&event);

        assert_eq!(rx.recv().await.unwrap(), event);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.publish(&Event::CoachDeleted { id: Ulid::new() });
        assert_eq!(hub.subscribed_coaches(), 0);
    }

    #[test]
    fn remove_drops_channel() {
        let hub = NotifyHub::new();
        let id = Ulid::new();
        let _rx = hub.subscribe(id);
        assert_eq!(hub.subscribed_coaches(), 1);
        hub.remove(&id);
        assert_eq!(hub.subscribed_coaches(), 0);
    }
}
