//! `EventBus` (§4.6): typed, sequenced broadcast of state changes. The
//! monotonic seq itself is allocated by the Store inside the same
//! transaction as the state write (`Store::append_event`); this module only
//! owns the best-effort fan-out to live subscribers and the subscriber-side
//! gap-detection helper.

use crate::models::Event;
use tokio::sync::broadcast;

/// Default channel capacity: subscribers lagging behind this many events
/// are dropped (spec: "best-effort per subscriber, dropped on slow
/// consumer; the seq/resync protocol restores eventual consistency").
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Broadcasts an already-persisted event to all current subscribers.
    /// Never fails: if there are no subscribers, the send is simply a no-op.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// `true` if `received_seq` is not the immediate successor of
/// `last_seen_seq` — the subscriber should request a `sync:full` resync.
pub fn is_gap(last_seen_seq: i64, received_seq: i64) -> bool {
    received_seq != last_seen_seq + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventKind;
    use chrono::Utc;

    fn event(seq: i64) -> Event {
        Event {
            seq,
            kind: EventKind::TaskUpdated,
            payload: serde_json::json!({}),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(event(1));
        bus.publish(event(2));
        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert_eq!(rx.recv().await.unwrap().seq, 2);
    }

    #[test]
    fn gap_detection_flags_missing_sequence() {
        assert!(!is_gap(5, 6));
        assert!(is_gap(5, 8));
        assert!(is_gap(5, 5));
    }
}
