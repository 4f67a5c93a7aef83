//! In-process topic-filtered pub/sub.
//!
//! Publishing is non-blocking: a subscriber whose channel is full misses that
//! event, and only that subscriber. Durability lives in the repositories; the
//! bus is a notification layer only.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::event::{Event, EventKind, EventPayload};

/// Per-subscriber channel capacity.
pub const SUBSCRIBER_CAPACITY: usize = 64;

struct Registration {
    id: u64,
    /// Empty filter matches every event.
    filter: HashSet<EventKind>,
    tx: mpsc::Sender<Event>,
}

struct Inner {
    next_id: u64,
    subscribers: Vec<Registration>,
}

/// The process-wide event bus. Cheap to share as `Arc<EventBus>`.
pub struct EventBus {
    inner: Mutex<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Register a subscriber for the given event kinds. An empty list
    /// subscribes to everything.
    pub fn subscribe(self: &Arc<Self>, kinds: &[EventKind]) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Registration {
            id,
            filter: kinds.iter().copied().collect(),
            tx,
        });
        Subscription {
            id,
            rx,
            bus: Arc::clone(self),
        }
    }

    /// Publish an event, stamping the emit time. Never blocks: full
    /// subscriber queues drop the event for that subscriber only.
    pub fn publish(&self, payload: EventPayload) {
        let event = Event::now(payload);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.retain(|sub| {
            if !sub.filter.is_empty() && !sub.filter.contains(&event.kind()) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = sub.id, kind = event.kind().as_str(), "slow subscriber, event dropped");
                    true
                }
                // Receiver gone; drop the registration.
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of live subscribers (closed channels are reaped on publish).
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .len()
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.retain(|sub| sub.id != id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription. Dropping it unregisters from the bus.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    bus: Arc<EventBus>,
}

impl Subscription {
    /// Receive the next event. Returns `None` once the bus side is closed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for draining in tests and tight loops.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(connected: bool) -> EventPayload {
        EventPayload::ConnectionStatus {
            connected,
            reason: String::new(),
        }
    }

    fn qr(code: &str) -> EventPayload {
        EventPayload::PairingQr {
            code: code.to_string(),
        }
    }

    #[tokio::test]
    async fn empty_filter_matches_everything() {
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe(&[]);

        bus.publish(status(true));
        bus.publish(qr("abc"));

        assert_eq!(sub.recv().await.unwrap().kind(), EventKind::ConnectionStatus);
        assert_eq!(sub.recv().await.unwrap().kind(), EventKind::PairingQr);
    }

    #[tokio::test]
    async fn filter_is_sound() {
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe(&[EventKind::PairingQr, EventKind::PairingCode]);

        bus.publish(status(true));
        bus.publish(qr("abc"));
        bus.publish(status(false));

        // Only the QR event comes through; the status events never appear.
        assert_eq!(sub.recv().await.unwrap().kind(), EventKind::PairingQr);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_only_its_own_events() {
        let bus = Arc::new(EventBus::new());
        let mut slow = bus.subscribe(&[]);
        let mut fast = bus.subscribe(&[]);

        let total = 10_000usize;
        let mut fast_got = 0usize;
        for i in 0..total {
            bus.publish(qr(&format!("code-{i}")));
            // Drain the fast subscriber as we go so its queue never fills.
            while let Some(event) = fast.try_recv() {
                match event.payload {
                    EventPayload::PairingQr { code } => {
                        assert_eq!(code, format!("code-{fast_got}"), "order violated");
                    }
                    other => panic!("unexpected payload: {other:?}"),
                }
                fast_got += 1;
            }
        }
        while fast.try_recv().is_some() {
            fast_got += 1;
        }
        // The never-read sibling loses events; the drained one misses none.
        assert_eq!(fast_got, total);

        let mut slow_got = 0;
        while slow.try_recv().is_some() {
            slow_got += 1;
        }
        assert!(slow_got <= SUBSCRIBER_CAPACITY);
        assert!(slow_got > 0);
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe(&[EventKind::PairingQr]);

        for i in 0..SUBSCRIBER_CAPACITY {
            bus.publish(qr(&format!("{i}")));
        }
        for i in 0..SUBSCRIBER_CAPACITY {
            let event = sub.recv().await.unwrap();
            match event.payload {
                EventPayload::PairingQr { code } => assert_eq!(code, format!("{i}")),
                other => panic!("unexpected payload: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe(&[]);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(status(true));
    }
}
