//! The in-process event bus.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::DomainEvent;

struct Subscriber {
    name: String,
    tx: mpsc::UnboundedSender<DomainEvent>,
}

/// Multi-producer, multi-subscriber fan-out hub for domain events.
///
/// Delivery channels are unbounded so `publish` never suspends the
/// scheduler loop. A subscriber that went away (dropped its receiver) is
/// pruned on the next publish with a warning; events it missed are gone,
/// which is fine because subscribers reconcile from the store on restart.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber and returns its delivery channel.
    pub fn subscribe(&self, name: &str) -> mpsc::UnboundedReceiver<DomainEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.push(Subscriber {
            name: name.to_string(),
            tx,
        });
        debug!(subscriber = name, "Event bus subscriber registered");
        rx
    }

    /// Publishes an event to every live subscriber.
    pub fn publish(&self, event: DomainEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| {
            if s.tx.send(event.clone()).is_err() {
                warn!(
                    subscriber = %s.name,
                    kind = %event.kind,
                    "Dropping event bus subscriber with closed channel"
                );
                false
            } else {
                true
            }
        });
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_id::AppId;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("a");
        let mut b = bus.subscribe("b");

        let app = AppId::parse("web-ops-c1").unwrap();
        bus.publish(DomainEvent::app_created(app.clone()));

        assert_eq!(a.recv().await.unwrap().app_id, app);
        assert_eq!(b.recv().await.unwrap().app_id, app);
    }

    #[tokio::test]
    async fn dead_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe("short-lived");
        let mut live = bus.subscribe("live");
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx);
        let app = AppId::parse("web-ops-c1").unwrap();
        bus.publish(DomainEvent::app_deleted(app));

        assert_eq!(bus.subscriber_count(), 1);
        assert!(live.recv().await.is_some());
    }
}
