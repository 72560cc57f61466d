//! Fire-and-forget outbound emission.
//!
//! Events go out after a transaction commits; a full channel or a
//! disconnected subscriber must never affect settlement, so every send
//! result is deliberately discarded.

use crate::models::WsServerEvent;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Clone)]
pub struct Notifier {
    events: broadcast::Sender<WsServerEvent>,
}

impl Notifier {
    pub fn new(events: broadcast::Sender<WsServerEvent>) -> Self {
        Self { events }
    }

    /// Best-effort event broadcast.
    pub fn broadcast(&self, event: WsServerEvent) {
        let _ = self.events.send(event);
    }

    /// Deliver a user-facing notification. Delivery transport is an
    /// external collaborator; here it is a structured log line the
    /// notification relay tails.
    pub fn notify_user(&self, user_id: i64, title: &str, body: &str) {
        debug!(user_id, title, body, "📬 notification queued");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsServerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BalanceBroadcast, WsServerEvent};

    #[test]
    fn broadcast_without_subscribers_is_silent() {
        let (tx, _) = broadcast::channel(8);
        let notifier = Notifier::new(tx);
        // No receiver attached: send fails internally and must not panic.
        notifier.broadcast(WsServerEvent::Balance(BalanceBroadcast {
            user_id: 1,
            balance_micro: 0,
            ts: 0,
        }));
    }
}
