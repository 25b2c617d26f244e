//! Fire-and-forget event broadcast.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Topic published when an image build job finishes.
pub const BUILD_FINISHED: &str = "build.finished";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
}

pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, payload: serde_json::Value);
}

/// In-process bus on a tokio broadcast channel. Publishing with no
/// subscribers drops the event.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, topic: &str, payload: serde_json::Value) {
        let _ = self.tx.send(Event {
            topic: topic.to_string(),
            payload,
        });
    }
}
