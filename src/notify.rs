use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub publishing committed events per service center.
///
/// External collaborators (notification triggers, reporting feeds)
/// subscribe here; what they do with an event is their business. Slow
/// subscribers lag and drop, they never block a commit.
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

    /// Subscribe to a center's events. Creates the channel if needed.
    pub fn subscribe(&self, center_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(center_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish an event. No-op if nobody is listening on this center.
    pub fn send(&self, center_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&center_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a center's channel.
    #[allow(dead_code)]
    pub fn remove(&self, center_id: &Ulid) {
        self.channels.remove(center_id);
    }
}
