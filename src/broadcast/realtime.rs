/// In-process real-time hub backed by a tokio broadcast channel.
///
/// A subscriber gets its baseline snapshot first and live events after.
/// The live receiver is opened *before* the snapshot is taken, so an update
/// racing the connection can appear in both the snapshot and the stream,
/// but never only in the stream ahead of its baseline.

use tokio::sync::broadcast;

use super::{RealtimeEvent, SubscriberSet};
use crate::model::HistorySnapshot;

/// Live events buffered per subscriber before it starts lagging.
pub const DEFAULT_BUFFER: usize = 256;

pub struct RealtimeHub {
    tx: broadcast::Sender<RealtimeEvent>,
}

/// A new connection's baseline plus its live feed.
pub struct Subscription {
    pub baseline: RealtimeEvent,
    pub live: broadcast::Receiver<RealtimeEvent>,
}

impl Default for RealtimeHub {
    fn default() -> Self {
        RealtimeHub::new(DEFAULT_BUFFER)
    }
}

impl RealtimeHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        RealtimeHub { tx }
    }

    /// Registers a subscriber. `snapshot` is called after the live
    /// receiver exists.
    pub fn subscribe<F>(&self, snapshot: F) -> Subscription
    where
        F: FnOnce() -> HistorySnapshot,
    {
        let live = self.tx.subscribe();
        Subscription {
            baseline: RealtimeEvent::InitData(snapshot()),
            live,
        }
    }
}

impl SubscriberSet for RealtimeHub {
    fn broadcast(&self, event: RealtimeEvent) {
        // Err only means nobody is connected
        let _ = self.tx.send(event);
    }

    fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
