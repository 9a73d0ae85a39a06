//! "History changed" events for presentation layers.

use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Emitted after a check's history was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename = "historyUpdate")]
pub struct HistoryUpdate {
    pub service: String,
    pub check_name: String,
}

/// Best-effort broadcast of [`HistoryUpdate`]s. Slow subscribers lag and
/// drop events; the emitter never blocks.
#[derive(Clone)]
pub struct HistoryEvents {
    tx: broadcast::Sender<HistoryUpdate>,
}

impl Default for HistoryEvents {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl HistoryEvents {
    pub fn emit(&self, update: HistoryUpdate) {
        // No subscribers is fine.
        let _ = self.tx.send(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryUpdate> {
        self.tx.subscribe()
    }
}
