use tokio::sync::mpsc;

use crate::sync::{CacheKey, EntitySnapshot, ListSnapshot};

/// Notifications from the sync layer to whatever renders it
#[derive(Debug, Clone)]
pub enum SyncEvent {
  /// An entity's displayed quantity or phase changed
  EntityChanged(EntitySnapshot),
  /// A write was rolled back; the user may retry the same mutation
  WriteFailed { entity_id: String, error: String },
  /// A page was merged into a list
  ListChanged(ListSnapshot),
  /// A fetched page was thrown away instead of merged
  FetchDiscarded { key: CacheKey, reason: String },
  /// A list was dropped because a write affected its resource
  ListInvalidated { key: CacheKey, tag: String },
}

pub type EventSender = mpsc::UnboundedSender<SyncEvent>;

/// Owns the receiving end of the sync event channel
pub struct EventHandler {
  tx: EventSender,
  rx: mpsc::UnboundedReceiver<SyncEvent>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Sender to hand to the sync components
  pub fn sender(&self) -> EventSender {
    self.tx.clone()
  }

  /// Take every event that is already queued, without waiting
  pub fn drain(&mut self) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = self.rx.try_recv() {
      events.push(event);
    }
    events
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}
