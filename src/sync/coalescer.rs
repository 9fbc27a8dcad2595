//! Debounced, optimistic quantity writes.
//!
//! Every entity has at most one pending write. Edits update the displayed
//! quantity immediately and (re)arm a per-entity timer; the write goes out
//! once the timer survives a full quiescence window. First adds and removals
//! skip the window. While a write is in flight, further edits only update the
//! desired quantity and queue one successor, so writes for a single entity
//! never overlap.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::state::{EntityPhase, Trigger};
use crate::event::{EventSender, SyncEvent};
use crate::remote::{Item, RemoteClient, RemoteError};

/// The UI surface an edit came from. Each surface has its own quiescence window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
  /// Cart line stepper
  Cart,
  /// Product detail page stepper
  Detail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceWindows {
  pub cart: Duration,
  pub detail: Duration,
}

impl DebounceWindows {
  fn for_surface(&self, surface: Surface) -> Duration {
    match surface {
      Surface::Cart => self.cart,
      Surface::Detail => self.detail,
    }
  }
}

impl Default for DebounceWindows {
  fn default() -> Self {
    Self {
      cart: Duration::from_millis(3000),
      detail: Duration::from_millis(1500),
    }
  }
}

/// Lifecycle of an entity's write slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
  /// No write has happened yet
  Idle,
  /// Timer armed, nothing sent
  Scheduled,
  InFlight,
  /// Last write was confirmed by the server
  Committed,
  /// Last write failed and was rolled back
  Failed,
}

/// How fetched server state is adopted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adopt {
  /// Only the given entities are updated
  Merge,
  /// The given entities are the complete set; settled entities missing from
  /// it are forgotten
  Replace,
}

/// Something that can drop cached lists when a write lands
pub trait Invalidate: Send + Sync {
  fn invalidate_tag(&self, tag: &str);
}

/// Lists to invalidate after every committed write
pub struct Invalidation {
  pub target: Arc<dyn Invalidate>,
  pub tag: String,
}

/// Read-only view of one entity handed to the UI
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
  pub item: Item,
  /// Last quantity the server confirmed
  pub confirmed: u32,
  pub phase: EntityPhase,
  pub write: WriteState,
  pub last_error: Option<String>,
}

struct PendingWrite {
  desired: u32,
  previous_confirmed: u32,
  state: WriteState,
  timer: Option<AbortHandle>,
  /// Identifies the armed timer; a timer whose ticket is stale does nothing
  ticket: u64,
  /// Delay to use the next time this write is armed
  delay: Duration,
  /// An edit arrived while in flight and must be written afterwards
  successor: bool,
}

impl PendingWrite {
  fn new(desired: u32, previous_confirmed: u32, delay: Duration) -> Self {
    Self {
      desired,
      previous_confirmed,
      state: WriteState::Idle,
      timer: None,
      ticket: 0,
      delay,
      successor: false,
    }
  }
}

struct Entry {
  item: Item,
  confirmed: u32,
  phase: EntityPhase,
  last_outcome: WriteState,
  last_error: Option<String>,
  pending: Option<PendingWrite>,
}

impl Entry {
  fn new(item: Item) -> Self {
    Self {
      confirmed: item.quantity,
      item,
      phase: EntityPhase::Settled,
      last_outcome: WriteState::Idle,
      last_error: None,
      pending: None,
    }
  }

  fn snapshot(&self) -> EntitySnapshot {
    EntitySnapshot {
      item: self.item.clone(),
      confirmed: self.confirmed,
      phase: self.phase,
      write: self
        .pending
        .as_ref()
        .map(|p| p.state)
        .unwrap_or(self.last_outcome),
      last_error: self.last_error.clone(),
    }
  }
}

struct Shared<C> {
  client: Arc<C>,
  windows: DebounceWindows,
  entries: Mutex<BTreeMap<String, Entry>>,
  next_ticket: AtomicU64,
  settled: Notify,
  events: EventSender,
  invalidation: Option<Invalidation>,
}

/// Coalesces per-entity quantity edits into single writes.
pub struct WriteCoalescer<C: RemoteClient> {
  shared: Arc<Shared<C>>,
}

impl<C: RemoteClient> WriteCoalescer<C> {
  pub fn new(
    client: Arc<C>,
    windows: DebounceWindows,
    events: EventSender,
    invalidation: Option<Invalidation>,
  ) -> Self {
    Self {
      shared: Arc::new(Shared {
        client,
        windows,
        entries: Mutex::new(BTreeMap::new()),
        next_ticket: AtomicU64::new(0),
        settled: Notify::new(),
        events,
        invalidation,
      }),
    }
  }

  fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
    self
      .shared
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn emit(&self, event: SyncEvent) {
    let _ = self.shared.events.send(event);
  }

  /// Change an entity's quantity. Zero removes it; going from zero to any
  /// quantity is written immediately, everything else waits for the
  /// surface's quiescence window.
  pub fn set_quantity(&self, id: &str, quantity: u32, surface: Surface) -> EntitySnapshot {
    if quantity == 0 {
      return self.delete(id);
    }

    let mut entries = self.entries();
    let entry = entries
      .entry(id.to_string())
      .or_insert_with(|| Entry::new(Item::placeholder(id)));

    let delay = if entry.item.quantity == 0 {
      Duration::ZERO
    } else {
      self.shared.windows.for_surface(surface)
    };
    self.stage(id, entry, quantity, delay);
    entry.snapshot()
  }

  /// First add of an entity: quantity 0 -> 1, written without waiting.
  /// An entity that already has a quantity is left alone.
  pub fn initial_add(&self, id: &str) -> EntitySnapshot {
    {
      let entries = self.entries();
      if let Some(entry) = entries.get(id) {
        if entry.item.quantity > 0 {
          debug!(entity = id, "initial add ignored, already present");
          return entry.snapshot();
        }
      }
    }
    self.set_quantity(id, 1, Surface::Cart)
  }

  /// Remove an entity. The displayed quantity drops to zero at once and the
  /// delete is sent without waiting, unless a write is in flight, in which
  /// case it goes out as soon as that write settles.
  pub fn delete(&self, id: &str) -> EntitySnapshot {
    let mut entries = self.entries();
    let entry = entries
      .entry(id.to_string())
      .or_insert_with(|| Entry::new(Item::placeholder(id)));
    self.stage(id, entry, 0, Duration::ZERO);
    entry.snapshot()
  }

  /// Apply an edit to the displayed value and to the entity's write slot.
  fn stage(&self, id: &str, entry: &mut Entry, desired: u32, delay: Duration) {
    entry.item.quantity = desired;
    entry.phase = entry.phase.next(if desired == 0 {
      Trigger::Remove
    } else {
      Trigger::Edit
    });

    match entry.pending.as_mut() {
      Some(pending) if pending.state == WriteState::InFlight => {
        pending.desired = desired;
        pending.delay = delay;
        pending.successor = true;
        debug!(entity = id, desired, "queued behind in-flight write");
      }
      Some(pending) => {
        pending.desired = desired;
        pending.delay = delay;
        self.arm(id, pending);
      }
      None => {
        let mut pending = PendingWrite::new(desired, entry.confirmed, delay);
        self.arm(id, &mut pending);
        entry.pending = Some(pending);
      }
    }

    self.emit(SyncEvent::EntityChanged(entry.snapshot()));
  }

  /// Cancel any armed timer and start a new one for the pending write.
  fn arm(&self, id: &str, pending: &mut PendingWrite) {
    if let Some(timer) = pending.timer.take() {
      timer.abort();
    }

    pending.ticket = self.shared.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
    pending.state = WriteState::Scheduled;

    let this = self.clone();
    let id = id.to_string();
    let ticket = pending.ticket;
    let delay = pending.delay;
    debug!(entity = %id, desired = pending.desired, ?delay, "write scheduled");

    let handle = tokio::spawn(async move {
      if !delay.is_zero() {
        tokio::time::sleep(delay).await;
      }
      this.flush(&id, ticket).await;
    });
    pending.timer = Some(handle.abort_handle());
  }

  async fn flush(&self, id: &str, ticket: u64) {
    let desired = {
      let mut entries = self.entries();
      let Some(entry) = entries.get_mut(id) else {
        return;
      };
      let Some(pending) = entry.pending.as_mut() else {
        return;
      };
      if pending.ticket != ticket || pending.state != WriteState::Scheduled {
        return;
      }

      pending.state = WriteState::InFlight;
      pending.timer = None;
      pending.successor = false;
      let desired = pending.desired;

      entry.phase = entry.phase.next(Trigger::TimerExpired);
      self.emit(SyncEvent::EntityChanged(entry.snapshot()));
      desired
    };

    debug!(entity = id, desired, "flushing write");
    let result = if desired == 0 {
      self.shared.client.delete_item(id).await.map(|()| 0)
    } else {
      self.shared.client.upsert_item(id, desired).await
    };

    self.settle(id, desired, result);
  }

  /// Apply the outcome of an in-flight write.
  fn settle(&self, id: &str, sent: u32, result: Result<u32, RemoteError>) {
    let committed = {
      let mut entries = self.entries();
      let Some(entry) = entries.get_mut(id) else {
        return;
      };
      let Some(mut pending) = entry.pending.take() else {
        return;
      };

      let committed = match result {
        Ok(confirmed) => {
          info!(entity = id, sent, confirmed, "write committed");
          entry.confirmed = confirmed;
          entry.last_outcome = WriteState::Committed;
          entry.last_error = None;

          if pending.successor && pending.desired != confirmed {
            entry.phase = entry.phase.next(Trigger::WriteSucceeded { pending: true });
            pending.previous_confirmed = confirmed;
            pending.successor = false;
            self.arm(id, &mut pending);
            entry.pending = Some(pending);
          } else {
            entry.item.quantity = confirmed;
            entry.phase = entry.phase.next(Trigger::WriteSucceeded { pending: false });
          }
          true
        }
        Err(err) => {
          warn!(entity = id, sent, error = %err, "write failed");
          entry.last_outcome = WriteState::Failed;
          entry.last_error = Some(err.to_string());

          if pending.successor && pending.desired != entry.confirmed {
            // The edit queued behind the failed write still goes out,
            // measured against what the server last confirmed
            debug!(entity = id, desired = pending.desired, "keeping queued edit after failure");
            pending.previous_confirmed = entry.confirmed;
            pending.successor = false;
            self.arm(id, &mut pending);
            entry.pending = Some(pending);
          } else {
            entry.item.quantity = pending.previous_confirmed;
            entry.phase = entry.phase.next(Trigger::WriteFailed);
            self.emit(SyncEvent::EntityChanged(entry.snapshot()));
            entry.phase = entry.phase.next(Trigger::RollbackApplied);
          }

          self.emit(SyncEvent::WriteFailed {
            entity_id: id.to_string(),
            error: err.to_string(),
          });
          false
        }
      };

      self.emit(SyncEvent::EntityChanged(entry.snapshot()));
      committed
    };

    if committed {
      if let Some(invalidation) = &self.shared.invalidation {
        invalidation.target.invalidate_tag(&invalidation.tag);
      }
    }
    self.shared.settled.notify_waiters();
  }

  /// Snapshot of one entity
  pub fn snapshot(&self, id: &str) -> Option<EntitySnapshot> {
    self.entries().get(id).map(Entry::snapshot)
  }

  /// Displayed items, excluding removed ones
  pub fn items(&self) -> Vec<Item> {
    self
      .entries()
      .values()
      .filter(|e| e.item.quantity > 0 && e.phase != EntityPhase::Deleted)
      .map(|e| e.item.clone())
      .collect()
  }

  /// Whether any entity has a write scheduled or in flight
  pub fn has_pending(&self) -> bool {
    self.entries().values().any(|e| e.pending.is_some())
  }

  /// Take server state for entities that have no pending write. Entities
  /// with a pending write only pick up stock and price so the optimistic
  /// quantity survives.
  pub fn adopt_confirmed(&self, items: &[Item], mode: Adopt) {
    let mut entries = self.entries();

    for item in items {
      self.adopt_into(&mut entries, item);
    }

    if mode == Adopt::Replace {
      let before = entries.len();
      entries.retain(|id, entry| entry.pending.is_some() || items.iter().any(|i| &i.id == id));
      let dropped = before - entries.len();
      if dropped > 0 {
        debug!(dropped, "forgot entities missing from server state");
      }
    }
  }

  /// Adopt the server state of a single entity and return its snapshot
  pub fn adopt_entity(&self, item: &Item) -> EntitySnapshot {
    let mut entries = self.entries();
    self.adopt_into(&mut entries, item)
  }

  fn adopt_into(&self, entries: &mut BTreeMap<String, Entry>, item: &Item) -> EntitySnapshot {
    let entry = entries
      .entry(item.id.clone())
      .or_insert_with(|| Entry::new(item.clone()));
    entry.item.stock = item.stock;
    entry.item.price = item.price;
    if entry.pending.is_none() {
      entry.item.quantity = item.quantity;
      entry.confirmed = item.quantity;
      entry.phase = EntityPhase::Settled;
    }

    let snapshot = entry.snapshot();
    self.emit(SyncEvent::EntityChanged(snapshot.clone()));
    snapshot
  }

  /// Send every scheduled write now and wait until no entity has a pending
  /// write.
  pub async fn flush_all(&self) {
    loop {
      let notified = self.shared.settled.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      let idle = {
        let mut entries = self.entries();
        let mut idle = true;
        for (id, entry) in entries.iter_mut() {
          if let Some(pending) = entry.pending.as_mut() {
            idle = false;
            if pending.state == WriteState::Scheduled && !pending.delay.is_zero() {
              pending.delay = Duration::ZERO;
              self.arm(id, pending);
            }
          }
        }
        idle
      };

      if idle {
        return;
      }
      notified.await;
    }
  }
}

impl<C: RemoteClient> Clone for WriteCoalescer<C> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}
