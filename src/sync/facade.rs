//! The operation set the UI binds to.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use super::coalescer::{
  Adopt, DebounceWindows, EntitySnapshot, Invalidate, Invalidation, Surface, WriteCoalescer,
};
use super::error::SyncError;
use super::key::{fingerprint, CacheKey};
use super::merger::{ListCacheMerger, ListSnapshot};
use super::reconcile::{ReconciliationResult, ReconciliationValidator};
use crate::event::EventSender;
use crate::pricing::{self, CartTotals, PricingConfig};
use crate::remote::{Filters, Item, OrderConfirmation, OrderRequest, RemoteClient};

/// Resource holding the user's cart
pub const CART: &str = "cart";
pub const ORDERS: &str = "orders";
pub const PRODUCTS: &str = "products";

/// A successfully placed order
#[derive(Debug, Clone)]
pub struct CheckoutReceipt {
  pub order: OrderConfirmation,
  pub totals: CartTotals,
  pub reconciliation: ReconciliationResult,
}

/// Entry point for UI components: quantity edits, list loading and checkout.
pub struct SyncFacade<C: RemoteClient> {
  client: Arc<C>,
  lists: ListCacheMerger<C>,
  writes: WriteCoalescer<C>,
  validator: ReconciliationValidator<C>,
  cart: Filters,
  pricing: PricingConfig,
}

impl<C: RemoteClient> SyncFacade<C> {
  pub fn new(
    client: Arc<C>,
    windows: DebounceWindows,
    pricing: PricingConfig,
    events: EventSender,
  ) -> Self {
    let cart = Filters::new(CART);
    let lists = ListCacheMerger::new(client.clone(), events.clone());
    let writes = WriteCoalescer::new(
      client.clone(),
      windows,
      events,
      Some(Invalidation {
        target: Arc::new(lists.clone()),
        tag: CART.to_string(),
      }),
    );
    let validator = ReconciliationValidator::new(client.clone(), cart.clone());

    Self {
      client,
      lists,
      writes,
      validator,
      cart,
      pricing,
    }
  }

  // ==========================================================================
  // Quantities
  // ==========================================================================

  /// One more of an entity. The first one is written immediately.
  pub fn increase(&self, id: &str) -> EntitySnapshot {
    match self.quantity_of(id) {
      0 => self.writes.initial_add(id),
      current => self.writes.set_quantity(id, current + 1, Surface::Cart),
    }
  }

  /// One less of an entity; reaching zero removes it. `None` when there was
  /// nothing to decrease.
  pub fn decrease(&self, id: &str) -> Option<EntitySnapshot> {
    match self.quantity_of(id) {
      0 => None,
      current => Some(self.writes.set_quantity(id, current - 1, Surface::Cart)),
    }
  }

  pub fn remove(&self, id: &str) -> EntitySnapshot {
    self.writes.delete(id)
  }

  pub fn set_quantity(&self, id: &str, quantity: u32) -> EntitySnapshot {
    self.writes.set_quantity(id, quantity, Surface::Cart)
  }

  /// Quantity edit from a specific surface (e.g. the product detail stepper)
  pub fn set_quantity_on(&self, surface: Surface, id: &str, quantity: u32) -> EntitySnapshot {
    self.writes.set_quantity(id, quantity, surface)
  }

  pub fn observe_entity(&self, id: &str) -> Option<EntitySnapshot> {
    self.writes.snapshot(id)
  }

  fn quantity_of(&self, id: &str) -> u32 {
    self
      .writes
      .snapshot(id)
      .map(|s| s.item.quantity)
      .unwrap_or(0)
  }

  /// Send every pending write now and wait for all of them to settle
  pub async fn flush(&self) {
    self.writes.flush_all().await;
  }

  // ==========================================================================
  // Lists
  // ==========================================================================

  /// Fetch one page of a filtered list. Cart pages also refresh the
  /// confirmed quantities of cart entities.
  pub async fn fetch_page(&self, filters: &Filters, page: u32) -> Result<ListSnapshot, SyncError> {
    let snapshot = self.lists.fetch_page(filters, page).await?;
    self.adopt_if_cart(filters, &snapshot);
    Ok(snapshot)
  }

  /// Load the next page of a list when the server has more and nothing is
  /// already being fetched for it.
  pub async fn load_next_page(&self, key: &CacheKey) -> Result<Option<ListSnapshot>, SyncError> {
    let snapshot = self.lists.next_page(key).await?;
    if let Some(snapshot) = &snapshot {
      if self.is_cart(key) {
        self.writes.adopt_confirmed(&snapshot.items, Adopt::Merge);
      }
    }
    Ok(snapshot)
  }

  /// Cache key a filter set's list is stored under
  pub fn key_for(&self, filters: &Filters) -> CacheKey {
    fingerprint(filters)
  }

  pub fn observe(&self, key: &CacheKey) -> Option<ListSnapshot> {
    self.lists.observe(key)
  }

  pub fn has_more(&self, key: &CacheKey) -> bool {
    self.lists.has_more(key)
  }

  pub fn is_fetching(&self, key: &CacheKey) -> bool {
    self.lists.is_fetching(key)
  }

  pub fn reset(&self, key: &CacheKey) {
    self.lists.reset(key);
  }

  /// Reload the whole cart from the server
  pub async fn refresh_cart(&self) -> Result<ListSnapshot, SyncError> {
    let mut snapshot = match self.fetch_page(&self.cart, 1).await {
      // A reload after invalidation overtook this fetch; ask again
      Err(SyncError::StaleFilterFetch { .. }) => self.fetch_page(&self.cart, 1).await?,
      other => other?,
    };
    while let Some(next) = self.load_next_page(&snapshot.key).await? {
      snapshot = next;
    }
    Ok(snapshot)
  }

  /// Fetch one entity and adopt its server state
  pub async fn refresh_entity(&self, id: &str) -> Result<EntitySnapshot, SyncError> {
    let item = self.client.fetch_entity(id).await?;
    Ok(self.writes.adopt_entity(&item))
  }

  /// Refresh several entities concurrently. Failures are logged and skipped.
  pub async fn refresh_entities(&self, ids: &[String]) -> Vec<EntitySnapshot> {
    let results = join_all(ids.iter().map(|id| self.refresh_entity(id))).await;
    results
      .into_iter()
      .zip(ids)
      .filter_map(|(result, id)| match result {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
          warn!(entity = %id, error = %e, "entity refresh failed");
          None
        }
      })
      .collect()
  }

  fn is_cart(&self, key: &CacheKey) -> bool {
    *key == fingerprint(&self.cart)
  }

  fn adopt_if_cart(&self, filters: &Filters, snapshot: &ListSnapshot) {
    if filters.resource != CART {
      return;
    }
    let mode = if snapshot.pagination.has_next {
      Adopt::Merge
    } else {
      Adopt::Replace
    };
    self.writes.adopt_confirmed(&snapshot.items, mode);
  }

  // ==========================================================================
  // Cart and checkout
  // ==========================================================================

  /// Cart lines as currently displayed, optimistic quantities included
  pub fn cart_items(&self) -> Vec<Item> {
    self.writes.items()
  }

  pub fn totals(&self) -> CartTotals {
    pricing::totals(&self.cart_items(), &self.pricing)
  }

  /// Flush pending edits, validate the cart against server stock and, when
  /// nothing conflicts, place the order.
  ///
  /// On a stock conflict nothing is written; the error carries the
  /// canonical cart, which has already been adopted for display.
  pub async fn commit_checkout(&self, address_id: &str) -> Result<CheckoutReceipt, SyncError> {
    self.writes.flush_all().await;

    let local = self.writes.items();
    let reconciliation = self.validator.reconcile(&local).await?;
    self
      .writes
      .adopt_confirmed(&reconciliation.canonical_items, Adopt::Replace);

    if !reconciliation.is_clean() {
      warn!(
        out_of_stock = ?reconciliation.out_of_stock,
        over_quantity = ?reconciliation.over_quantity,
        "checkout refused"
      );
      return Err(SyncError::StockConflict(Box::new(reconciliation)));
    }

    let totals = pricing::totals(&reconciliation.canonical_items, &self.pricing);
    let order = self
      .client
      .create_order(&OrderRequest {
        address_id: address_id.to_string(),
        total_amount: totals.total,
      })
      .await?;
    info!(order = %order.order_id, total = totals.total, "order placed");

    for tag in [CART, ORDERS, PRODUCTS] {
      self.lists.invalidate_tag(tag);
    }
    self.writes.adopt_confirmed(&[], Adopt::Replace);

    Ok(CheckoutReceipt {
      order,
      totals,
      reconciliation,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event::{EventHandler, SyncEvent};
  use crate::remote::fake::{Call, FakeRemote};
  use crate::sync::state::EntityPhase;
  use std::time::Duration;

  fn setup() -> (Arc<FakeRemote>, SyncFacade<FakeRemote>, EventHandler) {
    let remote = FakeRemote::new();
    let events = EventHandler::new();
    let facade = SyncFacade::new(
      remote.clone(),
      DebounceWindows::default(),
      PricingConfig::default(),
      events.sender(),
    );
    (remote, facade, events)
  }

  fn cart() -> Filters {
    Filters::new(CART)
  }

  async fn settle() {
    for _ in 0..10 {
      tokio::task::yield_now().await;
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_three_clicks_one_write() {
    let (remote, facade, _events) = setup();
    remote.set_page(&cart(), 1, vec![Item::new("a", 1, 10, 100.0)], 1);
    facade.refresh_cart().await.unwrap();

    for expected in 2..=4 {
      facade.increase("a");
      assert_eq!(facade.observe_entity("a").unwrap().item.quantity, expected);
      tokio::time::sleep(Duration::from_millis(400)).await;
    }
    assert!(remote.writes().is_empty());

    tokio::time::sleep(Duration::from_millis(3100)).await;
    assert_eq!(remote.writes(), vec![Call::Upsert("a".to_string(), 4)]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_committed_write_reloads_cart_list() {
    let (remote, facade, mut events) = setup();
    remote.set_page(&cart(), 1, vec![Item::new("a", 1, 10, 100.0)], 1);
    let snapshot = facade.refresh_cart().await.unwrap();

    facade.increase("a");
    remote.set_page(&cart(), 1, vec![Item::new("a", 2, 10, 100.0)], 1);
    tokio::time::sleep(Duration::from_millis(3100)).await;

    let reloaded = facade.observe(&snapshot.key).unwrap();
    assert_eq!(reloaded.items, vec![Item::new("a", 2, 10, 100.0)]);
    let list_fetches = remote
      .calls()
      .iter()
      .filter(|c| matches!(c, Call::FetchList { .. }))
      .count();
    assert_eq!(list_fetches, 2);
    assert!(events
      .drain()
      .iter()
      .any(|e| matches!(e, SyncEvent::ListInvalidated { tag, .. } if tag == CART)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_decrease_to_zero_removes() {
    let (remote, facade, _events) = setup();
    remote.set_page(&cart(), 1, vec![Item::new("a", 1, 10, 100.0)], 1);
    facade.refresh_cart().await.unwrap();

    let snap = facade.decrease("a").unwrap();
    assert_eq!(snap.phase, EntityPhase::Deleted);
    settle().await;
    assert_eq!(remote.writes(), vec![Call::Delete("a".to_string())]);

    assert!(facade.decrease("a").is_none());
    assert!(facade.decrease("unknown").is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_increase_unknown_is_first_add() {
    let (remote, facade, _events) = setup();

    facade.increase("new");
    settle().await;
    assert_eq!(remote.writes(), vec![Call::Upsert("new".to_string(), 1)]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_totals_follow_optimistic_quantities() {
    let (remote, facade, _events) = setup();
    remote.set_page(&cart(), 1, vec![Item::new("a", 1, 10, 100.0)], 1);
    facade.refresh_cart().await.unwrap();

    facade.increase("a");
    let totals = facade.totals();
    assert_eq!(totals.subtotal, 200.0);
    assert_eq!(totals.total, 175.98);
  }

  #[tokio::test(start_paused = true)]
  async fn test_checkout_refused_on_stock_conflict() {
    let (remote, facade, _events) = setup();
    remote.set_page(
      &cart(),
      1,
      vec![Item::new("a", 2, 5, 10.0), Item::new("b", 3, 5, 10.0)],
      1,
    );
    facade.refresh_cart().await.unwrap();

    // Stock changed on the server since the cart was loaded
    remote.set_page(
      &cart(),
      1,
      vec![Item::new("a", 2, 0, 10.0), Item::new("b", 3, 1, 10.0)],
      1,
    );

    let err = facade.commit_checkout("addr-1").await.unwrap_err();
    let result = match err {
      SyncError::StockConflict(result) => result,
      other => panic!("expected stock conflict, got {:?}", other),
    };
    assert!(result.out_of_stock.contains("a"));
    assert!(result.over_quantity.contains("b"));
    assert!(!remote
      .calls()
      .iter()
      .any(|c| matches!(c, Call::CreateOrder(_))));

    // UI now shows the canonical stock
    assert_eq!(facade.observe_entity("a").unwrap().item.stock, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_checkout_flushes_then_orders() {
    let (remote, facade, mut events) = setup();
    remote.set_page(&cart(), 1, vec![Item::new("a", 1, 10, 100.0)], 1);
    let cart_snapshot = facade.refresh_cart().await.unwrap();

    facade.increase("a");
    // The server reflects the flushed write by the time it is reconciled
    remote.set_page(&cart(), 1, vec![Item::new("a", 2, 10, 100.0)], 1);

    let receipt = facade.commit_checkout("addr-1").await.unwrap();

    assert_eq!(receipt.order.order_id, "ord-1");
    assert_eq!(receipt.totals.total, 175.98);
    let calls = remote.calls();
    let upsert = calls
      .iter()
      .position(|c| *c == Call::Upsert("a".to_string(), 2))
      .unwrap();
    let order = calls
      .iter()
      .position(|c| matches!(c, Call::CreateOrder(_)))
      .unwrap();
    assert!(upsert < order);
    assert_eq!(calls[order], Call::CreateOrder(175.98));

    assert!(facade.cart_items().is_empty());
    assert!(events
      .drain()
      .iter()
      .any(|e| matches!(e, SyncEvent::ListInvalidated { tag, .. } if tag == CART)));

    // The invalidated cart list comes back from the server
    settle().await;
    assert!(facade.observe(&cart_snapshot.key).is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_product_pages_through_facade() {
    let (remote, facade, _events) = setup();
    let filters = Filters::new(PRODUCTS).with("brand", "X");
    remote.set_page(&filters, 1, vec![Item::new("p1", 0, 3, 1.0)], 2);
    remote.set_page(&filters, 2, vec![Item::new("p2", 0, 3, 1.0)], 2);

    let first = facade.fetch_page(&filters, 1).await.unwrap();
    assert!(facade.has_more(&first.key));
    let second = facade.load_next_page(&first.key).await.unwrap().unwrap();
    assert_eq!(second.items.len(), 2);
    assert!(facade.load_next_page(&first.key).await.unwrap().is_none());

    // Product lists never touch cart quantities
    assert!(facade.cart_items().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_refresh_entity_adopts_stock() {
    let (remote, facade, _events) = setup();
    remote.set_entity(Item::new("a", 1, 7, 12.5));
    remote.set_entity(Item::new("b", 2, 1, 3.0));

    let snap = facade.refresh_entity("a").await.unwrap();
    assert_eq!(snap.item.stock, 7);
    assert_eq!(snap.phase, EntityPhase::Settled);

    let ids = vec!["a".to_string(), "missing".to_string(), "b".to_string()];
    let snaps = facade.refresh_entities(&ids).await;
    assert_eq!(snaps.len(), 2);
  }
}
