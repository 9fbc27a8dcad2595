//! Stock validation against the server right before checkout.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::SyncError;
use crate::remote::{Filters, Item, RemoteClient, RemoteError};

/// Outcome of comparing local quantities with the server's cart
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationResult {
  /// Items the server no longer has in stock
  pub out_of_stock: BTreeSet<String>,
  /// Items whose locally desired quantity exceeds the available stock
  pub over_quantity: BTreeSet<String>,
  /// The server's cart, to resynchronize the UI whatever the outcome
  pub canonical_items: Vec<Item>,
}

impl ReconciliationResult {
  pub fn is_clean(&self) -> bool {
    self.out_of_stock.is_empty() && self.over_quantity.is_empty()
  }
}

/// Compare locally desired quantities with canonical server state.
///
/// An out-of-stock item is reported only as out of stock. Items the caller
/// does not hold locally are checked with the server's own quantity.
pub fn compare(local: &[Item], canonical: Vec<Item>) -> ReconciliationResult {
  let desired: HashMap<&str, u32> = local
    .iter()
    .map(|item| (item.id.as_str(), item.quantity))
    .collect();

  let mut out_of_stock = BTreeSet::new();
  let mut over_quantity = BTreeSet::new();

  for item in &canonical {
    let quantity = desired
      .get(item.id.as_str())
      .copied()
      .unwrap_or(item.quantity);

    if item.stock == 0 {
      out_of_stock.insert(item.id.clone());
    } else if quantity > item.stock {
      over_quantity.insert(item.id.clone());
    }
  }

  ReconciliationResult {
    out_of_stock,
    over_quantity,
    canonical_items: canonical,
  }
}

/// Refetches the authoritative cart and checks it against local quantities.
pub struct ReconciliationValidator<C: RemoteClient> {
  client: Arc<C>,
  source: Filters,
}

impl<C: RemoteClient> ReconciliationValidator<C> {
  /// `source` names the list holding the authoritative cart
  pub fn new(client: Arc<C>, source: Filters) -> Self {
    Self { client, source }
  }

  pub async fn reconcile(&self, local: &[Item]) -> Result<ReconciliationResult, SyncError> {
    let canonical = self.fetch_all().await?;
    let result = compare(local, canonical);

    info!(
      items = result.canonical_items.len(),
      out_of_stock = result.out_of_stock.len(),
      over_quantity = result.over_quantity.len(),
      "reconciled against server"
    );
    Ok(result)
  }

  /// Every page of the source list, in server order
  async fn fetch_all(&self) -> Result<Vec<Item>, RemoteError> {
    let mut all_items = Vec::new();
    let mut seen = HashSet::new();
    let mut page = 1u32;

    loop {
      let response = self.client.fetch_list(&self.source, page).await?;
      let received = response.items.len();

      for item in response.items {
        if seen.insert(item.id.clone()) {
          all_items.push(item);
        }
      }

      // An empty page ends the list even if the server claims otherwise
      if !response.pagination.has_next || received == 0 {
        break;
      }
      page += 1;
    }

    debug!(pages = page, items = all_items.len(), "fetched canonical list");
    Ok(all_items)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::fake::FakeRemote;

  #[test]
  fn test_zero_stock_is_out_of_stock_only() {
    let local = vec![Item::new("a", 2, 5, 10.0)];
    let canonical = vec![Item::new("a", 2, 0, 10.0)];

    let result = compare(&local, canonical);

    assert!(result.out_of_stock.contains("a"));
    assert!(result.over_quantity.is_empty());
    assert!(!result.is_clean());
  }

  #[test]
  fn test_quantity_over_stock() {
    let local = vec![Item::new("a", 3, 5, 10.0)];
    let canonical = vec![Item::new("a", 1, 1, 10.0)];

    let result = compare(&local, canonical);

    assert!(result.out_of_stock.is_empty());
    assert_eq!(result.over_quantity.iter().collect::<Vec<_>>(), vec!["a"]);
  }

  #[test]
  fn test_local_quantity_wins_over_server_quantity() {
    // The server still has 1 but the user wants 4 of a 3-stock item
    let local = vec![Item::new("a", 4, 3, 10.0)];
    let canonical = vec![Item::new("a", 1, 3, 10.0), Item::new("b", 2, 2, 1.0)];

    let result = compare(&local, canonical.clone());

    assert_eq!(result.over_quantity.len(), 1);
    assert!(result.over_quantity.contains("a"));
    assert_eq!(result.canonical_items, canonical);
  }

  #[test]
  fn test_clean_cart() {
    let local = vec![Item::new("a", 2, 5, 10.0)];
    let result = compare(&local, vec![Item::new("a", 2, 2, 10.0)]);
    assert!(result.is_clean());
  }

  #[tokio::test]
  async fn test_reconcile_reads_every_page() {
    let remote = FakeRemote::new();
    let cart = Filters::new("cart");
    remote.set_page(&cart, 1, vec![Item::new("a", 1, 0, 10.0)], 2);
    remote.set_page(&cart, 2, vec![Item::new("b", 3, 1, 5.0)], 2);
    let validator = ReconciliationValidator::new(remote.clone(), cart);

    let result = validator.reconcile(&[]).await.unwrap();

    assert_eq!(result.canonical_items.len(), 2);
    assert!(result.out_of_stock.contains("a"));
    assert!(result.over_quantity.contains("b"));
  }

  #[tokio::test]
  async fn test_reconcile_propagates_network_failure() {
    let remote = FakeRemote::new();
    remote.fail_reads(true);
    let validator = ReconciliationValidator::new(remote, Filters::new("cart"));

    let err = validator.reconcile(&[]).await.unwrap_err();
    assert!(matches!(err, SyncError::NetworkFailure(_)));
  }
}
