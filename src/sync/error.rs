use thiserror::Error;

use super::key::CacheKey;
use super::reconcile::ReconciliationResult;
use crate::remote::RemoteError;

/// Failures of the sync layer.
///
/// Only `StockConflict` is meant to block the user; every other variant is
/// reported after local state has already been restored.
#[derive(Debug, Error)]
pub enum SyncError {
  /// A write or read did not complete. Writes have been rolled back.
  #[error("network failure: {0}")]
  NetworkFailure(#[from] RemoteError),

  /// The filter set changed while this fetch was in flight; its page was discarded
  #[error("fetch for {key} was superseded before it completed")]
  StaleFilterFetch { key: CacheKey },

  /// The requested page does not extend the bucket's loaded frontier
  #[error("page {requested} requested for {key}, next loadable page is {expected}")]
  OutOfSequencePage {
    key: CacheKey,
    expected: u32,
    requested: u32,
  },

  /// Checkout refused: server stock no longer covers the cart
  #[error(
    "stock conflict: {} out of stock, {} over available quantity",
    .0.out_of_stock.len(),
    .0.over_quantity.len()
  )]
  StockConflict(Box<ReconciliationResult>),
}
