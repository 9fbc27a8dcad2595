use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Query parameter that carries the pagination cursor. Never part of a filter set.
pub const PAGE_PARAM: &str = "page";

/// Locally displayed view of a cart line or product
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
  pub id: String,
  /// Displayed quantity; may be optimistic and not yet confirmed
  pub quantity: u32,
  /// Last known server-reported availability
  pub stock: u32,
  pub price: f64,
}

impl Item {
  pub fn new(id: impl Into<String>, quantity: u32, stock: u32, price: f64) -> Self {
    Self {
      id: id.into(),
      quantity,
      stock,
      price,
    }
  }

  /// Item we know nothing about yet beyond its id (first add before any fetch).
  pub fn placeholder(id: impl Into<String>) -> Self {
    Self::new(id, 0, 0, 0.0)
  }
}

/// A filter set for one list resource (products, orders, cart).
///
/// Parameters are kept sorted so two filter sets with the same pairs
/// compare equal regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filters {
  pub resource: String,
  pub params: BTreeMap<String, String>,
}

impl Filters {
  /// Resource names are trimmed and lowercased, so `"Cart"` and `"cart"`
  /// are the same resource.
  pub fn new(resource: impl Into<String>) -> Self {
    Self {
      resource: resource.into().trim().to_lowercase(),
      params: BTreeMap::new(),
    }
  }

  /// Add a parameter. The page cursor is silently ignored.
  pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.insert(key, value);
    self
  }

  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
    let key = key.into();
    if key.trim() == PAGE_PARAM {
      return;
    }
    self.params.insert(key, value.into());
  }

  /// Parse `key=value` pairs as given on a command line.
  pub fn parse_pairs<'a>(resource: &str, pairs: impl IntoIterator<Item = &'a str>) -> Self {
    let mut filters = Self::new(resource);
    for pair in pairs {
      if let Some((k, v)) = pair.split_once('=') {
        filters.insert(k, v);
      }
    }
    filters
  }
}

/// Pagination block as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pagination {
  pub current_page: u32,
  pub total_pages: u32,
  pub has_next: bool,
}

/// One page of a list response
#[derive(Debug, Clone, PartialEq)]
pub struct ListPage {
  pub items: Vec<Item>,
  pub pagination: Pagination,
}

/// Body of an order-creation write
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
  pub address_id: String,
  pub total_amount: f64,
}

/// Server acknowledgment of a created order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderConfirmation {
  pub order_id: String,
  pub total_amount: f64,
  pub placed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_page_is_never_a_filter() {
    let filters = Filters::new("products").with("brand", "x").with("page", "3");
    assert_eq!(filters.params.len(), 1);
    assert!(!filters.params.contains_key("page"));
  }

  #[test]
  fn test_parse_pairs_skips_malformed() {
    let filters = Filters::parse_pairs("products", ["brand=x", "oops", "size=L", "page=2"]);
    assert_eq!(filters.params.get("brand").map(String::as_str), Some("x"));
    assert_eq!(filters.params.get("size").map(String::as_str), Some("L"));
    assert_eq!(filters.params.len(), 2);
  }

  #[test]
  fn test_resource_name_is_normalized() {
    assert_eq!(Filters::new(" Cart ").resource, "cart");
    assert_eq!(Filters::new("Cart"), Filters::new("cart"));
  }
}
