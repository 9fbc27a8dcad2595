//! Stable cache keys for filter sets.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::remote::{Filters, PAGE_PARAM};

/// Identifies one logical list: a resource plus every query parameter except
/// the page cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // Short form is plenty for logs
    f.write_str(&self.0[..self.0.len().min(12)])
  }
}

/// Compute the cache key for a filter set.
pub fn fingerprint(filters: &Filters) -> CacheKey {
  let mut hasher = Sha256::new();
  hasher.update(canonical_form(filters).as_bytes());
  CacheKey(hex::encode(hasher.finalize()))
}

/// Human readable description of a filter set, for logs and the CLI.
pub fn describe(filters: &Filters) -> String {
  if filters.params.is_empty() {
    format!("all {}", filters.resource)
  } else {
    let pairs: Vec<String> = filters
      .params
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect();
    format!("{} [{}]", filters.resource, pairs.join(", "))
  }
}

/// `resource(k1=v1&k2=v2)` with keys trimmed and lowercased, values trimmed,
/// and pairs sorted by key.
fn canonical_form(filters: &Filters) -> String {
  let mut pairs: Vec<(String, String)> = filters
    .params
    .iter()
    .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
    .filter(|(k, _)| k != PAGE_PARAM)
    .collect();
  pairs.sort();

  let query: Vec<String> = pairs
    .into_iter()
    .map(|(k, v)| format!("{}={}", k, v))
    .collect();
  format!(
    "{}({})",
    filters.resource.trim().to_lowercase(),
    query.join("&")
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_page_does_not_change_key() {
    let mut with_page = Filters::new("products").with("brand", "X");
    with_page.params.insert("page".to_string(), "4".to_string());
    let without = Filters::new("products").with("brand", "X");

    assert_eq!(fingerprint(&with_page), fingerprint(&without));
  }

  #[test]
  fn test_different_filters_different_keys() {
    let x = Filters::new("products").with("brand", "X");
    let y = Filters::new("products").with("brand", "Y");
    let orders = Filters::new("orders").with("brand", "X");

    assert_ne!(fingerprint(&x), fingerprint(&y));
    assert_ne!(fingerprint(&x), fingerprint(&orders));
  }

  #[test]
  fn test_key_normalization() {
    let a = Filters::new("Products").with(" Brand", "X ");
    let b = Filters::new("products").with("brand", "X");
    assert_eq!(fingerprint(&a), fingerprint(&b));
  }

  #[test]
  fn test_key_is_hex_sha256() {
    let key = fingerprint(&Filters::new("orders"));
    assert_eq!(key.0.len(), 64);
    assert_eq!(key.to_string().len(), 12);
  }

  #[test]
  fn test_describe() {
    assert_eq!(describe(&Filters::new("orders")), "all orders");
    assert_eq!(
      describe(&Filters::new("products").with("brand", "X").with("size", "L")),
      "products [brand=X, size=L]"
    );
  }
}
