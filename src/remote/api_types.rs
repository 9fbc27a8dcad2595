//! Serde-deserializable types matching the storefront backend's JSON responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on what the sync layer needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Item, ListPage, OrderConfirmation, OrderRequest, Pagination};

// ============================================================================
// Lists
// ============================================================================

/// Some endpoints return a single object where a list is expected
/// (e.g. an orders page holding exactly one order).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
  Many(Vec<T>),
  One(T),
}

impl<T> OneOrMany<T> {
  pub fn into_vec(self) -> Vec<T> {
    match self {
      Self::Many(v) => v,
      Self::One(t) => vec![t],
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiListResponse {
  #[serde(default)]
  pub message: Option<String>,
  #[serde(default)]
  pub data: Option<OneOrMany<ApiItem>>,
  #[serde(default)]
  pub pagination: Option<ApiPagination>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPagination {
  #[serde(default)]
  pub page: u32,
  #[serde(default)]
  pub total_pages: u32,
  #[serde(default)]
  pub has_next: bool,
}

impl ApiListResponse {
  /// Convert to a domain page. A missing pagination block means a single,
  /// complete page. Objects without an id (e.g. `"data": {}` on an empty
  /// orders page) are not items.
  pub fn into_page(self, requested_page: u32) -> ListPage {
    let items: Vec<Item> = self
      .data
      .map(OneOrMany::into_vec)
      .unwrap_or_default()
      .into_iter()
      .map(ApiItem::into_item)
      .filter(|item| !item.id.is_empty())
      .collect();

    let pagination = match self.pagination {
      Some(p) => Pagination {
        current_page: if p.page == 0 { requested_page } else { p.page },
        total_pages: p.total_pages,
        has_next: p.has_next,
      },
      None => Pagination {
        current_page: requested_page,
        total_pages: requested_page,
        has_next: false,
      },
    };

    ListPage { items, pagination }
  }
}

// ============================================================================
// Entities
// ============================================================================

/// A product, cart line or order as the backend serializes it.
/// Cart lines nest the product; orders are keyed by `orderId`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiItem {
  #[serde(rename = "_id", alias = "id", alias = "orderId", default)]
  pub id: String,
  #[serde(default)]
  pub quantity: u32,
  #[serde(default)]
  pub stock: u32,
  #[serde(default, alias = "totalAmount")]
  pub price: f64,
  #[serde(default)]
  pub product: Option<Box<ApiItem>>,
}

impl ApiItem {
  pub fn into_item(self) -> Item {
    match self.product {
      Some(product) => Item {
        quantity: self.quantity,
        ..product.into_item()
      },
      None => Item {
        id: self.id,
        quantity: self.quantity,
        stock: self.stock,
        price: self.price,
      },
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiEntityResponse {
  pub data: ApiItem,
}

// ============================================================================
// Writes
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiQuantityBody {
  pub quantity: u32,
}

#[derive(Debug, Deserialize)]
pub struct ApiQuantityResponse {
  pub quantity: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiOrderBody {
  pub address_id: String,
  pub total_amount: f64,
}

impl From<&OrderRequest> for ApiOrderBody {
  fn from(order: &OrderRequest) -> Self {
    Self {
      address_id: order.address_id.clone(),
      total_amount: order.total_amount,
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiOrderResponse {
  pub order_id: String,
  pub total_amount: f64,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
}

impl From<ApiOrderResponse> for OrderConfirmation {
  fn from(resp: ApiOrderResponse) -> Self {
    Self {
      order_id: resp.order_id,
      total_amount: resp.total_amount,
      placed_at: resp.created_at.unwrap_or_else(Utc::now),
    }
  }
}
