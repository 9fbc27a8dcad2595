//! Access to the storefront backend, the remote source of truth.

pub mod api_types;
mod client;
#[cfg(test)]
pub mod fake;
mod types;

pub use client::{HttpClient, RemoteClient, RemoteError};
pub use types::{
  Filters, Item, ListPage, OrderConfirmation, OrderRequest, Pagination, PAGE_PARAM,
};
