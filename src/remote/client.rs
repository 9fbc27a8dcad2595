use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::BackendConfig;

use super::api_types::{
  ApiEntityResponse, ApiListResponse, ApiOrderBody, ApiOrderResponse, ApiQuantityBody,
  ApiQuantityResponse,
};
use super::types::{Filters, Item, ListPage, OrderConfirmation, OrderRequest, PAGE_PARAM};

/// A failed request/response exchange with the backend.
#[derive(Debug, Error)]
pub enum RemoteError {
  #[error("request failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error("server answered {status}: {body}")]
  Status { status: StatusCode, body: String },

  #[error("invalid backend url: {0}")]
  Url(#[from] url::ParseError),

  #[error("backend unavailable: {0}")]
  Unavailable(String),
}

/// The remote source of truth the sync layer reads from and writes to.
///
/// Each call is a single request/response exchange; implementations never
/// retry on their own.
#[async_trait]
pub trait RemoteClient: Send + Sync + 'static {
  /// Fetch one page of a filtered list
  async fn fetch_list(&self, filters: &Filters, page: u32) -> Result<ListPage, RemoteError>;

  /// Fetch a single entity by id
  async fn fetch_entity(&self, id: &str) -> Result<Item, RemoteError>;

  /// Set the quantity of a cart line, returning the quantity the server kept
  async fn upsert_item(&self, id: &str, quantity: u32) -> Result<u32, RemoteError>;

  /// Remove a cart line. Idempotent.
  async fn delete_item(&self, id: &str) -> Result<(), RemoteError>;

  /// Create an order from the server-side cart
  async fn create_order(&self, order: &OrderRequest) -> Result<OrderConfirmation, RemoteError>;
}

/// JSON-over-HTTP client for the storefront backend
#[derive(Clone)]
pub struct HttpClient {
  http: reqwest::Client,
  base: Url,
}

impl HttpClient {
  pub fn new(config: &BackendConfig) -> Result<Self, RemoteError> {
    let base = Url::parse(&config.url)?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()?;

    Ok(Self { http, base })
  }

  /// Base url with `segments` appended, each one percent-encoded as a single
  /// path segment.
  fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| RemoteError::Unavailable(format!("{} cannot take a path", self.base)))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  async fn send_raw(
    &self,
    method: Method,
    url: Url,
    body: Option<serde_json::Value>,
  ) -> Result<reqwest::Response, RemoteError> {
    debug!(%method, %url, "backend request");

    let mut request = self.http.request(method, url);
    if let Some(body) = body {
      request = request.json(&body);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(RemoteError::Status { status, body });
    }

    Ok(response)
  }

  async fn send<T: DeserializeOwned>(
    &self,
    method: Method,
    url: Url,
    body: Option<serde_json::Value>,
  ) -> Result<T, RemoteError> {
    let response = self.send_raw(method, url, body).await?;
    Ok(response.json::<T>().await?)
  }

  fn to_json(value: impl serde::Serialize) -> Result<serde_json::Value, RemoteError> {
    serde_json::to_value(value).map_err(|e| RemoteError::Unavailable(e.to_string()))
  }
}

#[async_trait]
impl RemoteClient for HttpClient {
  async fn fetch_list(&self, filters: &Filters, page: u32) -> Result<ListPage, RemoteError> {
    let mut url = self.endpoint(&[&filters.resource])?;
    {
      let mut query = url.query_pairs_mut();
      for (k, v) in &filters.params {
        query.append_pair(k, v);
      }
      query.append_pair(PAGE_PARAM, &page.to_string());
    }

    let response: ApiListResponse = self.send(Method::GET, url, None).await?;
    if let Some(message) = &response.message {
      debug!(resource = %filters.resource, page, message, "list response");
    }
    Ok(response.into_page(page))
  }

  async fn fetch_entity(&self, id: &str) -> Result<Item, RemoteError> {
    let url = self.endpoint(&["products", id])?;
    let response: ApiEntityResponse = self.send(Method::GET, url, None).await?;
    Ok(response.data.into_item())
  }

  async fn upsert_item(&self, id: &str, quantity: u32) -> Result<u32, RemoteError> {
    let url = self.endpoint(&["cart", id])?;
    let body = Self::to_json(ApiQuantityBody { quantity })?;
    let response: ApiQuantityResponse = self.send(Method::PUT, url, Some(body)).await?;
    Ok(response.quantity)
  }

  async fn delete_item(&self, id: &str) -> Result<(), RemoteError> {
    let url = self.endpoint(&["cart", id])?;
    // 204 or a JSON acknowledgment; either way the body carries nothing we need
    self.send_raw(Method::DELETE, url, None).await?;
    Ok(())
  }

  async fn create_order(&self, order: &OrderRequest) -> Result<OrderConfirmation, RemoteError> {
    let url = self.endpoint(&["orders"])?;
    let body = Self::to_json(ApiOrderBody::from(order))?;
    let response: ApiOrderResponse = self.send(Method::POST, url, Some(body)).await?;
    Ok(response.into())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn backend(url: &str) -> BackendConfig {
    BackendConfig {
      url: url.to_string(),
      timeout_secs: 5,
    }
  }

  #[test]
  fn test_endpoint_keeps_base_path() {
    let client = HttpClient::new(&backend("http://localhost:5000/api")).unwrap();
    let url = client.endpoint(&["cart", "42"]).unwrap();
    assert_eq!(url.as_str(), "http://localhost:5000/api/cart/42");
  }

  #[test]
  fn test_entity_id_is_one_encoded_segment() {
    let client = HttpClient::new(&backend("http://localhost:5000/api/")).unwrap();
    let url = client.endpoint(&["cart", "a/b?c#d"]).unwrap();
    assert_eq!(url.as_str(), "http://localhost:5000/api/cart/a%2Fb%3Fc%23d");
    assert_eq!(url.path_segments().unwrap().last(), Some("a%2Fb%3Fc%23d"));
    assert!(url.query().is_none());
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(matches!(
      HttpClient::new(&backend("not a url")),
      Err(RemoteError::Url(_))
    ));
  }
}
