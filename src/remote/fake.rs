//! Scripted in-memory backend for unit tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use super::client::{RemoteClient, RemoteError};
use super::types::{Filters, Item, ListPage, OrderConfirmation, OrderRequest, Pagination};

/// A recorded backend call
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
  FetchList { filters: Filters, page: u32 },
  FetchEntity(String),
  Upsert(String, u32),
  Delete(String),
  CreateOrder(f64),
}

/// Backend double that records calls, serves canned pages, and can fail or
/// hold operations open.
#[derive(Default)]
pub struct FakeRemote {
  calls: Mutex<Vec<Call>>,
  pages: Mutex<HashMap<(Filters, u32), ListPage>>,
  entities: Mutex<HashMap<String, Item>>,
  fail_writes: AtomicBool,
  fail_reads: AtomicBool,
  write_gate: Mutex<Option<Arc<Semaphore>>>,
  list_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeRemote {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }

  pub fn writes(&self) -> Vec<Call> {
    self
      .calls()
      .into_iter()
      .filter(|c| matches!(c, Call::Upsert(..) | Call::Delete(_)))
      .collect()
  }

  pub fn set_page(&self, filters: &Filters, page: u32, items: Vec<Item>, total_pages: u32) {
    let pagination = Pagination {
      current_page: page,
      total_pages,
      has_next: page < total_pages,
    };
    self
      .pages
      .lock()
      .unwrap()
      .insert((filters.clone(), page), ListPage { items, pagination });
  }

  pub fn set_entity(&self, item: Item) {
    self.entities.lock().unwrap().insert(item.id.clone(), item);
  }

  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  pub fn fail_reads(&self, fail: bool) {
    self.fail_reads.store(fail, Ordering::SeqCst);
  }

  /// Hold every subsequent write until `release_writes` hands out a permit.
  pub fn hold_writes(&self) {
    *self.write_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
  }

  pub fn release_writes(&self, n: usize) {
    if let Some(gate) = self.write_gate.lock().unwrap().as_ref() {
      gate.add_permits(n);
    }
  }

  pub fn hold_lists(&self) {
    *self.list_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
  }

  pub fn release_lists(&self, n: usize) {
    if let Some(gate) = self.list_gate.lock().unwrap().as_ref() {
      gate.add_permits(n);
    }
  }

  fn record(&self, call: Call) {
    self.calls.lock().unwrap().push(call);
  }

  async fn pass(gate: &Mutex<Option<Arc<Semaphore>>>) {
    let gate = gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      if let Ok(permit) = gate.acquire().await {
        permit.forget();
      }
    }
  }

  fn write_result(&self) -> Result<(), RemoteError> {
    if self.fail_writes.load(Ordering::SeqCst) {
      Err(RemoteError::Unavailable("scripted write failure".to_string()))
    } else {
      Ok(())
    }
  }

  fn read_result(&self) -> Result<(), RemoteError> {
    if self.fail_reads.load(Ordering::SeqCst) {
      Err(RemoteError::Unavailable("scripted read failure".to_string()))
    } else {
      Ok(())
    }
  }
}

#[async_trait]
impl RemoteClient for FakeRemote {
  async fn fetch_list(&self, filters: &Filters, page: u32) -> Result<ListPage, RemoteError> {
    self.record(Call::FetchList {
      filters: filters.clone(),
      page,
    });
    Self::pass(&self.list_gate).await;
    self.read_result()?;

    let canned = self
      .pages
      .lock()
      .unwrap()
      .get(&(filters.clone(), page))
      .cloned();
    Ok(canned.unwrap_or(ListPage {
      items: Vec::new(),
      pagination: Pagination {
        current_page: page,
        total_pages: page,
        has_next: false,
      },
    }))
  }

  async fn fetch_entity(&self, id: &str) -> Result<Item, RemoteError> {
    self.record(Call::FetchEntity(id.to_string()));
    self.read_result()?;
    self
      .entities
      .lock()
      .unwrap()
      .get(id)
      .cloned()
      .ok_or_else(|| RemoteError::Unavailable(format!("no entity {}", id)))
  }

  async fn upsert_item(&self, id: &str, quantity: u32) -> Result<u32, RemoteError> {
    self.record(Call::Upsert(id.to_string(), quantity));
    Self::pass(&self.write_gate).await;
    self.write_result()?;
    Ok(quantity)
  }

  async fn delete_item(&self, id: &str) -> Result<(), RemoteError> {
    self.record(Call::Delete(id.to_string()));
    Self::pass(&self.write_gate).await;
    self.write_result()
  }

  async fn create_order(&self, order: &OrderRequest) -> Result<OrderConfirmation, RemoteError> {
    self.record(Call::CreateOrder(order.total_amount));
    self.write_result()?;
    Ok(OrderConfirmation {
      order_id: "ord-1".to_string(),
      total_amount: order.total_amount,
      placed_at: Utc::now(),
    })
  }
}
