//! Incrementally loaded, filterable lists.
//!
//! One bucket per filter set (page cursor excluded). Page 1 replaces a
//! bucket's items, later pages append whatever ids are not already present.
//! Every page-1 fetch starts a new epoch for its bucket; a response whose
//! epoch no longer matches, or whose bucket was dropped meanwhile, is stale
//! and thrown away.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::coalescer::Invalidate;
use super::error::SyncError;
use super::key::{describe, fingerprint, CacheKey};
use crate::event::{EventSender, SyncEvent};
use crate::remote::{Filters, Item, ListPage, Pagination, RemoteClient, RemoteError};

/// Read-only view of a merged list
#[derive(Debug, Clone, PartialEq)]
pub struct ListSnapshot {
  pub key: CacheKey,
  pub description: String,
  pub items: Vec<Item>,
  pub pagination: Pagination,
  pub fetching: bool,
  pub fetched_at: Option<DateTime<Utc>>,
}

struct ListCacheBucket {
  key: CacheKey,
  items: Vec<Item>,
  ids: HashSet<String>,
  pagination: Pagination,
  last_fetch_arg: Filters,
  epoch: u64,
  in_flight: u32,
  fetched_at: Option<DateTime<Utc>>,
}

impl ListCacheBucket {
  fn new(key: CacheKey, filters: &Filters, epoch: u64) -> Self {
    Self {
      key,
      items: Vec::new(),
      ids: HashSet::new(),
      pagination: Pagination::default(),
      last_fetch_arg: filters.clone(),
      epoch,
      in_flight: 0,
      fetched_at: None,
    }
  }

  fn clear(&mut self) {
    self.items.clear();
    self.ids.clear();
    self.pagination = Pagination::default();
  }

  fn merge(&mut self, page: u32, incoming: ListPage) {
    let received = incoming.items.len();

    if page == 1 {
      self.clear();
    }
    for item in incoming.items {
      if self.ids.insert(item.id.clone()) {
        self.items.push(item);
      }
    }

    self.pagination = incoming.pagination;
    if page > 1 && received == 0 {
      self.pagination.has_next = false;
    }
    self.fetched_at = Some(Utc::now());

    debug!(
      key = %self.key,
      page,
      received,
      total = self.items.len(),
      has_next = self.pagination.has_next,
      "page merged"
    );
  }

  fn snapshot(&self) -> ListSnapshot {
    ListSnapshot {
      key: self.key.clone(),
      description: describe(&self.last_fetch_arg),
      items: self.items.clone(),
      pagination: self.pagination,
      fetching: self.in_flight > 0,
      fetched_at: self.fetched_at,
    }
  }
}

#[derive(Default)]
struct MergerState {
  buckets: HashMap<CacheKey, ListCacheBucket>,
  /// Current filter set per resource
  active: HashMap<String, CacheKey>,
  next_epoch: u64,
}

impl MergerState {
  fn bump_epoch(&mut self) -> u64 {
    self.next_epoch += 1;
    self.next_epoch
  }

  /// Make `key` the current filter set of its resource, dropping the bucket
  /// of the filter set it replaces.
  fn activate(&mut self, filters: &Filters, key: &CacheKey) {
    let previous = self.active.insert(filters.resource.clone(), key.clone());
    if let Some(previous) = previous.filter(|p| p != key) {
      if self.buckets.remove(&previous).is_some() {
        info!(old = %previous, new = %key, resource = %filters.resource, "filters changed, list superseded");
      }
    }
  }
}

struct Shared<C> {
  client: Arc<C>,
  state: Mutex<MergerState>,
  events: EventSender,
}

/// Keeps one merged list per filter set.
pub struct ListCacheMerger<C: RemoteClient> {
  shared: Arc<Shared<C>>,
}

impl<C: RemoteClient> ListCacheMerger<C> {
  pub fn new(client: Arc<C>, events: EventSender) -> Self {
    Self {
      shared: Arc::new(Shared {
        client,
        state: Mutex::new(MergerState::default()),
        events,
      }),
    }
  }

  fn state(&self) -> MutexGuard<'_, MergerState> {
    self
      .shared
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn emit(&self, event: SyncEvent) {
    let _ = self.shared.events.send(event);
  }

  /// Fetch one page of a filtered list and merge it.
  ///
  /// Without a bucket for the filter set, page 1 is loaded whatever page was
  /// asked for. Page 1 always replaces the bucket's items. Any other page
  /// must be the one right after the last loaded page.
  pub async fn fetch_page(&self, filters: &Filters, page: u32) -> Result<ListSnapshot, SyncError> {
    let key = fingerprint(filters);
    let (page, epoch) = self.begin(&key, filters, page)?;

    debug!(key = %key, page, "fetching page");
    let result = self.shared.client.fetch_list(filters, page).await;

    self.finish(&key, page, epoch, result)
  }

  fn begin(&self, key: &CacheKey, filters: &Filters, requested: u32) -> Result<(u32, u64), SyncError> {
    let mut state = self.state();

    if !state.buckets.contains_key(key) {
      if requested != 1 {
        debug!(key = %key, requested, "no list cached yet, loading first page");
      }
      let epoch = state.bump_epoch();
      state.activate(filters, key);
      let mut bucket = ListCacheBucket::new(key.clone(), filters, epoch);
      bucket.in_flight = 1;
      state.buckets.insert(key.clone(), bucket);
      return Ok((1, epoch));
    }

    if requested == 1 {
      let epoch = state.bump_epoch();
      state.activate(filters, key);
      if let Some(bucket) = state.buckets.get_mut(key) {
        if bucket.last_fetch_arg != *filters {
          bucket.clear();
          bucket.last_fetch_arg = filters.clone();
        }
        bucket.epoch = epoch;
        // Responses for the old epoch no longer count
        bucket.in_flight = 1;
      }
      return Ok((1, epoch));
    }

    let Some(bucket) = state.buckets.get_mut(key) else {
      return Err(SyncError::StaleFilterFetch { key: key.clone() });
    };
    let expected = bucket.pagination.current_page + 1;
    if requested != expected {
      warn!(key = %key, expected, requested, "out of sequence page request");
      return Err(SyncError::OutOfSequencePage {
        key: key.clone(),
        expected,
        requested,
      });
    }
    bucket.in_flight += 1;
    Ok((requested, bucket.epoch))
  }

  fn finish(
    &self,
    key: &CacheKey,
    page: u32,
    epoch: u64,
    result: Result<ListPage, RemoteError>,
  ) -> Result<ListSnapshot, SyncError> {
    let snapshot = {
      let mut state = self.state();
      let bucket = state
        .buckets
        .get_mut(key)
        .filter(|bucket| bucket.epoch == epoch);

      match (bucket, result) {
        (None, _) => None,
        (Some(bucket), Err(err)) => {
          bucket.in_flight = bucket.in_flight.saturating_sub(1);
          warn!(key = %key, page, error = %err, "page fetch failed");
          return Err(err.into());
        }
        (Some(bucket), Ok(incoming)) => {
          bucket.in_flight = bucket.in_flight.saturating_sub(1);
          bucket.merge(page, incoming);
          Some(bucket.snapshot())
        }
      }
    };

    match snapshot {
      Some(snapshot) => {
        self.emit(SyncEvent::ListChanged(snapshot.clone()));
        Ok(snapshot)
      }
      None => {
        info!(key = %key, page, "discarding page for superseded filters");
        let err = SyncError::StaleFilterFetch { key: key.clone() };
        self.emit(SyncEvent::FetchDiscarded {
          key: key.clone(),
          reason: err.to_string(),
        });
        Err(err)
      }
    }
  }

  /// Load the page after the last loaded one, if the server reported more
  /// and nothing is being fetched for this list. Returns `None` when there
  /// was nothing to do.
  pub async fn next_page(&self, key: &CacheKey) -> Result<Option<ListSnapshot>, SyncError> {
    let next = {
      let state = self.state();
      match state.buckets.get(key) {
        Some(bucket) if bucket.pagination.has_next && bucket.in_flight == 0 => Some((
          bucket.last_fetch_arg.clone(),
          bucket.pagination.current_page + 1,
        )),
        _ => None,
      }
    };

    match next {
      Some((filters, page)) => self.fetch_page(&filters, page).await.map(Some),
      None => Ok(None),
    }
  }

  /// Current merged list for a key
  pub fn observe(&self, key: &CacheKey) -> Option<ListSnapshot> {
    self.state().buckets.get(key).map(ListCacheBucket::snapshot)
  }

  /// Whether the server reported another page for this list
  pub fn has_more(&self, key: &CacheKey) -> bool {
    self
      .state()
      .buckets
      .get(key)
      .map(|b| b.pagination.has_next)
      .unwrap_or(false)
  }

  pub fn is_fetching(&self, key: &CacheKey) -> bool {
    self
      .state()
      .buckets
      .get(key)
      .map(|b| b.in_flight > 0)
      .unwrap_or(false)
  }

  /// Drop a list. Fetches still in flight for it will be discarded.
  pub fn reset(&self, key: &CacheKey) {
    let mut state = self.state();
    if state.buckets.remove(key).is_some() {
      debug!(key = %key, "list reset");
    }
    state.active.retain(|_, active| active != key);
  }
}

impl<C: RemoteClient> Invalidate for ListCacheMerger<C> {
  /// Drop every list of the given resource, then reload the first page of
  /// the one currently shown for it.
  fn invalidate_tag(&self, tag: &str) {
    let (removed, current) = {
      let mut state = self.state();
      let current = state
        .active
        .remove(tag)
        .and_then(|key| state.buckets.get(&key))
        .map(|bucket| bucket.last_fetch_arg.clone());

      let keys: Vec<CacheKey> = state
        .buckets
        .values()
        .filter(|b| b.last_fetch_arg.resource == tag)
        .map(|b| b.key.clone())
        .collect();
      for key in &keys {
        state.buckets.remove(key);
      }
      (keys, current)
    };

    for key in removed {
      debug!(key = %key, tag, "list invalidated");
      self.emit(SyncEvent::ListInvalidated {
        key,
        tag: tag.to_string(),
      });
    }

    if let Some(filters) = current {
      self.spawn_refetch(filters);
    }
  }
}

impl<C: RemoteClient> ListCacheMerger<C> {
  fn spawn_refetch(&self, filters: Filters) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      warn!(resource = %filters.resource, "no runtime, invalidated list not reloaded");
      return;
    };

    let this = self.clone();
    runtime.spawn(async move {
      match this.fetch_page(&filters, 1).await {
        Ok(snapshot) => {
          info!(key = %snapshot.key, items = snapshot.items.len(), "invalidated list reloaded")
        }
        Err(e) => warn!(resource = %filters.resource, error = %e, "reload after invalidation failed"),
      }
    });
  }
}

impl<C: RemoteClient> Clone for ListCacheMerger<C> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}
