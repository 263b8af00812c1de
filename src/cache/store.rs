//! In-memory query cache keyed by [`QueryKey`].

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::key::{QueryKey, Resource};
use super::traits::Cacheable;

/// Ordered page of records plus the server-side total.
///
/// Invariant: `items.len() <= total`.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionResult<T> {
  pub items: Vec<T>,
  pub total: u64,
}

impl<T> CollectionResult<T> {
  /// Build a collection, raising `total` if it undercounts `items`.
  pub fn new(items: Vec<T>, total: u64) -> Self {
    let total = total.max(items.len() as u64);
    Self { items, total }
  }

  /// Collection holding exactly one record.
  pub fn single(item: T) -> Self {
    Self {
      items: vec![item],
      total: 1,
    }
  }

  pub fn empty() -> Self {
    Self {
      items: Vec::new(),
      total: 0,
    }
  }
}

/// A cached fetch result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub data: CollectionResult<T>,
  pub fetched_at: DateTime<Utc>,
  /// Set by invalidation; data is kept and served until a refetch lands
  pub stale: bool,
}

impl<T: Cacheable> CacheEntry<T> {
  /// A freshly fetched entry.
  pub fn fresh(data: CollectionResult<T>) -> Self {
    Self {
      data,
      fetched_at: Utc::now(),
      stale: false,
    }
  }

  pub fn contains(&self, id: i64) -> bool {
    self.data.items.iter().any(|item| item.cache_id() == id)
  }

  fn contains_any(&self, ids: &BTreeSet<i64>) -> bool {
    self
      .data
      .items
      .iter()
      .any(|item| ids.contains(&item.cache_id()))
  }

  /// Copy of this entry with `patch` applied to every record whose id is in
  /// `ids`. `total` is unchanged.
  pub fn patched(&self, ids: &BTreeSet<i64>, patch: &dyn Fn(&mut T)) -> Self {
    let mut next = self.clone();
    for item in next.data.items.iter_mut() {
      if ids.contains(&item.cache_id()) {
        patch(item);
      }
    }
    next
  }

  /// Copy of this entry with every record in `ids` removed and `total`
  /// lowered by the number of records removed.
  pub fn without(&self, ids: &BTreeSet<i64>) -> Self {
    let mut next = self.clone();
    let before = next.data.items.len();
    next.data.items.retain(|item| !ids.contains(&item.cache_id()));
    let removed = (before - next.data.items.len()) as u64;
    next.data.total = next.data.total.saturating_sub(removed);
    next
  }
}

/// Pre-mutation copies of the entries a mutation touched.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
  entries: Vec<(QueryKey, CacheEntry<T>)>,
}

impl<T> Snapshot<T> {
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
    self.entries.iter().map(|(k, _)| k)
  }

  pub fn get(&self, key: &QueryKey) -> Option<&CacheEntry<T>> {
    self.entries.iter().find(|(k, _)| k == key).map(|(_, e)| e)
  }

  /// Resources covered by the snapshotted keys.
  pub fn resources(&self) -> BTreeSet<Resource> {
    self.entries.iter().map(|(k, _)| k.resource).collect()
  }
}

/// Process-wide store of query results.
///
/// Cloning yields another handle to the same store. Every method holds the
/// lock for one short synchronous section and never across an await, so
/// readers never observe a half-applied transform.
///
/// Each resource carries a generation counter that moves whenever its entries
/// are invalidated, patched or restored. A fetch that started before such a
/// change writes through [`QueryCache::set_if_current`] and is dropped.
pub struct QueryCache<T> {
  inner: Arc<Mutex<Inner<T>>>,
}

struct Inner<T> {
  entries: HashMap<QueryKey, CacheEntry<T>>,
  generations: HashMap<Resource, u64>,
}

impl<T> Inner<T> {
  fn bump(&mut self, resource: Resource) {
    *self.generations.entry(resource).or_insert(0) += 1;
  }

  fn generation(&self, resource: Resource) -> u64 {
    self.generations.get(&resource).copied().unwrap_or(0)
  }
}

impl<T: Cacheable> QueryCache<T> {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner {
        entries: HashMap::new(),
        generations: HashMap::new(),
      })),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner<T>> {
    // Writers never panic mid-update, so a poisoned map is still consistent
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Get a copy of the entry for `key`.
  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    self.lock().entries.get(key).cloned()
  }

  /// Replace the entry for `key` (last write wins).
  pub fn set(&self, key: QueryKey, entry: CacheEntry<T>) {
    self.lock().entries.insert(key, entry);
  }

  /// Current generation of `resource`.
  pub fn generation(&self, resource: Resource) -> u64 {
    self.lock().generation(resource)
  }

  /// Replace the entry for `key` only if its resource is still at
  /// `generation`. Returns whether the entry was written.
  pub fn set_if_current(&self, key: QueryKey, entry: CacheEntry<T>, generation: u64) -> bool {
    let mut inner = self.lock();
    if inner.generation(key.resource) != generation {
      return false;
    }
    inner.entries.insert(key, entry);
    true
  }

  /// Apply `transform` to the entry for `key` if one exists.
  ///
  /// Returns whether an entry was present.
  pub fn update<F>(&self, key: &QueryKey, transform: F) -> bool
  where
    F: FnOnce(&CacheEntry<T>) -> CacheEntry<T>,
  {
    let mut inner = self.lock();
    match inner.entries.get_mut(key) {
      Some(entry) => {
        *entry = transform(entry);
        true
      }
      None => false,
    }
  }

  /// Mark the given entries stale without dropping their data.
  ///
  /// Fetches already in flight for these resources will not land. Returns
  /// how many existing entries were marked.
  pub fn mark_stale<'a, I>(&self, keys: I) -> usize
  where
    I: IntoIterator<Item = &'a QueryKey>,
  {
    let mut inner = self.lock();
    let mut marked = 0;
    for key in keys {
      inner.bump(key.resource);
      if let Some(entry) = inner.entries.get_mut(key) {
        entry.stale = true;
        marked += 1;
      }
    }
    marked
  }

  /// Mark every entry of `resource` stale. Returns how many were marked.
  pub fn mark_resource_stale(&self, resource: Resource) -> usize {
    let mut inner = self.lock();
    inner.bump(resource);
    let mut marked = 0;
    for (key, entry) in inner.entries.iter_mut() {
      if key.resource == resource {
        entry.stale = true;
        marked += 1;
      }
    }
    marked
  }

  /// Atomically snapshot every entry holding any of `ids` and replace it
  /// with `transform(entry)`.
  pub fn patch_where<F>(&self, ids: &BTreeSet<i64>, transform: F) -> Snapshot<T>
  where
    F: Fn(&CacheEntry<T>) -> CacheEntry<T>,
  {
    let mut inner = self.lock();
    let mut snapshot = Vec::new();
    for (key, entry) in inner.entries.iter_mut() {
      if entry.contains_any(ids) {
        let next = transform(entry);
        snapshot.push((key.clone(), std::mem::replace(entry, next)));
      }
    }
    let touched: BTreeSet<Resource> = snapshot.iter().map(|(k, _)| k.resource).collect();
    for resource in touched {
      inner.bump(resource);
    }
    Snapshot { entries: snapshot }
  }

  /// Put every snapshotted entry back exactly as it was.
  pub fn restore(&self, snapshot: &Snapshot<T>) {
    let mut inner = self.lock();
    for (key, entry) in &snapshot.entries {
      inner.entries.insert(key.clone(), entry.clone());
    }
    for resource in snapshot.resources() {
      inner.bump(resource);
    }
  }

  pub fn remove(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    self.lock().entries.remove(key)
  }

  pub fn clear(&self) {
    self.lock().entries.clear();
  }

  pub fn keys(&self) -> Vec<QueryKey> {
    self.lock().entries.keys().cloned().collect()
  }

  pub fn keys_for(&self, resource: Resource) -> Vec<QueryKey> {
    self
      .lock()
      .entries
      .keys()
      .filter(|k| k.resource == resource)
      .cloned()
      .collect()
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().entries.is_empty()
  }
}

impl<T: Cacheable> Default for QueryCache<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Clone for QueryCache<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}
