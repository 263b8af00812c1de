//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{Duration, Utc};
use std::future::Future;
use tracing::{debug, warn};

use super::key::QueryKey;
use super::store::{CacheEntry, CollectionResult, QueryCache};
use super::traits::{CacheResult, Cacheable};
use crate::api::ApiError;

/// Read-through fetch path over a [`QueryCache`].
///
/// This is the only writer besides the mutation coordinator: fetched results
/// land here and replace whatever the cache held for the key.
pub struct CacheLayer<T> {
  cache: QueryCache<T>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl<T: Cacheable> CacheLayer<T> {
  /// Create a new cache layer over the given cache.
  pub fn new(cache: QueryCache<T>) -> Self {
    Self {
      cache,
      stale_time: Duration::minutes(5),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn cache(&self) -> &QueryCache<T> {
    &self.cache
  }

  /// Check if an entry was invalidated or has outlived the stale time.
  fn is_stale(&self, entry: &CacheEntry<T>) -> bool {
    entry.stale || Utc::now() - entry.fetched_at > self.stale_time
  }

  /// Read whatever is cached for `key` without touching the network.
  pub fn peek(&self, key: &QueryKey) -> Option<CacheResult<CollectionResult<T>>> {
    self.cache.get(key).map(|entry| {
      let stale = self.is_stale(&entry);
      CacheResult::from_cache(entry.data, entry.fetched_at, stale)
    })
  }

  /// Fetch a collection with cache-first strategy.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If stale/missing, fetch from network
  /// 3. On network failure, return the old entry (offline mode)
  /// 4. Update cache with new data, unless the resource was invalidated or
  ///    patched while the request was in flight
  pub async fn fetch<F, Fut>(
    &self,
    key: &QueryKey,
    fetcher: F,
  ) -> Result<CacheResult<CollectionResult<T>>, ApiError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CollectionResult<T>, ApiError>>,
  {
    let generation = self.cache.generation(key.resource);

    if let Some(cached) = self.cache.get(key) {
      if !self.is_stale(&cached) {
        return Ok(CacheResult::from_cache(
          cached.data,
          cached.fetched_at,
          false,
        ));
      }

      debug!(%key, "cache stale, refetching");
      match fetcher().await {
        Ok(data) => Ok(self.store(key, data, generation)),
        Err(e) => {
          warn!(%key, error = %e, "refetch failed, serving cached data");
          Ok(CacheResult::offline(cached.data, cached.fetched_at))
        }
      }
    } else {
      debug!(%key, "cache miss");
      let data = fetcher().await?;
      Ok(self.store(key, data, generation))
    }
  }

  /// Write a fetched result if nothing changed the resource since
  /// `generation`. Otherwise the newer cached state wins and the caller gets
  /// that instead.
  fn store(
    &self,
    key: &QueryKey,
    data: CollectionResult<T>,
    generation: u64,
  ) -> CacheResult<CollectionResult<T>> {
    if self
      .cache
      .set_if_current(key.clone(), CacheEntry::fresh(data.clone()), generation)
    {
      return CacheResult::from_network(data);
    }

    debug!(%key, "resource changed during fetch, result not cached");
    match self.cache.get(key) {
      Some(current) => {
        let stale = self.is_stale(&current);
        CacheResult::from_cache(current.data, current.fetched_at, stale)
      }
      None => CacheResult::from_network(data),
    }
  }

  /// Drop any cached data for `key` and fetch it again.
  pub async fn refetch<F, Fut>(
    &self,
    key: &QueryKey,
    fetcher: F,
  ) -> Result<CacheResult<CollectionResult<T>>, ApiError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CollectionResult<T>, ApiError>>,
  {
    self.cache.mark_stale([key]);
    self.fetch(key, fetcher).await
  }
}

impl<T> Clone for CacheLayer<T> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      stale_time: self.stale_time,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::fixtures::code;
  use crate::api::DiagnosticCode;
  use crate::cache::{CacheSource, Resource};
  use std::collections::BTreeSet;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;
  use tokio::sync::oneshot;

  fn key() -> QueryKey {
    QueryKey::bare(Resource::DiagnosticCodes)
  }

  fn page(n: i64) -> CollectionResult<DiagnosticCode> {
    CollectionResult::new((1..=n).map(|i| code(i, "C", true)).collect(), n as u64)
  }

  #[tokio::test]
  async fn test_miss_then_hit() {
    let layer = CacheLayer::new(QueryCache::new());
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
      let calls = calls.clone();
      layer
        .fetch(&key(), || async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(page(2))
        })
        .await
        .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let result = layer.peek(&key()).unwrap();
    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(result.data.items.len(), 2);
  }

  #[tokio::test]
  async fn test_invalidated_entry_is_refetched_and_cleared() {
    let layer = CacheLayer::new(QueryCache::new());
    layer.fetch(&key(), || async { Ok(page(1)) }).await.unwrap();
    layer.cache().mark_stale([&key()]);

    assert_eq!(layer.peek(&key()).unwrap().source, CacheSource::CacheStale);

    let result = layer.fetch(&key(), || async { Ok(page(3)) }).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    let entry = layer.cache().get(&key()).unwrap();
    assert!(!entry.stale);
    assert_eq!(entry.data.items.len(), 3);
  }

  #[tokio::test]
  async fn test_offline_fallback_serves_old_entry() {
    let layer = CacheLayer::new(QueryCache::new()).with_stale_time(Duration::zero());
    layer.fetch(&key(), || async { Ok(page(2)) }).await.unwrap();

    let result = layer
      .fetch(&key(), || async { Err(ApiError::Transport("down".into())) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.items.len(), 2);
  }

  #[tokio::test]
  async fn test_invalidation_during_fetch_keeps_entry_stale() {
    let layer = CacheLayer::new(QueryCache::new());
    layer.fetch(&key(), || async { Ok(page(1)) }).await.unwrap();
    layer.cache().mark_stale([&key()]);

    let (release, gate) = oneshot::channel::<()>();
    let background = layer.clone();
    let handle = tokio::spawn(async move {
      background
        .fetch(&key(), || async move {
          let _ = gate.await;
          Ok(page(2))
        })
        .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    // A write lands on the server while the old read is still in flight
    layer.cache().mark_resource_stale(Resource::DiagnosticCodes);
    release.send(()).unwrap();
    let result = handle.await.unwrap().unwrap();

    assert_eq!(result.source, CacheSource::CacheStale);
    let entry = layer.cache().get(&key()).unwrap();
    assert!(entry.stale);
    assert_eq!(entry.data.items.len(), 1);

    // The next fetch is allowed to land
    layer.fetch(&key(), || async { Ok(page(3)) }).await.unwrap();
    let entry = layer.cache().get(&key()).unwrap();
    assert!(!entry.stale);
    assert_eq!(entry.data.items.len(), 3);
  }

  #[tokio::test]
  async fn test_patch_during_fetch_is_not_overwritten() {
    let layer = CacheLayer::new(QueryCache::new());
    layer.fetch(&key(), || async { Ok(page(2)) }).await.unwrap();
    layer.cache().mark_stale([&key()]);

    let (release, gate) = oneshot::channel::<()>();
    let background = layer.clone();
    let handle = tokio::spawn(async move {
      background
        .fetch(&key(), || async move {
          let _ = gate.await;
          Ok(page(2))
        })
        .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let ids = BTreeSet::from([2]);
    layer.cache().patch_where(&ids, |e| e.without(&ids));
    release.send(()).unwrap();
    handle.await.unwrap().unwrap();

    let entry = layer.cache().get(&key()).unwrap();
    assert_eq!(entry.data.items.len(), 1);
    assert_eq!(entry.data.total, 1);
  }

  #[tokio::test]
  async fn test_invalidation_during_miss_leaves_cache_empty() {
    let layer = CacheLayer::new(QueryCache::new());
    let (release, gate) = oneshot::channel::<()>();
    let background = layer.clone();
    let handle = tokio::spawn(async move {
      background
        .fetch(&key(), || async move {
          let _ = gate.await;
          Ok(page(2))
        })
        .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    layer.cache().mark_resource_stale(Resource::DiagnosticCodes);
    release.send(()).unwrap();
    let result = handle.await.unwrap().unwrap();

    // The caller still gets data, but nothing outdated is cached
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.items.len(), 2);
    assert!(layer.cache().is_empty());
  }

  #[tokio::test]
  async fn test_miss_with_failure_propagates() {
    let layer: CacheLayer<DiagnosticCode> = CacheLayer::new(QueryCache::new());
    let err = layer
      .fetch(&key(), || async { Err(ApiError::server(500, "boom")) })
      .await
      .unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert!(layer.cache().is_empty());
  }
}
