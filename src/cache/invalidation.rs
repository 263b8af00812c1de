//! Invalidation bus: marks cached resources stale and tells subscribers.
//!
//! The bus never fetches. A view that receives a notice is expected to
//! refetch its key on its next poll.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

use super::key::Resource;
use super::store::QueryCache;
use super::traits::Cacheable;

/// Notice sent to subscribers after a resource was invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidation {
  pub resource: Resource,
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<Invalidation>>>>;

pub struct InvalidationBus<T> {
  cache: QueryCache<T>,
  subscribers: Subscribers,
}

impl<T: Cacheable> InvalidationBus<T> {
  pub fn new(cache: QueryCache<T>) -> Self {
    Self {
      cache,
      subscribers: Arc::new(Mutex::new(Vec::new())),
    }
  }

  fn subscribers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<Invalidation>>> {
    self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Receive a notice for every invalidation published after this call.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Invalidation> {
    let (tx, rx) = mpsc::unbounded_channel();
    self.subscribers().push(tx);
    rx
  }

  /// Mark every cached entry of `resource` stale and notify subscribers.
  ///
  /// Returns how many entries were marked. Calling this repeatedly leaves
  /// the cache in the same state as calling it once.
  pub fn invalidate(&self, resource: Resource) -> usize {
    let marked = self.cache.mark_resource_stale(resource);
    debug!(%resource, marked, "invalidated");
    self.publish(Invalidation { resource });
    marked
  }

  /// Invalidate every known resource.
  pub fn invalidate_all(&self) -> usize {
    Resource::ALL.iter().map(|r| self.invalidate(*r)).sum()
  }

  fn publish(&self, notice: Invalidation) {
    // Dropped receivers are pruned here
    self.subscribers().retain(|tx| tx.send(notice).is_ok());
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscribers().len()
  }
}

impl<T> Clone for InvalidationBus<T> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      subscribers: Arc::clone(&self.subscribers),
    }
  }
}
