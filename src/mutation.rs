//! Optimistic mutations over the query cache.
//!
//! Update and delete patch every cached collection that holds the target
//! record before the request goes out. On failure the touched entries are
//! restored from the snapshot taken when the mutation began; on success the
//! snapshot is discarded and the affected resources are invalidated so a
//! background refetch can reconcile anything the patch could not predict
//! (e.g. a category change that moves the record out of a filtered list).
//!
//! Create is not speculative: the server assigns the id. Other writes that
//! only affect server-side membership (favorites) go through `submit`, which
//! invalidates on success and touches nothing otherwise.
//!
//! Concurrent mutations over the same keys each roll back to their own
//! snapshot. If an earlier mutation fails after a later one succeeded, its
//! rollback can reinstate a superseded state until the next refetch.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::cache::{Cacheable, InvalidationBus, QueryCache, QueryKey, Resource, Snapshot};

/// Kind of mutation, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
  Create,
  Update,
  Delete,
  Submit,
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      MutationKind::Create => "create",
      MutationKind::Update => "update",
      MutationKind::Delete => "delete",
      MutationKind::Submit => "submit",
    })
  }
}

/// A begun mutation: its optimistic patch is already in the cache.
///
/// Settle it with [`PendingMutation::run`] (or [`Mutation::start`] from an
/// event loop). Success invalidates the named resources plus every resource
/// the patch touched; failure restores the snapshot.
pub struct PendingMutation<T> {
  kind: MutationKind,
  snapshot: Option<Snapshot<T>>,
  invalidates: Vec<Resource>,
  cache: QueryCache<T>,
  bus: InvalidationBus<T>,
}

impl<T: Cacheable> PendingMutation<T> {
  pub fn kind(&self) -> MutationKind {
    self.kind
  }

  /// Keys this mutation patched optimistically.
  pub fn target_keys(&self) -> Vec<QueryKey> {
    self
      .snapshot
      .as_ref()
      .map(|s| s.keys().cloned().collect())
      .unwrap_or_default()
  }

  /// Await `request` and settle the cache with its outcome.
  pub async fn run<R, Fut>(self, request: Fut) -> Result<R, ApiError>
  where
    Fut: Future<Output = Result<R, ApiError>>,
  {
    let result = request.await;
    self.settle(result)
  }

  /// Settle the cache with an outcome obtained elsewhere.
  pub fn settle<R>(self, result: Result<R, ApiError>) -> Result<R, ApiError> {
    match result {
      Ok(value) => {
        self.succeed();
        Ok(value)
      }
      Err(error) => {
        self.fail(&error);
        Err(error)
      }
    }
  }

  fn succeed(self) {
    let mut resources: BTreeSet<Resource> = self.invalidates.iter().copied().collect();
    if let Some(snapshot) = &self.snapshot {
      resources.extend(snapshot.resources());
    }
    debug!(kind = %self.kind, "mutation succeeded");
    for resource in resources {
      self.bus.invalidate(resource);
    }
  }

  fn fail(self, error: &ApiError) {
    match &self.snapshot {
      Some(snapshot) if !snapshot.is_empty() => {
        warn!(
          kind = %self.kind,
          %error,
          restored = snapshot.len(),
          "mutation failed, rolling back"
        );
        self.cache.restore(snapshot);
      }
      _ => warn!(kind = %self.kind, %error, "mutation failed"),
    }
  }
}

/// Runs create/update/delete requests against the backend while keeping the
/// query cache consistent with the expected outcome.
///
/// The `begin_*` methods apply the optimistic patch before returning. The
/// async methods are shorthands for `begin_*(..).run(request())`.
pub struct MutationCoordinator<T> {
  cache: QueryCache<T>,
  bus: InvalidationBus<T>,
}

impl<T: Cacheable> MutationCoordinator<T> {
  pub fn new(cache: QueryCache<T>, bus: InvalidationBus<T>) -> Self {
    Self { cache, bus }
  }

  fn begin(
    &self,
    kind: MutationKind,
    snapshot: Option<Snapshot<T>>,
    invalidates: &[Resource],
  ) -> PendingMutation<T> {
    debug!(
      %kind,
      entity = T::entity_type(),
      touched = snapshot.as_ref().map(|s| s.len()).unwrap_or(0),
      "mutation pending"
    );
    PendingMutation {
      kind,
      snapshot,
      invalidates: invalidates.to_vec(),
      cache: self.cache.clone(),
      bus: self.bus.clone(),
    }
  }

  /// Begin a create. The cache is left alone until success.
  pub fn begin_create(&self, invalidates: &[Resource]) -> PendingMutation<T> {
    self.begin(MutationKind::Create, None, invalidates)
  }

  /// Begin a non-speculative write.
  pub fn begin_submit(&self, invalidates: &[Resource]) -> PendingMutation<T> {
    self.begin(MutationKind::Submit, None, invalidates)
  }

  /// Patch every record in `ids` in every cached collection with `patch`.
  /// Collection totals are unchanged.
  pub fn begin_update<P>(
    &self,
    ids: &[i64],
    patch: P,
    invalidates: &[Resource],
  ) -> PendingMutation<T>
  where
    P: Fn(&mut T),
  {
    let ids: BTreeSet<i64> = ids.iter().copied().collect();
    let snapshot = self
      .cache
      .patch_where(&ids, |entry| entry.patched(&ids, &patch));
    self.begin(MutationKind::Update, Some(snapshot), invalidates)
  }

  /// Remove every record in `ids` from the cached collections. Each
  /// collection's total drops by the number of records removed from it.
  pub fn begin_delete(&self, ids: &[i64], invalidates: &[Resource]) -> PendingMutation<T> {
    let ids: BTreeSet<i64> = ids.iter().copied().collect();
    let snapshot = self.cache.patch_where(&ids, |entry| entry.without(&ids));
    self.begin(MutationKind::Delete, Some(snapshot), invalidates)
  }

  /// Run a create request. Success invalidates `invalidates`.
  pub async fn create<R, F, Fut>(
    &self,
    invalidates: &[Resource],
    request: F,
  ) -> Result<R, ApiError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, ApiError>>,
  {
    self.begin_create(invalidates).run(request()).await
  }

  /// Run a non-speculative request that invalidates `invalidates` on success.
  pub async fn submit<R, F, Fut>(
    &self,
    invalidates: &[Resource],
    request: F,
  ) -> Result<R, ApiError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, ApiError>>,
  {
    self.begin_submit(invalidates).run(request()).await
  }

  /// Patch `ids` (see [`MutationCoordinator::begin_update`]) and run the
  /// request.
  pub async fn update<R, P, F, Fut>(
    &self,
    ids: &[i64],
    patch: P,
    invalidates: &[Resource],
    request: F,
  ) -> Result<R, ApiError>
  where
    P: Fn(&mut T),
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, ApiError>>,
  {
    self
      .begin_update(ids, patch, invalidates)
      .run(request())
      .await
  }

  /// Remove `ids` (see [`MutationCoordinator::begin_delete`]) and run the
  /// request.
  pub async fn delete<R, F, Fut>(
    &self,
    ids: &[i64],
    invalidates: &[Resource],
    request: F,
  ) -> Result<R, ApiError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, ApiError>>,
  {
    self.begin_delete(ids, invalidates).run(request()).await
  }
}

impl<T> Clone for MutationCoordinator<T> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      bus: self.bus.clone(),
    }
  }
}

// ============================================================================
// Poll-driven mutation handle
// ============================================================================

/// The state of a mutation handle
#[derive(Debug, Clone)]
pub enum MutationState<R> {
  /// No mutation has been started
  Idle,
  /// Request in flight; the cache already shows the optimistic result
  Pending,
  /// Settled successfully
  Success(R),
  /// Settled with an error; the cache was rolled back
  Failure(ApiError),
}

impl<R> MutationState<R> {
  pub fn is_pending(&self) -> bool {
    matches!(self, MutationState::Pending)
  }

  pub fn is_settled(&self) -> bool {
    matches!(self, MutationState::Success(_) | MutationState::Failure(_))
  }

  pub fn error(&self) -> Option<&ApiError> {
    match self {
      MutationState::Failure(e) => Some(e),
      _ => None,
    }
  }
}

/// Handle for running a mutation from an event loop.
///
/// The mutation runs on a spawned task. Dropping the handle or starting
/// another mutation does not cancel it: the task still rolls back or
/// invalidates; only its result is no longer observed here.
pub struct Mutation<R> {
  state: MutationState<R>,
  receiver: Option<mpsc::UnboundedReceiver<Result<R, ApiError>>>,
}

impl<R: Send + 'static> Mutation<R> {
  pub fn new() -> Self {
    Self {
      state: MutationState::Idle,
      receiver: None,
    }
  }

  pub fn state(&self) -> &MutationState<R> {
    &self.state
  }

  /// Send `request` for an already begun mutation and move to `Pending`.
  ///
  /// The optimistic patch was applied by `begin_*`, so the cache shows it
  /// before this returns.
  pub fn start<T, Fut>(&mut self, pending: PendingMutation<T>, request: Fut)
  where
    T: Cacheable,
    Fut: Future<Output = Result<R, ApiError>> + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = MutationState::Pending;

    tokio::spawn(async move {
      let result = pending.run(request).await;
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }

  /// Poll for the settled result.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(Ok(value)) => {
        self.state = MutationState::Success(value);
        self.receiver = None;
        true
      }
      Ok(Err(error)) => {
        self.state = MutationState::Failure(error);
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.state = MutationState::Failure(ApiError::Transport("mutation task aborted".into()));
        self.receiver = None;
        true
      }
    }
  }

  /// Return to `Idle`, e.g. after the UI has shown the outcome.
  pub fn reset(&mut self) {
    self.state = MutationState::Idle;
    self.receiver = None;
  }
}

impl<R: Send + 'static> Default for Mutation<R> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::fixtures::code;
  use crate::api::DiagnosticCode;
  use crate::cache::{CacheEntry, CollectionResult, QueryKey, QueryParams};
  use std::time::Duration;
  use tokio::sync::oneshot;

  fn error_key() -> QueryKey {
    QueryKey::new(
      Resource::DiagnosticCodes,
      QueryParams::new()
        .with("category", Some("ERROR"))
        .with("skip", Some(0i64))
        .with("limit", Some(12i64)),
    )
  }

  fn detail_key(id: i64) -> QueryKey {
    QueryKey::new(
      Resource::DiagnosticCode,
      QueryParams::new().with("id", Some(id)),
    )
  }

  fn setup() -> (QueryCache<DiagnosticCode>, MutationCoordinator<DiagnosticCode>) {
    let cache = QueryCache::new();
    cache.set(
      error_key(),
      CacheEntry::fresh(CollectionResult::new(
        vec![code(4, "E004", true), code(5, "E005", true), code(6, "E006", true)],
        3,
      )),
    );
    cache.set(
      detail_key(5),
      CacheEntry::fresh(CollectionResult::single(code(5, "E005", true))),
    );
    let bus = InvalidationBus::new(cache.clone());
    let coordinator = MutationCoordinator::new(cache.clone(), bus);
    (cache, coordinator)
  }

  fn item(cache: &QueryCache<DiagnosticCode>, key: &QueryKey, id: i64) -> Option<DiagnosticCode> {
    cache
      .get(key)
      .and_then(|e| e.data.items.into_iter().find(|c| c.id == id))
  }

  fn assert_total_invariant(cache: &QueryCache<DiagnosticCode>) {
    for key in cache.keys() {
      let entry = cache.get(&key).unwrap();
      assert!(entry.data.items.len() as u64 <= entry.data.total, "{}", key);
    }
  }

  #[tokio::test]
  async fn test_failed_update_is_visible_then_rolled_back() {
    let (cache, coordinator) = setup();
    let before_list = cache.get(&error_key()).unwrap();
    let before_detail = cache.get(&detail_key(5)).unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    let task = {
      let coordinator = coordinator.clone();
      tokio::spawn(async move {
        coordinator
          .update(
            &[5],
            |c: &mut DiagnosticCode| c.is_active = false,
            &[Resource::DiagnosticCodes],
            || async move {
              let _ = rx.await;
              Err::<DiagnosticCode, _>(ApiError::server(500, "Internal Server Error"))
            },
          )
          .await
      })
    };

    // Let the mutation reach its await point
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!item(&cache, &error_key(), 5).unwrap().is_active);
    assert!(!item(&cache, &detail_key(5), 5).unwrap().is_active);
    assert_eq!(cache.get(&error_key()).unwrap().data.total, 3);

    tx.send(()).unwrap();
    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.status(), Some(500));

    assert_eq!(cache.get(&error_key()).unwrap(), before_list);
    assert_eq!(cache.get(&detail_key(5)).unwrap(), before_detail);
    assert!(item(&cache, &error_key(), 5).unwrap().is_active);
  }

  #[tokio::test]
  async fn test_successful_delete_invalidates() {
    let (cache, coordinator) = setup();

    coordinator
      .delete(&[5], &[Resource::DiagnosticCodes], || async { Ok(()) })
      .await
      .unwrap();

    let entry = cache.get(&error_key()).unwrap();
    assert!(entry.stale);
    assert_eq!(entry.data.items.len(), 2);
    assert_eq!(entry.data.total, 2);
    assert!(item(&cache, &error_key(), 5).is_none());
    // The detail entry held the record too, so its resource is invalidated
    assert!(cache.get(&detail_key(5)).unwrap().stale);
    assert_total_invariant(&cache);
  }

  #[tokio::test]
  async fn test_failed_delete_restores_exactly() {
    let (cache, coordinator) = setup();
    let before = cache.get(&error_key()).unwrap();

    let result: Result<(), ApiError> = coordinator
      .delete(&[5, 6], &[Resource::DiagnosticCodes], || async {
        Err(ApiError::Transport("connection refused".into()))
      })
      .await;

    assert!(result.is_err());
    let after = cache.get(&error_key()).unwrap();
    assert_eq!(after, before);
    assert!(!after.stale);
  }

  #[tokio::test]
  async fn test_create_does_not_touch_cache_until_success() {
    let (cache, coordinator) = setup();
    let before = cache.get(&error_key()).unwrap();

    let failed: Result<DiagnosticCode, ApiError> = coordinator
      .create(&[Resource::DiagnosticCodes], || async {
        Err(ApiError::server(409, "Code already exists"))
      })
      .await;
    assert_eq!(failed.unwrap_err().status(), Some(409));
    assert_eq!(cache.get(&error_key()).unwrap(), before);

    let created = coordinator
      .create(&[Resource::DiagnosticCodes], || async { Ok(code(99, "NEW", true)) })
      .await
      .unwrap();
    assert_eq!(created.id, 99);
    let entry = cache.get(&error_key()).unwrap();
    assert!(entry.stale);
    assert!(item(&cache, &error_key(), 99).is_none());
  }

  #[tokio::test]
  async fn test_submit_invalidates_only_on_success() {
    let (cache, coordinator) = setup();
    let favorites = QueryKey::bare(Resource::Favorites);
    cache.set(
      favorites.clone(),
      CacheEntry::fresh(CollectionResult::single(code(4, "E004", true))),
    );

    let failed: Result<(), ApiError> = coordinator
      .submit(&[Resource::Favorites], || async { Err(ApiError::server(404, "nope")) })
      .await;
    assert!(failed.is_err());
    assert!(!cache.get(&favorites).unwrap().stale);

    coordinator
      .submit(&[Resource::Favorites], || async { Ok(()) })
      .await
      .unwrap();
    assert!(cache.get(&favorites).unwrap().stale);
    assert!(!cache.get(&error_key()).unwrap().stale);
  }

  #[tokio::test]
  async fn test_update_of_uncached_record_only_invalidates() {
    let (cache, coordinator) = setup();
    coordinator
      .update(
        &[1234],
        |c: &mut DiagnosticCode| c.is_active = false,
        &[Resource::Favorites],
        || async { Ok(()) },
      )
      .await
      .unwrap();
    // Nothing held the record, and favorites is not cached
    assert!(!cache.get(&error_key()).unwrap().stale);
    assert_eq!(cache.len(), 2);
  }

  #[tokio::test]
  async fn test_rollback_reinstates_superseded_state() {
    // Two overlapping mutations settling in reverse order: the first one's
    // rollback wins over the second's successful patch.
    let (cache, coordinator) = setup();
    let (tx, rx) = oneshot::channel::<()>();

    let first = {
      let coordinator = coordinator.clone();
      tokio::spawn(async move {
        coordinator
          .update(
            &[5],
            |c: &mut DiagnosticCode| c.description = "first".into(),
            &[Resource::DiagnosticCodes],
            || async move {
              let _ = rx.await;
              Err::<(), _>(ApiError::Timeout)
            },
          )
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    coordinator
      .update(
        &[5],
        |c: &mut DiagnosticCode| c.is_active = false,
        &[Resource::DiagnosticCodes],
        || async { Ok(()) },
      )
      .await
      .unwrap();

    tx.send(()).unwrap();
    assert!(first.await.unwrap().is_err());

    let restored = item(&cache, &error_key(), 5).unwrap();
    assert!(restored.is_active);
    assert_eq!(restored.description, "Description for E005");
  }

  #[tokio::test]
  async fn test_pending_mutation_tracks_target_keys() {
    let (cache, coordinator) = setup();
    let pending = coordinator.begin_delete(&[5], &[Resource::DiagnosticCodes]);
    assert_eq!(pending.kind(), MutationKind::Delete);
    let mut keys = pending.target_keys();
    keys.sort_by_key(|k| k.to_string());
    assert_eq!(keys, vec![error_key(), detail_key(5)]);
    assert_total_invariant(&cache);
  }

  #[tokio::test]
  async fn test_bulk_update_patches_every_target() {
    let (cache, coordinator) = setup();
    let pending = coordinator.begin_update(
      &[4, 6],
      |c: &mut DiagnosticCode| c.category = Some("WARN".into()),
      &[Resource::DiagnosticCodes],
    );

    for id in [4, 6] {
      let patched = item(&cache, &error_key(), id).unwrap();
      assert_eq!(patched.category.as_deref(), Some("WARN"));
    }
    assert_ne!(
      item(&cache, &error_key(), 5).unwrap().category.as_deref(),
      Some("WARN")
    );
    // Only the list held 4 and 6
    assert_eq!(pending.target_keys(), vec![error_key()]);

    let result: Result<(), ApiError> = pending.settle(Err(ApiError::Timeout));
    assert!(result.is_err());
    assert_ne!(
      item(&cache, &error_key(), 4).unwrap().category.as_deref(),
      Some("WARN")
    );
  }

  #[tokio::test]
  async fn test_mutation_handle_states() {
    let (cache, coordinator) = setup();
    let mut mutation: Mutation<()> = Mutation::new();
    assert!(matches!(mutation.state(), MutationState::Idle));

    let pending = coordinator.begin_update(
      &[5],
      |c: &mut DiagnosticCode| c.is_active = false,
      &[Resource::DiagnosticCodes],
    );
    mutation.start(pending, async { Err(ApiError::server(500, "boom")) });
    assert!(mutation.state().is_pending());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(mutation.poll());
    assert_eq!(mutation.state().error().and_then(|e| e.status()), Some(500));
    assert!(!mutation.poll());
    assert!(item(&cache, &error_key(), 5).unwrap().is_active);

    mutation.reset();
    assert!(!mutation.state().is_settled());
  }

  #[tokio::test]
  async fn test_patch_is_visible_as_soon_as_mutation_starts() {
    let (cache, coordinator) = setup();
    let (tx, rx) = oneshot::channel::<()>();
    let mut mutation: Mutation<()> = Mutation::new();

    let pending = coordinator.begin_update(
      &[5],
      |c: &mut DiagnosticCode| c.is_active = false,
      &[Resource::DiagnosticCodes],
    );
    mutation.start(pending, async move {
      let _ = rx.await;
      Ok(())
    });

    // No await between start and these reads
    assert!(mutation.state().is_pending());
    assert!(!item(&cache, &error_key(), 5).unwrap().is_active);
    assert!(!item(&cache, &detail_key(5), 5).unwrap().is_active);
    assert!(!cache.get(&error_key()).unwrap().stale);

    tx.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(mutation.poll());
    assert!(matches!(mutation.state(), MutationState::Success(())));
    assert!(cache.get(&error_key()).unwrap().stale);
    assert!(!item(&cache, &error_key(), 5).unwrap().is_active);
  }
}
