//! Diagnostic codes client that wraps ApiClient with the query cache.

use chrono::Duration;
use tokio::sync::mpsc;

use crate::cache::{
  CacheLayer, CacheResult, CollectionResult, Invalidation, InvalidationBus, QueryCache, Resource,
};
use crate::config::Config;
use crate::mutation::{Mutation, MutationCoordinator};
use crate::query::Query;

use super::cache::{code_key, codes_key, favorites_key};
use super::client::ApiClient;
use super::error::ApiError;
use super::types::{
  BulkDeleteResult, BulkUpdate, BulkUpdateResult, CodeVersion, CsvExport, CsvUpload,
  DiagnosticCode, DiagnosticCodeCreate, DiagnosticCodeUpdate, ExportFilter, ImportResult,
  ListParams, Suggestion,
};

/// Resources whose cached entries may hold a changed or removed record
const RECORD_RESOURCES: &[Resource] = &[
  Resource::DiagnosticCodes,
  Resource::DiagnosticCode,
  Resource::Favorites,
];

/// Diagnostic codes client with transparent caching and optimistic writes.
///
/// Owns one cache, one invalidation bus and one mutation coordinator; clones
/// share all three.
#[derive(Clone)]
pub struct CodesClient {
  inner: ApiClient,
  layer: CacheLayer<DiagnosticCode>,
  bus: InvalidationBus<DiagnosticCode>,
  mutations: MutationCoordinator<DiagnosticCode>,
}

impl CodesClient {
  /// Create a new client from configuration.
  pub fn new(config: &Config) -> color_eyre::Result<Self> {
    let inner = ApiClient::new(config)?;
    Ok(Self::with_client(inner, config.cache.stale_time()))
  }

  /// Wire a client around an existing API client.
  pub fn with_client(inner: ApiClient, stale_time: Duration) -> Self {
    let cache = QueryCache::new();
    let bus = InvalidationBus::new(cache.clone());
    let mutations = MutationCoordinator::new(cache.clone(), bus.clone());
    let layer = CacheLayer::new(cache).with_stale_time(stale_time);

    Self {
      inner,
      layer,
      bus,
      mutations,
    }
  }

  pub fn cache(&self) -> &QueryCache<DiagnosticCode> {
    self.layer.cache()
  }

  /// Receive invalidation notices (for views that refetch on change).
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Invalidation> {
    self.bus.subscribe()
  }

  /// Mark every cached query stale.
  pub fn invalidate_all(&self) -> usize {
    self.bus.invalidate_all()
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// List codes with caching.
  pub async fn list(
    &self,
    params: &ListParams,
  ) -> Result<CacheResult<CollectionResult<DiagnosticCode>>, ApiError> {
    params.validate()?;
    self
      .layer
      .fetch(&codes_key(params), || self.inner.list_codes(params))
      .await
  }

  /// Get a single code by id with caching.
  pub async fn get(&self, id: i64) -> Result<CacheResult<DiagnosticCode>, ApiError> {
    let result = self
      .layer
      .fetch(&code_key(id), || async move {
        self.inner.get_code(id).await.map(CollectionResult::single)
      })
      .await?;

    // The cached detail may have been emptied by an in-flight delete
    let code = result.data.items.first().cloned();
    match code {
      Some(code) => Ok(result.map(|_| code)),
      None => Err(ApiError::server(404, "Diagnostic code not found")),
    }
  }

  /// Get a single code by its code string (not cached).
  pub async fn get_by_code(&self, code: &str) -> Result<DiagnosticCode, ApiError> {
    self.inner.get_code_by_code(code).await
  }

  /// The current user's favorites with caching.
  pub async fn favorites(&self) -> Result<CacheResult<CollectionResult<DiagnosticCode>>, ApiError> {
    self
      .layer
      .fetch(&favorites_key(), || self.inner.favorites())
      .await
  }

  /// Whether `id` is a favorite (not cached).
  pub async fn is_favorite(&self, id: i64) -> Result<bool, ApiError> {
    self.inner.is_favorite(id).await
  }

  /// Autocomplete suggestions (not cached; see [`crate::search::Autocomplete`]).
  pub async fn autocomplete(&self, query: &str, limit: u32) -> Result<Vec<Suggestion>, ApiError> {
    self.inner.autocomplete(query, limit).await
  }

  /// Export codes as CSV (not cached).
  pub async fn export_csv(&self, filter: &ExportFilter) -> Result<CsvExport, ApiError> {
    self.inner.export_csv(filter).await
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Create a code. Lists are invalidated once the server confirms.
  pub async fn create(&self, input: &DiagnosticCodeCreate) -> Result<DiagnosticCode, ApiError> {
    input.validate()?;
    self
      .mutations
      .create(&[Resource::DiagnosticCodes], || self.inner.create_code(input))
      .await
  }

  /// Update a code, showing the change in every cached view immediately.
  pub async fn update(
    &self,
    id: i64,
    patch: &DiagnosticCodeUpdate,
  ) -> Result<DiagnosticCode, ApiError> {
    patch.validate()?;
    self
      .mutations
      .update(
        &[id],
        |code: &mut DiagnosticCode| patch.apply(code),
        RECORD_RESOURCES,
        || self.inner.update_code(id, patch),
      )
      .await
  }

  /// Delete a code, removing it from every cached view immediately.
  pub async fn delete(&self, id: i64) -> Result<(), ApiError> {
    self
      .mutations
      .delete(&[id], RECORD_RESOURCES, || self.inner.delete_code(id))
      .await
  }

  /// Delete several codes in one request.
  pub async fn bulk_delete(&self, ids: &[i64]) -> Result<BulkDeleteResult, ApiError> {
    if ids.is_empty() {
      return Err(ApiError::Validation("No code IDs provided".into()));
    }
    self
      .mutations
      .delete(ids, RECORD_RESOURCES, || self.inner.bulk_delete(ids))
      .await
  }

  /// Apply the same change to several codes, patching every cached view
  /// immediately.
  pub async fn bulk_update(
    &self,
    ids: &[i64],
    update: &BulkUpdate,
  ) -> Result<BulkUpdateResult, ApiError> {
    if ids.is_empty() {
      return Err(ApiError::Validation("No code IDs provided".into()));
    }
    update.validate()?;
    let patch = update.as_update();
    self
      .mutations
      .update(
        ids,
        |code: &mut DiagnosticCode| patch.apply(code),
        RECORD_RESOURCES,
        || self.inner.bulk_update(ids, update),
      )
      .await
  }

  /// Import codes from CSV. Which records change is only known to the
  /// server, so nothing is patched; every record view is invalidated.
  pub async fn import_csv(&self, upload: &CsvUpload) -> Result<ImportResult, ApiError> {
    upload.validate()?;
    self
      .mutations
      .submit(RECORD_RESOURCES, || self.inner.import_csv(upload))
      .await
  }

  /// Restore a code to an earlier version and invalidate every record view.
  pub async fn restore_version(
    &self,
    id: i64,
    version_id: i64,
    comment: Option<&str>,
  ) -> Result<CodeVersion, ApiError> {
    self
      .mutations
      .submit(RECORD_RESOURCES, || self.inner.restore_version(id, version_id, comment))
      .await
  }

  pub async fn add_favorite(&self, id: i64) -> Result<(), ApiError> {
    self
      .mutations
      .submit(&[Resource::Favorites], || self.inner.add_favorite(id))
      .await
  }

  pub async fn remove_favorite(&self, id: i64) -> Result<(), ApiError> {
    self
      .mutations
      .submit(&[Resource::Favorites], || self.inner.remove_favorite(id))
      .await
  }

  // ==========================================================================
  // Poll-driven handles
  // ==========================================================================

  /// Start an update on `mutation`. The cache shows the patch before this
  /// returns; the request runs on a spawned task.
  pub fn start_update(
    &self,
    mutation: &mut Mutation<DiagnosticCode>,
    id: i64,
    patch: DiagnosticCodeUpdate,
  ) -> Result<(), ApiError> {
    patch.validate()?;
    let pending = self.mutations.begin_update(
      &[id],
      |code: &mut DiagnosticCode| patch.apply(code),
      RECORD_RESOURCES,
    );
    let inner = self.inner.clone();
    mutation.start(pending, async move { inner.update_code(id, &patch).await });
    Ok(())
  }

  /// Start a delete on `mutation`. The record leaves every cached view before
  /// this returns.
  pub fn start_delete(&self, mutation: &mut Mutation<()>, id: i64) {
    let pending = self.mutations.begin_delete(&[id], RECORD_RESOURCES);
    let inner = self.inner.clone();
    mutation.start(pending, async move { inner.delete_code(id).await });
  }

  /// A query over a page of codes that refetches after invalidation.
  pub fn list_query(&self, params: ListParams) -> Query<CollectionResult<DiagnosticCode>> {
    let client = self.clone();
    Query::new(move || {
      let client = client.clone();
      let params = params.clone();
      async move { client.list(&params).await.map(|r| r.data) }
    })
    .watching(Resource::DiagnosticCodes, self.subscribe())
  }

  /// A query over the favorites list that refetches after invalidation.
  pub fn favorites_query(&self) -> Query<CollectionResult<DiagnosticCode>> {
    let client = self.clone();
    Query::new(move || {
      let client = client.clone();
      async move { client.favorites().await.map(|r| r.data) }
    })
    .watching(Resource::Favorites, self.subscribe())
  }
}
