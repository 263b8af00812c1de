//! Async query abstraction for data fetching with caching support.
//!
//! A `Query<T>` wraps a fetcher closure and exposes its progress as a
//! pollable state, so an event loop can render without awaiting.
//!
//! # Example
//!
//! ```ignore
//! let mut query = client.list_query(ListParams::page(0, 12));
//!
//! // Start fetching
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(data) | QueryState::Refreshing(data) => render_data(data),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::cache::{Invalidation, Resource};

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// First fetch in flight, nothing to show yet
  Loading,
  /// Query completed successfully
  Success(T),
  /// Refetch in flight; the previous data is still shown
  Refreshing(T),
  /// Query failed with no data to fall back on
  Error(ApiError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_fetching(&self) -> bool {
    matches!(self, QueryState::Loading | QueryState::Refreshing(_))
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) | QueryState::Refreshing(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&ApiError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T, ApiError>> + Send + Sync>;

/// Async query for data fetching with state management.
///
/// Keeps showing the last good data while a refetch is in flight or after a
/// refetch fails. When built with [`Query::watching`], an invalidation of the
/// watched resource triggers a refetch on the next `poll`. An invalidation that
/// arrives mid-fetch triggers one more fetch once the current one lands.
pub struct Query<T> {
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<Result<T, ApiError>>>,
  invalidations: Option<(Resource, mpsc::UnboundedReceiver<Invalidation>)>,
  /// An invalidation arrived while a fetch was in flight
  invalidated: bool,
  last_error: Option<ApiError>,
  fetched_at: Option<Instant>,
  stale_time: Duration,
}

impl<T: Send + 'static> Query<T> {
  /// Create a new query with the given fetcher function.
  ///
  /// The fetcher is a closure that returns a future. It will be called
  /// each time `fetch()` or `refetch()` is invoked.
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    Self {
      state: QueryState::Idle,
      fetcher: Box::new(move || fetcher().boxed()),
      receiver: None,
      invalidations: None,
      invalidated: false,
      last_error: None,
      fetched_at: None,
      stale_time: Duration::from_secs(60), // Default 1 minute
    }
  }

  /// Set the stale time for this query.
  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_time = duration;
    self
  }

  /// Refetch whenever `resource` is invalidated on the bus behind `notices`.
  pub fn watching(
    mut self,
    resource: Resource,
    notices: mpsc::UnboundedReceiver<Invalidation>,
  ) -> Self {
    self.invalidations = Some((resource, notices));
    self
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// The latest data, including while a refetch is in flight.
  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  /// The error from the most recent fetch, even if older data is still shown.
  pub fn error(&self) -> Option<&ApiError> {
    self.state.error().or(self.last_error.as_ref())
  }

  /// Check if the data is stale (older than stale_time).
  pub fn is_stale(&self) -> bool {
    match &self.state {
      QueryState::Success(_) => self
        .fetched_at
        .map(|t| t.elapsed() > self.stale_time)
        .unwrap_or(true),
      _ => false,
    }
  }

  /// Start fetching data if not already fetching.
  pub fn fetch(&mut self) {
    if self.state.is_fetching() {
      return;
    }
    self.start_fetch();
  }

  /// Force a refetch, dropping the result of any fetch in flight.
  pub fn refetch(&mut self) {
    self.receiver = None;
    self.start_fetch();
  }

  /// Poll for invalidations and for results from a pending fetch.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    if self.drain_invalidations() {
      if self.state.is_fetching() {
        self.invalidated = true;
      } else {
        debug!("query invalidated, refetching");
        self.start_fetch();
        changed = true;
      }
    }

    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return changed,
    };

    let outcome = match receiver.try_recv() {
      Ok(result) => result,
      Err(mpsc::error::TryRecvError::Empty) => return changed,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        Err(ApiError::Transport("query was cancelled".into()))
      }
    };
    self.receiver = None;

    match outcome {
      Ok(data) => {
        self.state = QueryState::Success(data);
        self.last_error = None;
        self.fetched_at = Some(Instant::now());
      }
      Err(error) => {
        self.state = match std::mem::replace(&mut self.state, QueryState::Idle) {
          QueryState::Refreshing(data) | QueryState::Success(data) => {
            warn!(%error, "refetch failed, keeping previous data");
            self.last_error = Some(error);
            QueryState::Success(data)
          }
          _ => QueryState::Error(error),
        };
      }
    }

    if self.invalidated {
      debug!("query invalidated during fetch, refetching");
      self.start_fetch();
    }
    true
  }

  /// Whether a watched invalidation arrived since the last poll.
  fn drain_invalidations(&mut self) -> bool {
    let Some((resource, notices)) = &mut self.invalidations else {
      return false;
    };
    let mut hit = false;
    while let Ok(notice) = notices.try_recv() {
      hit |= notice.resource == *resource;
    }
    hit
  }

  fn start_fetch(&mut self) {
    self.invalidated = false;
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = match std::mem::replace(&mut self.state, QueryState::Idle) {
      QueryState::Success(data) | QueryState::Refreshing(data) => QueryState::Refreshing(data),
      _ => QueryState::Loading,
    };

    let future = (self.fetcher)();
    tokio::spawn(async move {
      let result = future.await;
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }
}

// Query is not Clone because the fetcher is boxed and receiver is owned.

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .field("stale_time", &self.stale_time)
      .finish_non_exhaustive()
  }
}
