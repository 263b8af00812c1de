//! Debounced autocomplete for the code search box.

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::{ApiError, CodesClient, Suggestion};
use crate::config::Config;

/// Inputs shorter than this clear the suggestions without a request.
pub const MIN_QUERY_CHARS: usize = 2;

const DEFAULT_LIMIT: u32 = 10;

type SuggestFn =
  Arc<dyn Fn(String) -> BoxFuture<'static, Result<Vec<Suggestion>, ApiError>> + Send + Sync>;

/// Suggestion fetcher that waits for typing to pause.
///
/// Each new input aborts the request scheduled for the previous one, so only
/// the latest input ever produces suggestions.
pub struct Autocomplete {
  fetcher: SuggestFn,
  delay: Duration,
  input: String,
  suggestions: Vec<Suggestion>,
  pending: Option<(JoinHandle<()>, mpsc::UnboundedReceiver<Vec<Suggestion>>)>,
}

impl Autocomplete {
  pub fn new<F, Fut>(delay: Duration, fetcher: F) -> Self
  where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Suggestion>, ApiError>> + Send + 'static,
  {
    Self {
      fetcher: Arc::new(move |query| fetcher(query).boxed()),
      delay,
      input: String::new(),
      suggestions: Vec::new(),
      pending: None,
    }
  }

  /// Autocomplete against the backend with the configured delay.
  pub fn for_client(client: CodesClient, config: &Config) -> Self {
    Self::new(config.cache.autocomplete_delay(), move |query| {
      let client = client.clone();
      async move { client.autocomplete(&query, DEFAULT_LIMIT).await }
    })
  }

  pub fn input(&self) -> &str {
    &self.input
  }

  pub fn suggestions(&self) -> &[Suggestion] {
    &self.suggestions
  }

  /// Whether a request is scheduled or in flight.
  pub fn is_pending(&self) -> bool {
    self.pending.is_some()
  }

  /// Record new input, cancelling any request scheduled for older input.
  pub fn set_input(&mut self, input: &str) {
    self.cancel();
    self.input = input.to_string();

    if input.chars().count() < MIN_QUERY_CHARS {
      self.suggestions.clear();
      return;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let fetcher = Arc::clone(&self.fetcher);
    let delay = self.delay;
    let query = self.input.clone();

    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      debug!(%query, "fetching suggestions");
      let suggestions = match fetcher(query.clone()).await {
        Ok(suggestions) => suggestions,
        Err(error) => {
          warn!(%query, %error, "autocomplete failed");
          Vec::new()
        }
      };
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(suggestions);
    });
    self.pending = Some((handle, rx));
  }

  /// Poll for suggestions. Returns `true` if they changed.
  pub fn poll(&mut self) -> bool {
    let Some((_, receiver)) = &mut self.pending else {
      return false;
    };

    match receiver.try_recv() {
      Ok(suggestions) => {
        self.suggestions = suggestions;
        self.pending = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.pending = None;
        false
      }
    }
  }

  fn cancel(&mut self) {
    if let Some((handle, _)) = self.pending.take() {
      handle.abort();
    }
  }
}

impl Drop for Autocomplete {
  fn drop(&mut self) {
    self.cancel();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  fn suggestion(code: &str) -> Suggestion {
    Suggestion {
      code: code.to_string(),
      description: format!("Description for {}", code),
      category: "ERROR".to_string(),
      match_type: "code".to_string(),
    }
  }

  fn recording(delay_ms: u64) -> (Autocomplete, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let autocomplete = Autocomplete::new(Duration::from_millis(delay_ms), move |query| {
      let seen = seen_clone.clone();
      async move {
        seen.lock().unwrap().push(query.clone());
        Ok(vec![suggestion(&query)])
      }
    });
    (autocomplete, seen)
  }

  #[tokio::test]
  async fn test_short_input_clears_without_request() {
    let (mut autocomplete, seen) = recording(5);
    autocomplete.set_input("E0");
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(autocomplete.poll());
    assert_eq!(autocomplete.suggestions().len(), 1);

    autocomplete.set_input("E");
    assert!(autocomplete.suggestions().is_empty());
    assert!(!autocomplete.is_pending());
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!autocomplete.poll());
    assert_eq!(*seen.lock().unwrap(), vec!["E0"]);
  }

  #[tokio::test]
  async fn test_only_latest_input_is_fetched() {
    let (mut autocomplete, seen) = recording(50);
    autocomplete.set_input("E0");
    autocomplete.set_input("E00");
    autocomplete.set_input("E001");
    assert!(!autocomplete.poll());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(autocomplete.poll());
    assert_eq!(*seen.lock().unwrap(), vec!["E001"]);
    assert_eq!(autocomplete.suggestions()[0].code, "E001");
  }

  #[tokio::test]
  async fn test_error_yields_no_suggestions() {
    let mut autocomplete = Autocomplete::new(Duration::from_millis(5), |_query| async {
      Err(ApiError::server(500, "boom"))
    });
    autocomplete.set_input("timeout");
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(autocomplete.poll());
    assert!(autocomplete.suggestions().is_empty());
    assert!(!autocomplete.is_pending());
  }

  #[tokio::test]
  async fn test_min_length_counts_characters() {
    let (mut autocomplete, seen) = recording(5);
    // One multi-byte character is still one character
    autocomplete.set_input("é");
    assert!(!autocomplete.is_pending());
    autocomplete.set_input("éé");
    assert!(autocomplete.is_pending());
    tokio::time::sleep(Duration::from_millis(40)).await;
    autocomplete.poll();
    assert_eq!(*seen.lock().unwrap(), vec!["éé"]);
  }
}
