//! Normalized errors surfaced by the API client and the mutation layer.

use thiserror::Error;

/// Error returned to callers of the client and the mutation coordinator.
///
/// `Validation` is raised before any request is issued and never touches the
/// cache. Every other variant comes out of a network call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
  /// No response was received
  #[error("network error: {0}")]
  Transport(String),

  /// The transport gave up waiting for a response
  #[error("request timed out")]
  Timeout,

  /// The server answered with a non-success status
  #[error("server error {status}: {message}")]
  Server {
    status: u16,
    message: String,
    request_id: Option<String>,
  },

  /// Input rejected client-side
  #[error("invalid input: {0}")]
  Validation(String),

  /// The response body did not match the expected shape
  #[error("unexpected response: {0}")]
  Decode(String),
}

impl ApiError {
  pub fn is_validation(&self) -> bool {
    matches!(self, ApiError::Validation(_))
  }

  /// HTTP status for server-reported failures.
  pub fn status(&self) -> Option<u16> {
    match self {
      ApiError::Server { status, .. } => Some(*status),
      _ => None,
    }
  }

  pub fn server(status: u16, message: impl Into<String>) -> Self {
    ApiError::Server {
      status,
      message: message.into(),
      request_id: None,
    }
  }
}

impl From<reqwest::Error> for ApiError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      ApiError::Timeout
    } else if e.is_decode() {
      ApiError::Decode(e.to_string())
    } else if let Some(status) = e.status() {
      ApiError::server(status.as_u16(), e.to_string())
    } else {
      ApiError::Transport(e.to_string())
    }
  }
}

impl From<serde_json::Error> for ApiError {
  fn from(e: serde_json::Error) -> Self {
    ApiError::Decode(e.to_string())
  }
}
