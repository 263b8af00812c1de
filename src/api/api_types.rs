//! Serde types matching the backend's response envelopes.
//!
//! Kept apart from the domain types so the wire shape can drift without
//! leaking into the cache.

use serde::{Deserialize, Serialize};

use super::types::{BulkDeleteResult, BulkUpdateResult, CsvExport, DiagnosticCode, ImportResult};
use crate::cache::CollectionResult;

// ============================================================================
// List endpoint
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiCodeList {
  #[serde(default)]
  pub total: u64,
  #[serde(default)]
  pub items: Vec<DiagnosticCode>,
  #[serde(default)]
  pub skip: u64,
  #[serde(default)]
  pub limit: u64,
}

impl From<ApiCodeList> for CollectionResult<DiagnosticCode> {
  fn from(list: ApiCodeList) -> Self {
    // A short page can never report fewer rows than it carries
    let total = list.total.max(list.items.len() as u64);
    CollectionResult::new(list.items, total)
  }
}

// ============================================================================
// Favorites, bulk, export
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiFavoriteCheck {
  pub is_favorite: bool,
}

#[derive(Debug, Deserialize)]
pub struct ApiBulkDeleteResponse {
  #[serde(default)]
  pub deleted: u64,
  #[serde(default)]
  pub total: u64,
  pub errors: Option<Vec<String>>,
}

impl From<ApiBulkDeleteResponse> for BulkDeleteResult {
  fn from(resp: ApiBulkDeleteResponse) -> Self {
    BulkDeleteResult {
      deleted: resp.deleted,
      total: resp.total,
      errors: resp.errors.unwrap_or_default(),
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiBulkUpdateResponse {
  #[serde(default)]
  pub updated: u64,
  #[serde(default)]
  pub total: u64,
  pub errors: Option<Vec<String>>,
}

impl From<ApiBulkUpdateResponse> for BulkUpdateResult {
  fn from(resp: ApiBulkUpdateResponse) -> Self {
    BulkUpdateResult {
      updated: resp.updated,
      total: resp.total,
      errors: resp.errors.unwrap_or_default(),
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiImportResponse {
  #[serde(default)]
  pub created: u64,
  #[serde(default)]
  pub updated: u64,
  #[serde(default)]
  pub total_processed: u64,
  pub errors: Option<Vec<String>>,
}

impl From<ApiImportResponse> for ImportResult {
  fn from(resp: ApiImportResponse) -> Self {
    ImportResult {
      created: resp.created,
      updated: resp.updated,
      total_processed: resp.total_processed,
      errors: resp.errors.unwrap_or_default(),
    }
  }
}

#[derive(Debug, Serialize)]
pub struct ApiRestoreRequest<'a> {
  pub version_id: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub comment: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct ApiExportResponse {
  pub filename: String,
  #[serde(default)]
  pub content: String,
  #[serde(default)]
  pub count: u64,
}

impl From<ApiExportResponse> for CsvExport {
  fn from(resp: ApiExportResponse) -> Self {
    CsvExport {
      filename: resp.filename,
      content: resp.content,
      count: resp.count,
    }
  }
}

// ============================================================================
// Error bodies
// ============================================================================

/// Error body. The backend's exception handlers emit
/// `{status_code, error, message, details, request_id}`; FastAPI's defaults
/// emit `{detail}` where `detail` is a string or a list of validation errors.
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
  pub message: Option<String>,
  pub error: Option<String>,
  pub detail: Option<serde_json::Value>,
  pub request_id: Option<String>,
}

impl ApiErrorBody {
  /// Best human-readable message in the body, if any.
  pub fn message(&self) -> Option<String> {
    if let Some(m) = &self.message {
      return Some(m.clone());
    }
    if let Some(detail) = &self.detail {
      if let Some(s) = detail.as_str() {
        return Some(s.to_string());
      }
      if let Some(items) = detail.as_array() {
        let msgs: Vec<&str> = items
          .iter()
          .filter_map(|item| item.get("msg").and_then(|v| v.as_str()))
          .collect();
        if !msgs.is_empty() {
          return Some(msgs.join("; "));
        }
      }
    }
    self.error.clone()
  }
}
