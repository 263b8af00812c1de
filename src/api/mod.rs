//! Diagnostic codes backend: wire types, HTTP client and the cached client.

mod api_types;
mod cache;
mod cached_client;
mod client;
mod error;
pub mod types;

pub use cache::{code_key, codes_key, favorites_key};
pub use cached_client::CodesClient;
pub use client::ApiClient;
pub use error::ApiError;
pub use types::{
  BulkDeleteResult, BulkUpdate, BulkUpdateResult, CodeVersion, CsvExport, CsvUpload,
  DiagnosticCode, DiagnosticCodeCreate, DiagnosticCodeUpdate, ExportFilter, ImportResult,
  ListParams, Severity, Suggestion,
};
