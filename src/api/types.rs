use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::ApiError;

/// Severity level of a diagnostic code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Low,
  Medium,
  High,
  Critical,
}

impl Severity {
  pub fn as_str(&self) -> &'static str {
    match self {
      Severity::Low => "low",
      Severity::Medium => "medium",
      Severity::High => "high",
      Severity::Critical => "critical",
    }
  }
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Severity {
  type Err = ApiError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "low" => Ok(Severity::Low),
      "medium" => Ok(Severity::Medium),
      "high" => Ok(Severity::High),
      "critical" => Ok(Severity::Critical),
      other => Err(ApiError::Validation(format!(
        "Unknown severity '{}' (expected low, medium, high or critical)",
        other
      ))),
    }
  }
}

/// A diagnostic code as returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticCode {
  pub id: i64,
  pub code: String,
  pub description: String,
  pub category: Option<String>,
  pub subcategory: Option<String>,
  pub severity: Option<Severity>,
  pub is_active: bool,
  #[serde(deserialize_with = "deserialize_timestamp")]
  pub created_at: DateTime<Utc>,
  #[serde(deserialize_with = "deserialize_timestamp")]
  pub updated_at: DateTime<Utc>,
}

/// Payload for creating a diagnostic code
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticCodeCreate {
  pub code: String,
  pub description: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub subcategory: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub severity: Option<Severity>,
  pub is_active: bool,
}

impl DiagnosticCodeCreate {
  pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
    Self {
      code: code.into(),
      description: description.into(),
      category: None,
      subcategory: None,
      severity: None,
      is_active: true,
    }
  }

  /// Check field limits before anything is sent.
  pub fn validate(&self) -> Result<(), ApiError> {
    if self.code.trim().is_empty() {
      return Err(ApiError::Validation("Code is required".into()));
    }
    if self.code.chars().count() > MAX_CODE_LEN {
      return Err(ApiError::Validation(format!(
        "Code must be at most {} characters",
        MAX_CODE_LEN
      )));
    }
    if self.description.trim().is_empty() {
      return Err(ApiError::Validation("Description is required".into()));
    }
    check_label("Category", self.category.as_deref())?;
    check_label("Subcategory", self.subcategory.as_deref())?;
    Ok(())
  }
}

/// Partial update for a diagnostic code. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiagnosticCodeUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub subcategory: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub severity: Option<Severity>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub is_active: Option<bool>,
}

impl DiagnosticCodeUpdate {
  pub fn is_empty(&self) -> bool {
    self == &Self::default()
  }

  pub fn validate(&self) -> Result<(), ApiError> {
    if self.is_empty() {
      return Err(ApiError::Validation("Update contains no fields".into()));
    }
    if let Some(description) = &self.description {
      if description.trim().is_empty() {
        return Err(ApiError::Validation("Description is required".into()));
      }
    }
    check_label("Category", self.category.as_deref())?;
    check_label("Subcategory", self.subcategory.as_deref())?;
    Ok(())
  }

  /// Overwrite the present fields on `code`.
  pub fn apply(&self, code: &mut DiagnosticCode) {
    if let Some(description) = &self.description {
      code.description = description.clone();
    }
    if let Some(category) = &self.category {
      code.category = Some(category.clone());
    }
    if let Some(subcategory) = &self.subcategory {
      code.subcategory = Some(subcategory.clone());
    }
    if let Some(severity) = self.severity {
      code.severity = Some(severity);
    }
    if let Some(is_active) = self.is_active {
      code.is_active = is_active;
    }
  }
}

/// Filter and pagination parameters for listing codes.
///
/// Absent fields are left to the backend's defaults (`skip=0, limit=20`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
  pub skip: Option<u64>,
  pub limit: Option<u64>,
  pub search: Option<String>,
  pub category: Option<String>,
  pub severity: Option<Severity>,
  pub is_active: Option<bool>,
}

impl ListParams {
  pub fn page(skip: u64, limit: u64) -> Self {
    Self {
      skip: Some(skip),
      limit: Some(limit),
      ..Default::default()
    }
  }

  pub fn validate(&self) -> Result<(), ApiError> {
    match self.limit {
      Some(limit) if !(1..=MAX_PAGE_SIZE).contains(&limit) => Err(ApiError::Validation(format!(
        "Page size must be between 1 and {}",
        MAX_PAGE_SIZE
      ))),
      _ => Ok(()),
    }
  }

  /// Query-string pairs for the list endpoint, absent fields omitted.
  pub fn to_query(&self) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(skip) = self.skip {
      query.push(("skip", skip.to_string()));
    }
    if let Some(limit) = self.limit {
      query.push(("limit", limit.to_string()));
    }
    if let Some(search) = &self.search {
      query.push(("search", search.clone()));
    }
    if let Some(category) = &self.category {
      query.push(("category", category.clone()));
    }
    if let Some(severity) = self.severity {
      query.push(("severity", severity.to_string()));
    }
    if let Some(is_active) = self.is_active {
      query.push(("is_active", is_active.to_string()));
    }
    query
  }
}

/// Filters accepted by the CSV export endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportFilter {
  pub category: Option<String>,
  pub severity: Option<Severity>,
  pub is_active: Option<bool>,
}

impl ExportFilter {
  pub fn to_query(&self) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(category) = &self.category {
      query.push(("category", category.clone()));
    }
    if let Some(severity) = self.severity {
      query.push(("severity", severity.to_string()));
    }
    if let Some(is_active) = self.is_active {
      query.push(("is_active", is_active.to_string()));
    }
    query
  }
}

/// Autocomplete suggestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
  pub code: String,
  pub description: String,
  #[serde(default)]
  pub category: String,
  /// Which field matched: code, description or category
  pub match_type: String,
}

/// Outcome of a bulk delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkDeleteResult {
  pub deleted: u64,
  pub total: u64,
  pub errors: Vec<String>,
}

/// Fields a bulk update can change on every selected code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkUpdate {
  pub category: Option<String>,
  pub severity: Option<Severity>,
  pub is_active: Option<bool>,
}

impl BulkUpdate {
  pub fn is_empty(&self) -> bool {
    self == &Self::default()
  }

  pub fn validate(&self) -> Result<(), ApiError> {
    if self.is_empty() {
      return Err(ApiError::Validation("Update contains no fields".into()));
    }
    check_label("Category", self.category.as_deref())
  }

  /// The same change as a single-record update.
  pub fn as_update(&self) -> DiagnosticCodeUpdate {
    DiagnosticCodeUpdate {
      category: self.category.clone(),
      severity: self.severity,
      is_active: self.is_active,
      ..Default::default()
    }
  }

  /// Query-string pairs for the bulk update endpoint.
  pub fn to_query(&self) -> Vec<(&'static str, String)> {
    ExportFilter {
      category: self.category.clone(),
      severity: self.severity,
      is_active: self.is_active,
    }
    .to_query()
  }
}

/// Outcome of a bulk update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkUpdateResult {
  pub updated: u64,
  pub total: u64,
  pub errors: Vec<String>,
}

/// Outcome of a CSV import. Rows whose code already exists update it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportResult {
  pub created: u64,
  pub updated: u64,
  pub total_processed: u64,
  /// One message per rejected row, e.g. `Row 3: ...`
  pub errors: Vec<String>,
}

/// A CSV file to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvUpload {
  pub filename: String,
  pub content: Vec<u8>,
}

impl CsvUpload {
  pub fn new(filename: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
    Self {
      filename: filename.into(),
      content: content.into(),
    }
  }

  pub fn validate(&self) -> Result<(), ApiError> {
    if !self.filename.to_lowercase().ends_with(".csv") {
      return Err(ApiError::Validation("Only CSV files are supported".into()));
    }
    if self.content.is_empty() {
      return Err(ApiError::Validation("CSV file is empty".into()));
    }
    Ok(())
  }
}

/// A stored revision of a diagnostic code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeVersion {
  pub id: i64,
  pub diagnostic_code_id: i64,
  pub version_number: i64,
  pub code: String,
  pub description: String,
  pub category: Option<String>,
  pub severity: Option<Severity>,
  pub is_active: bool,
  /// create, update, delete or restore
  pub change_type: String,
  #[serde(default)]
  pub change_summary: Option<String>,
  #[serde(deserialize_with = "deserialize_timestamp")]
  pub created_at: DateTime<Utc>,
}

/// CSV export produced by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvExport {
  pub filename: String,
  pub content: String,
  pub count: u64,
}

const MAX_CODE_LEN: usize = 50;
const MAX_LABEL_LEN: usize = 100;
const MAX_PAGE_SIZE: u64 = 100;

fn check_label(field: &str, value: Option<&str>) -> Result<(), ApiError> {
  match value {
    Some(v) if v.chars().count() > MAX_LABEL_LEN => Err(ApiError::Validation(format!(
      "{} must be at most {} characters",
      field, MAX_LABEL_LEN
    ))),
    _ => Ok(()),
  }
}

/// Accept RFC 3339 timestamps as well as the naive ISO form the backend emits
/// for timezone-less columns (treated as UTC).
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
  D: Deserializer<'de>,
{
  let s = String::deserialize(deserializer)?;
  parse_timestamp(&s).map_err(serde::de::Error::custom)
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Ok(dt.with_timezone(&Utc));
  }
  NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
    .map(|dt| dt.and_utc())
    .map_err(|e| format!("Failed to parse timestamp '{}': {}", s, e))
}
