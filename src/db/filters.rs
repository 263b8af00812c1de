//! Named filter presets persisted in SQLite.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::api::types::parse_timestamp;
use crate::api::{codes_key, ListParams, Severity};
use crate::config::Config;

/// A saved set of list filters. Paging is never saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFilter {
  pub id: i64,
  pub name: String,
  pub search: Option<String>,
  pub category: Option<String>,
  pub severity: Option<Severity>,
  pub created_at: DateTime<Utc>,
}

impl SavedFilter {
  /// List parameters for this filter, starting at the first page.
  pub fn to_list_params(&self, limit: Option<u64>) -> ListParams {
    ListParams {
      skip: None,
      limit,
      search: self.search.clone(),
      category: self.category.clone(),
      severity: self.severity,
      is_active: None,
    }
  }
}

/// Fingerprint of the filter part of `params`, paging excluded.
fn filter_fingerprint(params: &ListParams) -> String {
  let filter = ListParams {
    search: params.search.clone(),
    category: params.category.clone(),
    severity: params.severity,
    ..Default::default()
  };
  codes_key(&filter).fingerprint()
}

const FILTERS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS saved_filters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    search TEXT,
    category TEXT,
    severity TEXT,
    key_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_saved_filters_key ON saved_filters(key_hash);
"#;

const SELECT_FILTER: &str =
  "SELECT id, name, search, category, severity, created_at FROM saved_filters";

/// SQLite-backed store of saved filters.
pub struct SavedFilterStore {
  conn: Mutex<Connection>,
}

impl SavedFilterStore {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  pub fn open(path: &Path) -> Result<Self> {
    let conn = super::open(path, FILTERS_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  pub fn default_path() -> Result<PathBuf> {
    Ok(Config::data_dir()?.join("filters.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Save the filter part of `params` under `name`.
  pub fn save(&self, name: &str, params: &ListParams) -> Result<SavedFilter> {
    let name = name.trim();
    if name.is_empty() {
      return Err(eyre!("Filter name must not be empty"));
    }

    // Stored at microsecond precision
    let created_at = Utc::now().trunc_subsecs(6);
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT INTO saved_filters (name, search, category, severity, key_hash, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          name,
          params.search,
          params.category,
          params.severity.map(|s| s.as_str()),
          filter_fingerprint(params),
          created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        ],
      )
      .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _)
          if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
          eyre!("A filter named '{}' already exists", name)
        }
        e => eyre!("Failed to save filter: {}", e),
      })?;

    let id = conn.last_insert_rowid();
    debug!(id, name, "saved filter");

    Ok(SavedFilter {
      id,
      name: name.to_string(),
      search: params.search.clone(),
      category: params.category.clone(),
      severity: params.severity,
      created_at,
    })
  }

  /// All saved filters, oldest first.
  pub fn list(&self) -> Result<Vec<SavedFilter>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(&format!("{} ORDER BY created_at, id", SELECT_FILTER))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], read_row)
      .map_err(|e| eyre!("Failed to query filters: {}", e))?;

    let mut filters = Vec::new();
    for row in rows {
      let row = row.map_err(|e| eyre!("Failed to read filter: {}", e))?;
      filters.push(row.into_filter()?);
    }
    Ok(filters)
  }

  pub fn load(&self, id: i64) -> Result<Option<SavedFilter>> {
    let conn = self.conn()?;
    let row = conn
      .query_row(&format!("{} WHERE id = ?", SELECT_FILTER), params![id], read_row)
      .optional()
      .map_err(|e| eyre!("Failed to load filter {}: {}", id, e))?;
    row.map(FilterRow::into_filter).transpose()
  }

  /// Find a saved filter selecting the same codes as `params`.
  pub fn find_by_params(&self, params: &ListParams) -> Result<Option<SavedFilter>> {
    let conn = self.conn()?;
    let row = conn
      .query_row(
        &format!("{} WHERE key_hash = ? ORDER BY id LIMIT 1", SELECT_FILTER),
        params![filter_fingerprint(params)],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up filter: {}", e))?;
    row.map(FilterRow::into_filter).transpose()
  }

  /// Delete a filter. Returns whether it existed.
  pub fn delete(&self, id: i64) -> Result<bool> {
    let conn = self.conn()?;
    let deleted = conn
      .execute("DELETE FROM saved_filters WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete filter {}: {}", id, e))?;
    Ok(deleted > 0)
  }
}

/// Raw column values; parsing happens outside the rusqlite row callback.
struct FilterRow {
  id: i64,
  name: String,
  search: Option<String>,
  category: Option<String>,
  severity: Option<String>,
  created_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<FilterRow> {
  Ok(FilterRow {
    id: row.get(0)?,
    name: row.get(1)?,
    search: row.get(2)?,
    category: row.get(3)?,
    severity: row.get(4)?,
    created_at: row.get(5)?,
  })
}

impl FilterRow {
  fn into_filter(self) -> Result<SavedFilter> {
    let severity = self
      .severity
      .map(|s| s.parse::<Severity>())
      .transpose()
      .map_err(|e| eyre!("Corrupt filter {}: {}", self.id, e))?;
    let created_at = parse_timestamp(&self.created_at)
      .map_err(|e| eyre!("Corrupt filter {}: {}", self.id, e))?;

    Ok(SavedFilter {
      id: self.id,
      name: self.name,
      search: self.search,
      category: self.category,
      severity,
      created_at,
    })
  }
}
