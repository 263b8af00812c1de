//! Caching implementations for diagnostic code types.

use crate::cache::{Cacheable, QueryKey, QueryParams, Resource};

use super::types::{DiagnosticCode, ListParams};

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for DiagnosticCode {
  fn cache_id(&self) -> i64 {
    self.id
  }

  fn entity_type() -> &'static str {
    "diagnostic_code"
  }
}

// ============================================================================
// Query keys
// ============================================================================

impl From<&ListParams> for QueryParams {
  fn from(params: &ListParams) -> Self {
    QueryParams::new()
      .with("skip", params.skip)
      .with("limit", params.limit)
      .with("search", params.search.clone())
      .with("category", params.category.clone())
      .with("severity", params.severity.map(|s| s.as_str()))
      .with("is_active", params.is_active)
  }
}

/// Key for a filtered page of codes.
pub fn codes_key(params: &ListParams) -> QueryKey {
  QueryKey::new(Resource::DiagnosticCodes, params.into())
}

/// Key for a single code by id.
pub fn code_key(id: i64) -> QueryKey {
  QueryKey::new(
    Resource::DiagnosticCode,
    QueryParams::new().with("id", Some(id)),
  )
}

/// Key for the current user's favorites.
pub fn favorites_key() -> QueryKey {
  QueryKey::bare(Resource::Favorites)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::Severity;

  #[test]
  fn test_equivalent_params_share_a_key() {
    let a = ListParams {
      category: Some("ERROR".into()),
      ..ListParams::page(0, 12)
    };
    let b = ListParams {
      skip: Some(0),
      category: Some("ERROR".into()),
      limit: Some(12),
      search: None,
      severity: None,
      is_active: None,
    };
    assert_eq!(codes_key(&a), codes_key(&b));
  }

  #[test]
  fn test_unset_filters_are_not_part_of_the_key() {
    let params = ListParams {
      severity: Some(Severity::Critical),
      ..Default::default()
    };
    let key = codes_key(&params);
    assert_eq!(key.to_string(), r#"diagnostic_codes{severity:"critical"}"#);
  }

  #[test]
  fn test_detail_and_list_keys_differ() {
    assert_ne!(code_key(5), codes_key(&ListParams::default()));
    assert_eq!(code_key(5), code_key(5));
  }
}
