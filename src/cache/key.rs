//! Query keys: resource plus canonicalized parameters.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Cacheable resources known to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resource {
  /// Filtered, paginated list of diagnostic codes
  DiagnosticCodes,
  /// A single diagnostic code by id
  DiagnosticCode,
  /// The current user's favorite codes
  Favorites,
}

impl Resource {
  pub const ALL: [Resource; 3] = [
    Resource::DiagnosticCodes,
    Resource::DiagnosticCode,
    Resource::Favorites,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Resource::DiagnosticCodes => "diagnostic_codes",
      Resource::DiagnosticCode => "diagnostic_code",
      Resource::Favorites => "favorites",
    }
  }
}

impl fmt::Display for Resource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamValue {
  Str(String),
  Int(i64),
  Bool(bool),
}

impl fmt::Display for ParamValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ParamValue::Str(s) => write!(f, "{:?}", s),
      ParamValue::Int(i) => write!(f, "{}", i),
      ParamValue::Bool(b) => write!(f, "{}", b),
    }
  }
}

impl From<&str> for ParamValue {
  fn from(s: &str) -> Self {
    ParamValue::Str(s.to_string())
  }
}

impl From<String> for ParamValue {
  fn from(s: String) -> Self {
    ParamValue::Str(s)
  }
}

impl From<i64> for ParamValue {
  fn from(i: i64) -> Self {
    ParamValue::Int(i)
  }
}

impl From<u64> for ParamValue {
  /// Values above `i64::MAX` keep their exact digits as a string, so two
  /// distinct values never share a key.
  fn from(i: u64) -> Self {
    match i64::try_from(i) {
      Ok(i) => ParamValue::Int(i),
      Err(_) => ParamValue::Str(i.to_string()),
    }
  }
}

impl From<bool> for ParamValue {
  fn from(b: bool) -> Self {
    ParamValue::Bool(b)
  }
}

/// Canonical parameter map.
///
/// Entries are kept sorted by name and absent values are never stored, so two
/// logically identical parameter sets compare (and hash) equal regardless of
/// the order they were built in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueryParams(BTreeMap<String, ParamValue>);

impl QueryParams {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert `value` under `name`; `None` removes any previous value.
  pub fn set<V: Into<ParamValue>>(&mut self, name: &str, value: Option<V>) {
    match value {
      Some(v) => {
        self.0.insert(name.to_string(), v.into());
      }
      None => {
        self.0.remove(name);
      }
    }
  }

  /// Builder form of [`QueryParams::set`].
  pub fn with<V: Into<ParamValue>>(mut self, name: &str, value: Option<V>) -> Self {
    self.set(name, value);
    self
  }

  pub fn get(&self, name: &str) -> Option<&ParamValue> {
    self.0.get(name)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v))
  }
}

impl fmt::Display for QueryParams {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("{")?;
    for (i, (k, v)) in self.0.iter().enumerate() {
      if i > 0 {
        f.write_str(",")?;
      }
      write!(f, "{}:{}", k, v)?;
    }
    f.write_str("}")
  }
}

/// Identity of a cached fetch result. Pure value: equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
  pub resource: Resource,
  pub params: QueryParams,
}

impl QueryKey {
  pub fn new(resource: Resource, params: QueryParams) -> Self {
    Self { resource, params }
  }

  /// Key with no parameters (e.g. the favorites list).
  pub fn bare(resource: Resource) -> Self {
    Self::new(resource, QueryParams::new())
  }

  /// Stable, fixed-length fingerprint of this key (SHA-256, hex encoded).
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}{}", self.resource, self.params)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn test_insertion_order_does_not_matter() {
    let a = QueryParams::new()
      .with("category", Some("ERROR"))
      .with("skip", Some(0i64))
      .with("limit", Some(12i64));
    let b = QueryParams::new()
      .with("limit", Some(12i64))
      .with("category", Some("ERROR"))
      .with("skip", Some(0i64));
    assert_eq!(
      QueryKey::new(Resource::DiagnosticCodes, a),
      QueryKey::new(Resource::DiagnosticCodes, b)
    );
  }

  #[test]
  fn test_absent_values_are_omitted() {
    let a = QueryParams::new()
      .with("category", Some("ERROR"))
      .with::<&str>("severity", None);
    let b = QueryParams::new().with("category", Some("ERROR"));
    assert_eq!(a, b);
    assert!(a.get("severity").is_none());
  }

  #[test]
  fn test_none_clears_previous_value() {
    let params = QueryParams::new()
      .with("search", Some("disk"))
      .with::<&str>("search", None);
    assert!(params.is_empty());
  }

  #[test]
  fn test_resource_distinguishes_keys() {
    assert_ne!(
      QueryKey::bare(Resource::DiagnosticCodes),
      QueryKey::bare(Resource::Favorites)
    );
  }

  #[test]
  fn test_display_and_fingerprint_are_stable() {
    let key = QueryKey::new(
      Resource::DiagnosticCodes,
      QueryParams::new()
        .with("skip", Some(0i64))
        .with("category", Some("ERROR"))
        .with("is_active", Some(true)),
    );
    assert_eq!(
      key.to_string(),
      r#"diagnostic_codes{category:"ERROR",is_active:true,skip:0}"#
    );
    assert_eq!(key.fingerprint().len(), 64);
    assert_eq!(key.fingerprint(), key.clone().fingerprint());
  }

  #[test]
  fn test_large_unsigned_values_stay_distinct() {
    let key = |skip: u64| {
      QueryKey::new(Resource::DiagnosticCodes, QueryParams::new().with("skip", Some(skip)))
    };
    assert_eq!(
      key(12),
      QueryKey::new(Resource::DiagnosticCodes, QueryParams::new().with("skip", Some(12i64)))
    );
    assert_ne!(key(u64::MAX), key(u64::MAX - 1));
    assert_ne!(key(u64::MAX).fingerprint(), key(i64::MAX as u64).fingerprint());
  }

  proptest! {
    #[test]
    fn prop_permutations_canonicalize(
      entries in proptest::collection::btree_map(
        "[a-z]{1,6}",
        proptest::option::of(0i64..1000),
        0..8,
      ),
    ) {
      let forward = entries
        .iter()
        .fold(QueryParams::new(), |p, (k, v)| p.with(k, *v));
      let reverse = entries
        .iter()
        .rev()
        .fold(QueryParams::new(), |p, (k, v)| p.with(k, *v));
      let present = entries.values().filter(|v| v.is_some()).count();

      prop_assert_eq!(
        QueryKey::new(Resource::DiagnosticCodes, forward.clone()).fingerprint(),
        QueryKey::new(Resource::DiagnosticCodes, reverse.clone()).fingerprint()
      );
      prop_assert_eq!(&forward, &reverse);
      prop_assert_eq!(forward.iter().count(), present);
    }
  }
}
