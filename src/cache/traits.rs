//! Core types for the request cache.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::key::Params;

/// A stored response for one (resource, parameters) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  /// Derived cache key
  pub key: String,
  /// The response data as returned by the API
  pub payload: Value,
  /// When the payload was written (or last patched)
  pub stored_at: DateTime<Utc>,
  /// Parameters the payload was fetched with, kept for diagnostics
  pub source_params: Option<Params>,
}

impl CacheEntry {
  pub fn new(key: String, payload: Value, source_params: Option<Params>) -> Self {
    Self {
      key,
      payload,
      stored_at: Utc::now(),
      source_params,
    }
  }
}

/// Where the records of a resource live inside its payload.
///
/// Used by item patching to find the list to update.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PayloadShape {
  /// Paginated envelope: `{ "data": [...], "meta": {...} }`
  Envelope,
  /// The payload itself is the list
  List,
  /// Try the envelope's `data` array first, then a bare list
  #[default]
  Detect,
}

impl PayloadShape {
  /// Locate the list of records inside `payload`, if this shape has one.
  pub fn records_mut<'a>(&self, payload: &'a mut Value) -> Option<&'a mut Vec<Value>> {
    match self {
      Self::Envelope => payload.get_mut("data").and_then(Value::as_array_mut),
      Self::List => payload.as_array_mut(),
      Self::Detect => {
        let is_envelope = payload.get("data").is_some_and(Value::is_array);
        if is_envelope {
          Self::Envelope.records_mut(payload)
        } else {
          Self::List.records_mut(payload)
        }
      }
    }
  }
}

/// Result from a cache-first read, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  pub fn shared(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Shared,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Served from the cache without a fetch
  Cache,
  /// This caller ran the fetch
  Network,
  /// Joined a fetch another caller had already started
  Shared,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Cache => write!(f, "cache"),
      Self::Network => write!(f, "network"),
      Self::Shared => write!(f, "shared"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_envelope_shape_finds_data() {
    let mut payload = json!({"data": [{"id": 1}], "meta": {"page": 1}});
    let records = PayloadShape::Envelope.records_mut(&mut payload).unwrap();
    assert_eq!(records.len(), 1);
  }

  #[test]
  fn test_envelope_shape_rejects_bare_list() {
    let mut payload = json!([{"id": 1}]);
    assert!(PayloadShape::Envelope.records_mut(&mut payload).is_none());
  }

  #[test]
  fn test_list_shape_ignores_envelope() {
    let mut payload = json!({"data": [{"id": 1}]});
    assert!(PayloadShape::List.records_mut(&mut payload).is_none());
  }

  #[test]
  fn test_detect_prefers_data_field() {
    let mut envelope = json!({"data": [{"id": 1}, {"id": 2}]});
    assert_eq!(
      PayloadShape::Detect.records_mut(&mut envelope).map(|r| r.len()),
      Some(2)
    );

    let mut list = json!([{"id": 1}]);
    assert_eq!(
      PayloadShape::Detect.records_mut(&mut list).map(|r| r.len()),
      Some(1)
    );

    let mut object = json!({"data": {"id": 1}});
    assert!(PayloadShape::Detect.records_mut(&mut object).is_none());
  }

  #[test]
  fn test_shape_from_yaml() {
    let shape: PayloadShape = serde_yaml::from_str("envelope").unwrap();
    assert_eq!(shape, PayloadShape::Envelope);
    let shape: PayloadShape = serde_yaml::from_str("list").unwrap();
    assert_eq!(shape, PayloadShape::List);
  }
}
