//! Cache key derivation.
//!
//! A key is the resource name, optionally followed by [`SEPARATOR`] and a
//! canonical JSON rendering of the query parameters. Object fields are sorted
//! at every depth so that the same logical query always maps to the same key.

use serde_json::{Map, Value};

/// Query parameters for a resource (filters, sort, pagination).
pub type Params = Map<String, Value>;

/// Separator between the resource name and the serialized parameters.
pub const SEPARATOR: char = ':';

/// Derive the cache key for a resource and an optional parameter set.
///
/// Empty parameters are treated the same as no parameters.
pub fn derive_key(resource: &str, params: Option<&Params>) -> String {
  match params {
    Some(p) if !p.is_empty() => {
      let mut key = String::with_capacity(resource.len() + 32);
      key.push_str(resource);
      key.push(SEPARATOR);
      write_object(&mut key, p);
      key
    }
    _ => resource.to_string(),
  }
}

/// Check whether `key` was derived from `resource`.
pub fn belongs_to(key: &str, resource: &str) -> bool {
  match key.strip_prefix(resource) {
    Some(rest) => rest.is_empty() || rest.starts_with(SEPARATOR),
    None => false,
  }
}

fn write_value(out: &mut String, value: &Value) {
  match value {
    Value::Object(map) => write_object(out, map),
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_value(out, item);
      }
      out.push(']');
    }
    // Scalars already have a single canonical rendering
    scalar => out.push_str(&scalar.to_string()),
  }
}

fn write_object(out: &mut String, map: &Map<String, Value>) {
  let mut fields: Vec<(&String, &Value)> = map.iter().collect();
  fields.sort_by(|a, b| a.0.cmp(b.0));

  out.push('{');
  for (i, (name, value)) in fields.into_iter().enumerate() {
    if i > 0 {
      out.push(',');
    }
    out.push_str(&Value::String(name.clone()).to_string());
    out.push(':');
    write_value(out, value);
  }
  out.push('}');
}
