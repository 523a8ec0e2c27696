//! Cached API client that puts the request cache in front of a gateway.

use color_eyre::Result;
use serde_json::Value;
use tracing::debug;

use crate::cache::{CacheResult, Params, RequestCache, Resources};
use crate::config::Config;

use super::client::ApiGateway;

/// Gateway wrapper with transparent caching.
///
/// Reads go through the cache first and share in-flight fetches. After a
/// confirmed mutation, the caller reports it here so every cached page of
/// the resource stays consistent.
#[derive(Clone)]
pub struct CachedClient<G: ApiGateway> {
  inner: G,
  cache: RequestCache,
  config: Config,
}

impl<G: ApiGateway> CachedClient<G> {
  pub fn new(inner: G, cache: RequestCache, config: Config) -> Self {
    for resource in &config.resources {
      cache.register_shape(&resource.name, resource.shape);
    }
    Self {
      inner,
      cache,
      config,
    }
  }

  pub fn cache(&self) -> &RequestCache {
    &self.cache
  }

  /// Fetch a resource, serving it from the cache when possible.
  pub async fn fetch(&self, resource: &str, params: Option<&Params>) -> Result<CacheResult<Value>> {
    self
      .cache
      .get_or_fetch(resource, params, || {
        let inner = self.inner.clone();
        let resource = resource.to_string();
        let params = params.cloned();
        async move { inner.fetch(&resource, params.as_ref()).await }
      })
      .await
  }

  /// Apply a record returned by the server after an update.
  ///
  /// The record replaces its previous version in every cached page of the
  /// resource. Returns the number of pages patched.
  pub fn apply_update(&self, resource: &str, item: &Value) -> usize {
    let id_field = self.config.id_field(resource);
    let Some(item_id) = item.get(id_field).cloned() else {
      debug!(resource, id_field, "Updated record has no id; invalidating instead");
      self.cache.invalidate(resource);
      return 0;
    };

    self
      .cache
      .update_cache_item(resource, item_id, |_| item.clone(), id_field)
  }

  /// Drop cached pages after a create, delete or reorder, whose effect on
  /// the result set a patch cannot express.
  pub fn apply_structural_change(&self, resources: impl Into<Resources>) {
    self.cache.invalidate(resources);
  }
}
