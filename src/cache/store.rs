//! The in-memory request cache shared by all views of a session.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};

use super::flight::Flight;
use super::key::{belongs_to, derive_key, Params};
use super::patch::patch_item;
use super::traits::{CacheEntry, PayloadShape};

/// Eviction settings. The default keeps everything until invalidated.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOptions {
  /// Upper bound on stored entries; the oldest write is evicted first
  pub max_entries: Option<NonZeroUsize>,
  /// Entries older than this read as absent
  pub ttl: Option<Duration>,
}

/// One or more resource names to invalidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources(Vec<String>);

impl Resources {
  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.0.iter().map(String::as_str)
  }
}

impl From<&str> for Resources {
  fn from(name: &str) -> Self {
    Self(vec![name.to_string()])
  }
}

impl From<String> for Resources {
  fn from(name: String) -> Self {
    Self(vec![name])
  }
}

impl From<&[&str]> for Resources {
  fn from(names: &[&str]) -> Self {
    Self(names.iter().map(|n| n.to_string()).collect())
  }
}

impl<const N: usize> From<[&str; N]> for Resources {
  fn from(names: [&str; N]) -> Self {
    Self(names.iter().map(|n| n.to_string()).collect())
  }
}

impl From<Vec<&str>> for Resources {
  fn from(names: Vec<&str>) -> Self {
    Self(names.into_iter().map(String::from).collect())
  }
}

impl From<Vec<String>> for Resources {
  fn from(names: Vec<String>) -> Self {
    Self(names)
  }
}

#[derive(Default)]
pub(super) struct State {
  pub(super) entries: HashMap<String, CacheEntry>,
  pub(super) shapes: HashMap<String, PayloadShape>,
  pub(super) in_flight: HashMap<String, Flight>,
  pub(super) next_flight: u64,
}

struct Inner {
  state: Mutex<State>,
  version: watch::Sender<u64>,
  options: CacheOptions,
}

/// Request cache keyed by resource name and query parameters.
///
/// Cloning yields another handle to the same store. Reads and writes are
/// silent; invalidation, clearing and successful item patches bump the
/// version published by [`RequestCache::subscribe`].
#[derive(Clone)]
pub struct RequestCache {
  inner: Arc<Inner>,
}

impl RequestCache {
  pub fn new(options: CacheOptions) -> Self {
    let (version, _) = watch::channel(0);
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State::default()),
        version,
        options,
      }),
    }
  }

  pub fn options(&self) -> CacheOptions {
    self.inner.options
  }

  pub(super) fn state(&self) -> MutexGuard<'_, State> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Declare where the records of `resource` live inside its payloads.
  pub fn register_shape(&self, resource: &str, shape: PayloadShape) {
    self.state().shapes.insert(resource.to_string(), shape);
  }

  /// Shape used when patching items of `resource`.
  pub fn shape_for(&self, resource: &str) -> PayloadShape {
    self
      .state()
      .shapes
      .get(resource)
      .copied()
      .unwrap_or_default()
  }

  /// Get the cached payload, or `None` on a miss.
  pub fn get(&self, resource: &str, params: Option<&Params>) -> Option<Value> {
    let key = derive_key(resource, params);
    let mut state = self.state();
    self.lookup(&mut state, &key).map(|entry| entry.payload.clone())
  }

  /// Get the cached payload deserialized as `T`.
  pub fn get_as<T: DeserializeOwned>(
    &self,
    resource: &str,
    params: Option<&Params>,
  ) -> Result<Option<T>> {
    match self.get(resource, params) {
      Some(payload) => serde_json::from_value(payload)
        .map(Some)
        .map_err(|e| eyre!("Failed to deserialize cached {}: {}", resource, e)),
      None => Ok(None),
    }
  }

  /// Get the full entry, including its metadata.
  pub fn entry(&self, resource: &str, params: Option<&Params>) -> Option<CacheEntry> {
    let key = derive_key(resource, params);
    let mut state = self.state();
    self.lookup(&mut state, &key).cloned()
  }

  pub fn has(&self, resource: &str, params: Option<&Params>) -> bool {
    let key = derive_key(resource, params);
    let mut state = self.state();
    self.lookup(&mut state, &key).is_some()
  }

  /// Store a payload, replacing whatever was cached under the same key.
  pub fn set(&self, resource: &str, payload: Value, params: Option<&Params>) {
    let key = derive_key(resource, params);
    let mut state = self.state();
    self.store(&mut state, key, payload, params.cloned());
  }

  /// Serialize `value` and store it.
  pub fn set_as<T: Serialize>(
    &self,
    resource: &str,
    value: &T,
    params: Option<&Params>,
  ) -> Result<()> {
    let payload = serde_json::to_value(value)
      .map_err(|e| eyre!("Failed to serialize {} for caching: {}", resource, e))?;
    self.set(resource, payload, params);
    Ok(())
  }

  /// Drop every entry belonging to the given resource(s), whatever their
  /// parameters. Always notifies subscribers once.
  pub fn invalidate(&self, resources: impl Into<Resources>) {
    let resources = resources.into();
    let removed = {
      let mut state = self.state();
      let before = state.entries.len();
      for resource in resources.iter() {
        state.entries.retain(|key, _| !belongs_to(key, resource));
        state.in_flight.retain(|key, _| !belongs_to(key, resource));
      }
      before - state.entries.len()
    };

    info!(resources = ?resources, removed, "Invalidated cache");
    self.notify();
  }

  /// Drop everything. Used when the session identity changes.
  pub fn clear_all_cache(&self) {
    let removed = {
      let mut state = self.state();
      let removed = state.entries.len();
      state.entries.clear();
      state.in_flight.clear();
      removed
    };

    info!(removed, "Cleared cache");
    self.notify();
  }

  /// Replace the record `item_id` in every cached page of `resource`.
  ///
  /// Pages that don't contain the record are left alone. Subscribers are
  /// notified once if at least one page changed. Returns the number of
  /// patched entries.
  ///
  /// The updater runs without the cache locked, so it may read the cache.
  /// A page rewritten or dropped while the updater runs keeps its newer
  /// state.
  pub fn update_cache_item<F>(
    &self,
    resource: &str,
    item_id: impl Into<Value>,
    mut updater: F,
    id_field: &str,
  ) -> usize
  where
    F: FnMut(&Value) -> Value,
  {
    let item_id = item_id.into();

    let (shape, pages) = {
      let mut state = self.state();
      self.purge_expired(&mut state);
      let shape = state.shapes.get(resource).copied().unwrap_or_default();
      let pages: Vec<(String, Value)> = state
        .entries
        .iter()
        .filter(|(key, _)| belongs_to(key, resource))
        .map(|(key, entry)| (key.clone(), entry.payload.clone()))
        .collect();
      (shape, pages)
    };

    let changed: Vec<(String, Value, Value)> = pages
      .into_iter()
      .filter_map(|(key, original)| {
        let mut payload = original.clone();
        patch_item(&mut payload, shape, id_field, &item_id, &mut updater)
          .then_some((key, original, payload))
      })
      .collect();

    let patched = if changed.is_empty() {
      0
    } else {
      let mut state = self.state();
      let now = Utc::now();
      let mut patched = 0;

      for (key, original, payload) in changed {
        let Some(entry) = state.entries.get_mut(&key) else {
          continue;
        };
        if entry.payload != original || self.is_expired(entry) {
          debug!(key = %key, "Cache entry changed during patch; keeping it");
          continue;
        }
        entry.payload = payload;
        entry.stored_at = now;
        patched += 1;
      }
      patched
    };

    debug!(resource, item = %item_id, patched, "Patched cached item");
    if patched > 0 {
      self.notify();
    }
    patched
  }

  /// [`RequestCache::update_cache_item`] with the conventional `id` field.
  pub fn update_cache_item_by_id<F>(
    &self,
    resource: &str,
    item_id: impl Into<Value>,
    updater: F,
  ) -> usize
  where
    F: FnMut(&Value) -> Value,
  {
    self.update_cache_item(resource, item_id, updater, "id")
  }

  /// Watch the cache version. It changes after every invalidation, clear,
  /// and effective item patch.
  pub fn subscribe(&self) -> watch::Receiver<u64> {
    self.inner.version.subscribe()
  }

  pub fn version(&self) -> u64 {
    *self.inner.version.borrow()
  }

  /// Number of live entries.
  pub fn len(&self) -> usize {
    let mut state = self.state();
    self.purge_expired(&mut state);
    state.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Keys currently cached for `resource`, sorted.
  pub fn keys_for(&self, resource: &str) -> Vec<String> {
    let mut state = self.state();
    self.purge_expired(&mut state);
    let mut keys: Vec<String> = state
      .entries
      .keys()
      .filter(|key| belongs_to(key, resource))
      .cloned()
      .collect();
    keys.sort();
    keys
  }

  fn notify(&self) {
    self.inner.version.send_modify(|version| *version += 1);
  }

  fn is_expired(&self, entry: &CacheEntry) -> bool {
    self
      .inner
      .options
      .ttl
      .is_some_and(|ttl| Utc::now() - entry.stored_at > ttl)
  }

  /// Drop every entry that has outlived the TTL. Silent, like a lookup miss.
  fn purge_expired(&self, state: &mut State) {
    if self.inner.options.ttl.is_none() {
      return;
    }
    let before = state.entries.len();
    state.entries.retain(|_, entry| !self.is_expired(entry));
    let expired = before - state.entries.len();
    if expired > 0 {
      debug!(expired, "Dropped expired cache entries");
    }
  }

  /// Find a live entry, dropping it if it has outlived the TTL.
  pub(super) fn lookup<'a>(&self, state: &'a mut State, key: &str) -> Option<&'a CacheEntry> {
    let expired = state.entries.get(key).is_some_and(|e| self.is_expired(e));
    if expired {
      debug!(key, "Cache entry expired");
      state.entries.remove(key);
    }

    let entry = state.entries.get(key);
    debug!(key, hit = entry.is_some(), "Cache lookup");
    entry
  }

  pub(super) fn store(
    &self,
    state: &mut State,
    key: String,
    payload: Value,
    source_params: Option<Params>,
  ) {
    if let Some(max) = self.inner.options.max_entries {
      if !state.entries.contains_key(&key) {
        while state.entries.len() >= max.get() {
          let Some(oldest) = state
            .entries
            .values()
            .min_by_key(|e| e.stored_at)
            .map(|e| e.key.clone())
          else {
            break;
          };
          debug!(key = %oldest, "Evicting oldest cache entry");
          state.entries.remove(&oldest);
        }
      }
    }

    debug!(key = %key, "Cache store");
    let entry = CacheEntry::new(key.clone(), payload, source_params);
    state.entries.insert(key, entry);
  }
}

impl Default for RequestCache {
  fn default() -> Self {
    Self::new(CacheOptions::default())
  }
}

impl std::fmt::Debug for RequestCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.state();
    f.debug_struct("RequestCache")
      .field("entries", &state.entries.len())
      .field("in_flight", &state.in_flight.len())
      .field("version", &self.version())
      .field("options", &self.inner.options)
      .finish()
  }
}
