//! Cache-first reads that share one fetch between concurrent callers.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::future::Future;
use tracing::debug;

use super::key::{derive_key, Params};
use super::store::RequestCache;
use super::traits::{CacheResult, CacheSource};

type SharedFetch = Shared<BoxFuture<'static, Result<Value, String>>>;

/// A fetch in progress for one cache key.
pub(super) struct Flight {
  id: u64,
  fetch: SharedFetch,
}

impl RequestCache {
  /// Return the cached payload, or run `fetcher` and cache its result.
  ///
  /// Callers that miss while a fetch for the same key is already running
  /// wait for that fetch instead of starting their own. A failed fetch is
  /// reported to every waiter and nothing is stored. If the resource is
  /// invalidated while the fetch runs, the result is still returned but is
  /// not written back.
  pub async fn get_or_fetch<F, Fut>(
    &self,
    resource: &str,
    params: Option<&Params>,
    fetcher: F,
  ) -> Result<CacheResult<Value>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let key = derive_key(resource, params);

    if let Some(joined) = self.hit_or_join(&key) {
      return match joined {
        Joined::Hit(payload) => Ok(CacheResult::from_cache(payload)),
        Joined::Flight(fetch) => await_flight(fetch, CacheSource::Shared).await,
      };
    }

    // Build the request outside the lock; the fetcher may touch the cache.
    let request = fetcher();

    let (fetch, source) = {
      let mut state = self.state();
      if let Some(flight) = state.in_flight.get(&key) {
        // Someone started the same fetch while we were building ours
        (flight.fetch.clone(), CacheSource::Shared)
      } else {
        let id = state.next_flight;
        state.next_flight += 1;

        let fetch = self.launch(id, key.clone(), params.cloned(), request);
        state.in_flight.insert(
          key.clone(),
          Flight {
            id,
            fetch: fetch.clone(),
          },
        );
        debug!(key = %key, "Fetching on cache miss");
        (fetch, CacheSource::Network)
      }
    };

    await_flight(fetch, source).await
  }

  fn hit_or_join(&self, key: &str) -> Option<Joined> {
    let mut state = self.state();
    if let Some(entry) = self.lookup(&mut state, key) {
      return Some(Joined::Hit(entry.payload.clone()));
    }
    state.in_flight.get(key).map(|flight| {
      debug!(key, "Joining in-flight fetch");
      Joined::Flight(flight.fetch.clone())
    })
  }

  fn launch<Fut>(&self, id: u64, key: String, params: Option<Params>, request: Fut) -> SharedFetch
  where
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let cache = self.clone();
    async move {
      let result = request.await.map_err(|e| e.to_string());
      cache.land(id, key, params, &result);
      result
    }
    .boxed()
    .shared()
  }

  /// Retire flight `id` and store its payload, unless an invalidation
  /// detached it in the meantime.
  fn land(&self, id: u64, key: String, params: Option<Params>, result: &Result<Value, String>) {
    let mut state = self.state();
    let current = state.in_flight.get(&key).map(|flight| flight.id) == Some(id);
    if !current {
      debug!(key = %key, "Discarding result of detached fetch");
      return;
    }
    state.in_flight.remove(&key);

    if let Ok(payload) = result {
      self.store(&mut state, key, payload.clone(), params);
    }
  }
}

enum Joined {
  Hit(Value),
  Flight(SharedFetch),
}

async fn await_flight(fetch: SharedFetch, source: CacheSource) -> Result<CacheResult<Value>> {
  let data = fetch.await.map_err(|e| eyre!(e))?;
  Ok(CacheResult { data, source })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  fn page(n: u64) -> Params {
    let mut p = Params::new();
    p.insert("page".into(), json!(n));
    p
  }

  fn ok(payload: Value) -> Result<Value> {
    Ok(payload)
  }

  #[tokio::test]
  async fn test_miss_fetches_and_stores() {
    let cache = RequestCache::default();

    let result = cache
      .get_or_fetch("products", Some(&page(1)), || async { ok(json!([1, 2])) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data, json!([1, 2]));
    assert_eq!(cache.get("products", Some(&page(1))), Some(json!([1, 2])));
    assert_eq!(cache.version(), 0);
  }

  #[tokio::test]
  async fn test_hit_skips_fetcher() {
    let cache = RequestCache::default();
    let calls = Arc::new(AtomicU32::new(0));
    cache.set("products", json!("cached"), None);

    let counter = calls.clone();
    let result = cache
      .get_or_fetch("products", None, move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        ok(Value::Null)
      })
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data, json!("cached"));
  }

  #[tokio::test]
  async fn test_concurrent_misses_share_one_fetch() {
    let cache = RequestCache::default();
    let calls = Arc::new(AtomicU32::new(0));

    let fetch = |cache: RequestCache, calls: Arc<AtomicU32>| async move {
      cache
        .get_or_fetch("employees", Some(&page(1)), move || async move {
          calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(50)).await;
          ok(json!({"data": [{"id": "e1"}]}))
        })
        .await
    };

    let (a, b, c) = tokio::join!(
      fetch(cache.clone(), calls.clone()),
      fetch(cache.clone(), calls.clone()),
      fetch(cache.clone(), calls.clone()),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let results = [a.unwrap(), b.unwrap(), c.unwrap()];
    assert_eq!(
      results
        .iter()
        .filter(|r| r.source == CacheSource::Network)
        .count(),
      1
    );
    assert!(results.iter().all(|r| r.data == json!({"data": [{"id": "e1"}]})));
    assert!(cache.has("employees", Some(&page(1))));
  }

  #[tokio::test]
  async fn test_concurrent_misses_across_tasks() {
    let cache = RequestCache::default();
    let calls = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
      let cache = cache.clone();
      let calls = calls.clone();
      handles.push(tokio::spawn(async move {
        cache
          .get_or_fetch("categories", None, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            ok(json!(["lamps"]))
          })
          .await
          .map(|r| r.data)
      }));
    }

    for handle in handles {
      assert_eq!(handle.await.unwrap().unwrap(), json!(["lamps"]));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_failure_is_shared_and_not_cached() {
    let cache = RequestCache::default();

    let first = cache
      .get_or_fetch("products", None, || async { Err::<Value, _>(eyre!("Service unavailable")) })
      .await;
    let err = first.unwrap_err();
    assert!(err.to_string().contains("Service unavailable"));
    assert!(!cache.has("products", None));

    let second = cache
      .get_or_fetch("products", None, || async { ok(json!([])) })
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::Network);
    assert!(cache.has("products", None));
  }

  #[tokio::test]
  async fn test_invalidation_detaches_in_flight_fetch() {
    let cache = RequestCache::default();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let pending = {
      let cache = cache.clone();
      tokio::spawn(async move {
        cache
          .get_or_fetch("products", None, move || async move {
            let _ = release_rx.await;
            ok(json!("stale"))
          })
          .await
      })
    };

    // Let the spawned task register its flight
    tokio::time::sleep(Duration::from_millis(20)).await;
    cache.invalidate("products");
    release_tx.send(()).unwrap();

    let result = pending.await.unwrap().unwrap();
    assert_eq!(result.data, json!("stale"));
    assert!(!cache.has("products", None));

    let fresh = cache
      .get_or_fetch("products", None, || async { ok(json!("fresh")) })
      .await
      .unwrap();
    assert_eq!(fresh.source, CacheSource::Network);
    assert_eq!(cache.get("products", None), Some(json!("fresh")));
  }

  #[tokio::test]
  async fn test_clear_all_detaches_in_flight_fetch() {
    let cache = RequestCache::default();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let pending = {
      let cache = cache.clone();
      tokio::spawn(async move {
        cache
          .get_or_fetch("employees", Some(&page(1)), move || async move {
            let _ = release_rx.await;
            ok(json!({"data": [{"id": "previous-user"}]}))
          })
          .await
      })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cache.clear_all_cache();
    release_tx.send(()).unwrap();

    let result = pending.await.unwrap().unwrap();
    assert_eq!(result.data, json!({"data": [{"id": "previous-user"}]}));
    assert!(!cache.has("employees", Some(&page(1))));
    assert!(cache.is_empty());

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let fresh = cache
      .get_or_fetch("employees", Some(&page(1)), move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        ok(json!({"data": []}))
      })
      .await
      .unwrap();
    assert_eq!(fresh.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_different_params_fetch_separately() {
    let cache = RequestCache::default();
    let calls = Arc::new(AtomicU32::new(0));

    for n in [1, 2, 1] {
      let calls = calls.clone();
      cache
        .get_or_fetch("products", Some(&page(n)), move || async move {
          calls.fetch_add(1, Ordering::SeqCst);
          ok(json!(n))
        })
        .await
        .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.keys_for("products").len(), 2);
  }
}
