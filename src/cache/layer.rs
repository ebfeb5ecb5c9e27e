//! Cache layer that orchestrates the snapshot lifecycle with network
//! fetching.
//!
//! Each cache key moves through a small state machine: empty, loading (one
//! in-flight fetch shared by every concurrent caller), fresh (served from
//! process memory). A persistent session tier sits behind memory and in
//! front of the network; fetch errors return the key to empty and
//! propagate to every waiter.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{CacheSource, Cacheable, LoadError, QueryKey, SnapshotResult};

/// An in-memory snapshot with its fetch time.
#[derive(Clone)]
struct Snapshot<T> {
  items: Arc<Vec<T>>,
  fetched_at: DateTime<Utc>,
}

type SharedFetch<T> = Shared<BoxFuture<'static, Result<Snapshot<T>, LoadError>>>;
type KeyMap<T> = Arc<Mutex<HashMap<String, KeyState<T>>>>;

enum KeyState<T> {
  /// A fetch is in flight; every caller shares its outcome.
  Loading(SharedFetch<T>),
  /// Snapshot held in process memory.
  Fresh(Snapshot<T>),
}

/// Cache layer for whole-collection snapshots.
///
/// This layer sits between the application and the network client,
/// providing transparent two-tier caching with request coalescing.
pub struct CacheLayer<T: Cacheable, S: CacheStorage> {
  storage: Arc<S>,
  keys: KeyMap<T>,
  /// How long before a snapshot is considered expired
  ttl: Duration,
}

impl<T: Cacheable, S: CacheStorage> CacheLayer<T, S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
      keys: Arc::new(Mutex::new(HashMap::new())),
      ttl: Duration::minutes(5),
    }
  }

  /// Set the snapshot time-to-live.
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  /// Check if a snapshot has outlived the TTL.
  fn is_stale(&self, fetched_at: DateTime<Utc>) -> bool {
    Utc::now() - fetched_at > self.ttl
  }

  fn lock_keys(&self) -> MutexGuard<'_, HashMap<String, KeyState<T>>> {
    self.keys.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Resolve a snapshot for the given key.
  ///
  /// 1. Serve from memory while the snapshot is within the TTL
  /// 2. Join an already in-flight fetch for the same key
  /// 3. Restore from the session tier if a fresh-enough copy exists
  /// 4. Otherwise start one network fetch shared by all concurrent callers
  ///
  /// Errors return the key to empty and reach every waiting caller.
  pub async fn get<K, F, Fut>(&self, key: &K, fetcher: F) -> Result<SnapshotResult<T>, LoadError>
  where
    K: QueryKey,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>, LoadError>> + Send + 'static,
  {
    let hash = key.cache_hash();
    let desc = key.description();

    // Memory tier, or join an in-flight fetch.
    let joined: Option<SharedFetch<T>> = {
      let mut keys = self.lock_keys();

      let expired = matches!(
        keys.get(&hash),
        Some(KeyState::Fresh(snap)) if self.is_stale(snap.fetched_at)
      );
      if expired {
        debug!(key = %desc, "memory snapshot expired");
        keys.remove(&hash);
      }

      match keys.get(&hash) {
        Some(KeyState::Fresh(snap)) => {
          debug!(key = %desc, "snapshot served from memory");
          return Ok(SnapshotResult {
            items: snap.items.clone(),
            fetched_at: snap.fetched_at,
            source: CacheSource::Memory,
          });
        }
        Some(KeyState::Loading(shared)) => {
          debug!(key = %desc, "joining in-flight fetch");
          Some(shared.clone())
        }
        None => None,
      }
    };

    if let Some(shared) = joined {
      let snap = shared.await?;
      return Ok(SnapshotResult {
        items: snap.items,
        fetched_at: snap.fetched_at,
        source: CacheSource::Network,
      });
    }

    // The key was empty. Re-check under the lock (another caller may have
    // started a fetch meanwhile), then try the session tier before the
    // network.
    let shared = {
      let mut keys = self.lock_keys();

      if let Some(KeyState::Loading(shared)) = keys.get(&hash) {
        shared.clone()
      } else if let Some(KeyState::Fresh(snap)) = keys.get(&hash) {
        return Ok(SnapshotResult {
          items: snap.items.clone(),
          fetched_at: snap.fetched_at,
          source: CacheSource::Memory,
        });
      } else {
        if let Some(snap) = self.load_persisted(&hash, &desc) {
          keys.insert(hash.clone(), KeyState::Fresh(snap.clone()));
          return Ok(SnapshotResult {
            items: snap.items,
            fetched_at: snap.fetched_at,
            source: CacheSource::Session,
          });
        }

        debug!(key = %desc, "starting network fetch");
        let shared = Self::start_fetch(
          self.storage.clone(),
          self.keys.clone(),
          hash.clone(),
          desc.clone(),
          fetcher(),
        );
        keys.insert(hash.clone(), KeyState::Loading(shared.clone()));
        shared
      }
    };

    let snap = shared.await?;
    Ok(SnapshotResult {
      items: snap.items,
      fetched_at: snap.fetched_at,
      source: CacheSource::Network,
    })
  }

  /// Wrap a fetch so that its completion updates the key state exactly
  /// once, no matter how many callers share the future.
  fn start_fetch<Fut>(
    storage: Arc<S>,
    keys: KeyMap<T>,
    hash: String,
    desc: String,
    fut: Fut,
  ) -> SharedFetch<T>
  where
    Fut: Future<Output = Result<Vec<T>, LoadError>> + Send + 'static,
  {
    async move {
      match fut.await {
        Ok(items) => {
          let snap = Snapshot {
            items: Arc::new(items),
            fetched_at: Utc::now(),
          };
          debug!(key = %desc, count = snap.items.len(), "fetch complete");

          // A failed write only means an always-cold session tier.
          if let Err(err) = storage.store_snapshot(&hash, &snap.items, snap.fetched_at) {
            warn!(key = %desc, error = %err, "failed to persist snapshot");
          }

          // A fetch superseded by invalidate() still lands here; later
          // calls simply reuse the outcome.
          keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash, KeyState::Fresh(snap.clone()));
          Ok(snap)
        }
        Err(err) => {
          warn!(key = %desc, error = %err, "fetch failed");
          keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&hash);
          Err(err)
        }
      }
    }
    .boxed()
    .shared()
  }

  /// Restore a snapshot from the session tier. Snapshots older than the TTL
  /// are discarded and cleared rather than served.
  fn load_persisted(&self, hash: &str, desc: &str) -> Option<Snapshot<T>> {
    let persisted = match self.storage.load_snapshot::<T>(hash) {
      Ok(persisted) => persisted?,
      Err(err) => {
        warn!(key = %desc, error = %err, "session store unreadable, treating as cold");
        return None;
      }
    };

    if self.is_stale(persisted.cached_at) {
      debug!(key = %desc, "persisted snapshot expired");
      if let Err(err) = self.storage.clear(hash) {
        warn!(key = %desc, error = %err, "failed to clear expired snapshot");
      }
      return None;
    }

    debug!(key = %desc, count = persisted.items.len(), "snapshot restored from session store");
    Some(Snapshot {
      items: Arc::new(persisted.items),
      fetched_at: persisted.cached_at,
    })
  }

  /// Drop the key from memory and clear its persisted copy. An in-flight
  /// fetch is not cancelled; it may still complete and repopulate the key.
  pub fn invalidate<K: QueryKey>(&self, key: &K) {
    let hash = key.cache_hash();
    self.lock_keys().remove(&hash);
    if let Err(err) = self.storage.clear(&hash) {
      warn!(key = %key.description(), error = %err, "failed to clear persisted snapshot");
    }
    debug!(key = %key.description(), "cache invalidated");
  }

  /// Spawn the background expiry sweep: snapshots past the TTL transition
  /// back to empty so the next read re-fetches. The task ends when the
  /// cache is dropped.
  pub fn spawn_expiry_sweeper(&self, period: std::time::Duration) -> tokio::task::JoinHandle<()> {
    let keys = Arc::downgrade(&self.keys);
    let ttl = self.ttl;
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      loop {
        interval.tick().await;
        let Some(keys) = keys.upgrade() else { break };
        let mut keys = keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.retain(|hash, state| match state {
          KeyState::Fresh(snap) if Utc::now() - snap.fetched_at > ttl => {
            debug!(key = %hash, "sweeping expired snapshot");
            false
          }
          _ => true,
        });
      }
    })
  }
}

impl<T: Cacheable, S: CacheStorage> Clone for CacheLayer<T, S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      keys: Arc::clone(&self.keys),
      ttl: self.ttl,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{NoopStorage, PersistedSnapshot};
  use color_eyre::Result as EyreResult;
  use serde::{Deserialize, Serialize};
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct TestItem {
    id: String,
  }

  impl Cacheable for TestItem {
    fn entity_type() -> &'static str {
      "test_item"
    }
  }

  struct TestKey;

  impl QueryKey for TestKey {
    fn cache_hash(&self) -> String {
      "test-key".to_string()
    }

    fn description(&self) -> String {
      "test key".to_string()
    }
  }

  fn items(ids: &[&str]) -> Vec<TestItem> {
    ids
      .iter()
      .map(|id| TestItem { id: id.to_string() })
      .collect()
  }

  /// In-memory storage stub with a controllable timestamp.
  #[derive(Default)]
  struct MemStorage {
    rows: Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
  }

  impl CacheStorage for MemStorage {
    fn store_snapshot<T: Cacheable>(
      &self,
      key: &str,
      items: &[T],
      cached_at: DateTime<Utc>,
    ) -> EyreResult<()> {
      let data = serde_json::to_vec(items)?;
      self
        .rows
        .lock()
        .unwrap()
        .insert(key.to_string(), (data, cached_at));
      Ok(())
    }

    fn load_snapshot<T: Cacheable>(&self, key: &str) -> EyreResult<Option<PersistedSnapshot<T>>> {
      let rows = self.rows.lock().unwrap();
      let Some((data, cached_at)) = rows.get(key) else {
        return Ok(None);
      };
      Ok(Some(PersistedSnapshot {
        items: serde_json::from_slice(data)?,
        cached_at: *cached_at,
      }))
    }

    fn clear(&self, key: &str) -> EyreResult<()> {
      self.rows.lock().unwrap().remove(key);
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_memory_hit_skips_fetcher() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let layer: CacheLayer<TestItem, NoopStorage> = CacheLayer::new(NoopStorage);

    for _ in 0..3 {
      let fetches = fetches.clone();
      let result = layer
        .get(&TestKey, move || async move {
          fetches.fetch_add(1, Ordering::SeqCst);
          Ok(items(&["a", "b"]))
        })
        .await
        .unwrap();
      assert_eq!(result.items.len(), 2);
    }

    assert_eq!(fetches.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_concurrent_gets_coalesce_into_one_fetch() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let layer: CacheLayer<TestItem, NoopStorage> = CacheLayer::new(NoopStorage);

    let fetcher = |fetches: Arc<AtomicUsize>| {
      move || async move {
        fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        Ok(items(&["a"]))
      }
    };

    let (r1, r2) = tokio::join!(
      layer.get(&TestKey, fetcher(fetches.clone())),
      layer.get(&TestKey, fetcher(fetches.clone()))
    );

    assert_eq!(*r1.unwrap().items, items(&["a"]));
    assert_eq!(*r2.unwrap().items, items(&["a"]));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_error_propagates_to_all_waiters_and_empties_key() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let layer: CacheLayer<TestItem, NoopStorage> = CacheLayer::new(NoopStorage);

    let failing = |fetches: Arc<AtomicUsize>| {
      move || async move {
        fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        Err(LoadError::new("boom"))
      }
    };

    let (r1, r2) = tokio::join!(
      layer.get(&TestKey, failing(fetches.clone())),
      layer.get(&TestKey, failing(fetches.clone()))
    );
    assert!(r1.is_err());
    assert!(r2.is_err());
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    // The key went back to empty: a later call fetches again.
    let result = layer
      .get(&TestKey, || async { Ok(items(&["a"])) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.items.len(), 1);
  }

  #[tokio::test]
  async fn test_zero_ttl_refetches() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let layer: CacheLayer<TestItem, NoopStorage> =
      CacheLayer::new(NoopStorage).with_ttl(Duration::zero());

    for _ in 0..2 {
      let fetches = fetches.clone();
      layer
        .get(&TestKey, move || async move {
          fetches.fetch_add(1, Ordering::SeqCst);
          Ok(items(&["a"]))
        })
        .await
        .unwrap();
    }

    assert_eq!(fetches.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_fresh_persisted_snapshot_served_without_network() {
    let storage = MemStorage::default();
    storage
      .store_snapshot("test-key", &items(&["a", "b"]), Utc::now())
      .unwrap();
    let layer: CacheLayer<TestItem, MemStorage> = CacheLayer::new(storage);

    let result = layer
      .get(&TestKey, || async {
        panic!("fetcher must not run on a session hit")
      })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Session);
    assert_eq!(result.items.len(), 2);
  }

  #[tokio::test]
  async fn test_expired_persisted_snapshot_triggers_fetch() {
    let storage = MemStorage::default();
    // Persisted ten minutes ago: past the five-minute default TTL.
    storage
      .store_snapshot(
        "test-key",
        &items(&["stale"]),
        Utc::now() - Duration::minutes(10),
      )
      .unwrap();
    let layer: CacheLayer<TestItem, MemStorage> = CacheLayer::new(storage);

    let result = layer
      .get(&TestKey, || async { Ok(items(&["fresh"])) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.items[0].id, "fresh");
    // The stale persisted copy was cleared, then replaced by the new fetch.
    let persisted = layer
      .storage
      .load_snapshot::<TestItem>("test-key")
      .unwrap()
      .unwrap();
    assert_eq!(persisted.items[0].id, "fresh");
  }

  #[tokio::test]
  async fn test_invalidate_clears_both_tiers() {
    let storage = MemStorage::default();
    let layer: CacheLayer<TestItem, MemStorage> = CacheLayer::new(storage);
    let fetches = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
      let fetches = fetches.clone();
      layer
        .get(&TestKey, move || async move {
          fetches.fetch_add(1, Ordering::SeqCst);
          Ok(items(&["a"]))
        })
        .await
        .unwrap();
      layer.invalidate(&TestKey);
    }

    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert!(layer
      .storage
      .load_snapshot::<TestItem>("test-key")
      .unwrap()
      .is_none());
  }
}
