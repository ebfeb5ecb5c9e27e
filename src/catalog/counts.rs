//! The download-count projection.
//!
//! Counts live apart from the snapshot so an increment never invalidates
//! cached items. Increments apply optimistically, notify subscribers
//! synchronously, then reconcile with the remote table in the background,
//! rolling back on transport failure.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, warn};

use super::client::GatewayError;
use super::types::{format_count, CatalogItem};

/// Remote reconciliation hook: receives the item id and the pre-increment
/// value, resolves to the authoritative count.
type SyncFn = Box<dyn Fn(String, u64) -> BoxFuture<'static, Result<u64, GatewayError>> + Send + Sync>;

type SubscriberFn = Arc<dyn Fn(&str, u64) + Send + Sync>;
type SubscriberMap = Arc<Mutex<HashMap<u64, SubscriberFn>>>;

/// Outcome of one increment: applied locally, then confirmed or rolled
/// back. `Ignored` means an increment for the id was already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
  /// The remote accepted (or rejected without transport failure); carries
  /// the authoritative count now in the projection.
  Confirmed(u64),
  /// Remote sync failed; the projection was rolled back to this value.
  RolledBack(u64),
  /// A concurrent increment for the same id was mid-flight.
  Ignored,
}

#[derive(Default)]
struct CountState {
  counts: HashMap<String, u64>,
  seeded: HashSet<String>,
  in_flight: HashSet<String>,
}

/// Process-wide projection of per-item download counts.
pub struct CountStore {
  state: Mutex<CountState>,
  subscribers: SubscriberMap,
  next_subscriber_id: AtomicU64,
  sync: SyncFn,
}

impl CountStore {
  /// Create a store with the given remote reconciliation hook.
  pub fn new<F, Fut>(sync: F) -> Self
  where
    F: Fn(String, u64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<u64, GatewayError>> + Send + 'static,
  {
    Self {
      state: Mutex::new(CountState::default()),
      subscribers: Arc::new(Mutex::new(HashMap::new())),
      next_subscriber_id: AtomicU64::new(0),
      sync: Box::new(move |id, current| sync(id, current).boxed()),
    }
  }

  fn lock_state(&self) -> MutexGuard<'_, CountState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Record the snapshot count for every id seen for the first time.
  ///
  /// Already-seeded ids keep their current value: a snapshot refresh must
  /// not clobber a count the user has incremented locally.
  pub fn seed(&self, items: &[CatalogItem]) {
    let mut state = self.lock_state();
    let mut added = 0usize;
    for item in items {
      if state.seeded.insert(item.id.clone()) {
        state.counts.insert(item.id.clone(), item.download_count_raw);
        added += 1;
      }
    }
    if added > 0 {
      debug!(added, "seeded download counts");
    }
  }

  /// Current projected count; ids never seen report zero.
  pub fn get(&self, id: &str) -> u64 {
    self.lock_state().counts.get(id).copied().unwrap_or(0)
  }

  /// Current projected count formatted for display.
  pub fn get_formatted(&self, id: &str) -> String {
    format_count(self.get(id))
  }

  /// Whether an increment for this id is currently reconciling.
  pub fn is_in_flight(&self, id: &str) -> bool {
    self.lock_state().in_flight.contains(id)
  }

  /// Optimistically bump a count, notify subscribers, then reconcile with
  /// the remote table.
  ///
  /// Never fails: a sync failure rolls the projection back and is reported
  /// through the returned outcome and the subscription stream. A second
  /// call for an id still mid-flight is ignored, so a rapid double-click
  /// cannot double count.
  pub async fn increment(&self, id: &str) -> IncrementOutcome {
    let current = {
      let mut state = self.lock_state();
      if !state.in_flight.insert(id.to_string()) {
        debug!(%id, "increment already in flight, ignoring");
        return IncrementOutcome::Ignored;
      }
      let current = state.counts.get(id).copied().unwrap_or(0);
      state.counts.insert(id.to_string(), current + 1);
      current
    };

    // Applied locally: the UI sees the click before the network round trip.
    self.notify(id, current + 1);

    let outcome = match (self.sync)(id.to_string(), current).await {
      Ok(authoritative) => {
        debug!(%id, authoritative, "count sync confirmed");
        self.lock_state().counts.insert(id.to_string(), authoritative);
        self.notify(id, authoritative);
        IncrementOutcome::Confirmed(authoritative)
      }
      Err(err) => {
        warn!(%id, error = %err, "count sync failed, rolling back");
        self.lock_state().counts.insert(id.to_string(), current);
        self.notify(id, current);
        IncrementOutcome::RolledBack(current)
      }
    };

    self.lock_state().in_flight.remove(id);
    outcome
  }

  /// Register a callback for count changes across all items.
  ///
  /// The returned handle's only operation is `cancel`; once cancelled the
  /// store keeps no reference to the callback.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&str, u64) + Send + Sync + 'static,
  {
    let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
    self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(id, Arc::new(callback));
    Subscription {
      id,
      subscribers: Arc::downgrade(&self.subscribers),
    }
  }

  /// Subscribe to a single item's count through a pollable cell.
  pub fn watch(&self, item_id: &str) -> CountWatch {
    let cell = Arc::new(AtomicU64::new(self.get(item_id)));
    let watched_id = item_id.to_string();
    let watched_cell = Arc::clone(&cell);
    let subscription = self.subscribe(move |changed_id, count| {
      if changed_id == watched_id {
        watched_cell.store(count, Ordering::Relaxed);
      }
    });

    CountWatch {
      count: cell,
      subscription,
    }
  }

  /// Deliver a count change to every subscriber. Callbacks are snapshotted
  /// under the lock and invoked outside it, so a subscriber may cancel or
  /// subscribe from within its callback; a panicking subscriber does not
  /// block delivery to the others.
  fn notify(&self, id: &str, count: u64) {
    let subscribers: Vec<SubscriberFn> = self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .cloned()
      .collect();

    for callback in subscribers {
      if catch_unwind(AssertUnwindSafe(|| (callback.as_ref())(id, count))).is_err() {
        error!(%id, "count subscriber panicked during delivery");
      }
    }
  }
}

/// Capability handle for an active count subscription.
pub struct Subscription {
  id: u64,
  subscribers: Weak<Mutex<HashMap<u64, SubscriberFn>>>,
}

impl Subscription {
  /// Stop receiving notifications.
  pub fn cancel(self) {
    if let Some(subscribers) = self.subscribers.upgrade() {
      subscribers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&self.id);
    }
  }
}

/// Live view of a single item's count, driven by a subscription.
pub struct CountWatch {
  count: Arc<AtomicU64>,
  subscription: Subscription,
}

impl CountWatch {
  pub fn count(&self) -> u64 {
    self.count.load(Ordering::Relaxed)
  }

  pub fn formatted(&self) -> String {
    format_count(self.count())
  }

  /// Stop tracking the item.
  pub fn cancel(self) {
    self.subscription.cancel();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use reqwest::StatusCode;

  fn item(id: &str, count: u64) -> CatalogItem {
    CatalogItem {
      id: id.to_string(),
      name: id.to_string(),
      tags: Vec::new(),
      classification: None,
      image_url: "https://img/a.png".to_string(),
      download_url: "https://img/a.png".to_string(),
      is_hot: false,
      download_count_raw: count,
      created_time: Utc::now(),
    }
  }

  /// Store whose sync echoes the optimistic value back.
  fn accepting_store() -> CountStore {
    CountStore::new(|_id, current| async move { Ok(current + 1) })
  }

  fn failing_store() -> CountStore {
    CountStore::new(|_id, _current| async move {
      Err(GatewayError::Status {
        status: StatusCode::BAD_GATEWAY,
        body: "upstream sad".to_string(),
      })
    })
  }

  /// Collect notifications into a shared vec.
  fn recording_subscriber(
    store: &CountStore,
  ) -> (Arc<Mutex<Vec<(String, u64)>>>, Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = store.subscribe(move |id, count| {
      sink.lock().unwrap().push((id.to_string(), count));
    });
    (seen, subscription)
  }

  #[test]
  fn test_seed_is_first_write_wins() {
    let store = accepting_store();
    store.seed(&[item("a", 5)]);
    // A later snapshot refresh must not clobber the seeded value.
    store.seed(&[item("a", 50)]);
    assert_eq!(store.get("a"), 5);
  }

  #[test]
  fn test_unseeded_id_reads_zero() {
    let store = accepting_store();
    assert_eq!(store.get("ghost"), 0);
    assert_eq!(store.get_formatted("ghost"), "0");
  }

  #[tokio::test]
  async fn test_increment_confirms_with_authoritative_value() {
    let store = accepting_store();
    store.seed(&[item("a", 10)]);
    let (seen, _sub) = recording_subscriber(&store);

    let outcome = store.increment("a").await;

    assert_eq!(outcome, IncrementOutcome::Confirmed(11));
    assert_eq!(store.get("a"), 11);
    assert_eq!(
      *seen.lock().unwrap(),
      vec![("a".to_string(), 11), ("a".to_string(), 11)]
    );
    assert!(!store.is_in_flight("a"));
  }

  #[tokio::test]
  async fn test_increment_rolls_back_on_transport_failure() {
    let store = failing_store();
    store.seed(&[item("a", 10)]);
    let (seen, _sub) = recording_subscriber(&store);

    let outcome = store.increment("a").await;

    assert_eq!(outcome, IncrementOutcome::RolledBack(10));
    assert_eq!(store.get("a"), 10);
    // Exactly two notifications: optimistic c+1, then the rollback to c.
    assert_eq!(
      *seen.lock().unwrap(),
      vec![("a".to_string(), 11), ("a".to_string(), 10)]
    );
  }

  #[tokio::test]
  async fn test_contended_update_settles_on_remote_value() {
    // The remote saw other clients: it answers with a different count.
    let store = CountStore::new(|_id, _current| async move { Ok(99) });
    store.seed(&[item("a", 10)]);
    let (seen, _sub) = recording_subscriber(&store);

    let outcome = store.increment("a").await;

    assert_eq!(outcome, IncrementOutcome::Confirmed(99));
    assert_eq!(store.get("a"), 99);
    assert_eq!(seen.lock().unwrap().last(), Some(&("a".to_string(), 99)));
  }

  #[tokio::test]
  async fn test_rejected_update_settles_back_via_sentinel() {
    // Gateway contract: a rejected PATCH resolves with the pre-update value.
    let store = CountStore::new(|_id, current| async move { Ok(current) });
    store.seed(&[item("a", 7)]);
    let (seen, _sub) = recording_subscriber(&store);

    let outcome = store.increment("a").await;

    assert_eq!(outcome, IncrementOutcome::Confirmed(7));
    assert_eq!(store.get("a"), 7);
    assert_eq!(
      *seen.lock().unwrap(),
      vec![("a".to_string(), 8), ("a".to_string(), 7)]
    );
  }

  #[tokio::test]
  async fn test_concurrent_increment_for_same_id_is_ignored() {
    let store = Arc::new(CountStore::new(|_id, current| async move {
      tokio::time::sleep(std::time::Duration::from_millis(30)).await;
      Ok(current + 1)
    }));
    store.seed(&[item("a", 0)]);

    let (first, second) = tokio::join!(store.increment("a"), store.increment("a"));

    assert_eq!(first, IncrementOutcome::Confirmed(1));
    assert_eq!(second, IncrementOutcome::Ignored);
    assert_eq!(store.get("a"), 1);
  }

  #[tokio::test]
  async fn test_increments_on_distinct_ids_are_independent() {
    let store = Arc::new(accepting_store());
    store.seed(&[item("a", 1), item("b", 10)]);

    let (ra, rb) = tokio::join!(store.increment("a"), store.increment("b"));

    assert_eq!(ra, IncrementOutcome::Confirmed(2));
    assert_eq!(rb, IncrementOutcome::Confirmed(11));
  }

  #[tokio::test]
  async fn test_panicking_subscriber_does_not_block_delivery() {
    let store = accepting_store();
    store.seed(&[item("a", 0)]);

    let _panicky = store.subscribe(|_id, _count| panic!("bad subscriber"));
    let (seen, _sub) = recording_subscriber(&store);

    store.increment("a").await;
    assert_eq!(seen.lock().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_cancelled_subscription_stops_delivery() {
    let store = accepting_store();
    store.seed(&[item("a", 0)]);

    let (seen, sub) = recording_subscriber(&store);
    store.increment("a").await;
    let delivered = seen.lock().unwrap().len();

    sub.cancel();
    store.increment("a").await;
    assert_eq!(seen.lock().unwrap().len(), delivered);
  }

  #[tokio::test]
  async fn test_watch_tracks_a_single_item() {
    let store = accepting_store();
    store.seed(&[item("a", 5), item("b", 100)]);

    let watch = store.watch("a");
    assert_eq!(watch.count(), 5);

    store.increment("b").await;
    assert_eq!(watch.count(), 5);

    store.increment("a").await;
    assert_eq!(watch.count(), 6);
    assert_eq!(watch.formatted(), "6");
    watch.cancel();
  }
}
