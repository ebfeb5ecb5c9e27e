//! Core traits and types for the snapshot caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Trait for entities held in cached snapshots.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Entity type name for storage organization (e.g., "catalog_item")
  fn entity_type() -> &'static str;
}

/// A logical cache key: one per distinct fetch parameterization.
pub trait QueryKey {
  /// Stable, fixed-length key for storage lookups.
  fn cache_hash(&self) -> String;

  /// Human-readable description for logs.
  fn description(&self) -> String;
}

/// Load failure surfaced to every coalesced waiter of a fetch, and to the
/// query handles consumers poll. `Clone` because one in-flight fetch can
/// fan out to many callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct LoadError {
  /// HTTP-style status, when the provider answered with one.
  pub status: Option<u16>,
  pub message: String,
}

impl LoadError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      status: None,
      message: message.into(),
    }
  }
}

/// Indicates where a resolved snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data fetched from the network
  Network,
  /// Snapshot held in process memory
  Memory,
  /// Snapshot restored from the session store
  Session,
}

/// A resolved snapshot plus metadata about its origin.
#[derive(Debug, Clone)]
pub struct SnapshotResult<T> {
  /// The cached items, shared by every reader of this snapshot
  pub items: Arc<Vec<T>>,
  /// When the snapshot was fetched
  pub fetched_at: DateTime<Utc>,
  /// Where the snapshot was resolved from
  pub source: CacheSource,
}
