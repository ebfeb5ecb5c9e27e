//! Generic two-tier snapshot caching.
//!
//! This module provides a domain-agnostic caching mechanism that:
//! - Holds whole-collection snapshots in process memory with a TTL
//! - Coalesces concurrent fetches for the same key into one request
//! - Persists snapshots to a session-scoped SQLite store behind memory
//! - Treats a corrupt or unreadable persisted copy as a cache miss

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, NoopStorage, PersistedSnapshot, SqliteStorage};
pub use traits::{CacheSource, Cacheable, LoadError, QueryKey, SnapshotResult};
