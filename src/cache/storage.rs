//! Cache storage trait and SQLite implementation.
//!
//! The storage tier is the process-session analog of browser session
//! storage: a side channel written only by the cache layer, never a source
//! of truth. Unreadable or corrupt rows count as cache misses.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use super::traits::Cacheable;

/// A snapshot restored from the persistent tier.
#[derive(Debug, Clone)]
pub struct PersistedSnapshot<T> {
  /// The persisted items in order
  pub items: Vec<T>,
  /// When the snapshot was originally fetched
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync + 'static {
  /// Persist a whole snapshot under a cache key.
  fn store_snapshot<T: Cacheable>(
    &self,
    key: &str,
    items: &[T],
    cached_at: DateTime<Utc>,
  ) -> Result<()>;

  /// Load the persisted snapshot for a cache key, if any.
  fn load_snapshot<T: Cacheable>(&self, key: &str) -> Result<Option<PersistedSnapshot<T>>>;

  /// Drop the persisted snapshot for a cache key.
  fn clear(&self, key: &str) -> Result<()>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn store_snapshot<T: Cacheable>(
    &self,
    _key: &str,
    _items: &[T],
    _cached_at: DateTime<Utc>,
  ) -> Result<()> {
    Ok(()) // Discard
  }

  fn load_snapshot<T: Cacheable>(&self, _key: &str) -> Result<Option<PersistedSnapshot<T>>> {
    Ok(None) // Always miss
  }

  fn clear(&self, _key: &str) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Create a new SQLite storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Create an in-memory storage, mainly for tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<std::path::PathBuf> {
    let cache_dir = dirs::cache_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
      .ok_or_else(|| eyre!("Could not determine cache directory"))?;

    Ok(cache_dir.join("mural").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for the snapshot cache. One row per cache key: the serialized
/// item array plus the fetch timestamp that drives TTL expiry.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshot_cache (
    cache_key TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (cache_key, entity_type)
);
"#;

impl CacheStorage for SqliteStorage {
  fn store_snapshot<T: Cacheable>(
    &self,
    key: &str,
    items: &[T],
    cached_at: DateTime<Utc>,
  ) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let data =
      serde_json::to_vec(items).map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO snapshot_cache (cache_key, entity_type, data, cached_at)
         VALUES (?, ?, ?, ?)",
        params![key, T::entity_type(), data, cached_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to store snapshot: {}", e))?;

    Ok(())
  }

  fn load_snapshot<T: Cacheable>(&self, key: &str) -> Result<Option<PersistedSnapshot<T>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT data, cached_at FROM snapshot_cache
         WHERE cache_key = ? AND entity_type = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(Vec<u8>, String)> = stmt
      .query_row(params![key, T::entity_type()], |row| {
        Ok((row.get(0)?, row.get(1)?))
      })
      .ok();

    let (data, cached_at_str) = match row {
      Some(row) => row,
      None => return Ok(None),
    };

    // A corrupt row is a cache miss, not an error.
    let items: Vec<T> = match serde_json::from_slice(&data) {
      Ok(items) => items,
      Err(e) => {
        warn!(key, error = %e, "discarding unreadable persisted snapshot");
        return Ok(None);
      }
    };
    let cached_at = match parse_datetime(&cached_at_str) {
      Ok(ts) => ts,
      Err(e) => {
        warn!(key, error = %e, "discarding persisted snapshot with bad timestamp");
        return Ok(None);
      }
    };

    Ok(Some(PersistedSnapshot { items, cached_at }))
  }

  fn clear(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM snapshot_cache WHERE cache_key = ?", params![key])
      .map_err(|e| eyre!("Failed to clear snapshot: {}", e))?;

    Ok(())
  }
}

/// Parse an RFC 3339 timestamp stored alongside a snapshot.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
