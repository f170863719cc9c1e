//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::{CacheEntry, QueryKey};
use crate::error::{CrudError, Result};

/// Trait for cache storage backends.
///
/// Calls are synchronous and short; the store serializes read-modify-write
/// sequences on top of them.
pub trait CacheStorage: Send + Sync {
  /// Get the entry for a query, marking it as accessed.
  fn get(&self, key: &QueryKey) -> Result<Option<CacheEntry>>;

  /// Insert or replace the entry for a query.
  fn put(&self, key: &QueryKey, entry: &CacheEntry) -> Result<()>;

  /// Remove every entry of an entity, whatever its filters or pagination.
  fn remove_entity(&self, entity_name: &str) -> Result<usize>;

  /// Remove entries of an entity not accessed since `accessed_before`.
  fn evict_idle(&self, entity_name: &str, accessed_before: DateTime<Utc>) -> Result<usize>;

  /// Number of entries stored for an entity.
  fn count(&self, entity_name: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
///
/// Survives restarts, which lets the command-line front end serve a
/// previously fetched page while it is still fresh.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Create a new SQLite storage at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| CrudError::storage(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CrudError::storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Create a throwaway in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| CrudError::storage(format!("Failed to open in-memory cache: {}", e)))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| CrudError::storage("Could not determine data directory"))?;

    Ok(data_dir.join("crudkit").join("cache.db"))
  }

  fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| CrudError::storage(format!("Lock poisoned: {}", e)))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| CrudError::storage(format!("Failed to run cache migrations: {}", e)))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS query_cache (
    entity_name TEXT NOT NULL,
    query_hash TEXT NOT NULL,
    query_description TEXT NOT NULL,
    entry BLOB NOT NULL,
    accessed_at TEXT NOT NULL,
    PRIMARY KEY (entity_name, query_hash)
);

CREATE INDEX IF NOT EXISTS idx_query_cache_accessed
    ON query_cache(entity_name, accessed_at);
"#;

impl CacheStorage for SqliteStorage {
  fn get(&self, key: &QueryKey) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;
    let hash = key.cache_hash();

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT entry FROM query_cache WHERE entity_name = ? AND query_hash = ?",
        params![key.entity_name, hash],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| CrudError::storage(format!("Failed to read cache entry: {}", e)))?;

    let Some(data) = data else {
      return Ok(None);
    };

    conn
      .execute(
        "UPDATE query_cache SET accessed_at = ? WHERE entity_name = ? AND query_hash = ?",
        params![format_datetime(Utc::now()), key.entity_name, hash],
      )
      .map_err(|e| CrudError::storage(format!("Failed to touch cache entry: {}", e)))?;

    let entry: CacheEntry = serde_json::from_slice(&data)
      .map_err(|e| CrudError::storage(format!("Failed to deserialize cache entry: {}", e)))?;
    Ok(Some(entry))
  }

  fn put(&self, key: &QueryKey, entry: &CacheEntry) -> Result<()> {
    let conn = self.conn()?;
    let data = serde_json::to_vec(entry)
      .map_err(|e| CrudError::storage(format!("Failed to serialize cache entry: {}", e)))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO query_cache (entity_name, query_hash, query_description, entry, accessed_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          key.entity_name,
          key.cache_hash(),
          key.description(),
          data,
          format_datetime(Utc::now())
        ],
      )
      .map_err(|e| CrudError::storage(format!("Failed to store cache entry: {}", e)))?;

    Ok(())
  }

  fn remove_entity(&self, entity_name: &str) -> Result<usize> {
    self
      .conn()?
      .execute(
        "DELETE FROM query_cache WHERE entity_name = ?",
        params![entity_name],
      )
      .map_err(|e| CrudError::storage(format!("Failed to invalidate {}: {}", entity_name, e)))
  }

  fn evict_idle(&self, entity_name: &str, accessed_before: DateTime<Utc>) -> Result<usize> {
    // RFC 3339 in UTC with fixed precision sorts lexicographically
    self
      .conn()?
      .execute(
        "DELETE FROM query_cache WHERE entity_name = ? AND accessed_at < ?",
        params![entity_name, format_datetime(accessed_before)],
      )
      .map_err(|e| CrudError::storage(format!("Failed to evict idle entries: {}", e)))
  }

  fn count(&self, entity_name: &str) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM query_cache WHERE entity_name = ?",
        params![entity_name],
        |row| row.get(0),
      )
      .map_err(|e| CrudError::storage(format!("Failed to count cache entries: {}", e)))?;
    Ok(usize::try_from(count).unwrap_or_default())
  }
}

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
