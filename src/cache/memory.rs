//! In-memory cache storage backed by `DashMap`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use super::storage::CacheStorage;
use super::traits::{CacheEntry, QueryKey};
use crate::error::Result;

#[derive(Debug, Clone)]
struct Stored {
  entry: CacheEntry,
  accessed_at: DateTime<Utc>,
}

/// Default process-wide cache storage.
///
/// Keyed by `(entity_name, query hash)`; cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
  inner: Arc<DashMap<(String, String), Stored>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStorage for MemoryStorage {
  fn get(&self, key: &QueryKey) -> Result<Option<CacheEntry>> {
    let map_key = (key.entity_name.clone(), key.cache_hash());
    Ok(self.inner.get_mut(&map_key).map(|mut stored| {
      stored.accessed_at = Utc::now();
      stored.entry.clone()
    }))
  }

  fn put(&self, key: &QueryKey, entry: &CacheEntry) -> Result<()> {
    self.inner.insert(
      (key.entity_name.clone(), key.cache_hash()),
      Stored {
        entry: entry.clone(),
        accessed_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn remove_entity(&self, entity_name: &str) -> Result<usize> {
    let before = self.inner.len();
    self.inner.retain(|(name, _), _| name != entity_name);
    Ok(before.saturating_sub(self.inner.len()))
  }

  fn evict_idle(&self, entity_name: &str, accessed_before: DateTime<Utc>) -> Result<usize> {
    let before = self.inner.len();
    self
      .inner
      .retain(|(name, _), stored| name != entity_name || stored.accessed_at >= accessed_before);
    Ok(before.saturating_sub(self.inner.len()))
  }

  fn count(&self, entity_name: &str) -> Result<usize> {
    Ok(
      self
        .inner
        .iter()
        .filter(|item| item.key().0 == entity_name)
        .count(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::{Filters, Pagination};
  use crate::service::SearchPage;
  use serde_json::{json, Value};

  fn entry() -> CacheEntry {
    CacheEntry::from_page(SearchPage::<Value>::new(
      vec![json!({"id": 1})],
      1,
      &Pagination::default(),
    ))
    .unwrap()
  }

  #[test]
  fn test_clones_share_entries() {
    let storage = MemoryStorage::new();
    let shared = storage.clone();
    let key = QueryKey::new("User", Filters::new(), Pagination::default());

    let e = entry();
    storage.put(&key, &e).unwrap();
    assert_eq!(shared.get(&key).unwrap(), Some(e));
    assert_eq!(shared.count("User").unwrap(), 1);
  }

  #[test]
  fn test_evict_idle_is_scoped_to_entity() {
    let storage = MemoryStorage::new();
    let user = QueryKey::new("User", Filters::new(), Pagination::default());
    let role = QueryKey::new("Role", Filters::new(), Pagination::default());
    storage.put(&user, &entry()).unwrap();
    storage.put(&role, &entry()).unwrap();

    let future = Utc::now() + chrono::Duration::minutes(1);
    assert_eq!(storage.evict_idle("User", future).unwrap(), 1);
    assert_eq!(storage.count("User").unwrap(), 0);
    assert_eq!(storage.count("Role").unwrap(), 1);
  }
}
