//! Core types for the query cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::Result;
use crate::query::{Filters, Pagination};
use crate::service::{Entity, SearchPage};

/// Structural identity of one cached list result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryKey {
  pub entity_name: String,
  pub filters: Filters,
  pub pagination: Pagination,
}

impl QueryKey {
  pub fn new(entity_name: impl Into<String>, filters: Filters, pagination: Pagination) -> Self {
    Self {
      entity_name: entity_name.into(),
      filters,
      pagination,
    }
  }

  /// Stable hash of filters and pagination.
  ///
  /// Filters are a sorted map and JSON objects serialize with sorted keys,
  /// so two structurally equal keys always hash the same.
  pub fn cache_hash(&self) -> String {
    let input = serde_json::json!({
      "filters": self.filters,
      "pagination": self.pagination,
    });

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(self.entity_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(input.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Human-readable form for logs.
  pub fn description(&self) -> String {
    let mut out = format!(
      "{} page {} (size {})",
      self.entity_name, self.pagination.page_number, self.pagination.page_size
    );
    if let Some(sort_by) = &self.pagination.sort_by {
      out.push_str(&format!(" sorted by {} {:?}", sort_by, self.pagination.sort_order));
    }
    if !self.filters.is_empty() {
      let filters: Vec<String> = self
        .filters
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
      out.push_str(&format!(" where {}", filters.join(", ")));
    }
    out
  }
}

/// Last-known result for one query key.
///
/// Items are kept in JSON form so entries of every entity type share a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
  pub items: Vec<Value>,
  pub total_count: u64,
  pub page_number: u32,
  pub page_size: u32,
  pub total_pages: u32,
  pub has_next_page: bool,
  pub has_previous_page: bool,
  /// When the entry was fetched from the service
  pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn from_page<T: Entity>(page: SearchPage<T>) -> Result<Self> {
    let items = page
      .items
      .iter()
      .map(serde_json::to_value)
      .collect::<Result<Vec<_>, _>>()?;

    Ok(Self {
      items,
      total_count: page.total_count,
      page_number: page.page_number,
      page_size: page.page_size,
      total_pages: page.total_pages,
      has_next_page: page.has_next_page,
      has_previous_page: page.has_previous_page,
      cached_at: Utc::now(),
    })
  }

  /// Convert back into a typed page.
  pub fn to_page<T: Entity>(&self) -> Result<SearchPage<T>> {
    let items = self
      .items
      .iter()
      .cloned()
      .map(serde_json::from_value)
      .collect::<Result<Vec<T>, _>>()?;

    Ok(SearchPage {
      items,
      total_count: self.total_count,
      page_number: self.page_number,
      page_size: self.page_size,
      total_pages: self.total_pages,
      has_next_page: self.has_next_page,
      has_previous_page: self.has_previous_page,
    })
  }

  /// Whether the entry is older than `stale_time`. A zero stale time makes
  /// every entry stale.
  pub fn is_stale(&self, stale_time: Duration) -> bool {
    match (Utc::now() - self.cached_at).to_std() {
      Ok(age) => age >= stale_time,
      // cached_at in the future (clock skew)
      Err(_) => false,
    }
  }
}

/// Where a fetch result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Entry was present and fresh, no request made
  CacheFresh,
  /// Fetched from the service and committed
  Network,
  /// Fetched, but a newer request for the same key took over
  Superseded,
}

/// Result of a cache-first fetch.
#[derive(Debug, Clone)]
pub struct CacheResult {
  /// The entry now in the store for the key, if any
  pub entry: Option<CacheEntry>,
  pub source: CacheSource,
}
