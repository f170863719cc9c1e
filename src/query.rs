//! Query parameters (filters, pagination) and in-flight request tracking.
//!
//! A list query is identified by its filters and pagination. Fetches for the
//! same query may overlap; only the most recently started one is allowed to
//! commit its result.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Partial record of entity field -> value. Empty means no filtering.
pub type Filters = BTreeMap<String, Value>;

pub const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
  #[default]
  Asc,
  Desc,
}

/// Pagination state of a list query. Page numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
  pub page_number: u32,
  pub page_size: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sort_by: Option<String>,
  #[serde(default)]
  pub sort_order: SortOrder,
}

impl Default for Pagination {
  fn default() -> Self {
    Self {
      page_number: 1,
      page_size: DEFAULT_PAGE_SIZE,
      sort_by: None,
      sort_order: SortOrder::Asc,
    }
  }
}

impl Pagination {
  pub fn new(page_number: u32, page_size: u32) -> Self {
    Self {
      page_number: page_number.max(1),
      page_size: page_size.max(1),
      ..Self::default()
    }
  }

  /// Same size and sort, back on page 1.
  pub fn first_page(&self) -> Self {
    Self {
      page_number: 1,
      ..self.clone()
    }
  }

  pub fn with_page(&self, page_number: u32) -> Self {
    Self {
      page_number,
      ..self.clone()
    }
  }

  /// Zero-based row offset of the first item on this page.
  pub fn offset(&self) -> u64 {
    u64::from(self.page_number.saturating_sub(1)) * u64::from(self.page_size)
  }
}

/// Handle for one started request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
  key: String,
  generation: u64,
}

impl Ticket {
  pub fn key(&self) -> &str {
    &self.key
  }
}

/// Tracks the latest started request per key.
///
/// Starting a request for a key supersedes any request still in flight for
/// that key. Keys belong to a scope (the entity name) so that a whole scope
/// can be cancelled at once.
#[derive(Debug, Default)]
pub struct RequestTracker {
  latest: Mutex<HashMap<String, (String, u64)>>,
  next_generation: AtomicU64,
}

impl RequestTracker {
  pub fn new() -> Self {
    Self::default()
  }

  fn latest(&self) -> MutexGuard<'_, HashMap<String, (String, u64)>> {
    // Entries are plain values, a panic elsewhere cannot leave them torn
    self.latest.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Start a request for `key`, superseding any in-flight one.
  pub fn begin(&self, scope: &str, key: &str) -> Ticket {
    let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
    self
      .latest()
      .insert(key.to_string(), (scope.to_string(), generation));
    Ticket {
      key: key.to_string(),
      generation,
    }
  }

  /// Whether no newer request has been started for the ticket's key.
  pub fn is_latest(&self, ticket: &Ticket) -> bool {
    self
      .latest()
      .get(&ticket.key)
      .is_some_and(|(_, generation)| *generation == ticket.generation)
  }

  /// Mark the request as done. Returns whether it was still the latest.
  pub fn finish(&self, ticket: &Ticket) -> bool {
    let mut latest = self.latest();
    match latest.get(&ticket.key) {
      Some((_, generation)) if *generation == ticket.generation => {
        latest.remove(&ticket.key);
        true
      }
      _ => false,
    }
  }

  /// Supersede every in-flight request of a scope.
  pub fn cancel_scope(&self, scope: &str) -> usize {
    let mut latest = self.latest();
    let before = latest.len();
    latest.retain(|_, (s, _)| s != scope);
    before - latest.len()
  }

  /// Number of requests currently in flight.
  pub fn in_flight(&self) -> usize {
    self.latest().len()
  }
}
