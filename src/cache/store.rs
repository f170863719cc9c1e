//! Query cache store: cache-first fetching, invalidation and optimistic
//! patches with rollback.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use super::memory::MemoryStorage;
use super::storage::CacheStorage;
use super::traits::{CacheEntry, CacheResult, CacheSource, QueryKey};
use crate::error::{CrudError, Result};
use crate::key::identity_of;
use crate::query::{RequestTracker, Ticket};
use crate::service::{Entity, SearchPage};

/// Kind of optimistic change applied to a cached page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOp {
  Insert,
  Update,
  Delete,
}

/// How to undo one patch if other patches landed on top of it.
#[derive(Debug, Clone, PartialEq)]
enum Undo {
  /// The patch matched no row
  Nothing,
  Inserted { item: Value },
  Updated { previous: Value, patched: Value },
  Deleted { index: usize, previous: Value },
}

/// Point-in-time snapshot taken right before a patch.
///
/// Owned by the mutation that created it; handing it to
/// [`QueryCacheStore::revert`] restores the page to its pre-patch state.
/// It only applies to the fetch it was taken from: once the page has been
/// refetched, the server's copy wins.
#[derive(Debug, Clone, PartialEq)]
pub struct Revert {
  key: QueryKey,
  fetched_at: DateTime<Utc>,
  identifier_fields: Vec<String>,
  before: Vec<Value>,
  before_total: u64,
  after: Vec<Value>,
  undo: Undo,
}

impl Revert {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Items as they were before the patch.
  pub fn snapshot(&self) -> &[Value] {
    &self.before
  }
}

/// Compute the items of a page after an optimistic change.
///
/// Rows are matched on their identifier fields; rows lacking them (an insert
/// still waiting for a server-assigned id) never match.
pub fn apply_patch(
  items: &[Value],
  identifier_fields: &[String],
  op: PatchOp,
  item: &Value,
) -> Result<Vec<Value>> {
  Ok(patch_with_undo(items, identifier_fields, op, item)?.0)
}

fn patch_with_undo(
  items: &[Value],
  identifier_fields: &[String],
  op: PatchOp,
  item: &Value,
) -> Result<(Vec<Value>, Undo)> {
  if op == PatchOp::Insert {
    let mut next = Vec::with_capacity(items.len() + 1);
    next.push(item.clone());
    next.extend(items.iter().cloned());
    return Ok((next, Undo::Inserted { item: item.clone() }));
  }

  let target = identity_of(identifier_fields, item)?;
  let position = items
    .iter()
    .position(|row| identity_of(identifier_fields, row).is_ok_and(|id| id == target));

  let Some(index) = position else {
    return Ok((items.to_vec(), Undo::Nothing));
  };

  let mut next = items.to_vec();
  if op == PatchOp::Update {
    let previous = next[index].clone();
    let patched = merge_fields(&previous, item);
    next[index] = patched.clone();
    Ok((next, Undo::Updated { previous, patched }))
  } else {
    let previous = next.remove(index);
    Ok((next, Undo::Deleted { index, previous }))
  }
}

/// Shallow merge: fields of `changes` overwrite those of `row`.
fn merge_fields(row: &Value, changes: &Value) -> Value {
  match (row, changes) {
    (Value::Object(current), Value::Object(updates)) => {
      let mut merged = current.clone();
      for (field, value) in updates {
        merged.insert(field.clone(), value.clone());
      }
      Value::Object(merged)
    }
    _ => changes.clone(),
  }
}

fn same_row(identifier_fields: &[String], row: &Value, other: &Value) -> bool {
  match (identity_of(identifier_fields, row), identity_of(identifier_fields, other)) {
    (Ok(a), Ok(b)) => a == b,
    _ => false,
  }
}

/// Undo one patch on a page other patches have changed since. Rows are
/// found by identity, so a row is never restored next to a newer copy.
fn undo_on(items: &mut Vec<Value>, identifier_fields: &[String], undo: &Undo) {
  match undo {
    Undo::Nothing => {}
    Undo::Inserted { item } => {
      // Pending inserts usually have no id yet
      let pos = if identity_of(identifier_fields, item).is_ok() {
        items.iter().position(|row| same_row(identifier_fields, row, item))
      } else {
        items.iter().position(|row| row == item)
      };
      if let Some(pos) = pos {
        items.remove(pos);
      }
    }
    Undo::Updated { previous, patched } => {
      let row = items
        .iter_mut()
        .find(|row| same_row(identifier_fields, row, patched));
      // Leave rows a later patch has changed again
      if let Some(row) = row.filter(|row| **row == *patched) {
        *row = previous.clone();
      }
    }
    Undo::Deleted { index, previous } => {
      if !items.iter().any(|row| same_row(identifier_fields, row, previous)) {
        items.insert((*index).min(items.len()), previous.clone());
      }
    }
  }
}

fn adjusted_total(total: u64, old_len: usize, new_len: usize) -> u64 {
  if new_len >= old_len {
    total.saturating_add((new_len - old_len) as u64)
  } else {
    total.saturating_sub((old_len - new_len) as u64)
  }
}

/// The cache shared by every feature of an application.
///
/// Wraps a [`CacheStorage`] backend. Every read-modify-write sequence
/// (patch, revert, commit, invalidate) runs under one short lock that is
/// never held across an await, so no reader observes a half-applied change.
pub struct QueryCacheStore {
  storage: Arc<dyn CacheStorage>,
  requests: RequestTracker,
  write: Mutex<()>,
}

impl QueryCacheStore {
  pub fn new(storage: impl CacheStorage + 'static) -> Self {
    Self {
      storage: Arc::new(storage),
      requests: RequestTracker::new(),
      write: Mutex::new(()),
    }
  }

  /// Store backed by a fresh [`MemoryStorage`].
  pub fn in_memory() -> Self {
    Self::new(MemoryStorage::new())
  }

  fn write_lock(&self) -> Result<MutexGuard<'_, ()>> {
    self
      .write
      .lock()
      .map_err(|e| CrudError::storage(format!("Lock poisoned: {}", e)))
  }

  pub fn get(&self, key: &QueryKey) -> Result<Option<CacheEntry>> {
    self.storage.get(key)
  }

  pub fn set(&self, key: &QueryKey, entry: CacheEntry) -> Result<()> {
    let _guard = self.write_lock()?;
    self.storage.put(key, &entry)
  }

  /// Number of cached pages for an entity.
  pub fn len(&self, entity_name: &str) -> Result<usize> {
    self.storage.count(entity_name)
  }

  /// Drop every cached page of an entity and supersede its in-flight fetches,
  /// so a response computed before a mutation cannot repopulate the cache.
  pub fn invalidate(&self, entity_name: &str) -> Result<usize> {
    let _guard = self.write_lock()?;
    let removed = self.storage.remove_entity(entity_name)?;
    let cancelled = self.requests.cancel_scope(entity_name);
    info!(entity = entity_name, removed, cancelled, "invalidated cache");
    Ok(removed)
  }

  /// Remove pages of an entity not read for `idle`.
  pub fn collect_garbage(&self, entity_name: &str, idle: Duration) -> Result<usize> {
    let idle = chrono::Duration::from_std(idle).unwrap_or(chrono::Duration::MAX);
    let cutoff = Utc::now()
      .checked_sub_signed(idle)
      .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
    let _guard = self.write_lock()?;
    let evicted = self.storage.evict_idle(entity_name, cutoff)?;
    if evicted > 0 {
      debug!(entity = entity_name, evicted, "evicted idle cache entries");
    }
    Ok(evicted)
  }

  /// Apply an optimistic change to the page cached under `key`.
  ///
  /// Returns `None` when nothing is cached for the key.
  pub fn patch(
    &self,
    key: &QueryKey,
    identifier_fields: &[String],
    op: PatchOp,
    item: &Value,
  ) -> Result<Option<Revert>> {
    let _guard = self.write_lock()?;
    let Some(mut entry) = self.storage.get(key)? else {
      return Ok(None);
    };

    let (after, undo) = patch_with_undo(&entry.items, identifier_fields, op, item)?;
    let revert = Revert {
      key: key.clone(),
      fetched_at: entry.cached_at,
      identifier_fields: identifier_fields.to_vec(),
      before: entry.items.clone(),
      before_total: entry.total_count,
      after: after.clone(),
      undo,
    };

    entry.total_count = adjusted_total(entry.total_count, entry.items.len(), after.len());
    entry.items = after;
    self.storage.put(key, &entry)?;
    debug!(query = %key.description(), ?op, "applied optimistic patch");
    Ok(Some(revert))
  }

  /// Roll a patch back.
  ///
  /// If the page is unchanged since the patch, the snapshot is restored
  /// verbatim. If other patches landed on top of it, only this patch's own
  /// change is undone. If the page has been invalidated or refetched
  /// meanwhile it is left alone. Returns whether the page was touched.
  pub fn revert(&self, revert: Revert) -> Result<bool> {
    let _guard = self.write_lock()?;
    let Some(mut entry) = self.storage.get(&revert.key)? else {
      return Ok(false);
    };
    if entry.cached_at != revert.fetched_at {
      debug!(query = %revert.key.description(), "page refetched since patch, skipping rollback");
      return Ok(false);
    }

    if entry.items == revert.after {
      entry.items = revert.before;
      entry.total_count = revert.before_total;
    } else {
      let old_len = entry.items.len();
      undo_on(&mut entry.items, &revert.identifier_fields, &revert.undo);
      entry.total_count = adjusted_total(entry.total_count, old_len, entry.items.len());
    }

    self.storage.put(&revert.key, &entry)?;
    debug!(query = %revert.key.description(), "rolled back optimistic patch");
    Ok(true)
  }

  /// Start a fetch for `key`, superseding any fetch in flight for it.
  pub fn begin_request(&self, key: &QueryKey) -> Ticket {
    self.requests.begin(&key.entity_name, &key.cache_hash())
  }

  /// Store a fetched entry if its request is still the latest for the key.
  pub fn commit(&self, ticket: &Ticket, key: &QueryKey, entry: &CacheEntry) -> Result<bool> {
    let _guard = self.write_lock()?;
    if !self.requests.finish(ticket) {
      debug!(query = %key.description(), "discarding superseded response");
      return Ok(false);
    }
    self.storage.put(key, entry)?;
    Ok(true)
  }

  /// Forget a request that failed.
  pub fn abandon(&self, ticket: &Ticket) {
    self.requests.finish(ticket);
  }

  /// Fetch a page with a cache-first strategy.
  ///
  /// 1. Unless `force`, a fresh entry is returned without a request
  /// 2. Otherwise the page is fetched and committed if still the latest request
  /// 3. On failure the previous entry is left in place and the error returned
  pub async fn fetch<T, F, Fut>(
    &self,
    key: &QueryKey,
    stale_time: Duration,
    force: bool,
    fetcher: F,
  ) -> Result<CacheResult>
  where
    T: Entity,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<SearchPage<T>>>,
  {
    if !force {
      if let Some(entry) = self.get(key)? {
        if !entry.is_stale(stale_time) {
          debug!(query = %key.description(), "cache hit");
          return Ok(CacheResult {
            entry: Some(entry),
            source: CacheSource::CacheFresh,
          });
        }
      }
    }

    let ticket = self.begin_request(key);
    debug!(query = %key.description(), "fetching");

    let entry = match fetcher().await.and_then(CacheEntry::from_page) {
      Ok(entry) => entry,
      Err(e) => {
        self.abandon(&ticket);
        return Err(e);
      }
    };

    if self.commit(&ticket, key, &entry)? {
      Ok(CacheResult {
        entry: Some(entry),
        source: CacheSource::Network,
      })
    } else {
      Ok(CacheResult {
        entry: self.get(key)?,
        source: CacheSource::Superseded,
      })
    }
  }
}

impl std::fmt::Debug for QueryCacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryCacheStore")
      .field("in_flight", &self.requests.in_flight())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Operation;
  use crate::query::{Filters, Pagination};
  use serde_json::json;

  fn id_fields() -> Vec<String> {
    vec!["id".to_string()]
  }

  fn users() -> Vec<Value> {
    vec![
      json!({"id": 1, "name": "Alice"}),
      json!({"id": 2, "name": "Bob"}),
      json!({"id": 3, "name": "Carol"}),
    ]
  }

  fn key(entity: &str) -> QueryKey {
    QueryKey::new(entity, Filters::new(), Pagination::default())
  }

  fn seeded(entity: &str) -> QueryCacheStore {
    let store = QueryCacheStore::in_memory();
    let page = SearchPage::new(users(), 3, &Pagination::default());
    store
      .set(&key(entity), CacheEntry::from_page(page).unwrap())
      .unwrap();
    store
  }

  fn items(store: &QueryCacheStore, entity: &str) -> Vec<Value> {
    store.get(&key(entity)).unwrap().unwrap().items
  }

  #[test]
  fn test_apply_patch_insert_prepends() {
    let next = apply_patch(&users(), &id_fields(), PatchOp::Insert, &json!({"name": "Dan"})).unwrap();
    assert_eq!(next.len(), 4);
    assert_eq!(next[0], json!({"name": "Dan"}));
  }

  #[test]
  fn test_apply_patch_update_merges_fields() {
    let next = apply_patch(
      &users(),
      &id_fields(),
      PatchOp::Update,
      &json!({"id": 2, "name": "Robert"}),
    )
    .unwrap();
    assert_eq!(next[1], json!({"id": 2, "name": "Robert"}));
    assert_eq!(next[0], users()[0]);
  }

  #[test]
  fn test_apply_patch_delete_removes_matching_row() {
    let next = apply_patch(&users(), &id_fields(), PatchOp::Delete, &json!({"id": 1})).unwrap();
    assert_eq!(next, users()[1..].to_vec());
  }

  #[test]
  fn test_apply_patch_update_requires_identity() {
    let err = apply_patch(&users(), &id_fields(), PatchOp::Update, &json!({"name": "x"})).unwrap_err();
    assert!(matches!(err, CrudError::Encoding { .. }));
  }

  #[test]
  fn test_apply_patch_matches_composite_keys() {
    let fields = vec!["year".to_string(), "code".to_string()];
    let rows = vec![
      json!({"year": 2024, "code": "007", "title": "a"}),
      json!({"year": 2024, "code": "008", "title": "b"}),
    ];
    let next = apply_patch(&rows, &fields, PatchOp::Delete, &json!({"year": 2024, "code": "008"})).unwrap();
    assert_eq!(next, rows[..1].to_vec());
  }

  #[test]
  fn test_patch_without_entry_is_none() {
    let store = QueryCacheStore::in_memory();
    let revert = store
      .patch(&key("User"), &id_fields(), PatchOp::Insert, &json!({"id": 9}))
      .unwrap();
    assert!(revert.is_none());
  }

  #[test]
  fn test_rollback_restores_snapshot_exactly() {
    for (op, item) in [
      (PatchOp::Insert, json!({"name": "Dan"})),
      (PatchOp::Update, json!({"id": 3, "name": "Caroline"})),
      (PatchOp::Delete, json!({"id": 2})),
    ] {
      let store = seeded("User");
      let before = store.get(&key("User")).unwrap().unwrap();

      let revert = store
        .patch(&key("User"), &id_fields(), op, &item)
        .unwrap()
        .unwrap();
      assert_eq!(revert.snapshot(), before.items.as_slice());
      assert_ne!(items(&store, "User"), before.items);

      assert!(store.revert(revert).unwrap());
      let after = store.get(&key("User")).unwrap().unwrap();
      assert_eq!(after.items, before.items);
      assert_eq!(after.total_count, before.total_count);
    }
  }

  #[test]
  fn test_patch_adjusts_total_count() {
    let store = seeded("User");
    store
      .patch(&key("User"), &id_fields(), PatchOp::Delete, &json!({"id": 1}))
      .unwrap();
    assert_eq!(store.get(&key("User")).unwrap().unwrap().total_count, 2);
  }

  #[test]
  fn test_concurrent_patches_on_different_rows_compose() {
    let store = seeded("User");
    let delete_bob = store
      .patch(&key("User"), &id_fields(), PatchOp::Delete, &json!({"id": 2}))
      .unwrap()
      .unwrap();
    store
      .patch(&key("User"), &id_fields(), PatchOp::Update, &json!({"id": 3, "name": "Caroline"}))
      .unwrap();

    // The delete fails, the update is still pending
    store.revert(delete_bob).unwrap();

    assert_eq!(
      items(&store, "User"),
      vec![
        json!({"id": 1, "name": "Alice"}),
        json!({"id": 2, "name": "Bob"}),
        json!({"id": 3, "name": "Caroline"}),
      ]
    );
  }

  #[test]
  fn test_revert_after_invalidation_is_noop() {
    let store = seeded("User");
    let revert = store
      .patch(&key("User"), &id_fields(), PatchOp::Insert, &json!({"name": "Dan"}))
      .unwrap()
      .unwrap();
    store.invalidate("User").unwrap();

    assert!(!store.revert(revert).unwrap());
    assert!(store.get(&key("User")).unwrap().is_none());
  }

  #[test]
  fn test_revert_after_refetch_keeps_server_page() {
    let store = seeded("User");
    let delete_bob = store
      .patch(&key("User"), &id_fields(), PatchOp::Delete, &json!({"id": 2}))
      .unwrap()
      .unwrap();

    // An update of the same row succeeded and the page was fetched again
    store.invalidate("User").unwrap();
    let refetched = vec![
      json!({"id": 1, "name": "Alice"}),
      json!({"id": 2, "name": "Robert"}),
      json!({"id": 3, "name": "Carol"}),
    ];
    let mut entry =
      CacheEntry::from_page(SearchPage::new(refetched.clone(), 3, &Pagination::default())).unwrap();
    entry.cached_at = delete_bob.fetched_at + chrono::Duration::milliseconds(1);
    let ticket = store.begin_request(&key("User"));
    assert!(store.commit(&ticket, &key("User"), &entry).unwrap());

    assert!(!store.revert(delete_bob).unwrap());
    let after = store.get(&key("User")).unwrap().unwrap();
    assert_eq!(after.items, refetched);
    assert_eq!(after.total_count, 3);
  }

  #[test]
  fn test_revert_matches_rows_by_identity() {
    let store = seeded("User");
    let delete_bob = store
      .patch(&key("User"), &id_fields(), PatchOp::Delete, &json!({"id": 2}))
      .unwrap()
      .unwrap();
    let rename_carol = store
      .patch(&key("User"), &id_fields(), PatchOp::Update, &json!({"id": 3, "name": "Caroline"}))
      .unwrap()
      .unwrap();

    // Bob is back under a new name before the delete is rolled back
    let mut entry = store.get(&key("User")).unwrap().unwrap();
    entry.items.insert(1, json!({"id": 2, "name": "Robert"}));
    entry.total_count += 1;
    store.set(&key("User"), entry).unwrap();

    assert!(store.revert(delete_bob).unwrap());
    assert_eq!(
      items(&store, "User"),
      vec![
        json!({"id": 1, "name": "Alice"}),
        json!({"id": 2, "name": "Robert"}),
        json!({"id": 3, "name": "Caroline"}),
      ]
    );
    assert_eq!(store.get(&key("User")).unwrap().unwrap().total_count, 3);

    // Carol changed again after the rename: the rollback leaves her alone
    store
      .patch(&key("User"), &id_fields(), PatchOp::Update, &json!({"id": 3, "name": "Caz"}))
      .unwrap();
    assert!(store.revert(rename_carol).unwrap());
    assert_eq!(items(&store, "User")[2], json!({"id": 3, "name": "Caz"}));
  }

  #[test]
  fn test_invalidate_scope() {
    let store = seeded("User");
    let page = SearchPage::new(users(), 3, &Pagination::default());
    store
      .set(&key("Role"), CacheEntry::from_page(page.clone()).unwrap())
      .unwrap();
    let filtered = QueryKey::new(
      "User",
      Filters::from([("name".to_string(), json!("a"))]),
      Pagination::new(2, 5),
    );
    store
      .set(&filtered, CacheEntry::from_page(page).unwrap())
      .unwrap();

    assert_eq!(store.invalidate("User").unwrap(), 2);
    assert_eq!(store.len("User").unwrap(), 0);
    assert_eq!(store.len("Role").unwrap(), 1);
  }

  #[tokio::test]
  async fn test_fetch_uses_fresh_cache() {
    let store = seeded("User");
    let result = store
      .fetch(&key("User"), Duration::from_secs(60), false, || async {
        Err::<SearchPage<Value>, _>(CrudError::remote(Operation::Search, "should not be called"))
      })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::CacheFresh);
  }

  #[tokio::test]
  async fn test_fetch_failure_keeps_previous_entry() {
    let store = seeded("User");
    let err = store
      .fetch(&key("User"), Duration::ZERO, false, || async {
        Err::<SearchPage<Value>, _>(CrudError::remote(Operation::Search, "timeout"))
      })
      .await
      .unwrap_err();

    assert!(err.is_remote());
    assert_eq!(items(&store, "User"), users());
  }

  #[tokio::test]
  async fn test_superseded_fetch_does_not_commit() {
    let store = QueryCacheStore::in_memory();
    let k = key("User");

    let stale = store.begin_request(&k);
    let fresh = store.begin_request(&k);

    let fresh_entry =
      CacheEntry::from_page(SearchPage::new(users(), 3, &Pagination::default())).unwrap();
    assert!(store.commit(&fresh, &k, &fresh_entry).unwrap());

    let stale_entry =
      CacheEntry::from_page(SearchPage::<Value>::new(vec![], 0, &Pagination::default())).unwrap();
    assert!(!store.commit(&stale, &k, &stale_entry).unwrap());
    assert_eq!(items(&store, "User"), users());
  }

  #[tokio::test]
  async fn test_invalidation_supersedes_in_flight_fetch() {
    let store = QueryCacheStore::in_memory();
    let k = key("User");
    let ticket = store.begin_request(&k);
    store.invalidate("User").unwrap();

    let entry = CacheEntry::from_page(SearchPage::new(users(), 3, &Pagination::default())).unwrap();
    assert!(!store.commit(&ticket, &k, &entry).unwrap());
    assert!(store.get(&k).unwrap().is_none());
  }

  #[test]
  fn test_collect_garbage() {
    let store = seeded("User");
    assert_eq!(store.collect_garbage("User", Duration::from_secs(600)).unwrap(), 0);
    assert_eq!(store.collect_garbage("User", Duration::ZERO).unwrap(), 1);
    assert_eq!(store.len("User").unwrap(), 0);
  }
}
