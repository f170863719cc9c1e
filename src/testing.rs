//! In-memory collaborators shared by the unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::cache::{QueryCacheStore, QueryKey};
use crate::error::{CrudError, Operation, Result};
use crate::key::{identity_of, key_text, IdRecord};
use crate::notify::{ConfirmRequest, Confirmer, Notifier};
use crate::query::{Filters, Pagination, SortOrder};
use crate::resolver::Navigator;
use crate::service::{Entity, EntityService, SearchPage, ServiceResponse};

/// Entity service over a vector of JSON rows, with failure injection and
/// per-operation gates for interleaving tests.
pub struct MemoryService {
  identifier_fields: Vec<String>,
  rows: Mutex<Vec<Value>>,
  failures: Mutex<HashMap<Operation, VecDeque<String>>>,
  gates: Mutex<HashMap<Operation, Arc<Semaphore>>>,
  calls: Mutex<HashMap<Operation, usize>>,
}

impl MemoryService {
  pub fn new(identifier_fields: &[&str], rows: Vec<Value>) -> Self {
    Self {
      identifier_fields: identifier_fields.iter().map(|s| s.to_string()).collect(),
      rows: Mutex::new(rows),
      failures: Mutex::new(HashMap::new()),
      gates: Mutex::new(HashMap::new()),
      calls: Mutex::new(HashMap::new()),
    }
  }

  /// `count` users named user1..userN with ids 1..N.
  pub fn users(count: u64) -> Self {
    let rows = (1..=count)
      .map(|i| serde_json::json!({"id": i, "name": format!("user{}", i)}))
      .collect();
    Self::new(&["id"], rows)
  }

  pub fn rows(&self) -> Vec<Value> {
    self.rows.lock().unwrap().clone()
  }

  pub fn fail_next(&self, op: Operation, message: &str) {
    self
      .failures
      .lock()
      .unwrap()
      .entry(op)
      .or_default()
      .push_back(message.to_string());
  }

  pub fn calls(&self, op: Operation) -> usize {
    self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
  }

  /// Make calls of `op` wait until released.
  pub fn hold(&self, op: Operation) {
    self
      .gates
      .lock()
      .unwrap()
      .insert(op, Arc::new(Semaphore::new(0)));
  }

  /// Let `n` held calls of `op` proceed.
  pub fn release(&self, op: Operation, n: usize) {
    if let Some(gate) = self.gates.lock().unwrap().get(&op) {
      gate.add_permits(n);
    }
  }

  async fn enter(&self, op: Operation) -> Result<()> {
    *self.calls.lock().unwrap().entry(op).or_default() += 1;

    let gate = self.gates.lock().unwrap().get(&op).cloned();
    if let Some(gate) = gate {
      gate.acquire().await.unwrap().forget();
    }

    let failure = self
      .failures
      .lock()
      .unwrap()
      .get_mut(&op)
      .and_then(VecDeque::pop_front);
    match failure {
      Some(message) => Err(CrudError::remote(op, message)),
      None => Ok(()),
    }
  }

  fn find(&self, rows: &[Value], id: &IdRecord) -> Option<usize> {
    rows
      .iter()
      .position(|row| identity_of(&self.identifier_fields, row).is_ok_and(|r| &r == id))
  }
}

fn matches_filters(row: &Value, filters: &Filters) -> bool {
  filters.iter().all(|(field, expected)| match (row.get(field), expected) {
    (Some(Value::String(actual)), Value::String(wanted)) => {
      actual.to_lowercase().contains(&wanted.to_lowercase())
    }
    (Some(actual), wanted) => actual == wanted,
    (None, _) => false,
  })
}

#[async_trait]
impl<T: Entity> EntityService<T> for MemoryService {
  fn identifier_fields(&self) -> &[String] {
    &self.identifier_fields
  }

  async fn search(&self, filters: &Filters, pagination: &Pagination) -> Result<SearchPage<T>> {
    self.enter(Operation::Search).await?;

    let mut rows: Vec<Value> = self
      .rows()
      .into_iter()
      .filter(|row| matches_filters(row, filters))
      .collect();

    if let Some(sort_by) = &pagination.sort_by {
      rows.sort_by_key(|row| row.get(sort_by).and_then(key_text).unwrap_or_default());
      if pagination.sort_order == SortOrder::Desc {
        rows.reverse();
      }
    }

    let total = rows.len() as u64;
    let items = rows
      .into_iter()
      .skip(pagination.offset() as usize)
      .take(pagination.page_size as usize)
      .map(serde_json::from_value)
      .collect::<Result<Vec<T>, _>>()?;
    Ok(SearchPage::new(items, total, pagination))
  }

  async fn create(&self, entity: &T) -> Result<ServiceResponse<T>> {
    self.enter(Operation::Create).await?;
    let mut value = serde_json::to_value(entity)?;
    let mut rows = self.rows.lock().unwrap();

    if self.identifier_fields == ["id"] && value.get("id").map_or(true, Value::is_null) {
      let next = rows
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_u64))
        .max()
        .unwrap_or(0)
        + 1;
      value["id"] = Value::from(next);
    }

    rows.insert(0, value.clone());
    Ok(ServiceResponse::ok(Some(serde_json::from_value(value)?)))
  }

  async fn update(&self, entity: &T) -> Result<ServiceResponse<T>> {
    self.enter(Operation::Update).await?;
    let value = serde_json::to_value(entity)?;
    let id = identity_of(&self.identifier_fields, &value)?;
    let mut rows = self.rows.lock().unwrap();
    match self.find(&rows, &id) {
      Some(index) => {
        rows[index] = value;
        Ok(ServiceResponse::ok(Some(entity.clone())))
      }
      None => Ok(ServiceResponse::failed("not found")),
    }
  }

  async fn remove(&self, entity: &T) -> Result<ServiceResponse<T>> {
    self.enter(Operation::Remove).await?;
    let value = serde_json::to_value(entity)?;
    let id = identity_of(&self.identifier_fields, &value)?;
    let mut rows = self.rows.lock().unwrap();
    match self.find(&rows, &id) {
      Some(index) => {
        rows.remove(index);
        Ok(ServiceResponse::ok(None))
      }
      None => Ok(ServiceResponse::failed("not found")),
    }
  }

  async fn get_by_id(&self, id: &IdRecord) -> Result<ServiceResponse<T>> {
    self.enter(Operation::GetById).await?;
    let rows = self.rows();
    match self.find(&rows, id) {
      Some(index) => Ok(ServiceResponse::ok(Some(serde_json::from_value(
        rows[index].clone(),
      )?))),
      None => Ok(ServiceResponse::failed("not found")),
    }
  }
}

/// What a notification saw in the cache at the moment it fired.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
  pub success: bool,
  pub message: String,
  pub cached_items: Option<Vec<Value>>,
}

/// Notifier that records messages, optionally sampling one cache key.
#[derive(Default)]
pub struct RecordingNotifier {
  notices: Mutex<Vec<Notice>>,
  probe: Option<(Arc<QueryCacheStore>, QueryKey)>,
}

impl RecordingNotifier {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn probing(store: Arc<QueryCacheStore>, key: QueryKey) -> Self {
    Self {
      notices: Mutex::new(Vec::new()),
      probe: Some((store, key)),
    }
  }

  pub fn notices(&self) -> Vec<Notice> {
    self.notices.lock().unwrap().clone()
  }

  pub fn errors(&self) -> usize {
    self.notices().iter().filter(|n| !n.success).count()
  }

  pub fn successes(&self) -> usize {
    self.notices().iter().filter(|n| n.success).count()
  }

  fn record(&self, success: bool, message: &str) {
    let cached_items = self
      .probe
      .as_ref()
      .and_then(|(store, key)| store.get(key).unwrap())
      .map(|entry| entry.items);
    self.notices.lock().unwrap().push(Notice {
      success,
      message: message.to_string(),
      cached_items,
    });
  }
}

impl Notifier for RecordingNotifier {
  fn success(&self, message: &str) {
    self.record(true, message);
  }

  fn error(&self, message: &str) {
    self.record(false, message);
  }
}

/// Confirmer with a fixed answer that counts prompts.
pub struct RecordingConfirmer {
  answer: bool,
  asked: AtomicUsize,
}

impl RecordingConfirmer {
  pub fn answering(answer: bool) -> Self {
    Self {
      answer,
      asked: AtomicUsize::new(0),
    }
  }

  pub fn asked(&self) -> usize {
    self.asked.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Confirmer for RecordingConfirmer {
  async fn confirm(&self, _request: ConfirmRequest) -> bool {
    self.asked.fetch_add(1, Ordering::SeqCst);
    self.answer
  }
}

#[derive(Default)]
pub struct RecordingNavigator {
  paths: Mutex<Vec<String>>,
}

impl RecordingNavigator {
  pub fn paths(&self) -> Vec<String> {
    self.paths.lock().unwrap().clone()
  }
}

impl Navigator for RecordingNavigator {
  fn navigate(&self, path: &str) {
    self.paths.lock().unwrap().push(path.to_string());
  }
}
