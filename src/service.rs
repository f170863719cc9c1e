//! Contract between the engine and a feature's backend service.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{CrudError, Operation, Result};
use crate::key::IdRecord;
use crate::query::{Filters, Pagination};

/// Types the engine can list, cache and mutate.
///
/// Entities are cached in their JSON form so one store can serve every
/// feature; identifier fields are looked up by name in that form.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Entity for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Identifies an entity type: its cache namespace and primary key fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
  name: String,
  identifier_fields: Vec<String>,
}

impl EntityDescriptor {
  pub fn new(name: impl Into<String>, identifier_fields: Vec<String>) -> Result<Self> {
    let name = name.into();
    if name.trim().is_empty() {
      return Err(CrudError::Config("entity name must not be empty".to_string()));
    }
    if identifier_fields.is_empty() {
      return Err(CrudError::Config(format!(
        "entity `{}` declares no identifier fields",
        name
      )));
    }
    if let Some(blank) = identifier_fields.iter().find(|f| f.trim().is_empty()) {
      return Err(CrudError::Config(format!(
        "entity `{}` has a blank identifier field {:?}",
        name, blank
      )));
    }
    Ok(Self {
      name,
      identifier_fields,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn identifier_fields(&self) -> &[String] {
    &self.identifier_fields
  }

  pub fn is_composite(&self) -> bool {
    self.identifier_fields.len() > 1
  }
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage<T> {
  pub items: Vec<T>,
  pub total_count: u64,
  pub page_number: u32,
  pub page_size: u32,
  pub total_pages: u32,
  pub has_next_page: bool,
  pub has_previous_page: bool,
}

impl<T> SearchPage<T> {
  /// Build a page, deriving the page count and navigation flags.
  pub fn new(items: Vec<T>, total_count: u64, pagination: &Pagination) -> Self {
    let page_size = pagination.page_size.max(1);
    let total_pages = total_count.div_ceil(u64::from(page_size));
    let total_pages = u32::try_from(total_pages).unwrap_or(u32::MAX);
    let page_number = pagination.page_number;
    Self {
      items,
      total_count,
      page_number,
      page_size,
      total_pages,
      has_next_page: page_number < total_pages,
      has_previous_page: page_number > 1,
    }
  }
}

/// Envelope returned by mutating and single-fetch calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse<T> {
  pub success: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
  pub data: Option<T>,
}

impl<T> ServiceResponse<T> {
  pub fn ok(data: Option<T>) -> Self {
    Self {
      success: true,
      message: None,
      data,
    }
  }

  pub fn failed(message: impl Into<String>) -> Self {
    Self {
      success: false,
      message: Some(message.into()),
      data: None,
    }
  }

  /// Treat an unsuccessful envelope as a remote failure.
  pub fn into_result(self, operation: Operation) -> Result<Self> {
    if self.success {
      Ok(self)
    } else {
      let message = self
        .message
        .unwrap_or_else(|| "the service reported a failure".to_string());
      Err(CrudError::remote(operation, message))
    }
  }
}

/// Backend for one entity type.
///
/// Implementations own transport, serialization and timeouts; the engine
/// treats every `Err` as a recoverable remote failure.
#[async_trait]
pub trait EntityService<T: Entity>: Send + Sync {
  /// Ordered names of the fields forming the primary key (at least one).
  fn identifier_fields(&self) -> &[String];

  async fn search(&self, filters: &Filters, pagination: &Pagination) -> Result<SearchPage<T>>;

  async fn create(&self, entity: &T) -> Result<ServiceResponse<T>>;

  async fn update(&self, entity: &T) -> Result<ServiceResponse<T>>;

  async fn remove(&self, entity: &T) -> Result<ServiceResponse<T>>;

  async fn get_by_id(&self, id: &IdRecord) -> Result<ServiceResponse<T>>;
}
