//! JSON-over-HTTP entity service.
//!
//! Endpoints, relative to the configured base URL and the entity's path:
//!
//! | operation   | request                                  |
//! |-------------|------------------------------------------|
//! | `search`    | `POST {path}/search` with filters + page |
//! | `create`    | `POST {path}`                            |
//! | `update`    | `PUT {path}`                             |
//! | `remove`    | `DELETE {path}` with the entity as body  |
//! | `get_by_id` | `GET {path}/details?{id fields}`         |

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::{CrudError, Operation, Result};
use crate::key::IdRecord;
use crate::query::{Filters, Pagination};
use crate::service::{Entity, EntityService, SearchPage, ServiceResponse};

/// Build the shared HTTP client: optional bearer token, request timeout.
pub fn build_client(token: Option<&str>, timeout: Duration) -> Result<reqwest::Client> {
  let mut headers = HeaderMap::new();
  if let Some(token) = token {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
      .map_err(|e| CrudError::Config(format!("invalid API token: {}", e)))?;
    value.set_sensitive(true);
    headers.insert(AUTHORIZATION, value);
  }

  reqwest::Client::builder()
    .default_headers(headers)
    .timeout(timeout)
    .build()
    .map_err(|e| CrudError::Config(format!("Failed to create HTTP client: {}", e)))
}

#[derive(Serialize)]
struct SearchRequest<'a> {
  filters: &'a Filters,
  #[serde(flatten)]
  pagination: &'a Pagination,
}

/// [`EntityService`] talking to a REST backend.
pub struct HttpEntityService<T> {
  client: reqwest::Client,
  resource: Url,
  identifier_fields: Vec<String>,
  _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for HttpEntityService<T> {
  fn clone(&self) -> Self {
    Self {
      client: self.client.clone(),
      resource: self.resource.clone(),
      identifier_fields: self.identifier_fields.clone(),
      _entity: PhantomData,
    }
  }
}

impl<T: Entity> HttpEntityService<T> {
  pub fn new(
    client: reqwest::Client,
    base_url: &str,
    path: &str,
    identifier_fields: Vec<String>,
  ) -> Result<Self> {
    let mut base = Url::parse(base_url)
      .map_err(|e| CrudError::Config(format!("invalid base URL `{}`: {}", base_url, e)))?;
    if !base.path().ends_with('/') {
      let with_slash = format!("{}/", base.path());
      base.set_path(&with_slash);
    }
    let resource = base
      .join(path.trim_matches('/'))
      .map_err(|e| CrudError::Config(format!("invalid entity path `{}`: {}", path, e)))?;

    Ok(Self {
      client,
      resource,
      identifier_fields,
      _entity: PhantomData,
    })
  }

  /// URL of the entity collection.
  pub fn resource(&self) -> &Url {
    &self.resource
  }

  fn endpoint(&self, suffix: Option<&str>) -> Url {
    let mut url = self.resource.clone();
    if let Some(suffix) = suffix {
      if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(suffix);
      }
    }
    url
  }

  fn request(&self, method: Method, suffix: Option<&str>) -> RequestBuilder {
    let url = self.endpoint(suffix);
    debug!(%method, %url, "request");
    self.client.request(method, url)
  }

  async fn send<R: DeserializeOwned>(&self, operation: Operation, request: RequestBuilder) -> Result<R> {
    let response = request
      .send()
      .await
      .map_err(|e| CrudError::remote(operation, format!("request failed: {}", e)))?;
    let response = check_status(operation, response).await?;

    response
      .json::<R>()
      .await
      .map_err(|e| CrudError::remote(operation, format!("invalid response body: {}", e)))
  }

  async fn mutate(&self, operation: Operation, method: Method, entity: &T) -> Result<ServiceResponse<T>> {
    let request = self.request(method, None).json(entity);
    self.send(operation, request).await
  }
}

/// Map non-2xx responses to remote failures, preferring the server's message.
async fn check_status(operation: Operation, response: Response) -> Result<Response> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let body = response.text().await.unwrap_or_default();
  let message = serde_json::from_str::<ServiceResponse<serde_json::Value>>(&body)
    .ok()
    .and_then(|r| r.message)
    .unwrap_or_else(|| format!("service returned {}", status));
  warn!(%operation, %status, "service rejected request");
  Err(CrudError::remote(operation, message))
}

#[async_trait]
impl<T: Entity> EntityService<T> for HttpEntityService<T> {
  fn identifier_fields(&self) -> &[String] {
    &self.identifier_fields
  }

  async fn search(&self, filters: &Filters, pagination: &Pagination) -> Result<SearchPage<T>> {
    let body = SearchRequest {
      filters,
      pagination,
    };
    let request = self.request(Method::POST, Some("search")).json(&body);
    self.send(Operation::Search, request).await
  }

  async fn create(&self, entity: &T) -> Result<ServiceResponse<T>> {
    self.mutate(Operation::Create, Method::POST, entity).await
  }

  async fn update(&self, entity: &T) -> Result<ServiceResponse<T>> {
    self.mutate(Operation::Update, Method::PUT, entity).await
  }

  async fn remove(&self, entity: &T) -> Result<ServiceResponse<T>> {
    self.mutate(Operation::Remove, Method::DELETE, entity).await
  }

  async fn get_by_id(&self, id: &IdRecord) -> Result<ServiceResponse<T>> {
    let request = self.request(Method::GET, Some("details")).query(id);
    self.send(Operation::GetById, request).await
  }
}
