//! Builds CRUD facades for one entity with a cache preset and shared
//! collaborators.

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::QueryCacheStore;
use crate::error::{CrudError, Result};
use crate::facade::{CacheTiming, Collaborators, Crud, CrudMode, CrudOptions, CrudParts};
use crate::notify::{AutoConfirm, Confirmer, Notifier, TracingNotifier};
use crate::resolver::{LogNavigator, Navigator};
use crate::service::{Entity, EntityDescriptor, EntityService};

/// A remote call outside the CRUD set, taking and returning JSON.
pub type CustomMethod = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

pub type CustomMethods = BTreeMap<String, CustomMethod>;

const MINUTE: u64 = 60;

/// Named cache timing profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePreset {
  /// Reference data that rarely changes
  Static,
  #[default]
  Dynamic,
  /// Always refetched on read
  Realtime,
  /// Wizard-style screens that load on demand
  Multistep,
}

impl CachePreset {
  pub fn stale_time(&self) -> Duration {
    match self {
      CachePreset::Static => Duration::from_secs(30 * MINUTE),
      CachePreset::Dynamic => Duration::from_secs(2 * MINUTE),
      CachePreset::Realtime | CachePreset::Multistep => Duration::ZERO,
    }
  }

  pub fn gc_time(&self) -> Duration {
    match self {
      CachePreset::Static => Duration::from_secs(60 * MINUTE),
      CachePreset::Dynamic => Duration::from_secs(10 * MINUTE),
      CachePreset::Realtime => Duration::from_secs(MINUTE),
      CachePreset::Multistep => Duration::from_secs(5 * MINUTE),
    }
  }

  pub fn auto_load(&self) -> bool {
    !matches!(self, CachePreset::Multistep)
  }

  pub fn timing(&self) -> CacheTiming {
    CacheTiming {
      stale_time: self.stale_time(),
      gc_time: self.gc_time(),
    }
  }
}

impl fmt::Display for CachePreset {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      CachePreset::Static => "static",
      CachePreset::Dynamic => "dynamic",
      CachePreset::Realtime => "realtime",
      CachePreset::Multistep => "multistep",
    };
    write!(f, "{}", name)
  }
}

impl FromStr for CachePreset {
  type Err = CrudError;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "static" => Ok(CachePreset::Static),
      "dynamic" => Ok(CachePreset::Dynamic),
      "realtime" => Ok(CachePreset::Realtime),
      "multistep" => Ok(CachePreset::Multistep),
      other => Err(CrudError::Config(format!("unknown cache preset `{}`", other))),
    }
  }
}

/// Configures and mounts [`Crud`] facades for one entity type.
///
/// The factory holds the service and the shared cache; each `mount` yields
/// an independent facade whose pages live in that cache.
pub struct CrudFactory<T: Entity, S: EntityService<T> + 'static> {
  entity_name: String,
  service: Arc<S>,
  store: Arc<QueryCacheStore>,
  preset: CachePreset,
  stale_time: Option<Duration>,
  gc_time: Option<Duration>,
  auto_load: Option<bool>,
  collaborators: Collaborators,
  custom: CustomMethods,
  _entity: PhantomData<fn() -> T>,
}

impl<T: Entity, S: EntityService<T> + 'static> CrudFactory<T, S> {
  pub fn new(entity_name: impl Into<String>, service: Arc<S>, store: Arc<QueryCacheStore>) -> Self {
    Self {
      entity_name: entity_name.into(),
      service,
      store,
      preset: CachePreset::default(),
      stale_time: None,
      gc_time: None,
      auto_load: None,
      collaborators: Collaborators {
        notifier: Arc::new(TracingNotifier),
        confirmer: Arc::new(AutoConfirm(false)),
        navigator: Arc::new(LogNavigator),
      },
      custom: CustomMethods::new(),
      _entity: PhantomData,
    }
  }

  pub fn entity_name(&self) -> &str {
    &self.entity_name
  }

  pub fn service(&self) -> &Arc<S> {
    &self.service
  }

  pub fn preset(mut self, preset: CachePreset) -> Self {
    self.preset = preset;
    self
  }

  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = Some(gc_time);
    self
  }

  pub fn auto_load(mut self, auto_load: bool) -> Self {
    self.auto_load = Some(auto_load);
    self
  }

  pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
    self.collaborators.notifier = notifier;
    self
  }

  pub fn confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
    self.collaborators.confirmer = confirmer;
    self
  }

  pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
    self.collaborators.navigator = navigator;
    self
  }

  /// Register a custom remote method. `method` receives the service and
  /// the call arguments.
  pub fn custom_method<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
  where
    F: Fn(Arc<S>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let service = self.service.clone();
    let bound: CustomMethod = Arc::new(move |args| method(service.clone(), args).boxed());
    self.custom.insert(name.into(), bound);
    self
  }

  /// Effective timing: explicit overrides win over the preset.
  pub fn timing(&self) -> CacheTiming {
    let preset = self.preset.timing();
    CacheTiming {
      stale_time: self.stale_time.unwrap_or(preset.stale_time),
      gc_time: self.gc_time.unwrap_or(preset.gc_time),
    }
  }

  /// Create a facade. With auto-load on, the first page (or the routed
  /// entity in page mode) is loaded before returning; a failed load is
  /// reported through the facade's error, not here.
  pub async fn mount(&self, options: CrudOptions) -> Result<Crud<T>> {
    let identifier_fields = <S as EntityService<T>>::identifier_fields(&self.service).to_vec();
    let descriptor = EntityDescriptor::new(self.entity_name.clone(), identifier_fields)?;

    let defaults = self.timing();
    let timing = CacheTiming {
      stale_time: options.stale_time.unwrap_or(defaults.stale_time),
      gc_time: options.gc_time.unwrap_or(defaults.gc_time),
    };
    let auto_load = options
      .auto_load
      .or(self.auto_load)
      .unwrap_or_else(|| self.preset.auto_load());

    let service: Arc<dyn EntityService<T>> = self.service.clone();
    let route = match options.mode {
      CrudMode::Page => options.route,
      _ => None,
    };
    let crud = Crud::assemble(CrudParts {
      descriptor,
      service,
      store: self.store.clone(),
      collaborators: self.collaborators.clone(),
      timing,
      mode: options.mode,
      filters: options.filters,
      pagination: options.pagination,
      route,
      custom: self.custom.clone(),
    });

    debug!(
      entity = %self.entity_name,
      mode = ?options.mode,
      preset = %self.preset,
      auto_load,
      "mounted crud facade"
    );
    if auto_load {
      if let Err(err) = crud.load().await {
        debug!(entity = %self.entity_name, %err, "initial load failed");
      }
    }
    Ok(crud)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Operation;
  use crate::query::Pagination;
  use crate::testing::{MemoryService, RecordingNotifier};

  fn factory(rows: u64) -> (Arc<MemoryService>, CrudFactory<Value, MemoryService>) {
    let service = Arc::new(MemoryService::users(rows));
    let store = Arc::new(QueryCacheStore::in_memory());
    (service.clone(), CrudFactory::new("User", service, store))
  }

  #[test]
  fn test_preset_table() {
    assert_eq!(CachePreset::Static.stale_time(), Duration::from_secs(1800));
    assert_eq!(CachePreset::Static.gc_time(), Duration::from_secs(3600));
    assert_eq!(CachePreset::Dynamic.stale_time(), Duration::from_secs(120));
    assert_eq!(CachePreset::Realtime.stale_time(), Duration::ZERO);
    assert_eq!(CachePreset::Realtime.gc_time(), Duration::from_secs(60));
    assert!(!CachePreset::Multistep.auto_load());
    assert!(CachePreset::Static.auto_load());
  }

  #[test]
  fn test_preset_from_str() {
    assert_eq!("Static".parse::<CachePreset>().unwrap(), CachePreset::Static);
    assert_eq!(
      CachePreset::Multistep.to_string().parse::<CachePreset>().unwrap(),
      CachePreset::Multistep
    );
    assert!(matches!(
      "sometimes".parse::<CachePreset>(),
      Err(CrudError::Config(_))
    ));
  }

  #[test]
  fn test_overrides_win_over_preset() {
    let (_, factory) = factory(1);
    let factory = factory
      .preset(CachePreset::Static)
      .stale_time(Duration::from_secs(5));
    let timing = factory.timing();
    assert_eq!(timing.stale_time, Duration::from_secs(5));
    assert_eq!(timing.gc_time, Duration::from_secs(3600));
  }

  #[tokio::test]
  async fn test_multistep_does_not_auto_load() {
    let (service, factory) = factory(3);
    let crud = factory
      .preset(CachePreset::Multistep)
      .mount(CrudOptions::list())
      .await
      .unwrap();
    assert_eq!(service.calls(Operation::Search), 0);
    assert!(crud.items().is_empty());
  }

  #[tokio::test]
  async fn test_realtime_always_refetches() {
    let (service, factory) = factory(3);
    let factory = factory.preset(CachePreset::Realtime);
    factory.mount(CrudOptions::list()).await.unwrap();
    factory.mount(CrudOptions::list()).await.unwrap();
    assert_eq!(service.calls(Operation::Search), 2);
  }

  #[tokio::test]
  async fn test_mount_options_override_factory() {
    let (service, factory) = factory(3);
    let crud = factory
      .preset(CachePreset::Multistep)
      .mount(
        CrudOptions::table()
          .with_auto_load(true)
          .with_pagination(Pagination::new(1, 2)),
      )
      .await
      .unwrap();
    assert_eq!(service.calls(Operation::Search), 1);
    assert_eq!(crud.mode(), CrudMode::Table);
    assert_eq!(crud.items().len(), 2);
  }

  #[tokio::test]
  async fn test_custom_method() {
    let (_, factory) = factory(4);
    let crud = factory
      .custom_method("count", |service: Arc<MemoryService>, _args| async move {
        Ok(Value::from(service.rows().len()))
      })
      .mount(CrudOptions::list())
      .await
      .unwrap();

    assert_eq!(crud.custom_methods(), vec!["count"]);
    assert_eq!(crud.call("count", Value::Null).await.unwrap(), Value::from(4));
  }

  #[tokio::test]
  async fn test_custom_method_failure_notifies() {
    let (_, factory) = factory(1);
    let notifier = Arc::new(RecordingNotifier::new());
    let crud = factory
      .notifier(notifier.clone())
      .custom_method("explode", |_service: Arc<MemoryService>, _args| async move {
        Err::<Value, _>(CrudError::remote(Operation::Custom, "boom"))
      })
      .mount(CrudOptions::list())
      .await
      .unwrap();

    let err = crud.call("explode", Value::Null).await.unwrap_err();
    assert_eq!(crud.error(), Some(err));
    assert_eq!(notifier.errors(), 1);
  }

  #[tokio::test]
  async fn test_invalid_entity_name_rejected() {
    let service = Arc::new(MemoryService::users(1));
    let store = Arc::new(QueryCacheStore::in_memory());
    let factory: CrudFactory<Value, MemoryService> = CrudFactory::new("", service, store);
    assert!(matches!(
      factory.mount(CrudOptions::list()).await,
      Err(CrudError::Config(_))
    ));
  }
}
