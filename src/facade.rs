//! The CRUD facade: one entry point per feature screen.
//!
//! In list and table modes the facade serves a cached, paginated and
//! filtered listing and runs optimistic mutations against it. In page mode
//! it resolves the single entity named by the route and never issues a list
//! request.

use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheSource, QueryCacheStore, QueryKey};
use crate::error::{CrudError, Operation, Result};
use crate::factory::CustomMethods;
use crate::key::IdRecord;
use crate::mutation::{MutationCoordinator, MutationOutcome};
use crate::notify::{Confirmer, Notifier};
use crate::query::{Filters, Pagination, SortOrder};
use crate::resolver::{Navigator, ResolverState, Route, SingleEntityResolver};
use crate::service::{Entity, EntityDescriptor, EntityService, SearchPage, ServiceResponse};

/// How a screen uses the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrudMode {
  #[default]
  List,
  Table,
  /// Single entity resolved from the route
  Page,
}

impl CrudMode {
  pub fn is_list(&self) -> bool {
    matches!(self, CrudMode::List | CrudMode::Table)
  }
}

/// Stale and garbage-collection intervals of a facade's cached pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTiming {
  /// Age after which an entry is refetched on the next read
  pub stale_time: Duration,
  /// Idle time after which an entry is dropped
  pub gc_time: Duration,
}

/// Per-screen options, applied on top of the factory's preset.
#[derive(Debug, Clone, Default)]
pub struct CrudOptions {
  pub mode: CrudMode,
  pub filters: Filters,
  pub pagination: Pagination,
  pub route: Option<Route>,
  pub stale_time: Option<Duration>,
  pub gc_time: Option<Duration>,
  pub auto_load: Option<bool>,
}

impl CrudOptions {
  pub fn list() -> Self {
    Self::default()
  }

  pub fn table() -> Self {
    Self {
      mode: CrudMode::Table,
      ..Self::default()
    }
  }

  pub fn page(route: Route) -> Self {
    Self {
      mode: CrudMode::Page,
      route: Some(route),
      ..Self::default()
    }
  }

  pub fn with_filters(mut self, filters: Filters) -> Self {
    self.filters = filters;
    self
  }

  pub fn with_pagination(mut self, pagination: Pagination) -> Self {
    self.pagination = pagination;
    self
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = Some(gc_time);
    self
  }

  pub fn with_auto_load(mut self, auto_load: bool) -> Self {
    self.auto_load = Some(auto_load);
    self
  }
}

/// External collaborators a facade reports to.
#[derive(Clone)]
pub struct Collaborators {
  pub notifier: Arc<dyn Notifier>,
  pub confirmer: Arc<dyn Confirmer>,
  pub navigator: Arc<dyn Navigator>,
}

/// Everything needed to assemble a facade; built by the factory.
pub(crate) struct CrudParts<T: Entity> {
  pub descriptor: EntityDescriptor,
  pub service: Arc<dyn EntityService<T>>,
  pub store: Arc<QueryCacheStore>,
  pub collaborators: Collaborators,
  pub timing: CacheTiming,
  pub mode: CrudMode,
  pub filters: Filters,
  pub pagination: Pagination,
  pub route: Option<Route>,
  pub custom: CustomMethods,
}

#[derive(Debug, Default)]
struct ViewState {
  filters: Filters,
  pagination: Pagination,
  route: Option<Route>,
  error: Option<CrudError>,
}

/// Stateful facade over one entity type.
pub struct Crud<T: Entity> {
  descriptor: Arc<EntityDescriptor>,
  mode: CrudMode,
  timing: CacheTiming,
  service: Arc<dyn EntityService<T>>,
  store: Arc<QueryCacheStore>,
  notifier: Arc<dyn Notifier>,
  mutations: MutationCoordinator<T>,
  resolver: SingleEntityResolver<T>,
  custom: CustomMethods,
  view: Mutex<ViewState>,
  fetching: AtomicUsize,
}

/// Decrements the in-flight fetch counter on drop.
struct Fetching<'a>(&'a AtomicUsize);

impl<'a> Fetching<'a> {
  fn start(counter: &'a AtomicUsize) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(counter)
  }
}

impl Drop for Fetching<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

impl<T: Entity> Crud<T> {
  pub(crate) fn assemble(parts: CrudParts<T>) -> Self {
    let descriptor = Arc::new(parts.descriptor);
    let Collaborators {
      notifier,
      confirmer,
      navigator,
    } = parts.collaborators;

    let mutations = MutationCoordinator::new(
      descriptor.clone(),
      parts.service.clone(),
      parts.store.clone(),
      notifier.clone(),
      confirmer,
    );
    let resolver = SingleEntityResolver::new(
      descriptor.name(),
      descriptor.identifier_fields().to_vec(),
      parts.service.clone(),
      notifier.clone(),
      navigator,
    );

    Self {
      descriptor,
      mode: parts.mode,
      timing: parts.timing,
      service: parts.service,
      store: parts.store,
      notifier,
      mutations,
      resolver,
      custom: parts.custom,
      view: Mutex::new(ViewState {
        filters: parts.filters,
        pagination: parts.pagination,
        route: parts.route,
        error: None,
      }),
      fetching: AtomicUsize::new(0),
    }
  }

  fn view(&self) -> MutexGuard<'_, ViewState> {
    // Fields are replaced wholesale, a poisoned lock still holds valid values
    self.view.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn record_error(&self, err: &CrudError) {
    self.view().error = Some(err.clone());
  }

  fn clear_error_field(&self) {
    self.view().error = None;
  }

  pub fn entity_name(&self) -> &str {
    self.descriptor.name()
  }

  pub fn descriptor(&self) -> &EntityDescriptor {
    &self.descriptor
  }

  pub fn mode(&self) -> CrudMode {
    self.mode
  }

  pub fn timing(&self) -> CacheTiming {
    self.timing
  }

  pub fn filters(&self) -> Filters {
    self.view().filters.clone()
  }

  pub fn pagination(&self) -> Pagination {
    self.view().pagination.clone()
  }

  /// Key of the list currently shown.
  pub fn query_key(&self) -> QueryKey {
    let view = self.view();
    QueryKey::new(
      self.descriptor.name(),
      view.filters.clone(),
      view.pagination.clone(),
    )
  }

  /// Last failure, if the most recent operation did not succeed.
  pub fn error(&self) -> Option<CrudError> {
    self.view().error.clone()
  }

  pub fn clear_error(&self) {
    self.clear_error_field();
  }

  fn current_entry(&self) -> Option<CacheEntry> {
    match self.store.get(&self.query_key()) {
      Ok(entry) => entry,
      Err(err) => {
        warn!(entity = self.entity_name(), %err, "cache read failed");
        self.record_error(&err);
        None
      }
    }
  }

  /// The cached page for the current query, if any.
  pub fn page(&self) -> Option<SearchPage<T>> {
    let entry = self.current_entry()?;
    match entry.to_page() {
      Ok(page) => Some(page),
      Err(err) => {
        warn!(entity = self.entity_name(), %err, "cached page does not match entity type");
        self.record_error(&err);
        None
      }
    }
  }

  pub fn items(&self) -> Vec<T> {
    self.page().map(|p| p.items).unwrap_or_default()
  }

  pub fn total_count(&self) -> u64 {
    self.current_entry().map(|e| e.total_count).unwrap_or(0)
  }

  pub fn total_pages(&self) -> u32 {
    self.current_entry().map(|e| e.total_pages).unwrap_or(0)
  }

  pub fn is_loading(&self) -> bool {
    if self.fetching.load(Ordering::SeqCst) > 0 {
      return true;
    }
    if self.mode.is_list() {
      self.error().is_none() && self.current_entry().is_none()
    } else {
      match self.resolver.state() {
        ResolverState::Resolving { .. } => true,
        ResolverState::Idle => self
          .view()
          .route
          .as_ref()
          .is_some_and(|r| r.identifier.is_some()),
        _ => false,
      }
    }
  }

  pub fn is_mutating(&self) -> bool {
    self.mutations.pending() > 0
  }

  /// Entity resolved from the route (page mode).
  pub fn selected_item(&self) -> Option<T> {
    self.resolver.selected_item()
  }

  pub fn resolver_state(&self) -> ResolverState<T> {
    self.resolver.state()
  }

  /// Load whatever the mode needs: the current page (from cache when
  /// fresh) or the entity named by the route.
  pub async fn load(&self) -> Result<()> {
    if self.mode.is_list() {
      self.collect_garbage();
      self.fetch_list(false).await
    } else {
      let route = self.view().route.clone().unwrap_or_default();
      self.resolve(&route).await
    }
  }

  /// Bypass the cache and fetch again.
  pub async fn refresh(&self) -> Result<()> {
    if self.mode.is_list() {
      self.fetch_list(true).await
    } else {
      let _fetching = Fetching::start(&self.fetching);
      self.resolver.reset();
      let route = self.view().route.clone().unwrap_or_default();
      self.resolve(&route).await
    }
  }

  /// Follow a route change (page mode). A new identifier clears the
  /// selected item before the next entity is fetched.
  pub async fn sync_route(&self, route: Route) -> Result<()> {
    self.view().route = Some(route.clone());
    if self.mode == CrudMode::Page {
      self.resolve(&route).await
    } else {
      Ok(())
    }
  }

  async fn resolve(&self, route: &Route) -> Result<()> {
    match self.resolver.sync_route(route).await {
      ResolverState::Failed {
        identifier,
        message,
      } => {
        let err = CrudError::Resolution {
          identifier,
          message,
        };
        self.record_error(&err);
        Err(err)
      }
      _ => {
        self.clear_error_field();
        Ok(())
      }
    }
  }

  fn collect_garbage(&self) {
    if let Err(err) = self
      .store
      .collect_garbage(self.entity_name(), self.timing.gc_time)
    {
      warn!(entity = self.entity_name(), %err, "cache garbage collection failed");
    }
  }

  async fn fetch_list(&self, force: bool) -> Result<()> {
    if !self.mode.is_list() {
      return Ok(());
    }
    let _fetching = Fetching::start(&self.fetching);

    // A page past the end is clamped and fetched again, once
    let mut force = force;
    for _ in 0..2 {
      let key = self.query_key();
      let request = key.clone();
      let service = self.service.clone();
      let result = self
        .store
        .fetch(&key, self.timing.stale_time, force, || async move {
          service.search(&request.filters, &request.pagination).await
        })
        .await;

      let result = match result {
        Ok(result) => result,
        Err(err) => {
          warn!(entity = self.entity_name(), %err, "list fetch failed, keeping cached page");
          self.record_error(&err);
          return Err(err);
        }
      };
      self.clear_error_field();

      let Some(entry) = result.entry else {
        return Ok(());
      };
      if result.source == CacheSource::CacheFresh
        || entry.total_pages == 0
        || key.pagination.page_number <= entry.total_pages
      {
        return Ok(());
      }

      let mut view = self.view();
      if view.pagination != key.pagination || view.filters != key.filters {
        return Ok(());
      }
      debug!(
        entity = self.entity_name(),
        requested = key.pagination.page_number,
        total_pages = entry.total_pages,
        "page out of range, clamping"
      );
      view.pagination.page_number = entry.total_pages;
      force = true;
    }
    Ok(())
  }

  /// Move to another page. Pages outside `1..=total_pages` are ignored.
  ///
  /// Returns whether the page changed.
  pub async fn go_to_page(&self, page_number: u32) -> Result<bool> {
    let total_pages = self.current_entry().map(|e| e.total_pages);
    let in_range = match total_pages {
      Some(total) => page_number >= 1 && page_number <= total,
      None => page_number >= 1,
    };

    {
      let mut view = self.view();
      if !in_range || view.pagination.page_number == page_number {
        debug!(
          entity = self.entity_name(),
          page_number,
          ?total_pages,
          "ignoring page change"
        );
        return Ok(false);
      }
      view.pagination.page_number = page_number;
    }

    self.fetch_list(false).await?;
    Ok(true)
  }

  /// Change the page size; goes back to page 1.
  pub async fn set_page_size(&self, page_size: u32) -> Result<()> {
    {
      let mut view = self.view();
      view.pagination.page_size = page_size.max(1);
      view.pagination.page_number = 1;
    }
    self.fetch_list(false).await
  }

  /// Change the sort column and order; goes back to page 1.
  pub async fn set_sort(&self, sort_by: Option<String>, sort_order: SortOrder) -> Result<()> {
    {
      let mut view = self.view();
      view.pagination.sort_by = sort_by;
      view.pagination.sort_order = sort_order;
      view.pagination.page_number = 1;
    }
    self.fetch_list(false).await
  }

  /// Merge `changes` into the filters; a `null` value removes that filter.
  /// Always goes back to page 1.
  pub async fn update_filters(&self, changes: Filters) -> Result<()> {
    {
      let mut view = self.view();
      for (field, value) in changes {
        if value.is_null() {
          view.filters.remove(&field);
        } else {
          view.filters.insert(field, value);
        }
      }
      view.pagination = view.pagination.first_page();
    }
    self.fetch_list(false).await
  }

  pub async fn clear_filters(&self) -> Result<()> {
    {
      let mut view = self.view();
      view.filters.clear();
      view.pagination = view.pagination.first_page();
    }
    self.fetch_list(false).await
  }

  /// Drop every cached page of this entity.
  pub fn invalidate_queries(&self) -> Result<usize> {
    self
      .store
      .invalidate(self.entity_name())
      .inspect_err(|err| self.record_error(err))
  }

  pub async fn create(&self, data: &T) -> Result<ServiceResponse<T>> {
    let result = self.mutations.create(&self.query_key(), data).await;
    self.after_mutation(result).await
  }

  pub async fn update(&self, data: &T) -> Result<ServiceResponse<T>> {
    let result = self.mutations.update(&self.query_key(), data).await;
    if let Ok(response) = &result {
      if let Some(item) = &response.data {
        self.resolver.replace_item(item.clone());
      }
    }
    self.after_mutation(result).await
  }

  pub async fn remove(&self, data: &T) -> Result<ServiceResponse<T>> {
    let result = self.mutations.remove(&self.query_key(), data).await;
    self.after_mutation(result).await
  }

  /// Delete after the user confirms. Declining changes nothing.
  pub async fn delete_item(&self, item: &T) -> Result<MutationOutcome<T>> {
    match self.mutations.confirm_and_remove(&self.query_key(), item).await {
      Ok(MutationOutcome::Completed(response)) => self
        .after_mutation(Ok(response))
        .await
        .map(MutationOutcome::Completed),
      Ok(MutationOutcome::Declined) => Ok(MutationOutcome::Declined),
      Err(err) => self.after_mutation(Err(err)).await,
    }
  }

  async fn after_mutation<R>(&self, result: Result<R>) -> Result<R> {
    match result {
      Ok(value) => {
        self.clear_error_field();
        // The cache was invalidated; pull the authoritative page
        if let Err(err) = self.fetch_list(true).await {
          debug!(entity = self.entity_name(), %err, "refetch after mutation failed");
        }
        Ok(value)
      }
      Err(err) => {
        self.record_error(&err);
        Err(err)
      }
    }
  }

  /// Fetch one entity by its identifier record, bypassing the list cache.
  pub async fn get_by_id(&self, id: &IdRecord) -> Result<Option<T>> {
    let result = self
      .service
      .get_by_id(id)
      .await
      .and_then(|r| r.into_result(Operation::GetById));

    match result {
      Ok(response) => Ok(response.data),
      Err(err) => {
        self.record_error(&err);
        self.notifier.error(&err.to_string());
        Err(err)
      }
    }
  }

  /// Names of the registered custom methods.
  pub fn custom_methods(&self) -> Vec<&str> {
    self.custom.keys().map(String::as_str).collect()
  }

  /// Invoke a custom remote method registered with the factory.
  pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
    let Some(method) = self.custom.get(name).cloned() else {
      let err = CrudError::UnknownMethod(name.to_string());
      self.record_error(&err);
      return Err(err);
    };

    match method(args).await {
      Ok(value) => {
        self.clear_error_field();
        Ok(value)
      }
      Err(err) => {
        warn!(entity = self.entity_name(), method = name, %err, "custom method failed");
        self.record_error(&err);
        self.notifier.error(&err.to_string());
        Err(err)
      }
    }
  }
}
