//! Single-entity resolution from a route identifier.
//!
//! A detail screen receives the entity's key token from its route
//! (`/users/42`, `/reports/2024-007`). The resolver decodes the token with
//! the entity's identifier fields, fetches the entity once per distinct
//! token and, when that fails, sends the user back to the listing route.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::error::{CrudError, Operation, Result};
use crate::key::{decode, encode};
use crate::notify::Notifier;
use crate::service::{Entity, EntityService};

/// Moves the user to another screen.
pub trait Navigator: Send + Sync {
  fn navigate(&self, path: &str);
}

/// Navigator that only logs, for contexts without routing.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
  fn navigate(&self, path: &str) {
    debug!(path, "navigation requested");
  }
}

/// The part of the current location the engine cares about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Route {
  pub path: String,
  pub identifier: Option<String>,
}

impl Route {
  pub fn new(path: impl Into<String>, identifier: Option<String>) -> Self {
    Self {
      path: path.into(),
      identifier: identifier.filter(|id| !id.is_empty()),
    }
  }

  /// Route of the form `/<listing>/<identifier>[/...]`; the identifier is
  /// the second segment, so `/users/42/edit` resolves `42`.
  pub fn parse(path: &str) -> Self {
    let identifier = path
      .split('/')
      .filter(|s| !s.is_empty())
      .nth(1)
      .map(str::to_string);
    Self::new(path, identifier)
  }
}

/// Listing route of a detail path: its first segment.
///
/// `/users/42/edit` becomes `/users`; an empty path becomes `/`.
pub fn listing_route(path: &str) -> String {
  match path.split('/').find(|s| !s.is_empty()) {
    Some(first) => format!("/{}", first),
    None => "/".to_string(),
  }
}

/// Resolution state for the current route.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolverState<T> {
  /// No identifier in the route
  Idle,
  Resolving { identifier: String },
  Resolved { identifier: String, item: T },
  /// Terminal for this identifier
  Failed { identifier: String, message: String },
}

impl<T> ResolverState<T> {
  pub fn identifier(&self) -> Option<&str> {
    match self {
      ResolverState::Idle => None,
      ResolverState::Resolving { identifier }
      | ResolverState::Resolved { identifier, .. }
      | ResolverState::Failed { identifier, .. } => Some(identifier),
    }
  }

  pub fn item(&self) -> Option<&T> {
    match self {
      ResolverState::Resolved { item, .. } => Some(item),
      _ => None,
    }
  }

  /// Resolved or failed.
  pub fn is_settled(&self) -> bool {
    matches!(
      self,
      ResolverState::Resolved { .. } | ResolverState::Failed { .. }
    )
  }
}

/// Loads the entity named by the route, once per distinct identifier.
pub struct SingleEntityResolver<T: Entity> {
  entity_name: String,
  identifier_fields: Vec<String>,
  service: Arc<dyn EntityService<T>>,
  notifier: Arc<dyn Notifier>,
  navigator: Arc<dyn Navigator>,
  state: Mutex<ResolverState<T>>,
}

impl<T: Entity> SingleEntityResolver<T> {
  pub fn new(
    entity_name: impl Into<String>,
    identifier_fields: Vec<String>,
    service: Arc<dyn EntityService<T>>,
    notifier: Arc<dyn Notifier>,
    navigator: Arc<dyn Navigator>,
  ) -> Self {
    Self {
      entity_name: entity_name.into(),
      identifier_fields,
      service,
      notifier,
      navigator,
      state: Mutex::new(ResolverState::Idle),
    }
  }

  fn lock(&self) -> MutexGuard<'_, ResolverState<T>> {
    // State transitions are single assignments, never left half-done
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn state(&self) -> ResolverState<T> {
    self.lock().clone()
  }

  pub fn selected_item(&self) -> Option<T> {
    self.lock().item().cloned()
  }

  /// Forget the current resolution so the next sync fetches again.
  pub fn reset(&self) {
    *self.lock() = ResolverState::Idle;
  }

  /// Swap in a newer copy of the resolved entity, if it is the same one.
  pub fn replace_item(&self, item: T) -> bool {
    let mut state = self.lock();
    let ResolverState::Resolved { identifier, .. } = &*state else {
      return false;
    };
    if encode(&self.identifier_fields, &item).ok().as_ref() != Some(identifier) {
      return false;
    }
    let identifier = identifier.clone();
    *state = ResolverState::Resolved { identifier, item };
    true
  }

  /// Bring the resolver in line with the current route.
  ///
  /// A different identifier resets the state and clears the selected item
  /// before anything else happens. An identifier seen before (resolving,
  /// resolved or failed) is not fetched again.
  pub async fn sync_route(&self, route: &Route) -> ResolverState<T> {
    let identifier = {
      let mut state = self.lock();
      if state.identifier() != route.identifier.as_deref() {
        *state = ResolverState::Idle;
      }

      match (&*state, &route.identifier) {
        (ResolverState::Idle, Some(identifier)) => {
          *state = ResolverState::Resolving {
            identifier: identifier.clone(),
          };
          identifier.clone()
        }
        _ => return state.clone(),
      }
    };

    let outcome = self.fetch(&identifier).await;

    let mut state = self.lock();
    let still_current = matches!(
      &*state,
      ResolverState::Resolving { identifier: current } if *current == identifier
    );
    if !still_current {
      debug!(
        entity = %self.entity_name,
        identifier = %identifier,
        "route changed while resolving, dropping result"
      );
      return state.clone();
    }

    match outcome {
      Ok(item) => {
        *state = ResolverState::Resolved { identifier, item };
        state.clone()
      }
      Err(err) => {
        *state = ResolverState::Failed {
          identifier: identifier.clone(),
          message: err.to_string(),
        };
        let settled = state.clone();
        drop(state);

        let target = listing_route(&route.path);
        warn!(entity = %self.entity_name, identifier = %identifier, %err, redirect = %target, "resolution failed");
        self.notifier.error(&err.to_string());
        self.navigator.navigate(&target);
        settled
      }
    }
  }

  async fn fetch(&self, identifier: &str) -> Result<T> {
    let id = decode(&self.identifier_fields, identifier);
    let failure = |message: String| CrudError::Resolution {
      identifier: identifier.to_string(),
      message,
    };

    let response = self
      .service
      .get_by_id(&id)
      .await
      .and_then(|r| r.into_result(Operation::GetById))
      .map_err(|e| failure(e.to_string()))?;

    response
      .data
      .ok_or_else(|| failure(format!("{} not found", self.entity_name)))
  }
}
