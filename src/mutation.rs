//! Create, update and delete with optimistic cache patches.
//!
//! Every mutation follows the same protocol:
//! 1. Patch the cached page for the current query and keep the [`Revert`]
//! 2. Call the service
//! 3. On success invalidate the entity's pages, then notify success
//! 4. On failure roll the patch back, then notify the error and return it

use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{PatchOp, QueryCacheStore, QueryKey, Revert};
use crate::error::{CrudError, Operation, Result};
use crate::key::encode;
use crate::notify::{ConfirmRequest, Confirmer, Notifier};
use crate::service::{Entity, EntityDescriptor, EntityService, ServiceResponse};

/// Result of a delete that goes through the confirmation gate.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<T> {
  /// The user declined; nothing was touched
  Declined,
  Completed(ServiceResponse<T>),
}

impl<T> MutationOutcome<T> {
  pub fn is_declined(&self) -> bool {
    matches!(self, MutationOutcome::Declined)
  }
}

/// Decrements the pending counter when a mutation ends, however it ends.
struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
  fn enter(counter: &'a AtomicUsize) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(counter)
  }
}

impl Drop for PendingGuard<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

/// Runs mutations for one entity against the shared cache.
///
/// Mutations are independent: several may be in flight at once, each with
/// its own snapshot.
pub struct MutationCoordinator<T: Entity> {
  descriptor: Arc<EntityDescriptor>,
  service: Arc<dyn EntityService<T>>,
  store: Arc<QueryCacheStore>,
  notifier: Arc<dyn Notifier>,
  confirmer: Arc<dyn Confirmer>,
  pending: AtomicUsize,
}

impl<T: Entity> MutationCoordinator<T> {
  pub fn new(
    descriptor: Arc<EntityDescriptor>,
    service: Arc<dyn EntityService<T>>,
    store: Arc<QueryCacheStore>,
    notifier: Arc<dyn Notifier>,
    confirmer: Arc<dyn Confirmer>,
  ) -> Self {
    Self {
      descriptor,
      service,
      store,
      notifier,
      confirmer,
      pending: AtomicUsize::new(0),
    }
  }

  /// Number of mutations currently in flight.
  pub fn pending(&self) -> usize {
    self.pending.load(Ordering::SeqCst)
  }

  pub async fn create(&self, key: &QueryKey, data: &T) -> Result<ServiceResponse<T>> {
    self.run(Operation::Create, key, data).await
  }

  pub async fn update(&self, key: &QueryKey, data: &T) -> Result<ServiceResponse<T>> {
    self.run(Operation::Update, key, data).await
  }

  pub async fn remove(&self, key: &QueryKey, data: &T) -> Result<ServiceResponse<T>> {
    self.run(Operation::Remove, key, data).await
  }

  /// Delete after explicit user confirmation.
  ///
  /// Declining is not an error and leaves the cache and the service alone.
  pub async fn confirm_and_remove(&self, key: &QueryKey, item: &T) -> Result<MutationOutcome<T>> {
    let token = encode(self.descriptor.identifier_fields(), item).ok();
    let request = ConfirmRequest::delete(self.descriptor.name(), token.as_deref());

    if !self.confirmer.confirm(request).await {
      info!(entity = self.descriptor.name(), "delete declined");
      return Ok(MutationOutcome::Declined);
    }

    self
      .remove(key, item)
      .await
      .map(MutationOutcome::Completed)
  }

  async fn run(&self, operation: Operation, key: &QueryKey, data: &T) -> Result<ServiceResponse<T>> {
    let _pending = PendingGuard::enter(&self.pending);
    let name = self.descriptor.name();

    let value = serde_json::to_value(data)?;
    let revert = self.apply_optimistic(operation, key, &value)?;

    let result = match operation {
      Operation::Create => self.service.create(data).await,
      Operation::Update => self.service.update(data).await,
      _ => self.service.remove(data).await,
    }
    .and_then(|response| response.into_result(operation));

    match result {
      Ok(response) => {
        self.store.invalidate(name)?;
        info!(entity = name, %operation, "mutation succeeded");
        let message = response
          .message
          .clone()
          .unwrap_or_else(|| success_message(name, operation));
        self.notifier.success(&message);
        Ok(response)
      }
      Err(err) => {
        if let Some(revert) = revert {
          if let Err(rollback) = self.store.revert(revert) {
            warn!(entity = name, %rollback, "rollback failed");
          }
        }
        warn!(entity = name, %operation, %err, "mutation failed, rolled back");
        self.notifier.error(&err.to_string());
        Err(err)
      }
    }
  }

  fn apply_optimistic(
    &self,
    operation: Operation,
    key: &QueryKey,
    value: &Value,
  ) -> Result<Option<Revert>> {
    let op = match operation {
      Operation::Create => PatchOp::Insert,
      Operation::Update => PatchOp::Update,
      Operation::Remove => PatchOp::Delete,
      other => {
        return Err(CrudError::Config(format!(
          "{} is not a mutation",
          other.label()
        )))
      }
    };
    self
      .store
      .patch(key, self.descriptor.identifier_fields(), op, value)
  }
}

fn success_message(entity_name: &str, operation: Operation) -> String {
  let verb = match operation {
    Operation::Create => "created",
    Operation::Update => "updated",
    _ => "deleted",
  };
  format!("{} {} successfully", entity_name, verb)
}
