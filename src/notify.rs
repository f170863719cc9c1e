//! User-facing collaborators: notifications and confirmation prompts.

use async_trait::async_trait;
use tracing::{error, info};

/// Shows success and error messages to the user.
pub trait Notifier: Send + Sync {
  fn success(&self, message: &str);
  fn error(&self, message: &str);
}

/// Notifier that only writes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
  fn success(&self, message: &str) {
    info!(target: "crudkit::notify", "{}", message);
  }

  fn error(&self, message: &str) {
    error!(target: "crudkit::notify", "{}", message);
  }
}

/// Visual weight of a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmVariant {
  #[default]
  Default,
  Destructive,
}

/// A question put to the user before a destructive action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
  pub title: String,
  pub body: String,
  pub confirm_label: String,
  pub cancel_label: String,
  pub variant: ConfirmVariant,
}

impl ConfirmRequest {
  /// Standard prompt for deleting one record.
  pub fn delete(entity_name: &str, token: Option<&str>) -> Self {
    let body = match token {
      Some(token) => format!(
        "Delete {} `{}`? This action cannot be undone.",
        entity_name, token
      ),
      None => format!("Delete this {}? This action cannot be undone.", entity_name),
    };
    Self {
      title: format!("Delete {}", entity_name),
      body,
      confirm_label: "Delete".to_string(),
      cancel_label: "Cancel".to_string(),
      variant: ConfirmVariant::Destructive,
    }
  }
}

/// Asks the user to accept or decline.
///
/// Resolves to `true` only on explicit acceptance.
#[async_trait]
pub trait Confirmer: Send + Sync {
  async fn confirm(&self, request: ConfirmRequest) -> bool;
}

/// Confirmer with a fixed answer, for non-interactive use.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

#[async_trait]
impl Confirmer for AutoConfirm {
  async fn confirm(&self, request: ConfirmRequest) -> bool {
    info!(title = %request.title, accepted = self.0, "auto-answered confirmation");
    self.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_delete_request_is_destructive() {
    let request = ConfirmRequest::delete("User", Some("42"));
    assert_eq!(request.variant, ConfirmVariant::Destructive);
    assert_eq!(request.title, "Delete User");
    assert!(request.body.contains("`42`"));
  }

  #[tokio::test]
  async fn test_auto_confirm() {
    assert!(AutoConfirm(true).confirm(ConfirmRequest::delete("User", None)).await);
    assert!(!AutoConfirm(false).confirm(ConfirmRequest::delete("User", None)).await);
  }
}
