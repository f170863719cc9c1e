//! Error taxonomy for the data-access engine.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T, E = CrudError> = std::result::Result<T, E>;

/// Errors surfaced by the engine.
///
/// The type is `Clone` so a facade can keep the last failure in its `error`
/// field while also handing it back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrudError {
  /// Misconfigured entity or factory (e.g. no identifier fields).
  #[error("invalid configuration: {0}")]
  Config(String),

  /// An identifier field was missing when building a key.
  #[error("cannot encode key: identifier field `{field}` is missing")]
  Encoding { field: String },

  /// Any rejected service call (search, create, update, remove, get by id).
  #[error("{operation} failed: {message}")]
  Remote {
    operation: Operation,
    message: String,
  },

  /// The entity referenced by the route could not be loaded.
  #[error("could not resolve `{identifier}`: {message}")]
  Resolution { identifier: String, message: String },

  /// Cache provider failure.
  #[error("cache storage error: {0}")]
  Storage(String),

  /// An entity could not be converted to or from its cached JSON form.
  #[error("serialization error: {0}")]
  Serialization(String),

  /// `call` was given a name no custom method was registered under.
  #[error("no custom method named `{0}`")]
  UnknownMethod(String),
}

impl CrudError {
  pub fn remote(operation: Operation, message: impl Into<String>) -> Self {
    CrudError::Remote {
      operation,
      message: message.into(),
    }
  }

  pub fn storage(message: impl Into<String>) -> Self {
    CrudError::Storage(message.into())
  }

  /// True for failures of the remote service (always recoverable).
  pub fn is_remote(&self) -> bool {
    matches!(self, CrudError::Remote { .. })
  }
}

impl From<serde_json::Error> for CrudError {
  fn from(err: serde_json::Error) -> Self {
    CrudError::Serialization(err.to_string())
  }
}

/// Remote operations, used to label failures and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
  Search,
  Create,
  Update,
  Remove,
  GetById,
  Custom,
}

impl Operation {
  pub fn label(&self) -> &'static str {
    match self {
      Operation::Search => "search",
      Operation::Create => "create",
      Operation::Update => "update",
      Operation::Remove => "remove",
      Operation::GetById => "get by id",
      Operation::Custom => "custom call",
    }
  }
}

impl std::fmt::Display for Operation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.label())
  }
}
