//! Composite-key codec.
//!
//! An entity's primary key may span several fields. For use in a URL the
//! values are joined, in declared order, into a single token such as
//! `2024-007`.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{CrudError, Result};

/// Separator between the parts of a composite token.
pub const KEY_DELIMITER: char = '-';

/// Identifier field name -> value, as used by `get_by_id`.
pub type IdRecord = BTreeMap<String, String>;

/// Text form of a scalar identifier value.
///
/// Null, arrays and objects cannot take part in a key.
pub fn key_text(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    Value::Null | Value::Array(_) | Value::Object(_) => None,
  }
}

/// Extract the identifier record of an already-serialized entity.
pub fn identity_of(identifier_fields: &[String], entity: &Value) -> Result<IdRecord> {
  identifier_fields
    .iter()
    .map(|field| {
      entity
        .get(field)
        .and_then(key_text)
        .map(|text| (field.clone(), text))
        .ok_or_else(|| CrudError::Encoding {
          field: field.clone(),
        })
    })
    .collect()
}

/// Extract the identifier record of an entity.
pub fn identity<T: Serialize>(identifier_fields: &[String], entity: &T) -> Result<IdRecord> {
  let value = serde_json::to_value(entity)?;
  identity_of(identifier_fields, &value)
}

/// Join the entity's identifier values into a URL token.
pub fn encode<T: Serialize>(identifier_fields: &[String], entity: &T) -> Result<String> {
  let record = identity(identifier_fields, entity)?;
  let parts: Vec<&str> = identifier_fields
    .iter()
    .filter_map(|field| record.get(field).map(String::as_str))
    .collect();
  Ok(parts.join(&KEY_DELIMITER.to_string()))
}

/// Split a URL token back into an identifier record.
///
/// When the number of parts does not match the number of fields (a simple
/// key whose value contains the delimiter, for instance) the whole token is
/// assigned to the first field.
pub fn decode(identifier_fields: &[String], token: &str) -> IdRecord {
  let Some(first) = identifier_fields.first() else {
    return IdRecord::new();
  };

  let parts: Vec<&str> = token.split(KEY_DELIMITER).collect();
  if parts.len() == identifier_fields.len() {
    return identifier_fields
      .iter()
      .cloned()
      .zip(parts.into_iter().map(String::from))
      .collect();
  }

  debug!(
    token,
    parts = parts.len(),
    fields = identifier_fields.len(),
    "key token does not match identifier fields, using whole token for `{}`",
    first
  );
  IdRecord::from([(first.clone(), token.to_string())])
}
