//! Declarative table column metadata.
//!
//! A feature lists its business columns; [`build`] adds the selection,
//! audit and actions columns and derives the column order and the default
//! visibility map a table widget starts from.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::key::key_text;

pub const SELECTION_COLUMN: &str = "select";
pub const ACTIONS_COLUMN: &str = "actions";

/// Audit columns in display order, with their headers.
pub const AUDIT_COLUMNS: [(&str, &str); 6] = [
  ("createdBy", "Created By"),
  ("createdAt", "Created At"),
  ("createdTimezone", "Created Timezone"),
  ("modifiedBy", "Modified By"),
  ("modifiedAt", "Modified At"),
  ("modifiedTimezone", "Modified Timezone"),
];

/// Whether `key` names one of the standard audit fields.
pub fn is_audit_field(key: &str) -> bool {
  AUDIT_COLUMNS.iter().any(|(audit, _)| *audit == key)
}

/// Header text in one or two locales.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedText {
  pub primary: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub secondary: Option<String>,
}

impl LocalizedText {
  pub fn new(primary: impl Into<String>) -> Self {
    Self {
      primary: primary.into(),
      secondary: None,
    }
  }

  pub fn with_secondary(mut self, secondary: impl Into<String>) -> Self {
    self.secondary = Some(secondary.into());
    self
  }

  /// The secondary variant when asked for and present.
  pub fn pick(&self, secondary: bool) -> &str {
    match (&self.secondary, secondary) {
      (Some(text), true) => text,
      _ => &self.primary,
    }
  }
}

impl From<&str> for LocalizedText {
  fn from(text: &str) -> Self {
    Self::new(text)
  }
}

/// Filter widget a column offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
  Text,
  Number,
  Date,
  Select,
  Boolean,
}

/// Formats one row's cell.
#[derive(Clone)]
pub struct CellRenderer(Arc<dyn Fn(&Value) -> String + Send + Sync>);

impl CellRenderer {
  pub fn new(render: impl Fn(&Value) -> String + Send + Sync + 'static) -> Self {
    Self(Arc::new(render))
  }
}

impl fmt::Debug for CellRenderer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("CellRenderer")
  }
}

/// A business column as a feature declares it.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnConfig {
  pub key: String,
  pub header: String,
  #[serde(default)]
  pub header_alt: Option<String>,
  #[serde(default)]
  pub filter: Option<FilterType>,
  #[serde(skip)]
  pub render: Option<CellRenderer>,
}

impl ColumnConfig {
  pub fn new(key: impl Into<String>, header: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      header: header.into(),
      header_alt: None,
      filter: None,
      render: None,
    }
  }

  pub fn filter(mut self, filter: FilterType) -> Self {
    self.filter = Some(filter);
    self
  }

  pub fn render(mut self, render: impl Fn(&Value) -> String + Send + Sync + 'static) -> Self {
    self.render = Some(CellRenderer::new(render));
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
  Selection,
  Data,
  Audit,
  Actions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pin {
  Left,
  Right,
}

/// A finalized column handed to the table widget.
#[derive(Debug, Clone)]
pub struct Column {
  pub id: String,
  pub header: LocalizedText,
  pub kind: ColumnKind,
  pub filter_type: Option<FilterType>,
  pub filterable: bool,
  pub sortable: bool,
  pub pinned: Option<Pin>,
  pub render: Option<CellRenderer>,
}

impl Column {
  fn data(config: ColumnConfig) -> Self {
    let mut header = LocalizedText::new(config.header);
    header.secondary = config.header_alt;
    Self {
      id: config.key,
      header,
      kind: ColumnKind::Data,
      filterable: config.filter.is_some(),
      filter_type: config.filter,
      sortable: true,
      pinned: None,
      render: config.render,
    }
  }

  fn audit(key: &str, header: &str) -> Self {
    let filter_type = if key.ends_with("At") {
      FilterType::Date
    } else {
      FilterType::Text
    };
    Self {
      id: key.to_string(),
      header: LocalizedText::new(header),
      kind: ColumnKind::Audit,
      filter_type: Some(filter_type),
      filterable: true,
      sortable: true,
      pinned: None,
      render: None,
    }
  }

  fn fixed(id: &str, header: &str, kind: ColumnKind, pinned: Pin) -> Self {
    Self {
      id: id.to_string(),
      header: LocalizedText::new(header),
      kind,
      filter_type: None,
      filterable: false,
      sortable: false,
      pinned: Some(pinned),
      render: None,
    }
  }

  /// Whether the column shows a field of the row.
  pub fn is_field(&self) -> bool {
    matches!(self.kind, ColumnKind::Data | ColumnKind::Audit)
  }

  /// Text of this column's cell for `row`.
  pub fn cell(&self, row: &Value) -> String {
    if let Some(render) = &self.render {
      return (render.0)(row);
    }
    match row.get(&self.id) {
      None | Some(Value::Null) => String::new(),
      Some(value) => key_text(value).unwrap_or_else(|| value.to_string()),
    }
  }
}

/// Row actions the screen supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionCapabilities {
  pub edit: bool,
  pub delete: bool,
}

impl ActionCapabilities {
  pub fn any(&self) -> bool {
    self.edit || self.delete
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableOptions {
  pub include_audit_fields: bool,
  pub enable_selection: bool,
  pub actions: ActionCapabilities,
}

impl Default for TableOptions {
  fn default() -> Self {
    Self {
      include_audit_fields: true,
      enable_selection: false,
      actions: ActionCapabilities::default(),
    }
  }
}

/// Output of [`build`].
#[derive(Debug, Clone)]
pub struct TableData {
  pub columns: Vec<Column>,
  pub column_ids: Vec<String>,
  pub initial_visibility: BTreeMap<String, bool>,
}

impl TableData {
  /// Columns shown under the initial visibility map.
  pub fn visible_columns(&self) -> impl Iterator<Item = &Column> {
    self
      .columns
      .iter()
      .filter(|c| self.initial_visibility.get(&c.id).copied().unwrap_or(true))
  }
}

/// Finalize a feature's columns.
///
/// Order: selection, the custom columns as given, audit columns, actions.
/// Audit fields start hidden, everything else visible.
pub fn build(custom: Vec<ColumnConfig>, options: TableOptions) -> TableData {
  let mut columns = Vec::with_capacity(custom.len() + AUDIT_COLUMNS.len() + 2);

  if options.enable_selection {
    columns.push(Column::fixed(
      SELECTION_COLUMN,
      "",
      ColumnKind::Selection,
      Pin::Left,
    ));
  }
  columns.extend(custom.into_iter().map(Column::data));
  if options.include_audit_fields {
    columns.extend(AUDIT_COLUMNS.iter().map(|(key, header)| Column::audit(key, header)));
  }
  if options.actions.any() {
    columns.push(Column::fixed(
      ACTIONS_COLUMN,
      "Actions",
      ColumnKind::Actions,
      Pin::Right,
    ));
  }

  let column_ids = columns.iter().map(|c| c.id.clone()).collect();
  let initial_visibility = columns
    .iter()
    .map(|c| (c.id.clone(), !is_audit_field(&c.id)))
    .collect();

  TableData {
    columns,
    column_ids,
    initial_visibility,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn user_columns() -> Vec<ColumnConfig> {
    vec![
      ColumnConfig::new("name", "Name").filter(FilterType::Text),
      ColumnConfig::new("email", "Email"),
    ]
  }

  #[test]
  fn test_column_order() {
    let table = build(
      user_columns(),
      TableOptions {
        include_audit_fields: true,
        enable_selection: true,
        actions: ActionCapabilities {
          edit: true,
          delete: false,
        },
      },
    );

    assert_eq!(
      table.column_ids,
      vec![
        "select",
        "name",
        "email",
        "createdBy",
        "createdAt",
        "createdTimezone",
        "modifiedBy",
        "modifiedAt",
        "modifiedTimezone",
        "actions",
      ]
    );
    assert_eq!(table.columns[0].pinned, Some(Pin::Left));
    assert_eq!(table.columns.last().unwrap().pinned, Some(Pin::Right));
  }

  #[test]
  fn test_audit_columns_hidden_by_default() {
    let table = build(user_columns(), TableOptions::default());
    for column in &table.columns {
      let visible = table.initial_visibility[&column.id];
      assert_eq!(visible, column.kind != ColumnKind::Audit, "{}", column.id);
    }
    assert_eq!(table.visible_columns().count(), 2);
  }

  #[test]
  fn test_visibility_follows_key_not_position() {
    // A feature declaring an audit key itself still gets it hidden
    let table = build(
      vec![ColumnConfig::new("modifiedBy", "Editor")],
      TableOptions {
        include_audit_fields: false,
        ..TableOptions::default()
      },
    );
    assert_eq!(table.column_ids, vec!["modifiedBy"]);
    assert_eq!(table.initial_visibility["modifiedBy"], false);
  }

  #[test]
  fn test_no_actions_without_capabilities() {
    let table = build(user_columns(), TableOptions::default());
    assert!(!table.column_ids.contains(&ACTIONS_COLUMN.to_string()));
    assert!(!table.column_ids.contains(&SELECTION_COLUMN.to_string()));
  }

  #[test]
  fn test_filterable_and_sortable_flags() {
    let table = build(
      user_columns(),
      TableOptions {
        enable_selection: true,
        actions: ActionCapabilities {
          edit: false,
          delete: true,
        },
        ..TableOptions::default()
      },
    );
    let by_id = |id: &str| table.columns.iter().find(|c| c.id == id).unwrap();

    assert!(by_id("name").filterable);
    assert!(!by_id("email").filterable);
    assert!(by_id("email").sortable);
    assert_eq!(by_id("createdAt").filter_type, Some(FilterType::Date));
    assert!(!by_id("select").sortable);
    assert!(!by_id("actions").filterable);
  }

  #[test]
  fn test_cell_rendering() {
    let table = build(
      vec![
        ColumnConfig::new("name", "Name"),
        ColumnConfig::new("active", "Active")
          .render(|row| if row["active"] == json!(true) { "yes" } else { "no" }.to_string()),
      ],
      TableOptions::default(),
    );
    let row = json!({"name": "Ann", "active": true, "createdBy": null});

    assert_eq!(table.columns[0].cell(&row), "Ann");
    assert_eq!(table.columns[1].cell(&row), "yes");
    assert_eq!(table.columns[2].cell(&row), "");
  }

  #[test]
  fn test_localized_header() {
    let header = LocalizedText::new("Name").with_secondary("Nombre");
    assert_eq!(header.pick(true), "Nombre");
    assert_eq!(LocalizedText::from("Name").pick(true), "Name");
  }

  #[test]
  fn test_is_audit_field() {
    assert!(is_audit_field("createdTimezone"));
    assert!(!is_audit_field("created"));
    assert!(!is_audit_field("name"));
  }
}
