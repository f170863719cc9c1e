//! Plain-text output for the command line.

use crudkit::table::{Column, TableData};
use crudkit::SearchPage;
use serde_json::Value;

const MAX_CELL_WIDTH: usize = 40;

/// Truncate a string to at most `max_len` characters, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}

fn printable<'a>(table: &'a TableData, all_columns: bool) -> Vec<&'a Column> {
  if all_columns {
    table.columns.iter().filter(|c| c.is_field()).collect()
  } else {
    table.visible_columns().filter(|c| c.is_field()).collect()
  }
}

/// Rows under the table's field columns, one line each.
pub fn render_table(table: &TableData, rows: &[Value], all_columns: bool, alt_headers: bool) -> String {
  let columns = printable(table, all_columns);
  if columns.is_empty() {
    return String::new();
  }

  let header: Vec<String> = columns
    .iter()
    .map(|c| truncate(c.header.pick(alt_headers), MAX_CELL_WIDTH))
    .collect();
  let cells: Vec<Vec<String>> = rows
    .iter()
    .map(|row| {
      columns
        .iter()
        .map(|c| truncate(&c.cell(row), MAX_CELL_WIDTH))
        .collect()
    })
    .collect();

  let widths: Vec<usize> = (0..columns.len())
    .map(|i| {
      cells
        .iter()
        .map(|line| line[i].chars().count())
        .chain(std::iter::once(header[i].chars().count()))
        .max()
        .unwrap_or(0)
    })
    .collect();

  let format_line = |line: &[String]| {
    line
      .iter()
      .zip(&widths)
      .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
      .collect::<Vec<_>>()
      .join("  ")
      .trim_end()
      .to_string()
  };

  let mut out = Vec::with_capacity(rows.len() + 2);
  out.push(format_line(&header));
  out.push(
    widths
      .iter()
      .map(|w| "-".repeat(*w))
      .collect::<Vec<_>>()
      .join("  "),
  );
  out.extend(cells.iter().map(|line| format_line(line)));
  out.join("\n")
}

/// One record as `header: value` lines.
pub fn render_record(table: &TableData, row: &Value, all_columns: bool) -> String {
  let columns = printable(table, all_columns);
  let width = columns
    .iter()
    .map(|c| c.header.primary.chars().count())
    .max()
    .unwrap_or(0);

  columns
    .iter()
    .map(|c| {
      format!(
        "{:>width$}: {}",
        c.header.primary,
        c.cell(row),
        width = width
      )
    })
    .collect::<Vec<_>>()
    .join("\n")
}

pub fn page_footer<T>(page: &SearchPage<T>) -> String {
  format!(
    "Page {} of {} ({} total)",
    page.page_number,
    page.total_pages.max(1),
    page.total_count
  )
}
