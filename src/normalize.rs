//! Tabular normalization of decoded key records.
//!
//! Records are flattened into rows with one column per distinct value name,
//! then cleaned up into the fixed table shape written to CSV:
//!
//! - the `Actual_path` bookkeeping column is dropped
//! - value names are grouped case-insensitively, first spelling wins
//! - headers are capitalized (first letter only)
//! - values named `Timestamp` or `Path` get a `_value` suffix
//! - rows without any non-empty value cell are dropped
//! - columns are ordered `Timestamp`, `Path`, then discovery order
//! - rows are stably sorted by timestamp, newest first
//! - timestamps are rewritten to `YYYY-MM-DD T-HH:MM:SS`

use crate::datetime::{canonical_timestamp, is_canonical};
use crate::error::{Error, Result};
use crate::types::KeyRecord;
use indexmap::IndexMap;
use log::warn;
use std::collections::HashMap;

pub const TIMESTAMP_COLUMN: &str = "Timestamp";
pub const PATH_COLUMN: &str = "Path";
const BOOKKEEPING_COLUMN: &str = "Actual_path";
/// Appended to value names that would shadow `Timestamp` or `Path`
pub const RESERVED_SUFFIX: &str = "_value";

/// A normalized, display-ready table for one hive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    timestamp_warnings: usize,
}

impl NormalizedTable {
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of timestamps that could not be put into canonical form
    pub fn timestamp_warnings(&self) -> usize {
        self.timestamp_warnings
    }
}

struct RawRow {
    path: String,
    timestamp: String,
    /// Indexed by column index; may be shorter than the column count
    cells: Vec<String>,
}

/// Incrementally flattens key records, then normalizes them on `finish`
#[derive(Default)]
pub struct TableBuilder {
    /// Case-folded value name -> first-seen spelling; position is the cell index
    columns: IndexMap<String, String>,
    rows: Vec<RawRow>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records pushed so far
    pub fn records(&self) -> usize {
        self.rows.len()
    }

    pub fn push(&mut self, record: KeyRecord) {
        let mut cells = Vec::new();
        for (name, data) in record.values {
            // Value names are case-insensitive in the registry
            let entry = self.columns.entry(name.to_lowercase());
            let index = entry.index();
            entry.or_insert(name);
            if cells.len() <= index {
                cells.resize(index + 1, String::new());
            }
            cells[index] = data;
        }
        self.rows.push(RawRow {
            path: record.path,
            timestamp: record.timestamp,
            cells,
        });
    }

    pub fn finish(self) -> Result<NormalizedTable> {
        let mut headers = vec![TIMESTAMP_COLUMN.to_string(), PATH_COLUMN.to_string()];
        let mut owners: HashMap<String, String> = headers
            .iter()
            .map(|h| (h.clone(), h.clone()))
            .collect();

        let mut kept = Vec::with_capacity(self.columns.len());
        for (index, name) in self.columns.values().enumerate() {
            let mut header = capitalize(name);
            if header == BOOKKEEPING_COLUMN {
                continue;
            }
            if header.eq_ignore_ascii_case(TIMESTAMP_COLUMN) || header.eq_ignore_ascii_case(PATH_COLUMN) {
                header = format!("{}{}", header, RESERVED_SUFFIX);
            }
            if let Some(previous) = owners.insert(header.clone(), name.clone()) {
                return Err(Error::Schema(format!(
                    "value names '{}' and '{}' both map to column '{}'",
                    previous, name, header
                )));
            }
            kept.push(index);
            headers.push(header);
        }

        let mut raw: Vec<RawRow> = self
            .rows
            .into_iter()
            .filter(|row| {
                kept.iter()
                    .any(|&i| row.cells.get(i).is_some_and(|cell| !cell.is_empty()))
            })
            .collect();

        // sort_by is stable: equal timestamps keep decode order
        raw.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut timestamp_warnings = 0;
        let mut rows = Vec::with_capacity(raw.len());
        for mut row in raw {
            let timestamp = match canonical_timestamp(&row.timestamp) {
                Some(formatted) => {
                    if !is_canonical(&formatted) {
                        warn!(
                            "TimestampFormatWarning: {} has unexpected timestamp '{}'",
                            row.path, row.timestamp
                        );
                        timestamp_warnings += 1;
                    }
                    formatted
                }
                None => {
                    warn!(
                        "TimestampFormatWarning: {} has no date/time separator in '{}', kept as is",
                        row.path, row.timestamp
                    );
                    timestamp_warnings += 1;
                    row.timestamp
                }
            };

            let mut cells = Vec::with_capacity(headers.len());
            cells.push(timestamp);
            cells.push(row.path);
            for &index in &kept {
                cells.push(row.cells.get_mut(index).map(std::mem::take).unwrap_or_default());
            }
            rows.push(cells);
        }

        Ok(NormalizedTable {
            headers,
            rows,
            timestamp_warnings,
        })
    }
}

/// Normalize a complete record sequence
pub fn normalize<I>(records: I) -> Result<NormalizedTable>
where
    I: IntoIterator<Item = KeyRecord>,
{
    let mut builder = TableBuilder::new();
    for record in records {
        builder.push(record);
    }
    builder.finish()
}

/// Uppercase the first character, leave the remainder unchanged
fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
