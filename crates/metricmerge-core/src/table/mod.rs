//! In-memory table model shared by the wrangling steps.
//!
//! A [`Table`] is an ordered list of column names plus row-major cells. Every
//! wrangling step takes `&Table` and returns a new table, so a caller's batch is
//! never mutated behind its back.
//!
//! Cells read from CSV start out as [`Value::Text`] (or [`Value::Null`] for
//! empty cells) and are refined into [`Value::Int`] / [`Value::Time`] by the
//! normalization and base-time steps.

pub mod reader;
pub mod writer;

use std::borrow::Cow;

use chrono::NaiveDateTime;

use crate::error::StructuralError;

/// Business key column.
pub const POST_ID: &str = "post_id";

/// Observation timestamp column.
pub const POST_EXTRACTED_DATETIME: &str = "post_extracted_datetime";

/// Derived earliest-observation column added by consolidation.
pub const BASE_TIME: &str = "base_time";

/// Format used when writing [`Value::Time`] cells.
pub const OUTPUT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One table cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Text(String),
    Int(i64),
    Time(NaiveDateTime),
}

impl Value {
    /// Build a cell from raw CSV text; empty text is null.
    #[must_use]
    pub fn from_raw(raw: &str) -> Self {
        if raw.is_empty() {
            Self::Null
        } else {
            Self::Text(raw.to_string())
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_time(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Time(ts) => Some(*ts),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Cell text as written to the output file.
    #[must_use]
    pub fn to_cell(&self) -> Cow<'_, str> {
        match self {
            Self::Null => Cow::Borrowed(""),
            Self::Text(text) => Cow::Borrowed(text),
            Self::Int(n) => Cow::Owned(n.to_string()),
            Self::Time(ts) => Cow::Owned(ts.format(OUTPUT_TIME_FORMAT).to_string()),
        }
    }
}

impl From<Option<NaiveDateTime>> for Value {
    fn from(ts: Option<NaiveDateTime>) -> Self {
        ts.map_or(Self::Null, Self::Time)
    }
}

impl From<Option<i64>> for Value {
    fn from(n: Option<i64>) -> Self {
        n.map_or(Self::Null, Self::Int)
    }
}

/// Row-major table with named columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Create an empty table with the given columns.
    #[must_use]
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Create a table from columns and rows of raw text (test and fixture helper).
    #[must_use]
    pub fn from_text(columns: &[&str], rows: &[&[&str]]) -> Self {
        let mut table = Self::new(columns.iter().map(ToString::to_string).collect());
        for row in rows {
            table.push_row(row.iter().map(|cell| Value::from_raw(cell)).collect());
        }
        table
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Index of a column the caller cannot work without.
    ///
    /// # Errors
    ///
    /// Returns [`StructuralError::MissingColumn`] naming `context` when absent.
    pub fn require_column(&self, name: &str, context: &str) -> Result<usize, StructuralError> {
        self.column_index(name)
            .ok_or_else(|| StructuralError::MissingColumn {
                column: name.to_string(),
                context: context.to_string(),
            })
    }

    /// Append a row, padding short rows with nulls and truncating long ones so
    /// every row matches the column count.
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    /// Keep only the rows for which `keep` returns true.
    pub fn retain_rows(&mut self, mut keep: impl FnMut(&[Value]) -> bool) {
        self.rows.retain(|row| keep(row));
    }

    /// Values of one column, top to bottom.
    pub fn column_values(&self, column: usize) -> impl Iterator<Item = &Value> + '_ {
        self.rows.iter().map(move |row| &row[column])
    }

    /// Replace every cell of `column` with the result of `map`.
    pub fn map_column(&mut self, column: usize, mut map: impl FnMut(&Value) -> Value) {
        for row in &mut self.rows {
            row[column] = map(&row[column]);
        }
    }

    /// Set `name` to `values`, replacing an existing column or appending a new one.
    ///
    /// `values` must yield one value per row; missing values become null.
    pub fn upsert_column(&mut self, name: &str, values: impl IntoIterator<Item = Value>) {
        let index = self.column_index(name).unwrap_or_else(|| {
            self.columns.push(name.to_string());
            for row in &mut self.rows {
                row.push(Value::Null);
            }
            self.columns.len() - 1
        });

        let mut values = values.into_iter();
        for row in &mut self.rows {
            row[index] = values.next().unwrap_or(Value::Null);
        }
    }

    /// Business keys of this table, in row order, skipping null/empty keys.
    pub fn keys<'a>(&'a self, key_column: usize) -> impl Iterator<Item = &'a str> + 'a {
        self.column_values(key_column).filter_map(key_text)
    }
}

/// Text of a business-key cell; nulls and blank strings are not keys.
#[must_use]
pub fn key_text(value: &Value) -> Option<&str> {
    value.as_text().filter(|text| !text.trim().is_empty())
}
