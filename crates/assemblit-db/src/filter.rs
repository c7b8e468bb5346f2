//! Filters, assignments and records passed between callers and the handler.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::coerce::Value;

/// Right-hand side of a filter: one value (`=`) or a set (`IN (...)`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FilterValue {
    One(Value),
    Many(Vec<Value>),
}

/// A `{col, val}` pair used uniformly by select, update and delete operations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Filter {
    pub col: String,
    pub val: FilterValue,
}

impl Filter {
    /// Matches rows where `col = val`.
    pub fn eq(col: impl Into<String>, val: impl Into<Value>) -> Self {
        Self {
            col: col.into(),
            val: FilterValue::One(val.into()),
        }
    }

    /// Matches rows where `col IN (vals...)`. An empty set matches nothing.
    pub fn any_of<I, V>(col: impl Into<String>, vals: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            col: col.into(),
            val: FilterValue::Many(vals.into_iter().map(Into::into).collect()),
        }
    }

    /// Values the filter compares against, as a slice.
    pub fn values(&self) -> &[Value] {
        match &self.val {
            FilterValue::One(value) => std::slice::from_ref(value),
            FilterValue::Many(values) => values,
        }
    }
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::One(value) => write!(f, "{value}"),
            FilterValue::Many(values) => {
                let parts: Vec<String> = values.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// Single-column assignment used by `update` and `reset_column`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub col: String,
    pub val: Value,
}

impl Assignment {
    pub fn new(col: impl Into<String>, val: impl Into<Value>) -> Self {
        Self {
            col: col.into(),
            val: val.into(),
        }
    }
}

/// Ordered column → value mapping. Column order is significant for inserts.
///
/// Only built through `push`, which keeps `columns` and `values` the same length.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Record {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style push; a repeated column replaces the earlier value in place.
    pub fn with(mut self, col: impl Into<String>, val: impl Into<Value>) -> Self {
        self.push(col, val);
        self
    }

    pub fn push(&mut self, col: impl Into<String>, val: impl Into<Value>) {
        let col = col.into();
        let val = val.into();
        match self.columns.iter().position(|existing| *existing == col) {
            Some(idx) => self.values[idx] = val,
            None => {
                self.columns.push(col);
                self.values.push(val);
            }
        }
    }

    pub fn get(&self, col: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|existing| existing == col)
            .map(|idx| &self.values[idx])
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

impl<C: Into<String>, V: Into<Value>> FromIterator<(C, V)> for Record {
    fn from_iter<T: IntoIterator<Item = (C, V)>>(iter: T) -> Self {
        let mut record = Record::new();
        for (col, val) in iter {
            record.push(col, val);
        }
        record
    }
}

/// Sort direction for multi-value selects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }
}

/// One entry of a batch delete: remove every row of `table` matching `filtr`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteTarget {
    pub table: String,
    pub filtr: Filter,
}

impl DeleteTarget {
    pub fn new(table: impl Into<String>, filtr: Filter) -> Self {
        Self {
            table: table.into(),
            filtr,
        }
    }
}
