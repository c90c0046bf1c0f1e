//! Row and schema model
//!
//! Every record in the engine is a [`Row`]: a vector of string values aligned
//! to a shared [`Schema`], plus provenance (source, file, line) for
//! diagnostics and an order key for first-occurrence semantics. Nodes and
//! edges share the representation; the column universe below tells them
//! apart.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Canonical node columns, in output order. Unknown columns follow these.
pub const NODE_COLUMNS: &[&str] = &[
    "id",
    "category",
    "name",
    "description",
    "xref",
    "provided_by",
    "synonym",
    "iri",
    "deprecated",
    "subsets",
];

/// Canonical edge columns, in output order. Unknown columns follow these.
pub const EDGE_COLUMNS: &[&str] = &[
    "subject",
    "predicate",
    "object",
    "relation",
    "primary_knowledge_source",
    "knowledge_source",
];

/// Node columns whose values are pipe-separated sets, merged across
/// duplicate rows rather than taken from the winner.
pub const SET_VALUED_COLUMNS: &[&str] = &["xref", "synonym", "subsets"];

/// Separator for multi-valued fields
pub const LIST_SEPARATOR: char = '|';

/// Whether the engine is processing the node table or the edge table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Nodes,
    Edges,
}

impl TableKind {
    /// The canonical (always-first) columns for this table
    pub fn canonical_columns(self) -> &'static [&'static str] {
        match self {
            TableKind::Nodes => NODE_COLUMNS,
            TableKind::Edges => EDGE_COLUMNS,
        }
    }

    /// Columns that must be present in every input header
    pub fn required_columns(self) -> &'static [&'static str] {
        match self {
            TableKind::Nodes => &["id", "category"],
            TableKind::Edges => &["subject", "predicate", "object"],
        }
    }
}

/// A column layout shared by every row of a stream.
///
/// Canonical columns come first, in their fixed order; columns outside the
/// universe follow in first-seen order and are forwarded verbatim.
#[derive(Debug)]
pub struct Schema {
    columns: Vec<String>,
    index: HashMap<String, usize>,
}

impl Schema {
    /// Build a schema for `kind` covering `observed` columns in first-seen
    /// order. Canonical columns are always present, even when no input file
    /// declares them.
    pub fn for_table<'a>(kind: TableKind, observed: impl IntoIterator<Item = &'a str>) -> Self {
        let mut columns: Vec<String> = kind
            .canonical_columns()
            .iter()
            .map(|c| c.to_string())
            .collect();
        for col in observed {
            if !columns.iter().any(|c| c == col) {
                columns.push(col.to_string());
            }
        }
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Self { columns, index }
    }

    /// Column names in output order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Position of a column, if present
    pub fn position(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }
}

/// Where a row came from, for diagnostics and priority rules
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provenance {
    /// Configured source name
    pub source: String,
    /// Configured source rank (smaller = higher priority)
    pub rank: u32,
    /// File the row was read from
    pub path: String,
    /// 1-based line number within that file
    pub line: u64,
}

/// Global first-occurrence order: sources in configuration order, rows in
/// file order within a source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub source_index: u32,
    pub row_seq: u64,
}

/// One record flowing through the engine
#[derive(Debug, Clone)]
pub struct Row {
    schema: Arc<Schema>,
    values: Vec<String>,
    provenance: Provenance,
    order: OrderKey,
}

impl Row {
    pub fn new(
        schema: Arc<Schema>,
        values: Vec<String>,
        provenance: Provenance,
        order: OrderKey,
    ) -> Self {
        debug_assert_eq!(values.len(), schema.len());
        Self {
            schema,
            values,
            provenance,
            order,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Value of a column; absent columns read as the empty string
    pub fn get(&self, column: &str) -> &str {
        self.schema
            .position(column)
            .map(|i| self.values[i].as_str())
            .unwrap_or("")
    }

    /// Overwrite a column value. Unknown columns are ignored: the schema is
    /// fixed for the stream.
    pub fn set(&mut self, column: &str, value: impl Into<String>) {
        if let Some(i) = self.schema.position(column) {
            self.values[i] = value.into();
        }
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut Vec<String> {
        &mut self.values
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn order(&self) -> OrderKey {
        self.order
    }

    /// Reassign the order key (used when derived rows are appended after the
    /// primary streams).
    pub fn set_order(&mut self, order: OrderKey) {
        self.order = order;
    }

    /// Approximate in-memory footprint, used for partition budgeting
    pub fn approx_bytes(&self) -> usize {
        self.values.iter().map(|v| v.len() + 24).sum::<usize>() + 64
    }
}

/// Split a pipe-separated list field into its non-empty members
pub fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(LIST_SEPARATOR).filter(|v| !v.is_empty())
}

/// Join list members back into a pipe-separated field
pub fn join_list<S: AsRef<str>>(values: impl IntoIterator<Item = S>) -> String {
    let mut out = String::new();
    for v in values {
        if !out.is_empty() {
            out.push(LIST_SEPARATOR);
        }
        out.push_str(v.as_ref());
    }
    out
}
