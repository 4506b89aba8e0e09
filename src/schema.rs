//! Table schema descriptions used by the in-memory database and available
//! to embedders that validate programs before execution.

use serde::{Deserialize, Serialize};

use crate::{DataKind, TableId};

/// A column declaration: name, value kind, and (for `Record` columns) the
/// referenced table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ColumnSpec {
    pub name: String,
    pub kind: DataKind,
    pub reference: Option<TableId>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: DataKind) -> Self {
        Self {
            name: name.into(),
            kind,
            reference: None,
        }
    }

    pub fn reference(name: impl Into<String>, table: TableId) -> Self {
        Self {
            name: name.into(),
            kind: DataKind::Record,
            reference: Some(table),
        }
    }
}

/// A table declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Kind of the table key; `None` for keyless (array) tables.
    pub key_kind: Option<DataKind>,
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn builder(name: impl Into<String>) -> TableSchemaBuilder {
        TableSchemaBuilder {
            name: name.into(),
            key_kind: None,
            columns: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// Builder for [`TableSchema`].
#[derive(Debug)]
pub struct TableSchemaBuilder {
    name: String,
    key_kind: Option<DataKind>,
    columns: Vec<ColumnSpec>,
}

impl TableSchemaBuilder {
    pub fn key(mut self, kind: DataKind) -> Self {
        self.key_kind = Some(kind);
        self
    }

    pub fn column(mut self, name: impl Into<String>, kind: DataKind) -> Self {
        self.columns.push(ColumnSpec::new(name, kind));
        self
    }

    pub fn reference_column(mut self, name: impl Into<String>, table: TableId) -> Self {
        self.columns.push(ColumnSpec::reference(name, table));
        self
    }

    pub fn build(self) -> TableSchema {
        TableSchema {
            name: self.name,
            key_kind: self.key_kind,
            columns: self.columns,
        }
    }
}
