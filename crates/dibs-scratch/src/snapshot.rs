//! Structural snapshot of a schema, as returned by introspection.

use indexmap::IndexMap;

/// Tables of one schema, keyed by table name, in the order the instance
/// reported them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaSnapshot {
    pub name: String,
    pub tables: IndexMap<String, TableSnapshot>,
}

impl SchemaSnapshot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: IndexMap::new(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSnapshot> {
        self.tables.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Returns the table, inserting an empty one if needed.
    pub(crate) fn table_mut(&mut self, name: &str) -> &mut TableSnapshot {
        self.tables
            .entry(name.to_owned())
            .or_insert_with(|| TableSnapshot::new(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableSnapshot {
    pub name: String,
    /// Columns in ordinal position order.
    pub columns: Vec<ColumnSnapshot>,
    pub indexes: Vec<IndexSnapshot>,
}

impl TableSnapshot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSnapshot> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSnapshot {
    pub name: String,
    /// Type as reported by the instance (e.g. `bigint`, `text`).
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

impl ColumnSnapshot {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub name: String,
    /// Full definition, e.g. `CREATE UNIQUE INDEX ... ON ... USING btree (...)`.
    pub definition: String,
}
