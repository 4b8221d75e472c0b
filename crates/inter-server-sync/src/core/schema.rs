//! Schema metadata: tables, unique indexes and foreign-key references.
//!
//! Metadata is discovered from the live database once per export run and is
//! read-only afterwards. References are kept in both directions: a table's
//! `references` are the foreign keys it owns, `referenced_by` are the foreign
//! keys other tables hold on it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Name of the synthetic natural key used when a table has no usable unique index.
pub const VIRTUAL_INDEX_NAME: &str = "virtual_main_unique_index";

/// Unique index over an ordered column list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueIndex {
    /// Index name.
    pub name: String,

    /// Indexed column names.
    pub columns: Vec<String>,
}

impl UniqueIndex {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Foreign-key edge between two tables.
///
/// `column_mapping` maps the column of the table holding the foreign key to
/// the column it points at, whichever side of the edge this reference is
/// stored on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Table on the other end of the edge.
    pub table_name: String,

    /// Foreign-key column -> referenced column.
    pub column_mapping: BTreeMap<String, String>,
}

impl Reference {
    pub fn new(table_name: impl Into<String>, mapping: &[(&str, &str)]) -> Self {
        Self {
            table_name: table_name.into(),
            column_mapping: mapping
                .iter()
                .map(|(l, f)| (l.to_string(), f.to_string()))
                .collect(),
        }
    }
}

/// Table metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    /// Table name (lower case).
    pub name: String,

    /// Whether rows of this table are written to the export.
    pub export: bool,

    /// Column names in ordinal order.
    pub columns: Vec<String>,

    /// Column name -> position in `columns`.
    pub column_indexes: HashMap<String, usize>,

    /// Primary key column names, in index order.
    pub pk_columns: Vec<String>,

    /// Sequence generating the `id` primary key, when there is one.
    pub pk_sequence: Option<String>,

    /// Unique indexes by name.
    pub unique_indexes: BTreeMap<String, UniqueIndex>,

    /// Preferred natural key used to match rows across servers.
    pub main_unique_index_name: Option<String>,

    /// Foreign keys owned by this table.
    pub references: Vec<Reference>,

    /// Foreign keys other tables hold on this one.
    pub referenced_by: Vec<Reference>,

    /// Columns left out of generated statements.
    pub unexport_columns: BTreeSet<String>,
}

impl Table {
    /// Create a table with the given columns and nothing else.
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        Self {
            name: name.into(),
            export: true,
            column_indexes: index_columns(&columns),
            columns,
            ..Default::default()
        }
    }

    /// Replace the column list, rebuilding the position index.
    pub fn set_columns(&mut self, columns: Vec<String>) {
        self.column_indexes = index_columns(&columns);
        self.columns = columns;
    }

    /// Check if the table has the given column.
    pub fn has_column(&self, column: &str) -> bool {
        self.column_indexes.contains_key(column)
    }

    /// Check if a column is part of the primary key.
    pub fn is_pk_column(&self, column: &str) -> bool {
        self.pk_columns.iter().any(|c| c == column)
    }

    /// Check if a column is left out of generated statements.
    pub fn is_unexported(&self, column: &str) -> bool {
        self.unexport_columns.contains(column)
    }

    /// Columns of the main unique index, empty when the table has none.
    pub fn main_unique_columns(&self) -> &[String] {
        self.main_unique_index_name
            .as_ref()
            .and_then(|name| self.unique_indexes.get(name))
            .map(|idx| idx.columns.as_slice())
            .unwrap_or(&[])
    }

    /// Check if the main unique index is synthetic.
    pub fn has_virtual_main_index(&self) -> bool {
        self.main_unique_index_name.as_deref() == Some(VIRTUAL_INDEX_NAME)
    }

    /// Columns identifying a row of this table: the primary key when there
    /// is one, otherwise the main unique index.
    pub fn identity_columns(&self) -> &[String] {
        if self.pk_columns.is_empty() {
            self.main_unique_columns()
        } else {
            &self.pk_columns
        }
    }

    /// Columns written by generated statements, in table order.
    pub fn exported_columns(&self) -> impl Iterator<Item = &String> {
        self.columns.iter().filter(move |c| !self.is_unexported(c))
    }

    /// The first outgoing reference that uses `column` as a foreign key.
    pub fn first_reference_from_column(&self, column: &str) -> Option<&Reference> {
        self.references
            .iter()
            .find(|r| r.column_mapping.contains_key(column))
    }

    /// Pick the main unique index among the loaded indexes.
    ///
    /// A single index wins outright. Otherwise the first index containing a
    /// `label`, then `name`, then `token` column, else the widest index.
    pub fn choose_main_unique_index(&self) -> Option<String> {
        if self.unique_indexes.len() == 1 {
            return self.unique_indexes.keys().next().cloned();
        }
        for column in ["label", "name", "token"] {
            let found = self
                .unique_indexes
                .values()
                .find(|idx| idx.columns.iter().any(|c| c == column));
            if let Some(idx) = found {
                return Some(idx.name.clone());
            }
        }
        self.unique_indexes
            .values()
            .fold(None::<&UniqueIndex>, |best, idx| match best {
                Some(b) if b.columns.len() >= idx.columns.len() => Some(b),
                _ => Some(idx),
            })
            .map(|idx| idx.name.clone())
    }
}

fn index_columns(columns: &[String]) -> HashMap<String, usize> {
    columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.clone(), i))
        .collect()
}

/// What to do with a reference whose target table is not in the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTablePolicy {
    /// Skip the branch and log it.
    #[default]
    Prune,

    /// Fail the run.
    Error,
}

/// Loaded table metadata for one export run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    /// Tables by name.
    pub tables: BTreeMap<String, Table>,

    /// Tables known to exist but deliberately left out of this export.
    pub excluded: BTreeSet<String>,
}

/// Result of looking up a reference target.
#[derive(Debug, Clone, Copy)]
pub enum TableLookup<'a> {
    /// Target is loaded.
    Found(&'a Table),

    /// Target was deliberately not loaded.
    Excluded,

    /// Target is neither loaded nor excluded.
    Unknown,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schema from tables, filling `referenced_by` from `references`.
    pub fn from_tables(tables: impl IntoIterator<Item = Table>) -> Self {
        let mut schema = Self::new();
        for table in tables {
            schema.tables.insert(table.name.clone(), table);
        }
        schema.link_back_references();
        schema
    }

    /// Rebuild every `referenced_by` list from the `references` lists.
    pub fn link_back_references(&mut self) {
        let mut incoming: BTreeMap<String, Vec<Reference>> = BTreeMap::new();
        for table in self.tables.values() {
            for reference in &table.references {
                incoming
                    .entry(reference.table_name.clone())
                    .or_default()
                    .push(Reference {
                        table_name: table.name.clone(),
                        column_mapping: reference.column_mapping.clone(),
                    });
            }
        }
        for table in self.tables.values_mut() {
            table.referenced_by = incoming.remove(&table.name).unwrap_or_default();
        }
    }

    pub fn get(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Look up a table, distinguishing deliberate exclusion from a gap.
    pub fn lookup(&self, name: &str) -> TableLookup<'_> {
        match self.tables.get(name) {
            Some(table) => TableLookup::Found(table),
            None if self.excluded.contains(name) => TableLookup::Excluded,
            None => TableLookup::Unknown,
        }
    }

    pub fn insert(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
