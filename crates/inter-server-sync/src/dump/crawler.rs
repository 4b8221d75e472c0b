//! Row crawler: collects the identity keys of every row a subject needs.
//!
//! The crawl keeps only identity keys, never full rows. Work items are
//! processed from an explicit LIFO stack; acceptance is set based, so the
//! resulting key sets do not depend on the visiting order.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::core::{format_literal, Reference, Row, Schema, SqlValue, Table, TableLookup, UnknownTablePolicy};
use crate::dump::navigation::should_follow_back_reference;
use crate::error::{Result, SyncError};
use crate::source::RowSource;

/// Junction tables whose rows are restricted by the since-timestamp.
pub const TIME_FILTERED_TABLES: &[&str] = &[
    "rhnchannelerrata",
    "rhnchannelpackage",
    "susemddata",
    "rhnerratafilechannel",
];

/// Separator between key values in an identity key id.
const KEY_SEPARATOR: &str = "$$";

/// Identity of one exported row: key column -> canonical value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    fields: Vec<(String, String)>,
}

impl IdentityKey {
    /// Build the key of `row` from the table's identity columns.
    pub fn from_row(table: &Table, row: &Row) -> Self {
        Self {
            fields: table
                .identity_columns()
                .iter()
                .map(|c| (c.clone(), format_literal(&row.value(c))))
                .collect(),
        }
    }

    /// Stable string id of this key.
    pub fn id(&self) -> String {
        self.fields
            .iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(KEY_SEPARATOR)
    }

    /// Key fields in identity column order.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Canonical value of one key column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    /// Check if any key column is NULL.
    pub fn has_null(&self) -> bool {
        self.fields.iter().any(|(_, v)| v == "null")
    }
}

/// Distinct identity keys of one table, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct TableKeys {
    keys: Vec<IdentityKey>,
    seen: HashSet<String>,
}

impl TableKeys {
    /// Add a key; false if it was already present.
    pub fn insert(&mut self, key: IdentityKey) -> bool {
        if self.seen.insert(key.id()) {
            self.keys.push(key);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.seen.contains(&key.id())
    }

    pub fn keys(&self) -> &[IdentityKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Per-table identity keys collected for one subject.
#[derive(Debug, Clone, Default)]
pub struct ExportSet {
    tables: BTreeMap<String, TableKeys>,
    paths: BTreeSet<String>,
}

impl ExportSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a key reached through `path`; false if it was already known.
    pub fn insert(&mut self, table: &str, key: IdentityKey, path: &[String]) -> bool {
        let added = self.tables.entry(table.to_string()).or_default().insert(key);
        if added {
            self.paths.insert(path.join(","));
        }
        added
    }

    /// Keys of a table, if any were collected.
    pub fn table(&self, table: &str) -> Option<&TableKeys> {
        self.tables.get(table)
    }

    /// Keys of a table, empty when none were collected.
    pub fn keys(&self, table: &str) -> &[IdentityKey] {
        self.tables.get(table).map(|t| t.keys()).unwrap_or(&[])
    }

    /// Check if any key was collected for a table.
    pub fn has_data(&self, table: &str) -> bool {
        self.tables.get(table).is_some_and(|t| !t.is_empty())
    }

    /// Tables with at least one key.
    pub fn tables(&self) -> impl Iterator<Item = (&String, &TableKeys)> {
        self.tables.iter().filter(|(_, k)| !k.is_empty())
    }

    /// Distinct traversal paths that produced new keys.
    pub fn paths(&self) -> &BTreeSet<String> {
        &self.paths
    }

    /// Total number of keys over all tables.
    pub fn total_keys(&self) -> usize {
        self.tables.values().map(TableKeys::len).sum()
    }
}

struct WorkItem {
    table: String,
    row: Row,
    path: Vec<String>,
}

/// Explores the schema graph from a filtered row set.
pub struct Crawler<'a> {
    source: &'a dyn RowSource,
    schema: &'a Schema,
    since: Option<NaiveDateTime>,
    unknown_tables: UnknownTablePolicy,
    warned: HashSet<String>,
}

impl<'a> Crawler<'a> {
    pub fn new(source: &'a dyn RowSource, schema: &'a Schema) -> Self {
        Self {
            source,
            schema,
            since: None,
            unknown_tables: UnknownTablePolicy::default(),
            warned: HashSet::new(),
        }
    }

    /// Restrict time-partitioned junction rows to those modified since `since`.
    pub fn with_since(mut self, since: Option<NaiveDateTime>) -> Self {
        self.since = since;
        self
    }

    /// Set how references to tables missing from the schema are handled.
    pub fn with_unknown_tables(mut self, policy: UnknownTablePolicy) -> Self {
        self.unknown_tables = policy;
        self
    }

    /// Collect the identity keys of every row reachable from
    /// `SELECT * FROM start_table WHERE start_filter`.
    pub async fn crawl(&mut self, start_table: &str, start_filter: &str) -> Result<ExportSet> {
        let mut export_set = ExportSet::new();

        if self.table(start_table)?.is_none() {
            return Ok(export_set);
        }

        let seed_sql = format!("SELECT * FROM {} WHERE {}", start_table, start_filter);
        let seed = self.source.query(&seed_sql, &[]).await?;
        debug!("Crawl of {} seeded with {} rows", start_table, seed.len());

        let mut stack: Vec<WorkItem> = seed
            .into_iter()
            .map(|row| WorkItem {
                table: start_table.to_string(),
                row,
                path: vec![start_table.to_string()],
            })
            .collect();

        while let Some(item) = stack.pop() {
            let Some(table) = self.table(&item.table)? else {
                continue;
            };

            let key = IdentityKey::from_row(table, &item.row);
            if !export_set.insert(&table.name, key, &item.path) {
                continue;
            }

            for reference in &table.references {
                if item.path.iter().any(|p| *p == reference.table_name) {
                    continue;
                }
                let Some(target) = self.table(&reference.table_name)? else {
                    continue;
                };
                let bindings: Vec<(String, SqlValue)> = reference
                    .column_mapping
                    .iter()
                    .map(|(local, foreign)| (foreign.clone(), item.row.value(local)))
                    .collect();
                self.push_related(&mut stack, target, bindings, &item.path)
                    .await?;
            }

            for reference in &table.referenced_by {
                if item.path.iter().any(|p| *p == reference.table_name) {
                    continue;
                }
                let Some(candidate) = self.table(&reference.table_name)? else {
                    continue;
                };
                if !should_follow_back_reference(&item.path, table, candidate) {
                    continue;
                }
                let bindings = back_bindings(reference, &item.row);
                self.push_related(&mut stack, candidate, bindings, &item.path)
                    .await?;
            }
        }

        log_summary(start_table, &export_set);
        Ok(export_set)
    }

    /// Resolve a table name against the schema, pruning missing tables.
    fn table(&mut self, name: &str) -> Result<Option<&'a Table>> {
        let schema: &'a Schema = self.schema;
        match schema.lookup(name) {
            TableLookup::Found(table) => Ok(Some(table)),
            TableLookup::Excluded => {
                debug!("Pruning branch into excluded table {}", name);
                Ok(None)
            }
            TableLookup::Unknown => match self.unknown_tables {
                UnknownTablePolicy::Error => Err(SyncError::Schema(format!(
                    "reference to table {} which is not in the loaded schema",
                    name
                ))),
                UnknownTablePolicy::Prune => {
                    if self.warned.insert(name.to_string()) {
                        warn!(
                            "Table {} is referenced but not in the loaded schema; its rows are not exported",
                            name
                        );
                    }
                    Ok(None)
                }
            },
        }
    }

    async fn push_related(
        &self,
        stack: &mut Vec<WorkItem>,
        target: &Table,
        bindings: Vec<(String, SqlValue)>,
        path: &[String],
    ) -> Result<()> {
        // NULL never matches an equality, skip the round trip.
        if bindings.is_empty() || bindings.iter().any(|(_, v)| v.is_null()) {
            return Ok(());
        }

        let (sql, params) = related_rows_query(target, bindings, self.since);
        let rows = self.source.query(&sql, &params).await?;

        let mut next_path = path.to_vec();
        next_path.push(target.name.clone());
        for row in rows {
            stack.push(WorkItem {
                table: target.name.clone(),
                row,
                path: next_path.clone(),
            });
        }
        Ok(())
    }
}

/// Bindings for the rows of `reference.table_name` pointing at `row`.
fn back_bindings(reference: &Reference, row: &Row) -> Vec<(String, SqlValue)> {
    reference
        .column_mapping
        .iter()
        .map(|(fk_column, owner_column)| (fk_column.clone(), row.value(owner_column)))
        .collect()
}

/// `SELECT <cols> FROM <table> WHERE c1 = $1 and ...`, plus the optional
/// since-timestamp predicate for time-partitioned junction tables.
pub(crate) fn related_rows_query(
    table: &Table,
    bindings: Vec<(String, SqlValue)>,
    since: Option<NaiveDateTime>,
) -> (String, Vec<SqlValue>) {
    let mut conditions = Vec::with_capacity(bindings.len() + 1);
    let mut params = Vec::with_capacity(bindings.len() + 1);
    for (column, value) in bindings {
        params.push(value);
        conditions.push(format!("{} = ${}", column, params.len()));
    }
    if let Some(since) = since {
        if TIME_FILTERED_TABLES.contains(&table.name.as_str()) {
            params.push(SqlValue::Timestamp(since));
            conditions.push(format!("modified >= ${}::timestamp", params.len()));
        }
    }
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        table.columns.join(", "),
        table.name,
        conditions.join(" and ")
    );
    (sql, params)
}

fn log_summary(start_table: &str, export_set: &ExportSet) {
    let largest = export_set
        .tables()
        .max_by_key(|(_, keys)| keys.len())
        .map(|(name, keys)| format!("{} ({} keys)", name, keys.len()))
        .unwrap_or_default();
    info!(
        "Crawl from {} collected {} keys in {} tables over {} paths",
        start_table,
        export_set.total_keys(),
        export_set.tables().count(),
        export_set.paths().len()
    );
    debug!("Largest table in export set: {}", largest);
}
