//! Foreign-key resolution against the target database.
//!
//! Surrogate ids differ between servers, so a foreign-key value is rewritten
//! into a subquery that finds the referenced row on the target by its natural
//! key. When the natural key itself holds foreign keys, those are resolved
//! first, so chains of any depth bottom out at plain values:
//!
//! ```text
//! package_id = (SELECT id FROM rhnpackage
//!               WHERE name_id = (SELECT id FROM rhnpackagename WHERE name = 'vim' limit 1)
//!               and org_id is null limit 1)
//! ```

use std::collections::HashMap;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use crate::core::{format_literal, Row, Schema, SqlValue, Table};
use crate::dump::crawler::related_rows_query;
use crate::error::Result;
use crate::source::RowSource;

/// Guard against foreign-key chains that loop through natural keys.
const MAX_DEPTH: usize = 16;

/// Memo of natural-key predicates by (referenced table, lookup predicate).
///
/// A `None` entry records that no referenced row exists on the source.
#[derive(Debug, Default)]
pub struct FkCache {
    entries: HashMap<String, Option<String>>,
    hits: usize,
}

impl FkCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&mut self, key: &str) -> Option<Option<String>> {
        let found = self.entries.get(key).cloned();
        if found.is_some() {
            self.hits += 1;
        }
        found
    }

    fn insert(&mut self, key: String, predicate: Option<String>) {
        self.entries.insert(key, predicate);
    }

    /// Number of memoized lookups.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of lookups answered from the memo.
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Forget every entry. Called between export subjects.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.hits = 0;
    }
}

/// Rewrites foreign-key columns into target-side subqueries.
pub struct FkResolver<'a> {
    source: &'a dyn RowSource,
    schema: &'a Schema,
    cache: FkCache,
}

impl<'a> FkResolver<'a> {
    pub fn new(source: &'a dyn RowSource, schema: &'a Schema) -> Self {
        Self {
            source,
            schema,
            cache: FkCache::new(),
        }
    }

    pub fn source(&self) -> &'a dyn RowSource {
        self.source
    }

    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    pub fn cache(&self) -> &FkCache {
        &self.cache
    }

    /// Drop all memoized lookups.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Return `row` with every foreign-key column of `table` rewritten.
    ///
    /// Columns whose referenced row cannot be found on the source keep their
    /// original value.
    pub async fn resolve_row(&mut self, table: &Table, row: &Row) -> Result<Row> {
        self.resolve_references(table, row, None, 0).await
    }

    /// Predicate matching `row` on the target through the table's main
    /// unique index, or None when the table has no natural key.
    pub async fn natural_key_predicate(&mut self, table: &Table, row: &Row) -> Result<Option<String>> {
        self.build_predicate(table, row, 0).await
    }

    fn resolve_references<'b>(
        &'b mut self,
        table: &'b Table,
        row: &'b Row,
        only: Option<&'b [String]>,
        depth: usize,
    ) -> BoxFuture<'b, Result<Row>> {
        async move {
            let schema = self.schema;
            let mut resolved = row.clone();

            for reference in &table.references {
                if let Some(columns) = only {
                    if !reference.column_mapping.keys().any(|c| columns.contains(c)) {
                        continue;
                    }
                }
                let Some(target) = schema.get(&reference.table_name) else {
                    continue;
                };
                if depth >= MAX_DEPTH {
                    warn!(
                        "Foreign key chain from {} to {} too deep; keeping source value",
                        table.name, target.name
                    );
                    continue;
                }

                let bindings: Vec<(String, SqlValue)> = reference
                    .column_mapping
                    .iter()
                    .map(|(local, foreign)| (foreign.clone(), row.value(local)))
                    .collect();
                if bindings.iter().any(|(_, v)| v.is_null()) {
                    continue;
                }

                let cache_key = format!(
                    "{}|{}",
                    target.name,
                    bindings
                        .iter()
                        .map(|(c, v)| format!("{}={}", c, format_literal(v)))
                        .collect::<Vec<_>>()
                        .join(",")
                );
                let predicate = match self.cache.get(&cache_key) {
                    Some(predicate) => predicate,
                    None => {
                        let predicate = self.lookup_predicate(target, bindings, depth + 1).await?;
                        self.cache.insert(cache_key, predicate.clone());
                        predicate
                    }
                };

                match predicate {
                    Some(predicate) => {
                        for (local, foreign) in &reference.column_mapping {
                            resolved = resolved.with_value(
                                local,
                                SqlValue::Sql(format!(
                                    "SELECT {} FROM {} WHERE {} limit 1",
                                    foreign, target.name, predicate
                                )),
                            );
                        }
                    }
                    None => debug!(
                        "No {} row found for {}; keeping source value",
                        target.name, table.name
                    ),
                }
            }

            Ok(resolved)
        }
        .boxed()
    }

    fn lookup_predicate<'b>(
        &'b mut self,
        target: &'b Table,
        bindings: Vec<(String, SqlValue)>,
        depth: usize,
    ) -> BoxFuture<'b, Result<Option<String>>> {
        async move {
            let (sql, params) = related_rows_query(target, bindings, None);
            let rows = self.source.query(&sql, &params).await?;
            match rows.into_iter().next() {
                Some(row) => self.build_predicate(target, &row, depth).await,
                None => Ok(None),
            }
        }
        .boxed()
    }

    fn build_predicate<'b>(
        &'b mut self,
        table: &'b Table,
        row: &'b Row,
        depth: usize,
    ) -> BoxFuture<'b, Result<Option<String>>> {
        async move {
            let columns = table.main_unique_columns();
            if columns.is_empty() {
                debug!("Table {} has no natural key to match on", table.name);
                return Ok(None);
            }

            let resolved = self
                .resolve_references(table, row, Some(columns), depth)
                .await?;
            let predicate = columns
                .iter()
                .map(|c| match resolved.value(c) {
                    SqlValue::Null => format!("{} is null", c),
                    value => format!("{} = {}", c, format_literal(&value)),
                })
                .collect::<Vec<_>>()
                .join(" and ");
            Ok(Some(predicate))
        }
        .boxed()
    }
}
