//! Schema introspection through information_schema and pg_catalog.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::core::{Reference, Row, Schema, SqlValue, Table, UniqueIndex};
use crate::error::Result;
use crate::schema::filters::apply_table_filters;
use crate::source::RowSource;

pub(crate) const READ_TABLE_NAMES: &str = "SELECT table_name::text AS table_name
    FROM information_schema.tables
    WHERE table_schema = 'public'
        AND table_type = 'BASE TABLE'
    ORDER BY table_name;";

pub(crate) const READ_COLUMN_NAMES: &str = "SELECT column_name::text AS column_name
    FROM information_schema.columns
    WHERE table_schema = 'public' AND table_name = $1
    ORDER BY ordinal_position;";

pub(crate) const READ_PK_COLUMN_NAMES: &str = "SELECT a.attname::text AS attname
    FROM pg_index i
    JOIN pg_attribute a ON a.attrelid = i.indrelid
        AND a.attnum = ANY(i.indkey)
    WHERE i.indrelid = $1::text::regclass
        AND i.indisprimary
    ORDER BY array_position(i.indkey::int2[], a.attnum);";

pub(crate) const READ_UNIQUE_INDEX_NAMES: &str =
    "SELECT DISTINCT indexrelid::regclass::text AS index_name
    FROM pg_index i
    JOIN pg_attribute a ON a.attrelid = i.indrelid
        AND a.attnum = ANY(i.indkey)
    WHERE i.indrelid = $1::text::regclass
        AND i.indisunique AND NOT i.indisprimary
    ORDER BY 1;";

pub(crate) const READ_INDEX_COLUMNS: &str = "SELECT a.attname::text AS attname
    FROM pg_index i
    JOIN pg_attribute a ON a.attrelid = i.indrelid
        AND a.attnum = ANY(i.indkey)
    WHERE i.indexrelid = $1::text::regclass
    ORDER BY array_position(i.indkey::int2[], a.attnum);";

pub(crate) const READ_REFERENCE_CONSTRAINT_NAMES: &str =
    "SELECT DISTINCT tc.constraint_name::text AS constraint_name
    FROM information_schema.table_constraints AS tc
        JOIN information_schema.constraint_column_usage AS ccu ON ccu.constraint_name = tc.constraint_name
            AND ccu.table_schema = tc.table_schema
    WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_name = $1
    ORDER BY 1;";

pub(crate) const READ_REFERENCED_BY_CONSTRAINT_NAMES: &str =
    "SELECT DISTINCT tc.constraint_name::text AS constraint_name
    FROM information_schema.table_constraints AS tc
        JOIN information_schema.constraint_column_usage AS ccu ON ccu.constraint_name = tc.constraint_name
            AND ccu.table_schema = tc.table_schema
    WHERE tc.constraint_type = 'FOREIGN KEY' AND ccu.table_name = $1
    ORDER BY 1;";

pub(crate) const READ_REFERENCED_TABLE: &str = "SELECT DISTINCT ccu.table_name::text AS table_name
    FROM information_schema.constraint_column_usage AS ccu
    WHERE ccu.constraint_name = $1;";

pub(crate) const READ_REFERENCED_BY_TABLE: &str = "SELECT DISTINCT tc.table_name::text AS table_name
    FROM information_schema.table_constraints AS tc
    WHERE tc.constraint_name = $1;";

pub(crate) const READ_REFERENCE_CONSTRAINTS: &str =
    "SELECT DISTINCT kcu.column_name::text AS column_name, ccu.column_name::text AS foreign_column_name
    FROM information_schema.table_constraints AS tc
    JOIN information_schema.key_column_usage AS kcu ON tc.constraint_name = kcu.constraint_name
        AND tc.table_schema = kcu.table_schema
        AND tc.table_name = kcu.table_name
    JOIN information_schema.constraint_column_usage AS ccu ON ccu.constraint_name = tc.constraint_name
        AND tc.table_schema = ccu.table_schema
    WHERE tc.constraint_type = 'FOREIGN KEY'
        AND tc.table_name = $1
        AND tc.constraint_name = $2;";

pub(crate) const READ_PK_SEQUENCE: &str = "WITH sequences AS (
        SELECT sequence_name::text AS sequence_name
        FROM information_schema.sequences
        WHERE sequence_schema = 'public'
    ),
    id_constraints AS (
        SELECT tc.constraint_name::text AS constraint_name, tc.table_name, kcu.column_name
        FROM information_schema.table_constraints AS tc
            JOIN information_schema.key_column_usage AS kcu
                ON tc.constraint_name = kcu.constraint_name
        WHERE tc.constraint_schema = 'public'
            AND constraint_type = 'PRIMARY KEY'
            AND kcu.ordinal_position = 1
            AND column_name = 'id'
            AND tc.table_name = $1
    )
    SELECT sequence_name
    FROM id_constraints
    JOIN sequences
        ON replace(regexp_replace(constraint_name, '(_id)?_pk(ey)?', ''), '_', '')
         = replace(regexp_replace(sequence_name, '(_id)?_seq', ''), '_', '');";

/// Reads table metadata from the live database.
pub struct SchemaReader<'a> {
    source: &'a dyn RowSource,
}

impl<'a> SchemaReader<'a> {
    pub fn new(source: &'a dyn RowSource) -> Self {
        Self { source }
    }

    /// Names of every base table in the public schema.
    pub async fn table_names(&self) -> Result<Vec<String>> {
        let rows = self.source.query(READ_TABLE_NAMES, &[]).await?;
        Ok(first_column(&rows))
    }

    /// Load every base table as exportable.
    pub async fn load_all(&self) -> Result<Schema> {
        let names = self.table_names().await?;
        self.load_tables(&names).await
    }

    /// Load the named tables as exportable plus everything they reference.
    ///
    /// Forward-referenced tables are loaded transitively with `export = false`
    /// so foreign keys into them can be resolved. Tables that reference a
    /// loaded table without being loaded themselves end up in `excluded`.
    /// Names that do not exist in the database are skipped.
    pub async fn load_tables<S: AsRef<str>>(&self, names: &[S]) -> Result<Schema> {
        let mut tables: BTreeMap<String, Table> = BTreeMap::new();

        for name in names {
            let name = name.as_ref().to_lowercase();
            if tables.contains_key(&name) {
                continue;
            }
            match self.read_table(&name, true).await? {
                Some(table) => {
                    tables.insert(name, table);
                }
                None => info!("Ignoring nonexisting table {}", name),
            }
        }

        let mut pending: Vec<String> = tables
            .values()
            .flat_map(|t| t.references.iter().map(|r| r.table_name.clone()))
            .collect();
        while let Some(name) = pending.pop() {
            if tables.contains_key(&name) {
                continue;
            }
            if let Some(table) = self.read_table(&name, false).await? {
                debug!("Loaded referenced table {} as non-exportable", name);
                pending.extend(table.references.iter().map(|r| r.table_name.clone()));
                tables.insert(name, table);
            }
        }

        let mut schema = Schema::new();
        for table in tables.into_values() {
            schema.insert(table);
        }
        let excluded: Vec<String> = schema
            .tables
            .values()
            .flat_map(|t| t.referenced_by.iter().map(|r| r.table_name.clone()))
            .filter(|name| !schema.contains(name))
            .collect();
        schema.excluded.extend(excluded);

        info!(
            "Loaded schema metadata: {} tables ({} exportable), {} excluded",
            schema.len(),
            schema.tables.values().filter(|t| t.export).count(),
            schema.excluded.len()
        );
        Ok(schema)
    }

    /// Read one table, or None when it has no columns (does not exist).
    pub async fn read_table(&self, name: &str, export: bool) -> Result<Option<Table>> {
        let param = [SqlValue::Text(name.to_string())];

        let columns = first_column(&self.source.query(READ_COLUMN_NAMES, &param).await?);
        if columns.is_empty() {
            return Ok(None);
        }

        let mut table = Table {
            name: name.to_string(),
            export,
            ..Default::default()
        };
        table.set_columns(columns);
        table.pk_columns = first_column(&self.source.query(READ_PK_COLUMN_NAMES, &param).await?);
        table.pk_sequence = first_column(&self.source.query(READ_PK_SEQUENCE, &param).await?)
            .into_iter()
            .next();

        for index_name in first_column(&self.source.query(READ_UNIQUE_INDEX_NAMES, &param).await?) {
            let columns = first_column(
                &self
                    .source
                    .query(READ_INDEX_COLUMNS, &[SqlValue::Text(index_name.clone())])
                    .await?,
            );
            table.unique_indexes.insert(
                index_name.clone(),
                UniqueIndex {
                    name: index_name,
                    columns,
                },
            );
        }
        table.main_unique_index_name = table.choose_main_unique_index();

        for constraint in
            first_column(&self.source.query(READ_REFERENCE_CONSTRAINT_NAMES, &param).await?)
        {
            let target = self
                .single_name(READ_REFERENCED_TABLE, &constraint)
                .await?;
            let mapping = self.constraint_mapping(name, &constraint).await?;
            if let Some(target) = target {
                table.references.push(Reference {
                    table_name: target,
                    column_mapping: mapping,
                });
            }
        }

        for constraint in
            first_column(&self.source.query(READ_REFERENCED_BY_CONSTRAINT_NAMES, &param).await?)
        {
            if let Some(owner) = self
                .single_name(READ_REFERENCED_BY_TABLE, &constraint)
                .await?
            {
                let mapping = self.constraint_mapping(&owner, &constraint).await?;
                table.referenced_by.push(Reference {
                    table_name: owner,
                    column_mapping: mapping,
                });
            }
        }

        Ok(Some(apply_table_filters(table)))
    }

    async fn single_name(&self, sql: &str, constraint: &str) -> Result<Option<String>> {
        let rows = self
            .source
            .query(sql, &[SqlValue::Text(constraint.to_string())])
            .await?;
        Ok(first_column(&rows).into_iter().next())
    }

    async fn constraint_mapping(
        &self,
        table: &str,
        constraint: &str,
    ) -> Result<BTreeMap<String, String>> {
        let rows = self
            .source
            .query(
                READ_REFERENCE_CONSTRAINTS,
                &[
                    SqlValue::Text(table.to_string()),
                    SqlValue::Text(constraint.to_string()),
                ],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| match (row.get("column_name"), row.get("foreign_column_name")) {
                (Some(SqlValue::Text(local)), Some(SqlValue::Text(foreign))) => {
                    Some((local.clone(), foreign.clone()))
                }
                _ => None,
            })
            .collect())
    }
}

fn first_column(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| match row.iter().next().map(|f| &f.value) {
            Some(SqlValue::Text(s)) => Some(s.clone()),
            _ => None,
        })
        .collect()
}
