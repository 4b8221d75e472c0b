//! SQL statement generation for exported rows.
//!
//! Every INSERT is idempotent: either an `ON CONFLICT` upsert on the natural
//! key or a `WHERE NOT EXISTS` guarded insert for tables whose natural key is
//! not backed by a real constraint.

use crate::core::{format_literal, Row, Schema, SqlValue, Table};

/// Columns that keep their source value after foreign-key resolution,
/// as (table, column). Errata severities share ids across servers.
pub const ROW_FILTERS: &[(&str, &str)] = &[("rhnerrata", "severity_id")];

/// What an upsert does on conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    Update,
    Nothing,
}

type ConflictTarget = fn(&Row) -> (String, ConflictAction);

/// Tables whose uniqueness depends on which optional columns are set.
pub const CONFLICT_OVERRIDES: &[(&str, ConflictTarget)] = &[
    ("rhnerrataseverity", errata_severity_conflict),
    ("rhnerrata", errata_conflict),
    ("rhnpackageevr", package_evr_conflict),
    ("rhnpackagecapability", package_capability_conflict),
];

fn errata_severity_conflict(_row: &Row) -> (String, ConflictAction) {
    ("(id)".to_string(), ConflictAction::Update)
}

fn errata_conflict(row: &Row) -> (String, ConflictAction) {
    let target = if row.value("org_id").is_null() {
        "(advisory) WHERE org_id IS NULL"
    } else {
        "(advisory, org_id) WHERE org_id IS NOT NULL"
    };
    (target.to_string(), ConflictAction::Update)
}

fn package_evr_conflict(row: &Row) -> (String, ConflictAction) {
    let target = if row.value("epoch").is_null() {
        "(version, release, ((evr).type)) WHERE epoch IS NULL"
    } else {
        "(version, release, epoch, ((evr).type)) WHERE epoch IS NOT NULL"
    };
    (target.to_string(), ConflictAction::Nothing)
}

fn package_capability_conflict(row: &Row) -> (String, ConflictAction) {
    let target = if row.value("version").is_null() {
        "(name) WHERE version IS NULL"
    } else {
        "(name, version) WHERE version IS NOT NULL"
    };
    (target.to_string(), ConflictAction::Nothing)
}

/// Replace a sequence-backed `id` with a fresh value on the target.
pub fn substitute_primary_key(table: &Table, row: &Row) -> Row {
    match &table.pk_sequence {
        Some(seq) if row.get("id").is_some() => {
            row.with_value("id", SqlValue::Sql(format!("SELECT nextval('{}')", seq)))
        }
        _ => row.clone(),
    }
}

/// Restore columns listed in [`ROW_FILTERS`] to their source values.
pub fn apply_row_filters(table: &Table, source_row: &Row, resolved: Row) -> Row {
    ROW_FILTERS
        .iter()
        .filter(|(t, _)| *t == table.name)
        .fold(resolved, |row, (_, column)| {
            row.with_value(column, source_row.value(column))
        })
}

/// Drop the table's unexported columns.
pub fn drop_unexported(table: &Table, row: &Row) -> Row {
    row.without(|c| table.is_unexported(c))
}

fn column_list(row: &Row) -> String {
    row.iter()
        .map(|f| f.column.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn update_set(table: &Table, row: &Row) -> Vec<String> {
    row.iter()
        .filter(|f| !table.is_pk_column(&f.column) && !table.is_unexported(&f.column))
        .map(|f| format!("{0} = excluded.{0}", f.column))
        .collect()
}

/// Conflict clause following `ON CONFLICT`.
pub fn on_conflict_clause(table: &Table, row: &Row) -> String {
    let (target, action) = match CONFLICT_OVERRIDES.iter().find(|(t, _)| *t == table.name) {
        Some((_, conflict)) => conflict(row),
        None => {
            let columns = table.main_unique_columns();
            if columns.is_empty() {
                return "DO NOTHING".to_string();
            }
            (format!("({})", columns.join(", ")), ConflictAction::Update)
        }
    };

    match action {
        ConflictAction::Nothing => format!("{} DO NOTHING", target),
        ConflictAction::Update => {
            let mut set = update_set(table, row);
            // An update keeps conflicting rows visible to RETURNING.
            if set.is_empty() {
                if let Some(first) = table.main_unique_columns().first() {
                    set.push(format!("{0} = excluded.{0}", first));
                }
            }
            if set.is_empty() {
                format!("{} DO NOTHING", target)
            } else {
                format!("{} DO UPDATE SET {}", target, set.join(", "))
            }
        }
    }
}

/// `INSERT ... VALUES (...) ON CONFLICT ...;`
pub fn insert_statement(table: &Table, row: &Row) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT {};",
        table.name,
        column_list(row),
        row.to_values_list(),
        on_conflict_clause(table, row)
    )
}

/// `INSERT ... SELECT ... WHERE NOT EXISTS (...) [AND EXISTS (...)];`
///
/// Parent-gated rows also require every resolved natural-key subquery to
/// find its row, so rows whose parent was not exported are skipped.
pub fn guarded_insert_statement(table: &Table, row: &Row, parent_gated: bool) -> String {
    let key_columns: Vec<&str> = if table.main_unique_columns().is_empty() {
        row.iter().map(|f| f.column.as_str()).collect()
    } else {
        table.main_unique_columns().iter().map(String::as_str).collect()
    };

    let predicate = key_columns
        .iter()
        .map(|c| match row.value(c) {
            SqlValue::Null => format!("{} IS NULL", c),
            value => format!("{} = {}", c, format_literal(&value)),
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    let mut statement = format!(
        "INSERT INTO {} ({}) SELECT {} WHERE NOT EXISTS (SELECT 1 FROM {} WHERE {})",
        table.name,
        column_list(row),
        row.to_values_list(),
        table.name,
        predicate
    );
    if parent_gated {
        for column in &key_columns {
            if let SqlValue::Sql(expr) = row.value(column) {
                statement.push_str(&format!(" AND EXISTS ({})", expr));
            }
        }
    }
    statement.push(';');
    statement
}

/// Chain of `INNER JOIN`s leading from the last table of `path` back to the first.
pub fn join_chain(schema: &Schema, path: &[String]) -> String {
    let reversed: Vec<&String> = path.iter().rev().collect();
    let mut joins = String::new();
    for pair in reversed.windows(2) {
        let (first, second) = (pair[0], pair[1]);
        let Some(first_table) = schema.get(first) else {
            continue;
        };

        let incoming = first_table
            .referenced_by
            .iter()
            .find(|r| r.table_name == *second);
        let condition = match incoming {
            Some(reference) => reference
                .column_mapping
                .iter()
                .map(|(fk, col)| format!("{}.{} = {}.{}", second, fk, first, col))
                .collect::<Vec<_>>(),
            None => match first_table.references.iter().find(|r| r.table_name == *second) {
                Some(reference) => reference
                    .column_mapping
                    .iter()
                    .map(|(local, foreign)| format!("{}.{} = {}.{}", second, foreign, first, local))
                    .collect(),
                None => continue,
            },
        };
        joins.push_str(&format!(" INNER JOIN {} on {}", second, condition.join(" and ")));
    }
    joins
}

/// Columns identifying rows in clean statements.
fn clean_key_columns(table: &Table) -> &[String] {
    match table.main_unique_columns() {
        [] => table.pk_columns.as_slice(),
        columns => columns,
    }
}

/// `SELECT t.k1, t.k2 FROM t <joins> <scope>`: rows of `table` currently
/// belonging to the subject on the target.
pub fn existing_rows_query(table: &Table, joins: &str, clean_where: &str) -> String {
    let columns = clean_key_columns(table)
        .iter()
        .map(|c| format!("{}.{}", table.name, c))
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {} FROM {}{} {}", columns, table.name, joins, clean_where)
}

/// Delete every subject row of a table that has no rows in this export.
pub fn clean_delete_statement(table: &Table, joins: &str, clean_where: &str) -> String {
    format!(
        "DELETE FROM {} WHERE ({}) IN ({});",
        table.name,
        clean_key_columns(table).join(", "),
        existing_rows_query(table, joins, clean_where)
    )
}

/// Upsert the exported rows and delete the subject's stale rows in one statement.
pub fn clean_insert_statement(
    table: &Table,
    rows: &[Row],
    joins: &str,
    clean_where: &str,
) -> Option<String> {
    let first = rows.first()?;
    let keys = clean_key_columns(table).join(", ");
    let values = rows
        .iter()
        .map(|r| format!("({})", r.to_values_list()))
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!(
        "WITH new_records_{name} AS (INSERT INTO {name} ({columns}) VALUES {values} ON CONFLICT {conflict} RETURNING {keys}) \
         DELETE FROM {name} WHERE ({keys}) IN ({existing} EXCEPT ALL SELECT * FROM new_records_{name});",
        name = table.name,
        columns = column_list(first),
        values = values,
        conflict = on_conflict_clause(table, first),
        keys = keys,
        existing = existing_rows_query(table, joins, clean_where),
    ))
}
