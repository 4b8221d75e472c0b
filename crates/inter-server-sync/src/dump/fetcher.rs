//! Re-reads full rows for batches of identity keys.

use crate::core::{Row, Table};
use crate::dump::crawler::IdentityKey;
use crate::error::Result;
use crate::source::RowSource;

/// Default number of keys per fetch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Fetch the current rows of `table` matching `keys`.
///
/// Keys without NULL components are fetched together with a row-value `IN`
/// list. A NULL never matches inside `IN`, so keys holding one are fetched
/// one by one with `IS NULL` predicates.
pub async fn fetch_rows(
    source: &dyn RowSource,
    table: &Table,
    keys: &[IdentityKey],
) -> Result<Vec<Row>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    let columns = table.columns.join(", ");
    let (with_null, plain): (Vec<&IdentityKey>, Vec<&IdentityKey>) =
        keys.iter().partition(|k| k.has_null());

    let mut rows = Vec::with_capacity(keys.len());
    if !plain.is_empty() {
        let sql = format!(
            "SELECT {} FROM {} WHERE ({}) in ({});",
            columns,
            table.name,
            table.identity_columns().join(", "),
            plain
                .iter()
                .map(|k| format!("({})", key_values(k)))
                .collect::<Vec<_>>()
                .join(", ")
        );
        rows.extend(source.query(&sql, &[]).await?);
    }

    for key in with_null {
        let sql = format!(
            "SELECT {} FROM {} WHERE {};",
            columns,
            table.name,
            key_predicate(key)
        );
        rows.extend(source.query(&sql, &[]).await?);
    }

    Ok(rows)
}

/// Fetch every row of a table, optionally restricted by a WHERE clause.
pub async fn fetch_all_rows(
    source: &dyn RowSource,
    table: &Table,
    filter: Option<&str>,
) -> Result<Vec<Row>> {
    let mut sql = format!("SELECT {} FROM {}", table.columns.join(", "), table.name);
    if let Some(filter) = filter {
        sql.push_str(" WHERE ");
        sql.push_str(filter);
    }
    sql.push(';');
    source.query(&sql, &[]).await
}

fn key_values(key: &IdentityKey) -> String {
    key.fields()
        .iter()
        .map(|(_, v)| v.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn key_predicate(key: &IdentityKey) -> String {
    key.fields()
        .iter()
        .map(|(c, v)| {
            if v == "null" {
                format!("{} is null", c)
            } else {
                format!("{} = {}", c, v)
            }
        })
        .collect::<Vec<_>>()
        .join(" and ")
}
