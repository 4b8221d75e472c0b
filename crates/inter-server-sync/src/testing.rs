//! Test helpers: an in-memory row source and schema builders.
//!
//! `MemorySource` evaluates the narrow statement grammar produced by the
//! crawler, fetcher and resolver:
//!
//! ```text
//! SELECT <* | c1, c2> FROM <table> [WHERE <cond> [and <cond>]...] [limit n][;]
//! cond := col = $n | col = <literal> | col is null | col >= $n::timestamp
//!       | col >= <literal> | col in (<lit>, ...) | col in (<select>)
//!       | (c1, c2) in ((<lit>, <lit>), ...)
//! ```
//!
//! Values are compared by their SQL literal rendering, so `I32(5)` matches a
//! bound `I64(5)` the way the server would after coercion.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::{
    format_literal, Field, Reference, Row, Schema, SqlValue, Table, UniqueIndex, VIRTUAL_INDEX_NAME,
};
use crate::error::{Result, SyncError};
use crate::source::RowSource;

/// Build a table with a single `id` primary key.
pub fn make_table(name: &str, columns: &[&str]) -> Table {
    let mut table = Table::new(name, columns);
    if table.has_column("id") {
        table.pk_columns = vec!["id".to_string()];
    }
    table
}

/// Add a unique index and make it the main one.
pub fn with_main_index(mut table: Table, name: &str, columns: &[&str]) -> Table {
    table
        .unique_indexes
        .insert(name.to_string(), UniqueIndex::new(name, columns));
    table.main_unique_index_name = Some(name.to_string());
    table
}

/// Add an outgoing reference.
pub fn with_reference(mut table: Table, target: &str, mapping: &[(&str, &str)]) -> Table {
    table.references.push(Reference::new(target, mapping));
    table
}

/// Build a row from column/value pairs.
pub fn make_row(values: &[(&str, SqlValue)]) -> Row {
    values
        .iter()
        .map(|(c, v)| Field::new(*c, v.clone()))
        .collect()
}

pub fn int(v: i64) -> SqlValue {
    SqlValue::I64(v)
}

pub fn text(v: &str) -> SqlValue {
    SqlValue::Text(v.to_string())
}

/// Two channels sharing nothing: `base-x86_64` (id 1) and `other` (id 2).
///
/// Each channel has one package, linked through `rhnchannelpackage`, and a
/// distribution map row. Only `other` has comps. `rhnchannelarch` is loaded
/// as a non-exportable lookup table and `rhnserverchannel` is excluded.
pub fn channel_scenario() -> (Schema, MemorySource) {
    let mut channel = with_reference(
        with_main_index(
            make_table("rhnchannel", &["id", "label", "channel_arch_id"]),
            "rhn_channel_label_uq",
            &["label"],
        ),
        "rhnchannelarch",
        &[("channel_arch_id", "id")],
    );
    channel.pk_sequence = Some("rhn_channel_id_seq".to_string());

    let mut arch = with_main_index(
        make_table("rhnchannelarch", &["id", "label"]),
        "rhn_carch_label_uq",
        &["label"],
    );
    arch.export = false;

    let mut name = with_main_index(
        make_table("rhnpackagename", &["id", "name"]),
        "rhn_pn_name_uq",
        &["name"],
    );
    name.pk_sequence = Some("RHN_PKG_NAME_SEQ".to_string());

    let mut package = with_reference(
        with_main_index(
            make_table("rhnpackage", &["id", "name_id", "org_id"]),
            VIRTUAL_INDEX_NAME,
            &["name_id", "org_id"],
        ),
        "rhnpackagename",
        &[("name_id", "id")],
    );
    package.pk_sequence = Some("RHN_PACKAGE_ID_SEQ".to_string());

    let channel_package = with_reference(
        with_reference(
            with_main_index(
                Table::new("rhnchannelpackage", &["channel_id", "package_id"]),
                "rhn_cp_cp_uq",
                &["channel_id", "package_id"],
            ),
            "rhnchannel",
            &[("channel_id", "id")],
        ),
        "rhnpackage",
        &[("package_id", "id")],
    );

    let dist_map = with_reference(
        with_main_index(
            make_table("rhndistchannelmap", &["id", "channel_id", "release"]),
            "rhn_dcm_rel_uq",
            &["channel_id", "release"],
        ),
        "rhnchannel",
        &[("channel_id", "id")],
    );

    let comps = with_reference(
        with_main_index(
            make_table("rhnchannelcomps", &["id", "channel_id", "relative_filename"]),
            "rhn_channelcomps_cid_uq",
            &["channel_id"],
        ),
        "rhnchannel",
        &[("channel_id", "id")],
    );

    let mut schema = Schema::from_tables(vec![
        channel,
        arch,
        name,
        package,
        channel_package,
        dist_map,
        comps,
    ]);
    if let Some(channel) = schema.tables.get_mut("rhnchannel") {
        channel
            .referenced_by
            .push(Reference::new("rhnserverchannel", &[("channel_id", "id")]));
    }
    schema.excluded.insert("rhnserverchannel".to_string());

    let source = MemorySource::new()
        .with_rows(
            "rhnchannel",
            &["id", "label", "channel_arch_id"],
            vec![
                vec![int(1), text("base-x86_64"), int(500)],
                vec![int(2), text("other"), int(500)],
            ],
        )
        .with_rows("rhnchannelarch", &["id", "label"], vec![vec![int(500), text("channel-x86_64")]])
        .with_rows(
            "rhnpackagename",
            &["id", "name"],
            vec![vec![int(100), text("vim")], vec![int(101), text("emacs")]],
        )
        .with_rows(
            "rhnpackage",
            &["id", "name_id", "org_id"],
            vec![
                vec![int(10), int(100), SqlValue::Null],
                vec![int(11), int(101), SqlValue::Null],
            ],
        )
        .with_rows(
            "rhnchannelpackage",
            &["channel_id", "package_id"],
            vec![vec![int(1), int(10)], vec![int(2), int(11)]],
        )
        .with_rows(
            "rhndistchannelmap",
            &["id", "channel_id", "release"],
            vec![vec![int(50), int(1), text("15")], vec![int(51), int(2), text("12")]],
        )
        .with_rows(
            "rhnchannelcomps",
            &["id", "channel_id", "relative_filename"],
            vec![vec![int(70), int(2), text("comps.xml")]],
        );

    (schema, source)
}

struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<Row>,
}

/// Row source over in-memory tables that records every statement it runs.
#[derive(Default)]
pub struct MemorySource {
    tables: BTreeMap<String, MemoryTable>,
    log: Mutex<Vec<String>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table with rows given in column order.
    pub fn with_rows(mut self, table: &str, columns: &[&str], rows: Vec<Vec<SqlValue>>) -> Self {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let rows = rows
            .into_iter()
            .map(|values| {
                columns
                    .iter()
                    .cloned()
                    .zip(values)
                    .map(|(c, v)| Field::new(c, v))
                    .collect()
            })
            .collect();
        self.tables
            .insert(table.to_string(), MemoryTable { columns, rows });
        self
    }

    /// Statements run so far.
    pub fn queries(&self) -> Vec<String> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Number of statements run against a table.
    pub fn query_count(&self, table: &str) -> usize {
        let needle = format!(" FROM {} ", table);
        self.queries()
            .iter()
            .filter(|q| format!("{} ", q).contains(&needle))
            .count()
    }

    fn evaluate(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let statement = sql.trim().trim_end_matches(';').trim();
        let lower = statement.to_lowercase();
        if !lower.starts_with("select ") {
            return Err(SyncError::query(sql, "only SELECT is supported"));
        }
        let from = lower
            .find(" from ")
            .ok_or_else(|| SyncError::query(sql, "missing FROM"))?;
        let select_list = statement[7..from].trim();
        let rest = statement[from + 6..].trim();
        let (table_name, clause) = match rest.find(char::is_whitespace) {
            Some(pos) => (&rest[..pos], rest[pos..].trim()),
            None => (rest, ""),
        };
        let table = self
            .tables
            .get(table_name)
            .ok_or_else(|| SyncError::query(sql, format!("relation {} does not exist", table_name)))?;

        let mut clause = clause.to_string();
        let mut limit = None;
        if let Some(pos) = clause.to_lowercase().rfind(" limit ") {
            limit = clause[pos + 7..].trim().parse::<usize>().ok();
            clause.truncate(pos);
        }
        let conditions = if clause.to_lowercase().starts_with("where ") {
            split_top_level(&clause[6..], " and ")
                .iter()
                .map(|c| self.inline_subquery(c, params))
                .collect::<Result<Vec<_>>>()?
        } else if clause.trim().is_empty() {
            Vec::new()
        } else {
            return Err(SyncError::query(sql, "unsupported clause"));
        };

        let columns: Vec<String> = if select_list == "*" {
            table.columns.clone()
        } else {
            select_list
                .split(',')
                .map(|c| c.trim().to_string())
                .collect()
        };

        let mut result = Vec::new();
        for row in &table.rows {
            let mut matched = true;
            for condition in &conditions {
                if !matches_condition(row, condition, params)
                    .map_err(|e| SyncError::query(sql, e))?
                {
                    matched = false;
                    break;
                }
            }
            if matched {
                result.push(columns.iter().map(|c| Field::new(c.clone(), row.value(c))).collect());
            }
            if limit.is_some_and(|l| result.len() >= l) {
                break;
            }
        }
        Ok(result)
    }
}

impl MemorySource {
    /// Replace `col in (SELECT ...)` by the literal list it selects.
    fn inline_subquery(&self, condition: &str, params: &[SqlValue]) -> Result<String> {
        let Some(pos) = condition.to_lowercase().find(" in (select ") else {
            return Ok(condition.to_string());
        };
        let column = condition[..pos].trim();
        let inner = condition[pos + 5..].trim_end().trim_end_matches(')');
        let values: Vec<String> = self
            .evaluate(inner, params)?
            .iter()
            .filter_map(|row| row.iter().next().map(|f| format_literal(&f.value)))
            .collect();
        Ok(format!("{} in ({})", column, values.join(", ")))
    }
}

#[async_trait]
impl RowSource for MemorySource {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        if let Ok(mut log) = self.log.lock() {
            log.push(sql.to_string());
        }
        self.evaluate(sql, params)
    }
}

fn matches_condition(
    row: &Row,
    condition: &str,
    params: &[SqlValue],
) -> std::result::Result<bool, String> {
    let condition = condition.trim();
    let lower = condition.to_lowercase();

    if condition.starts_with('(') {
        let pos = lower
            .find(") in (")
            .ok_or_else(|| format!("unsupported condition {}", condition))?;
        let columns: Vec<&str> = condition[1..pos].split(',').map(str::trim).collect();
        let tuples = condition[pos + 6..condition.len() - 1].trim();
        let actual: Vec<String> = columns.iter().map(|c| format_literal(&row.value(c))).collect();
        return Ok(split_top_level(tuples, ",").iter().any(|tuple| {
            let tuple = tuple.trim().trim_start_matches('(').trim_end_matches(')');
            let expected: Vec<String> = split_top_level(tuple, ",")
                .iter()
                .map(|v| v.trim().to_string())
                .collect();
            expected == actual
        }));
    }

    if let Some(column) = lower.strip_suffix(" is null") {
        return Ok(row.value(column.trim()).is_null());
    }

    if let Some(pos) = lower
        .find(" in (")
        .filter(|pos| !condition[..*pos].trim().contains(' '))
    {
        let actual = row.value(condition[..pos].trim());
        if actual.is_null() {
            return Ok(false);
        }
        let actual = format_literal(&actual);
        let list = condition[pos + 5..].trim_end_matches(')');
        return Ok(split_top_level(list, ",")
            .iter()
            .any(|v| v.trim() == actual));
    }

    for (op, ge) in [(" >= ", true), (" = ", false)] {
        if let Some(pos) = condition.find(op) {
            let column = condition[..pos].trim();
            let operand = condition[pos + op.len()..].trim();
            let actual = row.value(column);
            if actual.is_null() {
                return Ok(false);
            }
            let expected = match operand.strip_prefix('$') {
                Some(index) => {
                    let index = index.trim_end_matches("::timestamp");
                    let n: usize = index
                        .parse()
                        .map_err(|_| format!("bad placeholder {}", operand))?;
                    let value = params
                        .get(n - 1)
                        .ok_or_else(|| format!("missing parameter ${}", n))?;
                    if value.is_null() {
                        return Ok(false);
                    }
                    format_literal(value)
                }
                None => operand.to_string(),
            };
            let actual = format_literal(&actual);
            return Ok(if ge { actual >= expected } else { actual == expected });
        }
    }

    Err(format!("unsupported condition {}", condition))
}

/// Split on `sep` outside quotes and parentheses.
fn split_top_level(s: &str, sep: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    let bytes = s.as_bytes();
    let lower = s.to_lowercase();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => quoted = !quoted,
            b'(' if !quoted => depth += 1,
            b')' if !quoted => depth = depth.saturating_sub(1),
            _ => {}
        }
        if !quoted && depth == 0 && lower[i..].starts_with(sep) {
            parts.push(s[start..i].to_string());
            i += sep.len();
            start = i;
            continue;
        }
        i += 1;
    }
    parts.push(s[start..].to_string());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> MemorySource {
        MemorySource::new().with_rows(
            "rhnchannel",
            &["id", "label", "parent_channel"],
            vec![
                vec![int(1), text("base"), SqlValue::Null],
                vec![int(2), text("child"), int(1)],
            ],
        )
    }

    #[tokio::test]
    async fn test_memory_source_literal_and_param_filters() {
        let source = channels();
        let rows = source
            .query("SELECT * FROM rhnchannel WHERE label = 'base'", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value("id"), int(1));

        let rows = source
            .query(
                "SELECT id, label FROM rhnchannel WHERE parent_channel = $1",
                &[SqlValue::I32(1)],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value("label"), text("child"));
        assert_eq!(rows[0].len(), 2);
    }

    #[tokio::test]
    async fn test_memory_source_tuple_in_and_null() {
        let source = channels();
        let rows = source
            .query(
                "SELECT id FROM rhnchannel WHERE (id, label) in ((1, 'base'), (2, 'nope'));",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        let rows = source
            .query("SELECT id FROM rhnchannel WHERE parent_channel is null", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(source.query_count("rhnchannel"), 2);
    }

    #[tokio::test]
    async fn test_memory_source_in_list_and_subquery() {
        let source = channels().with_rows(
            "suseimagestoretype",
            &["id", "label"],
            vec![vec![int(1), text("os_image")], vec![int(2), text("registry")]],
        );
        let rows = source
            .query("SELECT id FROM rhnchannel WHERE id in (2, 3)", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value("id"), int(2));

        let rows = source
            .query(
                "SELECT id FROM rhnchannel WHERE id in (SELECT id FROM suseimagestoretype WHERE label = 'os_image')",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value("id"), int(1));
    }

    #[tokio::test]
    async fn test_memory_source_unknown_relation_fails() {
        let source = channels();
        assert!(source.query("SELECT * FROM nowhere", &[]).await.is_err());
    }
}
