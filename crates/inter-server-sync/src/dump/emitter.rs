//! Ordered SQL emission.
//!
//! The emitter walks the schema graph again, this time to order output:
//! forward references are emitted before the rows that need them, rows
//! pointing back at a table after it. Every table is visited at most once
//! per walk.
//!
//! A subject export makes two walks over the same graph. The clean walk
//! deletes the subject's rows of clean tables the export has nothing for;
//! the data walk writes the rows themselves.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Write;

use serde::Serialize;
use tracing::{debug, info};

use crate::core::{Row, Schema, Table};
use crate::dump::crawler::ExportSet;
use crate::dump::fetcher::{fetch_all_rows, fetch_rows};
use crate::dump::navigation::{should_descend_forward_for_ordering, should_follow_back_reference};
use crate::dump::plan::ExportPlan;
use crate::dump::resolver::FkResolver;
use crate::dump::statement::{
    apply_row_filters, clean_delete_statement, clean_insert_statement, drop_unexported,
    guarded_insert_statement, insert_statement, join_chain, substitute_primary_key,
};
use crate::error::Result;
use crate::source::RowSource;

/// WHERE clause for one table in a full export, or None for every row.
pub type RowFilter<'f> = dyn Fn(&Table) -> Option<String> + Sync + 'f;

/// Counters for one emission.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmitStats {
    pub rows_written: usize,
    pub statements: usize,
    pub tables: BTreeSet<String>,
}

impl EmitStats {
    /// Fold another emission's counters into this one.
    pub fn merge(&mut self, other: EmitStats) {
        self.rows_written += other.rows_written;
        self.statements += other.statements;
        self.tables.extend(other.tables);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Clean,
    Data,
}

/// Where a table's rows come from.
#[derive(Clone, Copy)]
enum Supply<'s> {
    /// Identity keys collected by a crawl.
    Keys(&'s ExportSet),
    /// Whole tables, optionally filtered.
    Full(&'s RowFilter<'s>),
}

enum Frame {
    Enter {
        table: String,
        path: Vec<String>,
    },
    Emit {
        table: String,
        path: Vec<String>,
        rows: Option<Vec<Row>>,
    },
    PostSubtree {
        table: String,
    },
}

/// Writes the statements for export sets in dependency order.
pub struct Emitter<'a> {
    source: &'a dyn RowSource,
    schema: &'a Schema,
    plan: &'a ExportPlan,
    resolver: FkResolver<'a>,
    stats: EmitStats,
    hook_rows: HashMap<String, Vec<Row>>,
}

impl<'a> Emitter<'a> {
    pub fn new(source: &'a dyn RowSource, schema: &'a Schema, plan: &'a ExportPlan) -> Self {
        Self {
            source,
            schema,
            plan,
            resolver: FkResolver::new(source, schema),
            stats: EmitStats::default(),
            hook_rows: HashMap::new(),
        }
    }

    pub fn resolver_mut(&mut self) -> &mut FkResolver<'a> {
        &mut self.resolver
    }

    /// Forget per-subject state: memoized lookups and counters.
    pub fn reset(&mut self) {
        self.resolver.clear_cache();
        self.stats = EmitStats::default();
        self.hook_rows.clear();
    }

    /// Emit the rows of `export_set`, walking from `start_table`.
    pub async fn emit(
        &mut self,
        start_table: &str,
        export_set: &ExportSet,
        out: &mut (dyn Write + Send),
    ) -> Result<EmitStats> {
        let supply = Supply::Keys(export_set);

        let mut processed = HashSet::new();
        self.walk(start_table, Pass::Clean, supply, &mut processed, out)
            .await?;

        let mut processed = HashSet::new();
        self.walk(start_table, Pass::Data, supply, &mut processed, out)
            .await?;

        // Rows the ordering walk could not reach from the start table.
        let stragglers: Vec<String> = export_set
            .tables()
            .filter(|(name, keys)| !keys.is_empty() && !processed.contains(*name))
            .map(|(name, _)| name.clone())
            .collect();
        for table in stragglers {
            if processed.contains(&table) {
                continue;
            }
            debug!("Emitting {} outside the walk from {}", table, start_table);
            self.walk(&table, Pass::Data, supply, &mut processed, out)
                .await?;
        }

        if self.plan.export_unreached {
            let everything = |_: &Table| None::<String>;
            self.emit_unreached(&everything, &mut processed, out)
                .await?;
        }

        let stats = std::mem::take(&mut self.stats);
        info!(
            "Emitted {} rows in {} statements from {} tables",
            stats.rows_written,
            stats.statements,
            stats.tables.len()
        );
        Ok(stats)
    }

    /// Emit whole tables, walking from each start table in turn. With
    /// `export_unreached` every exportable table not reached follows.
    pub async fn emit_full(
        &mut self,
        start_tables: &[&str],
        filter: &RowFilter<'_>,
        out: &mut (dyn Write + Send),
    ) -> Result<EmitStats> {
        let mut processed = HashSet::new();
        for start in start_tables {
            self.walk(start, Pass::Data, Supply::Full(filter), &mut processed, out)
                .await?;
        }
        if self.plan.export_unreached {
            self.emit_unreached(filter, &mut processed, out).await?;
        }

        let stats = std::mem::take(&mut self.stats);
        info!(
            "Emitted {} rows in {} statements from {} tables",
            stats.rows_written,
            stats.statements,
            stats.tables.len()
        );
        Ok(stats)
    }

    async fn emit_unreached(
        &mut self,
        filter: &RowFilter<'_>,
        processed: &mut HashSet<String>,
        out: &mut (dyn Write + Send),
    ) -> Result<()> {
        let schema = self.schema;
        for table in schema.tables.values() {
            if !table.export || processed.contains(&table.name) {
                continue;
            }
            self.walk(&table.name, Pass::Data, Supply::Full(filter), processed, out)
                .await?;
        }
        Ok(())
    }

    async fn walk(
        &mut self,
        start_table: &str,
        pass: Pass,
        supply: Supply<'_>,
        processed: &mut HashSet<String>,
        out: &mut (dyn Write + Send),
    ) -> Result<()> {
        let mut stack = vec![Frame::Enter {
            table: start_table.to_string(),
            path: vec![start_table.to_string()],
        }];

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter { table, path } => {
                    let frames = self
                        .enter(&table, path, pass, supply, processed, out)
                        .await?;
                    stack.extend(frames);
                }
                Frame::Emit { table, path, rows } => {
                    if pass == Pass::Data {
                        self.emit_table(&table, &path, rows, supply, out).await?;
                    }
                }
                Frame::PostSubtree { table } => {
                    if pass == Pass::Data {
                        self.run_hook(&table, out).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Visit a table and return the frames for its subtree, in push order.
    async fn enter(
        &mut self,
        name: &str,
        path: Vec<String>,
        pass: Pass,
        supply: Supply<'_>,
        processed: &mut HashSet<String>,
        out: &mut (dyn Write + Send),
    ) -> Result<Vec<Frame>> {
        if !processed.insert(name.to_string()) {
            return Ok(Vec::new());
        }
        let schema = self.schema;
        let Some(table) = schema.get(name) else {
            debug!("Skipping {}: not in the loaded schema", name);
            return Ok(Vec::new());
        };
        if !table.export {
            return Ok(Vec::new());
        }

        let rows = match supply {
            Supply::Keys(export_set) => {
                if !export_set.has_data(name) {
                    if pass == Pass::Clean && self.plan.is_clean_table(name) {
                        let joins = join_chain(schema, &path);
                        let statement =
                            clean_delete_statement(table, &joins, &self.plan.clean_where);
                        self.write(out, &statement)?;
                    }
                    return Ok(Vec::new());
                }
                None
            }
            Supply::Full(filter) => {
                let rows = fetch_all_rows(self.source, table, filter(table).as_deref()).await?;
                if rows.is_empty() {
                    return Ok(Vec::new());
                }
                Some(rows)
            }
        };

        let mut frames = vec![Frame::PostSubtree {
            table: name.to_string(),
        }];

        let backward: Vec<&Table> = table
            .referenced_by
            .iter()
            .filter_map(|r| schema.get(&r.table_name))
            .filter(|c| !processed.contains(&c.name))
            .filter(|c| should_follow_back_reference(&path, table, c))
            .collect();
        for child in backward.iter().rev() {
            frames.push(Frame::Enter {
                table: child.name.clone(),
                path: child_path(&path, &child.name),
            });
        }

        frames.push(Frame::Emit {
            table: name.to_string(),
            path: path.clone(),
            rows,
        });

        let forward: Vec<&Table> = table
            .references
            .iter()
            .filter_map(|r| schema.get(&r.table_name))
            .filter(|t| !processed.contains(&t.name))
            .filter(|t| should_descend_forward_for_ordering(&path, name, &t.name))
            .collect();
        for target in forward.iter().rev() {
            frames.push(Frame::Enter {
                table: target.name.clone(),
                path: child_path(&path, &target.name),
            });
        }

        Ok(frames)
    }

    async fn emit_table(
        &mut self,
        name: &str,
        path: &[String],
        rows: Option<Vec<Row>>,
        supply: Supply<'_>,
        out: &mut (dyn Write + Send),
    ) -> Result<()> {
        let schema = self.schema;
        let Some(table) = schema.get(name) else {
            return Ok(());
        };

        let source_rows = match (rows, supply) {
            (Some(rows), _) => rows,
            (None, Supply::Keys(export_set)) => {
                let mut rows = Vec::new();
                for batch in export_set.keys(name).chunks(self.plan.batch_size) {
                    rows.extend(fetch_rows(self.source, table, batch).await?);
                }
                rows
            }
            (None, Supply::Full(_)) => Vec::new(),
        };
        if source_rows.is_empty() {
            return Ok(());
        }

        let clean = self.plan.is_clean_table(name);
        let parent_gated = self.plan.is_parent_gated(name);
        let mut prepared = Vec::new();
        for row in &source_rows {
            let row = self.prepare_row(table, row).await?;
            if clean {
                prepared.push(row);
                continue;
            }
            let statement = if parent_gated || table.has_virtual_main_index() {
                guarded_insert_statement(table, &row, parent_gated)
            } else {
                insert_statement(table, &row)
            };
            self.write(out, &statement)?;
        }

        if clean {
            let joins = join_chain(schema, path);
            if let Some(statement) =
                clean_insert_statement(table, &prepared, &joins, &self.plan.clean_where)
            {
                self.write(out, &statement)?;
            }
        }

        debug!("Emitted {} rows of {}", source_rows.len(), name);
        self.stats.rows_written += source_rows.len();
        self.stats.tables.insert(name.to_string());
        if self.plan.hook(name).is_some() {
            self.hook_rows
                .entry(name.to_string())
                .or_default()
                .extend(source_rows);
        }
        Ok(())
    }

    /// Turn a source row into the row written for the target.
    async fn prepare_row(&mut self, table: &Table, row: &Row) -> Result<Row> {
        let substituted = substitute_primary_key(table, row);
        let resolved = self.resolver.resolve_row(table, &substituted).await?;
        let filtered = apply_row_filters(table, row, resolved);
        Ok(drop_unexported(table, &filtered))
    }

    async fn run_hook(&mut self, name: &str, out: &mut (dyn Write + Send)) -> Result<()> {
        let plan = self.plan;
        let schema = self.schema;
        let (Some(hook), Some(table)) = (plan.hook(name), schema.get(name)) else {
            return Ok(());
        };
        let rows = self.hook_rows.remove(name).unwrap_or_default();
        if rows.is_empty() {
            return Ok(());
        }

        let statements = hook.after_subtree(table, &rows, &mut self.resolver).await?;
        for statement in &statements {
            self.write(out, statement)?;
        }
        Ok(())
    }

    fn write(&mut self, out: &mut (dyn Write + Send), statement: &str) -> Result<()> {
        writeln!(out, "{}", statement)?;
        self.stats.statements += 1;
        Ok(())
    }
}

fn child_path(path: &[String], child: &str) -> Vec<String> {
    let mut next = path.to_vec();
    next.push(child.to_string());
    next
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::core::SqlValue;
    use crate::dump::crawler::Crawler;
    use crate::dump::plan::PostSubtreeHook;
    use crate::testing::{channel_scenario, int, make_table, text, with_reference, MemorySource};

    const SCOPE: &str = "WHERE rhnchannel.label = 'base-x86_64'";

    fn channel_plan() -> ExportPlan {
        ExportPlan::new()
            .with_clean_tables(&["rhnchannelcomps", "rhnchannelpackage", "rhndistchannelmap"])
            .with_clean_where(SCOPE)
    }

    async fn export_channel(plan: &ExportPlan) -> (String, EmitStats) {
        let (schema, source) = channel_scenario();
        let export_set = Crawler::new(&source, &schema)
            .crawl("rhnchannel", "label = 'base-x86_64'")
            .await
            .unwrap();

        let mut out = Vec::new();
        let mut emitter = Emitter::new(&source, &schema, plan);
        let stats = emitter.emit("rhnchannel", &export_set, &mut out).await.unwrap();
        (String::from_utf8(out).unwrap(), stats)
    }

    fn position(out: &str, needle: &str) -> usize {
        out.find(needle)
            .unwrap_or_else(|| panic!("missing {:?} in\n{}", needle, out))
    }

    #[tokio::test]
    async fn test_channel_export_contains_only_subject_rows() {
        let (out, stats) = export_channel(&channel_plan()).await;

        assert!(out.contains("'vim'"));
        assert!(!out.contains("'emacs'"));
        assert!(!out.contains("'other'"));
        assert!(!out.contains("'12'"));
        // Forced navigation into the distribution map.
        assert!(out.contains("WITH new_records_rhndistchannelmap"));
        // Lookup tables are resolved against, never written.
        assert!(!out.contains("INSERT INTO rhnchannelarch"));
        assert!(!out.contains("rhnserverchannel"));

        assert_eq!(stats.rows_written, 5);
        assert_eq!(
            stats.tables.iter().map(String::as_str).collect::<Vec<_>>(),
            vec![
                "rhnchannel",
                "rhnchannelpackage",
                "rhndistchannelmap",
                "rhnpackage",
                "rhnpackagename"
            ]
        );
    }

    #[tokio::test]
    async fn test_parents_are_emitted_before_children() {
        let (out, _) = export_channel(&channel_plan()).await;

        let delete = position(&out, "DELETE FROM rhnchannelcomps");
        let channel = position(&out, "INSERT INTO rhnchannel ");
        let name = position(&out, "INSERT INTO rhnpackagename ");
        let package = position(&out, "INSERT INTO rhnpackage ");
        let channel_package = position(&out, "WITH new_records_rhnchannelpackage");
        assert!(delete < channel);
        assert!(channel < channel_package);
        assert!(name < package);
        assert!(package < channel_package);
    }

    #[tokio::test]
    async fn test_foreign_keys_resolve_to_natural_keys() {
        let (out, _) = export_channel(&channel_plan()).await;

        assert!(out.contains(
            "INSERT INTO rhnchannel (id, label, channel_arch_id) VALUES \
             ((SELECT nextval('rhn_channel_id_seq')),'base-x86_64',\
             (SELECT id FROM rhnchannelarch WHERE label = 'channel-x86_64' limit 1)) \
             ON CONFLICT (label) DO UPDATE SET label = excluded.label, \
             channel_arch_id = excluded.channel_arch_id;"
        ));
        assert!(out.contains(
            "((SELECT id FROM rhnchannel WHERE label = 'base-x86_64' limit 1),\
             (SELECT id FROM rhnpackage WHERE name_id = (SELECT id FROM rhnpackagename \
             WHERE name = 'vim' limit 1) and org_id is null limit 1))"
        ));
    }

    #[tokio::test]
    async fn test_virtual_index_uses_guarded_insert() {
        let (out, _) = export_channel(&channel_plan()).await;

        assert!(out.contains(
            "INSERT INTO rhnpackage (id, name_id, org_id) SELECT \
             (SELECT nextval('RHN_PACKAGE_ID_SEQ')),\
             (SELECT id FROM rhnpackagename WHERE name = 'vim' limit 1),null \
             WHERE NOT EXISTS (SELECT 1 FROM rhnpackage WHERE name_id = \
             (SELECT id FROM rhnpackagename WHERE name = 'vim' limit 1) AND org_id IS NULL);"
        ));
    }

    #[tokio::test]
    async fn test_clean_table_without_rows_is_deleted() {
        let (out, _) = export_channel(&channel_plan()).await;

        assert!(out.contains(
            "DELETE FROM rhnchannelcomps WHERE (channel_id) IN (SELECT rhnchannelcomps.channel_id \
             FROM rhnchannelcomps INNER JOIN rhnchannel on rhnchannel.id = rhnchannelcomps.channel_id \
             WHERE rhnchannel.label = 'base-x86_64');"
        ));
        // Tables outside the clean list are never deleted from.
        assert_eq!(out.matches("DELETE FROM").count(), 3);
    }

    #[tokio::test]
    async fn test_clean_table_with_rows_uses_single_cte() {
        let (out, _) = export_channel(&channel_plan().with_batch_size(1)).await;

        assert_eq!(out.matches("WITH new_records_rhnchannelpackage").count(), 1);
        assert!(out.contains(
            "RETURNING channel_id, package_id) DELETE FROM rhnchannelpackage \
             WHERE (channel_id, package_id) IN (SELECT rhnchannelpackage.channel_id, \
             rhnchannelpackage.package_id FROM rhnchannelpackage INNER JOIN rhnchannel \
             on rhnchannel.id = rhnchannelpackage.channel_id WHERE rhnchannel.label = 'base-x86_64' \
             EXCEPT ALL SELECT * FROM new_records_rhnchannelpackage);"
        ));
    }

    #[tokio::test]
    async fn test_non_clean_plan_writes_plain_upserts() {
        let (out, _) = export_channel(&ExportPlan::new()).await;

        assert!(!out.contains("DELETE FROM"));
        assert!(out.contains("INSERT INTO rhnchannelpackage (channel_id, package_id) VALUES"));
        assert!(out.contains("ON CONFLICT (channel_id, package_id) DO UPDATE SET channel_id = excluded.channel_id"));
    }

    #[tokio::test]
    async fn test_parent_gated_rows_require_parents() {
        let (out, _) = export_channel(&ExportPlan::new().with_parent_gated(&["rhnchannelpackage"])).await;

        assert!(out.contains(
            "AND EXISTS (SELECT id FROM rhnchannel WHERE label = 'base-x86_64' limit 1) \
             AND EXISTS (SELECT id FROM rhnpackage WHERE"
        ));
    }

    struct LabelHook;

    #[async_trait]
    impl PostSubtreeHook for LabelHook {
        async fn after_subtree(
            &self,
            table: &Table,
            rows: &[Row],
            resolver: &mut FkResolver<'_>,
        ) -> Result<Vec<String>> {
            let mut statements = Vec::new();
            for row in rows {
                let predicate = resolver
                    .natural_key_predicate(table, row)
                    .await?
                    .unwrap_or_default();
                statements.push(format!("-- after {} WHERE {}", table.name, predicate));
            }
            Ok(statements)
        }
    }

    #[tokio::test]
    async fn test_hook_runs_after_subtree() {
        let plan = channel_plan().with_hook("rhnchannel", Arc::new(LabelHook));
        let (out, stats) = export_channel(&plan).await;

        let hook = position(&out, "-- after rhnchannel WHERE label = 'base-x86_64'");
        assert!(position(&out, "WITH new_records_rhndistchannelmap") < hook);
        assert!(position(&out, "WITH new_records_rhnchannelpackage") < hook);
        assert_eq!(out.lines().count(), stats.statements);
    }

    fn cyclic() -> (Schema, MemorySource) {
        let schema = Schema::from_tables(vec![
            with_reference(make_table("v1", &["id", "v2_id"]), "v2", &[("v2_id", "id")]),
            with_reference(make_table("v2", &["id", "v3_id"]), "v3", &[("v3_id", "id")]),
            with_reference(make_table("v3", &["id", "v1_id"]), "v1", &[("v1_id", "id")]),
        ]);
        let source = MemorySource::new()
            .with_rows("v1", &["id", "v2_id"], vec![vec![int(1), int(2)]])
            .with_rows("v2", &["id", "v3_id"], vec![vec![int(2), int(3)]])
            .with_rows("v3", &["id", "v1_id"], vec![vec![int(3), int(1)]]);
        (schema, source)
    }

    #[tokio::test]
    async fn test_cycle_emits_each_table_once() {
        let (schema, source) = cyclic();
        let export_set = Crawler::new(&source, &schema)
            .crawl("v1", "id = 1")
            .await
            .unwrap();
        let plan = ExportPlan::new();
        let mut out = Vec::new();
        let mut emitter = Emitter::new(&source, &schema, &plan);
        let stats = emitter.emit("v1", &export_set, &mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();

        for table in ["v1", "v2", "v3"] {
            assert_eq!(out.matches(&format!("INSERT INTO {} ", table)).count(), 1);
        }
        assert_eq!(stats.rows_written, 3);
        // No natural key: conflicts are ignored.
        assert!(out.contains("ON CONFLICT DO NOTHING;"));
    }

    #[tokio::test]
    async fn test_full_emission_filters_and_reaches_every_table() {
        let mut upgrade = with_reference(
            crate::core::Table::new("suseupgradepath", &["from_pdid", "to_pdid"]),
            "suseproducts",
            &[("from_pdid", "id")],
        );
        upgrade.pk_columns = vec!["from_pdid".into(), "to_pdid".into()];
        let schema = Schema::from_tables(vec![
            make_table("suseproducts", &["id", "name", "org_id"]),
            upgrade,
        ]);
        let source = MemorySource::new()
            .with_rows(
                "suseproducts",
                &["id", "name", "org_id"],
                vec![
                    vec![int(1), text("sles"), SqlValue::Null],
                    vec![int(2), text("private"), int(3)],
                ],
            )
            .with_rows("suseupgradepath", &["from_pdid", "to_pdid"], vec![vec![int(1), int(1)]]);

        let plan = ExportPlan::new().with_export_unreached(true);
        let filter = |table: &Table| {
            table
                .has_column("org_id")
                .then(|| "org_id is null".to_string())
        };
        let mut out = Vec::new();
        let mut emitter = Emitter::new(&source, &schema, &plan);
        let stats = emitter
            .emit_full(&["suseproducts"], &filter, &mut out)
            .await
            .unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.contains("'sles'"));
        assert!(!out.contains("'private'"));
        assert!(out.contains("INSERT INTO suseupgradepath"));
        assert_eq!(stats.rows_written, 2);
    }

    #[tokio::test]
    async fn test_reset_clears_cache() {
        let (schema, source) = channel_scenario();
        let export_set = Crawler::new(&source, &schema)
            .crawl("rhnchannel", "label = 'base-x86_64'")
            .await
            .unwrap();
        let plan = channel_plan();
        let mut emitter = Emitter::new(&source, &schema, &plan);
        emitter
            .emit("rhnchannel", &export_set, &mut std::io::sink())
            .await
            .unwrap();
        assert!(!emitter.resolver_mut().cache().is_empty());

        emitter.reset();
        assert!(emitter.resolver_mut().cache().is_empty());
    }
}
