//! Per-run emission settings.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{Row, Table};
use crate::dump::fetcher::DEFAULT_BATCH_SIZE;
use crate::dump::resolver::FkResolver;
use crate::error::Result;

/// Statements written once a table's whole subtree has been emitted.
///
/// Used for pointers that can only be set after the rows they point to
/// exist on the target.
#[async_trait]
pub trait PostSubtreeHook: Send + Sync {
    /// Build the statements for the source `rows` emitted for `table`.
    async fn after_subtree(
        &self,
        table: &Table,
        rows: &[Row],
        resolver: &mut FkResolver<'_>,
    ) -> Result<Vec<String>>;
}

/// How one subject is written.
#[derive(Clone)]
pub struct ExportPlan {
    /// Tables whose subject rows are deleted and re-inserted.
    pub tables_to_clean: BTreeSet<String>,

    /// `WHERE` clause scoping clean statements to the subject.
    pub clean_where: String,

    /// Tables whose rows are only inserted when their parents exist.
    pub parent_gated: BTreeSet<String>,

    /// Post-subtree hooks by table name.
    pub hooks: BTreeMap<String, Arc<dyn PostSubtreeHook>>,

    /// Keys fetched per query.
    pub batch_size: usize,

    /// Export exportable tables the walk never reached, in full.
    pub export_unreached: bool,
}

impl Default for ExportPlan {
    fn default() -> Self {
        Self {
            tables_to_clean: BTreeSet::new(),
            clean_where: String::new(),
            parent_gated: BTreeSet::new(),
            hooks: BTreeMap::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            export_unreached: false,
        }
    }
}

impl fmt::Debug for ExportPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportPlan")
            .field("tables_to_clean", &self.tables_to_clean)
            .field("clean_where", &self.clean_where)
            .field("parent_gated", &self.parent_gated)
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .field("batch_size", &self.batch_size)
            .field("export_unreached", &self.export_unreached)
            .finish()
    }
}

impl ExportPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clean_tables(mut self, tables: &[&str]) -> Self {
        self.tables_to_clean
            .extend(tables.iter().map(|t| t.to_string()));
        self
    }

    pub fn with_clean_where(mut self, clean_where: impl Into<String>) -> Self {
        self.clean_where = clean_where.into();
        self
    }

    pub fn with_parent_gated(mut self, tables: &[&str]) -> Self {
        self.parent_gated.extend(tables.iter().map(|t| t.to_string()));
        self
    }

    pub fn with_hook(mut self, table: &str, hook: Arc<dyn PostSubtreeHook>) -> Self {
        self.hooks.insert(table.to_string(), hook);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_export_unreached(mut self, export_unreached: bool) -> Self {
        self.export_unreached = export_unreached;
        self
    }

    pub fn is_clean_table(&self, table: &str) -> bool {
        self.tables_to_clean.contains(table)
    }

    pub fn is_parent_gated(&self, table: &str) -> bool {
        self.parent_gated.contains(table)
    }

    pub fn hook(&self, table: &str) -> Option<&Arc<dyn PostSubtreeHook>> {
        self.hooks.get(table)
    }
}
