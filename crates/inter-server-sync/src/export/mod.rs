//! Export orchestration: subjects, schema sets and the bundle.
//!
//! An export run writes one bundle holding, in order:
//!
//! 1. the product catalog in full, whenever a software channel is exported;
//! 2. every software channel, each followed by its cache refresh statements;
//! 3. every configuration channel;
//! 4. OS image metadata, then container metadata, when requested.

mod hooks;
mod images;
mod packages;
mod tables;

pub use hooks::ConfigFileRevisionHook;
pub use images::*;
pub use packages::{copy_package_files, PACKAGE_FILE_BATCH};
pub use tables::*;

use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bundle::BundleWriter;
use crate::config::{parse_since, Config};
use crate::core::{format_literal, Schema, SqlValue, UnknownTablePolicy};
use crate::dump::{Crawler, EmitStats, Emitter, ExportPlan, ExportSet};
use crate::error::{Result, SyncError};
use crate::schema::SchemaReader;
use crate::server::ServerIdentity;
use crate::source::{PgRowSource, RowSource};

/// Named table sets, as used by the `schema` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSet {
    Channels,
    Products,
    Configs,
    Images,
}

impl TableSet {
    pub fn tables(&self) -> &'static [&'static str] {
        match self {
            TableSet::Channels => SOFTWARE_CHANNEL_TABLES,
            TableSet::Products => PRODUCT_TABLES,
            TableSet::Configs => CONFIG_TABLES,
            TableSet::Images => IMAGE_TABLES,
        }
    }
}

impl FromStr for TableSet {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "channels" => Ok(TableSet::Channels),
            "products" => Ok(TableSet::Products),
            "configs" => Ok(TableSet::Configs),
            "images" => Ok(TableSet::Images),
            other => Err(SyncError::Config(format!(
                "unknown table set '{}': expected channels, products, configs or images",
                other
            ))),
        }
    }
}

/// Crawl settings shared by every subject of a run.
#[derive(Debug, Clone, Copy)]
pub struct SubjectSettings {
    pub batch_size: usize,
    pub since: Option<NaiveDateTime>,
    pub unknown_tables: UnknownTablePolicy,
}

impl Default for SubjectSettings {
    fn default() -> Self {
        Self {
            batch_size: crate::dump::DEFAULT_BATCH_SIZE,
            since: None,
            unknown_tables: UnknownTablePolicy::default(),
        }
    }
}

/// Result of an export run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the export started.
    pub started_at: DateTime<Utc>,

    /// When the export completed.
    pub completed_at: DateTime<Utc>,

    /// Bundle directory.
    pub output_dir: PathBuf,

    /// Software channels exported, in order.
    pub channels: Vec<String>,

    /// Configuration channels exported, in order.
    pub config_channels: Vec<String>,

    /// Image profiles exported, OS images and containers together.
    pub image_profiles: usize,

    /// Images exported, OS images and containers together.
    pub images: usize,

    /// Rows written to the script.
    pub rows_written: usize,

    /// Statements written to the script.
    pub statements: usize,

    /// Tables with at least one row written.
    pub tables: BTreeSet<String>,

    /// Package files copied into the bundle.
    pub package_files: usize,

    /// SHA-256 of the script file.
    pub digest: String,
}

impl ExportResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Runs an export described by a configuration.
pub struct Exporter {
    config: Config,
}

impl Exporter {
    pub fn new(config: Config) -> Result<Self> {
        config.validate_export()?;
        Ok(Self { config })
    }

    /// Connect to the configured database and export.
    pub async fn run(&self) -> Result<ExportResult> {
        let identity = ServerIdentity::load(&self.config.server)?;
        let source = PgRowSource::connect(&self.config.source).await?;
        self.run_with(&source, &identity).await
    }

    /// Export from `source`, recording `identity` in the bundle.
    pub async fn run_with(
        &self,
        source: &dyn RowSource,
        identity: &ServerIdentity,
    ) -> Result<ExportResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Starting export run: {}", run_id);

        let export = &self.config.export;
        let output_dir = export
            .output_dir
            .clone()
            .ok_or_else(|| SyncError::Config("export.output_dir is required".into()))?;
        let settings = SubjectSettings {
            batch_size: export.batch_size,
            since: export
                .packages_only_after
                .as_deref()
                .map(parse_since)
                .transpose()?,
            unknown_tables: export.unknown_tables,
        };

        let mut bundle = BundleWriter::create(&output_dir, export.compress)?;
        bundle.write_version(identity)?;

        let reader = SchemaReader::new(source);
        let mut stats = EmitStats::default();
        let mut package_files = 0;

        let channels =
            resolve_channel_labels(source, &export.channels, &export.channel_with_children).await?;
        if !channels.is_empty() {
            info!("{} channels to process", channels.len());
            let products = reader.load_tables(PRODUCT_TABLES).await?;
            stats.merge(export_products(source, &products, settings.batch_size, bundle.script()).await?);
            debug!("Products export done");

            let schema = reader.load_tables(SOFTWARE_CHANNEL_TABLES).await?;
            for (i, label) in channels.iter().enumerate() {
                info!("Processing channel [{}/{}] {}", i + 1, channels.len(), label);
                let (channel_stats, export_set) =
                    export_channel(source, &schema, label, &settings, bundle.script()).await?;
                stats.merge(channel_stats);
                bundle.add_exported_channel(label);

                if !export.metadata_only {
                    package_files += copy_package_files(
                        source,
                        &schema,
                        &export_set,
                        &self.config.server.data_dir,
                        bundle.dir(),
                    )
                    .await?;
                }
            }
        }

        let config_channels = dedup_labels(&export.config_channels);
        if !config_channels.is_empty() {
            info!("{} configuration channels to process", config_channels.len());
            let schema = reader.load_tables(CONFIG_TABLES).await?;
            for (i, label) in config_channels.iter().enumerate() {
                info!(
                    "Processing configuration channel [{}/{}] {}",
                    i + 1,
                    config_channels.len(),
                    label
                );
                stats.merge(
                    export_config_channel(source, &schema, label, &settings, bundle.script())
                        .await?,
                );
                bundle.add_exported_config(label);
            }
        }

        let mut image_profiles = 0;
        let mut images = 0;
        for kind in export.image_kinds() {
            info!("Processing {} metadata", kind);
            let schema = reader.load_tables(kind.tables().as_slice()).await?;
            let exported = export_images(
                source,
                &schema,
                kind,
                &export.org_limit,
                &settings,
                bundle.script(),
            )
            .await?;
            stats.merge(exported.stats);
            image_profiles += exported.profiles;
            images += exported.images;
        }

        let manifest = bundle.finish()?;
        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        info!(
            "Export complete: {} rows in {} statements, {} package files, {:.1}s",
            stats.rows_written, stats.statements, package_files, duration
        );

        Ok(ExportResult {
            run_id,
            duration_seconds: duration,
            started_at,
            completed_at,
            output_dir,
            channels,
            config_channels,
            image_profiles,
            images,
            rows_written: stats.rows_written,
            statements: stats.statements,
            tables: stats.tables,
            package_files,
            digest: manifest.digest,
        })
    }
}

/// Load the metadata of a named table set.
pub async fn load_table_set(source: &dyn RowSource, set: TableSet) -> Result<Schema> {
    SchemaReader::new(source).load_tables(set.tables()).await
}

/// Channel labels to export: explicit labels, then each parent followed
/// by its children. Duplicates keep their first position.
pub async fn resolve_channel_labels(
    source: &dyn RowSource,
    labels: &[String],
    with_children: &[String],
) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::new();
    let mut add = |label: String, resolved: &mut Vec<String>| {
        if seen.insert(label.clone()) {
            resolved.push(label);
        }
    };

    for label in labels {
        add(label.clone(), &mut resolved);
    }
    for parent in with_children {
        add(parent.clone(), &mut resolved);
        for child in child_channels(source, parent).await? {
            add(child, &mut resolved);
        }
    }
    Ok(resolved)
}

async fn child_channels(source: &dyn RowSource, parent: &str) -> Result<Vec<String>> {
    let rows = source
        .query(
            "SELECT id FROM rhnchannel WHERE label = $1",
            &[SqlValue::Text(parent.to_string())],
        )
        .await?;
    let Some(parent_id) = rows.first().map(|r| r.value("id")) else {
        warn!("Channel {} not found, no children to add", parent);
        return Ok(Vec::new());
    };

    let rows = source
        .query(
            "SELECT label FROM rhnchannel WHERE parent_channel = $1",
            &[parent_id],
        )
        .await?;
    Ok(rows
        .iter()
        .filter_map(|r| match r.value("label") {
            SqlValue::Text(label) => Some(label),
            _ => None,
        })
        .collect())
}

fn dedup_labels(labels: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    labels
        .iter()
        .filter(|l| seen.insert(l.as_str()))
        .cloned()
        .collect()
}

/// Write the product catalog in full.
pub async fn export_products(
    source: &dyn RowSource,
    schema: &Schema,
    batch_size: usize,
    out: &mut (dyn Write + Send),
) -> Result<EmitStats> {
    if !schema.contains("suseproducts") {
        info!("No product tables found, skipping product export");
        return Ok(EmitStats::default());
    }
    let plan = product_plan(batch_size);
    Emitter::new(source, schema, &plan)
        .emit_full(&["suseproducts"], &product_filter, out)
        .await
}

async fn crawl_filtered(
    source: &dyn RowSource,
    schema: &Schema,
    start_table: &str,
    filter: &str,
    settings: &SubjectSettings,
) -> Result<ExportSet> {
    Crawler::new(source, schema)
        .with_since(settings.since)
        .with_unknown_tables(settings.unknown_tables)
        .crawl(start_table, filter)
        .await
}

async fn crawl_subject(
    source: &dyn RowSource,
    schema: &Schema,
    start_table: &str,
    label: &str,
    settings: &SubjectSettings,
) -> Result<ExportSet> {
    crawl_filtered(source, schema, start_table, &label_filter(label), settings).await
}

/// Write one software channel and its cache refresh statements.
///
/// Returns the crawled export set so the caller can copy package files.
pub async fn export_channel(
    source: &dyn RowSource,
    schema: &Schema,
    label: &str,
    settings: &SubjectSettings,
    out: &mut (dyn Write + Send),
) -> Result<(EmitStats, ExportSet)> {
    let export_set = crawl_subject(source, schema, "rhnchannel", label, settings).await?;
    if !export_set.has_data("rhnchannel") {
        warn!("Channel {} not found, nothing exported", label);
        return Ok((EmitStats::default(), export_set));
    }

    let plan = channel_plan(label, settings.batch_size);
    let mut stats = Emitter::new(source, schema, &plan)
        .emit("rhnchannel", &export_set, out)
        .await?;

    for statement in cache_refresh_statements(label) {
        writeln!(out, "{}", statement)?;
        stats.statements += 1;
    }
    Ok((stats, export_set))
}

/// Write one configuration channel.
pub async fn export_config_channel(
    source: &dyn RowSource,
    schema: &Schema,
    label: &str,
    settings: &SubjectSettings,
    out: &mut (dyn Write + Send),
) -> Result<EmitStats> {
    let export_set = crawl_subject(source, schema, "rhnconfigchannel", label, settings).await?;
    if !export_set.has_data("rhnconfigchannel") {
        warn!("Configuration channel {} not found, nothing exported", label);
        return Ok(EmitStats::default());
    }

    let plan = config_plan(label, settings.batch_size)
        .with_hook("rhnconfigfile", Arc::new(ConfigFileRevisionHook));
    Emitter::new(source, schema, &plan)
        .emit("rhnconfigchannel", &export_set, out)
        .await
}

/// What one image kind contributed to the script.
#[derive(Debug, Clone, Default)]
pub struct ImageExport {
    pub stats: EmitStats,
    pub profiles: usize,
    pub images: usize,
}

/// Write the stores, profiles, images and pillars of one image kind.
///
/// Stores are exported whole, restricted to the kind's store type. Each
/// profile and each image is crawled on its own; an image's channel links
/// replace those of the same image on the target.
pub async fn export_images(
    source: &dyn RowSource,
    schema: &Schema,
    kind: ImageKind,
    org_limit: &[i64],
    settings: &SubjectSettings,
    out: &mut (dyn Write + Send),
) -> Result<ImageExport> {
    let mut exported = ImageExport::default();
    if !schema.contains("suseimagestore") {
        info!("No image tables found, skipping {} export", kind);
        return Ok(exported);
    }

    let store_plan = ExportPlan::new().with_batch_size(settings.batch_size);
    exported.stats.merge(
        Emitter::new(source, schema, &store_plan)
            .emit_full(&["suseimagestore"], &store_filter(kind, org_limit), out)
            .await?,
    );

    if schema.contains("suseimageprofile") {
        let profile_table = kind.profile_table();
        let rows = source
            .query(&profile_query(kind, org_limit, settings.since), &[])
            .await?;
        for row in rows {
            let filter = format!("profile_id = {}", format_literal(&row.value("profile_id")));
            let export_set = crawl_filtered(source, schema, profile_table, &filter, settings).await?;
            if !export_set.has_data(profile_table) {
                debug!("Profile {} has no {} row, skipped", filter, profile_table);
                continue;
            }
            exported.stats.merge(
                Emitter::new(source, schema, &store_plan)
                    .emit(profile_table, &export_set, out)
                    .await?,
            );
            exported.profiles += 1;
        }
    }
    if exported.profiles == 0 {
        info!("No {} profiles found to export", kind);
    }

    if let Some(info_table) = schema.get("suseimageinfo") {
        let rows = source
            .query(&image_query(kind, org_limit, settings.since), &[])
            .await?;
        for row in rows {
            let filter = format!("id = {}", format_literal(&row.value("id")));
            let export_set =
                crawl_filtered(source, schema, "suseimageinfo", &filter, settings).await?;
            let plan = image_plan(subject_scope(info_table, &row), settings.batch_size);
            exported.stats.merge(
                Emitter::new(source, schema, &plan)
                    .emit("suseimageinfo", &export_set, out)
                    .await?,
            );
            exported.images += 1;
        }
    }

    if kind == ImageKind::OsImage && schema.contains("susesaltpillar") {
        let filter = pillar_filter(org_limit, settings.since);
        let export_set = crawl_filtered(source, schema, "susesaltpillar", &filter, settings).await?;
        if export_set.has_data("susesaltpillar") {
            exported.stats.merge(
                Emitter::new(source, schema, &store_plan)
                    .emit("susesaltpillar", &export_set, out)
                    .await?,
            );
        }
    }

    info!(
        "{} export done: {} profiles, {} images",
        kind, exported.profiles, exported.images
    );
    Ok(exported)
}
