//! # inter-server-sync
//!
//! Selective export and import of server entities between PostgreSQL
//! databases that share a schema but assign their own surrogate keys.
//!
//! An export starts from a subject row (a software or configuration channel,
//! or an OS or container image), crawls the foreign-key graph to find every
//! row the subject depends on, and writes a bundle holding a single SQL
//! script. Every foreign key in the script is expressed as a subquery over
//! the referenced row's natural key, so the script can be applied to a
//! server whose ids differ.
//!
//! - **Schema discovery** of columns, primary keys, unique indexes and references
//! - **Graph crawl** collecting the export set reachable from a subject
//! - **Ordered emission** of upserts, parents before children
//! - **Bundles** with a version stamp and a SHA-256 digest of the script
//! - **Import** with version checks, file mirroring and a streamed one-transaction apply
//!
//! ## Example
//!
//! ```rust,no_run
//! use inter_server_sync::{Config, Exporter};
//!
//! #[tokio::main]
//! async fn main() -> inter_server_sync::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let result = Exporter::new(config)?.run().await?;
//!     println!("Wrote {} rows", result.rows_written);
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod config;
pub mod core;
pub mod dump;
pub mod error;
pub mod export;
pub mod import;
pub mod schema;
pub mod server;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use bundle::{Bundle, BundleWriter};
pub use config::{Config, DatabaseConfig, ExportConfig, ImportConfig, ServerConfig};
pub use core::{Row, Schema, SqlValue, Table};
pub use dump::{Crawler, EmitStats, Emitter, ExportPlan, ExportSet};
pub use error::{Result, SyncError};
pub use export::{ExportResult, Exporter, TableSet};
pub use import::{ImportResult, Importer};
pub use schema::SchemaReader;
pub use server::ServerIdentity;
pub use source::{PgRowSource, RowSource};
