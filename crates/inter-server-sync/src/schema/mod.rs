//! Schema discovery: introspection queries and per-table corrections.

pub mod filters;
mod reader;

pub use filters::{apply_table_filters, filter_for, TableFilter, TABLE_FILTERS};
pub use reader::SchemaReader;
