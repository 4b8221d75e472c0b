//! Core data model shared by every component.
//!
//! - [`schema`]: table metadata and the foreign-key graph
//! - [`value`]: typed row values and their SQL literal form

pub mod schema;
pub mod value;

pub use schema::{
    Reference, Schema, Table, TableLookup, UniqueIndex, UnknownTablePolicy, VIRTUAL_INDEX_NAME,
};
pub use value::{format_literal, quote_literal, Field, Row, SqlValue};
