//! Source database access.
//!
//! Every component that reads rows (crawler, fetcher, resolver, emitter) goes
//! through [`RowSource`], so the graph logic can run against PostgreSQL or an
//! in-memory double.

mod postgres;
mod tls;

pub use postgres::PgRowSource;
pub use tls::connector;

use crate::core::{Row, SqlValue};
use crate::error::Result;
use async_trait::async_trait;

/// Read access to the source database.
///
/// Statements use `$n` placeholders bound to `params` in order. A failed
/// statement is returned as an error and is fatal for the caller.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Run a query and return every row, fields in selected column order.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;
}

#[async_trait]
impl<T: RowSource + ?Sized> RowSource for &T {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        (**self).query(sql, params).await
    }
}
