//! PostgreSQL row source backed by a deadpool connection pool.

use crate::config::DatabaseConfig;
use crate::core::{Field, Row, SqlValue};
use crate::error::{Result, SyncError};
use crate::source::{connector, RowSource};
use async_trait::async_trait;
use bytes::BytesMut;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio::sync::mpsc;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

/// Connection pool to the server database.
///
/// Used as the row source for exports and as the statement sink for imports.
pub struct PgRowSource {
    pool: Pool,
}

impl PgRowSource {
    /// Create a pool from the database configuration and test one connection.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("inter-server-sync");

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let pool = match connector(config.ssl_mode) {
            None => {
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(config.max_connections)
                    .build()
                    .map_err(|e| SyncError::pool(e, "creating PostgreSQL pool"))?
            }
            Some(tls_connector) => {
                let mgr = Manager::from_config(pg_config, tls_connector, mgr_config);
                Pool::builder(mgr)
                    .max_size(config.max_connections)
                    .build()
                    .map_err(|e| SyncError::pool(e, "creating PostgreSQL pool"))?
            }
        };

        let source = Self { pool };
        source.test_connection().await?;

        info!(
            "Connected to PostgreSQL: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(source)
    }

    /// Check that a connection can be acquired and used.
    pub async fn test_connection(&self) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| SyncError::pool(e, "testing PostgreSQL connection"))?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    /// Run a script delivered in pieces, in order, over one connection.
    ///
    /// The script carries its own transaction control. When a piece fails
    /// the open transaction is rolled back before the error is returned.
    /// Returns the number of pieces applied.
    pub async fn execute_script(&self, mut pieces: mpsc::Receiver<Result<String>>) -> Result<usize> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| SyncError::pool(e, "acquiring connection for script"))?;

        let mut applied = 0;
        while let Some(piece) = pieces.recv().await {
            let outcome = match piece {
                Ok(sql) => client.batch_execute(&sql).await.map_err(SyncError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                if let Err(rollback) = client.batch_execute("ROLLBACK").await {
                    warn!("Rollback after failed script piece {} failed: {}", applied + 1, rollback);
                }
                return Err(e);
            }
            applied += 1;
            debug!("Applied script piece {}", applied);
        }
        Ok(applied)
    }
}

#[async_trait]
impl RowSource for PgRowSource {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| SyncError::pool(e, "acquiring connection for query"))?;

        let mut statement = client
            .prepare_cached(sql)
            .await
            .map_err(|e| SyncError::query(sql, e))?;

        // Types without a native mapping are read back through their text form.
        if statement
            .columns()
            .iter()
            .any(|c| !is_supported_type(c.type_()))
        {
            let wrapped = wrap_text_casts(sql, statement.columns());
            debug!("Re-selecting unsupported column types as text: {}", wrapped);
            statement = client
                .prepare_cached(&wrapped)
                .await
                .map_err(|e| SyncError::query(&wrapped, e))?;
        }

        let bound: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = client
            .query(&statement, &bound)
            .await
            .map_err(|e| SyncError::query(sql, e))?;

        let columns = statement.columns();
        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut fields = Vec::with_capacity(columns.len());
            for (idx, column) in columns.iter().enumerate() {
                let value = convert_pg_row_value(row, idx, column.type_())
                    .map_err(|e| SyncError::query(sql, e))?;
                fields.push(Field::new(column.name(), value));
            }
            result.push(Row::new(fields));
        }
        Ok(result)
    }
}

fn is_supported_type(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::BOOL
            | Type::INT2
            | Type::INT4
            | Type::INT8
            | Type::OID
            | Type::FLOAT4
            | Type::FLOAT8
            | Type::NUMERIC
            | Type::TEXT
            | Type::VARCHAR
            | Type::BPCHAR
            | Type::NAME
            | Type::BYTEA
            | Type::UUID
            | Type::JSON
            | Type::JSONB
            | Type::DATE
            | Type::TIME
            | Type::TIMESTAMP
            | Type::TIMESTAMPTZ
    )
}

fn wrap_text_casts(sql: &str, columns: &[tokio_postgres::Column]) -> String {
    let select = columns
        .iter()
        .map(|c| {
            if is_supported_type(c.type_()) {
                format!("q.\"{}\"", c.name())
            } else {
                format!("q.\"{0}\"::text AS \"{0}\"", c.name())
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    let inner = sql.trim().trim_end_matches(';');
    format!("SELECT {} FROM ({}) q", select, inner)
}

fn convert_pg_row_value(
    row: &tokio_postgres::Row,
    idx: usize,
    ty: &Type,
) -> std::result::Result<SqlValue, tokio_postgres::Error> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(SqlValue::I16),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(SqlValue::I32),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::I64),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|v| SqlValue::I64(i64::from(v))),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(SqlValue::F32),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::F64),
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(idx)?
            .map(SqlValue::Decimal),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SqlValue::Bytes),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(SqlValue::Uuid),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(SqlValue::Json),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(SqlValue::Date),
        Type::TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)?
            .map(SqlValue::Time),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(SqlValue::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::FixedOffset>>>(idx)?
            .map(SqlValue::TimestampTz),
        _ => row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

/// Integers are bound at the width the server inferred for the placeholder.
fn int_to_sql(
    v: i64,
    ty: &Type,
    out: &mut BytesMut,
) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
    match *ty {
        Type::INT2 => i16::try_from(v)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(v)?.to_sql(ty, out),
        Type::OID => u32::try_from(v)?.to_sql(ty, out),
        Type::NUMERIC => Decimal::from(v).to_sql(ty, out),
        Type::FLOAT8 => (v as f64).to_sql(ty, out),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR => v.to_string().to_sql(ty, out),
        _ => v.to_sql(ty, out),
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::I16(v) => int_to_sql(i64::from(*v), ty, out),
            SqlValue::I32(v) => int_to_sql(i64::from(*v), ty, out),
            SqlValue::I64(v) => int_to_sql(*v, ty, out),
            SqlValue::F32(v) if *ty == Type::FLOAT8 => f64::from(*v).to_sql(ty, out),
            SqlValue::F32(v) => v.to_sql(ty, out),
            SqlValue::F64(v) if *ty == Type::FLOAT4 => (*v as f32).to_sql(ty, out),
            SqlValue::F64(v) => v.to_sql(ty, out),
            SqlValue::Decimal(v) => v.to_sql(ty, out),
            SqlValue::Text(v) | SqlValue::Sql(v) => v.as_str().to_sql(ty, out),
            SqlValue::Bytes(v) => v.as_slice().to_sql(ty, out),
            SqlValue::Uuid(v) => v.to_sql(ty, out),
            SqlValue::Json(v) => v.to_sql(ty, out),
            SqlValue::Date(v) => v.to_sql(ty, out),
            SqlValue::Time(v) => v.to_sql(ty, out),
            SqlValue::Timestamp(v) => v.to_sql(ty, out),
            SqlValue::TimestampTz(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
