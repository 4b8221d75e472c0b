//! Row values read from the source and their SQL literal rendering.
//!
//! Every value carries its database type as the enum variant. A value that
//! has already been rewritten into a subquery against the target database is
//! kept as [`SqlValue::Sql`] and rendered parenthesised and unquoted.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// SQL value tagged with its database type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SqlValue {
    /// SQL NULL.
    Null,

    /// Boolean value.
    Bool(bool),

    /// 16-bit signed integer (smallint).
    I16(i16),

    /// 32-bit signed integer (int).
    I32(i32),

    /// 64-bit signed integer (bigint).
    I64(i64),

    /// 32-bit floating point (real/float4).
    F32(f32),

    /// 64-bit floating point (double precision/float8).
    F64(f64),

    /// Arbitrary precision numeric.
    Decimal(Decimal),

    /// Text of any character type, or any type read back as text.
    Text(String),

    /// Binary data (bytea).
    Bytes(Vec<u8>),

    /// UUID value.
    Uuid(Uuid),

    /// json / jsonb document.
    Json(serde_json::Value),

    /// Date without time component.
    Date(NaiveDate),

    /// Time without date component.
    Time(NaiveTime),

    /// Timestamp without time zone.
    Timestamp(NaiveDateTime),

    /// Timestamp with time zone.
    TimestampTz(DateTime<FixedOffset>),

    /// Expression already resolved against the target database.
    Sql(String),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Check if this value is numeric and rendered unquoted.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            SqlValue::I16(_)
                | SqlValue::I32(_)
                | SqlValue::I64(_)
                | SqlValue::F32(_)
                | SqlValue::F64(_)
                | SqlValue::Decimal(_)
        )
    }

    /// Render this value as a SQL literal.
    #[must_use]
    pub fn to_sql_literal(&self) -> String {
        format_literal(self)
    }
}

/// Render a value as a literal that PostgreSQL parses back to the same value.
///
/// NULL becomes `null`, numbers stay unquoted, timestamps are quoted in ISO
/// form, binary data becomes a `decode(.., 'hex')` call and resolved
/// subqueries are wrapped in parentheses. Everything else is quoted.
pub fn format_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "null".to_string(),
        SqlValue::Bool(true) => "TRUE".to_string(),
        SqlValue::Bool(false) => "FALSE".to_string(),
        SqlValue::I16(v) => v.to_string(),
        SqlValue::I32(v) => v.to_string(),
        SqlValue::I64(v) => v.to_string(),
        SqlValue::F32(v) => format_float(*v as f64),
        SqlValue::F64(v) => format_float(*v),
        SqlValue::Decimal(v) => v.to_string(),
        SqlValue::Text(v) => quote_literal(v),
        SqlValue::Bytes(v) => format!("decode('{}', 'hex')", hex::encode(v)),
        SqlValue::Uuid(v) => format!("'{}'", v),
        SqlValue::Json(v) => quote_literal(&v.to_string()),
        SqlValue::Date(v) => format!("'{}'", v.format("%Y-%m-%d")),
        SqlValue::Time(v) => format!("'{}'", v.format("%H:%M:%S%.f")),
        SqlValue::Timestamp(v) => format!("'{}'", v.format("%Y-%m-%d %H:%M:%S%.f")),
        SqlValue::TimestampTz(v) => format!("'{}'", v.format("%Y-%m-%d %H:%M:%S%.f%:z")),
        SqlValue::Sql(expr) => format!("({})", expr),
    }
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "'NaN'".to_string()
    } else if v.is_infinite() && v > 0.0 {
        "'Infinity'".to_string()
    } else if v.is_infinite() {
        "'-Infinity'".to_string()
    } else {
        v.to_string()
    }
}

/// Quote a string as a PostgreSQL literal.
///
/// Single quotes are doubled. Strings containing backslashes use the `E''`
/// escape syntax with the backslashes doubled, so the literal reads the same
/// whatever `standard_conforming_strings` is set to.
pub fn quote_literal(s: &str) -> String {
    let escaped = s.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

/// One column of a row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    /// Column name.
    pub column: String,

    /// Column value.
    pub value: SqlValue,
}

impl Field {
    pub fn new(column: impl Into<String>, value: SqlValue) -> Self {
        Self {
            column: column.into(),
            value,
        }
    }
}

/// A row as returned by a query: fields in selected column order.
///
/// Transformations build new rows instead of mutating shared ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Row {
    fields: Vec<Field>,
}

impl Row {
    /// Create a row from fields in column order.
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Look up the value of a column.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.fields
            .iter()
            .find(|f| f.column == column)
            .map(|f| &f.value)
    }

    /// Value of a column, NULL when the column was not selected.
    pub fn value(&self, column: &str) -> SqlValue {
        self.get(column).cloned().unwrap_or(SqlValue::Null)
    }

    /// Return a copy of this row with one column replaced.
    #[must_use]
    pub fn with_value(&self, column: &str, value: SqlValue) -> Self {
        let fields = self
            .fields
            .iter()
            .map(|f| {
                if f.column == column {
                    Field::new(f.column.clone(), value.clone())
                } else {
                    f.clone()
                }
            })
            .collect();
        Self { fields }
    }

    /// Return a copy of this row without the given columns.
    #[must_use]
    pub fn without<F>(&self, mut skip: F) -> Self
    where
        F: FnMut(&str) -> bool,
    {
        Self {
            fields: self
                .fields
                .iter()
                .filter(|f| !skip(&f.column))
                .cloned()
                .collect(),
        }
    }

    /// Iterate over fields in column order.
    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the row has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Comma separated literals of every field, in column order.
    pub fn to_values_list(&self) -> String {
        self.fields
            .iter()
            .map(|f| format_literal(&f.value))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromIterator<Field> for Row {
    fn from_iter<I: IntoIterator<Item = Field>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}
