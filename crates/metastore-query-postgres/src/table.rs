//! Tabular results and the PostgreSQL <-> JSON value mapping

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use metastore_query::{DataError, Record, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::Row;

/// Bound statement parameter
pub(crate) type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Column type, as reported by PostgreSQL or inferred from JSON cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Numeric,
    Text,
    Bytes,
    Date,
    Timestamp,
    TimestampTz,
    Json,
    Uuid,
}

impl ColumnType {
    /// Map a PostgreSQL type name (long or internal form)
    pub fn from_pg_name(pg_type: &str) -> Self {
        match pg_type {
            "boolean" | "bool" => ColumnType::Boolean,
            "smallint" | "int2" => ColumnType::SmallInt,
            "integer" | "int" | "int4" => ColumnType::Integer,
            "bigint" | "int8" => ColumnType::BigInt,
            "real" | "float4" => ColumnType::Real,
            "double precision" | "float8" => ColumnType::Double,
            "numeric" | "decimal" => ColumnType::Numeric,
            "character varying" | "varchar" | "character" | "char" | "bpchar" | "text"
            | "name" => ColumnType::Text,
            "bytea" => ColumnType::Bytes,
            "date" => ColumnType::Date,
            "timestamp" | "timestamp without time zone" => ColumnType::Timestamp,
            "timestamp with time zone" | "timestamptz" => ColumnType::TimestampTz,
            "json" | "jsonb" => ColumnType::Json,
            "uuid" => ColumnType::Uuid,
            _ => ColumnType::Text,
        }
    }

    /// Type name used in `CREATE TABLE`
    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::SmallInt => "SMALLINT",
            ColumnType::Integer => "INTEGER",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Real => "REAL",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Numeric => "NUMERIC",
            ColumnType::Text => "TEXT",
            ColumnType::Bytes => "BYTEA",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::TimestampTz => "TIMESTAMPTZ",
            ColumnType::Json => "JSONB",
            ColumnType::Uuid => "UUID",
        }
    }
}

/// Infer a column type from its cells. Nulls are ignored; an all-null
/// column is `Text` and a column mixing kinds is stored as `Json`.
pub fn infer_column_type<'a>(values: impl IntoIterator<Item = &'a Value>) -> ColumnType {
    let mut inferred: Option<ColumnType> = None;

    for value in values {
        let kind = match value {
            Value::Null => continue,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::BigInt,
            Value::Number(_) => ColumnType::Double,
            Value::String(_) => ColumnType::Text,
            Value::Array(_) | Value::Object(_) => ColumnType::Json,
        };

        inferred = Some(match (inferred, kind) {
            (None, k) => k,
            (Some(a), b) if a == b => a,
            (Some(ColumnType::BigInt), ColumnType::Double)
            | (Some(ColumnType::Double), ColumnType::BigInt) => ColumnType::Double,
            _ => ColumnType::Json,
        });
    }

    inferred.unwrap_or(ColumnType::Text)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Rows of JSON cells under named, typed columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table from records. Columns are the union of keys in
    /// first-seen order; absent keys become nulls.
    pub fn from_records(records: &[Record]) -> Self {
        let mut names: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                if !names.contains(key) {
                    names.push(key.clone());
                }
            }
        }

        let rows: Vec<Vec<Value>> = records
            .iter()
            .map(|record| {
                names
                    .iter()
                    .map(|name| record.get(name).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        let columns = names
            .into_iter()
            .enumerate()
            .map(|(idx, name)| {
                let column_type = infer_column_type(rows.iter().map(|row| &row[idx]));
                Column::new(name, column_type)
            })
            .collect();

        Self { columns, rows }
    }

    pub(crate) fn from_pg(columns: &[tokio_postgres::Column], rows: &[Row]) -> Result<Self> {
        let columns = columns
            .iter()
            .map(|col| Column::new(col.name(), ColumnType::from_pg_name(col.type_().name())))
            .collect();

        let rows = rows
            .iter()
            .map(|row| (0..row.len()).map(|idx| extract_value(row, idx)).collect())
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { columns, rows })
    }

    /// Append a row; its width must match the column count
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(DataError::validation(
                format!(
                    "row has {} cells but table has {} columns",
                    row.len(),
                    self.columns.len()
                ),
                None,
            ));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// One record per row, keyed by column name
    pub fn to_records(&self) -> Vec<Record> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(col, value)| (col.name.clone(), value.clone()))
                    .collect()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Read a nullable cell, naming the column and type on failure
fn cell<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        let column = &row.columns()[idx];
        cell_error(column.name(), column.type_().name(), e)
    })
}

fn cell_error(column: &str, type_name: &str, e: impl std::fmt::Display) -> DataError {
    DataError::Serialization(format!(
        "Failed to read column {} of type {}: {}",
        column, type_name, e
    ))
}

/// NUMERIC cells are rendered as strings to keep their exact precision
fn decimal_to_value(value: Decimal) -> Value {
    Value::String(value.normalize().to_string())
}

fn extract_value(row: &Row, idx: usize) -> Result<Value> {
    let column = &row.columns()[idx];
    let type_name = column.type_().name();

    let value = match type_name {
        "bool" => cell::<bool>(row, idx)?.map(Value::Bool),
        "int2" => cell::<i16>(row, idx)?.map(|v| Value::Number(v.into())),
        "int4" => cell::<i32>(row, idx)?.map(|v| Value::Number(v.into())),
        "int8" => cell::<i64>(row, idx)?.map(|v| Value::Number(v.into())),
        "float4" => cell::<f32>(row, idx)?
            .and_then(|v| serde_json::Number::from_f64(f64::from(v)))
            .map(Value::Number),
        "float8" => cell::<f64>(row, idx)?
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        "numeric" => cell::<Decimal>(row, idx)?.map(decimal_to_value),
        "date" => cell::<NaiveDate>(row, idx)?.map(|v| Value::String(v.to_string())),
        "timestamp" => cell::<NaiveDateTime>(row, idx)?.map(|v| Value::String(v.to_string())),
        "timestamptz" => cell::<DateTime<Utc>>(row, idx)?.map(|v| Value::String(v.to_rfc3339())),
        "json" | "jsonb" => cell::<Value>(row, idx)?,
        "uuid" => cell::<uuid::Uuid>(row, idx)?.map(|v| Value::String(v.to_string())),
        // varchar, text, bpchar, name and anything else readable as text
        _ => cell::<String>(row, idx)?.map(Value::String),
    };

    Ok(value.unwrap_or(Value::Null))
}

fn parse_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => s.trim().parse::<Decimal>().ok(),
        Value::Number(n) => n
            .to_string()
            .parse::<Decimal>()
            .ok()
            .or_else(|| n.as_f64().and_then(|f| Decimal::try_from(f).ok())),
        _ => None,
    }
}

fn typed<T, F>(value: &Value, column: &str, expected: &str, convert: F) -> Result<SqlParam>
where
    T: ToSql + Sync + Send + 'static,
    F: FnOnce(&Value) -> Option<T>,
{
    if value.is_null() {
        return Ok(Box::new(None::<T>));
    }
    match convert(value) {
        Some(v) => Ok(Box::new(Some(v))),
        None => Err(DataError::validation(
            format!("column {}: expected {}, got {}", column, expected, value),
            None,
        )),
    }
}

/// Convert a JSON cell into a parameter for a column of type `ty`
pub(crate) fn to_sql_param(value: &Value, ty: &Type, column: &str) -> Result<SqlParam> {
    match ty.name() {
        "bool" => typed(value, column, "a boolean", Value::as_bool),
        "int2" => typed(value, column, "a 16-bit integer", |v| {
            v.as_i64().and_then(|n| i16::try_from(n).ok())
        }),
        "int4" => typed(value, column, "a 32-bit integer", |v| {
            v.as_i64().and_then(|n| i32::try_from(n).ok())
        }),
        "int8" => typed(value, column, "an integer", Value::as_i64),
        "float4" => typed(value, column, "a number", |v| v.as_f64().map(|n| n as f32)),
        "float8" => typed(value, column, "a number", Value::as_f64),
        "numeric" => typed(value, column, "a decimal number", parse_decimal),
        "text" | "varchar" | "bpchar" | "name" => typed(value, column, "text", |v| {
            Some(match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        }),
        "json" | "jsonb" => typed(value, column, "JSON", |v| Some(v.clone())),
        "date" => typed(value, column, "a date (YYYY-MM-DD)", |v| {
            v.as_str().and_then(|s| s.parse::<NaiveDate>().ok())
        }),
        "timestamp" => typed(value, column, "a timestamp", |v| {
            v.as_str().and_then(parse_naive_timestamp)
        }),
        "timestamptz" => typed(value, column, "an RFC 3339 timestamp", |v| {
            v.as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        }),
        "uuid" => typed(value, column, "a UUID", |v| {
            v.as_str().and_then(|s| uuid::Uuid::parse_str(s).ok())
        }),
        other => Err(DataError::operation_not_supported(format!(
            "writing column {} of type {}",
            column, other
        ))),
    }
}

fn parse_naive_timestamp(s: &str) -> Option<NaiveDateTime> {
    s.parse::<NaiveDateTime>()
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
}
