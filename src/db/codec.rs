//! Generic row codec driven by `TableSpec`: JSON records in, SQL parameters out and back.
//!
//! This is the deserialization boundary for entity rows: SQL `NULL` never reaches a record,
//! the field is simply absent.

use crate::error::CloudrowError;
use cloudrow_diff::Record;
use cloudrow_schema::{ColumnSpec, ColumnType, REGION_COLUMN, ROW_ID_COLUMN, TableSpec};
use serde_json::{Number, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
}

pub(crate) fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Text(s) => query.bind(s),
        SqlValue::Integer(i) => query.bind(i),
        SqlValue::Real(f) => query.bind(f),
    }
}

fn invalid(spec: &TableSpec, message: String) -> CloudrowError {
    CloudrowError::InvalidRecord {
        entity_type: spec.name.clone(),
        message,
    }
}

/// Converts one record field to its column value. Absent and `null` both encode as `NULL`.
pub(crate) fn encode_field(
    spec: &TableSpec,
    col: &ColumnSpec,
    record: &Record,
) -> Result<SqlValue, CloudrowError> {
    let value = match record.get(&col.field) {
        None | Some(Value::Null) => {
            if col.nullable {
                return Ok(SqlValue::Null);
            }
            return Err(invalid(spec, format!("missing required field {}", col.field)));
        }
        Some(v) => v,
    };

    let mismatch = || {
        invalid(
            spec,
            format!("field {} expects {:?}, got {value}", col.field, col.ty),
        )
    };

    match col.ty {
        ColumnType::Text => value
            .as_str()
            .map(|s| SqlValue::Text(s.to_string()))
            .ok_or_else(mismatch),
        ColumnType::Timestamp => {
            let s = value.as_str().ok_or_else(mismatch)?;
            chrono::DateTime::parse_from_rfc3339(s).map_err(|_| mismatch())?;
            Ok(SqlValue::Text(s.to_string()))
        }
        ColumnType::Integer => value.as_i64().map(SqlValue::Integer).ok_or_else(mismatch),
        ColumnType::Real => value.as_f64().map(SqlValue::Real).ok_or_else(mismatch),
        ColumnType::Boolean => value
            .as_bool()
            .map(|b| SqlValue::Integer(i64::from(b)))
            .ok_or_else(mismatch),
        ColumnType::Json => Ok(SqlValue::Text(serde_json::to_string(value)?)),
    }
}

fn decode_field(spec: &TableSpec, col: &ColumnSpec, row: &SqliteRow) -> Result<Value, CloudrowError> {
    let name = col.column.as_str();
    let value = match col.ty {
        ColumnType::Text | ColumnType::Timestamp => row
            .try_get::<Option<String>, _>(name)?
            .map_or(Value::Null, Value::String),
        ColumnType::Integer => row
            .try_get::<Option<i64>, _>(name)?
            .map_or(Value::Null, |i| Value::Number(i.into())),
        ColumnType::Real => row
            .try_get::<Option<f64>, _>(name)?
            .and_then(Number::from_f64)
            .map_or(Value::Null, Value::Number),
        ColumnType::Boolean => row
            .try_get::<Option<i64>, _>(name)?
            .map_or(Value::Null, |i| Value::Bool(i != 0)),
        ColumnType::Json => match row.try_get::<Option<String>, _>(name)? {
            None => Value::Null,
            Some(text) => serde_json::from_str(&text).map_err(|e| {
                invalid(spec, format!("column {name} holds invalid JSON: {e}"))
            })?,
        },
    };
    Ok(value)
}

/// Decodes a row selected with [`select_sql`]. `NULL` columns are left out of the record.
pub(crate) fn decode_row(
    spec: &TableSpec,
    row: &SqliteRow,
) -> Result<(i64, Option<String>, Record), CloudrowError> {
    let row_id: i64 = row.try_get(ROW_ID_COLUMN)?;
    let region = if spec.regional {
        row.try_get::<Option<String>, _>(REGION_COLUMN)?
    } else {
        None
    };
    let mut record = Record::new();
    for col in &spec.columns {
        match decode_field(spec, col, row)? {
            Value::Null => {}
            v => {
                record.insert(col.field.clone(), v);
            }
        }
    }
    Ok((row_id, region, record))
}

fn quoted<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    names.map(|n| format!("\"{n}\"")).collect()
}

pub(crate) fn select_sql(spec: &TableSpec) -> String {
    let mut cols = vec![ROW_ID_COLUMN];
    if spec.regional {
        cols.push(REGION_COLUMN);
    }
    cols.extend(spec.columns.iter().map(|c| c.column.as_str()));
    format!(
        "SELECT {} FROM \"{}\" ORDER BY \"{ROW_ID_COLUMN}\"",
        quoted(cols.into_iter()).join(", "),
        spec.name
    )
}

/// `INSERT` of every column, region first for regional tables. Returns the new row id.
pub(crate) fn insert_sql(spec: &TableSpec) -> String {
    let mut cols = Vec::new();
    if spec.regional {
        cols.push(REGION_COLUMN);
    }
    cols.extend(spec.columns.iter().map(|c| c.column.as_str()));
    let placeholders = vec!["?"; cols.len()].join(", ");
    format!(
        "INSERT INTO \"{}\" ({}) VALUES ({placeholders}) RETURNING \"{ROW_ID_COLUMN}\"",
        spec.name,
        quoted(cols.into_iter()).join(", ")
    )
}

/// Parameters for [`insert_sql`] in column order.
pub(crate) fn insert_values(
    spec: &TableSpec,
    region: Option<&str>,
    record: &Record,
) -> Result<Vec<SqlValue>, CloudrowError> {
    let mut values = Vec::with_capacity(spec.columns.len() + 1);
    if spec.regional {
        values.push(region.map_or(SqlValue::Null, |r| SqlValue::Text(r.to_string())));
    }
    for col in &spec.columns {
        values.push(encode_field(spec, col, record)?);
    }
    Ok(values)
}

/// `UPDATE` of the listed fields by row id, with the matching parameters (row id last).
pub(crate) fn update_sql(
    spec: &TableSpec,
    fields: &[String],
    record: &Record,
) -> Result<(String, Vec<SqlValue>), CloudrowError> {
    let mut assignments = Vec::with_capacity(fields.len());
    let mut values = Vec::with_capacity(fields.len());
    for field in fields {
        let col = spec
            .field(field)
            .ok_or_else(|| invalid(spec, format!("unknown field {field}")))?;
        assignments.push(format!("\"{}\" = ?", col.column));
        values.push(encode_field(spec, col, record)?);
    }
    let sql = format!(
        "UPDATE \"{}\" SET {} WHERE \"{ROW_ID_COLUMN}\" = ?",
        spec.name,
        assignments.join(", ")
    );
    Ok((sql, values))
}
