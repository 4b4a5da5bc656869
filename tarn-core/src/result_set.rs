//! Row-oriented and column-oriented result shapes.
//!
//! A query materializes as either a [`RowSet`] (row-major, JSON-valued; what
//! the IPC boundary speaks) or a [`BatchSet`] (Arrow record batches; what
//! the streaming transport yields). Converting between the two is an
//! explicit adapter, never a silent mutation.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder,
};
use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A single result row, keyed by column name.
pub type Row = Map<String, Value>;

/// Name, engine logical type, and nullability of one result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub logical_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, logical_type: impl Into<String>) -> Self {
        ColumnInfo {
            name: name.into(),
            logical_type: logical_type.into(),
            nullable: None,
        }
    }
}

/// A fully materialized, row-oriented query result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowSet {
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub row_count: u64,
    /// Wall-clock execution time reported by the backend, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_time_ms: Option<u64>,
}

impl RowSet {
    pub fn empty() -> Self {
        RowSet::default()
    }

    /// Convert into a columnar [`BatchSet`] with a single batch.
    ///
    /// Integer-typed columns build as `Int64`, floating/decimal columns as
    /// `Float64`, booleans as `Boolean`; everything else round-trips through
    /// its string representation.
    pub fn to_batch_set(&self) -> Result<BatchSet> {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|column| {
                Field::new(
                    &column.name,
                    arrow_type_for(&column.logical_type),
                    column.nullable.unwrap_or(true),
                )
            })
            .collect();
        let schema: SchemaRef = Arc::new(Schema::new(fields));

        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.columns.len());
        for (index, column) in self.columns.iter().enumerate() {
            let data_type = schema.field(index).data_type().clone();
            arrays.push(self.build_column(&column.name, &data_type)?);
        }

        let batch = if self.columns.is_empty() {
            RecordBatch::new_empty(Arc::clone(&schema))
        } else {
            RecordBatch::try_new(Arc::clone(&schema), arrays)
                .map_err(|e| Error::protocol(format!("building record batch: {e}")))?
        };

        Ok(BatchSet {
            schema,
            batches: vec![batch],
        })
    }

    fn build_column(&self, name: &str, data_type: &DataType) -> Result<ArrayRef> {
        let cells = self.rows.iter().map(|row| row.get(name));

        let array: ArrayRef = match data_type {
            DataType::Boolean => {
                let mut builder = BooleanBuilder::with_capacity(self.rows.len());
                for cell in cells {
                    builder.append_option(cell.and_then(Value::as_bool));
                }
                Arc::new(builder.finish())
            }
            DataType::Int64 => {
                let mut builder = Int64Builder::with_capacity(self.rows.len());
                for cell in cells {
                    builder.append_option(cell.and_then(Value::as_i64));
                }
                Arc::new(builder.finish())
            }
            DataType::Float64 => {
                let mut builder = Float64Builder::with_capacity(self.rows.len());
                for cell in cells {
                    builder.append_option(cell.and_then(Value::as_f64));
                }
                Arc::new(builder.finish())
            }
            _ => {
                let mut builder = StringBuilder::new();
                for cell in cells {
                    match cell {
                        None | Some(Value::Null) => builder.append_null(),
                        Some(Value::String(text)) => builder.append_value(text),
                        Some(other) => builder.append_value(other.to_string()),
                    }
                }
                Arc::new(builder.finish())
            }
        };

        Ok(array)
    }
}

/// A columnar query result: one schema and any number of record batches.
#[derive(Debug, Clone)]
pub struct BatchSet {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl BatchSet {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        BatchSet { schema, batches }
    }

    pub fn row_count(&self) -> u64 {
        self.batches.iter().map(|b| b.num_rows() as u64).sum()
    }

    /// Concatenate all batches into one.
    pub fn concat(&self) -> Result<RecordBatch> {
        concat_batches(&self.schema, &self.batches)
            .map_err(|e| Error::protocol(format!("concatenating record batches: {e}")))
    }

    /// Convert into a row-oriented [`RowSet`].
    pub fn to_row_set(&self) -> Result<RowSet> {
        let mut writer = arrow::json::ArrayWriter::new(Vec::new());
        for batch in &self.batches {
            writer
                .write(batch)
                .map_err(|e| Error::protocol(format!("encoding rows: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| Error::protocol(format!("encoding rows: {e}")))?;

        let buffer = writer.into_inner();
        let rows: Vec<Row> = if buffer.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&buffer)
                .map_err(|e| Error::protocol(format!("decoding rows: {e}")))?
        };

        let columns = self
            .schema
            .fields()
            .iter()
            .map(|field| ColumnInfo {
                name: field.name().clone(),
                logical_type: logical_type_name(field.data_type()),
                nullable: Some(field.is_nullable()),
            })
            .collect();

        Ok(RowSet {
            row_count: self.row_count(),
            rows,
            columns,
            query_time_ms: None,
        })
    }
}

/// Engine-style logical type name for an Arrow data type.
pub fn logical_type_name(data_type: &DataType) -> String {
    match data_type {
        DataType::Null => "NULL".into(),
        DataType::Boolean => "BOOLEAN".into(),
        DataType::Int8 => "TINYINT".into(),
        DataType::Int16 => "SMALLINT".into(),
        DataType::Int32 => "INTEGER".into(),
        DataType::Int64 => "BIGINT".into(),
        DataType::UInt8 => "UTINYINT".into(),
        DataType::UInt16 => "USMALLINT".into(),
        DataType::UInt32 => "UINTEGER".into(),
        DataType::UInt64 => "UBIGINT".into(),
        DataType::Float16 | DataType::Float32 => "FLOAT".into(),
        DataType::Float64 => "DOUBLE".into(),
        DataType::Utf8 | DataType::LargeUtf8 => "VARCHAR".into(),
        DataType::Binary | DataType::LargeBinary => "BLOB".into(),
        DataType::Date32 | DataType::Date64 => "DATE".into(),
        DataType::Time32(_) | DataType::Time64(_) => "TIME".into(),
        DataType::Timestamp(_, _) => "TIMESTAMP".into(),
        DataType::Interval(_) => "INTERVAL".into(),
        DataType::Decimal128(precision, scale) | DataType::Decimal256(precision, scale) => {
            format!("DECIMAL({precision},{scale})")
        }
        DataType::List(inner) | DataType::LargeList(inner) => {
            format!("{}[]", logical_type_name(inner.data_type()))
        }
        other => format!("{other}"),
    }
}

fn arrow_type_for(logical_type: &str) -> DataType {
    let upper = logical_type.to_ascii_uppercase();
    match upper.as_str() {
        "BOOLEAN" => DataType::Boolean,
        "TINYINT" | "SMALLINT" | "INTEGER" | "BIGINT" | "HUGEINT" | "UTINYINT" | "USMALLINT"
        | "UINTEGER" | "UBIGINT" => DataType::Int64,
        "FLOAT" | "DOUBLE" | "REAL" => DataType::Float64,
        _ if upper.starts_with("DECIMAL") => DataType::Float64,
        _ => DataType::Utf8,
    }
}
