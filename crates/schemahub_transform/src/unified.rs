use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const UNIFIED_EXCHANGE: &str = "coinbase";
pub const UNIFIED_FILE_EXTENSION: &str = "parquet";

/// Fixed column order of the unified dataset.
pub const UNIFIED_COLUMNS: [&str; 7] =
    ["exchange", "symbol", "trade_id", "side", "price", "quantity", "trade_ts"];

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("Missing field '{0}'")]
    MissingField(&'static str),
    #[error("Field '{field}' is not {expected}: {value}")]
    WrongType { field: &'static str, expected: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum UnifiedCodecError {
    #[error(transparent)]
    Arrow(#[from] ArrowError),
    #[error(transparent)]
    Parquet(#[from] ParquetError),
    #[error("Unified page column '{0}' has an unexpected type")]
    UnexpectedColumnType(&'static str),
}

/// One curated trade. Deliberately carries no ingest metadata so the unified
/// layer is idempotent under replay.
#[derive(Clone, Debug, PartialEq)]
pub struct UnifiedRecord {
    pub exchange: String,
    pub symbol: String,
    pub trade_id: String,
    pub side: String,
    pub price: f64,
    pub quantity: f64,
    pub trade_ts: DateTime<Utc>,
}

impl UnifiedRecord {
    /// Dedupe identity within the curated dataset.
    pub fn identity(&self) -> (String, String, String) {
        (self.exchange.clone(), self.symbol.clone(), self.trade_id.clone())
    }
}

fn string_field(value: &Value, names: &[&'static str]) -> Result<String, ProjectionError> {
    for name in names {
        match value.get(name) {
            Some(Value::String(text)) => return Ok(text.clone()),
            Some(Value::Number(number)) => return Ok(number.to_string()),
            Some(other) => {
                return Err(ProjectionError::WrongType {
                    field: names[0],
                    expected: "a string",
                    value: other.to_string(),
                });
            }
            None => continue,
        }
    }
    Err(ProjectionError::MissingField(names[0]))
}

fn numeric_field(value: &Value, names: &[&'static str]) -> Result<f64, ProjectionError> {
    for name in names {
        match value.get(name) {
            Some(Value::Number(number)) => {
                return number.as_f64().ok_or(ProjectionError::WrongType {
                    field: names[0],
                    expected: "a number",
                    value: number.to_string(),
                });
            }
            Some(Value::String(text)) => {
                return text.parse::<f64>().map_err(|_| ProjectionError::WrongType {
                    field: names[0],
                    expected: "a number",
                    value: text.clone(),
                });
            }
            Some(other) => {
                return Err(ProjectionError::WrongType {
                    field: names[0],
                    expected: "a number",
                    value: other.to_string(),
                });
            }
            None => continue,
        }
    }
    Err(ProjectionError::MissingField(names[0]))
}

fn timestamp_field(value: &Value, names: &[&'static str]) -> Result<DateTime<Utc>, ProjectionError> {
    for name in names {
        let Some(raw) = value.get(name) else { continue };
        match raw {
            Value::String(text) if text.contains('T') => {
                return DateTime::parse_from_rfc3339(text)
                    .map(|parsed| parsed.with_timezone(&Utc))
                    .map_err(|_| ProjectionError::WrongType {
                        field: names[0],
                        expected: "an ISO8601 timestamp",
                        value: text.clone(),
                    });
            }
            // Epoch seconds, either numeric or as text.
            _ => {
                let epoch = match raw {
                    Value::Number(number) => number.as_f64(),
                    Value::String(text) => text.parse::<f64>().ok(),
                    _ => None,
                };
                let wrong_type = || ProjectionError::WrongType {
                    field: names[0],
                    expected: "a timestamp",
                    value: raw.to_string(),
                };
                let epoch = epoch.ok_or_else(wrong_type)?;
                #[allow(clippy::as_conversions)]
                let micros = (epoch * 1_000_000.0) as i64;
                return DateTime::from_timestamp_micros(micros).ok_or_else(wrong_type);
            }
        }
    }
    Err(ProjectionError::MissingField(names[0]))
}

/// Projects one raw NDJSON line onto the unified schema.
pub fn project_raw(raw: &Value) -> Result<UnifiedRecord, ProjectionError> {
    Ok(UnifiedRecord {
        exchange: UNIFIED_EXCHANGE.to_owned(),
        symbol: string_field(raw, &["product_id", "product-id"])?,
        trade_id: string_field(raw, &["id", "trade_id"])?,
        side: string_field(raw, &["side"])?.to_lowercase(),
        price: numeric_field(raw, &["price"])?,
        quantity: numeric_field(raw, &["size", "qty"])?,
        trade_ts: timestamp_field(raw, &["time", "timestamp"])?,
    })
}

pub fn unified_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("exchange", DataType::Utf8, false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("trade_id", DataType::Utf8, false),
        Field::new("side", DataType::Utf8, false),
        Field::new("price", DataType::Float64, false),
        Field::new("quantity", DataType::Float64, false),
        Field::new(
            "trade_ts",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
    ]))
}

pub fn unified_object_key(
    prefix: &str,
    version: u32,
    ts: DateTime<Utc>,
    run_id: Uuid,
    count: usize,
) -> String {
    format!(
        "{}/v{}/unified_trades_{}_{}_{}.{}",
        prefix.trim_end_matches('/'),
        version,
        ts.format("%Y%m%dT%H%M%SZ"),
        run_id,
        count,
        UNIFIED_FILE_EXTENSION,
    )
}

/// Serializes records as one parquet file with the fixed unified schema.
pub fn records_to_parquet(records: &[UnifiedRecord]) -> Result<Bytes, UnifiedCodecError> {
    let schema = unified_schema();
    let exchange: ArrayRef =
        Arc::new(StringArray::from_iter_values(records.iter().map(|record| &record.exchange)));
    let symbol: ArrayRef =
        Arc::new(StringArray::from_iter_values(records.iter().map(|record| &record.symbol)));
    let trade_id: ArrayRef =
        Arc::new(StringArray::from_iter_values(records.iter().map(|record| &record.trade_id)));
    let side: ArrayRef =
        Arc::new(StringArray::from_iter_values(records.iter().map(|record| &record.side)));
    let price: ArrayRef =
        Arc::new(Float64Array::from_iter_values(records.iter().map(|record| record.price)));
    let quantity: ArrayRef =
        Arc::new(Float64Array::from_iter_values(records.iter().map(|record| record.quantity)));
    let trade_ts: ArrayRef = Arc::new(
        TimestampMicrosecondArray::from_iter_values(
            records.iter().map(|record| record.trade_ts.timestamp_micros()),
        )
        .with_timezone("UTC"),
    );

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![exchange, symbol, trade_id, side, price, quantity, trade_ts],
    )?;
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(Bytes::from(buffer))
}

/// Column names present in a parquet page, in file order.
pub fn parquet_column_names(bytes: Bytes) -> Result<Vec<String>, UnifiedCodecError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
    Ok(builder.schema().fields().iter().map(|field| field.name().clone()).collect())
}

/// Reads a unified parquet page back into records.
pub fn parquet_to_records(bytes: Bytes) -> Result<Vec<UnifiedRecord>, UnifiedCodecError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
    let reader = builder.build()?;
    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        if batch.num_columns() < UNIFIED_COLUMNS.len() {
            return Err(UnifiedCodecError::UnexpectedColumnType("schema"));
        }
        let exchange = downcast_strings(&batch, 0, "exchange")?;
        let symbol = downcast_strings(&batch, 1, "symbol")?;
        let trade_id = downcast_strings(&batch, 2, "trade_id")?;
        let side = downcast_strings(&batch, 3, "side")?;
        let price = downcast_floats(&batch, 4, "price")?;
        let quantity = downcast_floats(&batch, 5, "quantity")?;
        let trade_ts = batch
            .column(6)
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .ok_or(UnifiedCodecError::UnexpectedColumnType("trade_ts"))?;
        for row in 0..batch.num_rows() {
            let micros = trade_ts.value(row);
            let trade_ts = DateTime::from_timestamp_micros(micros)
                .ok_or(UnifiedCodecError::UnexpectedColumnType("trade_ts"))?;
            records.push(UnifiedRecord {
                exchange: exchange.value(row).to_owned(),
                symbol: symbol.value(row).to_owned(),
                trade_id: trade_id.value(row).to_owned(),
                side: side.value(row).to_owned(),
                price: price.value(row),
                quantity: quantity.value(row),
                trade_ts,
            });
        }
    }
    Ok(records)
}

fn downcast_strings<'a>(
    batch: &'a RecordBatch,
    index: usize,
    name: &'static str,
) -> Result<&'a StringArray, UnifiedCodecError> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or(UnifiedCodecError::UnexpectedColumnType(name))
}

fn downcast_floats<'a>(
    batch: &'a RecordBatch,
    index: usize,
    name: &'static str,
) -> Result<&'a Float64Array, UnifiedCodecError> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or(UnifiedCodecError::UnexpectedColumnType(name))
}
