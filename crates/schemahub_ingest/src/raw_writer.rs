use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use schemahub_coinbase_client::CoinbaseTrade;
use schemahub_storage::object_store::{ObjectStore, ObjectStoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const RAW_SOURCE: &str = "coinbase";

#[derive(Debug, Error)]
pub enum RawWriterError {
    #[error("Trade {trade_id} has an unparsable {field}: {value}")]
    UnparsableField { trade_id: u64, field: &'static str, value: String },
    #[error("Raw record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
}

pub type RawWriterResult<T> = Result<T, RawWriterError>;

/// One line of a raw NDJSON page: the canonicalized trade plus ingest
/// provenance and the serialized original payload.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RawRecord {
    pub trade_id: String,
    pub product_id: String,
    pub price: f64,
    pub size: f64,
    pub time: DateTime<Utc>,
    pub side: String,
    #[serde(rename = "_source")]
    pub source: String,
    #[serde(rename = "_source_ingest_ts")]
    pub source_ingest_ts: DateTime<Utc>,
    #[serde(rename = "_raw_payload")]
    pub raw_payload: String,
}

/// Canonicalizes an upstream trade into the raw table schema. The original
/// payload rides along verbatim under `_raw_payload`.
pub fn to_raw_record(
    trade: &CoinbaseTrade,
    product_id: &str,
    ingest_ts: DateTime<Utc>,
) -> RawWriterResult<RawRecord> {
    let price = trade.price.parse::<f64>().map_err(|_| RawWriterError::UnparsableField {
        trade_id: trade.trade_id,
        field: "price",
        value: trade.price.clone(),
    })?;
    let size = trade.size.parse::<f64>().map_err(|_| RawWriterError::UnparsableField {
        trade_id: trade.trade_id,
        field: "size",
        value: trade.size.clone(),
    })?;
    let time = DateTime::parse_from_rfc3339(&trade.time)
        .map_err(|_| RawWriterError::UnparsableField {
            trade_id: trade.trade_id,
            field: "time",
            value: trade.time.clone(),
        })?
        .with_timezone(&Utc);
    Ok(RawRecord {
        trade_id: trade.trade_id.to_string(),
        product_id: product_id.to_owned(),
        price,
        size,
        time,
        side: trade.side.to_uppercase(),
        source: RAW_SOURCE.to_owned(),
        source_ingest_ts: ingest_ts,
        raw_payload: serde_json::to_string(trade)?,
    })
}

/// Deterministic raw page key. The tuple `(ts, run_id, first, last, count)`
/// is the page's identity: re-running the same window under the same run
/// overwrites rather than duplicating.
pub fn raw_object_key(
    prefix: &str,
    product_id: &str,
    ingest_ts: DateTime<Utc>,
    run_id: Uuid,
    first_trade_id: u64,
    last_trade_id: u64,
    count: usize,
) -> String {
    format!(
        "{}/raw_{}_trades_{}_{}_{}_{}_{}_{}.jsonl",
        prefix.trim_end_matches('/'),
        RAW_SOURCE,
        product_id,
        ingest_ts.format("%Y%m%dT%H%M%SZ"),
        run_id,
        first_trade_id,
        last_trade_id,
        count,
    )
}

/// Serializes raw records as newline-delimited JSON and writes them in one
/// PUT.
pub struct RawWriter {
    store: Arc<dyn ObjectStore>,
}

impl RawWriter {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub async fn write_batch(&self, key: &str, records: &[RawRecord]) -> RawWriterResult<()> {
        let mut body = String::new();
        for record in records {
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }
        self.store.put_object(key, Bytes::from(body)).await?;
        info!(key, records = records.len(), "Raw page written.");
        Ok(())
    }
}
