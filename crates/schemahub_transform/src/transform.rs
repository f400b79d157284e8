use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use schemahub_storage::object_store::{ObjectStore, ObjectStoreError};
use schemahub_time::Clock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::dedupe::{DedupeEngine, DedupeError, DedupeOutcome, DedupeStatus};
use crate::manifest::Manifest;
use crate::metrics::{
    TRANSFORM_RECORDS_READ,
    TRANSFORM_RECORDS_SKIPPED,
    TRANSFORM_RECORDS_TRANSFORMED,
    TRANSFORM_RECORDS_WRITTEN,
};
use crate::unified::{
    project_raw,
    records_to_parquet,
    unified_object_key,
    UnifiedCodecError,
    UnifiedRecord,
};

/// Unified records buffered before a columnar flush.
pub const TRANSFORM_BATCH_SIZE: usize = 500_000;
/// Raw files fetched from the object store concurrently.
const DEFAULT_FETCH_CONCURRENCY: usize = 5;
const DEFAULT_RAW_PREFIX: &str = "schemahub/raw_coinbase_trades";
const DEFAULT_UNIFIED_PREFIX: &str = "schemahub/unified_trades";

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
pub struct TransformConfig {
    pub raw_prefix: String,
    pub unified_prefix: String,
    pub manifest_key: String,
    #[validate(range(min = 1))]
    pub batch_size: usize,
    #[validate(range(min = 1, max = 16))]
    pub fetch_concurrency: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            raw_prefix: DEFAULT_RAW_PREFIX.to_owned(),
            unified_prefix: DEFAULT_UNIFIED_PREFIX.to_owned(),
            manifest_key: crate::manifest::MANIFEST_KEY.to_owned(),
            batch_size: TRANSFORM_BATCH_SIZE,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error(transparent)]
    Codec(#[from] UnifiedCodecError),
    #[error(transparent)]
    Dedupe(#[from] DedupeError),
    #[error("Raw file {key} vanished between listing and read")]
    RawFileVanished { key: String },
}

pub type TransformResult<T> = Result<T, TransformError>;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformStatus {
    Success,
    NoData,
}

impl TransformStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformStatus::Success => "success",
            TransformStatus::NoData => "no_data",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransformOutcome {
    pub status: TransformStatus,
    pub records_read: u64,
    pub records_transformed: u64,
    pub records_written: u64,
    pub output_version: u32,
    pub output_keys: Vec<String>,
    pub processed_files: Vec<String>,
    pub records_per_symbol: BTreeMap<String, u64>,
    pub dedupe: DedupeOutcome,
}

impl TransformOutcome {
    fn no_data(version: u32) -> Self {
        Self {
            status: TransformStatus::NoData,
            records_read: 0,
            records_transformed: 0,
            records_written: 0,
            output_version: version,
            output_keys: Vec::new(),
            processed_files: Vec::new(),
            records_per_symbol: BTreeMap::new(),
            dedupe: DedupeOutcome {
                status: DedupeStatus::Skipped,
                records_before: 0,
                records_after: 0,
                duplicates_removed: 0,
            },
        }
    }
}

/// Streams raw NDJSON pages into batched columnar writes, then compacts the
/// version partition through the dedupe engine. Projection failures skip the
/// offending line, never the run.
pub struct TransformEngine {
    store: Arc<dyn ObjectStore>,
    dedupe: DedupeEngine,
    clock: Arc<dyn Clock>,
    config: TransformConfig,
}

struct BatchBuffer {
    records: Vec<UnifiedRecord>,
    seen_trade_ids: HashSet<String>,
}

impl BatchBuffer {
    fn new() -> Self {
        Self { records: Vec::new(), seen_trade_ids: HashSet::new() }
    }

    /// Keep-first within one raw file. Duplicates arriving through separate
    /// raw files are kept here and removed by the dedupe engine, which also
    /// counts them for the manifest's dup trends.
    fn start_file(&mut self) {
        self.seen_trade_ids.clear();
    }

    fn push(&mut self, record: UnifiedRecord) {
        if self.seen_trade_ids.insert(record.trade_id.clone()) {
            self.records.push(record);
        }
    }

    fn drain(&mut self) -> Vec<UnifiedRecord> {
        self.seen_trade_ids.clear();
        std::mem::take(&mut self.records)
    }
}

impl TransformEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        dedupe: DedupeEngine,
        clock: Arc<dyn Clock>,
        config: TransformConfig,
    ) -> Self {
        Self { store, dedupe, clock, config }
    }

    pub async fn transform(
        &self,
        version: u32,
        run_id: Uuid,
        rebuild: bool,
    ) -> TransformResult<TransformOutcome> {
        let all_keys: Vec<String> = self
            .store
            .list_objects(&self.config.raw_prefix)
            .await?
            .into_iter()
            .filter(|key| key.ends_with(".jsonl"))
            .collect();

        let keys_to_process: Vec<String> = if rebuild {
            all_keys
        } else {
            let manifest = Manifest::load(&self.store, &self.config.manifest_key).await;
            all_keys
                .into_iter()
                .filter(|key| !manifest.processed_raw_files.contains(key))
                .collect()
        };

        if keys_to_process.is_empty() {
            info!(version, rebuild, "No raw files to transform.");
            return Ok(TransformOutcome::no_data(version));
        }
        info!(version, rebuild, files = keys_to_process.len(), %run_id, "Transform starting.");

        let mut buffer = BatchBuffer::new();
        let mut records_read: u64 = 0;
        let mut records_transformed: u64 = 0;
        let mut records_skipped: u64 = 0;
        let mut records_per_symbol: BTreeMap<String, u64> = BTreeMap::new();
        let mut records_written: u64 = 0;
        let mut output_keys = Vec::new();

        let store = self.store.clone();
        let mut fetches = futures::stream::iter(keys_to_process.iter().cloned())
            .map(|key| {
                let store = store.clone();
                async move {
                    let body = store.get_object(&key).await;
                    (key, body)
                }
            })
            .buffered(self.config.fetch_concurrency);

        while let Some((key, body)) = fetches.next().await {
            let body = body?.ok_or_else(|| TransformError::RawFileVanished { key: key.clone() })?;
            let text = String::from_utf8_lossy(&body);
            debug!(key, bytes = body.len(), "Projecting raw file.");
            buffer.start_file();
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                records_read += 1;
                let projected = serde_json::from_str::<serde_json::Value>(line)
                    .map_err(|parse_error| parse_error.to_string())
                    .and_then(|raw| {
                        project_raw(&raw).map_err(|projection_error| projection_error.to_string())
                    });
                match projected {
                    Ok(record) => {
                        records_transformed += 1;
                        *records_per_symbol.entry(record.symbol.clone()).or_default() += 1;
                        buffer.push(record);
                    }
                    Err(reason) => {
                        records_skipped += 1;
                        warn!(key, reason, "Skipping unprojectable raw line.");
                    }
                }
                if buffer.records.len() >= self.config.batch_size {
                    let (key, written) = self.flush_batch(&mut buffer, version, run_id).await?;
                    output_keys.push(key);
                    records_written += written;
                }
            }
        }
        drop(fetches);

        if !buffer.records.is_empty() {
            let (key, written) = self.flush_batch(&mut buffer, version, run_id).await?;
            output_keys.push(key);
            records_written += written;
        }

        TRANSFORM_RECORDS_READ.increment(records_read);
        TRANSFORM_RECORDS_TRANSFORMED.increment(records_transformed);
        TRANSFORM_RECORDS_SKIPPED.increment(records_skipped);

        let dedupe = self.dedupe.dedupe_version(version).await?;

        info!(
            version,
            records_read,
            records_transformed,
            records_skipped,
            pages = output_keys.len(),
            duplicates_removed = dedupe.duplicates_removed,
            "Transform finished."
        );
        Ok(TransformOutcome {
            status: TransformStatus::Success,
            records_read,
            records_transformed,
            records_written,
            output_version: version,
            output_keys,
            processed_files: keys_to_process,
            records_per_symbol,
            dedupe,
        })
    }

    async fn flush_batch(
        &self,
        buffer: &mut BatchBuffer,
        version: u32,
        run_id: Uuid,
    ) -> TransformResult<(String, u64)> {
        let records = buffer.drain();
        let key = unified_object_key(
            &self.config.unified_prefix,
            version,
            self.clock.now_utc(),
            run_id,
            records.len(),
        );
        let body = records_to_parquet(&records)?;
        self.store.put_object(&key, body).await?;
        let written = u64::try_from(records.len()).expect("usize fits in u64");
        TRANSFORM_RECORDS_WRITTEN.increment(written);
        info!(key, records = records.len(), "Unified page written.");
        Ok((key, written))
    }
}
