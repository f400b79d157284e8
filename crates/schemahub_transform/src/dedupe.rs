use std::sync::Arc;

use schemahub_storage::object_store::{ObjectStore, ObjectStoreError};
use schemahub_storage::query_service::{QueryService, QueryServiceError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::metrics::DEDUPE_DUPLICATES_REMOVED;
use crate::unified::UNIFIED_FILE_EXTENSION;

#[derive(Debug, Error)]
pub enum DedupeError {
    #[error(transparent)]
    Query(#[from] QueryServiceError),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error("Count query returned an unreadable result: {0:?}")]
    MalformedCounts(Vec<Vec<String>>),
}

pub type DedupeResult<T> = Result<T, DedupeError>;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeStatus {
    Skipped,
    Deduped,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DedupeOutcome {
    pub status: DedupeStatus,
    pub records_before: u64,
    pub records_after: u64,
    pub duplicates_removed: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DedupeConfig {
    pub bucket: String,
    pub unified_prefix: String,
    /// Logical table name prefix known to the query service; the version
    /// partition `v<N>` maps to `<table_base>_v<N>`.
    pub table_base: String,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            unified_prefix: "schemahub/unified_trades".to_owned(),
            table_base: "unified_trades".to_owned(),
        }
    }
}

/// Compacts one version partition to unique `(exchange, symbol, trade_id)`
/// rows. The rewrite materializes to a temp partition first; the original is
/// only deleted after the rewrite succeeded, so any earlier failure leaves
/// the partition untouched.
pub struct DedupeEngine {
    store: Arc<dyn ObjectStore>,
    query: Arc<dyn QueryService>,
    config: DedupeConfig,
}

impl DedupeEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        query: Arc<dyn QueryService>,
        config: DedupeConfig,
    ) -> Self {
        Self { store, query, config }
    }

    fn table(&self, version: u32) -> String {
        format!("{}_v{}", self.config.table_base, version)
    }

    fn partition_prefix(&self, version: u32) -> String {
        format!("{}/v{}/", self.config.unified_prefix.trim_end_matches('/'), version)
    }

    fn temp_prefix(&self, version: u32) -> String {
        format!("{}/v{}_dedupe_temp/", self.config.unified_prefix.trim_end_matches('/'), version)
    }

    pub async fn dedupe_version(&self, version: u32) -> DedupeResult<DedupeOutcome> {
        let table = self.table(version);
        let counts_sql = format!(
            "SELECT COUNT(*) AS total_rows, COUNT(DISTINCT exchange || '|' || symbol || '|' || \
             trade_id) AS distinct_rows FROM {table}"
        );
        let counts = self.query.execute(&counts_sql).await?;
        let (records_before, records_after) = parse_counts(&counts.rows)?;

        if records_before == records_after {
            info!(table, records = records_before, "Partition already unique; skipping rewrite.");
            return Ok(DedupeOutcome {
                status: DedupeStatus::Skipped,
                records_before,
                records_after,
                duplicates_removed: 0,
            });
        }

        let duplicates = records_before - records_after;
        warn!(table, duplicates, "Duplicates found; rewriting the partition.");

        let temp_table = format!("{table}_dedupe_temp");
        let temp_prefix = self.temp_prefix(version);
        let rewrite_sql = format!(
            "CREATE TABLE {temp_table} WITH (external_location = 's3://{}/{}', format = \
             'PARQUET') AS SELECT exchange, symbol, trade_id, side, price, quantity, trade_ts \
             FROM (SELECT *, ROW_NUMBER() OVER (PARTITION BY exchange, symbol, trade_id ORDER BY \
             trade_ts DESC) AS rn FROM {table}) WHERE rn = 1",
            self.config.bucket, temp_prefix,
        );
        self.query.execute(&rewrite_sql).await?;

        // Promote the rewrite: drop the originals, move the temp files in,
        // then clear the temp prefix and the temp table.
        let partition_prefix = self.partition_prefix(version);
        let originals = self.store.list_objects(&partition_prefix).await?;
        for key in &originals {
            self.store.delete_object(key).await?;
        }
        let temp_keys = self.store.list_objects(&temp_prefix).await?;
        let mut files_moved = 0_usize;
        for temp_key in &temp_keys {
            if !temp_key.ends_with(UNIFIED_FILE_EXTENSION) {
                continue;
            }
            let file_name = temp_key.rsplit('/').next().unwrap_or(temp_key);
            let target_key = format!("{partition_prefix}{file_name}");
            self.store.copy_object(temp_key, &target_key).await?;
            files_moved += 1;
        }
        for temp_key in &temp_keys {
            self.store.delete_object(temp_key).await?;
        }
        self.query.execute(&format!("DROP TABLE IF EXISTS {temp_table}")).await?;

        DEDUPE_DUPLICATES_REMOVED.increment(duplicates);
        info!(
            table,
            records_before,
            records_after,
            duplicates_removed = duplicates,
            files = files_moved,
            "Partition deduplicated."
        );
        Ok(DedupeOutcome {
            status: DedupeStatus::Deduped,
            records_before,
            records_after,
            duplicates_removed: duplicates,
        })
    }
}

fn parse_counts(rows: &[Vec<String>]) -> DedupeResult<(u64, u64)> {
    let row = rows.first().ok_or_else(|| DedupeError::MalformedCounts(rows.to_vec()))?;
    match (row.first(), row.get(1)) {
        (Some(total), Some(distinct)) => {
            let total = total.parse::<u64>();
            let distinct = distinct.parse::<u64>();
            match (total, distinct) {
                (Ok(total), Ok(distinct)) => Ok((total, distinct)),
                _ => Err(DedupeError::MalformedCounts(rows.to_vec())),
            }
        }
        _ => Err(DedupeError::MalformedCounts(rows.to_vec())),
    }
}
