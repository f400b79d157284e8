use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemahub_coinbase_client::TradeSource;
use schemahub_locks::lock_manager::{LockManager, LockManagerError};
use schemahub_storage::checkpoint::{Checkpoint, CheckpointMode, CheckpointStore};
use schemahub_time::Clock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::metrics::{INGEST_LAG_SECONDS, INGEST_PRODUCT_FAILURES, INGEST_RECORDS_WRITTEN};
use crate::parallel::{fetch_trades_parallel, ParallelFetchError};
use crate::progress::ProgressTracker;
use crate::raw_writer::{raw_object_key, to_raw_record, RawRecord, RawWriter};

const DEFAULT_RAW_PREFIX: &str = "schemahub/raw_coinbase_trades";
const DEFAULT_PAGE_LIMIT: u64 = 1000;
/// Trades cached in memory before a flush. The default of one page keeps the
/// raw files aligned with upstream page windows.
const DEFAULT_CACHE_BATCH_SIZE: u64 = 1000;
const DEFAULT_PRODUCT_WORKERS: usize = 3;
const DEFAULT_CHUNK_CONCURRENCY: usize = 5;
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
pub struct IngestConfig {
    pub raw_prefix: String,
    #[validate(range(min = 1))]
    pub page_limit: u64,
    #[validate(range(min = 1))]
    pub cache_batch_size: u64,
    #[validate(range(min = 1, max = 10))]
    pub product_workers: usize,
    #[validate(range(min = 1, max = 25))]
    pub chunk_concurrency: usize,
    pub lock_timeout: Duration,
    /// Whether to resume from the mode's checkpoints. Full-refresh runs
    /// always start cold and leave this off.
    pub resume_from_checkpoint: bool,
    pub dry_run: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            raw_prefix: DEFAULT_RAW_PREFIX.to_owned(),
            page_limit: DEFAULT_PAGE_LIMIT,
            cache_batch_size: DEFAULT_CACHE_BATCH_SIZE,
            product_workers: DEFAULT_PRODUCT_WORKERS,
            chunk_concurrency: DEFAULT_CHUNK_CONCURRENCY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            resume_from_checkpoint: true,
            dry_run: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Ok,
    Skipped,
    Error,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ProductOutcome {
    pub product_id: String,
    pub status: ProductStatus,
    pub records_written: u64,
    pub raw_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_cursor: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProductOutcome {
    fn error(product_id: &str, message: String) -> Self {
        Self {
            product_id: product_id.to_owned(),
            status: ProductStatus::Error,
            records_written: 0,
            raw_keys: Vec::new(),
            checkpoint_cursor: None,
            error: Some(message),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failure,
}

/// The structured summary emitted on stdout when a run terminates.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub pipeline: String,
    pub status: RunStatus,
    pub run_id: Uuid,
    pub records_written: u64,
    pub products_processed: usize,
    pub checkpoint_ts: DateTime<Utc>,
    #[serde(skip)]
    pub outcomes: Vec<ProductOutcome>,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("The '{0}' lock is held by another process")]
    LockUnavailable(&'static str),
    #[error(transparent)]
    Lock(#[from] LockManagerError),
    #[error("No products to ingest")]
    NoProducts,
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Drives one ingest run: takes the mode lock, fans products out over a
/// bounded worker pool, and for each product advances the cursor in
/// flush-then-checkpoint batches until the session's finish line.
pub struct IngestController {
    source: Arc<dyn TradeSource>,
    checkpoints: Arc<CheckpointStore>,
    raw_writer: Arc<RawWriter>,
    locks: Arc<LockManager>,
    clock: Arc<dyn Clock>,
    config: IngestConfig,
    cancel: CancellationToken,
    progress: Arc<ProgressTracker>,
}

impl IngestController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn TradeSource>,
        checkpoints: Arc<CheckpointStore>,
        raw_writer: Arc<RawWriter>,
        locks: Arc<LockManager>,
        clock: Arc<dyn Clock>,
        config: IngestConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            checkpoints,
            raw_writer,
            locks,
            clock,
            config,
            cancel,
            progress: Arc::new(ProgressTracker::default()),
        }
    }

    fn lock_name(&self) -> &'static str {
        // Incremental and full-refresh contend for the same lock; backfill
        // runs alongside them.
        match self.checkpoints.mode() {
            CheckpointMode::Backfill => "backfill",
            CheckpointMode::Ingest | CheckpointMode::FullRefresh => "ingest",
        }
    }

    fn pipeline_name(&self) -> String {
        format!("coinbase_{}", self.checkpoints.mode())
    }

    pub async fn run(self: Arc<Self>, products: Vec<String>) -> IngestResult<RunSummary> {
        if products.is_empty() {
            return Err(IngestError::NoProducts);
        }
        let lock_name = self.lock_name();
        if !self.locks.acquire(lock_name, false, self.config.lock_timeout).await? {
            return Err(IngestError::LockUnavailable(lock_name));
        }

        let run_id = Uuid::new_v4();
        let session_ts = self.clock.now_utc();
        info!(
            %run_id,
            mode = %self.checkpoints.mode(),
            products = products.len(),
            dry_run = self.config.dry_run,
            "Ingest run starting."
        );

        let semaphore = Arc::new(Semaphore::new(self.config.product_workers));
        let mut tasks = JoinSet::new();
        for product_id in products {
            let controller = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit =
                    semaphore.acquire_owned().await.expect("Semaphore is never closed");
                controller.ingest_product(&product_id, run_id, session_ts).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_error) => {
                    error!(%join_error, "Product worker panicked.");
                    outcomes.push(ProductOutcome::error("<unknown>", join_error.to_string()));
                }
            }
        }

        self.locks.release(lock_name).await?;

        let records_written = outcomes.iter().map(|outcome| outcome.records_written).sum();
        let summary = RunSummary {
            pipeline: self.pipeline_name(),
            status: aggregate_status(&outcomes),
            run_id,
            records_written,
            products_processed: outcomes.len(),
            checkpoint_ts: self.clock.now_utc(),
            outcomes,
        };
        info!(
            %run_id,
            status = ?summary.status,
            records_written,
            products = summary.products_processed,
            "Ingest run finished."
        );
        Ok(summary)
    }

    async fn ingest_product(
        &self,
        product_id: &str,
        run_id: Uuid,
        session_ts: DateTime<Utc>,
    ) -> ProductOutcome {
        match self.ingest_product_inner(product_id, run_id, session_ts).await {
            Ok(outcome) => outcome,
            Err(message) => {
                error!(product_id, error = message, "Product ingest failed.");
                INGEST_PRODUCT_FAILURES.increment(1);
                ProductOutcome::error(product_id, message)
            }
        }
    }

    async fn ingest_product_inner(
        &self,
        product_id: &str,
        run_id: Uuid,
        session_ts: DateTime<Utc>,
    ) -> Result<ProductOutcome, String> {
        let target = self
            .source
            .latest_trade_id(product_id)
            .await
            .map_err(|fetch_error| fetch_error.to_string())?;
        let cursor = if self.config.resume_from_checkpoint {
            self.checkpoints
                .load(product_id)
                .await
                .map_err(|checkpoint_error| checkpoint_error.to_string())?
                .map(|checkpoint| checkpoint.cursor)
        } else {
            None
        };

        if let Some(cursor) = cursor {
            if cursor > target {
                info!(product_id, cursor, target, "Already caught up.");
                return Ok(ProductOutcome {
                    product_id: product_id.to_owned(),
                    status: ProductStatus::Skipped,
                    records_written: 0,
                    raw_keys: Vec::new(),
                    checkpoint_cursor: Some(cursor),
                    error: None,
                });
            }
        }
        if self.config.dry_run {
            info!(product_id, ?cursor, target, "Dry run: would ingest this cursor span.");
            return Ok(ProductOutcome {
                product_id: product_id.to_owned(),
                status: ProductStatus::Ok,
                records_written: 0,
                raw_keys: Vec::new(),
                checkpoint_cursor: cursor,
                error: None,
            });
        }

        self.progress.add_product(product_id, cursor.unwrap_or(1), target);
        let page_limit = self.config.page_limit;
        let pages_per_batch = (self.config.cache_batch_size / page_limit).max(1);
        // The after-value of the page that begins at the cursor. Cold starts
        // submit the smallest legal after-value, covering ids 1..=page_limit.
        let mut next_after = cursor.map_or(page_limit, |cursor| cursor + page_limit - 1);
        let mut checkpoint_cursor = cursor;
        let mut records_written: u64 = 0;
        let mut raw_keys = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                info!(product_id, "Cancellation observed; stopping after the last flush.");
                break;
            }
            // The last useful after-value T still overlaps the finish line:
            // T - page_limit < target.
            let cursor_end = (next_after + pages_per_batch * page_limit).min(target + page_limit);
            if next_after >= cursor_end {
                break;
            }

            let fetched = fetch_trades_parallel(
                self.source.clone(),
                product_id,
                next_after,
                cursor_end,
                self.config.chunk_concurrency,
                page_limit,
                self.cancel.clone(),
            )
            .await;
            let (trades, highest_trade_id) = match fetched {
                Ok(batch) => batch,
                Err(ParallelFetchError::Cancelled { .. }) => break,
                Err(fetch_error) => return Err(fetch_error.to_string()),
            };
            if trades.is_empty() {
                info!(product_id, next_after, "Empty page; ingest loop done.");
                break;
            }

            let records: Vec<RawRecord> = trades
                .iter()
                .map(|trade| to_raw_record(trade, product_id, session_ts))
                .collect::<Result<_, _>>()
                .map_err(|record_error| record_error.to_string())?;
            let first_trade_id = trades[0].trade_id;
            let key = raw_object_key(
                &self.config.raw_prefix,
                product_id,
                session_ts,
                run_id,
                first_trade_id,
                highest_trade_id,
                records.len(),
            );
            // Flush before checkpoint: a crash between the two re-ingests
            // this window at worst; the reverse order would lose it.
            self.raw_writer
                .write_batch(&key, &records)
                .await
                .map_err(|write_error| write_error.to_string())?;

            let new_cursor = highest_trade_id + 1;
            if checkpoint_cursor.is_some_and(|current| new_cursor < current) {
                warn!(
                    product_id,
                    new_cursor,
                    current = checkpoint_cursor,
                    "Refusing checkpoint regression."
                );
            } else {
                let checkpoint = Checkpoint {
                    cursor: new_cursor,
                    last_updated: session_ts,
                    last_ingest_time: Some(self.clock.now_utc()),
                    last_trade_id: Some(highest_trade_id),
                };
                self.checkpoints
                    .save(product_id, checkpoint)
                    .await
                    .map_err(|checkpoint_error| checkpoint_error.to_string())?;
                checkpoint_cursor = Some(new_cursor);
            }

            let batch_len = as_u64(records.len());
            records_written += batch_len;
            INGEST_RECORDS_WRITTEN.increment(batch_len);
            if let Some(newest) = records.last() {
                let lag_seconds = (self.clock.now_utc() - newest.time).num_seconds();
                INGEST_LAG_SECONDS.set_lossy(lag_seconds);
            }
            self.progress.update(product_id, batch_len, new_cursor);
            raw_keys.push(key);

            if new_cursor >= target {
                break;
            }
            let pages_fetched = (cursor_end - next_after).div_ceil(page_limit);
            next_after += pages_fetched * page_limit;
        }

        Ok(ProductOutcome {
            product_id: product_id.to_owned(),
            status: ProductStatus::Ok,
            records_written,
            raw_keys,
            checkpoint_cursor,
            error: None,
        })
    }
}

fn aggregate_status(outcomes: &[ProductOutcome]) -> RunStatus {
    let failed = outcomes.iter().filter(|outcome| outcome.status == ProductStatus::Error).count();
    if failed == 0 {
        RunStatus::Success
    } else if failed == outcomes.len() {
        RunStatus::Failure
    } else {
        RunStatus::PartialFailure
    }
}

fn as_u64(value: usize) -> u64 {
    u64::try_from(value).expect("usize fits in u64")
}
