use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use schemahub_coinbase_client::{CoinbaseTrade, TradeSource};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::{INGEST_PAGES_COMPLETED, INGEST_PAGES_REQUEUED};

/// Re-queue budget for rate-limited cursors. Re-queuing is the backoff:
/// other cursors make progress before the hot one comes around again.
pub const MAX_REQUEUE_ATTEMPTS: u32 = 10;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ParallelFetchError {
    #[error(
        "{failed} of {total} page fetches failed permanently for {product_id}; first: \
         cursor={cursor}: {message}"
    )]
    PagesFailed { product_id: String, failed: usize, total: usize, cursor: u64, message: String },
    #[error("Fetch for {product_id} cancelled")]
    Cancelled { product_id: String },
}

pub type ParallelFetchResult<T> = Result<T, ParallelFetchError>;

struct Shared {
    queue: StdMutex<VecDeque<(u64, u32)>>,
    /// Cursor targets not yet resolved (fetched or failed permanently).
    /// Re-queues leave it untouched, so workers only drain once every target
    /// is settled.
    outstanding: AtomicUsize,
    trades: StdMutex<Vec<CoinbaseTrade>>,
    errors: StdMutex<Vec<(u64, String)>>,
    highest_trade_id: AtomicU64,
}

/// Fetches the cursor windows `[cursor_start, cursor_end)` (stepping by
/// `page_limit`) through a shared work queue drained by `chunk_concurrency`
/// workers. The batch is all-or-nothing: any permanent page failure fails the
/// whole call. The returned trades are sorted ascending by trade id.
pub async fn fetch_trades_parallel(
    source: Arc<dyn TradeSource>,
    product_id: &str,
    cursor_start: u64,
    cursor_end: u64,
    chunk_concurrency: usize,
    page_limit: u64,
    cancel: CancellationToken,
) -> ParallelFetchResult<(Vec<CoinbaseTrade>, u64)> {
    let step = usize::try_from(page_limit).unwrap_or(usize::MAX);
    let targets: Vec<u64> = (cursor_start..cursor_end).step_by(step).collect();
    let num_pages = targets.len();
    if num_pages == 0 {
        debug!(product_id, cursor_start, cursor_end, "No pages to fetch.");
        return Ok((Vec::new(), cursor_start));
    }
    info!(
        product_id,
        pages = num_pages,
        workers = chunk_concurrency.min(num_pages),
        cursor_start,
        cursor_end,
        "Fetching cursor windows in parallel."
    );

    let shared = Arc::new(Shared {
        queue: StdMutex::new(targets.iter().map(|target| (*target, 0)).collect()),
        outstanding: AtomicUsize::new(num_pages),
        trades: StdMutex::new(Vec::new()),
        errors: StdMutex::new(Vec::new()),
        highest_trade_id: AtomicU64::new(cursor_start),
    });

    let mut workers = JoinSet::new();
    for _ in 0..chunk_concurrency.min(num_pages) {
        let shared = shared.clone();
        let source = source.clone();
        let product_id = product_id.to_owned();
        let cancel = cancel.clone();
        workers.spawn(async move {
            worker_loop(shared, source, &product_id, page_limit, cancel).await;
        });
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(join_error) = joined {
            error!(product_id, %join_error, "Fetch worker panicked.");
        }
    }

    if cancel.is_cancelled() && shared.outstanding.load(Ordering::Acquire) > 0 {
        return Err(ParallelFetchError::Cancelled { product_id: product_id.to_owned() });
    }

    let errors = shared.errors.lock().unwrap();
    if let Some((cursor, message)) = errors.first() {
        return Err(ParallelFetchError::PagesFailed {
            product_id: product_id.to_owned(),
            failed: errors.len(),
            total: num_pages,
            cursor: *cursor,
            message: message.clone(),
        });
    }
    drop(errors);

    let mut trades = std::mem::take(&mut *shared.trades.lock().unwrap());
    // Workers complete out of order; checkpoint integrity needs ascending ids.
    trades.sort_by_key(|trade| trade.trade_id);
    let highest = shared.highest_trade_id.load(Ordering::Acquire);
    info!(product_id, trades = trades.len(), highest_trade_id = highest, "Batch fetched.");
    Ok((trades, highest))
}

async fn worker_loop(
    shared: Arc<Shared>,
    source: Arc<dyn TradeSource>,
    product_id: &str,
    page_limit: u64,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let job = shared.queue.lock().unwrap().pop_front();
        let Some((cursor, attempt)) = job else {
            if shared.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            // Another worker still has a page in flight that may re-queue.
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            continue;
        };

        match source.fetch_page(product_id, page_limit, Some(cursor)).await {
            Ok(page) => {
                if let Some(page_highest) =
                    page.trades.iter().map(|trade| trade.trade_id).max()
                {
                    shared.highest_trade_id.fetch_max(page_highest, Ordering::AcqRel);
                }
                debug!(product_id, cursor, count = page.trades.len(), "Page fetched.");
                shared.trades.lock().unwrap().extend(page.trades);
                INGEST_PAGES_COMPLETED.increment(1);
                shared.outstanding.fetch_sub(1, Ordering::AcqRel);
            }
            Err(fetch_error) if fetch_error.is_rate_limit() && attempt < MAX_REQUEUE_ATTEMPTS => {
                warn!(
                    product_id,
                    cursor,
                    attempt = attempt + 1,
                    max_attempts = MAX_REQUEUE_ATTEMPTS,
                    "Rate limited; re-queuing cursor."
                );
                INGEST_PAGES_REQUEUED.increment(1);
                shared.queue.lock().unwrap().push_back((cursor, attempt + 1));
            }
            Err(fetch_error) => {
                error!(product_id, cursor, attempt, %fetch_error, "Page failed permanently.");
                shared.errors.lock().unwrap().push((cursor, fetch_error.to_string()));
                shared.outstanding.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}
