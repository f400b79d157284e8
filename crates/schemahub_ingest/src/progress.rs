use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tracing::info;

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Clone, Debug)]
pub struct ProductProgress {
    pub product_id: String,
    pub start_cursor: u64,
    pub target_trade_id: u64,
    pub records_processed: u64,
    pub last_cursor: u64,
}

impl ProductProgress {
    pub fn expected_records(&self) -> u64 {
        self.target_trade_id.saturating_sub(self.start_cursor)
    }

    pub fn percent_complete(&self) -> f64 {
        let expected = self.expected_records();
        if expected == 0 {
            return 100.0;
        }
        #[allow(clippy::as_conversions)]
        let percent = self.records_processed as f64 / expected as f64 * 100.0;
        percent.min(100.0)
    }
}

struct State {
    products: HashMap<String, ProductProgress>,
    last_report: Instant,
}

/// Thread-safe progress reporting for long backfills: per-product percent,
/// aggregate rate and a coarse ETA, logged at most once per interval.
pub struct ProgressTracker {
    update_interval: Duration,
    started: Instant,
    state: StdMutex<State>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_UPDATE_INTERVAL)
    }
}

impl ProgressTracker {
    pub fn new(update_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            update_interval,
            started: now,
            state: StdMutex::new(State { products: HashMap::new(), last_report: now }),
        }
    }

    pub fn add_product(&self, product_id: &str, start_cursor: u64, target_trade_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.products.insert(
            product_id.to_owned(),
            ProductProgress {
                product_id: product_id.to_owned(),
                start_cursor,
                target_trade_id,
                records_processed: 0,
                last_cursor: start_cursor,
            },
        );
    }

    pub fn update(&self, product_id: &str, records_added: u64, current_cursor: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(progress) = state.products.get_mut(product_id) {
            progress.records_processed += records_added;
            progress.last_cursor = current_cursor;
        }
        if state.last_report.elapsed() >= self.update_interval {
            state.last_report = Instant::now();
            report(&state.products, self.started.elapsed());
        }
    }

    pub fn snapshot(&self, product_id: &str) -> Option<ProductProgress> {
        self.state.lock().unwrap().products.get(product_id).cloned()
    }
}

fn report(products: &HashMap<String, ProductProgress>, elapsed: Duration) {
    let total_processed: u64 = products.values().map(|progress| progress.records_processed).sum();
    let total_expected: u64 = products.values().map(ProductProgress::expected_records).sum();
    let minutes = elapsed.as_secs_f64() / 60.0;
    let rate_per_min = if minutes > 0.0 {
        #[allow(clippy::as_conversions)]
        let rate = total_processed as f64 / minutes;
        rate
    } else {
        0.0
    };
    let remaining = total_expected.saturating_sub(total_processed);
    let eta_minutes = if rate_per_min > 0.0 {
        #[allow(clippy::as_conversions)]
        let eta = remaining as f64 / rate_per_min;
        eta
    } else {
        f64::INFINITY
    };
    info!(
        products = products.len(),
        total_processed,
        total_expected,
        rate_per_min = format!("{rate_per_min:.0}"),
        eta_minutes = format!("{eta_minutes:.1}"),
        "Backfill progress."
    );
    for progress in products.values() {
        info!(
            product_id = progress.product_id,
            percent = format!("{:.1}", progress.percent_complete()),
            records = progress.records_processed,
            cursor = progress.last_cursor,
            "Product progress."
        );
    }
}
