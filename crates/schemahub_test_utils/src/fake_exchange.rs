use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use reqwest::StatusCode;
use schemahub_coinbase_client::{
    CoinbaseClientError,
    CoinbaseClientResult,
    CoinbaseTrade,
    TradePage,
    TradeSource,
};

/// A recorded `fetch_page` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchCall {
    pub product_id: String,
    pub limit: u64,
    pub after: Option<u64>,
}

/// In-memory stand-in for the upstream feed. Each product holds trades with
/// dense ids `1..=n`; `fetch_page(after = C)` returns the ids in
/// `(C - limit, C]`, newest first, the way the ingest cursor arithmetic
/// expects. Failures can be scripted per cursor.
#[derive(Default)]
pub struct FakeExchange {
    products: Mutex<HashMap<String, Vec<CoinbaseTrade>>>,
    /// (product, after) -> remaining scripted failures, popped one per call.
    failures: Mutex<HashMap<(String, Option<u64>), Vec<CoinbaseClientError>>>,
    calls: Mutex<Vec<FetchCall>>,
}

pub fn base_trade_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// A deterministic trade: id `n` executed `n` seconds after the base time.
pub fn trade(trade_id: u64, side: &str) -> CoinbaseTrade {
    let time = base_trade_time() + ChronoDuration::seconds(i64::try_from(trade_id).unwrap());
    CoinbaseTrade {
        trade_id,
        price: format!("{}.5", 50_000 + trade_id % 100),
        size: "0.25".to_owned(),
        time: time.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        side: side.to_owned(),
    }
}

impl FakeExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `product` with trades `1..=latest_trade_id`.
    pub fn seed_product(&self, product_id: &str, latest_trade_id: u64) {
        let trades = (1..=latest_trade_id)
            .map(|id| trade(id, if id % 2 == 0 { "buy" } else { "sell" }))
            .collect();
        self.products.lock().unwrap().insert(product_id.to_owned(), trades);
    }

    pub fn seed_trades(&self, product_id: &str, trades: Vec<CoinbaseTrade>) {
        self.products.lock().unwrap().insert(product_id.to_owned(), trades);
    }

    /// Scripts errors for `fetch_page(product, after)`; they are returned
    /// (and consumed) before any real page is served.
    pub fn fail_fetches(
        &self,
        product_id: &str,
        after: Option<u64>,
        errors: Vec<CoinbaseClientError>,
    ) {
        self.failures.lock().unwrap().insert((product_id.to_owned(), after), errors);
    }

    /// Shorthand: `times` upstream 429s for one cursor.
    pub fn rate_limit_cursor(&self, product_id: &str, after: u64, times: usize) {
        let errors = (0..times)
            .map(|_| CoinbaseClientError::Status {
                status: StatusCode::TOO_MANY_REQUESTS,
                body: "rate limited".to_owned(),
            })
            .collect();
        self.fail_fetches(product_id, Some(after), errors);
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fetched_afters(&self, product_id: &str) -> Vec<u64> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.product_id == product_id)
            .filter_map(|call| call.after)
            .collect()
    }
}

#[async_trait]
impl TradeSource for FakeExchange {
    async fn fetch_page(
        &self,
        product_id: &str,
        limit: u64,
        after: Option<u64>,
    ) -> CoinbaseClientResult<TradePage> {
        self.calls.lock().unwrap().push(FetchCall {
            product_id: product_id.to_owned(),
            limit,
            after,
        });

        if let Some(scripted) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&(product_id.to_owned(), after))
            .filter(|errors| !errors.is_empty())
        {
            return Err(scripted.remove(0));
        }

        let products = self.products.lock().unwrap();
        let Some(trades) = products.get(product_id) else {
            return Err(CoinbaseClientError::Status {
                status: StatusCode::NOT_FOUND,
                body: "NotFound".to_owned(),
            });
        };

        let mut page: Vec<CoinbaseTrade> = match after {
            Some(after) => {
                let low = after.saturating_sub(limit);
                trades
                    .iter()
                    .filter(|trade| trade.trade_id > low && trade.trade_id <= after)
                    .cloned()
                    .collect()
            }
            None => {
                let mut newest: Vec<CoinbaseTrade> = trades.clone();
                newest.sort_by_key(|trade| std::cmp::Reverse(trade.trade_id));
                newest.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
                newest
            }
        };
        page.sort_by_key(|trade| std::cmp::Reverse(trade.trade_id));
        let next_cursor = page.last().map(|oldest| oldest.trade_id.saturating_sub(1));
        Ok(TradePage { trades: page, next_cursor })
    }

    async fn latest_trade_id(&self, product_id: &str) -> CoinbaseClientResult<u64> {
        let products = self.products.lock().unwrap();
        products
            .get(product_id)
            .and_then(|trades| trades.iter().map(|trade| trade.trade_id).max())
            .ok_or_else(|| CoinbaseClientError::EmptyFeed { product_id: product_id.to_owned() })
    }

    async fn list_products(&self) -> CoinbaseClientResult<Vec<String>> {
        let mut ids: Vec<String> = self.products.lock().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
