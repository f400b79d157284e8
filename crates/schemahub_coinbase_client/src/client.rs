use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
#[cfg(any(feature = "testing", test))]
use mockall::automock;
use reqwest::StatusCode;
use schemahub_health::CircuitBreaker;
use schemahub_rate_limiter::RateLimiter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::metrics::{UPSTREAM_REQUESTS, UPSTREAM_REQUEST_LATENCY_SECS, UPSTREAM_RETRIES};
use crate::objects::{CoinbaseTrade, TradePage};

pub const COINBASE_UPSTREAM: &str = "coinbase";
const CURSOR_HEADER: &str = "CB-AFTER";
const DEFAULT_BASE_URL: &str = "https://api.exchange.coinbase.com";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Attempts per logical request. Distinct from the circuit breaker's
/// consecutive-failure threshold.
const DEFAULT_MAX_RETRIES: u32 = 3;
const USER_AGENT: &str = "schemahub/0.1";

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CoinbaseClientConfig {
    pub base_url: Url,
    pub request_timeout: Duration,
    pub max_retries: u32,
}

impl Default for CoinbaseClientConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("Default base url parses"),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Error)]
pub enum CoinbaseClientError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("HTTP {status} from upstream: {body}")]
    Status { status: StatusCode, body: String },
    #[error("Rate limited by upstream after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("Malformed upstream payload: {0}")]
    MalformedPayload(String),
    #[error("No trades returned for {product_id}")]
    EmptyFeed { product_id: String },
}

impl CoinbaseClientError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            CoinbaseClientError::RateLimited { .. }
                | CoinbaseClientError::Status { status: StatusCode::TOO_MANY_REQUESTS, .. }
        )
    }
}

pub type CoinbaseClientResult<T> = Result<T, CoinbaseClientError>;

/// The upstream trade feed as the pipeline sees it.
#[cfg_attr(any(feature = "testing", test), automock)]
#[async_trait]
pub trait TradeSource: Send + Sync {
    /// Fetches one page: the up-to-`limit` trades with ids in
    /// `(after - limit, after]`, newest first, plus the next-page boundary.
    /// `after = None` returns the newest page.
    async fn fetch_page(
        &self,
        product_id: &str,
        limit: u64,
        after: Option<u64>,
    ) -> CoinbaseClientResult<TradePage>;

    /// The newest trade id on the public feed, used as an ingest session's
    /// finish line.
    async fn latest_trade_id(&self, product_id: &str) -> CoinbaseClientResult<u64>;

    /// Product ids currently listed by the exchange.
    async fn list_products(&self) -> CoinbaseClientResult<Vec<String>>;
}

enum ErrorClass {
    /// Timeout or connect error: retried with no pacing beyond the circuit's
    /// own wait.
    Network,
    /// HTTP 429: retried with exponential backoff.
    RateLimit,
    /// HTTP 5xx: retried with exponential backoff.
    ServerError,
    /// Everything else (4xx, malformed bodies): surfaces immediately.
    Permanent,
}

fn classify(error: &CoinbaseClientError) -> ErrorClass {
    match error {
        CoinbaseClientError::Request(request_error)
            if request_error.is_timeout() || request_error.is_connect() =>
        {
            ErrorClass::Network
        }
        CoinbaseClientError::Status { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS => {
            ErrorClass::RateLimit
        }
        CoinbaseClientError::Status { status, .. } if status.is_server_error() => {
            ErrorClass::ServerError
        }
        _ => ErrorClass::Permanent,
    }
}

/// Fetches trades from the Coinbase public REST API, gated by the shared
/// rate limiter and circuit breaker.
pub struct CoinbaseClient {
    client: reqwest::Client,
    config: CoinbaseClientConfig,
    rate_limiter: Arc<RateLimiter>,
    circuit: Arc<CircuitBreaker>,
}

impl CoinbaseClient {
    pub fn new(
        config: CoinbaseClientConfig,
        rate_limiter: Arc<RateLimiter>,
        circuit: Arc<CircuitBreaker>,
    ) -> CoinbaseClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, config, rate_limiter, circuit })
    }

    /// Runs one gated, retried GET and deserializes the JSON body. Timeouts,
    /// connect errors, 429s and 5xx retry up to `max_retries` attempts; other
    /// 4xx and malformed bodies surface immediately.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
    ) -> CoinbaseClientResult<(T, Option<u64>)> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.rate_limiter.acquire(1, true).await;
            let circuit_wait = self.circuit.get_wait_time(COINBASE_UPSTREAM, attempt).await;
            if !circuit_wait.is_zero() {
                tokio::time::sleep(circuit_wait).await;
            }

            UPSTREAM_REQUESTS.increment(1);
            let started = Instant::now();
            let outcome = self.try_get_json::<T>(url.clone()).await;
            let latency = started.elapsed();
            match outcome {
                Ok(parsed) => {
                    self.circuit
                        .record_success(COINBASE_UPSTREAM, latency.as_secs_f64() * 1000.0)
                        .await;
                    UPSTREAM_REQUEST_LATENCY_SECS.record(latency.as_secs_f64());
                    return Ok(parsed);
                }
                Err(error) => {
                    self.circuit.record_failure(COINBASE_UPSTREAM, &error.to_string()).await;
                    let class = classify(&error);
                    if matches!(class, ErrorClass::Permanent) {
                        return Err(error);
                    }
                    if attempt >= self.config.max_retries {
                        if error.is_rate_limit() {
                            return Err(CoinbaseClientError::RateLimited { attempts: attempt });
                        }
                        return Err(error);
                    }
                    UPSTREAM_RETRIES.increment(1);
                    match class {
                        ErrorClass::Network => {
                            warn!(%url, attempt, %error, "Upstream request failed; retrying.");
                        }
                        _ => {
                            let backoff = Duration::from_secs(1_u64 << attempt.min(6));
                            warn!(
                                %url,
                                attempt,
                                backoff_secs = backoff.as_secs(),
                                %error,
                                "Upstream returned a retryable status; backing off."
                            );
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
        }
    }

    async fn try_get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
    ) -> CoinbaseClientResult<(T, Option<u64>)> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoinbaseClientError::Status { status, body });
        }
        let next_cursor = response
            .headers()
            .get(CURSOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let body = response.text().await?;
        let parsed = serde_json::from_str::<T>(&body)
            .map_err(|error| CoinbaseClientError::MalformedPayload(error.to_string()))?;
        Ok((parsed, next_cursor))
    }

    fn trades_url(
        &self,
        product_id: &str,
        limit: u64,
        after: Option<u64>,
    ) -> CoinbaseClientResult<Url> {
        let mut url = self
            .config
            .base_url
            .join(&format!("products/{product_id}/trades"))
            .map_err(|error| CoinbaseClientError::MalformedPayload(error.to_string()))?;
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        if let Some(after) = after {
            url.query_pairs_mut().append_pair("after", &after.to_string());
        }
        Ok(url)
    }
}

#[async_trait]
impl TradeSource for CoinbaseClient {
    async fn fetch_page(
        &self,
        product_id: &str,
        limit: u64,
        after: Option<u64>,
    ) -> CoinbaseClientResult<TradePage> {
        let url = self.trades_url(product_id, limit, after)?;
        let (trades, next_cursor) = self.get_json::<Vec<CoinbaseTrade>>(url).await?;
        debug!(product_id, ?after, count = trades.len(), ?next_cursor, "Fetched trade page.");
        Ok(TradePage { trades, next_cursor })
    }

    async fn latest_trade_id(&self, product_id: &str) -> CoinbaseClientResult<u64> {
        let page = self.fetch_page(product_id, 1, None).await?;
        page.trades
            .first()
            .map(|trade| trade.trade_id)
            .ok_or_else(|| CoinbaseClientError::EmptyFeed { product_id: product_id.to_owned() })
    }

    async fn list_products(&self) -> CoinbaseClientResult<Vec<String>> {
        #[derive(Deserialize)]
        struct Product {
            id: String,
        }
        let url = self
            .config
            .base_url
            .join("products")
            .map_err(|error| CoinbaseClientError::MalformedPayload(error.to_string()))?;
        let (products, _) = self.get_json::<Vec<Product>>(url).await?;
        let mut ids: Vec<String> = products.into_iter().map(|product| product.id).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
