use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{Duration as ChronoDuration, SecondsFormat};
use schemahub_storage::kv_store::{KeyValueStore, KvItem, KvKey, KvStoreError, WriteCondition};
use schemahub_time::Clock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::types::{CircuitState, UpstreamHealth};

const DEFAULT_TABLE: &str = "schemahub-exchange-health";
pub const ROLLING_WINDOW_SIZE: usize = 100;
const HEALTH_TTL_DAYS: i64 = 7;

/// Sort key of the authoritative row. Sorts after RFC3339 history rows, so
/// `query_latest` also lands on it.
const STATE_SORT_KEY: &str = "state";

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct HealthTrackerConfig {
    pub table: String,
    pub enabled: bool,
}

impl Default for HealthTrackerConfig {
    fn default() -> Self {
        Self { table: DEFAULT_TABLE.to_owned(), enabled: true }
    }
}

/// Persists per-upstream health rows and keeps the in-process rolling outcome
/// window. Aggregate writes are last-writer-wins; only circuit-state
/// transitions go through a CAS.
pub struct HealthTracker {
    kv: Arc<dyn KeyValueStore>,
    config: HealthTrackerConfig,
    clock: Arc<dyn Clock>,
    windows: StdMutex<HashMap<String, VecDeque<bool>>>,
}

impl HealthTracker {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        config: HealthTrackerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { kv, config, clock, windows: StdMutex::new(HashMap::new()) }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Reads the authoritative health row, defaulting to a fresh healthy
    /// state when tracking is disabled, the row is absent, or the store
    /// errors (an unreachable health table must not stop ingestion).
    pub async fn get_health(&self, upstream: &str) -> UpstreamHealth {
        if !self.config.enabled {
            return UpstreamHealth::new_healthy(upstream, self.clock.now_utc());
        }
        let key = KvKey::sorted(upstream, STATE_SORT_KEY);
        match self.kv.get_item(&self.config.table, key).await {
            Ok(Some(item)) => match serde_json::from_value(serde_json::Value::Object(item)) {
                Ok(health) => health,
                Err(parse_error) => {
                    warn!(upstream, %parse_error, "Malformed health row; starting healthy.");
                    UpstreamHealth::new_healthy(upstream, self.clock.now_utc())
                }
            },
            Ok(None) => {
                debug!(upstream, "No health record; initializing healthy state.");
                UpstreamHealth::new_healthy(upstream, self.clock.now_utc())
            }
            Err(store_error) => {
                error!(upstream, %store_error, "Failed to read health state; assuming healthy.");
                UpstreamHealth::new_healthy(upstream, self.clock.now_utc())
            }
        }
    }

    /// Writes the aggregate: the state row is replaced and a timestamped
    /// history row is appended. Store failures are logged, not propagated.
    pub async fn update_health(&self, health: &mut UpstreamHealth) {
        if !self.config.enabled {
            return;
        }
        let now = self.clock.now_utc();
        health.timestamp = now;
        health.ttl = (now + ChronoDuration::days(HEALTH_TTL_DAYS)).timestamp();

        let item = match health_item(health) {
            Ok(item) => item,
            Err(serialization_error) => {
                error!(upstream = health.upstream, %serialization_error, "Health row serialization failed.");
                return;
            }
        };

        let upstream = health.upstream.clone();
        let state_key = KvKey::sorted(&upstream, STATE_SORT_KEY);
        if let Err(store_error) =
            self.kv.put_item(&self.config.table, state_key, item.clone(), None).await
        {
            error!(upstream, %store_error, "Failed to persist health state row.");
            return;
        }
        let history_key =
            KvKey::sorted(&upstream, now.to_rfc3339_opts(SecondsFormat::Micros, true));
        if let Err(store_error) =
            self.kv.put_item(&self.config.table, history_key, item, None).await
        {
            warn!(upstream, %store_error, "Failed to append health history row.");
        }
    }

    /// Atomically moves the circuit from `expected` to `new`. Exactly one of
    /// any set of concurrent callers wins; everyone else gets `false`.
    pub async fn conditional_transition(
        &self,
        upstream: &str,
        expected: CircuitState,
        new: CircuitState,
    ) -> bool {
        if !self.config.enabled {
            return true;
        }
        let now = self.clock.now_utc();
        let mut updates = KvItem::new();
        updates.insert("circuit_state".to_owned(), json!(new));
        updates.insert("timestamp".to_owned(), json!(now));
        updates
            .insert("ttl".to_owned(), json!((now + ChronoDuration::days(HEALTH_TTL_DAYS)).timestamp()));

        let state_key = KvKey::sorted(upstream, STATE_SORT_KEY);
        let condition = WriteCondition::FieldEquals {
            field: "circuit_state".to_owned(),
            expected: json!(expected),
        };
        match self.kv.update_item(&self.config.table, state_key, updates, Some(condition)).await {
            Ok(()) => {
                info!(upstream, from = %expected, to = %new, "Circuit transitioned.");
                // Record the transition in the history series as well.
                let mut health = self.get_health(upstream).await;
                let history_key =
                    KvKey::sorted(upstream, now.to_rfc3339_opts(SecondsFormat::Micros, true));
                health.circuit_state = new;
                if let Ok(item) = health_item(&health) {
                    if let Err(store_error) =
                        self.kv.put_item(&self.config.table, history_key, item, None).await
                    {
                        warn!(upstream, %store_error, "Failed to append transition history row.");
                    }
                }
                true
            }
            Err(KvStoreError::ConditionFailed { .. }) => {
                debug!(upstream, from = %expected, to = %new, "Lost the transition race.");
                false
            }
            Err(store_error) => {
                error!(upstream, %store_error, "Conditional transition failed.");
                false
            }
        }
    }

    /// Pushes an outcome into the upstream's rolling window and returns the
    /// recomputed error rate over the last `ROLLING_WINDOW_SIZE` requests.
    pub fn observe(&self, upstream: &str, success: bool) -> f64 {
        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(upstream.to_owned()).or_default();
        window.push_back(success);
        if window.len() > ROLLING_WINDOW_SIZE {
            window.pop_front();
        }
        let failures = window.iter().filter(|outcome| !**outcome).count();
        #[allow(clippy::as_conversions)]
        let error_rate = failures as f64 / window.len() as f64;
        error_rate
    }
}

fn health_item(health: &UpstreamHealth) -> Result<KvItem, serde_json::Error> {
    match serde_json::to_value(health)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => unreachable!("UpstreamHealth serializes to an object"),
    }
}
