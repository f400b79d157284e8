use std::sync::Arc;

use pretty_assertions::assert_eq;
use schemahub_storage::kv_store::{InMemoryKeyValueStore, KeyValueStore, KvKey};
use schemahub_time::test_utils::FakeClock;
use schemahub_time::Clock;

use crate::tracker::{HealthTracker, HealthTrackerConfig, ROLLING_WINDOW_SIZE};
use crate::types::{CircuitState, HealthStatus, UpstreamHealth};

const UPSTREAM: &str = "coinbase";

fn tracker_with(kv: Arc<InMemoryKeyValueStore>, clock: Arc<FakeClock>) -> HealthTracker {
    HealthTracker::new(kv, HealthTrackerConfig::default(), clock)
}

#[tokio::test]
async fn absent_record_reads_as_healthy() {
    let tracker =
        tracker_with(Arc::new(InMemoryKeyValueStore::new()), Arc::new(FakeClock::default()));
    let health = tracker.get_health(UPSTREAM).await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.circuit_state, CircuitState::Closed);
    assert_eq!(health.request_count, 0);
}

#[tokio::test]
async fn disabled_tracker_skips_persistence() {
    let kv = Arc::new(InMemoryKeyValueStore::new());
    let tracker = HealthTracker::new(
        kv.clone(),
        HealthTrackerConfig { enabled: false, ..Default::default() },
        Arc::new(FakeClock::default()),
    );

    let mut health = tracker.get_health(UPSTREAM).await;
    health.consecutive_failures = 3;
    tracker.update_health(&mut health).await;

    assert_eq!(kv.query_latest(&HealthTrackerConfig::default().table, UPSTREAM).await.unwrap(), None);
}

#[tokio::test]
async fn update_writes_state_and_history_rows() {
    let kv = Arc::new(InMemoryKeyValueStore::new());
    let clock = Arc::new(FakeClock::default());
    let tracker = tracker_with(kv.clone(), clock.clone());
    let table = HealthTrackerConfig::default().table;

    let mut health = tracker.get_health(UPSTREAM).await;
    health.request_count = 7;
    tracker.update_health(&mut health).await;

    // TTL is stamped 7 days out.
    let expected_ttl = clock.now_utc().timestamp() + 7 * 24 * 3600;
    assert_eq!(health.ttl, expected_ttl);

    let state_row =
        kv.get_item(&table, KvKey::sorted(UPSTREAM, "state")).await.unwrap().unwrap();
    assert_eq!(state_row.get("request_count"), Some(&serde_json::json!(7)));

    // The latest row is the authoritative state row; a history row exists too.
    let latest = kv.query_latest(&table, UPSTREAM).await.unwrap().unwrap();
    assert_eq!(latest, state_row);

    let round_tripped = tracker.get_health(UPSTREAM).await;
    assert_eq!(round_tripped.request_count, 7);
}

#[tokio::test]
async fn conditional_transition_admits_exactly_one_winner() {
    let kv = Arc::new(InMemoryKeyValueStore::new());
    let tracker = tracker_with(kv, Arc::new(FakeClock::default()));

    let mut health = tracker.get_health(UPSTREAM).await;
    health.circuit_state = CircuitState::Open;
    tracker.update_health(&mut health).await;

    assert!(tracker.conditional_transition(UPSTREAM, CircuitState::Open, CircuitState::HalfOpen).await);
    // The state has moved on; a second identical transition loses.
    assert!(
        !tracker
            .conditional_transition(UPSTREAM, CircuitState::Open, CircuitState::HalfOpen)
            .await
    );
    assert_eq!(tracker.get_health(UPSTREAM).await.circuit_state, CircuitState::HalfOpen);
}

#[tokio::test]
async fn transition_on_a_missing_row_fails() {
    let tracker =
        tracker_with(Arc::new(InMemoryKeyValueStore::new()), Arc::new(FakeClock::default()));
    assert!(
        !tracker
            .conditional_transition(UPSTREAM, CircuitState::Open, CircuitState::HalfOpen)
            .await
    );
}

#[test]
fn rolling_window_caps_and_recomputes_error_rate() {
    let tracker = tracker_with(
        Arc::new(InMemoryKeyValueStore::new()),
        Arc::new(FakeClock::default()),
    );

    assert_eq!(tracker.observe(UPSTREAM, false), 1.0);
    assert_eq!(tracker.observe(UPSTREAM, true), 0.5);

    // Fill the window with successes; the single failure eventually ages out.
    for _ in 0..ROLLING_WINDOW_SIZE {
        tracker.observe(UPSTREAM, true);
    }
    assert_eq!(tracker.observe(UPSTREAM, true), 0.0);
}

#[test]
fn windows_are_per_upstream() {
    let tracker = tracker_with(
        Arc::new(InMemoryKeyValueStore::new()),
        Arc::new(FakeClock::default()),
    );
    assert_eq!(tracker.observe("coinbase", false), 1.0);
    assert_eq!(tracker.observe("coinbase_auth", true), 0.0);
}

#[tokio::test]
async fn malformed_state_row_reads_as_healthy() {
    let kv = Arc::new(InMemoryKeyValueStore::new());
    let table = HealthTrackerConfig::default().table;
    let mut bad_row = serde_json::Map::new();
    bad_row.insert("circuit_state".to_owned(), serde_json::json!("melted"));
    kv.put_item(&table, KvKey::sorted(UPSTREAM, "state"), bad_row, None).await.unwrap();

    let tracker = tracker_with(kv, Arc::new(FakeClock::default()));
    let health = tracker.get_health(UPSTREAM).await;
    assert_eq!(health, UpstreamHealth::new_healthy(UPSTREAM, health.timestamp));
}
