use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use schemahub_storage::kv_store::{InMemoryKeyValueStore, KeyValueStore, KvKey};
use schemahub_time::test_utils::FakeClock;
use serde_json::json;

use crate::lock_manager::{LockManager, LockManagerConfig};

const INGEST_LOCK: &str = "ingest";

struct Fixture {
    kv: Arc<InMemoryKeyValueStore>,
    clock: Arc<FakeClock>,
    config: LockManagerConfig,
}

impl Fixture {
    fn new() -> Self {
        Self {
            kv: Arc::new(InMemoryKeyValueStore::new()),
            clock: Arc::new(FakeClock::default()),
            config: LockManagerConfig::default(),
        }
    }

    fn manager(&self) -> LockManager {
        LockManager::new(self.kv.clone(), self.config.clone(), self.clock.clone())
    }

    async fn stored_lock_id(&self) -> String {
        let item = self
            .kv
            .get_item(&self.config.table, KvKey::partition(INGEST_LOCK))
            .await
            .unwrap()
            .unwrap();
        item.get("lock_id").unwrap().as_str().unwrap().to_owned()
    }
}

#[tokio::test]
async fn second_holder_is_rejected_while_lease_is_live() {
    let fixture = Fixture::new();
    let first = fixture.manager();
    let second = fixture.manager();

    assert!(first.acquire(INGEST_LOCK, false, Duration::ZERO).await.unwrap());
    assert!(!second.acquire(INGEST_LOCK, false, Duration::ZERO).await.unwrap());
    assert!(first.holds(INGEST_LOCK));
    assert!(!second.holds(INGEST_LOCK));
}

#[tokio::test]
async fn expired_lease_is_stolen_by_the_next_acquirer() {
    let fixture = Fixture::new();
    let first = fixture.manager();
    let second = fixture.manager();

    assert!(first.acquire(INGEST_LOCK, false, Duration::ZERO).await.unwrap());
    let original_holder = fixture.stored_lock_id().await;

    fixture.clock.advance(fixture.config.ttl + Duration::from_secs(1));
    assert!(second.acquire(INGEST_LOCK, false, Duration::ZERO).await.unwrap());

    assert!(second.holds(INGEST_LOCK));
    assert_ne!(fixture.stored_lock_id().await, original_holder);
}

#[tokio::test]
async fn concurrent_steal_has_one_winner() {
    let fixture = Fixture::new();
    let first = fixture.manager();
    assert!(first.acquire(INGEST_LOCK, false, Duration::ZERO).await.unwrap());
    fixture.clock.advance(fixture.config.ttl + Duration::from_secs(1));

    let second = fixture.manager();
    let third = fixture.manager();
    // Both observe the same expired row; the CAS admits exactly one.
    let (second_won, third_won) =
        tokio::join!(second.steal(INGEST_LOCK), third.steal(INGEST_LOCK));
    let winners =
        [second_won.unwrap(), third_won.unwrap()].iter().filter(|won| **won).count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn release_makes_the_lease_available_again() {
    let fixture = Fixture::new();
    let first = fixture.manager();
    let second = fixture.manager();

    assert!(first.acquire(INGEST_LOCK, false, Duration::ZERO).await.unwrap());
    first.release(INGEST_LOCK).await.unwrap();
    assert!(!first.holds(INGEST_LOCK));

    assert!(second.acquire(INGEST_LOCK, false, Duration::ZERO).await.unwrap());
}

#[tokio::test]
async fn releasing_an_unheld_lease_is_a_no_op() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    manager.release(INGEST_LOCK).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn renewal_extends_the_lease() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    assert!(manager.acquire(INGEST_LOCK, false, Duration::ZERO).await.unwrap());

    tokio::time::advance(fixture.config.ttl / 2 + Duration::from_secs(1)).await;
    // Let the renewal task run its tick.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    let item = fixture
        .kv
        .get_item(&fixture.config.table, KvKey::partition(INGEST_LOCK))
        .await
        .unwrap()
        .unwrap();
    assert!(item.get("renewed_at").is_some(), "renewal never ran: {item:?}");
    assert!(manager.holds(INGEST_LOCK));
}

#[tokio::test(start_paused = true)]
async fn lost_lease_drops_the_local_hold() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    assert!(manager.acquire(INGEST_LOCK, false, Duration::ZERO).await.unwrap());

    // Another process took the row over out from under us.
    let mut hijacked = serde_json::Map::new();
    hijacked.insert("lock_id".to_owned(), json!("someone-else"));
    hijacked.insert("ttl".to_owned(), json!(i64::MAX));
    fixture
        .kv
        .put_item(&fixture.config.table, KvKey::partition(INGEST_LOCK), hijacked, None)
        .await
        .unwrap();

    tokio::time::advance(fixture.config.ttl / 2 + Duration::from_secs(1)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert!(!manager.holds(INGEST_LOCK));
    assert_eq!(fixture.stored_lock_id().await, "someone-else");
}

#[tokio::test]
async fn release_all_clears_every_held_lease() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    assert!(manager.acquire("ingest", false, Duration::ZERO).await.unwrap());
    assert!(manager.acquire("transform", false, Duration::ZERO).await.unwrap());

    manager.release_all().await.unwrap();

    assert!(!manager.holds("ingest"));
    assert!(!manager.holds("transform"));
    for name in ["ingest", "transform"] {
        let row =
            fixture.kv.get_item(&fixture.config.table, KvKey::partition(name)).await.unwrap();
        assert_eq!(row, None);
    }
}
