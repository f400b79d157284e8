use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use schemahub_ingest::controller::RunStatus;
use schemahub_node::config::NodeConfig;
use schemahub_node::runner::{NodeError, Pipeline};
use schemahub_storage::checkpoint::CheckpointMode;
use schemahub_storage::kv_store::InMemoryKeyValueStore;
use schemahub_storage::object_store::{InMemoryObjectStore, ObjectStore};
use schemahub_test_utils::FakeExchange;
use schemahub_time::test_utils::FakeClock;
use schemahub_transform::manifest::{Manifest, MANIFEST_KEY};
use schemahub_transform::unified::parquet_to_records;
use schemahub_transform::LocalQueryEngine;
use tokio_util::sync::CancellationToken;

const UNIFIED_PREFIX: &str = "schemahub/unified_trades";

struct Fixture {
    exchange: Arc<FakeExchange>,
    objects: Arc<InMemoryObjectStore>,
    pipeline: Pipeline,
}

impl Fixture {
    fn new() -> Self {
        let exchange = Arc::new(FakeExchange::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let kv = Arc::new(InMemoryKeyValueStore::new());
        // Pinned well after the fake trades' execution times, so full scans
        // deterministically see stale data.
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()));
        let query = LocalQueryEngine::new(objects.clone());
        for version in [1, 2] {
            query.register_table(
                &format!("unified_trades_v{version}"),
                &format!("{UNIFIED_PREFIX}/v{version}/"),
            );
        }
        let config = NodeConfig::from_env_with_bucket("test-bucket".to_owned());
        let pipeline = Pipeline::with_backends(
            config,
            objects.clone(),
            kv,
            Arc::new(query),
            exchange.clone(),
            clock,
            CancellationToken::new(),
        );
        Self { exchange, objects, pipeline }
    }

    async fn run_ingest(&self) -> schemahub_ingest::controller::RunSummary {
        let ingest_config = self.pipeline.config.ingest.clone();
        self.pipeline
            .run_ingest(CheckpointMode::Ingest, vec!["BTC-USD".to_owned()], ingest_config)
            .await
            .unwrap()
    }

    async fn unified_records(&self, version: u32) -> Vec<schemahub_transform::UnifiedRecord> {
        let mut records = Vec::new();
        for key in
            self.objects.list_objects(&format!("{UNIFIED_PREFIX}/v{version}/")).await.unwrap()
        {
            let body = self.objects.get_object(&key).await.unwrap().unwrap();
            records.extend(parquet_to_records(body).unwrap());
        }
        records
    }

    async fn manifest(&self) -> Manifest {
        let store: Arc<dyn ObjectStore> = self.objects.clone();
        Manifest::load(&store, MANIFEST_KEY).await
    }
}

#[tokio::test]
async fn ingest_then_transform_produces_a_unique_unified_dataset() {
    let fixture = Fixture::new();
    fixture.exchange.seed_product("BTC-USD", 1999);

    let ingest_summary = fixture.run_ingest().await;
    assert_eq!(ingest_summary.status, RunStatus::Success);
    assert_eq!(ingest_summary.records_written, 1999);

    let report = fixture.pipeline.run_transform(false, false).await.unwrap();
    assert!(report.gate_passed, "gate failures: {:?}", report.gate_failures);
    assert_eq!(report.summary.status, RunStatus::Success);
    assert_eq!(report.summary.pipeline, "coinbase_transform");
    assert_eq!(report.outcome.records_read, 1999);
    assert_eq!(report.output_version, 1);

    // Raw -> unified -> dedupe: one row per distinct raw trade id.
    let records = fixture.unified_records(1).await;
    assert_eq!(records.len(), 1999);
    let unique: std::collections::HashSet<&str> =
        records.iter().map(|record| record.trade_id.as_str()).collect();
    assert_eq!(unique.len(), records.len());

    // Every transformed raw file is tracked by the manifest.
    let manifest = fixture.manifest().await;
    let raw_keys = fixture
        .objects
        .list_objects("schemahub/raw_coinbase_trades/raw_")
        .await
        .unwrap();
    assert_eq!(raw_keys.len(), 2);
    for key in raw_keys {
        assert!(manifest.processed_raw_files.contains(&key), "manifest missing {key}");
    }
    assert_eq!(manifest.health.consecutive_failures, 0);
}

#[tokio::test]
async fn repeated_runs_are_idempotent() {
    let fixture = Fixture::new();
    fixture.exchange.seed_product("BTC-USD", 1999);

    fixture.run_ingest().await;
    fixture.pipeline.run_transform(false, false).await.unwrap();

    // Caught up: no new raw pages.
    let second_ingest = fixture.run_ingest().await;
    assert_eq!(second_ingest.records_written, 0);

    // Nothing new to transform.
    let second_transform = fixture.pipeline.run_transform(false, false).await.unwrap();
    assert_eq!(second_transform.outcome.records_read, 0);
    assert_eq!(fixture.unified_records(1).await.len(), 1999);
}

#[tokio::test]
async fn repeated_quality_failures_replay_into_the_alternate_version() {
    let fixture = Fixture::new();
    fixture.exchange.seed_product("BTC-USD", 100);
    fixture.run_ingest().await;

    // The fixture clock is a month past the trades, so a full scan fails the
    // freshness gate.
    let first = fixture.pipeline.run_transform(false, true).await.unwrap();
    assert!(!first.gate_passed);
    assert_eq!(first.summary.status, RunStatus::PartialFailure);
    assert!(first.gate_failures.iter().any(|reason| reason.starts_with("FRESHNESS:")));
    assert_eq!(fixture.manifest().await.health.consecutive_failures, 1);

    let second = fixture.pipeline.run_transform(false, true).await.unwrap();
    assert!(!second.gate_passed);
    let manifest = fixture.manifest().await;
    assert_eq!(manifest.health.consecutive_failures, 2);
    assert!(manifest.should_trigger_replay().is_some());
    assert_eq!(manifest.last_version, 1);

    let v1_keys = fixture.objects.list_objects(&format!("{UNIFIED_PREFIX}/v1/")).await.unwrap();

    // The next run replays everything into v2, leaving v1 untouched.
    let replay = fixture.pipeline.run_transform(false, false).await.unwrap();
    assert_eq!(replay.output_version, 2);
    assert_eq!(replay.outcome.records_read, 100);
    assert_eq!(fixture.unified_records(2).await.len(), 100);
    assert_eq!(
        fixture.objects.list_objects(&format!("{UNIFIED_PREFIX}/v1/")).await.unwrap(),
        v1_keys
    );

    let manifest = fixture.manifest().await;
    assert_eq!(manifest.last_version, 2);
    assert_eq!(manifest.replayed_versions["1_to_2"].len(), 1);
    assert!(!manifest.replay_triggered);
}

#[tokio::test]
async fn transform_lock_contention_is_a_usage_error() {
    let fixture = Fixture::new();
    assert!(fixture
        .pipeline
        .locks
        .acquire("transform", false, Duration::ZERO)
        .await
        .unwrap());

    let result = fixture.pipeline.run_transform(false, false).await;
    assert_matches!(result, Err(NodeError::Usage(message)) if message.contains("transform"));
}

#[tokio::test]
async fn update_seed_writes_and_merges_the_product_universe() {
    let fixture = Fixture::new();
    fixture.exchange.seed_product("BTC-USD", 5);
    fixture.exchange.seed_product("ETH-USD", 5);
    fixture.exchange.seed_product("SOL-EUR", 5);

    let dir = tempfile::tempdir().unwrap();
    let seed_path = dir.path().join("product_ids_seed.yaml");

    let seed = fixture
        .pipeline
        .run_update_seed(Some(&seed_path), false, Some(".*-USD"), false)
        .await
        .unwrap();
    assert_eq!(seed.products, vec!["BTC-USD", "ETH-USD"]);

    // Merging keeps prior entries alongside newly filtered ones.
    let merged = fixture
        .pipeline
        .run_update_seed(Some(&seed_path), true, Some(".*-EUR"), false)
        .await
        .unwrap();
    assert_eq!(merged.products, vec!["BTC-USD", "ETH-USD", "SOL-EUR"]);

    let on_disk = schemahub_ingest::seeds::load_seed(&seed_path).unwrap();
    assert_eq!(on_disk.products, merged.products);
}

#[tokio::test]
async fn cancellation_releases_every_held_lease() {
    let fixture = Fixture::new();
    assert!(fixture.pipeline.locks.acquire("ingest", false, Duration::ZERO).await.unwrap());
    fixture.pipeline.cancel.cancel();

    fixture.pipeline.shutdown().await;
    assert!(!fixture.pipeline.locks.holds("ingest"));
}
