use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use schemahub_storage::object_store::{InMemoryObjectStore, ObjectStore};
use schemahub_storage::query_service::{MockQueryService, QueryOutput};

use crate::dedupe::{DedupeConfig, DedupeEngine, DedupeError, DedupeStatus};
use crate::local_query::LocalQueryEngine;
use crate::unified::{parquet_to_records, records_to_parquet, UnifiedRecord};

const UNIFIED_PREFIX: &str = "schemahub/unified_trades";

fn record(trade_id: u64, hour: u32) -> UnifiedRecord {
    UnifiedRecord {
        exchange: "coinbase".to_owned(),
        symbol: "BTC-USD".to_owned(),
        trade_id: trade_id.to_string(),
        side: "buy".to_owned(),
        price: 50_000.0,
        quantity: 0.25,
        trade_ts: Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap(),
    }
}

struct Fixture {
    store: Arc<InMemoryObjectStore>,
    query: Arc<LocalQueryEngine>,
}

impl Fixture {
    fn new() -> Self {
        let store: Arc<InMemoryObjectStore> = Arc::new(InMemoryObjectStore::new());
        let query = Arc::new(LocalQueryEngine::new(store.clone()));
        query.register_table("unified_trades_v1", &format!("{UNIFIED_PREFIX}/v1/"));
        Self { store, query }
    }

    fn engine(&self) -> DedupeEngine {
        DedupeEngine::new(
            self.store.clone(),
            self.query.clone(),
            DedupeConfig { bucket: "test-bucket".to_owned(), ..Default::default() },
        )
    }

    async fn write_page(&self, name: &str, records: &[UnifiedRecord]) {
        let body = records_to_parquet(records).unwrap();
        self.store
            .put_object(&format!("{UNIFIED_PREFIX}/v1/{name}.parquet"), body)
            .await
            .unwrap();
    }

    async fn partition_records(&self) -> Vec<UnifiedRecord> {
        let mut records = Vec::new();
        for key in self.store.list_objects(&format!("{UNIFIED_PREFIX}/v1/")).await.unwrap() {
            let body = self.store.get_object(&key).await.unwrap().unwrap();
            records.extend(parquet_to_records(body).unwrap());
        }
        records
    }
}

#[tokio::test]
async fn unique_partition_is_skipped_without_a_rewrite() {
    let fixture = Fixture::new();
    fixture.write_page("page-a", &[record(1, 1), record(2, 1), record(3, 1)]).await;

    let outcome = fixture.engine().dedupe_version(1).await.unwrap();

    assert_eq!(outcome.status, DedupeStatus::Skipped);
    assert_eq!(outcome.records_before, 3);
    assert_eq!(outcome.records_after, 3);
    assert_eq!(outcome.duplicates_removed, 0);
    // Only the count probe ran.
    assert_eq!(fixture.query.executed_statements().len(), 1);
}

#[tokio::test]
async fn duplicated_partition_is_rewritten_in_place() {
    let fixture = Fixture::new();
    fixture.write_page("page-a", &[record(1, 1), record(2, 1)]).await;
    fixture.write_page("page-b", &[record(2, 1), record(3, 1)]).await;

    let outcome = fixture.engine().dedupe_version(1).await.unwrap();

    assert_eq!(outcome.status, DedupeStatus::Deduped);
    assert_eq!(outcome.records_before, 4);
    assert_eq!(outcome.records_after, 3);
    assert_eq!(outcome.duplicates_removed, 1);

    let mut ids: Vec<String> =
        fixture.partition_records().await.into_iter().map(|record| record.trade_id).collect();
    ids.sort();
    assert_eq!(ids, vec!["1", "2", "3"]);

    // The temp partition was cleaned up after the promotion.
    let temp_keys =
        fixture.store.list_objects(&format!("{UNIFIED_PREFIX}/v1_dedupe_temp/")).await.unwrap();
    assert!(temp_keys.is_empty(), "temp files left behind: {temp_keys:?}");
}

#[tokio::test]
async fn rewrite_keeps_the_newest_row_per_identity() {
    let fixture = Fixture::new();
    fixture.write_page("page-a", &[record(1, 1)]).await;
    fixture.write_page("page-b", &[record(1, 9), record(2, 2)]).await;

    let outcome = fixture.engine().dedupe_version(1).await.unwrap();
    assert_eq!(outcome.duplicates_removed, 1);

    let records = fixture.partition_records().await;
    let survivor = records.iter().find(|record| record.trade_id == "1").unwrap();
    assert_eq!(survivor.trade_ts, Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
}

#[tokio::test]
async fn malformed_count_result_is_an_error() {
    let store: Arc<InMemoryObjectStore> = Arc::new(InMemoryObjectStore::new());
    let mut query = MockQueryService::new();
    query
        .expect_execute()
        .returning(|_| Ok(QueryOutput { rows: vec![vec!["not a number".to_owned()]] }));
    let engine = DedupeEngine::new(
        store,
        Arc::new(query),
        DedupeConfig { bucket: "test-bucket".to_owned(), ..Default::default() },
    );

    let result = engine.dedupe_version(1).await;
    assert_matches!(result, Err(DedupeError::MalformedCounts(_)));
}
