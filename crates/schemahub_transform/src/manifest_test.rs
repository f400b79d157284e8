use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use schemahub_storage::object_store::{InMemoryObjectStore, ObjectStore};

use crate::dedupe::{DedupeOutcome, DedupeStatus};
use crate::manifest::{DupTrendEntry, Manifest, MANIFEST_KEY};
use crate::transform::{TransformOutcome, TransformStatus};
use crate::validation::BatchValidationMetrics;

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn outcome(files: &[&str]) -> TransformOutcome {
    TransformOutcome {
        status: TransformStatus::Success,
        records_read: 100,
        records_transformed: 98,
        records_written: 98,
        output_version: 1,
        output_keys: vec!["schemahub/unified_trades/v1/page.parquet".to_owned()],
        processed_files: files.iter().map(|file| (*file).to_owned()).collect(),
        records_per_symbol: BTreeMap::from([("BTC-USD".to_owned(), 98_u64)]),
        dedupe: DedupeOutcome {
            status: DedupeStatus::Skipped,
            records_before: 98,
            records_after: 98,
            duplicates_removed: 0,
        },
    }
}

fn metrics(duplicates: u64, checked: u64) -> BatchValidationMetrics {
    BatchValidationMetrics {
        batch_records_checked: checked,
        duplicates_found: duplicates,
        ..Default::default()
    }
}

fn object_store() -> Arc<dyn ObjectStore> {
    Arc::new(InMemoryObjectStore::new())
}

#[tokio::test]
async fn absent_manifest_loads_as_default() {
    let store = object_store();
    let manifest = Manifest::load(&store, MANIFEST_KEY).await;
    assert_eq!(manifest, Manifest::default());
    assert_eq!(manifest.last_version, 1);
}

#[tokio::test]
async fn malformed_manifest_loads_as_default() {
    let store = object_store();
    store.put_object(MANIFEST_KEY, Bytes::from_static(b"{broken")).await.unwrap();
    assert_eq!(Manifest::load(&store, MANIFEST_KEY).await, Manifest::default());
}

#[tokio::test]
async fn save_then_load_round_trips() {
    let store = object_store();
    let mut manifest = Manifest::default();
    manifest.update_after_transform(&outcome(&["raw/a.jsonl"]), &[], &metrics(0, 98), true, now());
    manifest.save(&store, MANIFEST_KEY).await.unwrap();

    let loaded = Manifest::load(&store, MANIFEST_KEY).await;
    assert_eq!(loaded, manifest);
}

#[test]
fn passing_gate_clears_health_and_records_history() {
    let mut manifest = Manifest::default();
    manifest.health.consecutive_failures = 1;
    manifest.health.last_validation_issues = vec!["old issue".to_owned()];

    manifest.update_after_transform(
        &outcome(&["raw/a.jsonl", "raw/b.jsonl"]),
        &[],
        &metrics(0, 98),
        true,
        now(),
    );

    assert_eq!(manifest.health.consecutive_failures, 0);
    assert!(manifest.health.last_validation_issues.is_empty());
    assert_eq!(manifest.health.last_successful_transform, Some(now()));
    assert_eq!(manifest.transform_history.len(), 1);
    assert!(manifest.transform_history[0].quality_gate_passed);
    assert_eq!(manifest.processed_raw_files.len(), 2);
    assert_eq!(manifest.dup_trends.len(), 1);
    assert_eq!(manifest.last_update_ts, Some(now()));
    assert_eq!(manifest.product_stats["BTC-USD"].total_records, 98);
}

#[test]
fn processed_files_are_deduplicated_into_the_set() {
    let mut manifest = Manifest::default();
    manifest.update_after_transform(&outcome(&["raw/a.jsonl"]), &[], &metrics(0, 98), true, now());
    manifest.update_after_transform(
        &outcome(&["raw/a.jsonl", "raw/b.jsonl"]),
        &[],
        &metrics(0, 98),
        true,
        now(),
    );
    assert_eq!(manifest.processed_raw_files.len(), 2);
}

#[test]
fn two_consecutive_failures_mark_the_manifest_for_replay() {
    let mut manifest = Manifest::default();
    let issues = vec!["Missing required columns: [\"trade_ts\"]".to_owned()];

    manifest.update_after_transform(&outcome(&[]), &issues, &metrics(0, 98), false, now());
    assert_eq!(manifest.health.consecutive_failures, 1);
    assert!(!manifest.replay_triggered);
    assert_eq!(manifest.should_trigger_replay(), None);

    manifest.update_after_transform(&outcome(&[]), &issues, &metrics(0, 98), false, now());
    assert_eq!(manifest.health.consecutive_failures, 2);
    assert!(manifest.replay_triggered);
    assert_eq!(manifest.health.last_validation_issues, issues);
    assert!(manifest.should_trigger_replay().is_some());
}

#[test]
fn duplicate_spike_in_recent_trends_triggers_replay() {
    let mut manifest = Manifest::default();
    manifest.update_after_transform(&outcome(&[]), &[], &metrics(10, 100), true, now());

    let reason = manifest.should_trigger_replay().unwrap();
    assert!(reason.contains("duplicate ratio"), "unexpected reason: {reason}");
}

#[test]
fn old_duplicate_spikes_age_out_of_the_replay_window() {
    let mut manifest = Manifest::default();
    manifest.dup_trends.push(DupTrendEntry {
        timestamp: now(),
        duplicates_found: 50,
        batch_size: 100,
    });
    for _ in 0..5 {
        manifest.dup_trends.push(DupTrendEntry {
            timestamp: now(),
            duplicates_found: 0,
            batch_size: 100,
        });
    }
    assert_eq!(manifest.should_trigger_replay(), None);
}

#[test]
fn version_toggles_between_one_and_two() {
    let mut manifest = Manifest::default();
    assert_eq!(manifest.next_version(), 2);
    manifest.last_version = 2;
    assert_eq!(manifest.next_version(), 1);
}

#[test]
fn mark_replay_appends_history_and_clears_the_flag() {
    let mut manifest = Manifest::default();
    manifest.replay_triggered = true;

    manifest.mark_replay(1, 2, "Consecutive failures: 2", now());

    assert!(!manifest.replay_triggered);
    let entries = &manifest.replayed_versions["1_to_2"];
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, "Consecutive failures: 2");

    manifest.mark_replay(1, 2, "again", now());
    assert_eq!(manifest.replayed_versions["1_to_2"].len(), 2);
}
