use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use schemahub_storage::object_store::{ObjectStore, ObjectStoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::transform::TransformOutcome;
use crate::validation::BatchValidationMetrics;

pub const MANIFEST_KEY: &str = "schemahub/manifest.json";

/// Consecutive gate failures that mark the manifest for replay.
const REPLAY_FAILURE_THRESHOLD: u32 = 2;
/// Recent dup-trend entries inspected by the replay policy.
const REPLAY_DUP_TREND_WINDOW: usize = 5;
/// Duplicate ratio above which a trend entry triggers replay.
const REPLAY_DUP_RATIO: f64 = 0.05;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error("Manifest serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ManifestResult<T> = Result<T, ManifestError>;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ManifestHealth {
    #[serde(default)]
    pub last_successful_transform: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_validation_issues: Vec<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DupTrendEntry {
    pub timestamp: DateTime<Utc>,
    pub duplicates_found: u64,
    pub batch_size: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TransformHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub records_read: u64,
    pub records_transformed: u64,
    pub records_written: u64,
    pub status: String,
    pub output_version: u32,
    pub output_keys: Vec<String>,
    pub processed_raw_files_count: usize,
    pub quality_gate_passed: bool,
    pub validation_issues: Vec<String>,
    pub validation_metrics: serde_json::Value,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ProductStats {
    #[serde(default)]
    pub last_update_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_records: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ReplayEntry {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

fn default_version() -> u32 {
    1
}

/// Curation state for the unified dataset: which raw files were consumed,
/// what every transform run did, and the signals the replay policy watches.
/// Persisted as one JSON object under [`MANIFEST_KEY`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Manifest {
    #[serde(default)]
    pub processed_raw_files: BTreeSet<String>,
    #[serde(default)]
    pub product_stats: BTreeMap<String, ProductStats>,
    #[serde(default)]
    pub transform_history: Vec<TransformHistoryEntry>,
    #[serde(default)]
    pub health: ManifestHealth,
    #[serde(default)]
    pub dup_trends: Vec<DupTrendEntry>,
    #[serde(default = "default_version")]
    pub last_version: u32,
    #[serde(default)]
    pub last_update_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub replayed_versions: BTreeMap<String, Vec<ReplayEntry>>,
    #[serde(default, rename = "_replay_triggered")]
    pub replay_triggered: bool,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            processed_raw_files: BTreeSet::new(),
            product_stats: BTreeMap::new(),
            transform_history: Vec::new(),
            health: ManifestHealth::default(),
            dup_trends: Vec::new(),
            last_version: default_version(),
            last_update_ts: None,
            replayed_versions: BTreeMap::new(),
            replay_triggered: false,
        }
    }
}

impl Manifest {
    /// Loads the manifest, falling back to the default (which makes the next
    /// transform a rebuild) when it is absent or unreadable.
    pub async fn load(store: &Arc<dyn ObjectStore>, key: &str) -> Self {
        match store.get_object(key).await {
            Ok(Some(body)) => match serde_json::from_slice(&body) {
                Ok(manifest) => {
                    info!(key, "Manifest loaded.");
                    manifest
                }
                Err(parse_error) => {
                    warn!(key, %parse_error, "Malformed manifest; starting from a fresh one.");
                    Self::default()
                }
            },
            Ok(None) => {
                info!(key, "No manifest yet; starting from a fresh one.");
                Self::default()
            }
            Err(store_error) => {
                warn!(key, %store_error, "Manifest load failed; starting from a fresh one.");
                Self::default()
            }
        }
    }

    /// Persists the manifest in a single PUT.
    pub async fn save(&self, store: &Arc<dyn ObjectStore>, key: &str) -> ManifestResult<()> {
        let body = serde_json::to_vec_pretty(self)?;
        store.put_object(key, Bytes::from(body)).await?;
        info!(key, "Manifest saved.");
        Ok(())
    }

    /// Folds a finished transform run into the manifest: processed files,
    /// history, health counters, dup trends and per-product freshness.
    pub fn update_after_transform(
        &mut self,
        outcome: &TransformOutcome,
        batch_issues: &[String],
        batch_metrics: &BatchValidationMetrics,
        quality_gate_passed: bool,
        now: DateTime<Utc>,
    ) {
        self.processed_raw_files.extend(outcome.processed_files.iter().cloned());
        for (symbol, count) in &outcome.records_per_symbol {
            let stats = self.product_stats.entry(symbol.clone()).or_default();
            stats.last_update_ts = Some(now);
            stats.total_records += count;
        }

        self.transform_history.push(TransformHistoryEntry {
            timestamp: now,
            records_read: outcome.records_read,
            records_transformed: outcome.records_transformed,
            records_written: outcome.records_written,
            status: outcome.status.as_str().to_owned(),
            output_version: outcome.output_version,
            output_keys: outcome.output_keys.clone(),
            processed_raw_files_count: outcome.processed_files.len(),
            quality_gate_passed,
            validation_issues: batch_issues.to_vec(),
            validation_metrics: serde_json::to_value(batch_metrics)
                .unwrap_or(serde_json::Value::Null),
        });

        if quality_gate_passed {
            self.health.last_successful_transform = Some(now);
            self.health.last_validation_issues.clear();
            self.health.consecutive_failures = 0;
        } else {
            self.health.last_validation_issues = batch_issues.to_vec();
            self.health.consecutive_failures += 1;
            if self.health.consecutive_failures >= REPLAY_FAILURE_THRESHOLD {
                warn!(
                    consecutive_failures = self.health.consecutive_failures,
                    "Marking manifest for replay."
                );
                self.replay_triggered = true;
            }
        }

        self.dup_trends.push(DupTrendEntry {
            timestamp: now,
            duplicates_found: batch_metrics.duplicates_found,
            batch_size: batch_metrics.batch_records_checked,
        });
        self.last_update_ts = Some(now);
    }

    /// Returns the reason a replay should run, if any: the explicit flag,
    /// repeated gate failures, or a recent duplicate spike.
    pub fn should_trigger_replay(&self) -> Option<String> {
        if self.replay_triggered {
            return Some("Manifest replay flag set".to_owned());
        }
        if self.health.consecutive_failures >= REPLAY_FAILURE_THRESHOLD {
            return Some(format!(
                "Consecutive failures: {}",
                self.health.consecutive_failures
            ));
        }
        let recent = self.dup_trends.iter().rev().take(REPLAY_DUP_TREND_WINDOW);
        for entry in recent {
            if entry.batch_size == 0 {
                continue;
            }
            #[allow(clippy::as_conversions)]
            let ratio = entry.duplicates_found as f64 / entry.batch_size as f64;
            if ratio > REPLAY_DUP_RATIO {
                return Some(format!("High duplicate ratio: {:.1}%", ratio * 100.0));
            }
        }
        None
    }

    /// Alternates the output version so a replay writes beside the live
    /// partition instead of over it.
    pub fn next_version(&self) -> u32 {
        if self.last_version == 1 { 2 } else { 1 }
    }

    pub fn mark_replay(&mut self, old_version: u32, new_version: u32, reason: &str, now: DateTime<Utc>) {
        let key = format!("{old_version}_to_{new_version}");
        self.replayed_versions
            .entry(key)
            .or_default()
            .push(ReplayEntry { timestamp: now, reason: reason.to_owned() });
        self.replay_triggered = false;
        info!(old_version, new_version, reason, "Replay marked.");
    }
}
