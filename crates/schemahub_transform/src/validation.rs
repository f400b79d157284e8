use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use schemahub_storage::object_store::ObjectStore;
use schemahub_time::Clock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::manifest::Manifest;
use crate::unified::{parquet_column_names, parquet_to_records, UnifiedRecord, UNIFIED_COLUMNS};

/// Products with no data newer than this are flagged as stale.
const STALE_PRODUCT_THRESHOLD_SECS: i64 = 2 * 3600;
/// Full-scan freshness warning threshold.
const FRESHNESS_WARNING_SECS: i64 = 3600;
/// Trade gaps longer than this are reported per product.
const GAP_WARNING_MINUTES: f64 = 60.0;
/// More than this many gap-affected products escalates to an issue.
const GAP_PRODUCT_LIMIT: usize = 3;
/// More than this many stale products escalates to an issue.
const STALE_PRODUCT_LIMIT: usize = 5;
/// Batch duplicate percentage above which the gate fails.
const DUPLICATE_GATE_PERCENT: f64 = 5.0;
/// Full-scan data age above which the gate fails.
const FRESHNESS_GATE_HOURS: f64 = 4.0;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct BatchValidationMetrics {
    pub batch_records_checked: u64,
    pub duplicates_found: u64,
    pub schema_errors: u32,
    pub stale_products: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DateRange {
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub age_hours: Option<f64>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FullScanMetrics {
    pub total_records: u64,
    pub unique_trade_ids: u64,
    pub duplicates_found: u64,
    pub date_range: DateRange,
    pub max_gap_minutes: f64,
    pub gap_issues: Vec<String>,
    pub stale_products: Vec<String>,
    pub products: Vec<String>,
}

/// Data-quality checks over the curated dataset: a fast per-batch pass on
/// the newest page and a daily full scan of a version partition.
pub struct Validator {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
}

impl Validator {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Validates the latest columnar page: schema completeness, duplicates,
    /// numeric sanity, the side enum, and manifest-driven product staleness.
    /// Staleness is informational; the rest can fail the gate.
    pub async fn validate_batch(
        &self,
        latest_key: Option<&str>,
        manifest: Option<&Manifest>,
    ) -> (Vec<String>, BatchValidationMetrics) {
        let mut issues = Vec::new();
        let mut metrics = BatchValidationMetrics::default();

        let Some(latest_key) = latest_key else {
            warn!("No columnar page to validate.");
            issues.push("No latest columnar page to validate".to_owned());
            return (issues, metrics);
        };

        let body = match self.store.get_object(latest_key).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                issues.push(format!("Validation error: page '{latest_key}' not found"));
                return (issues, metrics);
            }
            Err(store_error) => {
                issues.push(format!("Validation error: {store_error}"));
                return (issues, metrics);
            }
        };
        let column_names = match parquet_column_names(body.clone()) {
            Ok(column_names) => column_names,
            Err(codec_error) => {
                issues.push(format!("Validation error: {codec_error}"));
                return (issues, metrics);
            }
        };
        let required: HashSet<&str> = UNIFIED_COLUMNS.into_iter().collect();
        let present: HashSet<&str> = column_names.iter().map(String::as_str).collect();
        let mut missing: Vec<&&str> = required.difference(&present).collect();
        if !missing.is_empty() {
            missing.sort();
            metrics.schema_errors += 1;
            issues.push(format!("Missing required columns: {missing:?}"));
            return (issues, metrics);
        }
        let records = match parquet_to_records(body) {
            Ok(records) => records,
            Err(codec_error) => {
                issues.push(format!("Validation error: {codec_error}"));
                return (issues, metrics);
            }
        };

        metrics.batch_records_checked = as_u64(records.len());

        let unique_trade_ids: HashSet<&str> =
            records.iter().map(|record| record.trade_id.as_str()).collect();
        let duplicates = as_u64(records.len() - unique_trade_ids.len());
        if duplicates > 0 {
            metrics.duplicates_found = duplicates;
            issues.push(format!("Found {duplicates} duplicate trade_ids in batch"));
        }

        let bad_prices = records.iter().filter(|record| record.price <= 0.0).count();
        if bad_prices > 0 {
            issues.push(format!("Found {bad_prices} records with invalid price"));
        }
        let bad_quantities = records.iter().filter(|record| record.quantity <= 0.0).count();
        if bad_quantities > 0 {
            issues.push(format!("Found {bad_quantities} records with invalid quantity"));
        }

        let invalid_sides: HashSet<&str> = records
            .iter()
            .map(|record| record.side.as_str())
            .filter(|side| *side != "buy" && *side != "sell")
            .collect();
        if !invalid_sides.is_empty() {
            let mut invalid_sides: Vec<&str> = invalid_sides.into_iter().collect();
            invalid_sides.sort_unstable();
            issues.push(format!("Found invalid side values: {invalid_sides:?}"));
        }

        if let Some(manifest) = manifest {
            let now = self.clock.now_utc();
            for (symbol, stats) in &manifest.product_stats {
                let Some(last_update) = stats.last_update_ts else { continue };
                if (now - last_update).num_seconds() > STALE_PRODUCT_THRESHOLD_SECS {
                    warn!(symbol, %last_update, "Product has not received data recently.");
                    metrics.stale_products.push(symbol.clone());
                }
            }
        }

        info!(key = latest_key, issues = issues.len(), "Batch validation complete.");
        (issues, metrics)
    }

    /// Reads every columnar page in the version partition and checks global
    /// uniqueness, freshness and per-product trade gaps.
    pub async fn validate_full(
        &self,
        unified_prefix: &str,
        version: u32,
    ) -> (Vec<String>, FullScanMetrics) {
        let mut issues = Vec::new();
        let mut metrics = FullScanMetrics::default();

        let partition_prefix = format!("{}/v{}/", unified_prefix.trim_end_matches('/'), version);
        let keys = match self.store.list_objects(&partition_prefix).await {
            Ok(keys) => keys,
            Err(list_error) => {
                issues.push(format!("Validation error: {list_error}"));
                return (issues, metrics);
            }
        };
        let page_keys: Vec<&String> =
            keys.iter().filter(|key| key.ends_with(".parquet")).collect();
        if page_keys.is_empty() {
            issues.push("No columnar pages found in unified prefix".to_owned());
            return (issues, metrics);
        }

        let mut records: Vec<UnifiedRecord> = Vec::new();
        for key in &page_keys {
            match self.read_page(key).await {
                Ok((_, page_records)) => records.extend(page_records),
                Err(read_error) => {
                    warn!(key = key.as_str(), %read_error, "Could not read columnar page.");
                }
            }
        }
        if records.is_empty() {
            issues.push("Could not read any columnar pages".to_owned());
            return (issues, metrics);
        }

        metrics.total_records = as_u64(records.len());
        let unique: HashSet<(&str, &str, &str)> = records
            .iter()
            .map(|record| {
                (record.exchange.as_str(), record.symbol.as_str(), record.trade_id.as_str())
            })
            .collect();
        metrics.unique_trade_ids = as_u64(unique.len());
        let duplicates = metrics.total_records - metrics.unique_trade_ids;
        if duplicates > 0 {
            metrics.duplicates_found = duplicates;
            issues.push(format!("Found {duplicates} duplicate trade_ids across full dataset"));
        }

        let now = self.clock.now_utc();
        let earliest = records.iter().map(|record| record.trade_ts).min();
        let latest = records.iter().map(|record| record.trade_ts).max();
        if let Some(latest) = latest {
            let age_seconds = (now - latest).num_seconds();
            #[allow(clippy::as_conversions)]
            let age_hours = age_seconds as f64 / 3600.0;
            metrics.date_range =
                DateRange { earliest, latest: Some(latest), age_hours: Some(age_hours) };
            if age_seconds > FRESHNESS_WARNING_SECS {
                issues.push(format!("Latest data is {age_hours:.1} hours old"));
            }
        }

        let mut by_product: BTreeMap<&str, Vec<DateTime<Utc>>> = BTreeMap::new();
        for record in &records {
            by_product.entry(record.symbol.as_str()).or_default().push(record.trade_ts);
        }
        for (product, timestamps) in &mut by_product {
            timestamps.sort_unstable();
            #[allow(clippy::as_conversions)]
            let max_gap_minutes = timestamps
                .windows(2)
                .map(|pair| (pair[1] - pair[0]).num_seconds() as f64 / 60.0)
                .fold(0.0_f64, f64::max);
            metrics.max_gap_minutes = metrics.max_gap_minutes.max(max_gap_minutes);
            if max_gap_minutes > GAP_WARNING_MINUTES {
                metrics
                    .gap_issues
                    .push(format!("{product}: {max_gap_minutes:.1} min gap detected"));
            }
            if let Some(product_latest) = timestamps.last() {
                if (now - *product_latest).num_seconds() > STALE_PRODUCT_THRESHOLD_SECS {
                    metrics.stale_products.push((*product).to_owned());
                }
            }
        }
        if metrics.gap_issues.len() > GAP_PRODUCT_LIMIT {
            issues.push(format!("Found {} products with large trade gaps", metrics.gap_issues.len()));
        }
        if metrics.stale_products.len() > STALE_PRODUCT_LIMIT {
            issues.push(format!(
                "Found {} products with no recent trades",
                metrics.stale_products.len()
            ));
        }
        metrics.products = by_product.keys().map(|product| (*product).to_owned()).collect();

        info!(
            pages = page_keys.len(),
            total_records = metrics.total_records,
            issues = issues.len(),
            "Full-scan validation complete."
        );
        (issues, metrics)
    }

    async fn read_page(
        &self,
        key: &str,
    ) -> Result<(Vec<String>, Vec<UnifiedRecord>), String> {
        let body = self
            .store
            .get_object(key)
            .await
            .map_err(|store_error| store_error.to_string())?
            .ok_or_else(|| format!("page '{key}' not found"))?;
        let column_names =
            parquet_column_names(body.clone()).map_err(|codec_error| codec_error.to_string())?;
        let records = parquet_to_records(body).map_err(|codec_error| codec_error.to_string())?;
        Ok((column_names, records))
    }
}

/// Evaluates the quality gate. Schema and read errors fail it, as do batch
/// duplicates above the threshold and stale full-scan data; everything else
/// stays a warning.
pub fn check_gates(
    batch_issues: &[String],
    batch_metrics: &BatchValidationMetrics,
    full: Option<(&[String], &FullScanMetrics)>,
) -> (bool, Vec<String>) {
    let mut failure_reasons = Vec::new();

    for issue in batch_issues {
        if issue.contains("Missing required columns") || issue.contains("Validation error") {
            failure_reasons.push(format!("BATCH_VALIDATION: {issue}"));
        }
    }

    if batch_metrics.duplicates_found > 0 && batch_metrics.batch_records_checked > 0 {
        #[allow(clippy::as_conversions)]
        let duplicate_percent = batch_metrics.duplicates_found as f64
            / batch_metrics.batch_records_checked as f64
            * 100.0;
        if duplicate_percent > DUPLICATE_GATE_PERCENT {
            failure_reasons.push(format!(
                "DUPLICATES: {duplicate_percent:.1}% duplicates in batch (threshold: \
                 {DUPLICATE_GATE_PERCENT}%)"
            ));
        }
    }

    if let Some((full_issues, full_metrics)) = full {
        for issue in full_issues {
            if issue.contains("Missing required columns") || issue.contains("Validation error") {
                failure_reasons.push(format!("FULL_VALIDATION: {issue}"));
            }
        }
        if let Some(age_hours) = full_metrics.date_range.age_hours {
            if age_hours > FRESHNESS_GATE_HOURS {
                failure_reasons.push(format!(
                    "FRESHNESS: Data is {age_hours:.1}h old (threshold: {FRESHNESS_GATE_HOURS}h)"
                ));
            }
        }
    }

    let passed = failure_reasons.is_empty();
    if passed {
        info!("Quality gates passed.");
    } else {
        for reason in &failure_reasons {
            warn!(reason, "Quality gate failure.");
        }
    }
    (passed, failure_reasons)
}

fn as_u64(value: usize) -> u64 {
    u64::try_from(value).expect("usize fits in u64")
}
