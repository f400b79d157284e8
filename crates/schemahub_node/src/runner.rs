use std::path::{Path, PathBuf};
use std::sync::Arc;

use schemahub_coinbase_client::client::{CoinbaseClient, TradeSource, COINBASE_UPSTREAM};
use schemahub_health::{CircuitBreaker, HealthTracker};
use schemahub_ingest::controller::{IngestConfig, IngestController, IngestError, RunStatus, RunSummary};
use schemahub_ingest::raw_writer::RawWriter;
use schemahub_ingest::seeds::{load_seed, save_seed, ProductSeed, DEFAULT_SEED_PATH};
use schemahub_locks::LockManager;
use schemahub_rate_limiter::RateLimiterRegistry;
use schemahub_storage::checkpoint::{CheckpointMode, CheckpointStore};
use schemahub_storage::kv_store::{InMemoryKeyValueStore, KeyValueStore};
use schemahub_storage::object_store::{LocalObjectStore, ObjectStore};
use schemahub_storage::query_service::QueryService;
use schemahub_time::{Clock, SystemClock};
use schemahub_transform::dedupe::DedupeEngine;
use schemahub_transform::manifest::Manifest;
use schemahub_transform::metrics::QUALITY_GATE_FAILURES;
use schemahub_transform::transform::{TransformEngine, TransformOutcome};
use schemahub_transform::validation::{check_gates, Validator};
use schemahub_transform::LocalQueryEngine;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;

const TRANSFORM_LOCK: &str = "transform";
const TRANSFORM_PIPELINE: &str = "coinbase_transform";

#[derive(Debug, Error)]
pub enum NodeError {
    /// Misuse, missing credentials or an unavailable lock: exit code 2.
    #[error("{0}")]
    Usage(String),
    /// Everything else: nonzero exit.
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

pub type NodeResult<T> = Result<T, NodeError>;

/// The result of a transform invocation, including what the quality gate
/// decided.
#[derive(Debug)]
pub struct TransformRunReport {
    pub summary: RunSummary,
    pub outcome: TransformOutcome,
    pub gate_passed: bool,
    pub gate_failures: Vec<String>,
    pub output_version: u32,
}

/// The wired pipeline. `from_config` builds the real backends; tests inject
/// fakes through `with_backends`.
pub struct Pipeline {
    pub objects: Arc<dyn ObjectStore>,
    pub kv: Arc<dyn KeyValueStore>,
    pub query: Arc<dyn QueryService>,
    pub source: Arc<dyn TradeSource>,
    pub clock: Arc<dyn Clock>,
    pub locks: Arc<LockManager>,
    pub cancel: CancellationToken,
    pub config: NodeConfig,
}

impl Pipeline {
    pub fn from_config(config: NodeConfig, cancel: CancellationToken) -> NodeResult<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let objects: Arc<dyn ObjectStore> =
            Arc::new(LocalObjectStore::new(config.local_root.join(&config.bucket)));
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());

        let query_engine = LocalQueryEngine::new(objects.clone());
        for version in [1, 2] {
            query_engine.register_table(
                &format!("{}_v{version}", config.dedupe.table_base),
                &format!("{}/v{version}/", config.transform.unified_prefix.trim_end_matches('/')),
            );
        }
        let query: Arc<dyn QueryService> = Arc::new(query_engine);

        let rate_limiters = RateLimiterRegistry::new();
        let rate_limiter =
            rate_limiters.get_or_create(COINBASE_UPSTREAM, config.rate_limiter.clone());
        let tracker =
            Arc::new(HealthTracker::new(kv.clone(), config.health.clone(), clock.clone()));
        let circuit =
            Arc::new(CircuitBreaker::new(tracker, config.circuit.clone(), clock.clone()));
        let source: Arc<dyn TradeSource> = Arc::new(
            CoinbaseClient::new(config.client.clone(), rate_limiter, circuit)
                .map_err(|client_error| NodeError::Runtime(client_error.into()))?,
        );

        Ok(Self::with_backends(config, objects, kv, query, source, clock, cancel))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_backends(
        config: NodeConfig,
        objects: Arc<dyn ObjectStore>,
        kv: Arc<dyn KeyValueStore>,
        query: Arc<dyn QueryService>,
        source: Arc<dyn TradeSource>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        let locks = Arc::new(LockManager::new(kv.clone(), config.locks.clone(), clock.clone()));
        Self { objects, kv, query, source, clock, locks, cancel, config }
    }

    pub async fn run_ingest(
        &self,
        mode: CheckpointMode,
        products: Vec<String>,
        ingest_config: IngestConfig,
    ) -> NodeResult<RunSummary> {
        let checkpoints = Arc::new(CheckpointStore::new(
            self.objects.clone(),
            ingest_config.raw_prefix.clone(),
            mode,
            self.clock.clone(),
        ));
        let controller = Arc::new(IngestController::new(
            self.source.clone(),
            checkpoints,
            Arc::new(RawWriter::new(self.objects.clone())),
            self.locks.clone(),
            self.clock.clone(),
            ingest_config,
            self.cancel.clone(),
        ));
        controller.run(products).await.map_err(|ingest_error| match ingest_error {
            IngestError::LockUnavailable(_) | IngestError::NoProducts => {
                NodeError::Usage(ingest_error.to_string())
            }
            other => NodeError::Runtime(other.into()),
        })
    }

    pub async fn run_transform(
        &self,
        rebuild: bool,
        full_scan: bool,
    ) -> NodeResult<TransformRunReport> {
        let acquired = self
            .locks
            .acquire(TRANSFORM_LOCK, false, std::time::Duration::ZERO)
            .await
            .map_err(|lock_error| NodeError::Runtime(lock_error.into()))?;
        if !acquired {
            return Err(NodeError::Usage(format!(
                "The '{TRANSFORM_LOCK}' lock is held by another process"
            )));
        }
        let result = self.transform_locked(rebuild, full_scan).await;
        if let Err(release_error) = self.locks.release(TRANSFORM_LOCK).await {
            warn!(%release_error, "Failed to release the transform lock.");
        }
        result
    }

    async fn transform_locked(
        &self,
        rebuild: bool,
        full_scan: bool,
    ) -> NodeResult<TransformRunReport> {
        let run_id = Uuid::new_v4();
        let manifest_key = self.config.transform.manifest_key.clone();
        let mut manifest = Manifest::load(&self.objects, &manifest_key).await;

        let replay_reason = manifest.should_trigger_replay();
        let output_version = match &replay_reason {
            Some(reason) => {
                let next = manifest.next_version();
                info!(from = manifest.last_version, to = next, reason, "Replaying to the alternate version.");
                next
            }
            None => manifest.last_version,
        };

        let dedupe = DedupeEngine::new(
            self.objects.clone(),
            self.query.clone(),
            self.config.dedupe.clone(),
        );
        let engine = TransformEngine::new(
            self.objects.clone(),
            dedupe,
            self.clock.clone(),
            self.config.transform.clone(),
        );
        let outcome = engine
            .transform(output_version, run_id, rebuild || replay_reason.is_some())
            .await
            .map_err(|transform_error| NodeError::Runtime(transform_error.into()))?;

        let validator = Validator::new(self.objects.clone(), self.clock.clone());
        let (batch_issues, batch_metrics) = validator
            .validate_batch(outcome.output_keys.last().map(String::as_str), Some(&manifest))
            .await;
        let full = if full_scan {
            Some(
                validator
                    .validate_full(&self.config.transform.unified_prefix, output_version)
                    .await,
            )
        } else {
            None
        };
        let (gate_passed, gate_failures) = check_gates(
            &batch_issues,
            &batch_metrics,
            full.as_ref().map(|(issues, metrics)| (issues.as_slice(), metrics)),
        );
        if !gate_passed {
            QUALITY_GATE_FAILURES.increment(1);
        }

        let now = self.clock.now_utc();
        let previous_version = manifest.last_version;
        manifest.update_after_transform(
            &outcome,
            &batch_issues,
            &batch_metrics,
            gate_passed,
            now,
        );
        if let Some(reason) = &replay_reason {
            manifest.mark_replay(previous_version, output_version, reason, now);
        }
        manifest.last_version = output_version;
        manifest
            .save(&self.objects, &manifest_key)
            .await
            .map_err(|manifest_error| NodeError::Runtime(manifest_error.into()))?;

        let status = if gate_passed { RunStatus::Success } else { RunStatus::PartialFailure };
        let summary = RunSummary {
            pipeline: TRANSFORM_PIPELINE.to_owned(),
            status,
            run_id,
            records_written: outcome.records_written,
            products_processed: outcome.records_per_symbol.len(),
            checkpoint_ts: now,
            outcomes: Vec::new(),
        };
        Ok(TransformRunReport { summary, outcome, gate_passed, gate_failures, output_version })
    }

    pub async fn run_update_seed(
        &self,
        path: Option<&Path>,
        merge: bool,
        filter_regex: Option<&str>,
        dry_run: bool,
    ) -> NodeResult<ProductSeed> {
        let mut ids = self
            .source
            .list_products()
            .await
            .map_err(|fetch_error| {
                NodeError::Usage(format!("Failed to fetch products from the exchange: {fetch_error}"))
            })?;
        info!(products = ids.len(), "Fetched the product catalog.");

        if let Some(pattern) = filter_regex {
            let regex = regex::Regex::new(pattern).map_err(|regex_error| {
                NodeError::Usage(format!("Invalid --filter-regex: {regex_error}"))
            })?;
            ids.retain(|id| regex.is_match(id));
            info!(products = ids.len(), pattern, "Applied the id filter.");
        }

        let path = path.map_or_else(|| PathBuf::from(DEFAULT_SEED_PATH), Path::to_path_buf);
        if merge {
            if let Ok(existing) = load_seed(&path) {
                ids.extend(existing.products);
            }
        }
        let seed = ProductSeed::new(ids, "coinbase", self.clock.now_utc());

        if dry_run {
            info!(products = seed.products.len(), path = %path.display(), "Dry run; not writing the seed file.");
            return Ok(seed);
        }
        save_seed(&path, &seed)
            .map_err(|seed_error| NodeError::Runtime(seed_error.into()))?;
        Ok(seed)
    }

    /// Final cleanup on shutdown or cancellation: every held lease goes back.
    pub async fn shutdown(&self) {
        if let Err(release_error) = self.locks.release_all().await {
            warn!(%release_error, "Failed to release held leases during shutdown.");
        }
    }
}

/// The product universe for a run: an explicit product, or the seed file.
pub fn resolve_products(
    product: Option<String>,
    seed_path: Option<&Path>,
) -> NodeResult<Vec<String>> {
    if let Some(product) = product {
        return Ok(vec![product]);
    }
    let path = seed_path.map_or_else(|| PathBuf::from(DEFAULT_SEED_PATH), Path::to_path_buf);
    let seed = load_seed(&path).map_err(|seed_error| {
        NodeError::Usage(format!("Failed to load seed file {}: {seed_error}", path.display()))
    })?;
    if seed.products.is_empty() {
        return Err(NodeError::Usage(
            "No products to ingest. Provide a product or run update-seed first.".to_owned(),
        ));
    }
    Ok(seed.products)
}

/// Registers every metric in the workspace with the installed recorder.
pub fn register_all_metrics() {
    schemahub_rate_limiter::metrics::register_metrics();
    schemahub_locks::metrics::register_metrics();
    schemahub_health::metrics::register_metrics();
    schemahub_coinbase_client::metrics::register_metrics();
    schemahub_ingest::metrics::register_metrics();
    schemahub_transform::metrics::register_metrics();
}
