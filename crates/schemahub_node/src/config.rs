use std::path::PathBuf;

use schemahub_coinbase_client::client::CoinbaseClientConfig;
use schemahub_health::{CircuitBreakerConfig, HealthTrackerConfig};
use schemahub_ingest::IngestConfig;
use schemahub_locks::LockManagerConfig;
use schemahub_rate_limiter::RateLimiterConfig;
use schemahub_transform::dedupe::DedupeConfig;
use schemahub_transform::transform::TransformConfig;
use thiserror::Error;

pub const ENV_S3_BUCKET: &str = "S3_BUCKET";
pub const ENV_AWS_REGION: &str = "AWS_REGION";
pub const ENV_HEALTH_TABLE: &str = "DYNAMODB_HEALTH_TABLE";
pub const ENV_HEALTH_CHECK_ENABLED: &str = "HEALTH_CHECK_ENABLED";
pub const ENV_CIRCUIT_BREAKER_ENABLED: &str = "CIRCUIT_BREAKER_ENABLED";
/// Root directory of the local object-store backend.
pub const ENV_LOCAL_ROOT: &str = "SCHEMAHUB_LOCAL_ROOT";

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_LOCAL_ROOT: &str = "state";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("S3 bucket not specified. Set the {ENV_S3_BUCKET} environment variable.")]
    MissingBucket,
}

/// Everything the node needs to wire the pipeline, assembled from component
/// defaults plus the environment.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub bucket: String,
    pub region: String,
    pub local_root: PathBuf,
    pub rate_limiter: RateLimiterConfig,
    pub health: HealthTrackerConfig,
    pub circuit: CircuitBreakerConfig,
    pub client: CoinbaseClientConfig,
    pub locks: LockManagerConfig,
    pub ingest: IngestConfig,
    pub transform: TransformConfig,
    pub dedupe: DedupeConfig,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bucket = std::env::var(ENV_S3_BUCKET).map_err(|_| ConfigError::MissingBucket)?;
        Ok(Self::from_env_with_bucket(bucket))
    }

    /// Commands that never touch the object store (seed refresh) run without
    /// a bucket.
    pub fn from_env_with_bucket(bucket: String) -> Self {
        let region = std::env::var(ENV_AWS_REGION).unwrap_or_else(|_| DEFAULT_REGION.to_owned());
        let local_root = std::env::var(ENV_LOCAL_ROOT)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOCAL_ROOT));

        let mut health = HealthTrackerConfig::default();
        if let Ok(table) = std::env::var(ENV_HEALTH_TABLE) {
            health.table = table;
        }
        health.enabled = env_flag(ENV_HEALTH_CHECK_ENABLED, true);
        let circuit = CircuitBreakerConfig { enabled: env_flag(ENV_CIRCUIT_BREAKER_ENABLED, true) };

        let transform = TransformConfig::default();
        let dedupe = DedupeConfig {
            bucket: bucket.clone(),
            unified_prefix: transform.unified_prefix.clone(),
            ..Default::default()
        };
        Self {
            bucket,
            region,
            local_root,
            rate_limiter: RateLimiterConfig::default(),
            health,
            circuit,
            client: CoinbaseClientConfig::default(),
            locks: LockManagerConfig::default(),
            ingest: IngestConfig::default(),
            transform,
            dedupe,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => value.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}
