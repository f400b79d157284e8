use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_SEED_PATH: &str = "config/product_ids_seed.yaml";

#[derive(Debug, Error)]
pub enum SeedError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Seed file is malformed: {0}")]
    Malformed(#[from] serde_yaml::Error),
}

pub type SeedResult<T> = Result<T, SeedError>;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SeedMetadata {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
}

/// The fixed product universe for a run.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ProductSeed {
    pub products: Vec<String>,
    #[serde(default)]
    pub metadata: SeedMetadata,
}

impl ProductSeed {
    pub fn new(mut products: Vec<String>, source: impl Into<String>, now: DateTime<Utc>) -> Self {
        products.sort();
        products.dedup();
        let count = products.len();
        Self {
            products,
            metadata: SeedMetadata { source: source.into(), count, generated_at: Some(now) },
        }
    }
}

pub fn load_seed(path: &Path) -> SeedResult<ProductSeed> {
    let contents = std::fs::read_to_string(path)?;
    let seed: ProductSeed = serde_yaml::from_str(&contents)?;
    info!(path = %path.display(), products = seed.products.len(), "Seed file loaded.");
    Ok(seed)
}

pub fn save_seed(path: &Path, seed: &ProductSeed) -> SeedResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_yaml::to_string(seed)?)?;
    info!(path = %path.display(), products = seed.products.len(), "Seed file written.");
    Ok(())
}
