pub mod dedupe;
#[cfg(test)]
mod dedupe_test;
pub mod local_query;
pub mod manifest;
#[cfg(test)]
mod manifest_test;
pub mod metrics;
pub mod transform;
pub mod unified;
#[cfg(test)]
mod unified_test;
pub mod validation;

pub use dedupe::{DedupeConfig, DedupeEngine, DedupeOutcome, DedupeStatus};
pub use local_query::LocalQueryEngine;
pub use manifest::{Manifest, MANIFEST_KEY};
pub use transform::{TransformConfig, TransformEngine, TransformOutcome, TransformStatus};
pub use unified::UnifiedRecord;
pub use validation::{BatchValidationMetrics, FullScanMetrics, Validator};
