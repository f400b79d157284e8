use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use schemahub_time::Clock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::object_store::{ObjectStore, ObjectStoreError};

/// Per-product ingest progress. `cursor` is the next un-ingested trade id;
/// within a mode it only ever advances.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Checkpoint {
    pub cursor: u64,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ingest_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trade_id: Option<u64>,
}

/// Checkpoint namespace. Modes are disjoint: an incremental run never reads
/// or writes a full-refresh or backfill checkpoint.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    Ingest,
    FullRefresh,
    Backfill,
}

impl CheckpointMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointMode::Ingest => "ingest",
            CheckpointMode::FullRefresh => "full_refresh",
            CheckpointMode::Backfill => "backfill",
        }
    }
}

impl std::fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error("Checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Mode-scoped checkpoint persistence over the object store. Saves are a
/// single PUT, so a reader observes either the old or the new checkpoint,
/// never a torn one.
pub struct CheckpointStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    mode: CheckpointMode,
    clock: Arc<dyn Clock>,
}

impl CheckpointStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        mode: CheckpointMode,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, prefix: prefix.into(), mode, clock }
    }

    pub fn mode(&self) -> CheckpointMode {
        self.mode
    }

    fn key(&self, product_id: &str) -> String {
        format!("{}/checkpoints/{}/{}.json", self.prefix.trim_end_matches('/'), self.mode, product_id)
    }

    /// Loads the checkpoint for a product. Absent and malformed checkpoints
    /// both read as `None`; a malformed one is logged and treated as a cold
    /// start rather than poisoning the run.
    pub async fn load(&self, product_id: &str) -> CheckpointResult<Option<Checkpoint>> {
        let key = self.key(product_id);
        let Some(body) = self.store.get_object(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<Checkpoint>(&body) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(error) => {
                warn!(product_id, key, %error, "Malformed checkpoint; treating as absent.");
                Ok(None)
            }
        }
    }

    /// Saves the checkpoint, stamping `last_updated`.
    pub async fn save(&self, product_id: &str, mut checkpoint: Checkpoint) -> CheckpointResult<()> {
        checkpoint.last_updated = self.clock.now_utc();
        let key = self.key(product_id);
        let body = serde_json::to_vec(&checkpoint)?;
        self.store.put_object(&key, Bytes::from(body)).await?;
        debug!(product_id, cursor = checkpoint.cursor, mode = %self.mode, "Checkpoint saved.");
        Ok(())
    }
}
