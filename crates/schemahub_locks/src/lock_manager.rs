use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemahub_storage::kv_store::{KeyValueStore, KvItem, KvKey, KvStoreError, WriteCondition};
use schemahub_time::Clock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::metrics::{LOCKS_ACQUIRED, LOCKS_HELD, LOCKS_STOLEN, LOCK_RENEWAL_FAILURES};

const DEFAULT_TABLE: &str = "schemahub-locks";
const DEFAULT_TTL: Duration = Duration::from_secs(300);
const DEFAULT_ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LockManagerConfig {
    pub table: String,
    pub ttl: Duration,
    pub acquire_retry_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_owned(),
            ttl: DEFAULT_TTL,
            acquire_retry_interval: DEFAULT_ACQUIRE_RETRY_INTERVAL,
        }
    }
}

#[derive(Debug, Error)]
pub enum LockManagerError {
    #[error(transparent)]
    KvStore(#[from] KvStoreError),
    #[error("Lock record for '{0}' is malformed")]
    MalformedRecord(String),
}

pub type LockManagerResult<T> = Result<T, LockManagerError>;

/// One lease row in the lock table.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct LockRecord {
    lock_name: String,
    lock_id: Uuid,
    acquired_at: DateTime<Utc>,
    /// Epoch seconds after which the lease is up for grabs.
    ttl: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    renewed_at: Option<DateTime<Utc>>,
}

fn to_item(record: &LockRecord) -> KvItem {
    serde_json::to_value(record)
        .expect("Lock record serialization should succeed")
        .as_object()
        .expect("Lock record serializes to an object")
        .clone()
}

struct HeldLease {
    lock_id: Uuid,
    renewal: JoinHandle<()>,
}

/// TTL leases over the conditional key-value store. At most one live holder
/// exists per lock name; an expired lease can be stolen by a new holder
/// through a CAS on the previous holder's id. Every held lease owns a
/// background renewal task, stopped before release.
pub struct LockManager {
    kv: Arc<dyn KeyValueStore>,
    config: LockManagerConfig,
    clock: Arc<dyn Clock>,
    held: Arc<StdMutex<HashMap<String, HeldLease>>>,
}

impl LockManager {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        config: LockManagerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { kv, config, clock, held: Arc::new(StdMutex::new(HashMap::new())) }
    }

    /// Attempts to take the lease. Returns `false` when another live holder
    /// has it; with `wait`, retries every `acquire_retry_interval` until
    /// `timeout` elapses.
    pub async fn acquire(
        &self,
        name: &str,
        wait: bool,
        timeout: Duration,
    ) -> LockManagerResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.try_acquire(name).await? {
                return Ok(true);
            }
            if !wait || tokio::time::Instant::now() >= deadline {
                debug!(lock = name, "Lease unavailable.");
                return Ok(false);
            }
            tokio::time::sleep(self.config.acquire_retry_interval).await;
        }
    }

    async fn try_acquire(&self, name: &str) -> LockManagerResult<bool> {
        let record = self.new_record(name);
        let put = self
            .kv
            .put_item(
                &self.config.table,
                KvKey::partition(name),
                to_item(&record),
                Some(WriteCondition::KeyNotExists),
            )
            .await;
        match put {
            Ok(()) => {
                self.note_acquired(&record);
                Ok(true)
            }
            Err(KvStoreError::ConditionFailed { .. }) => self.steal(name).await,
            Err(error) => Err(error.into()),
        }
    }

    /// Takes over an expired lease. Reads the current row and, when its ttl
    /// has elapsed, replaces it predicated on the old holder's id; any
    /// concurrent stealer loses the CAS.
    pub async fn steal(&self, name: &str) -> LockManagerResult<bool> {
        let Some(current) = self.kv.get_item(&self.config.table, KvKey::partition(name)).await?
        else {
            // The holder released between our put and this read; let the next
            // acquire attempt race for the fresh row.
            return Ok(false);
        };
        let current_lock_id = current
            .get("lock_id")
            .and_then(|value| value.as_str())
            .ok_or_else(|| LockManagerError::MalformedRecord(name.to_owned()))?
            .to_owned();
        let current_ttl = current
            .get("ttl")
            .and_then(|value| value.as_i64())
            .ok_or_else(|| LockManagerError::MalformedRecord(name.to_owned()))?;

        if current_ttl >= self.clock.epoch_secs() {
            return Ok(false);
        }

        let record = self.new_record(name);
        let put = self
            .kv
            .put_item(
                &self.config.table,
                KvKey::partition(name),
                to_item(&record),
                Some(WriteCondition::FieldEquals {
                    field: "lock_id".to_owned(),
                    expected: json!(current_lock_id),
                }),
            )
            .await;
        match put {
            Ok(()) => {
                info!(lock = name, previous_holder = current_lock_id, "Stole expired lease.");
                LOCKS_STOLEN.increment(1);
                self.note_acquired(&record);
                Ok(true)
            }
            Err(KvStoreError::ConditionFailed { .. }) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Releases a held lease: the renewal task is stopped first, then the row
    /// is deleted predicated on our holder id. Absent or reassigned rows are
    /// not errors.
    pub async fn release(&self, name: &str) -> LockManagerResult<()> {
        let Some(lease) = self.held.lock().unwrap().remove(name) else {
            return Ok(());
        };
        lease.renewal.abort();
        self.update_held_gauge();
        let delete = self
            .kv
            .delete_item(
                &self.config.table,
                KvKey::partition(name),
                Some(WriteCondition::FieldEquals {
                    field: "lock_id".to_owned(),
                    expected: json!(lease.lock_id),
                }),
            )
            .await;
        match delete {
            Ok(()) => {
                debug!(lock = name, "Lease released.");
                Ok(())
            }
            Err(KvStoreError::ConditionFailed { .. }) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Releases every lease this process holds.
    pub async fn release_all(&self) -> LockManagerResult<()> {
        let names: Vec<String> = self.held.lock().unwrap().keys().cloned().collect();
        for name in names {
            self.release(&name).await?;
        }
        Ok(())
    }

    pub fn holds(&self, name: &str) -> bool {
        self.held.lock().unwrap().contains_key(name)
    }

    fn new_record(&self, name: &str) -> LockRecord {
        LockRecord {
            lock_name: name.to_owned(),
            lock_id: Uuid::new_v4(),
            acquired_at: self.clock.now_utc(),
            ttl: self.clock.epoch_secs() + ttl_secs(self.config.ttl),
            renewed_at: None,
        }
    }

    fn note_acquired(&self, record: &LockRecord) {
        LOCKS_ACQUIRED.increment(1);
        let renewal = self.spawn_renewal(&record.lock_name, record.lock_id);
        let mut held = self.held.lock().unwrap();
        held.insert(record.lock_name.clone(), HeldLease { lock_id: record.lock_id, renewal });
        LOCKS_HELD.set_lossy(held.len());
        info!(lock = record.lock_name, lock_id = %record.lock_id, "Lease acquired.");
    }

    fn update_held_gauge(&self) {
        LOCKS_HELD.set_lossy(self.held.lock().unwrap().len());
    }

    /// Renewal runs at half the ttl. Transient store errors are retried on
    /// the next tick; a failed CAS means the lease was lost, which drops the
    /// local hold without disturbing the task that took it over.
    fn spawn_renewal(&self, name: &str, lock_id: Uuid) -> JoinHandle<()> {
        let kv = self.kv.clone();
        let clock = self.clock.clone();
        let held = self.held.clone();
        let table = self.config.table.clone();
        let ttl = self.config.ttl;
        let name = name.to_owned();
        tokio::spawn(async move {
            let cadence = ttl / 2;
            loop {
                tokio::time::sleep(cadence).await;
                let mut updates = KvItem::new();
                updates.insert("ttl".to_owned(), json!(clock.epoch_secs() + ttl_secs(ttl)));
                updates.insert("renewed_at".to_owned(), json!(clock.now_utc()));
                let renewed = kv
                    .update_item(
                        &table,
                        KvKey::partition(&name),
                        updates,
                        Some(WriteCondition::FieldEquals {
                            field: "lock_id".to_owned(),
                            expected: json!(lock_id),
                        }),
                    )
                    .await;
                match renewed {
                    Ok(()) => trace!(lock = name, "Lease renewed."),
                    Err(KvStoreError::ConditionFailed { .. }) => {
                        warn!(lock = name, "Lease lost; dropping local hold.");
                        LOCK_RENEWAL_FAILURES.increment(1);
                        let mut held = held.lock().unwrap();
                        if held.get(&name).is_some_and(|lease| lease.lock_id == lock_id) {
                            held.remove(&name);
                        }
                        LOCKS_HELD.set_lossy(held.len());
                        break;
                    }
                    Err(error) => {
                        warn!(lock = name, %error, "Lease renewal hit a transient store error.");
                    }
                }
            }
        })
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}
