use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
#[cfg(any(feature = "testing", test))]
use mockall::automock;
use serde_json::Value;
use thiserror::Error;

pub type KvItem = serde_json::Map<String, Value>;

/// Composite key: partition key plus an optional sort key. Items in one
/// partition are ordered by sort key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvKey {
    pub partition: String,
    pub sort: Option<String>,
}

impl KvKey {
    pub fn partition(partition: impl Into<String>) -> Self {
        Self { partition: partition.into(), sort: None }
    }

    pub fn sorted(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self { partition: partition.into(), sort: Some(sort.into()) }
    }
}

/// Condition evaluated atomically against the stored item (if any) before a
/// write takes effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteCondition {
    /// The key must not currently exist.
    KeyNotExists,
    /// The stored item must exist and carry `expected` under `field`.
    FieldEquals { field: String, expected: Value },
}

#[derive(Debug, Error)]
pub enum KvStoreError {
    #[error("Conditional check failed for '{partition}'")]
    ConditionFailed { partition: String },
    #[error("Key-value store backend error: {0}")]
    Backend(String),
}

pub type KvStoreResult<T> = Result<T, KvStoreError>;

/// The conditional key-value boundary backing leases and health records.
/// All writes taking a condition are atomic: of any set of concurrent
/// conditional writes to one key, at most one observes its condition as true.
#[cfg_attr(any(feature = "testing", test), automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put_item(
        &self,
        table: &str,
        key: KvKey,
        item: KvItem,
        condition: Option<WriteCondition>,
    ) -> KvStoreResult<()>;

    /// Merges `updates` into the stored item. A missing item fails the
    /// condition (and is a backend error when no condition is given).
    async fn update_item(
        &self,
        table: &str,
        key: KvKey,
        updates: KvItem,
        condition: Option<WriteCondition>,
    ) -> KvStoreResult<()>;

    async fn delete_item(
        &self,
        table: &str,
        key: KvKey,
        condition: Option<WriteCondition>,
    ) -> KvStoreResult<()>;

    async fn get_item(&self, table: &str, key: KvKey) -> KvStoreResult<Option<KvItem>>;

    /// Returns the item with the greatest sort key in `partition`, if any.
    async fn query_latest(&self, table: &str, partition: &str) -> KvStoreResult<Option<KvItem>>;
}

fn condition_holds(condition: &WriteCondition, existing: Option<&KvItem>) -> bool {
    match condition {
        WriteCondition::KeyNotExists => existing.is_none(),
        WriteCondition::FieldEquals { field, expected } => {
            existing.is_some_and(|item| item.get(field) == Some(expected))
        }
    }
}

type Partition = BTreeMap<String, KvItem>;

/// In-process store with the same conditional semantics, for tests and local
/// runs. Conditions are checked and applied under one mutex acquisition.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    tables: Mutex<HashMap<String, HashMap<String, Partition>>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

const DEFAULT_SORT_KEY: &str = "";

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn put_item(
        &self,
        table: &str,
        key: KvKey,
        item: KvItem,
        condition: Option<WriteCondition>,
    ) -> KvStoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let partition = tables
            .entry(table.to_owned())
            .or_default()
            .entry(key.partition.clone())
            .or_default();
        let sort = key.sort.unwrap_or_else(|| DEFAULT_SORT_KEY.to_owned());
        if let Some(condition) = condition {
            if !condition_holds(&condition, partition.get(&sort)) {
                return Err(KvStoreError::ConditionFailed { partition: key.partition });
            }
        }
        partition.insert(sort, item);
        Ok(())
    }

    async fn update_item(
        &self,
        table: &str,
        key: KvKey,
        updates: KvItem,
        condition: Option<WriteCondition>,
    ) -> KvStoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let partition = tables
            .entry(table.to_owned())
            .or_default()
            .entry(key.partition.clone())
            .or_default();
        let sort = key.sort.unwrap_or_else(|| DEFAULT_SORT_KEY.to_owned());
        if let Some(condition) = condition {
            if !condition_holds(&condition, partition.get(&sort)) {
                return Err(KvStoreError::ConditionFailed { partition: key.partition });
            }
        }
        let Some(existing) = partition.get_mut(&sort) else {
            return Err(KvStoreError::Backend(format!(
                "update of missing item '{}'",
                key.partition
            )));
        };
        for (field, value) in updates {
            existing.insert(field, value);
        }
        Ok(())
    }

    async fn delete_item(
        &self,
        table: &str,
        key: KvKey,
        condition: Option<WriteCondition>,
    ) -> KvStoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let Some(partitions) = tables.get_mut(table) else {
            return match condition {
                Some(_) => Err(KvStoreError::ConditionFailed { partition: key.partition }),
                None => Ok(()),
            };
        };
        let Some(partition) = partitions.get_mut(&key.partition) else {
            return match condition {
                Some(_) => Err(KvStoreError::ConditionFailed { partition: key.partition }),
                None => Ok(()),
            };
        };
        let sort = key.sort.unwrap_or_else(|| DEFAULT_SORT_KEY.to_owned());
        if let Some(condition) = condition {
            if !condition_holds(&condition, partition.get(&sort)) {
                return Err(KvStoreError::ConditionFailed { partition: key.partition });
            }
        }
        partition.remove(&sort);
        Ok(())
    }

    async fn get_item(&self, table: &str, key: KvKey) -> KvStoreResult<Option<KvItem>> {
        let tables = self.tables.lock().unwrap();
        let sort = key.sort.unwrap_or_else(|| DEFAULT_SORT_KEY.to_owned());
        Ok(tables
            .get(table)
            .and_then(|partitions| partitions.get(&key.partition))
            .and_then(|partition| partition.get(&sort))
            .cloned())
    }

    async fn query_latest(&self, table: &str, partition: &str) -> KvStoreResult<Option<KvItem>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .get(table)
            .and_then(|partitions| partitions.get(partition))
            .and_then(|partition| partition.values().next_back())
            .cloned())
    }
}
