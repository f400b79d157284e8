use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(any(feature = "testing", test))]
use mockall::automock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Object store backend error: {0}")]
    Backend(String),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// The blob-store boundary the pipeline writes raw pages, unified partitions,
/// checkpoints and the manifest through. Implementations must be thread-safe
/// and must make a completed `put_object` atomically visible under its key.
#[cfg_attr(any(feature = "testing", test), automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes) -> ObjectStoreResult<()>;

    /// Returns `None` when the key does not exist.
    async fn get_object(&self, key: &str) -> ObjectStoreResult<Option<Bytes>>;

    /// Lists all keys under `prefix` in lexicographic order.
    async fn list_objects(&self, prefix: &str) -> ObjectStoreResult<Vec<String>>;

    async fn delete_object(&self, key: &str) -> ObjectStoreResult<()>;

    async fn copy_object(&self, source_key: &str, target_key: &str) -> ObjectStoreResult<()>;
}

/// In-process store backed by a sorted map. Used by tests and local dry runs.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_object(&self, key: &str, body: Bytes) -> ObjectStoreResult<()> {
        self.objects.lock().unwrap().insert(key.to_owned(), body);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> ObjectStoreResult<Option<Bytes>> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    async fn list_objects(&self, prefix: &str) -> ObjectStoreResult<Vec<String>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects.keys().filter(|key| key.starts_with(prefix)).cloned().collect())
    }

    async fn delete_object(&self, key: &str) -> ObjectStoreResult<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn copy_object(&self, source_key: &str, target_key: &str) -> ObjectStoreResult<()> {
        let mut objects = self.objects.lock().unwrap();
        let body = objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(source_key.to_owned()))?;
        objects.insert(target_key.to_owned(), body);
        Ok(())
    }
}

/// Filesystem store rooted at a directory; keys map to relative paths. Writes
/// go through a temp file and a rename so a crash never leaves a partial
/// object visible.
#[derive(Debug)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root).ok().map(|rel| rel.to_string_lossy().replace('\\', "/"))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(&self, key: &str, body: Bytes) -> ObjectStoreResult<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &body).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> ObjectStoreResult<Option<Bytes>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(contents) => Ok(Some(Bytes::from(contents))),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn list_objects(&self, prefix: &str) -> ObjectStoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete_object(&self, key: &str) -> ObjectStoreResult<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn copy_object(&self, source_key: &str, target_key: &str) -> ObjectStoreResult<()> {
        let body = self
            .get_object(source_key)
            .await?
            .ok_or_else(|| ObjectStoreError::NotFound(source_key.to_owned()))?;
        self.put_object(target_key, body).await
    }
}
