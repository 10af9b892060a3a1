use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use super::backend::{join_path, DirectoryHandle, StorageBackend};
use super::directory::DirectoryBackend;
use super::origin::OriginPrivateStore;
use crate::error::StorageError;

/// A backend scoped to one dataset's archive root.
///
/// All paths passed to the handle are relative to `root`. Cloning shares the
/// backend.
#[derive(Clone)]
pub struct StorageHandle {
    backend: Arc<dyn StorageBackend>,
    root: String,
    dataset_id: String,
}

impl std::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("backend", &self.backend.identifier())
            .field("root", &self.root)
            .field("dataset_id", &self.dataset_id)
            .finish()
    }
}

impl StorageHandle {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        root: impl Into<String>,
        dataset_id: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            root: root.into(),
            dataset_id: dataset_id.into(),
        }
    }

    /// Archive stored directly in the filesystem directory `path`.
    pub fn directory(path: impl Into<PathBuf>, dataset_id: impl Into<String>) -> Self {
        Self::new(Arc::new(DirectoryBackend::new(path)), "", dataset_id)
    }

    /// Archive stored in the origin-private namespace `(dataset_id, root_dir)`.
    pub fn origin(store: &OriginPrivateStore, dataset_id: &str, root_dir: &str) -> Self {
        Self::new(Arc::new(store.open(dataset_id, root_dir)), "", dataset_id)
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    /// Identifier used in log lines.
    pub fn identifier(&self) -> String {
        if self.root.is_empty() {
            self.backend.identifier().to_string()
        } else {
            format!("{}/{}", self.backend.identifier(), self.root)
        }
    }

    /// Backend path for `path` under this handle's root.
    pub fn resolve(&self, path: &str) -> String {
        join_path(&self.root, path)
    }

    pub async fn write(&self, path: &str, offset: u64, data: Bytes) -> Result<(), StorageError> {
        self.backend.write(&self.resolve(path), offset, data).await
    }

    pub async fn read(&self, path: &str, offset: u64, len: usize) -> Result<Bytes, StorageError> {
        self.backend.read(&self.resolve(path), offset, len).await
    }

    pub async fn read_all(&self, path: &str) -> Result<Bytes, StorageError> {
        self.backend.read_all(&self.resolve(path)).await
    }

    pub async fn size(&self, path: &str) -> Result<u64, StorageError> {
        self.backend.size(&self.resolve(path)).await
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.backend.exists(&self.resolve(path)).await
    }

    pub async fn create_directory(
        &self,
        path: &str,
        create_if_missing: bool,
    ) -> Result<DirectoryHandle, StorageError> {
        self.backend
            .create_directory(&self.resolve(path), create_if_missing)
            .await
    }
}
