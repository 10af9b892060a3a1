//! Origin-private, in-process storage.
//!
//! An [`OriginPrivateStore`] holds one namespace per `(dataset_id, root_dir)`
//! address. Every backend opened on the same store and address shares that
//! namespace, so an archive written by one session can be re-opened by the
//! next without touching the filesystem. Contents live in process memory
//! only and are dropped with the last handle to the store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::backend::{ancestors, normalize_path, DirectoryHandle, StorageBackend};
use crate::error::StorageError;

#[derive(Debug, Default)]
struct Namespace {
    objects: HashMap<String, Vec<u8>>,
    directories: HashSet<String>,
}

impl Namespace {
    fn add_parents(&mut self, path: &str) {
        for parent in ancestors(path) {
            if !self.directories.contains(parent) {
                self.directories.insert(parent.to_string());
            }
        }
    }
}

/// Registry of origin-private namespaces.
///
/// Cloning is cheap; clones share the same namespaces.
#[derive(Debug, Clone, Default)]
pub struct OriginPrivateStore {
    namespaces: Arc<Mutex<HashMap<(String, String), Arc<RwLock<Namespace>>>>>,
}

impl OriginPrivateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the namespace addressed by `(dataset_id, root_dir)`, creating it
    /// if needed.
    pub fn open(&self, dataset_id: &str, root_dir: &str) -> OriginPrivateBackend {
        let key = (dataset_id.to_string(), root_dir.to_string());
        let namespace = {
            let mut namespaces = self
                .namespaces
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            namespaces.entry(key).or_default().clone()
        };

        OriginPrivateBackend {
            namespace,
            identifier: format!("origin://{}/{}", dataset_id, root_dir),
        }
    }
}

/// Backend over one origin-private namespace.
#[derive(Debug, Clone)]
pub struct OriginPrivateBackend {
    namespace: Arc<RwLock<Namespace>>,
    identifier: String,
}

#[async_trait]
impl StorageBackend for OriginPrivateBackend {
    async fn write(&self, path: &str, offset: u64, data: Bytes) -> Result<(), StorageError> {
        let path = normalize_path(path)?;
        let range = usize::try_from(offset)
            .ok()
            .and_then(|start| Some((start, start.checked_add(data.len())?)));
        let Some((offset, end)) = range else {
            return Err(StorageError::IoFailure {
                message: format!(
                    "{} bytes at offset {} exceed the address space",
                    data.len(),
                    offset
                ),
                path,
            });
        };

        let mut ns = self.namespace.write().await;
        if ns.directories.contains(&path) {
            return Err(StorageError::AlreadyExists(path));
        }
        ns.add_parents(&path);

        let object = ns.objects.entry(path).or_default();
        if offset == 0 {
            object.clear();
        }
        if object.len() < end {
            object.resize(end, 0);
        }
        object[offset..end].copy_from_slice(&data);
        Ok(())
    }

    async fn read(&self, path: &str, offset: u64, len: usize) -> Result<Bytes, StorageError> {
        let path = normalize_path(path)?;
        let ns = self.namespace.read().await;
        let object = ns
            .objects
            .get(&path)
            .ok_or_else(|| StorageError::NotFound(path.clone()))?;

        let size = object.len() as u64;
        if offset.checked_add(len as u64).map_or(true, |end| end > size) {
            return Err(StorageError::RangeOutOfBounds {
                path,
                offset,
                requested: len as u64,
                size,
            });
        }
        let start = offset as usize;
        Ok(Bytes::copy_from_slice(&object[start..start + len]))
    }

    async fn size(&self, path: &str) -> Result<u64, StorageError> {
        let path = normalize_path(path)?;
        let ns = self.namespace.read().await;
        ns.objects
            .get(&path)
            .map(|object| object.len() as u64)
            .ok_or(StorageError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> bool {
        let Ok(path) = normalize_path(path) else {
            return false;
        };
        let ns = self.namespace.read().await;
        ns.objects.contains_key(&path) || ns.directories.contains(&path)
    }

    async fn create_directory(
        &self,
        path: &str,
        create_if_missing: bool,
    ) -> Result<DirectoryHandle, StorageError> {
        let path = normalize_path(path)?;
        let mut ns = self.namespace.write().await;
        if ns.objects.contains_key(&path) {
            return Err(StorageError::AlreadyExists(path));
        }
        if ns.directories.contains(&path) {
            if create_if_missing {
                return Ok(DirectoryHandle {
                    path,
                    created: false,
                });
            }
            return Err(StorageError::AlreadyExists(path));
        }

        ns.add_parents(&path);
        ns.directories.insert(path.clone());
        Ok(DirectoryHandle {
            path,
            created: true,
        })
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
