use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageError;

/// Handle to a directory created through [`StorageBackend::create_directory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryHandle {
    /// Normalized path of the directory, relative to the backend root
    pub path: String,

    /// Whether this call created the directory
    pub created: bool,
}

impl DirectoryHandle {
    /// Path of `name` inside this directory.
    pub fn child(&self, name: &str) -> String {
        join_path(&self.path, name)
    }
}

/// Trait for byte-addressed storage of archive objects.
///
/// Paths are `/`-separated and relative to the backend root. Implementations
/// must be thread-safe; the pipeline shares one backend across all spawned
/// chunk writes.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write `data` at `offset` into the object at `path`.
    ///
    /// Parent directories are created on demand. A write at offset 0
    /// replaces any existing object.
    async fn write(&self, path: &str, offset: u64, data: Bytes) -> Result<(), StorageError>;

    /// Read exactly `len` bytes starting at `offset`.
    async fn read(&self, path: &str, offset: u64, len: usize) -> Result<Bytes, StorageError>;

    /// Size of the object at `path` in bytes.
    async fn size(&self, path: &str) -> Result<u64, StorageError>;

    /// Whether an object or directory exists at `path`.
    async fn exists(&self, path: &str) -> bool;

    /// Create the directory at `path`.
    ///
    /// With `create_if_missing` an existing directory is reused; without it
    /// the directory must not exist yet (`AlreadyExists`).
    async fn create_directory(
        &self,
        path: &str,
        create_if_missing: bool,
    ) -> Result<DirectoryHandle, StorageError>;

    /// Identifier for this backend (for logging).
    fn identifier(&self) -> &str;

    /// Read the whole object at `path`.
    async fn read_all(&self, path: &str) -> Result<Bytes, StorageError> {
        let size = self.size(path).await?;
        let len = usize::try_from(size).map_err(|_| StorageError::RangeOutOfBounds {
            path: path.to_string(),
            offset: 0,
            requested: size,
            size,
        })?;
        self.read(path, 0, len).await
    }
}

// =============================================================================
// Path Helpers
// =============================================================================

/// Normalize a relative storage path.
///
/// Empty and `.` components are dropped. Absolute paths, `..` components,
/// backslashes and drive prefixes are rejected.
pub fn normalize_path(path: &str) -> Result<String, StorageError> {
    if path.starts_with('/') || path.contains('\\') {
        return Err(StorageError::InvalidPath(path.to_string()));
    }

    let mut parts = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(StorageError::InvalidPath(path.to_string())),
            c if c.contains(':') => return Err(StorageError::InvalidPath(path.to_string())),
            c => parts.push(c),
        }
    }

    if parts.is_empty() {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(parts.join("/"))
}

/// Join two relative paths; an empty `base` yields `name`.
pub fn join_path(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

/// Every proper ancestor of a normalized path, shortest first.
pub(crate) fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}
