use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::backend::{normalize_path, DirectoryHandle, StorageBackend};
use crate::error::StorageError;

/// Filesystem-backed storage rooted at a user-chosen directory.
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
    identifier: String,
}

impl DirectoryBackend {
    /// Create a backend rooted at `root`. The directory is created lazily on
    /// the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let identifier = format!("file://{}", root.display());
        Self { root, identifier }
    }

    /// Root directory of this backend.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<(String, PathBuf), StorageError> {
        let normalized = normalize_path(path)?;
        let full = normalized
            .split('/')
            .fold(self.root.clone(), |acc, part| acc.join(part));
        Ok((normalized, full))
    }
}

#[async_trait]
impl StorageBackend for DirectoryBackend {
    async fn write(&self, path: &str, offset: u64, data: Bytes) -> Result<(), StorageError> {
        let (path, full) = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(&path, e))?;
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(offset == 0)
            .open(&full)
            .await
            .map_err(|e| StorageError::from_io(&path, e))?;

        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| StorageError::from_io(&path, e))?;
        }
        file.write_all(&data)
            .await
            .map_err(|e| StorageError::from_io(&path, e))?;
        file.flush()
            .await
            .map_err(|e| StorageError::from_io(&path, e))?;
        Ok(())
    }

    async fn read(&self, path: &str, offset: u64, len: usize) -> Result<Bytes, StorageError> {
        let (path, full) = self.resolve(path)?;
        let mut file = fs::File::open(&full)
            .await
            .map_err(|e| StorageError::from_io(&path, e))?;

        let size = file
            .metadata()
            .await
            .map_err(|e| StorageError::from_io(&path, e))?
            .len();
        if offset.checked_add(len as u64).map_or(true, |end| end > size) {
            return Err(StorageError::RangeOutOfBounds {
                path,
                offset,
                requested: len as u64,
                size,
            });
        }
        if len == 0 {
            return Ok(Bytes::new());
        }

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| StorageError::from_io(&path, e))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| StorageError::from_io(&path, e))?;
        Ok(Bytes::from(buf))
    }

    async fn size(&self, path: &str) -> Result<u64, StorageError> {
        let (path, full) = self.resolve(path)?;
        let metadata = fs::metadata(&full)
            .await
            .map_err(|e| StorageError::from_io(&path, e))?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(path));
        }
        Ok(metadata.len())
    }

    async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok((_, full)) => fs::try_exists(&full).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn create_directory(
        &self,
        path: &str,
        create_if_missing: bool,
    ) -> Result<DirectoryHandle, StorageError> {
        let (path, full) = self.resolve(path)?;

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(&path, e))?;
        }

        match fs::create_dir(&full).await {
            Ok(()) => Ok(DirectoryHandle {
                path,
                created: true,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let is_dir = fs::metadata(&full)
                    .await
                    .map(|m| m.is_dir())
                    .unwrap_or(false);
                if create_if_missing && is_dir {
                    Ok(DirectoryHandle {
                        path,
                        created: false,
                    })
                } else {
                    Err(StorageError::AlreadyExists(path))
                }
            }
            Err(e) => Err(StorageError::from_io(&path, e)),
        }
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
