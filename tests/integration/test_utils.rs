//! Test utilities for integration tests.
//!
//! Storage backends that observe or break writes, and builders for the
//! TIFF stacks acquisition software produces.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use voxel_archive::error::StorageError;
use voxel_archive::storage::{DirectoryHandle, OriginPrivateStore, StorageBackend, StorageHandle};
use voxel_archive::{
    CancellationToken, LayerDescriptor, PreprocessRequest, SourceFile, VoxelResolution,
};

// =============================================================================
// Tracking Backend
// =============================================================================

/// Wraps a backend and records how many writes overlap.
///
/// Each write sleeps for `delay` so that concurrent writes actually overlap.
pub struct TrackingBackend {
    inner: Arc<dyn StorageBackend>,
    delay: Duration,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl TrackingBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn peak(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak)
    }

    pub fn writes(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.writes)
    }
}

#[async_trait]
impl StorageBackend for TrackingBackend {
    async fn write(&self, path: &str, offset: u64, data: Bytes) -> Result<(), StorageError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = self.inner.write(path, offset, data).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn read(&self, path: &str, offset: u64, len: usize) -> Result<Bytes, StorageError> {
        self.inner.read(path, offset, len).await
    }

    async fn size(&self, path: &str) -> Result<u64, StorageError> {
        self.inner.size(path).await
    }

    async fn exists(&self, path: &str) -> bool {
        self.inner.exists(path).await
    }

    async fn create_directory(
        &self,
        path: &str,
        create_if_missing: bool,
    ) -> Result<DirectoryHandle, StorageError> {
        self.inner.create_directory(path, create_if_missing).await
    }

    fn identifier(&self) -> &str {
        "tracking://"
    }
}

// =============================================================================
// Faulty Backend
// =============================================================================

/// What a [`FaultyBackend`] does on each write.
#[derive(Clone)]
pub enum Fault {
    /// Fail every write whose path contains the pattern
    FailPathsContaining(String),

    /// Cancel the token once this many writes have completed
    CancelAfter(usize, CancellationToken),
}

/// Wraps a backend and injects failures into writes.
pub struct FaultyBackend {
    inner: Arc<dyn StorageBackend>,
    fault: Fault,
    writes: AtomicUsize,
}

impl FaultyBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, fault: Fault) -> Self {
        Self {
            inner,
            fault,
            writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StorageBackend for FaultyBackend {
    async fn write(&self, path: &str, offset: u64, data: Bytes) -> Result<(), StorageError> {
        if let Fault::FailPathsContaining(pattern) = &self.fault {
            if path.contains(pattern.as_str()) {
                return Err(StorageError::IoFailure {
                    path: path.to_string(),
                    message: "injected failure".to_string(),
                });
            }
        }

        self.inner.write(path, offset, data).await?;
        let done = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Fault::CancelAfter(limit, token) = &self.fault {
            if done >= *limit {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn read(&self, path: &str, offset: u64, len: usize) -> Result<Bytes, StorageError> {
        self.inner.read(path, offset, len).await
    }

    async fn size(&self, path: &str) -> Result<u64, StorageError> {
        self.inner.size(path).await
    }

    async fn exists(&self, path: &str) -> bool {
        self.inner.exists(path).await
    }

    async fn create_directory(
        &self,
        path: &str,
        create_if_missing: bool,
    ) -> Result<DirectoryHandle, StorageError> {
        self.inner.create_directory(path, create_if_missing).await
    }

    fn identifier(&self) -> &str {
        "faulty://"
    }
}

// =============================================================================
// Storage Helpers
// =============================================================================

/// A fresh in-process archive namespace.
pub fn memory_storage(dataset_id: &str) -> StorageHandle {
    StorageHandle::origin(&OriginPrivateStore::new(), dataset_id, "archive")
}

/// The raw backend behind a fresh in-process namespace.
pub fn memory_backend(dataset_id: &str) -> Arc<dyn StorageBackend> {
    Arc::new(OriginPrivateStore::new().open(dataset_id, "archive"))
}

pub fn handle_over(backend: Arc<dyn StorageBackend>, dataset_id: &str) -> StorageHandle {
    StorageHandle::new(backend, "", dataset_id)
}

// =============================================================================
// TIFF Builders
// =============================================================================

/// Build a little-endian, uncompressed, single-strip-per-page grayscale
/// stack. `pages` holds raw little-endian samples for each page.
pub fn gray_tiff(width: u32, height: u32, bits: u16, format: u16, pages: &[Vec<u8>]) -> Bytes {
    let mut out = Vec::new();
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    let mut next_patch = 4usize;

    for page in pages {
        let strip_offset = out.len() as u32;
        out.extend_from_slice(page);
        if out.len() % 2 == 1 {
            out.push(0);
        }

        let tags: [(u16, u16, u32); 9] = [
            (256, 4, width),
            (257, 4, height),
            (258, 3, bits as u32),
            (259, 3, 1),
            (262, 3, 1),
            (273, 4, strip_offset),
            (277, 3, 1),
            (278, 4, height),
            (279, 4, page.len() as u32),
        ];
        let ifd_offset = out.len() as u32;
        out[next_patch..next_patch + 4].copy_from_slice(&ifd_offset.to_le_bytes());

        out.extend_from_slice(&(tags.len() as u16 + 1).to_le_bytes());
        for (tag, field_type, value) in tags {
            push_entry(&mut out, tag, field_type, value);
        }
        push_entry(&mut out, 339, 3, format as u32);
        next_patch = out.len();
        out.extend_from_slice(&0u32.to_le_bytes());
    }

    Bytes::from(out)
}

fn push_entry(out: &mut Vec<u8>, tag: u16, field_type: u16, value: u32) {
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&field_type.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    if field_type == 3 {
        out.extend_from_slice(&(value as u16).to_le_bytes());
        out.extend_from_slice(&[0, 0]);
    } else {
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// 16-bit stack whose samples are `f(x, y, z)`.
pub fn u16_stack(width: u32, height: u32, depth: u32, f: impl Fn(u32, u32, u32) -> u16) -> Bytes {
    let pages: Vec<Vec<u8>> = (0..depth)
        .map(|z| {
            let mut page = Vec::with_capacity((width * height * 2) as usize);
            for y in 0..height {
                for x in 0..width {
                    page.extend_from_slice(&f(x, y, z).to_le_bytes());
                }
            }
            page
        })
        .collect();
    gray_tiff(width, height, 16, 1, &pages)
}

/// 32-bit signed integer stack; decodable but not normalizable.
pub fn i32_stack(width: u32, height: u32) -> Bytes {
    let page = vec![0u8; (width * height * 4) as usize];
    gray_tiff(width, height, 32, 2, &[page])
}

/// A page header claiming 0xFFFFFFFF x 0xFFFFFFFF 8-bit pixels, backed by
/// a single 1-byte strip.
pub fn oversized_tiff() -> Bytes {
    let mut out = Vec::new();
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&12u32.to_le_bytes());
    out.extend_from_slice(&[7, 0, 0, 0]);

    let tags: [(u16, u16, u32); 5] = [
        (256, 4, u32::MAX),
        (257, 4, u32::MAX),
        (258, 3, 8),
        (273, 4, 8),
        (279, 4, 1),
    ];
    out.extend_from_slice(&(tags.len() as u16).to_le_bytes());
    for (tag, field_type, value) in tags {
        push_entry(&mut out, tag, field_type, value);
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    Bytes::from(out)
}

// =============================================================================
// Request Builders
// =============================================================================

pub fn source(name: &str, bytes: Bytes) -> SourceFile {
    SourceFile {
        name: name.to_string(),
        bytes,
    }
}

pub fn layer(channel: &str, key: &str, files: Vec<SourceFile>) -> LayerDescriptor {
    LayerDescriptor {
        channel_id: channel.to_string(),
        channel_label: channel.to_string(),
        layer_key: key.to_string(),
        label: key.to_string(),
        files,
        is_segmentation: false,
    }
}

/// A layer with `timepoints` 16-bit volumes of `width x height x depth`.
pub fn u16_layer(
    channel: &str,
    key: &str,
    timepoints: u32,
    (width, height, depth): (u32, u32, u32),
) -> LayerDescriptor {
    let files = (0..timepoints)
        .map(|t| {
            source(
                &format!("{}_t{}.tif", key, t),
                u16_stack(width, height, depth, move |x, y, z| {
                    (x * 100 + y * 10 + z + t * 1000) as u16
                }),
            )
        })
        .collect();
    layer(channel, key, files)
}

pub fn request(dataset_id: &str, layers: Vec<LayerDescriptor>) -> PreprocessRequest {
    PreprocessRequest {
        dataset_id: dataset_id.to_string(),
        layers,
        track_sets: Vec::new(),
        voxel_resolution: VoxelResolution::default(),
    }
}
