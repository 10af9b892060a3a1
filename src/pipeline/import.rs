//! Archive import.
//!
//! An [`ArchiveReader`] opens an archive by its manifest and streams chunks
//! back into [`NormalizedVolume`]s on demand. `import_all` loads every
//! level-0 volume and is all-or-nothing: a cancelled or failed import
//! returns an error and no partial result.

use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::cancel::CancellationToken;
use super::progress::{ProgressEvent, ProgressReporter};
use crate::archive::{
    decode_chunk, track_path, ChunkKey, LayerSummary, Manifest, TrackRow, TrackSummary,
    TrackTable, MANIFEST_PATH,
};
use crate::error::ImportError;
use crate::format::tiff::decode_raster;
use crate::storage::StorageHandle;
use crate::volume::{NormalizedVolume, Normalizer};

/// Default number of decoded volumes kept by a reader.
pub const DEFAULT_VOLUME_CACHE_CAPACITY: usize = 16;

/// Options for [`ArchiveReader::import_all`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Record missing chunks instead of failing
    pub tolerate_missing: bool,
}

/// All level-0 volumes of one layer, indexed by timepoint.
#[derive(Debug, Clone)]
pub struct ImportedLayer {
    pub key: String,

    /// `None` for chunks that were missing and tolerated
    pub volumes: Vec<Option<NormalizedVolume>>,
}

#[derive(Debug, Clone)]
pub struct ImportedArchive {
    pub manifest: Manifest,
    pub layers: Vec<ImportedLayer>,
    pub missing: Vec<ChunkKey>,
    pub bytes_processed: u64,
}

impl ImportedArchive {
    pub fn layer(&self, key: &str) -> Option<&ImportedLayer> {
        self.layers.iter().find(|l| l.key == key)
    }

    /// Number of volumes actually loaded.
    pub fn volume_count(&self) -> u64 {
        self.layers
            .iter()
            .map(|l| l.volumes.iter().filter(|v| v.is_some()).count() as u64)
            .sum()
    }
}

/// Reader over a complete archive.
pub struct ArchiveReader {
    storage: StorageHandle,
    manifest: Manifest,
    cache: Mutex<LruCache<ChunkKey, NormalizedVolume>>,
    reporter: ProgressReporter,
    cancel: CancellationToken,
}

impl ArchiveReader {
    /// Open the archive at `storage` by reading its manifest.
    ///
    /// # Errors
    /// - `NotFound` if there is no manifest (including cancelled sessions)
    /// - `CorruptArchive` if the manifest cannot be parsed
    /// - `UnsupportedVersion` if the manifest schema is too new
    pub async fn open(storage: StorageHandle) -> Result<Self, ImportError> {
        let bytes = storage.read_all(MANIFEST_PATH).await?;
        let manifest = Manifest::from_json(&bytes)?;
        info!(
            storage = %storage.identifier(),
            dataset_id = %manifest.dataset_id,
            volumes = manifest.total_volume_count,
            "Opened archive"
        );

        Ok(Self {
            storage,
            manifest,
            cache: Mutex::new(LruCache::new(capacity(DEFAULT_VOLUME_CACHE_CAPACITY))),
            reporter: ProgressReporter::disabled(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_cache_capacity(mut self, volumes: usize) -> Self {
        self.cache = Mutex::new(LruCache::new(capacity(volumes)));
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    pub(crate) fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Read one volume, from the cache if possible.
    pub async fn read_volume(
        &self,
        layer_key: &str,
        timepoint: u32,
        level: u32,
    ) -> Result<NormalizedVolume, ImportError> {
        let key = ChunkKey::new(layer_key, level, timepoint);
        if let Some(volume) = self.cache.lock().await.get(&key) {
            return Ok(volume.clone());
        }

        let (volume, _) = self.fetch(&key).await?;
        self.cache.lock().await.put(key, volume.clone());
        Ok(volume)
    }

    /// Load every level-0 volume of the archive.
    pub async fn import_all(&self, options: ImportOptions) -> Result<ImportedArchive, ImportError> {
        let total_bytes = self.manifest.level0_bytes();
        let total_volumes = self.manifest.total_volume_count;
        let mut bytes_processed = 0u64;
        let mut decoded = 0u64;
        let mut layers = Vec::new();
        let mut missing = Vec::new();

        for (_, summary) in self.manifest.layers() {
            let mut volumes = Vec::with_capacity(summary.volume_count as usize);
            for timepoint in 0..summary.volume_count {
                if self.cancel.is_cancelled() {
                    info!("Import cancelled");
                    return Err(ImportError::Aborted);
                }

                let key = ChunkKey::new(summary.key.clone(), 0, timepoint);
                match self.fetch(&key).await {
                    Ok((volume, len)) => {
                        bytes_processed += len;
                        decoded += 1;
                        volumes.push(Some(volume));
                    }
                    Err(ImportError::NotFound(path)) if options.tolerate_missing => {
                        warn!(path = %path, "Missing chunk tolerated");
                        self.reporter
                            .emit(ProgressEvent::Warning(format!("missing chunk {}", path)));
                        missing.push(key);
                        volumes.push(None);
                        continue;
                    }
                    Err(e) => return Err(e),
                }

                self.reporter.emit(ProgressEvent::BytesProcessed {
                    processed: bytes_processed,
                    total: Some(total_bytes),
                });
                self.reporter.emit(ProgressEvent::VolumesDecoded {
                    decoded,
                    total: total_volumes,
                });
            }
            layers.push(ImportedLayer {
                key: summary.key.clone(),
                volumes,
            });
        }

        info!(
            volumes = decoded,
            missing = missing.len(),
            bytes = bytes_processed,
            "Import complete"
        );
        Ok(ImportedArchive {
            manifest: self.manifest.clone(),
            layers,
            missing,
            bytes_processed,
        })
    }

    /// Rows of a track set with its summary; unique tracks are counted here.
    pub async fn read_tracks(
        &self,
        track_set_id: &str,
    ) -> Result<(Vec<TrackRow>, TrackSummary), ImportError> {
        let mut summary = self
            .manifest
            .find_track_set(track_set_id)
            .cloned()
            .ok_or_else(|| ImportError::UnknownTrackSet(track_set_id.to_string()))?;

        let bytes = self.storage.read_all(&track_path(track_set_id)).await?;
        let table: TrackTable = serde_json::from_slice(&bytes).map_err(|e| {
            ImportError::CorruptArchive(format!("track set {}: {}", track_set_id, e))
        })?;
        if table.rows.len() as u64 != summary.total_rows {
            return Err(ImportError::CorruptArchive(format!(
                "track set {} holds {} rows, manifest lists {}",
                track_set_id,
                table.rows.len(),
                summary.total_rows
            )));
        }

        summary.unique_tracks = Some(table.unique_tracks());
        Ok((table.rows, summary))
    }

    /// Read, decode and check one chunk against the manifest.
    async fn fetch(&self, key: &ChunkKey) -> Result<(NormalizedVolume, u64), ImportError> {
        let summary = self
            .manifest
            .find_layer(&key.layer_key)
            .ok_or_else(|| ImportError::UnknownLayer(key.layer_key.clone()))?;
        if key.timepoint >= summary.volume_count || key.level > summary.mip_levels {
            return Err(ImportError::OutOfRange {
                layer: key.layer_key.clone(),
                timepoint: key.timepoint,
                level: key.level,
            });
        }

        let path = self.manifest.storage.chunk_path(key);
        let bytes = self.storage.read_all(&path).await?;
        let volume = decode_chunk(&bytes)
            .map_err(|e| ImportError::CorruptArchive(format!("{}: {}", path, e)))?;

        let expected = self.expected_shape(summary, key.level);
        if volume.shape() != expected || volume.encoding != summary.encoding {
            return Err(ImportError::CorruptArchive(format!(
                "{}: shape {:?} does not match manifest {:?}",
                path,
                volume.shape(),
                expected
            )));
        }

        debug!(path = %path, bytes = bytes.len(), "Chunk read");
        Ok((volume, bytes.len() as u64))
    }

    fn expected_shape(&self, summary: &LayerSummary, level: u32) -> (u32, u32, u32, u8) {
        if level == 0 {
            return summary.shape();
        }
        let plan = self
            .manifest
            .mip
            .plan(summary.width, summary.height, summary.depth);
        match plan.get(level as usize - 1) {
            Some(&(w, h, d)) => (w, h, d, summary.channels),
            None => summary.shape(),
        }
    }
}

fn capacity(volumes: usize) -> NonZeroUsize {
    NonZeroUsize::new(volumes).unwrap_or(NonZeroUsize::MIN)
}

/// Import a TIFF stack as one volume.
///
/// A container that cannot be walked is reported as `CorruptArchive`.
pub fn import_tiff_stack(bytes: &Bytes, is_segmentation: bool) -> Result<NormalizedVolume, ImportError> {
    let stack = decode_raster(bytes).map_err(|e| ImportError::CorruptArchive(e.to_string()))?;
    Ok(Normalizer::default().normalize_stack(&stack, is_segmentation)?)
}
