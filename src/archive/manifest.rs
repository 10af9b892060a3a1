//! Archive manifest and track tables.
//!
//! The manifest is the last object written by a preprocessing session, so
//! its presence marks a complete archive. Readers load it first and check
//! `format` and `version` before interpreting anything else.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::chunk::CHUNK_HEADER_SIZE;
use super::layout::StorageStrategy;
use crate::error::ImportError;
use crate::volume::{DataType, MipConfig, NormalizedVolume, RangePolicy, VoxelEncoding};

/// Value of the manifest `format` field.
pub const MANIFEST_FORMAT: &str = "voxel-archive";

/// Newest manifest schema this crate reads and the one it writes.
pub const MANIFEST_VERSION: u32 = 1;

// =============================================================================
// Resolution
// =============================================================================

/// Physical voxel size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoxelResolution {
    pub x: f64,
    pub y: f64,
    pub z: f64,

    /// Time step between timepoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<f64>,

    pub unit: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_unit: Option<String>,

    /// Whether viewers should scale z by `z / x`
    #[serde(default)]
    pub correct_anisotropy: bool,
}

impl Default for VoxelResolution {
    fn default() -> Self {
        Self {
            x: 1.0,
            y: 1.0,
            z: 1.0,
            t: None,
            unit: "um".to_string(),
            time_unit: None,
            correct_anisotropy: false,
        }
    }
}

impl VoxelResolution {
    pub fn validate(&self) -> Result<(), String> {
        for (axis, value) in [("x", self.x), ("y", self.y), ("z", self.z)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(format!("voxel size {} must be positive, got {}", axis, value));
            }
        }
        if let Some(t) = self.t {
            if !(t.is_finite() && t > 0.0) {
                return Err(format!("time step must be positive, got {}", t));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Summaries
// =============================================================================

/// Per-layer statistics, accumulated during level 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerSummary {
    pub key: String,
    pub label: String,
    pub is_segmentation: bool,
    pub volume_count: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub channels: u8,
    pub data_type: DataType,
    pub encoding: VoxelEncoding,

    /// Smallest source value across all timepoints
    pub min: f64,

    /// Largest source value across all timepoints
    pub max: f64,

    /// Number of coarser levels stored below level 0
    pub mip_levels: u32,
}

impl LayerSummary {
    /// Start a summary from the first volume of a layer.
    pub fn from_first_volume(
        key: &str,
        label: &str,
        is_segmentation: bool,
        volume: &NormalizedVolume,
    ) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            is_segmentation,
            volume_count: 1,
            width: volume.width,
            height: volume.height,
            depth: volume.depth,
            channels: volume.channels,
            data_type: volume.data_type,
            encoding: volume.encoding,
            min: volume.value_range.0,
            max: volume.value_range.1,
            mip_levels: 0,
        }
    }

    /// Fold another timepoint into the summary.
    pub fn add_volume(&mut self, volume: &NormalizedVolume) {
        self.volume_count += 1;
        self.min = self.min.min(volume.value_range.0);
        self.max = self.max.max(volume.value_range.1);
    }

    pub fn shape(&self) -> (u32, u32, u32, u8) {
        (self.width, self.height, self.depth, self.channels)
    }

    /// Stored size of one level-0 chunk of this layer.
    pub fn level0_chunk_len(&self) -> u64 {
        NormalizedVolume::expected_len(
            self.width,
            self.height,
            self.depth,
            self.channels,
            self.encoding,
        )
        .and_then(|len| len.checked_add(CHUNK_HEADER_SIZE))
        .map_or(u64::MAX, |len| len as u64)
    }
}

/// Per-channel summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub id: String,
    pub name: String,
    pub layers: Vec<LayerSummary>,
}

impl ChannelSummary {
    pub fn volume_count(&self) -> u64 {
        self.layers.iter().map(|l| l.volume_count as u64).sum()
    }

    /// Largest timepoint count over the channel's layers.
    pub fn timepoint_count(&self) -> u32 {
        self.layers.iter().map(|l| l.volume_count).max().unwrap_or(0)
    }
}

/// One trajectory sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackRow {
    pub track_id: u64,
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub amplitude: f64,
}

/// Per-track-set summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub id: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_channel_id: Option<String>,

    pub total_rows: u64,

    /// Distinct track ids; only known once rows have been read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_tracks: Option<u64>,
}

/// Stored form of one track set (`tracks/{id}.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackTable {
    pub id: String,
    pub rows: Vec<TrackRow>,
}

impl TrackTable {
    /// Number of distinct track ids.
    pub fn unique_tracks(&self) -> u64 {
        let ids: std::collections::HashSet<u64> = self.rows.iter().map(|r| r.track_id).collect();
        ids.len() as u64
    }
}

// =============================================================================
// Manifest
// =============================================================================

/// Durable description of a complete archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub format: String,
    pub version: u32,
    pub dataset_id: String,
    pub voxel_resolution: VoxelResolution,
    pub storage: StorageStrategy,
    pub mip: MipConfig,
    pub range_policy: RangePolicy,
    pub channels: Vec<ChannelSummary>,

    #[serde(default)]
    pub tracks: Vec<TrackSummary>,

    pub total_volume_count: u64,

    #[serde(default)]
    pub has_global_timepoint_mismatch: bool,

    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Manifest {
    /// Empty manifest for a new session.
    pub fn new(
        dataset_id: &str,
        voxel_resolution: VoxelResolution,
        storage: StorageStrategy,
        mip: MipConfig,
        range_policy: RangePolicy,
    ) -> Self {
        Self {
            format: MANIFEST_FORMAT.to_string(),
            version: MANIFEST_VERSION,
            dataset_id: dataset_id.to_string(),
            voxel_resolution,
            storage,
            mip,
            range_policy,
            channels: Vec::new(),
            tracks: Vec::new(),
            total_volume_count: 0,
            has_global_timepoint_mismatch: false,
            warnings: Vec::new(),
        }
    }

    /// Sum of every layer's volume count.
    pub fn computed_volume_count(&self) -> u64 {
        self.channels.iter().map(ChannelSummary::volume_count).sum()
    }

    pub fn layers(&self) -> impl Iterator<Item = (&ChannelSummary, &LayerSummary)> {
        self.channels
            .iter()
            .flat_map(|c| c.layers.iter().map(move |l| (c, l)))
    }

    pub fn find_layer(&self, key: &str) -> Option<&LayerSummary> {
        self.layers().map(|(_, l)| l).find(|l| l.key == key)
    }

    pub fn find_track_set(&self, id: &str) -> Option<&TrackSummary> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Total stored bytes of all level-0 chunks.
    pub fn level0_bytes(&self) -> u64 {
        self.layers()
            .map(|(_, l)| l.level0_chunk_len().saturating_mul(l.volume_count as u64))
            .fold(0u64, u64::saturating_add)
    }

    pub fn to_json(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec_pretty(self).map(Bytes::from)
    }

    /// Parse and validate manifest bytes.
    ///
    /// # Errors
    /// - `CorruptArchive` if the bytes are not a manifest of this format, or
    ///   the volume total disagrees with the layer summaries
    /// - `UnsupportedVersion` if the schema is newer than [`MANIFEST_VERSION`]
    pub fn from_json(bytes: &[u8]) -> Result<Self, ImportError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| ImportError::CorruptArchive(format!("manifest is not JSON: {}", e)))?;

        let format = value.get("format").and_then(|f| f.as_str());
        if format != Some(MANIFEST_FORMAT) {
            return Err(ImportError::CorruptArchive(format!(
                "unexpected manifest format {:?}",
                format
            )));
        }

        let version = value
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ImportError::CorruptArchive("manifest has no version".to_string()))?;
        if version > MANIFEST_VERSION as u64 {
            return Err(ImportError::UnsupportedVersion {
                found: u32::try_from(version).unwrap_or(u32::MAX),
                supported: MANIFEST_VERSION,
            });
        }

        let manifest: Manifest = serde_json::from_value(value)
            .map_err(|e| ImportError::CorruptArchive(format!("invalid manifest: {}", e)))?;

        let computed = manifest.computed_volume_count();
        if manifest.total_volume_count != computed {
            return Err(ImportError::CorruptArchive(format!(
                "totalVolumeCount is {} but layers hold {}",
                manifest.total_volume_count, computed
            )));
        }
        Ok(manifest)
    }
}
