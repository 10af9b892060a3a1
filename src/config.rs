//! Configuration for the `voxel-archive` binary.
//!
//! Settings come from command-line arguments or environment variables with
//! the `VXA_` prefix:
//!
//! - `VXA_INPUT` - Dataset descriptor (preprocess)
//! - `VXA_OUTPUT` - Archive directory (preprocess) or export directory (export)
//! - `VXA_ARCHIVE` - Archive directory to read (inspect, export)
//! - `VXA_MAX_IN_FLIGHT` - Concurrent chunk writes (default: 4)
//! - `VXA_SHARD_COUNT` - Shards per level (default: 16)
//! - `VXA_NO_SHARDING` - Write unsharded chunk paths
//! - `VXA_MIN_MIP_DIMENSION` - Stop mips at this size (default: 32)
//! - `VXA_MAX_MIP_LEVELS` - Maximum mip levels (default: 6)
//! - `VXA_OVERWRITE` - Replace an existing archive
//!
//! The dataset descriptor is a JSON file listing channels, layers and their
//! per-timepoint files (paths relative to the descriptor):
//!
//! ```json
//! {
//!   "datasetId": "embryo-01",
//!   "voxelResolution": { "x": 0.5, "y": 0.5, "z": 2.0, "unit": "um" },
//!   "channels": [
//!     { "id": "c1", "name": "Nuclei",
//!       "layers": [{ "key": "c1/raw", "label": "Raw", "files": ["t0.tif", "t1.tif"] }] }
//!   ],
//!   "trackSets": []
//! }
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use crate::archive::{
    ShardingConfig, StorageStrategy, TrackRow, VoxelResolution, DEFAULT_MAX_IN_FLIGHT_WRITES,
    DEFAULT_SHARD_COUNT,
};
use crate::pipeline::PreprocessConfig;
use crate::volume::{MipConfig, RangePolicy, DEFAULT_MAX_MIP_LEVELS, DEFAULT_MIN_MIP_DIMENSION};

// =============================================================================
// CLI Arguments
// =============================================================================

/// voxel-archive - Preprocess microscopy volumes into chunked archives.
#[derive(Parser, Debug, Clone)]
#[command(name = "voxel-archive")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Normalize a dataset and write it as a chunked archive
    Preprocess(PreprocessArgs),

    /// Print the manifest summary of an archive
    Inspect(InspectArgs),

    /// Export one archived layer as RGB TIFF stacks
    Export(ExportArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PreprocessArgs {
    /// Dataset descriptor (JSON).
    #[arg(short, long, env = "VXA_INPUT")]
    pub input: PathBuf,

    /// Directory the archive is written to.
    #[arg(short, long, env = "VXA_OUTPUT")]
    pub output: PathBuf,

    // =========================================================================
    // Write Strategy
    // =========================================================================
    /// Maximum number of chunk writes in flight.
    #[arg(long, default_value_t = DEFAULT_MAX_IN_FLIGHT_WRITES, env = "VXA_MAX_IN_FLIGHT")]
    pub max_in_flight: u32,

    /// Number of shards per level.
    #[arg(long, default_value_t = DEFAULT_SHARD_COUNT, env = "VXA_SHARD_COUNT")]
    pub shard_count: u32,

    /// Write chunks without shard directories.
    #[arg(long, default_value_t = false, env = "VXA_NO_SHARDING")]
    pub no_sharding: bool,

    // =========================================================================
    // Mips
    // =========================================================================
    /// Stop generating mips once the largest dimension is at or below this.
    #[arg(long, default_value_t = DEFAULT_MIN_MIP_DIMENSION, env = "VXA_MIN_MIP_DIMENSION")]
    pub min_mip_dimension: u32,

    /// Maximum number of mip levels below level 0.
    #[arg(long, default_value_t = DEFAULT_MAX_MIP_LEVELS, env = "VXA_MAX_MIP_LEVELS")]
    pub max_mip_levels: u32,

    // =========================================================================
    // Normalization
    // =========================================================================
    /// Fixed intensity minimum (requires --range-max).
    #[arg(long, requires = "range_max")]
    pub range_min: Option<f64>,

    /// Fixed intensity maximum (requires --range-min).
    #[arg(long, requires = "range_min")]
    pub range_max: Option<f64>,

    /// Replace chunks and manifest of an existing archive.
    #[arg(long, default_value_t = false, env = "VXA_OVERWRITE")]
    pub overwrite: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl PreprocessArgs {
    /// Validate the arguments and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.input.as_os_str().is_empty() {
            return Err("Dataset descriptor is required. Set --input or VXA_INPUT".to_string());
        }
        if self.output.as_os_str().is_empty() {
            return Err("Output directory is required. Set --output or VXA_OUTPUT".to_string());
        }

        self.strategy().validate()?;

        if self.max_mip_levels > 16 {
            return Err("max_mip_levels must be at most 16".to_string());
        }

        match (self.range_min, self.range_max) {
            (Some(min), Some(max)) if !(min.is_finite() && max.is_finite() && min < max) => {
                Err(format!("range_min ({}) must be below range_max ({})", min, max))
            }
            (Some(_), None) | (None, Some(_)) => {
                Err("range_min and range_max must be given together".to_string())
            }
            _ => Ok(()),
        }
    }

    pub fn strategy(&self) -> StorageStrategy {
        StorageStrategy {
            max_in_flight_chunk_writes: self.max_in_flight,
            sharding: ShardingConfig {
                enabled: !self.no_sharding,
                shard_count: self.shard_count,
            },
        }
    }

    pub fn range_policy(&self) -> RangePolicy {
        match (self.range_min, self.range_max) {
            (Some(min), Some(max)) => RangePolicy::Fixed { min, max },
            _ => RangePolicy::PerVolume,
        }
    }

    /// Session settings for the preprocessor.
    pub fn preprocess_config(&self) -> PreprocessConfig {
        PreprocessConfig {
            strategy: self.strategy(),
            mip: MipConfig {
                min_dimension: self.min_mip_dimension,
                max_levels: self.max_mip_levels,
            },
            range_policy: self.range_policy(),
            overwrite: self.overwrite,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct InspectArgs {
    /// Archive directory.
    #[arg(short, long, env = "VXA_ARCHIVE")]
    pub archive: PathBuf,

    /// Also read every track set to count unique tracks.
    #[arg(long, default_value_t = false)]
    pub tracks: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Archive directory.
    #[arg(short, long, env = "VXA_ARCHIVE")]
    pub archive: PathBuf,

    /// Key of the layer to export.
    #[arg(short, long)]
    pub layer: String,

    /// Directory to create for the exported stacks; must not exist.
    #[arg(short, long, env = "VXA_OUTPUT")]
    pub output: PathBuf,

    /// Resolution level to export.
    #[arg(long, default_value_t = 0)]
    pub level: u32,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl ExportArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.layer.trim().is_empty() {
            return Err("Layer key is required. Set --layer".to_string());
        }
        if self.output.file_name().is_none() {
            return Err(format!(
                "Output {} must name a directory to create",
                self.output.display()
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Dataset Descriptor
// =============================================================================

/// Parsed dataset descriptor file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDescriptor {
    pub dataset_id: String,

    #[serde(default)]
    pub voxel_resolution: VoxelResolution,

    pub channels: Vec<ChannelDescriptor>,

    #[serde(default)]
    pub track_sets: Vec<TrackSetDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDescriptor {
    pub id: String,
    pub name: String,
    pub layers: Vec<LayerFiles>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerFiles {
    pub key: String,

    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub is_segmentation: bool,

    /// One file per timepoint, in order
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSetDescriptor {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub channel_id: Option<String>,

    #[serde(default)]
    pub rows: Vec<TrackRow>,
}

impl DatasetDescriptor {
    pub fn from_json(bytes: &[u8]) -> Result<Self, String> {
        let descriptor: Self =
            serde_json::from_slice(bytes).map_err(|e| format!("Invalid dataset descriptor: {}", e))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.dataset_id.trim().is_empty() {
            return Err("datasetId must not be empty".to_string());
        }
        if self.channels.is_empty() {
            return Err("dataset has no channels".to_string());
        }
        for channel in &self.channels {
            if channel.layers.is_empty() {
                return Err(format!("channel {} has no layers", channel.id));
            }
        }
        self.voxel_resolution.validate()
    }

    /// Total number of input files.
    pub fn file_count(&self) -> usize {
        self.channels
            .iter()
            .flat_map(|c| c.layers.iter())
            .map(|l| l.files.len())
            .sum()
    }
}

// =============================================================================
// Tests
// =============================================================================
