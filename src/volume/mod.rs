//! Canonical in-memory volume representation.
//!
//! Every layer timepoint, whatever its source encoding, is turned into a
//! [`NormalizedVolume`] before it is stored:
//!
//! ```text
//! RasterStack (u8 / u16 / f32 slices)
//!        │  Normalizer
//!        ▼
//! NormalizedVolume ──► chunk (level 0)
//!        │  MipGenerator
//!        ▼
//! NormalizedVolume ──► chunk (level 1, 2, ...)
//! ```
//!
//! Samples are laid out x-fastest, then y, then z, with the channels of a
//! voxel stored next to each other.

mod mip;
mod normalize;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use mip::{downsample, MipConfig, MipGenerator, DEFAULT_MAX_MIP_LEVELS, DEFAULT_MIN_MIP_DIMENSION};
pub use normalize::{rescale, Normalizer, RangePolicy, RawSlice, SampleType};

// =============================================================================
// DataType
// =============================================================================

/// Sample type of the source data a volume was normalized from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Uint8,
    Uint16,
    Float32,
}

impl DataType {
    /// Tag byte used in chunk headers.
    pub const fn tag(self) -> u8 {
        match self {
            DataType::Uint8 => 1,
            DataType::Uint16 => 2,
            DataType::Float32 => 3,
        }
    }

    /// Inverse of [`DataType::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(DataType::Uint8),
            2 => Some(DataType::Uint16),
            3 => Some(DataType::Float32),
            _ => None,
        }
    }
}

// =============================================================================
// VoxelEncoding
// =============================================================================

/// How samples are stored in a normalized volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VoxelEncoding {
    /// Intensities rescaled to 0-255, one byte per sample
    Normalized8,

    /// Segmentation labels, little-endian u16 per sample, never rescaled
    Label16,
}

impl VoxelEncoding {
    /// Bytes per stored sample.
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            VoxelEncoding::Normalized8 => 1,
            VoxelEncoding::Label16 => 2,
        }
    }

    /// Tag byte used in chunk headers.
    pub const fn tag(self) -> u8 {
        match self {
            VoxelEncoding::Normalized8 => 1,
            VoxelEncoding::Label16 => 2,
        }
    }

    /// Inverse of [`VoxelEncoding::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(VoxelEncoding::Normalized8),
            2 => Some(VoxelEncoding::Label16),
            _ => None,
        }
    }
}

// =============================================================================
// NormalizedVolume
// =============================================================================

/// One timepoint of one layer in canonical form.
///
/// Invariant: `samples.len() == width * height * depth * channels *
/// encoding.bytes_per_sample()`.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedVolume {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub channels: u8,

    /// Source sample type
    pub data_type: DataType,

    /// Storage encoding of `samples`
    pub encoding: VoxelEncoding,

    /// Voxel data, x-fastest, channel-interleaved
    pub samples: Bytes,

    /// (min, max) of the source values, in source units
    pub value_range: (f64, f64),
}

impl NormalizedVolume {
    /// Byte length a volume of this shape and encoding must have, `None`
    /// if it does not fit in `usize`.
    pub fn expected_len(
        width: u32,
        height: u32,
        depth: u32,
        channels: u8,
        encoding: VoxelEncoding,
    ) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(depth as usize)?
            .checked_mul(channels as usize)?
            .checked_mul(encoding.bytes_per_sample())
    }

    /// Number of voxels.
    pub fn voxel_count(&self) -> usize {
        self.width as usize * self.height as usize * self.depth as usize
    }

    /// `(width, height, depth, channels)`.
    pub fn shape(&self) -> (u32, u32, u32, u8) {
        (self.width, self.height, self.depth, self.channels)
    }

    /// Largest spatial dimension.
    pub fn max_dimension(&self) -> u32 {
        self.width.max(self.height).max(self.depth)
    }

    /// Whether the sample buffer matches the declared shape.
    pub fn is_consistent(&self) -> bool {
        Some(self.samples.len())
            == Self::expected_len(
                self.width,
                self.height,
                self.depth,
                self.channels,
                self.encoding,
            )
    }

    /// Stored value of channel `c` at voxel `(x, y, z)`.
    ///
    /// # Panics
    /// Panics if the coordinates are out of bounds.
    pub fn sample(&self, x: u32, y: u32, z: u32, c: u8) -> u16 {
        let voxel = (z as usize * self.height as usize + y as usize) * self.width as usize
            + x as usize;
        let index = voxel * self.channels as usize + c as usize;
        match self.encoding {
            VoxelEncoding::Normalized8 => self.samples[index] as u16,
            VoxelEncoding::Label16 => {
                u16::from_le_bytes([self.samples[index * 2], self.samples[index * 2 + 1]])
            }
        }
    }
}
