//! Volume normalization.
//!
//! Converts decoded slices of one timepoint into a [`NormalizedVolume`].
//! Intensity layers are contrast-stretched into 0-255:
//!
//! ```text
//! out = clamp(round((value - min) / (max - min) * 255), 0, 255)
//! ```
//!
//! with `max == min` producing an all-zero volume. Segmentation layers keep
//! their label values as u16. In both cases the original `(min, max)` is
//! carried along for display.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::NormalizeError;
use crate::format::tiff::{RasterStack, SAMPLE_FORMAT_FLOAT, SAMPLE_FORMAT_UINT};

use super::{DataType, NormalizedVolume, VoxelEncoding};

// =============================================================================
// Source Samples
// =============================================================================

/// Source sample encodings the normalizer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    U8,
    U16,
    F32,
}

impl SampleType {
    /// Map a TIFF `(BitsPerSample, SampleFormat)` pair to a sample type.
    pub fn from_tiff(bits: u16, format: u16) -> Result<Self, NormalizeError> {
        match (bits, format) {
            (8, SAMPLE_FORMAT_UINT) => Ok(SampleType::U8),
            (16, SAMPLE_FORMAT_UINT) => Ok(SampleType::U16),
            (32, SAMPLE_FORMAT_FLOAT) => Ok(SampleType::F32),
            _ => Err(NormalizeError::UnsupportedSampleType { bits, format }),
        }
    }

    /// Bytes per sample.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            SampleType::U8 => 1,
            SampleType::U16 => 2,
            SampleType::F32 => 4,
        }
    }

    /// The data type tag recorded for volumes of this source.
    pub const fn data_type(self) -> DataType {
        match self {
            SampleType::U8 => DataType::Uint8,
            SampleType::U16 => DataType::Uint16,
            SampleType::F32 => DataType::Float32,
        }
    }
}

/// One decoded 2D slice, samples little-endian and channel-interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSlice {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub sample_type: SampleType,
    pub data: Bytes,
}

impl RawSlice {
    fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.channels as usize)?
            .checked_mul(self.sample_type.size_in_bytes())
    }

    /// Call `f` with every sample as f64.
    fn for_each_value(&self, mut f: impl FnMut(f64)) {
        match self.sample_type {
            SampleType::U8 => self.data.iter().for_each(|&b| f(b as f64)),
            SampleType::U16 => self
                .data
                .chunks_exact(2)
                .for_each(|c| f(u16::from_le_bytes([c[0], c[1]]) as f64)),
            SampleType::F32 => self
                .data
                .chunks_exact(4)
                .for_each(|c| f(f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)),
        }
    }
}

// =============================================================================
// Range Policy
// =============================================================================

/// Where the `(min, max)` used for rescaling comes from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", tag = "policy")]
pub enum RangePolicy {
    /// Each timepoint is stretched over its own finite min/max.
    #[default]
    PerVolume,

    /// Use a caller-supplied range for every timepoint.
    Fixed { min: f64, max: f64 },
}

/// Rescale one value into 0-255.
///
/// Non-finite values and degenerate ranges (`max <= min`) map to 0.
#[inline]
pub fn rescale(value: f64, min: f64, max: f64) -> u8 {
    if !value.is_finite() || max <= min {
        return 0;
    }
    ((value - min) / (max - min) * 255.0)
        .round()
        .clamp(0.0, 255.0) as u8
}

#[inline]
fn to_label(value: f64) -> u16 {
    if !value.is_finite() {
        return 0;
    }
    value.round().clamp(0.0, u16::MAX as f64) as u16
}

// =============================================================================
// Normalizer
// =============================================================================

/// Converts raw slices into normalized volumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    policy: RangePolicy,
}

impl Normalizer {
    pub fn new(policy: RangePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RangePolicy {
        self.policy
    }

    /// Normalize all pages of a decoded TIFF stack as one timepoint.
    pub fn normalize_stack(
        &self,
        stack: &RasterStack,
        is_segmentation: bool,
    ) -> Result<NormalizedVolume, NormalizeError> {
        let sample_type = SampleType::from_tiff(stack.bits_per_sample, stack.sample_format)?;
        let channels = u8::try_from(stack.samples_per_pixel).map_err(|_| {
            NormalizeError::UnsupportedSampleType {
                bits: stack.bits_per_sample,
                format: stack.sample_format,
            }
        })?;

        let slices: Vec<RawSlice> = stack
            .slices
            .iter()
            .map(|data| RawSlice {
                width: stack.width,
                height: stack.height,
                channels,
                sample_type,
                data: data.clone(),
            })
            .collect();

        self.normalize(&slices, is_segmentation)
    }

    /// Normalize `slices` (one per z) into a single volume.
    ///
    /// # Errors
    /// - `EmptyVolume` if `slices` is empty
    /// - `DimensionMismatch` if slices disagree in width, height or channels
    /// - `SliceLength` if a slice buffer does not match its shape
    pub fn normalize(
        &self,
        slices: &[RawSlice],
        is_segmentation: bool,
    ) -> Result<NormalizedVolume, NormalizeError> {
        let first = slices.first().ok_or(NormalizeError::EmptyVolume)?;
        let expected_shape = (first.width, first.height, first.channels);

        for (index, slice) in slices.iter().enumerate() {
            let shape = (slice.width, slice.height, slice.channels);
            if shape != expected_shape {
                return Err(NormalizeError::DimensionMismatch {
                    slice: index,
                    expected: expected_shape,
                    actual: shape,
                });
            }
            let expected = slice.expected_len();
            if expected != Some(slice.data.len()) {
                return Err(NormalizeError::SliceLength {
                    slice: index,
                    expected: expected.unwrap_or(usize::MAX),
                    actual: slice.data.len(),
                });
            }
        }

        let value_range = match self.policy {
            RangePolicy::Fixed { min, max } => (min, max),
            RangePolicy::PerVolume => finite_range(slices),
        };

        let encoding = if is_segmentation {
            VoxelEncoding::Label16
        } else {
            VoxelEncoding::Normalized8
        };
        let depth = slices.len() as u32;
        let len = NormalizedVolume::expected_len(
            first.width,
            first.height,
            depth,
            first.channels,
            encoding,
        )
        .unwrap_or_default();

        let mut samples = BytesMut::with_capacity(len);
        let (min, max) = value_range;
        for slice in slices {
            match encoding {
                VoxelEncoding::Normalized8 => {
                    slice.for_each_value(|v| samples.put_u8(rescale(v, min, max)))
                }
                VoxelEncoding::Label16 => {
                    slice.for_each_value(|v| samples.put_u16_le(to_label(v)))
                }
            }
        }

        Ok(NormalizedVolume {
            width: first.width,
            height: first.height,
            depth,
            channels: first.channels,
            data_type: first.sample_type.data_type(),
            encoding,
            samples: samples.freeze(),
            value_range,
        })
    }
}

/// Finite min/max over all samples; `(0, 0)` if there are none.
fn finite_range(slices: &[RawSlice]) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for slice in slices {
        slice.for_each_value(|v| {
            if v.is_finite() {
                min = min.min(v);
                max = max.max(v);
            }
        });
    }
    if min > max {
        (0.0, 0.0)
    } else {
        (min, max)
    }
}

// =============================================================================
// Tests
// =============================================================================
