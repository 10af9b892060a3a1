//! Mip level generation.
//!
//! Each coarser level halves every axis with a 2x box filter:
//!
//! ```text
//! level 0   256 x 256 x 64
//! level 1   128 x 128 x 32
//! level 2    64 x  64 x 16
//! level 3    32 x  32 x  8   <- max dimension <= min_dimension, stop
//! ```
//!
//! Odd edges average only the voxels that exist and axes of size 1 stay 1.
//! Label volumes take the first voxel of each block so label identities are
//! never blended.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::{NormalizedVolume, VoxelEncoding};

/// Default largest dimension at which mip generation stops.
pub const DEFAULT_MIN_MIP_DIMENSION: u32 = 32;

/// Default maximum number of coarser levels.
pub const DEFAULT_MAX_MIP_LEVELS: u32 = 6;

/// When to stop generating coarser levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MipConfig {
    /// Stop once the largest dimension is at or below this value
    pub min_dimension: u32,

    /// Never produce more than this many coarser levels
    pub max_levels: u32,
}

impl Default for MipConfig {
    fn default() -> Self {
        Self {
            min_dimension: DEFAULT_MIN_MIP_DIMENSION,
            max_levels: DEFAULT_MAX_MIP_LEVELS,
        }
    }
}

impl MipConfig {
    /// Shapes of the coarser levels for a level-0 volume of this size, in
    /// level order (index 0 is level 1).
    pub fn plan(&self, width: u32, height: u32, depth: u32) -> Vec<(u32, u32, u32)> {
        let mut shapes = Vec::new();
        let mut current = (width, height, depth);
        while self.should_descend(max3(current), shapes.len() as u32) {
            current = halved(current);
            shapes.push(current);
        }
        shapes
    }

    /// Whether a level with this largest dimension, reached after
    /// `levels_done` coarser levels, gets a child.
    pub fn should_descend(&self, max_dimension: u32, levels_done: u32) -> bool {
        levels_done < self.max_levels && max_dimension > self.min_dimension && max_dimension > 1
    }
}

fn max3((w, h, d): (u32, u32, u32)) -> u32 {
    w.max(h).max(d)
}

fn halved((w, h, d): (u32, u32, u32)) -> (u32, u32, u32) {
    (w.div_ceil(2), h.div_ceil(2), d.div_ceil(2))
}

/// Produce the next coarser level of `volume`.
pub fn downsample(volume: &NormalizedVolume) -> NormalizedVolume {
    let (w, h, d) = (
        volume.width as usize,
        volume.height as usize,
        volume.depth as usize,
    );
    let (nw, nh, nd) = halved((volume.width, volume.height, volume.depth));
    let channels = volume.channels as usize;
    let bytes_per_sample = volume.encoding.bytes_per_sample();

    let mut out = BytesMut::with_capacity(
        NormalizedVolume::expected_len(nw, nh, nd, volume.channels, volume.encoding)
            .unwrap_or_default(),
    );

    let voxel_index = |x: usize, y: usize, z: usize| (z * h + y) * w + x;

    for oz in 0..nd as usize {
        for oy in 0..nh as usize {
            for ox in 0..nw as usize {
                match volume.encoding {
                    VoxelEncoding::Label16 => {
                        let start = voxel_index(2 * ox, 2 * oy, 2 * oz) * channels * bytes_per_sample;
                        out.put_slice(&volume.samples[start..start + channels * bytes_per_sample]);
                    }
                    VoxelEncoding::Normalized8 => {
                        for c in 0..channels {
                            let mut sum = 0u32;
                            let mut count = 0u32;
                            for z in 2 * oz..(2 * oz + 2).min(d) {
                                for y in 2 * oy..(2 * oy + 2).min(h) {
                                    for x in 2 * ox..(2 * ox + 2).min(w) {
                                        sum += volume.samples[voxel_index(x, y, z) * channels + c]
                                            as u32;
                                        count += 1;
                                    }
                                }
                            }
                            out.put_u8(((sum + count / 2) / count).min(255) as u8);
                        }
                    }
                }
            }
        }
    }

    NormalizedVolume {
        width: nw,
        height: nh,
        depth: nd,
        channels: volume.channels,
        data_type: volume.data_type,
        encoding: volume.encoding,
        samples: out.freeze(),
        value_range: volume.value_range,
    }
}

/// Drives [`downsample`] under a [`MipConfig`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MipGenerator {
    config: MipConfig,
}

impl MipGenerator {
    pub fn new(config: MipConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MipConfig {
        &self.config
    }

    /// The level below `volume`, or `None` once generation should stop.
    ///
    /// `levels_done` is the number of coarser levels already produced for
    /// this volume's level-0 ancestor.
    pub fn next_level(
        &self,
        volume: &NormalizedVolume,
        levels_done: u32,
    ) -> Option<NormalizedVolume> {
        if self
            .config
            .should_descend(volume.max_dimension(), levels_done)
        {
            Some(downsample(volume))
        } else {
            None
        }
    }

    /// Every coarser level of `level0`, finest first.
    pub fn generate_all(&self, level0: &NormalizedVolume) -> Vec<NormalizedVolume> {
        let mut levels: Vec<NormalizedVolume> = Vec::new();
        while let Some(next) = self.next_level(levels.last().unwrap_or(level0), levels.len() as u32)
        {
            levels.push(next);
        }
        levels
    }
}
