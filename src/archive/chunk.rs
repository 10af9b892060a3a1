//! Chunk serialization.
//!
//! Each chunk holds one [`NormalizedVolume`] behind a fixed little-endian
//! header:
//!
//! ```text
//! offset  size  field
//!      0     4  magic "VXCK"
//!      4     2  version
//!      6     1  voxel encoding tag
//!      7     1  source data type tag
//!      8    12  width, height, depth (u32)
//!     20     1  channels
//!     21     3  reserved (zero)
//!     24    16  value range min, max (f64)
//!     40     8  payload length
//!     48     4  CRC32 of payload
//!     52     -  samples
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ChunkError;
use crate::volume::{DataType, NormalizedVolume, VoxelEncoding};

pub const CHUNK_MAGIC: &[u8; 4] = b"VXCK";
pub const CHUNK_VERSION: u16 = 1;
pub const CHUNK_HEADER_SIZE: usize = 52;

/// Serialize `volume` into chunk bytes.
pub fn encode_chunk(volume: &NormalizedVolume) -> Bytes {
    let mut out = BytesMut::with_capacity(CHUNK_HEADER_SIZE + volume.samples.len());
    out.put_slice(CHUNK_MAGIC);
    out.put_u16_le(CHUNK_VERSION);
    out.put_u8(volume.encoding.tag());
    out.put_u8(volume.data_type.tag());
    out.put_u32_le(volume.width);
    out.put_u32_le(volume.height);
    out.put_u32_le(volume.depth);
    out.put_u8(volume.channels);
    out.put_bytes(0, 3);
    out.put_f64_le(volume.value_range.0);
    out.put_f64_le(volume.value_range.1);
    out.put_u64_le(volume.samples.len() as u64);
    out.put_u32_le(crc32fast::hash(&volume.samples));
    out.put_slice(&volume.samples);
    out.freeze()
}

/// Parse chunk bytes back into a volume, verifying header and checksum.
pub fn decode_chunk(bytes: &Bytes) -> Result<NormalizedVolume, ChunkError> {
    if bytes.len() < CHUNK_HEADER_SIZE {
        return Err(ChunkError::TooShort(bytes.len()));
    }
    if &bytes[0..4] != CHUNK_MAGIC {
        return Err(ChunkError::BadMagic);
    }

    let u16_at = |o: usize| u16::from_le_bytes([bytes[o], bytes[o + 1]]);
    let u32_at = |o: usize| u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
    let u64_at = |o: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[o..o + 8]);
        u64::from_le_bytes(raw)
    };

    let version = u16_at(4);
    if version != CHUNK_VERSION {
        return Err(ChunkError::UnsupportedVersion(version));
    }
    let encoding = VoxelEncoding::from_tag(bytes[6]).ok_or(ChunkError::UnknownEncoding(bytes[6]))?;
    let data_type = DataType::from_tag(bytes[7]).ok_or(ChunkError::UnknownDataType(bytes[7]))?;

    let width = u32_at(8);
    let height = u32_at(12);
    let depth = u32_at(16);
    let channels = bytes[20];
    let min = f64::from_bits(u64_at(24));
    let max = f64::from_bits(u64_at(32));
    let payload_len = u64_at(40) as usize;
    let stored_crc = u32_at(48);

    let actual = bytes.len() - CHUNK_HEADER_SIZE;
    let expected = NormalizedVolume::expected_len(width, height, depth, channels, encoding)
        .ok_or(ChunkError::LengthMismatch {
            expected: usize::MAX,
            actual,
        })?;
    if payload_len != expected || actual != expected {
        return Err(ChunkError::LengthMismatch { expected, actual });
    }

    let samples = bytes.slice(CHUNK_HEADER_SIZE..);
    let computed_crc = crc32fast::hash(&samples);
    if computed_crc != stored_crc {
        return Err(ChunkError::Checksum {
            expected: stored_crc,
            actual: computed_crc,
        });
    }

    Ok(NormalizedVolume {
        width,
        height,
        depth,
        channels,
        data_type,
        encoding,
        samples,
        value_range: (min, max),
    })
}
