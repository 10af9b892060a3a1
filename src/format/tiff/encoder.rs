//! Multi-page RGB TIFF stack encoder.
//!
//! # File Layout
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ Header "II", 42, first IFD   │
//! ├──────────────────────────────┤ 8
//! │ Strip 0 (w*h*3 bytes)        │
//! │ Strip 1                      │
//! │ ...                          │
//! ├──────────────────────────────┤ 8 + w*h*3*depth
//! │ IFD 0 (138 bytes) ──next──┐  │
//! │ IFD 1 ◄───────────────────┘  │
//! │ ...             (next = 0)   │
//! ├──────────────────────────────┤
//! │ BitsPerSample  [8, 8, 8]     │
//! │ SampleFormat   [1, 1, 1]     │
//! └──────────────────────────────┘
//! ```
//!
//! Every page carries the same 11 tags in ascending tag order; the two
//! three-valued arrays are shared by all IFDs.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::TiffError;

use super::parser::{IFD_ENTRY_SIZE, TIFF_HEADER_SIZE, VERSION_TIFF};
use super::tags::{
    FieldType, TiffTag, COMPRESSION_NONE, PHOTOMETRIC_RGB, PLANAR_CHUNKY, SAMPLE_FORMAT_UINT,
};

/// Samples per RGB pixel.
pub const RGB_SAMPLES: u32 = 3;

/// Number of entries in every IFD written by [`encode`].
const TAG_COUNT: u16 = 11;

/// Size of one IFD: entry count + entries + next offset.
pub const IFD_SIZE: usize = 2 + TAG_COUNT as usize * IFD_ENTRY_SIZE + 4;

/// Size of each shared three-SHORT array.
const SHARED_ARRAY_SIZE: usize = 3 * 2;

/// Encode `depth` RGB slices of `width * height` pixels as one TIFF stack.
///
/// `rgb` holds the slices back to back, each row-major with interleaved
/// R, G, B bytes.
///
/// # Errors
/// - `InvalidDimensions` if any dimension is zero or the file would not fit
///   32-bit TIFF offsets
/// - `BufferLengthMismatch` if `rgb.len() != width * height * depth * 3`
pub fn encode(width: u32, height: u32, depth: u32, rgb: &[u8]) -> Result<Bytes, TiffError> {
    if width == 0 || height == 0 || depth == 0 {
        return Err(TiffError::InvalidDimensions {
            width,
            height,
            depth,
        });
    }

    let slice_len = width as u64 * height as u64 * RGB_SAMPLES as u64;
    let data_len = slice_len * depth as u64;
    if rgb.len() as u64 != data_len {
        return Err(TiffError::BufferLengthMismatch {
            expected: data_len,
            actual: rgb.len() as u64,
        });
    }

    let first_ifd = TIFF_HEADER_SIZE as u64 + data_len;
    let bits_offset = first_ifd + depth as u64 * IFD_SIZE as u64;
    let format_offset = bits_offset + SHARED_ARRAY_SIZE as u64;
    let total = format_offset + SHARED_ARRAY_SIZE as u64;
    if total > u32::MAX as u64 {
        return Err(TiffError::InvalidDimensions {
            width,
            height,
            depth,
        });
    }

    let mut out = BytesMut::with_capacity(total as usize);

    // Header
    out.put_slice(b"II");
    out.put_u16_le(VERSION_TIFF);
    out.put_u32_le(first_ifd as u32);

    // Image data, one strip per slice
    out.put_slice(rgb);

    // IFD chain
    for page in 0..depth as u64 {
        let strip_offset = TIFF_HEADER_SIZE as u64 + page * slice_len;
        let next_ifd = if page + 1 == depth as u64 {
            0
        } else {
            first_ifd + (page + 1) * IFD_SIZE as u64
        };

        out.put_u16_le(TAG_COUNT);
        put_entry(&mut out, TiffTag::ImageWidth, FieldType::Long, 1, width);
        put_entry(&mut out, TiffTag::ImageLength, FieldType::Long, 1, height);
        put_entry(
            &mut out,
            TiffTag::BitsPerSample,
            FieldType::Short,
            RGB_SAMPLES,
            bits_offset as u32,
        );
        put_entry(
            &mut out,
            TiffTag::Compression,
            FieldType::Short,
            1,
            COMPRESSION_NONE as u32,
        );
        put_entry(
            &mut out,
            TiffTag::PhotometricInterpretation,
            FieldType::Short,
            1,
            PHOTOMETRIC_RGB as u32,
        );
        put_entry(
            &mut out,
            TiffTag::StripOffsets,
            FieldType::Long,
            1,
            strip_offset as u32,
        );
        put_entry(
            &mut out,
            TiffTag::SamplesPerPixel,
            FieldType::Short,
            1,
            RGB_SAMPLES,
        );
        put_entry(&mut out, TiffTag::RowsPerStrip, FieldType::Long, 1, height);
        put_entry(
            &mut out,
            TiffTag::StripByteCounts,
            FieldType::Long,
            1,
            slice_len as u32,
        );
        put_entry(
            &mut out,
            TiffTag::PlanarConfiguration,
            FieldType::Short,
            1,
            PLANAR_CHUNKY as u32,
        );
        put_entry(
            &mut out,
            TiffTag::SampleFormat,
            FieldType::Short,
            RGB_SAMPLES,
            format_offset as u32,
        );
        out.put_u32_le(next_ifd as u32);
    }

    // Shared arrays
    for _ in 0..RGB_SAMPLES {
        out.put_u16_le(8);
    }
    for _ in 0..RGB_SAMPLES {
        out.put_u16_le(SAMPLE_FORMAT_UINT);
    }

    debug_assert_eq!(out.len() as u64, total);
    Ok(out.freeze())
}

/// Append one IFD entry. Single SHORT values are left-justified in the
/// 4-byte value field; everything else stores a LONG value or offset.
fn put_entry(out: &mut BytesMut, tag: TiffTag, field_type: FieldType, count: u32, value: u32) {
    out.put_u16_le(tag.as_u16());
    out.put_u16_le(field_type as u16);
    out.put_u32_le(count);
    if field_type == FieldType::Short && count == 1 {
        out.put_u16_le(value as u16);
        out.put_u16_le(0);
    } else {
        out.put_u32_le(value);
    }
}

// =============================================================================
// Tests
// =============================================================================
