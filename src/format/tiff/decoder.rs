//! Strip-based TIFF stack decoding.
//!
//! Two entry points share one page walker:
//!
//! - [`decode_raster`] reads any uncompressed, chunky, strip-organized
//!   stack as written by acquisition software: either byte order, 1-4
//!   samples per pixel, 8/16/32/64-bit samples. Each page becomes one slice
//!   and samples are converted to little-endian.
//! - [`decode`] is the inverse of [`super::encode`]: it additionally
//!   requires 8-bit unsigned RGB pages and returns the concatenated pixels.
//!
//! Whether a sample type is *usable* (e.g. 32-bit integers are not) is left
//! to the normalizer; the decoder only rejects layouts it cannot walk.

use std::collections::HashSet;

use bytes::{Bytes, BytesMut};

use crate::error::TiffError;

use super::parser::{ByteOrder, Ifd, TiffHeader};
use super::tags::{TiffTag, COMPRESSION_NONE, PLANAR_CHUNKY, SAMPLE_FORMAT_UINT};

// =============================================================================
// Decoded Types
// =============================================================================

/// All pages of a TIFF stack, one slice per page.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterStack {
    /// Page width in pixels
    pub width: u32,

    /// Page height in pixels
    pub height: u32,

    /// Interleaved samples per pixel
    pub samples_per_pixel: u16,

    /// Bits per sample, identical for every sample
    pub bits_per_sample: u16,

    /// TIFF SampleFormat value (1 = uint, 2 = int, 3 = float)
    pub sample_format: u16,

    /// Page pixels, row-major, samples little-endian
    pub slices: Vec<Bytes>,
}

impl RasterStack {
    /// Number of pages.
    pub fn depth(&self) -> u32 {
        self.slices.len() as u32
    }

    /// Bytes per single sample.
    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    /// Expected byte length of each slice.
    pub fn slice_len(&self) -> usize {
        self.width as usize
            * self.height as usize
            * self.samples_per_pixel as usize
            * self.bytes_per_sample()
    }
}

/// An 8-bit RGB stack as accepted by [`super::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbStack {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Slices back to back, interleaved RGB
    pub rgb: Bytes,
}

// =============================================================================
// Page Layout
// =============================================================================

#[derive(Debug, Clone)]
struct PageLayout {
    width: u32,
    height: u32,
    samples_per_pixel: u16,
    bits_per_sample: u16,
    sample_format: u16,
    rows_per_strip: u32,
    row_bytes: u64,
    strip_offsets: Vec<u32>,
    strip_byte_counts: Vec<u32>,
}

impl PageLayout {
    fn from_ifd(ifd: &Ifd, data: &[u8], order: ByteOrder) -> Result<Self, TiffError> {
        let width = ifd.required(TiffTag::ImageWidth, data, order)?;
        let height = ifd.required(TiffTag::ImageLength, data, order)?;
        if width == 0 || height == 0 {
            return Err(TiffError::InvalidTagValue {
                tag: TiffTag::ImageWidth.name(),
                message: format!("page is {}x{}", width, height),
            });
        }

        let compression = ifd
            .value(TiffTag::Compression, data, order)?
            .unwrap_or(COMPRESSION_NONE as u32);
        if compression != COMPRESSION_NONE as u32 {
            return Err(TiffError::UnsupportedCompression(compression as u16));
        }

        let samples_per_pixel = ifd
            .value(TiffTag::SamplesPerPixel, data, order)?
            .unwrap_or(1);
        if !(1..=4).contains(&samples_per_pixel) {
            return Err(TiffError::InvalidTagValue {
                tag: TiffTag::SamplesPerPixel.name(),
                message: format!("{} samples per pixel", samples_per_pixel),
            });
        }

        // Absent BitsPerSample means 1-bit, which is rejected below.
        let bits = ifd
            .values(TiffTag::BitsPerSample, data, order)?
            .unwrap_or_else(|| vec![1]);
        let bits_per_sample = uniform(&bits, TiffTag::BitsPerSample)?;
        if !matches!(bits_per_sample, 8 | 16 | 32 | 64) {
            return Err(TiffError::InvalidTagValue {
                tag: TiffTag::BitsPerSample.name(),
                message: format!("{}-bit samples are not byte aligned", bits_per_sample),
            });
        }

        let formats = ifd
            .values(TiffTag::SampleFormat, data, order)?
            .unwrap_or_else(|| vec![SAMPLE_FORMAT_UINT as u32]);
        let sample_format = uniform(&formats, TiffTag::SampleFormat)?;

        let planar = ifd
            .value(TiffTag::PlanarConfiguration, data, order)?
            .unwrap_or(PLANAR_CHUNKY as u32);
        if planar != PLANAR_CHUNKY as u32 && samples_per_pixel > 1 {
            return Err(TiffError::InvalidTagValue {
                tag: TiffTag::PlanarConfiguration.name(),
                message: format!("planar configuration {} is not supported", planar),
            });
        }

        let rows_per_strip = ifd
            .value(TiffTag::RowsPerStrip, data, order)?
            .unwrap_or(u32::MAX)
            .min(height);
        if rows_per_strip == 0 {
            return Err(TiffError::InvalidTagValue {
                tag: TiffTag::RowsPerStrip.name(),
                message: "rows per strip is 0".to_string(),
            });
        }

        let strip_offsets = ifd
            .values(TiffTag::StripOffsets, data, order)?
            .ok_or(TiffError::MissingTag(TiffTag::StripOffsets.name()))?;
        let strip_byte_counts = ifd
            .values(TiffTag::StripByteCounts, data, order)?
            .ok_or(TiffError::MissingTag(TiffTag::StripByteCounts.name()))?;

        let strips = height.div_ceil(rows_per_strip) as usize;
        if strip_offsets.len() < strips || strip_byte_counts.len() != strip_offsets.len() {
            return Err(TiffError::InvalidTagValue {
                tag: TiffTag::StripOffsets.name(),
                message: format!(
                    "{} offsets and {} byte counts for {} strips",
                    strip_offsets.len(),
                    strip_byte_counts.len(),
                    strips
                ),
            });
        }

        // Declared geometry must fit in the file before anything is allocated.
        let row_bytes = (width as u64) * samples_per_pixel as u64 * (bits_per_sample as u64 / 8);
        let page_bytes = row_bytes.checked_mul(height as u64);
        if page_bytes.map_or(true, |n| n > data.len() as u64) {
            return Err(TiffError::InvalidTagValue {
                tag: TiffTag::ImageLength.name(),
                message: format!(
                    "{}x{} page with {} bytes per row exceeds the {}-byte file",
                    width,
                    height,
                    row_bytes,
                    data.len()
                ),
            });
        }

        Ok(PageLayout {
            width,
            height,
            samples_per_pixel: samples_per_pixel as u16,
            bits_per_sample: bits_per_sample as u16,
            sample_format: sample_format as u16,
            rows_per_strip,
            row_bytes,
            strip_offsets,
            strip_byte_counts,
        })
    }

    /// Check that `other` (page `page`) matches this page's geometry.
    fn check_same(&self, other: &PageLayout, page: usize) -> Result<(), TiffError> {
        let this = (
            self.width,
            self.height,
            self.samples_per_pixel,
            self.bits_per_sample,
            self.sample_format,
        );
        let that = (
            other.width,
            other.height,
            other.samples_per_pixel,
            other.bits_per_sample,
            other.sample_format,
        );
        if this != that {
            return Err(TiffError::InconsistentPages {
                page,
                message: format!(
                    "(width, height, samples, bits, format) {:?} vs {:?}",
                    that, this
                ),
            });
        }
        Ok(())
    }

    /// Gather this page's strips into one little-endian slice.
    fn read(&self, data: &[u8], order: ByteOrder) -> Result<Bytes, TiffError> {
        let row_bytes = self.row_bytes;
        // Bounded by the file size in from_ifd
        let mut out = BytesMut::with_capacity((row_bytes * self.height as u64) as usize);
        let mut rows_left = self.height;

        for (offset, count) in self.strip_offsets.iter().zip(&self.strip_byte_counts) {
            if rows_left == 0 {
                break;
            }
            let rows = rows_left.min(self.rows_per_strip);
            let len = rows as u64 * row_bytes;
            let start = *offset as u64;
            let end = start.saturating_add(len);
            if end > data.len() as u64 {
                return Err(TiffError::StripOutOfBounds {
                    offset: start,
                    len,
                    size: data.len() as u64,
                });
            }
            if (*count as u64) < len {
                return Err(TiffError::InvalidTagValue {
                    tag: TiffTag::StripByteCounts.name(),
                    message: format!("strip holds {} bytes, {} rows need {}", count, rows, len),
                });
            }
            out.extend_from_slice(&data[start as usize..end as usize]);
            rows_left -= rows;
        }

        let width = self.bits_per_sample as usize / 8;
        if order == ByteOrder::BigEndian && width > 1 {
            for sample in out.chunks_exact_mut(width) {
                sample.reverse();
            }
        }

        Ok(out.freeze())
    }
}

/// All values of a per-sample tag must agree.
fn uniform(values: &[u32], tag: TiffTag) -> Result<u32, TiffError> {
    let first = *values.first().ok_or(TiffError::InvalidTagValue {
        tag: tag.name(),
        message: "count is 0".to_string(),
    })?;
    if values.iter().any(|&v| v != first) {
        return Err(TiffError::InvalidTagValue {
            tag: tag.name(),
            message: format!("mixed per-sample values {:?}", values),
        });
    }
    Ok(first)
}

// =============================================================================
// Entry Points
// =============================================================================

/// Decode every page of a strip-based TIFF stack.
pub fn decode_raster(data: &[u8]) -> Result<RasterStack, TiffError> {
    let header = TiffHeader::parse(data)?;
    let order = header.byte_order;

    let mut visited = HashSet::new();
    let mut offset = header.first_ifd_offset;
    let mut first: Option<PageLayout> = None;
    let mut slices = Vec::new();

    while offset != 0 {
        if !visited.insert(offset) {
            return Err(TiffError::IfdLoop(offset));
        }

        let ifd = Ifd::parse(data, offset, order)?;
        let page = PageLayout::from_ifd(&ifd, data, order)?;
        match &first {
            Some(reference) => reference.check_same(&page, slices.len())?,
            None => first = Some(page.clone()),
        }

        slices.push(page.read(data, order)?);
        offset = ifd.next_ifd_offset;
    }

    // The header guarantees a first IFD, so at least one page was read.
    let layout = first.ok_or(TiffError::InvalidIfdOffset(header.first_ifd_offset))?;

    Ok(RasterStack {
        width: layout.width,
        height: layout.height,
        samples_per_pixel: layout.samples_per_pixel,
        bits_per_sample: layout.bits_per_sample,
        sample_format: layout.sample_format,
        slices,
    })
}

/// Decode an 8-bit RGB stack written by [`super::encode`].
pub fn decode(data: &[u8]) -> Result<RgbStack, TiffError> {
    let raster = decode_raster(data)?;

    if raster.samples_per_pixel != 3 {
        return Err(TiffError::InvalidTagValue {
            tag: TiffTag::SamplesPerPixel.name(),
            message: format!("expected 3 (RGB), got {}", raster.samples_per_pixel),
        });
    }
    if raster.bits_per_sample != 8 || raster.sample_format != SAMPLE_FORMAT_UINT {
        return Err(TiffError::InvalidTagValue {
            tag: TiffTag::BitsPerSample.name(),
            message: format!(
                "expected 8-bit unsigned samples, got {}-bit format {}",
                raster.bits_per_sample, raster.sample_format
            ),
        });
    }

    let mut rgb = BytesMut::with_capacity(raster.slice_len() * raster.slices.len());
    for slice in &raster.slices {
        rgb.extend_from_slice(slice);
    }

    Ok(RgbStack {
        width: raster.width,
        height: raster.height,
        depth: raster.depth(),
        rgb: rgb.freeze(),
    })
}

// =============================================================================
// Tests
// =============================================================================
