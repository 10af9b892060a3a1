//! TIFF stack codec.
//!
//! This module writes and reads multi-page, strip-organized TIFF files, the
//! interchange format for volumetric stacks.
//!
//! # Key Concepts
//!
//! - **Byte order**: TIFF files declare their endianness (II = little-endian,
//!   MM = big-endian) in the header. The encoder always writes II; the
//!   decoder accepts both.
//!
//! - **IFD (Image File Directory)**: one per page. Pages form a singly linked
//!   list through each IFD's next-offset field.
//!
//! - **Strips**: page pixels are stored as one or more horizontal bands. The
//!   encoder writes one strip per page.
//!
//! - **Inline vs offset values**: values of up to 4 bytes live inside the IFD
//!   entry, larger ones are stored at an offset pointed to by the entry.

mod decoder;
mod encoder;
mod parser;
mod tags;

pub use decoder::{decode, decode_raster, RasterStack, RgbStack};
pub use encoder::{encode, IFD_SIZE, RGB_SAMPLES};
pub use parser::{ByteOrder, Ifd, IfdEntry, TiffHeader, TIFF_HEADER_SIZE};
pub use tags::{FieldType, TiffTag, SAMPLE_FORMAT_FLOAT, SAMPLE_FORMAT_UINT};
