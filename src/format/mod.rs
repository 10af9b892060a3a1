//! Binary interchange formats.
//!
//! Currently a single codec: multi-page TIFF stacks, used both to ingest
//! acquisition files and to export volumes for other tools.
//!
//! - [`tiff::encode`] / [`tiff::decode`]: 8-bit RGB stacks
//! - [`tiff::decode_raster`]: uncompressed grayscale or multi-sample stacks
//!   in 8/16-bit integer or 32-bit float

pub mod tiff;
