//! Interchange export of archived layers as RGB TIFF stacks.
//!
//! Channels are mapped onto RGB as follows:
//!
//! | channels | R  | G  | B  |
//! |----------|----|----|----|
//! | 1        | c0 | c0 | c0 |
//! | 2        | c0 | c1 | 0  |
//! | 3+       | c0 | c1 | c2 |
//!
//! Label volumes export their label ids clamped to 255.

use tracing::info;

use super::import::ArchiveReader;
use super::progress::ProgressEvent;
use crate::error::ImportError;
use crate::format::tiff::encode;
use crate::storage::{join_path, StorageHandle};
use crate::volume::NormalizedVolume;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    /// Directory to create under the target handle; must not exist yet
    pub directory: String,

    /// Resolution level to export
    pub level: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub directory: String,
    pub files: Vec<String>,
    pub bytes_written: u64,
}

/// Write every timepoint of `layer_key` as `{layer}/t{timepoint:06}.tif`
/// inside a freshly created directory.
///
/// # Errors
/// - `UnknownLayer` if the archive has no such layer
/// - `Storage(AlreadyExists)` if the export directory exists; nothing is
///   written in that case
pub async fn export_layer_tiff(
    reader: &ArchiveReader,
    layer_key: &str,
    target: &StorageHandle,
    options: &ExportOptions,
) -> Result<ExportReport, ImportError> {
    let volume_count = reader
        .manifest()
        .find_layer(layer_key)
        .map(|l| l.volume_count)
        .ok_or_else(|| ImportError::UnknownLayer(layer_key.to_string()))?;

    target.create_directory(&options.directory, false).await?;
    let layer_dir = join_path(&options.directory, &urlencoding::encode(layer_key));

    let mut files = Vec::with_capacity(volume_count as usize);
    let mut bytes_written = 0u64;
    for timepoint in 0..volume_count {
        if reader.is_cancelled() {
            return Err(ImportError::Aborted);
        }

        let volume = reader.read_volume(layer_key, timepoint, options.level).await?;
        let rgb = to_rgb(&volume);
        let tiff = encode(volume.width, volume.height, volume.depth, &rgb)?;

        let path = join_path(&layer_dir, &format!("t{:06}.tif", timepoint));
        bytes_written += tiff.len() as u64;
        target.write(&path, 0, tiff).await?;
        reader.reporter().emit(ProgressEvent::BytesProcessed {
            processed: bytes_written,
            total: None,
        });
        files.push(path);
    }

    info!(
        layer = %layer_key,
        files = files.len(),
        bytes = bytes_written,
        "Exported layer"
    );
    Ok(ExportReport {
        directory: options.directory.clone(),
        files,
        bytes_written,
    })
}

/// Interleaved RGB bytes for every voxel of `volume`.
pub fn to_rgb(volume: &NormalizedVolume) -> Vec<u8> {
    let channels = volume.channels;
    let mut rgb = Vec::with_capacity(volume.voxel_count() * 3);

    for z in 0..volume.depth {
        for y in 0..volume.height {
            for x in 0..volume.width {
                let value = |c: u8| volume.sample(x, y, z, c).min(255) as u8;
                let pixel = match channels {
                    0 => [0, 0, 0],
                    1 => {
                        let v = value(0);
                        [v, v, v]
                    }
                    2 => [value(0), value(1), 0],
                    _ => [value(0), value(1), value(2)],
                };
                rgb.extend_from_slice(&pixel);
            }
        }
    }
    rgb
}
