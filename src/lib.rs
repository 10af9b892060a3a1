//! # voxel-archive
//!
//! Preprocessing and chunked multi-resolution storage for microscopy volume
//! datasets.
//!
//! A dataset is a set of channels, each holding one or more layers (raw
//! intensities or segmentation labels) with one volume file per timepoint.
//! Preprocessing normalizes every volume, writes it as a checksummed chunk,
//! derives coarser mip levels and finishes with a JSON manifest. Archives are
//! read back with [`ArchiveReader`] and can be exported as RGB TIFF stacks.
//!
//! ## Architecture
//!
//! - [`mod@format`] - TIFF stack codec
//! - [`volume`] - Normalization and mip generation
//! - [`storage`] - Storage backends (filesystem, in-process namespaces)
//! - [`archive`] - Chunk layout, chunk codec, write scheduling, manifest
//! - [`pipeline`] - Preprocess, import and export sessions
//! - [`config`] - CLI and dataset descriptor types
//!
//! ## Example
//!
//! ```rust,no_run
//! use voxel_archive::{
//!     PreprocessConfig, PreprocessRequest, Preprocessor, StorageHandle, VoxelResolution,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let storage = StorageHandle::directory("archive", "embryo-01");
//!     let request = PreprocessRequest {
//!         dataset_id: "embryo-01".to_string(),
//!         layers: Vec::new(),
//!         track_sets: Vec::new(),
//!         voxel_resolution: VoxelResolution::default(),
//!     };
//!
//!     let result = Preprocessor::new(storage, PreprocessConfig::default())
//!         .run(request)
//!         .await;
//!     println!("{:?}", result.map(|r| r.total_volume_count));
//! }
//! ```

pub mod archive;
pub mod config;
pub mod error;
pub mod format;
pub mod pipeline;
pub mod storage;
pub mod volume;

// Re-export commonly used types
pub use archive::{
    ChannelSummary, ChunkKey, LayerSummary, Manifest, ShardingConfig, StorageStrategy, TrackRow,
    TrackSummary, VoxelResolution, WriteScheduler, MANIFEST_PATH,
};
pub use config::{Cli, Command, DatasetDescriptor};
pub use error::{
    ChunkError, ImportError, LayerError, NormalizeError, PipelineError, StorageError, TiffError,
};
pub use format::tiff::{decode, decode_raster, encode, RasterStack, RgbStack};
pub use pipeline::{
    export_layer_tiff, import_tiff_stack, ArchiveReader, CancellationToken, ExportOptions,
    ExportReport, FailedLayer, ImportOptions, ImportedArchive, LayerDescriptor, Milestone,
    MilestoneTracker, PreprocessConfig, PreprocessRequest, PreprocessResult, Preprocessor,
    ProgressEvent, ProgressReporter, SessionState, SourceFile, TrackSetInput,
};
pub use storage::{DirectoryBackend, OriginPrivateStore, StorageBackend, StorageHandle};
pub use volume::{
    DataType, MipConfig, MipGenerator, NormalizedVolume, Normalizer, RangePolicy, VoxelEncoding,
};
