//! Preprocessing and import pipelines.
//!
//! - [`Preprocessor`] ingests raw layer files and writes a chunked archive
//! - [`ArchiveReader`] reads an archive back into volumes
//! - [`export_layer_tiff`] writes archived layers as interchange TIFF stacks

mod cancel;
mod export;
mod import;
mod preprocess;
mod progress;

pub use cancel::CancellationToken;
pub use export::{export_layer_tiff, to_rgb, ExportOptions, ExportReport};
pub use import::{
    import_tiff_stack, ArchiveReader, ImportOptions, ImportedArchive, ImportedLayer,
    DEFAULT_VOLUME_CACHE_CAPACITY,
};
pub use preprocess::{
    FailedLayer, LayerDescriptor, PreprocessConfig, PreprocessRequest, PreprocessResult,
    Preprocessor, SourceFile, TrackSetInput,
};
pub use progress::{
    percent, Milestone, MilestoneTracker, ProgressEvent, ProgressReporter, SessionState,
};
