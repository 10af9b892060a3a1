use thiserror::Error;

/// Errors raised by storage backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// A directory or chunk already exists and may not be replaced
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Object or directory not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Underlying I/O failed
    #[error("I/O failure on {path}: {message}")]
    IoFailure { path: String, message: String },

    /// Requested range exceeds object bounds
    #[error("Range out of bounds on {path}: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        path: String,
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// Path escapes the backend root or is otherwise malformed
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl StorageError {
    /// Map a `std::io::Error` for `path` onto the storage taxonomy.
    pub fn from_io(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            std::io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.to_string()),
            _ => StorageError::IoFailure {
                path: path.to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// Errors that can occur when encoding or decoding TIFF stacks
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TiffError {
    /// Encoder precondition: every dimension must be non-zero
    #[error("Invalid dimensions: {width}x{height}x{depth}")]
    InvalidDimensions { width: u32, height: u32, depth: u32 },

    /// Encoder precondition: pixel buffer does not match the dimensions
    #[error("Buffer length mismatch: expected {expected} bytes, got {actual}")]
    BufferLengthMismatch { expected: u64, actual: u64 },

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid or unsupported TIFF version number
    #[error("Invalid TIFF version: expected 42, got {0}")]
    InvalidVersion(u16),

    /// Buffer is too small to contain the structure being read
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// IFD offset points outside the file
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// The IFD chain revisits an offset
    #[error("IFD chain loops back to offset {0}")]
    IfdLoop(u64),

    /// Required tag is missing from an IFD
    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    /// Tag has an unexpected type, count or value
    #[error("Invalid tag value for {tag}: {message}")]
    InvalidTagValue { tag: &'static str, message: String },

    /// Only uncompressed pages are readable
    #[error("Unsupported compression: {0} (only uncompressed strips are supported)")]
    UnsupportedCompression(u16),

    /// Unknown field type in IFD entry
    #[error("Unknown field type: {0}")]
    UnknownFieldType(u16),

    /// Strip data lies outside the file
    #[error("Strip out of bounds: {len} bytes at offset {offset}, file size is {size}")]
    StripOutOfBounds { offset: u64, len: u64, size: u64 },

    /// Pages of one stack disagree in geometry or sample layout
    #[error("Page {page} is inconsistent with page 0: {message}")]
    InconsistentPages { page: usize, message: String },
}

/// Errors raised while normalizing raw slices into a volume
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    /// Source sample encoding is not uint8, uint16 or float32
    #[error("Unsupported sample type: {bits} bits per sample, sample format {format}")]
    UnsupportedSampleType { bits: u16, format: u16 },

    /// Slices within one timepoint disagree in shape
    #[error("Dimension mismatch in slice {slice}: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        slice: usize,
        expected: (u32, u32, u8),
        actual: (u32, u32, u8),
    },

    /// Slice buffer does not match its declared shape
    #[error("Slice {slice} holds {actual} bytes, expected {expected}")]
    SliceLength {
        slice: usize,
        expected: usize,
        actual: usize,
    },

    /// No slices were supplied
    #[error("Volume has no slices")]
    EmptyVolume,
}

/// Errors decoding a stored chunk
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("Chunk too short: {0} bytes")]
    TooShort(usize),

    #[error("Bad chunk magic")]
    BadMagic,

    #[error("Unsupported chunk version: {0}")]
    UnsupportedVersion(u16),

    #[error("Unknown voxel encoding tag: {0}")]
    UnknownEncoding(u8),

    #[error("Unknown data type tag: {0}")]
    UnknownDataType(u8),

    #[error("Chunk payload holds {actual} bytes, header describes {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Chunk checksum mismatch: stored 0x{expected:08X}, computed 0x{actual:08X}")]
    Checksum { expected: u32, actual: u32 },
}

/// Failure of a single layer during ingestion. Siblings keep going.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LayerError {
    #[error("timepoint {timepoint}: {source}")]
    Decode { timepoint: u32, source: TiffError },

    #[error("timepoint {timepoint}: {source}")]
    Normalize {
        timepoint: u32,
        source: NormalizeError,
    },

    /// Volume shape changed between timepoints of the same layer
    #[error("timepoint {timepoint}: shape {actual:?} differs from {expected:?}")]
    ShapeDrift {
        timepoint: u32,
        expected: (u32, u32, u32, u8),
        actual: (u32, u32, u32, u8),
    },

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("layer has no source files")]
    NoFiles,
}

/// Session-level preprocessing failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Stored chunk is unreadable: {0}")]
    Chunk(#[from] ChunkError),

    /// Layer `key` failed with an error that invalidates the whole archive
    #[error("Layer {key} failed: {source}")]
    Layer { key: String, source: LayerError },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid milestone transition: {0}")]
    Milestone(String),

    #[error("Worker task failed: {0}")]
    Task(String),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Preprocessing aborted")]
    Aborted,
}

/// Errors surfaced by the import pipeline
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ImportError {
    /// Missing manifest or chunk
    #[error("Not found: {0}")]
    NotFound(String),

    /// Structurally invalid archive content
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    /// Manifest schema is newer than this reader
    #[error("Unsupported manifest version {found} (this reader understands up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// The caller cancelled the import
    #[error("Import aborted")]
    Aborted,

    #[error("Unknown layer: {0}")]
    UnknownLayer(String),

    #[error("Unknown track set: {0}")]
    UnknownTrackSet(String),

    #[error("Layer {layer} has no timepoint {timepoint} at level {level}")]
    OutOfRange {
        layer: String,
        timepoint: u32,
        level: u32,
    },

    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Export could not encode a volume
    #[error("TIFF error: {0}")]
    Tiff(#[from] TiffError),

    #[error("Normalize error: {0}")]
    Normalize(#[from] NormalizeError),
}

impl From<StorageError> for ImportError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(path) => ImportError::NotFound(path),
            other => ImportError::Storage(other),
        }
    }
}

impl From<ChunkError> for ImportError {
    fn from(err: ChunkError) -> Self {
        ImportError::CorruptArchive(err.to_string())
    }
}
