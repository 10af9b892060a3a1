//! Chunked archive: layout, chunk codec, write scheduling and manifest.

mod chunk;
mod layout;
mod manifest;
mod scheduler;

pub use chunk::{decode_chunk, encode_chunk, CHUNK_HEADER_SIZE, CHUNK_MAGIC, CHUNK_VERSION};
pub use layout::{
    shard_index, track_path, ChunkKey, ShardingConfig, StorageStrategy,
    DEFAULT_MAX_IN_FLIGHT_WRITES, DEFAULT_SHARD_COUNT, LAYERS_DIR, MANIFEST_PATH, TRACKS_DIR,
};
pub use manifest::{
    ChannelSummary, LayerSummary, Manifest, TrackRow, TrackSummary, TrackTable, VoxelResolution,
    MANIFEST_FORMAT, MANIFEST_VERSION,
};
pub use scheduler::{WriteReceipt, WriteScheduler, WriteTicket};
