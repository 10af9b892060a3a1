//! Archive layout: chunk addressing, shard routing and write strategy.
//!
//! ```text
//! <root>/
//! ├── manifest.json
//! ├── tracks/{track_set}.json
//! └── layers/{layer}/
//!     └── L{level}/
//!         ├── s{shard:03}/t{timepoint:06}.chunk   (sharded)
//!         └── t{timepoint:06}.chunk               (unsharded)
//! ```
//!
//! Layer and track set ids are percent-encoded so arbitrary keys map to a
//! single path component.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Path of the manifest, relative to the archive root.
pub const MANIFEST_PATH: &str = "manifest.json";

/// Directory holding per-layer chunk trees.
pub const LAYERS_DIR: &str = "layers";

/// Directory holding track tables.
pub const TRACKS_DIR: &str = "tracks";

/// Default bound on concurrent chunk writes.
pub const DEFAULT_MAX_IN_FLIGHT_WRITES: u32 = 4;

/// Default number of shards per level.
pub const DEFAULT_SHARD_COUNT: u32 = 16;

// =============================================================================
// Strategy
// =============================================================================

/// Shard routing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShardingConfig {
    pub enabled: bool,
    pub shard_count: u32,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shard_count: DEFAULT_SHARD_COUNT,
        }
    }
}

/// How chunks are written: concurrency bound and shard layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageStrategy {
    pub max_in_flight_chunk_writes: u32,
    pub sharding: ShardingConfig,
}

impl Default for StorageStrategy {
    fn default() -> Self {
        Self {
            max_in_flight_chunk_writes: DEFAULT_MAX_IN_FLIGHT_WRITES,
            sharding: ShardingConfig::default(),
        }
    }
}

impl StorageStrategy {
    /// Validate the strategy.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_in_flight_chunk_writes == 0 {
            return Err("max_in_flight_chunk_writes must be at least 1".to_string());
        }
        if self.sharding.enabled && self.sharding.shard_count == 0 {
            return Err("shard_count must be at least 1 when sharding is enabled".to_string());
        }
        Ok(())
    }

    /// Shard for `key`, or `None` when sharding is disabled.
    pub fn shard_for(&self, key: &ChunkKey) -> Option<u32> {
        if self.sharding.enabled && self.sharding.shard_count > 0 {
            Some(shard_index(
                &key.layer_key,
                key.timepoint,
                self.sharding.shard_count,
            ))
        } else {
            None
        }
    }

    /// Archive-relative path of the chunk addressed by `key`.
    pub fn chunk_path(&self, key: &ChunkKey) -> String {
        let level_dir = format!(
            "{}/{}/L{}",
            LAYERS_DIR,
            urlencoding::encode(&key.layer_key),
            key.level
        );
        match self.shard_for(key) {
            Some(shard) => format!("{}/s{:03}/t{:06}.chunk", level_dir, shard, key.timepoint),
            None => format!("{}/t{:06}.chunk", level_dir, key.timepoint),
        }
    }
}

// =============================================================================
// Chunk Addressing
// =============================================================================

/// Logical address of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub layer_key: String,
    pub level: u32,
    pub timepoint: u32,
}

impl ChunkKey {
    pub fn new(layer_key: impl Into<String>, level: u32, timepoint: u32) -> Self {
        Self {
            layer_key: layer_key.into(),
            level,
            timepoint,
        }
    }
}

/// Deterministic shard for `(layer_key, timepoint)`.
///
/// The first eight bytes of `SHA-256(layer_key || 0x00 || timepoint_le)`,
/// read as a little-endian u64, modulo `shard_count`.
pub fn shard_index(layer_key: &str, timepoint: u32, shard_count: u32) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(layer_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(timepoint.to_le_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(prefix) % shard_count.max(1) as u64) as u32
}

/// Archive-relative path of the track table for `track_set_id`.
pub fn track_path(track_set_id: &str) -> String {
    format!("{}/{}.json", TRACKS_DIR, urlencoding::encode(track_set_id))
}
