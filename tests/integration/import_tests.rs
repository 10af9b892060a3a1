//! Archive import tests.
//!
//! Tests verify:
//! - Full imports load every level-0 volume and report progress
//! - Missing chunks fail or are tolerated on request
//! - Corrupt chunks and manifests surface as `CorruptArchive`
//! - Track sets are read back with their unique track count

use voxel_archive::archive::{CHUNK_HEADER_SIZE, MANIFEST_FORMAT};
use voxel_archive::{
    ArchiveReader, CancellationToken, ChunkKey, ImportError, ImportOptions, MipConfig,
    PreprocessConfig, Preprocessor, ProgressEvent, ProgressReporter, StorageHandle, TrackRow,
    TrackSetInput, VoxelEncoding, MANIFEST_PATH,
};

use super::test_utils::{memory_storage, request, u16_layer};

async fn build_archive(storage: &StorageHandle, config: PreprocessConfig) {
    let mut req = request(
        "ds",
        vec![
            u16_layer("c1", "c1/raw", 3, (8, 8, 2)),
            u16_layer("c2", "c2/raw", 2, (8, 8, 2)),
        ],
    );
    let rows = [1u64, 1, 2, 3]
        .iter()
        .enumerate()
        .map(|(i, id)| TrackRow {
            track_id: *id,
            time: i as f64,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            amplitude: 0.5,
        })
        .collect();
    req.track_sets.push(TrackSetInput {
        id: "tracks".to_string(),
        name: "Tracks".to_string(),
        channel_id: Some("c1".to_string()),
        rows,
    });

    Preprocessor::new(storage.clone(), config)
        .run(req)
        .await
        .unwrap();
}

// =============================================================================
// Full Import
// =============================================================================

#[tokio::test]
async fn test_import_all_loads_every_volume() {
    let storage = memory_storage("ds");
    build_archive(&storage, PreprocessConfig::default()).await;

    let (reporter, mut rx) = ProgressReporter::channel();
    let reader = ArchiveReader::open(storage).await.unwrap().with_progress(reporter);
    let imported = reader.import_all(ImportOptions::default()).await.unwrap();

    assert_eq!(imported.volume_count(), 5);
    assert!(imported.missing.is_empty());
    assert_eq!(imported.bytes_processed, reader.manifest().level0_bytes());

    let layer = imported.layer("c1/raw").unwrap();
    assert_eq!(layer.volumes.len(), 3);
    let volume = layer.volumes[0].as_ref().unwrap();
    assert_eq!(volume.shape(), (8, 8, 2, 1));
    assert_eq!(volume.encoding, VoxelEncoding::Normalized8);

    drop(reader);
    let mut last_bytes = None;
    let mut last_volumes = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            ProgressEvent::BytesProcessed { processed, total } => {
                last_bytes = Some((processed, total))
            }
            ProgressEvent::VolumesDecoded { decoded, total } => {
                last_volumes = Some((decoded, total))
            }
            _ => {}
        }
    }
    let (processed, total) = last_bytes.unwrap();
    assert_eq!(Some(processed), total);
    assert_eq!(last_volumes, Some((5, 5)));
}

#[tokio::test]
async fn test_read_volume_at_mip_level() {
    let storage = memory_storage("ds");
    let config = PreprocessConfig {
        mip: MipConfig {
            min_dimension: 2,
            max_levels: 6,
        },
        ..PreprocessConfig::default()
    };
    build_archive(&storage, config).await;

    let reader = ArchiveReader::open(storage).await.unwrap();
    assert_eq!(reader.manifest().find_layer("c1/raw").unwrap().mip_levels, 2);

    let level1 = reader.read_volume("c1/raw", 2, 1).await.unwrap();
    assert_eq!(level1.shape(), (4, 4, 1, 1));
    let level2 = reader.read_volume("c1/raw", 2, 2).await.unwrap();
    assert_eq!(level2.shape(), (2, 2, 1, 1));

    assert!(matches!(
        reader.read_volume("c1/raw", 2, 3).await,
        Err(ImportError::OutOfRange { level: 3, .. })
    ));
    assert!(matches!(
        reader.read_volume("c1/raw", 3, 0).await,
        Err(ImportError::OutOfRange { timepoint: 3, .. })
    ));
    assert_eq!(
        reader.read_volume("nope", 0, 0).await.err(),
        Some(ImportError::UnknownLayer("nope".to_string()))
    );
}

#[tokio::test]
async fn test_cancelled_import_returns_nothing() {
    let storage = memory_storage("ds");
    build_archive(&storage, PreprocessConfig::default()).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let reader = ArchiveReader::open(storage)
        .await
        .unwrap()
        .with_cancellation(cancel);
    assert_eq!(
        reader.import_all(ImportOptions::default()).await.err(),
        Some(ImportError::Aborted)
    );
}

// =============================================================================
// Missing and Corrupt Content
// =============================================================================

#[tokio::test]
async fn test_missing_chunk_strict_and_tolerant() {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageHandle::directory(dir.path(), "ds");
    build_archive(&storage, PreprocessConfig::default()).await;

    let reader = ArchiveReader::open(storage).await.unwrap();
    let key = ChunkKey::new("c2/raw", 0, 1);
    let path = reader.manifest().storage.chunk_path(&key);
    std::fs::remove_file(dir.path().join(&path)).unwrap();

    assert_eq!(
        reader.import_all(ImportOptions::default()).await.err(),
        Some(ImportError::NotFound(path.clone()))
    );

    let imported = reader
        .import_all(ImportOptions {
            tolerate_missing: true,
        })
        .await
        .unwrap();
    assert_eq!(imported.missing, vec![key]);
    assert_eq!(imported.volume_count(), 4);
    let layer = imported.layer("c2/raw").unwrap();
    assert!(layer.volumes[0].is_some());
    assert!(layer.volumes[1].is_none());
}

#[tokio::test]
async fn test_corrupt_chunk_is_reported() {
    let storage = memory_storage("ds");
    build_archive(&storage, PreprocessConfig::default()).await;
    let reader = ArchiveReader::open(storage.clone()).await.unwrap();

    // Flip one payload byte so the checksum no longer matches
    let path = reader
        .manifest()
        .storage
        .chunk_path(&ChunkKey::new("c1/raw", 0, 0));
    let mut bytes = storage.read_all(&path).await.unwrap().to_vec();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    storage.write(&path, 0, bytes.into()).await.unwrap();

    assert!(matches!(
        reader.read_volume("c1/raw", 0, 0).await,
        Err(ImportError::CorruptArchive(_))
    ));

    // Garbage in place of another chunk
    let path = reader
        .manifest()
        .storage
        .chunk_path(&ChunkKey::new("c1/raw", 0, 1));
    storage
        .write(&path, 0, bytes::Bytes::from_static(b"not a chunk"))
        .await
        .unwrap();
    assert!(matches!(
        reader.import_all(ImportOptions::default()).await,
        Err(ImportError::CorruptArchive(_))
    ));

    // A header whose dimensions overflow any buffer
    let path = reader
        .manifest()
        .storage
        .chunk_path(&ChunkKey::new("c2/raw", 0, 0));
    let mut header = storage.read(&path, 0, CHUNK_HEADER_SIZE).await.unwrap().to_vec();
    for offset in [8, 12, 16] {
        header[offset..offset + 4].copy_from_slice(&u32::MAX.to_le_bytes());
    }
    header[20] = 255;
    storage.write(&path, 0, header.into()).await.unwrap();
    assert!(matches!(
        reader.read_volume("c2/raw", 0, 0).await,
        Err(ImportError::CorruptArchive(_))
    ));
}

#[tokio::test]
async fn test_newer_manifest_version_is_rejected() {
    let storage = memory_storage("ds");
    let manifest = format!(r#"{{"format": "{}", "version": 99}}"#, MANIFEST_FORMAT);
    storage
        .write(MANIFEST_PATH, 0, manifest.into())
        .await
        .unwrap();

    assert!(matches!(
        ArchiveReader::open(storage).await,
        Err(ImportError::UnsupportedVersion { found: 99, .. })
    ));
}

// =============================================================================
// Tracks
// =============================================================================

#[tokio::test]
async fn test_read_tracks_counts_unique_ids() {
    let storage = memory_storage("ds");
    build_archive(&storage, PreprocessConfig::default()).await;
    let reader = ArchiveReader::open(storage).await.unwrap();

    // The manifest does not know unique counts until rows are read
    assert_eq!(reader.manifest().tracks[0].unique_tracks, None);

    let (rows, summary) = reader.read_tracks("tracks").await.unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(summary.total_rows, 4);
    assert_eq!(summary.unique_tracks, Some(3));
    assert_eq!(summary.bound_channel_id.as_deref(), Some("c1"));

    assert_eq!(
        reader.read_tracks("other").await.err(),
        Some(ImportError::UnknownTrackSet("other".to_string()))
    );
}
