//! Preprocessing session tests.
//!
//! Tests verify:
//! - Chunk writes never exceed the in-flight bound
//! - Shard routing is deterministic and respects the sharding switch
//! - Manifest totals, milestone ordering and timepoint mismatch warnings
//! - Input errors fail one layer; storage errors and cancellation fail the session

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use voxel_archive::archive::shard_index;
use voxel_archive::error::{LayerError, NormalizeError, PipelineError, StorageError, TiffError};
use voxel_archive::{
    ArchiveReader, CancellationToken, ChunkKey, ImportError, Manifest, MipConfig, Milestone,
    PreprocessConfig, Preprocessor, ProgressEvent, ProgressReporter, ShardingConfig,
    StorageStrategy, TrackRow, TrackSetInput, MANIFEST_PATH,
};

use super::test_utils::{
    handle_over, i32_stack, layer, memory_backend, memory_storage, oversized_tiff, request,
    source, u16_layer, u16_stack, Fault, FaultyBackend, TrackingBackend,
};

fn collect(mut rx: tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn started(events: &[ProgressEvent]) -> Vec<Milestone> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::MilestoneStarted(m) => Some(*m),
            _ => None,
        })
        .collect()
}

fn mip_config(min_dimension: u32) -> MipConfig {
    MipConfig {
        min_dimension,
        max_levels: 6,
    }
}

// =============================================================================
// Write Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_writes_are_bounded() {
    let tracking = TrackingBackend::new(memory_backend("ds"), Duration::from_millis(10));
    let peak = tracking.peak();
    let writes = tracking.writes();
    let storage = handle_over(Arc::new(tracking), "ds");

    let config = PreprocessConfig {
        strategy: StorageStrategy {
            max_in_flight_chunk_writes: 2,
            ..StorageStrategy::default()
        },
        mip: mip_config(2),
        ..PreprocessConfig::default()
    };
    let result = Preprocessor::new(storage, config)
        .run(request(
            "ds",
            vec![
                u16_layer("a", "a/raw", 6, (8, 8, 2)),
                u16_layer("b", "b/raw", 6, (8, 8, 2)),
            ],
        ))
        .await
        .unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(result.peak_in_flight_writes <= 2);
    assert!(result.peak_in_flight_writes >= 1);

    // 12 level-0 chunks, 12 * 2 mips (8 -> 4 -> 2), one manifest
    assert_eq!(writes.load(Ordering::SeqCst), 12 + 24 + 1);
}

#[tokio::test]
async fn test_single_write_in_flight() {
    let tracking = TrackingBackend::new(memory_backend("ds"), Duration::from_millis(2));
    let peak = tracking.peak();
    let storage = handle_over(Arc::new(tracking), "ds");

    let config = PreprocessConfig {
        strategy: StorageStrategy {
            max_in_flight_chunk_writes: 1,
            ..StorageStrategy::default()
        },
        ..PreprocessConfig::default()
    };
    Preprocessor::new(storage, config)
        .run(request("ds", vec![u16_layer("a", "raw", 4, (4, 4, 1))]))
        .await
        .unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Sharding
// =============================================================================

#[tokio::test]
async fn test_shard_routing_is_deterministic() {
    let config = PreprocessConfig::default();
    let first = memory_storage("ds");
    let second = memory_storage("ds");

    for storage in [&first, &second] {
        Preprocessor::new(storage.clone(), config)
            .run(request("ds", vec![u16_layer("c1", "c1/raw", 5, (4, 4, 1))]))
            .await
            .unwrap();
    }

    for timepoint in 0..5 {
        let key = ChunkKey::new("c1/raw", 0, timepoint);
        let shard = shard_index("c1/raw", timepoint, 16);
        let expected = format!(
            "layers/c1%2Fraw/L0/s{:03}/t{:06}.chunk",
            shard, timepoint
        );
        assert_eq!(config.strategy.chunk_path(&key), expected);
        assert!(first.exists(&expected).await);
        assert!(second.exists(&expected).await);
    }
}

#[tokio::test]
async fn test_sharding_disabled_uses_flat_paths() {
    let storage = memory_storage("ds");
    let config = PreprocessConfig {
        strategy: StorageStrategy {
            sharding: ShardingConfig {
                enabled: false,
                shard_count: 16,
            },
            ..StorageStrategy::default()
        },
        ..PreprocessConfig::default()
    };
    let result = Preprocessor::new(storage.clone(), config)
        .run(request("ds", vec![u16_layer("c1", "raw", 3, (4, 4, 1))]))
        .await
        .unwrap();

    assert!(!result.manifest.storage.sharding.enabled);
    for timepoint in 0..3 {
        assert!(
            storage
                .exists(&format!("layers/raw/L0/t{:06}.chunk", timepoint))
                .await
        );
    }
}

// =============================================================================
// Manifest and Milestones
// =============================================================================

#[tokio::test]
async fn test_manifest_totals_and_milestones() {
    let storage = memory_storage("ds");
    let (reporter, rx) = ProgressReporter::channel();

    let mut req = request(
        "ds",
        vec![
            u16_layer("nuclei", "nuclei/raw", 3, (4, 4, 2)),
            u16_layer("nuclei", "nuclei/denoised", 3, (4, 4, 2)),
            u16_layer("membrane", "membrane/raw", 2, (4, 4, 2)),
        ],
    );
    req.track_sets.push(TrackSetInput {
        id: "lineage".to_string(),
        name: "Lineage".to_string(),
        channel_id: Some("nuclei".to_string()),
        rows: vec![TrackRow {
            track_id: 7,
            time: 0.0,
            x: 1.0,
            y: 2.0,
            z: 0.5,
            amplitude: 1.0,
        }],
    });

    let result = Preprocessor::new(storage.clone(), PreprocessConfig::default())
        .with_progress(reporter)
        .run(req)
        .await
        .unwrap();

    assert_eq!(result.total_volume_count, 8);
    assert_eq!(result.manifest.computed_volume_count(), 8);
    assert_eq!(result.channel_summaries.len(), 2);
    assert_eq!(result.channel_summaries[0].layers.len(), 2);
    assert_eq!(result.track_summaries[0].total_rows, 1);
    assert_eq!(
        result.track_summaries[0].bound_channel_id.as_deref(),
        Some("nuclei")
    );

    // The stored manifest matches the returned one
    let stored = Manifest::from_json(&storage.read_all(MANIFEST_PATH).await.unwrap()).unwrap();
    assert_eq!(stored, result.manifest);

    let events = collect(rx);
    assert_eq!(started(&events), Milestone::ORDER.to_vec());
    assert_eq!(result.milestones, Milestone::ORDER.to_vec());
    assert!(events.contains(&ProgressEvent::VolumesDecoded {
        decoded: 8,
        total: 8
    }));
    assert_eq!(
        events.last(),
        Some(&ProgressEvent::Completed {
            total_volume_count: 8
        })
    );
}

#[tokio::test]
async fn test_timepoint_mismatch_warning() {
    let result = Preprocessor::new(memory_storage("ds"), PreprocessConfig::default())
        .run(request(
            "ds",
            vec![
                u16_layer("a", "a/raw", 5, (2, 2, 1)),
                u16_layer("b", "b/raw", 7, (2, 2, 1)),
            ],
        ))
        .await
        .unwrap();

    assert!(result.manifest.has_global_timepoint_mismatch);
    assert_eq!(
        result.warnings,
        vec!["Channels have differing timepoint counts: a=5, b=7".to_string()]
    );
    assert_eq!(result.total_volume_count, 12);
}

#[tokio::test]
async fn test_matching_timepoints_have_no_warning() {
    let result = Preprocessor::new(memory_storage("ds"), PreprocessConfig::default())
        .run(request(
            "ds",
            vec![
                u16_layer("a", "a/raw", 3, (2, 2, 1)),
                u16_layer("b", "b/raw", 3, (2, 2, 1)),
            ],
        ))
        .await
        .unwrap();
    assert!(!result.manifest.has_global_timepoint_mismatch);
    assert!(result.warnings.is_empty());
}

// =============================================================================
// Failure Handling
// =============================================================================

#[tokio::test]
async fn test_layer_input_error_spares_siblings() {
    let storage = memory_storage("ds");
    let (reporter, rx) = ProgressReporter::channel();

    let bad = layer(
        "a",
        "a/bad",
        vec![
            source("t0.tif", u16_stack(4, 4, 1, |x, y, _| (x + y) as u16)),
            source("t1.tif", i32_stack(4, 4)),
        ],
    );
    let result = Preprocessor::new(storage.clone(), PreprocessConfig::default())
        .with_progress(reporter)
        .run(request(
            "ds",
            vec![bad, u16_layer("a", "a/good", 2, (4, 4, 1))],
        ))
        .await
        .unwrap();

    assert_eq!(result.failed_layers.len(), 1);
    assert_eq!(result.failed_layers[0].layer_key, "a/bad");
    assert_eq!(
        result.failed_layers[0].error,
        LayerError::Normalize {
            timepoint: 1,
            source: NormalizeError::UnsupportedSampleType { bits: 32, format: 2 },
        }
    );

    assert!(result.manifest.find_layer("a/bad").is_none());
    assert!(result.manifest.find_layer("a/good").is_some());
    assert_eq!(result.total_volume_count, 2);

    let events = collect(rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::LayerFailed { layer_key, .. } if layer_key == "a/bad")));

    // The archive opens and only lists the surviving layer
    let reader = ArchiveReader::open(storage).await.unwrap();
    assert_eq!(reader.manifest().layers().count(), 1);
}

#[tokio::test]
async fn test_oversized_page_header_fails_only_its_layer() {
    let storage = memory_storage("ds");
    let crafted = layer("a", "a/crafted", vec![source("t0.tif", oversized_tiff())]);

    let result = Preprocessor::new(storage.clone(), PreprocessConfig::default())
        .run(request(
            "ds",
            vec![u16_layer("a", "a/good", 1, (4, 4, 1)), crafted],
        ))
        .await
        .unwrap();

    assert_eq!(result.failed_layers.len(), 1);
    assert_eq!(result.failed_layers[0].layer_key, "a/crafted");
    assert!(matches!(
        result.failed_layers[0].error,
        LayerError::Decode {
            timepoint: 0,
            source: TiffError::InvalidTagValue { .. },
        }
    ));
    assert_eq!(result.total_volume_count, 1);

    let reader = ArchiveReader::open(storage).await.unwrap();
    assert!(reader.manifest().find_layer("a/good").is_some());
}

#[tokio::test]
async fn test_shape_drift_fails_layer() {
    let drifting = layer(
        "a",
        "a/raw",
        vec![
            source("t0.tif", u16_stack(4, 4, 1, |_, _, _| 1)),
            source("t1.tif", u16_stack(4, 4, 2, |_, _, _| 1)),
        ],
    );
    let result = Preprocessor::new(memory_storage("ds"), PreprocessConfig::default())
        .run(request("ds", vec![drifting]))
        .await
        .unwrap();

    assert!(matches!(
        result.failed_layers[0].error,
        LayerError::ShapeDrift { timepoint: 1, .. }
    ));
    assert_eq!(result.total_volume_count, 0);
}

#[tokio::test]
async fn test_leftover_chunks_are_refused_before_writing() {
    let backend = memory_backend("ds");
    backend
        .write(
            "layers/a%2Fraw/L0/s000/t000000.chunk",
            0,
            bytes::Bytes::from_static(b"stale"),
        )
        .await
        .unwrap();

    let tracking = TrackingBackend::new(backend, Duration::from_millis(0));
    let writes = tracking.writes();
    let storage = handle_over(Arc::new(tracking), "ds");

    let result = Preprocessor::new(storage.clone(), PreprocessConfig::default())
        .run(request("ds", vec![u16_layer("a", "a/raw", 2, (4, 4, 1))]))
        .await;
    assert_eq!(
        result.err(),
        Some(PipelineError::Storage(StorageError::AlreadyExists(
            "layers".to_string()
        )))
    );
    assert_eq!(writes.load(Ordering::SeqCst), 0);
    assert!(!storage.exists(MANIFEST_PATH).await);

    // Overwrite reuses the leftover tree
    let restart = PreprocessConfig {
        overwrite: true,
        ..PreprocessConfig::default()
    };
    Preprocessor::new(storage, restart)
        .run(request("ds", vec![u16_layer("a", "a/raw", 2, (4, 4, 1))]))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_level0_storage_failure_fails_session() {
    let faulty = FaultyBackend::new(
        memory_backend("ds"),
        Fault::FailPathsContaining("/L0/".to_string()),
    );
    let storage = handle_over(Arc::new(faulty), "ds");
    let (reporter, rx) = ProgressReporter::channel();

    let result = Preprocessor::new(storage.clone(), PreprocessConfig::default())
        .with_progress(reporter)
        .run(request("ds", vec![u16_layer("a", "raw", 2, (4, 4, 1))]))
        .await;

    match result {
        Err(PipelineError::Layer { key, source }) => {
            assert_eq!(key, "raw");
            assert!(matches!(
                source,
                LayerError::Storage(StorageError::IoFailure { .. })
            ));
        }
        other => panic!("expected layer storage failure, got {:?}", other),
    }
    assert!(!storage.exists(MANIFEST_PATH).await);

    let events = collect(rx);
    assert_eq!(started(&events), vec![Milestone::Scan, Milestone::Level0]);
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Failed {
            milestone: Some(Milestone::Level0),
            ..
        })
    ));
}

#[tokio::test]
async fn test_mip_storage_failure_stops_at_mips() {
    let faulty = FaultyBackend::new(
        memory_backend("ds"),
        Fault::FailPathsContaining("/L1/".to_string()),
    );
    let storage = handle_over(Arc::new(faulty), "ds");
    let (reporter, rx) = ProgressReporter::channel();
    let config = PreprocessConfig {
        mip: mip_config(2),
        ..PreprocessConfig::default()
    };

    let result = Preprocessor::new(storage.clone(), config)
        .with_progress(reporter)
        .run(request("ds", vec![u16_layer("a", "raw", 2, (8, 8, 2))]))
        .await;

    assert!(matches!(
        result,
        Err(PipelineError::Storage(StorageError::IoFailure { .. }))
    ));
    assert!(!storage.exists(MANIFEST_PATH).await);

    let events = collect(rx);
    let milestones = started(&events);
    assert_eq!(milestones, Milestone::ORDER[..3].to_vec());
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Failed {
            milestone: Some(Milestone::Mips),
            ..
        })
    ));
}

#[tokio::test]
async fn test_cancellation_leaves_no_manifest() {
    let cancel = CancellationToken::new();
    let faulty = FaultyBackend::new(memory_backend("ds"), Fault::CancelAfter(2, cancel.clone()));
    let storage = handle_over(Arc::new(faulty), "ds");

    let config = PreprocessConfig {
        strategy: StorageStrategy {
            max_in_flight_chunk_writes: 1,
            ..StorageStrategy::default()
        },
        ..PreprocessConfig::default()
    };
    let result = Preprocessor::new(storage.clone(), config)
        .with_cancellation(cancel.clone())
        .run(request("ds", vec![u16_layer("a", "raw", 10, (4, 4, 1))]))
        .await;

    assert!(cancel.is_cancelled());
    assert_eq!(result.err(), Some(PipelineError::Aborted));
    assert!(!storage.exists(MANIFEST_PATH).await);
    assert_eq!(
        ArchiveReader::open(storage).await.err(),
        Some(ImportError::NotFound(MANIFEST_PATH.to_string()))
    );
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = Preprocessor::new(memory_storage("ds"), PreprocessConfig::default())
        .with_cancellation(cancel)
        .run(request("ds", vec![u16_layer("a", "raw", 1, (2, 2, 1))]))
        .await;
    assert_eq!(result.err(), Some(PipelineError::Aborted));
}
