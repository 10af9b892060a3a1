//! End-to-end codec tests: TIFF in, archive, TIFF out.
//!
//! Tests verify:
//! - 8-bit RGB stacks spanning 0-255 survive preprocessing unchanged
//! - Segmentation labels are stored as labels, not rescaled
//! - Export writes one TIFF per timepoint and refuses existing directories

use voxel_archive::error::StorageError;
use voxel_archive::{
    decode, encode, export_layer_tiff, import_tiff_stack, ArchiveReader, DataType, ExportOptions,
    ImportError, ImportOptions, PreprocessConfig, Preprocessor, VoxelEncoding,
};

use super::test_utils::{
    layer, memory_storage, oversized_tiff, request, source, u16_layer, u16_stack,
};

/// 16x16x1 RGB pixels covering every byte value, so per-volume
/// normalization maps each sample onto itself.
fn full_range_rgb(shift: u8) -> Vec<u8> {
    (0..16 * 16 * 3)
        .map(|i: usize| (i as u8).wrapping_add(shift))
        .collect()
}

#[tokio::test]
async fn test_rgb_round_trip_through_archive() {
    let storage = memory_storage("ds");
    let inputs: Vec<Vec<u8>> = (0..3).map(|t| full_range_rgb(t * 17)).collect();
    let files = inputs
        .iter()
        .enumerate()
        .map(|(t, rgb)| source(&format!("t{}.tif", t), encode(16, 16, 1, rgb).unwrap()))
        .collect();

    Preprocessor::new(storage.clone(), PreprocessConfig::default())
        .run(request("ds", vec![layer("c1", "c1/rgb", files)]))
        .await
        .unwrap();

    let reader = ArchiveReader::open(storage.clone()).await.unwrap();
    let summary = reader.manifest().find_layer("c1/rgb").unwrap();
    assert_eq!(summary.shape(), (16, 16, 1, 3));
    assert_eq!(summary.data_type, DataType::Uint8);
    assert_eq!((summary.min, summary.max), (0.0, 255.0));

    let imported = reader.import_all(ImportOptions::default()).await.unwrap();
    let volumes = &imported.layer("c1/rgb").unwrap().volumes;
    for (t, rgb) in inputs.iter().enumerate() {
        let volume = volumes[t].as_ref().unwrap();
        assert_eq!(volume.samples.as_ref(), rgb.as_slice(), "timepoint {}", t);
    }

    // Export and decode the TIFF stacks again
    let target = memory_storage("export");
    let report = export_layer_tiff(
        &reader,
        "c1/rgb",
        &target,
        &ExportOptions {
            directory: "out".to_string(),
            level: 0,
        },
    )
    .await
    .unwrap();

    assert_eq!(report.files.len(), 3);
    assert_eq!(report.files[0], "out/c1%2Frgb/t000000.tif");
    for (t, rgb) in inputs.iter().enumerate() {
        let stack = decode(&target.read_all(&report.files[t]).await.unwrap()).unwrap();
        assert_eq!((stack.width, stack.height, stack.depth), (16, 16, 1));
        assert_eq!(stack.rgb.as_ref(), rgb.as_slice());
    }
}

#[tokio::test]
async fn test_export_refuses_existing_directory() {
    let storage = memory_storage("ds");
    Preprocessor::new(storage.clone(), PreprocessConfig::default())
        .run(request("ds", vec![u16_layer("c1", "raw", 2, (4, 4, 1))]))
        .await
        .unwrap();
    let reader = ArchiveReader::open(storage).await.unwrap();

    let target = memory_storage("export");
    target.create_directory("out", true).await.unwrap();

    let result = export_layer_tiff(
        &reader,
        "raw",
        &target,
        &ExportOptions {
            directory: "out".to_string(),
            level: 0,
        },
    )
    .await;
    assert!(matches!(
        result,
        Err(ImportError::Storage(StorageError::AlreadyExists(_)))
    ));
    assert!(!target.exists("out/raw").await);
    assert!(!target.exists("out/raw/t000000.tif").await);

    // Unknown layers are rejected before anything is created
    let result = export_layer_tiff(
        &reader,
        "missing",
        &target,
        &ExportOptions {
            directory: "fresh".to_string(),
            level: 0,
        },
    )
    .await;
    assert_eq!(
        result.err(),
        Some(ImportError::UnknownLayer("missing".to_string()))
    );
    assert!(!target.exists("fresh").await);
}

#[tokio::test]
async fn test_segmentation_labels_are_preserved() {
    let storage = memory_storage("ds");
    let mut labels = layer(
        "c1",
        "c1/seg",
        vec![source(
            "seg.tif",
            u16_stack(4, 4, 1, |x, y, _| if x < 2 { 0 } else { 300 + y as u16 }),
        )],
    );
    labels.is_segmentation = true;

    let result = Preprocessor::new(storage.clone(), PreprocessConfig::default())
        .run(request("ds", vec![labels]))
        .await
        .unwrap();
    let summary = &result.manifest.channels[0].layers[0];
    assert!(summary.is_segmentation);
    assert_eq!(summary.encoding, VoxelEncoding::Label16);

    let reader = ArchiveReader::open(storage).await.unwrap();
    let volume = reader.read_volume("c1/seg", 0, 0).await.unwrap();
    assert_eq!(volume.sample(0, 0, 0, 0), 0);
    assert_eq!(volume.sample(3, 2, 0, 0), 302);
}

#[test]
fn test_import_tiff_stack_normalizes_u16() {
    let bytes = u16_stack(4, 1, 1, |x, _, _| 1000 + x as u16 * 1000);
    let volume = import_tiff_stack(&bytes, false).unwrap();
    assert_eq!(volume.shape(), (4, 1, 1, 1));
    assert_eq!(volume.data_type, DataType::Uint16);
    assert_eq!(volume.value_range, (1000.0, 4000.0));
    assert_eq!(volume.samples.as_ref(), &[0, 85, 170, 255]);
}

#[test]
fn test_import_tiff_stack_rejects_broken_containers() {
    assert!(matches!(
        import_tiff_stack(&oversized_tiff(), false),
        Err(ImportError::CorruptArchive(_))
    ));
    assert!(matches!(
        import_tiff_stack(&bytes::Bytes::from_static(b"not a tiff"), false),
        Err(ImportError::CorruptArchive(_))
    ));
}
