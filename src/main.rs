//! voxel-archive - Preprocess microscopy volumes into chunked archives.
//!
//! This binary wires the command line onto the preprocessing, inspection
//! and export pipelines.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bytes::Bytes;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voxel_archive::{
    config::{Cli, Command, DatasetDescriptor, ExportArgs, InspectArgs, PreprocessArgs},
    export_layer_tiff, ArchiveReader, CancellationToken, ExportOptions, LayerDescriptor,
    PreprocessRequest, Preprocessor, ProgressEvent, ProgressReporter, SourceFile, StorageHandle,
    TrackSetInput,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Preprocess(args) => run_preprocess(args).await,
        Command::Inspect(args) => run_inspect(args).await,
        Command::Export(args) => run_export(args).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "voxel_archive=debug"
    } else {
        "voxel_archive=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            token.cancel();
        }
    });
}

/// Log progress events until the reporter is dropped.
fn log_progress(mut events: mpsc::UnboundedReceiver<ProgressEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ProgressEvent::MilestoneStarted(milestone) => info!("── {} ──", milestone),
                ProgressEvent::MilestoneProgress { milestone, percent } => {
                    debug!(milestone = %milestone, "{:.0}%", percent)
                }
                ProgressEvent::VolumesDecoded { decoded, total } => {
                    debug!("Decoded {}/{} volumes", decoded, total)
                }
                ProgressEvent::BytesProcessed { processed, total } => match total {
                    Some(total) => debug!("{}/{} bytes", processed, total),
                    None => debug!("{} bytes", processed),
                },
                // Warnings and failures are logged where they happen
                _ => {}
            }
        }
    })
}

// =============================================================================
// Preprocess Command
// =============================================================================

async fn run_preprocess(args: PreprocessArgs) -> ExitCode {
    init_logging(args.verbose);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let request = match load_request(&args.input).await {
        Ok(request) => request,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = args.preprocess_config();
    info!("Configuration:");
    info!("  Output: {}", args.output.display());
    info!(
        "  Writes in flight: {}",
        config.strategy.max_in_flight_chunk_writes
    );
    if config.strategy.sharding.enabled {
        info!("  Shards: {}", config.strategy.sharding.shard_count);
    } else {
        info!("  Shards: disabled");
    }
    info!(
        "  Mips: down to {} voxels, at most {} levels",
        config.mip.min_dimension, config.mip.max_levels
    );
    if config.overwrite {
        warn!("  Overwrite: existing chunks and manifest will be replaced");
    }

    let storage = StorageHandle::directory(&args.output, request.dataset_id.clone());
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let (reporter, events) = ProgressReporter::channel();
    let logger = log_progress(events);

    let result = Preprocessor::new(storage, config)
        .with_progress(reporter)
        .with_cancellation(cancel)
        .run(request)
        .await;
    let _ = logger.await;

    match result {
        Ok(result) => {
            println!();
            println!("✓ Archive written to {}", args.output.display());
            println!("  Volumes: {}", result.total_volume_count);
            for channel in &result.channel_summaries {
                println!(
                    "  Channel {} ({}): {} layer(s), {} timepoint(s)",
                    channel.name,
                    channel.id,
                    channel.layers.len(),
                    channel.timepoint_count()
                );
            }
            for failed in &result.failed_layers {
                println!("✗ Layer {}: {}", failed.layer_key, failed.error);
            }
            for warning in &result.warnings {
                println!("! {}", warning);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Preprocessing failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Read the dataset descriptor and every file it lists.
async fn load_request(descriptor_path: &Path) -> Result<PreprocessRequest, String> {
    let raw = tokio::fs::read(descriptor_path)
        .await
        .map_err(|e| format!("Failed to read {}: {}", descriptor_path.display(), e))?;
    let descriptor = DatasetDescriptor::from_json(&raw)?;
    let base = descriptor_path.parent().unwrap_or_else(|| Path::new("."));

    info!(
        dataset_id = %descriptor.dataset_id,
        files = descriptor.file_count(),
        "Loading dataset"
    );

    let mut layers = Vec::new();
    for channel in &descriptor.channels {
        for layer in &channel.layers {
            let mut files = Vec::with_capacity(layer.files.len());
            for file in &layer.files {
                let path = resolve(base, file);
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
                files.push(SourceFile {
                    name: file.display().to_string(),
                    bytes: Bytes::from(bytes),
                });
            }

            layers.push(LayerDescriptor {
                channel_id: channel.id.clone(),
                channel_label: channel.name.clone(),
                layer_key: layer.key.clone(),
                label: layer.label.clone().unwrap_or_else(|| layer.key.clone()),
                files,
                is_segmentation: layer.is_segmentation,
            });
        }
    }

    let track_sets = descriptor
        .track_sets
        .into_iter()
        .map(|t| TrackSetInput {
            id: t.id,
            name: t.name,
            channel_id: t.channel_id,
            rows: t.rows,
        })
        .collect();

    Ok(PreprocessRequest {
        dataset_id: descriptor.dataset_id,
        layers,
        track_sets,
        voxel_resolution: descriptor.voxel_resolution,
    })
}

fn resolve(base: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        base.join(file)
    }
}

// =============================================================================
// Inspect Command
// =============================================================================

async fn run_inspect(args: InspectArgs) -> ExitCode {
    if args.verbose {
        init_logging(true);
    }

    let reader = match ArchiveReader::open(StorageHandle::directory(&args.archive, "")).await {
        Ok(reader) => reader,
        Err(e) => {
            println!("✗ {}: {}", args.archive.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let manifest = reader.manifest();
    let resolution = &manifest.voxel_resolution;
    println!("Archive {}", args.archive.display());
    println!("═════════════════════════════════");
    println!("  Dataset: {}", manifest.dataset_id);
    println!(
        "  Voxel size: {} x {} x {} {}",
        resolution.x, resolution.y, resolution.z, resolution.unit
    );
    println!("  Volumes: {}", manifest.total_volume_count);
    println!();

    for channel in &manifest.channels {
        println!("Channel {} ({})", channel.name, channel.id);
        for layer in &channel.layers {
            println!(
                "  {} {}x{}x{}x{} {:?} t={} mips={}{}",
                layer.key,
                layer.width,
                layer.height,
                layer.depth,
                layer.channels,
                layer.encoding,
                layer.volume_count,
                layer.mip_levels,
                if layer.is_segmentation { " (labels)" } else { "" }
            );
        }
    }

    if !manifest.tracks.is_empty() {
        println!();
        println!("Track sets:");
        for track in &manifest.tracks {
            let unique = if args.tracks {
                match reader.read_tracks(&track.id).await {
                    Ok((_, summary)) => summary.unique_tracks,
                    Err(e) => {
                        println!("✗ {}: {}", track.id, e);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                None
            };
            match unique {
                Some(unique) => println!(
                    "  {} ({}): {} rows, {} tracks",
                    track.name, track.id, track.total_rows, unique
                ),
                None => println!("  {} ({}): {} rows", track.name, track.id, track.total_rows),
            }
        }
    }

    if !manifest.warnings.is_empty() {
        println!();
        for warning in &manifest.warnings {
            println!("! {}", warning);
        }
    }

    ExitCode::SUCCESS
}

// =============================================================================
// Export Command
// =============================================================================

async fn run_export(args: ExportArgs) -> ExitCode {
    init_logging(args.verbose);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let reader = match ArchiveReader::open(StorageHandle::directory(&args.archive, "")).await {
        Ok(reader) => reader.with_cancellation(cancel),
        Err(e) => {
            error!("Failed to open {}: {}", args.archive.display(), e);
            return ExitCode::FAILURE;
        }
    };

    // Validated above: the output has a final component
    let name = args
        .output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = match args.output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let target = StorageHandle::directory(parent, reader.manifest().dataset_id.clone());
    let options = ExportOptions {
        directory: name,
        level: args.level,
    };

    match export_layer_tiff(&reader, &args.layer, &target, &options).await {
        Ok(report) => {
            println!(
                "✓ Exported {} file(s), {} bytes, to {}",
                report.files.len(),
                report.bytes_written,
                args.output.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Export failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
