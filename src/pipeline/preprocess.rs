//! Preprocessing orchestrator.
//!
//! Turns a [`PreprocessRequest`] into a chunked archive:
//!
//! ```text
//! scan      group layers by channel, validate names and track bindings,
//!           count volumes
//! level0    decode ─► normalize ─► encode chunk ─► WriteScheduler
//! mips      read L0 back ─► downsample ─► write L1 ─► ... (parent acked first)
//! finalize  tracks/{id}.json, then manifest.json (last write)
//! ```
//!
//! Bad input in one layer (undecodable file, unsupported samples, shape
//! drift) fails only that layer. Storage failures and cancellation fail the
//! session, and a failed session never writes a manifest.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::cancel::CancellationToken;
use super::progress::{Milestone, MilestoneTracker, ProgressEvent, ProgressReporter};
use crate::archive::{
    decode_chunk, encode_chunk, track_path, ChannelSummary, ChunkKey, LayerSummary, Manifest,
    StorageStrategy, TrackRow, TrackSummary, TrackTable, VoxelResolution, WriteScheduler,
    WriteTicket, LAYERS_DIR, MANIFEST_PATH, TRACKS_DIR,
};
use crate::error::{LayerError, PipelineError, StorageError};
use crate::format::tiff::decode_raster;
use crate::storage::StorageHandle;
use crate::volume::{MipConfig, MipGenerator, NormalizedVolume, Normalizer, RangePolicy};

// =============================================================================
// Inputs
// =============================================================================

/// One decoded-from-disk input file.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub name: String,
    pub bytes: Bytes,
}

/// One layer of one channel, with its files in timepoint order.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDescriptor {
    pub channel_id: String,
    pub channel_label: String,
    pub layer_key: String,
    pub label: String,
    pub files: Vec<SourceFile>,
    pub is_segmentation: bool,
}

/// A trajectory table, optionally bound to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSetInput {
    pub id: String,
    pub name: String,
    pub channel_id: Option<String>,
    pub rows: Vec<TrackRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessRequest {
    pub dataset_id: String,
    pub layers: Vec<LayerDescriptor>,
    pub track_sets: Vec<TrackSetInput>,
    pub voxel_resolution: VoxelResolution,
}

/// Session settings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreprocessConfig {
    pub strategy: StorageStrategy,
    pub mip: MipConfig,
    pub range_policy: RangePolicy,

    /// Replace existing chunks and manifest (explicit restart)
    pub overwrite: bool,
}

// =============================================================================
// Outputs
// =============================================================================

/// A layer whose input could not be ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedLayer {
    pub layer_key: String,
    pub error: LayerError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessResult {
    pub manifest: Manifest,
    pub channel_summaries: Vec<ChannelSummary>,
    pub track_summaries: Vec<TrackSummary>,
    pub total_volume_count: u64,
    pub failed_layers: Vec<FailedLayer>,
    pub warnings: Vec<String>,

    /// Milestones entered, in order
    pub milestones: Vec<Milestone>,

    /// Highest number of concurrent chunk writes observed
    pub peak_in_flight_writes: usize,

    pub bytes_written: u64,
}

// =============================================================================
// Session State
// =============================================================================

struct PlannedChannel {
    id: String,
    name: String,
    layers: Vec<LayerDescriptor>,
}

struct ScanPlan {
    channels: Vec<PlannedChannel>,
    track_sets: Vec<TrackSetInput>,
    total_volumes: u64,
}

struct Session {
    manifest: Manifest,
    failed_layers: Vec<FailedLayer>,
    volumes_decoded: u64,
}

impl Session {
    fn warn(&mut self, reporter: &ProgressReporter, message: String) {
        warn!("{}", message);
        reporter.emit(ProgressEvent::Warning(message.clone()));
        self.manifest.warnings.push(message);
    }
}

/// One level-0 chunk ready to be written.
struct EncodedVolume {
    chunk: Bytes,
    volume: NormalizedVolume,
}

// =============================================================================
// Preprocessor
// =============================================================================

/// Drives one preprocessing session against a storage handle.
pub struct Preprocessor {
    storage: StorageHandle,
    config: PreprocessConfig,
    reporter: ProgressReporter,
    cancel: CancellationToken,
}

impl Preprocessor {
    pub fn new(storage: StorageHandle, config: PreprocessConfig) -> Self {
        Self {
            storage,
            config,
            reporter: ProgressReporter::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every milestone. On failure the session ends in a terminal
    /// `Failed` state and no manifest is written.
    pub async fn run(&self, request: PreprocessRequest) -> Result<PreprocessResult, PipelineError> {
        let mut tracker = MilestoneTracker::new();
        info!(
            dataset_id = %request.dataset_id,
            storage = %self.storage.identifier(),
            "Starting preprocessing session"
        );

        match self.run_milestones(&mut tracker, request).await {
            Ok(mut result) => {
                tracker.complete()?;
                result.milestones = tracker.history().to_vec();
                info!(
                    total_volumes = result.total_volume_count,
                    failed_layers = result.failed_layers.len(),
                    bytes_written = result.bytes_written,
                    "Preprocessing complete"
                );
                self.reporter.emit(ProgressEvent::Completed {
                    total_volume_count: result.total_volume_count,
                });
                Ok(result)
            }
            Err(e) => {
                tracker.fail(e.to_string());
                error!(milestone = ?tracker.current(), "Preprocessing failed: {}", e);
                self.reporter.emit(ProgressEvent::Failed {
                    milestone: tracker.current(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_milestones(
        &self,
        tracker: &mut MilestoneTracker,
        request: PreprocessRequest,
    ) -> Result<PreprocessResult, PipelineError> {
        let scheduler = Arc::new(WriteScheduler::new(
            self.storage.clone(),
            self.config.strategy,
            self.cancel.clone(),
            self.config.overwrite,
        ));
        let mut session = Session {
            manifest: Manifest::new(
                &request.dataset_id,
                request.voxel_resolution.clone(),
                self.config.strategy,
                self.config.mip,
                self.config.range_policy,
            ),
            failed_layers: Vec::new(),
            volumes_decoded: 0,
        };

        self.enter(tracker, Milestone::Scan)?;
        let plan = self.scan(&mut session, request).await?;

        self.enter(tracker, Milestone::Level0)?;
        self.level0(&mut session, &plan, &scheduler).await?;

        self.enter(tracker, Milestone::Mips)?;
        self.mips(&mut session, &scheduler).await?;

        self.enter(tracker, Milestone::Finalize)?;
        let track_summaries = self.finalize(&mut session, &plan, &scheduler).await?;

        let manifest = session.manifest;
        Ok(PreprocessResult {
            channel_summaries: manifest.channels.clone(),
            track_summaries,
            total_volume_count: manifest.total_volume_count,
            failed_layers: session.failed_layers,
            warnings: manifest.warnings.clone(),
            manifest,
            milestones: Vec::new(),
            peak_in_flight_writes: scheduler.peak_in_flight(),
            bytes_written: scheduler.bytes_written(),
        })
    }

    fn enter(&self, tracker: &mut MilestoneTracker, milestone: Milestone) -> Result<(), PipelineError> {
        self.check_cancelled()?;
        tracker.advance(milestone)?;
        info!(milestone = %milestone, "Entering milestone");
        self.reporter.emit(ProgressEvent::MilestoneStarted(milestone));
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Aborted)
        } else {
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // scan
    // -------------------------------------------------------------------------

    async fn scan(
        &self,
        session: &mut Session,
        request: PreprocessRequest,
    ) -> Result<ScanPlan, PipelineError> {
        self.config
            .strategy
            .validate()
            .map_err(PipelineError::InvalidInput)?;
        request
            .voxel_resolution
            .validate()
            .map_err(PipelineError::InvalidInput)?;
        if request.dataset_id.trim().is_empty() {
            return Err(PipelineError::InvalidInput("dataset id is empty".to_string()));
        }

        if !self.config.overwrite {
            for path in [MANIFEST_PATH, TRACKS_DIR] {
                if self.storage.exists(path).await {
                    return Err(StorageError::AlreadyExists(self.storage.resolve(path)).into());
                }
            }
        }

        // Group layers by channel, keeping first-seen order
        let mut channels: Vec<PlannedChannel> = Vec::new();
        let mut layer_keys = HashSet::new();
        for layer in request.layers {
            if layer.layer_key.is_empty() {
                return Err(PipelineError::InvalidInput(format!(
                    "layer {:?} of channel {} has an empty key",
                    layer.label, layer.channel_id
                )));
            }
            if !layer_keys.insert(layer.layer_key.clone()) {
                return Err(PipelineError::InvalidInput(format!(
                    "duplicate layer key {}",
                    layer.layer_key
                )));
            }

            match channels.iter_mut().find(|c| c.id == layer.channel_id) {
                Some(channel) => channel.layers.push(layer),
                None => {
                    let name = layer.channel_label.trim().to_string();
                    if name.is_empty() {
                        return Err(PipelineError::InvalidInput(format!(
                            "channel {} has an empty name",
                            layer.channel_id
                        )));
                    }
                    channels.push(PlannedChannel {
                        id: layer.channel_id.clone(),
                        name,
                        layers: vec![layer],
                    });
                }
            }
        }

        let mut names = HashSet::new();
        for channel in &channels {
            if !names.insert(channel.name.as_str()) {
                return Err(PipelineError::InvalidInput(format!(
                    "duplicate channel name {:?}",
                    channel.name
                )));
            }
        }

        // Timepoint counts per channel
        let counts: Vec<(String, usize)> = channels
            .iter()
            .map(|c| {
                let count = c.layers.iter().map(|l| l.files.len()).max().unwrap_or(0);
                (c.name.clone(), count)
            })
            .collect();
        let distinct: HashSet<usize> = counts.iter().map(|(_, n)| *n).collect();
        if distinct.len() > 1 {
            session.manifest.has_global_timepoint_mismatch = true;
            let detail = counts
                .iter()
                .map(|(name, n)| format!("{}={}", name, n))
                .collect::<Vec<_>>()
                .join(", ");
            session.warn(
                &self.reporter,
                format!("Channels have differing timepoint counts: {}", detail),
            );
        }

        // Track bindings
        let channel_ids: HashSet<&str> = channels.iter().map(|c| c.id.as_str()).collect();
        let mut track_ids = HashSet::new();
        let mut track_sets = Vec::with_capacity(request.track_sets.len());
        for mut track_set in request.track_sets {
            if !track_ids.insert(track_set.id.clone()) {
                return Err(PipelineError::InvalidInput(format!(
                    "duplicate track set id {}",
                    track_set.id
                )));
            }
            if let Some(bound) = &track_set.channel_id {
                if !channel_ids.contains(bound.as_str()) {
                    let message = format!(
                        "Track set {} is bound to unknown channel {}; leaving it unbound",
                        track_set.id, bound
                    );
                    track_set.channel_id = None;
                    session.warn(&self.reporter, message);
                }
            }
            track_sets.push(track_set);
        }

        let total_volumes = channels
            .iter()
            .flat_map(|c| c.layers.iter())
            .map(|l| l.files.len() as u64)
            .sum();

        // Claim the chunk tree before the first write. Leftovers of an
        // earlier session are only reused with overwrite.
        self.storage
            .create_directory(LAYERS_DIR, self.config.overwrite)
            .await?;

        info!(
            channels = channels.len(),
            track_sets = track_sets.len(),
            total_volumes,
            "Scan complete"
        );
        self.reporter.milestone_progress(Milestone::Scan, 1, 1);

        Ok(ScanPlan {
            channels,
            track_sets,
            total_volumes,
        })
    }

    // -------------------------------------------------------------------------
    // level0
    // -------------------------------------------------------------------------

    async fn level0(
        &self,
        session: &mut Session,
        plan: &ScanPlan,
        scheduler: &WriteScheduler,
    ) -> Result<(), PipelineError> {
        let normalizer = Normalizer::new(self.config.range_policy);

        for channel in &plan.channels {
            let mut summary = ChannelSummary {
                id: channel.id.clone(),
                name: channel.name.clone(),
                layers: Vec::new(),
            };

            for layer in &channel.layers {
                match self
                    .ingest_layer(session, plan.total_volumes, layer, normalizer, scheduler)
                    .await?
                {
                    Ok(layer_summary) => summary.layers.push(layer_summary),
                    Err(layer_error) => {
                        warn!(
                            layer = %layer.layer_key,
                            "Layer failed: {}",
                            layer_error
                        );
                        self.reporter.emit(ProgressEvent::LayerFailed {
                            layer_key: layer.layer_key.clone(),
                            reason: layer_error.to_string(),
                        });
                        session.failed_layers.push(FailedLayer {
                            layer_key: layer.layer_key.clone(),
                            error: layer_error,
                        });
                    }
                }
            }

            session.manifest.channels.push(summary);
        }

        session.manifest.total_volume_count = session.manifest.computed_volume_count();
        Ok(())
    }

    /// Ingest every timepoint of one layer.
    ///
    /// The outer result carries session failures; the inner one carries
    /// input errors that only fail this layer.
    async fn ingest_layer(
        &self,
        session: &mut Session,
        total_volumes: u64,
        layer: &LayerDescriptor,
        normalizer: Normalizer,
        scheduler: &WriteScheduler,
    ) -> Result<Result<LayerSummary, LayerError>, PipelineError> {
        if layer.files.is_empty() {
            return Ok(Err(LayerError::NoFiles));
        }

        let mut summary: Option<LayerSummary> = None;
        let mut tickets: Vec<WriteTicket> = Vec::with_capacity(layer.files.len());
        let mut outcome = Ok(());

        for (timepoint, file) in layer.files.iter().enumerate() {
            self.check_cancelled()?;
            let timepoint = timepoint as u32;

            let bytes = file.bytes.clone();
            let is_segmentation = layer.is_segmentation;
            let encoded = tokio::task::spawn_blocking(move || {
                encode_timepoint(&bytes, timepoint, is_segmentation, normalizer)
            })
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))?;

            let EncodedVolume { chunk, volume } = match encoded {
                Ok(encoded) => encoded,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            };

            match summary.as_mut() {
                None => {
                    summary = Some(LayerSummary::from_first_volume(
                        &layer.layer_key,
                        &layer.label,
                        layer.is_segmentation,
                        &volume,
                    ));
                }
                Some(existing) => {
                    if existing.shape() != volume.shape() {
                        outcome = Err(LayerError::ShapeDrift {
                            timepoint,
                            expected: existing.shape(),
                            actual: volume.shape(),
                        });
                        break;
                    }
                    existing.add_volume(&volume);
                }
            }

            debug!(
                layer = %layer.layer_key,
                timepoint,
                file = %file.name,
                "Volume normalized"
            );
            let key = ChunkKey::new(layer.layer_key.clone(), 0, timepoint);
            tickets.push(scheduler.submit(key, chunk).await?);

            session.volumes_decoded += 1;
            self.reporter.emit(ProgressEvent::VolumesDecoded {
                decoded: session.volumes_decoded,
                total: total_volumes,
            });
            self.reporter.milestone_progress(
                Milestone::Level0,
                session.volumes_decoded,
                total_volumes,
            );
        }

        // Chunks already submitted are acknowledged even when the layer failed
        for ticket in tickets {
            if let Err(e) = ticket.wait().await {
                let source = match e {
                    PipelineError::Storage(storage) => LayerError::Storage(storage),
                    other => return Err(other),
                };
                self.reporter.emit(ProgressEvent::LayerFailed {
                    layer_key: layer.layer_key.clone(),
                    reason: source.to_string(),
                });
                return Err(PipelineError::Layer {
                    key: layer.layer_key.clone(),
                    source,
                });
            }
            self.reporter.emit(ProgressEvent::BytesProcessed {
                processed: scheduler.bytes_written(),
                total: None,
            });
        }

        match (outcome, summary) {
            (Ok(()), Some(summary)) => Ok(Ok(summary)),
            (Ok(()), None) => Ok(Err(LayerError::NoFiles)),
            (Err(e), _) => Ok(Err(e)),
        }
    }

    // -------------------------------------------------------------------------
    // mips
    // -------------------------------------------------------------------------

    async fn mips(
        &self,
        session: &mut Session,
        scheduler: &Arc<WriteScheduler>,
    ) -> Result<(), PipelineError> {
        let generator = MipGenerator::new(self.config.mip);
        let unit_permits = Arc::new(Semaphore::new(scheduler.max_in_flight()));

        // (layer key, timepoint count, planned levels)
        let jobs: Vec<(String, u32, u32)> = session
            .manifest
            .layers()
            .map(|(_, l)| {
                let levels = self.config.mip.plan(l.width, l.height, l.depth).len() as u32;
                (l.key.clone(), l.volume_count, levels)
            })
            .collect();

        let total_units: u64 = jobs
            .iter()
            .filter(|(_, _, levels)| *levels > 0)
            .map(|(_, count, _)| *count as u64)
            .sum();
        let mut done_units = 0u64;
        let mut produced: HashMap<String, u32> = HashMap::new();
        let mut units = JoinSet::new();

        for (key, count, levels) in &jobs {
            produced.insert(key.clone(), 0);
            if *levels == 0 {
                continue;
            }
            for timepoint in 0..*count {
                self.check_cancelled()?;
                let permit = unit_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Task(e.to_string()))?;
                let storage = self.storage.clone();
                let scheduler = scheduler.clone();
                let key = key.clone();
                units.spawn(async move {
                    let result = mip_unit(&storage, &scheduler, generator, &key, timepoint).await;
                    drop(permit);
                    result.map(|levels| (key, levels))
                });

                // Reap finished units so failures surface early
                while let Some(joined) = units.try_join_next() {
                    let (key, levels) = joined.map_err(|e| PipelineError::Task(e.to_string()))??;
                    produced.insert(key, levels);
                    done_units += 1;
                    self.reporter
                        .milestone_progress(Milestone::Mips, done_units, total_units);
                }
            }
        }

        while let Some(joined) = units.join_next().await {
            let (key, levels) = joined.map_err(|e| PipelineError::Task(e.to_string()))??;
            produced.insert(key, levels);
            done_units += 1;
            self.reporter
                .milestone_progress(Milestone::Mips, done_units, total_units);
        }

        for channel in &mut session.manifest.channels {
            for layer in &mut channel.layers {
                layer.mip_levels = produced.get(&layer.key).copied().unwrap_or(0);
            }
        }
        info!(units = done_units, "Mip generation complete");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // finalize
    // -------------------------------------------------------------------------

    async fn finalize(
        &self,
        session: &mut Session,
        plan: &ScanPlan,
        scheduler: &WriteScheduler,
    ) -> Result<Vec<TrackSummary>, PipelineError> {
        let mut summaries = Vec::with_capacity(plan.track_sets.len());

        for track_set in &plan.track_sets {
            self.check_cancelled()?;
            let table = TrackTable {
                id: track_set.id.clone(),
                rows: track_set.rows.clone(),
            };
            let bytes = serde_json::to_vec(&table)
                .map_err(|e| PipelineError::Serialize(e.to_string()))?;
            self.write_object(&track_path(&track_set.id), Bytes::from(bytes))
                .await?;

            summaries.push(TrackSummary {
                id: track_set.id.clone(),
                name: track_set.name.clone(),
                bound_channel_id: track_set.channel_id.clone(),
                total_rows: track_set.rows.len() as u64,
                unique_tracks: None,
            });
        }
        session.manifest.tracks = summaries.clone();

        scheduler.drain().await?;
        self.check_cancelled()?;

        let manifest = session
            .manifest
            .to_json()
            .map_err(|e| PipelineError::Serialize(e.to_string()))?;
        self.write_object(MANIFEST_PATH, manifest).await?;
        self.reporter.milestone_progress(Milestone::Finalize, 1, 1);

        info!(
            total_volumes = session.manifest.total_volume_count,
            "Manifest written"
        );
        Ok(summaries)
    }

    /// Write a whole non-chunk object, honoring write-once.
    async fn write_object(&self, path: &str, bytes: Bytes) -> Result<(), PipelineError> {
        if !self.config.overwrite && self.storage.exists(path).await {
            return Err(StorageError::AlreadyExists(self.storage.resolve(path)).into());
        }
        self.storage.write(path, 0, bytes).await?;
        Ok(())
    }
}

/// Decode, normalize and encode one timepoint.
fn encode_timepoint(
    bytes: &[u8],
    timepoint: u32,
    is_segmentation: bool,
    normalizer: Normalizer,
) -> Result<EncodedVolume, LayerError> {
    let stack = decode_raster(bytes).map_err(|source| LayerError::Decode { timepoint, source })?;
    let volume = normalizer
        .normalize_stack(&stack, is_segmentation)
        .map_err(|source| LayerError::Normalize { timepoint, source })?;
    let chunk = encode_chunk(&volume);
    Ok(EncodedVolume { chunk, volume })
}

/// Produce every coarser level of one timepoint. Each level is written and
/// acknowledged before the next one is computed.
async fn mip_unit(
    storage: &StorageHandle,
    scheduler: &WriteScheduler,
    generator: MipGenerator,
    layer_key: &str,
    timepoint: u32,
) -> Result<u32, PipelineError> {
    let level0_path = scheduler
        .strategy()
        .chunk_path(&ChunkKey::new(layer_key, 0, timepoint));
    let stored = storage.read_all(&level0_path).await?;
    let mut current = decode_chunk(&stored)?;
    let mut levels_done = 0u32;

    loop {
        let parent = current;
        let next = tokio::task::spawn_blocking(move || {
            generator
                .next_level(&parent, levels_done)
                .map(|volume| (encode_chunk(&volume), volume))
        })
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))?;

        let Some((chunk, volume)) = next else {
            break;
        };

        levels_done += 1;
        let key = ChunkKey::new(layer_key, levels_done, timepoint);
        scheduler.submit(key, chunk).await?.wait().await?;
        current = volume;
    }

    debug!(layer = %layer_key, timepoint, levels = levels_done, "Mips written");
    Ok(levels_done)
}
