//! Bounded chunk write scheduler.
//!
//! Every chunk write takes a permit from a semaphore sized
//! `max_in_flight_chunk_writes` before it is spawned:
//!
//! ```text
//! submit(key, bytes)
//!     │ cancelled? ──yes──► Aborted
//!     ▼
//! acquire permit (suspends while N writes are in flight)
//!     │
//!     ▼
//! spawn ─► exists? (write-once) ─► backend.write ─► release permit
//!     │
//!     ▼
//! WriteTicket ──wait()──► WriteReceipt
//! ```
//!
//! Completion order across tickets is unspecified.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::layout::{ChunkKey, StorageStrategy};
use crate::error::{PipelineError, StorageError};
use crate::pipeline::CancellationToken;
use crate::storage::StorageHandle;

/// Outcome of one acknowledged chunk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub key: ChunkKey,
    pub path: String,
    pub bytes: u64,
}

/// Handle to one spawned chunk write.
#[derive(Debug)]
pub struct WriteTicket {
    key: ChunkKey,
    path: String,
    handle: JoinHandle<Result<WriteReceipt, StorageError>>,
}

impl WriteTicket {
    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the write to be acknowledged by the backend.
    pub async fn wait(self) -> Result<WriteReceipt, PipelineError> {
        match self.handle.await {
            Ok(result) => result.map_err(PipelineError::from),
            Err(e) => Err(PipelineError::Task(format!("write of {}: {}", self.path, e))),
        }
    }
}

#[derive(Debug, Default)]
struct WriteStats {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    chunks_written: AtomicU64,
    bytes_written: AtomicU64,
}

/// Admission-controlled writer for chunks.
#[derive(Debug)]
pub struct WriteScheduler {
    storage: StorageHandle,
    strategy: StorageStrategy,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    overwrite: bool,
    stats: Arc<WriteStats>,
}

impl WriteScheduler {
    /// Create a scheduler writing through `storage`.
    ///
    /// A zero `max_in_flight_chunk_writes` is treated as 1.
    pub fn new(
        storage: StorageHandle,
        strategy: StorageStrategy,
        cancel: CancellationToken,
        overwrite: bool,
    ) -> Self {
        let permits = strategy.max_in_flight_chunk_writes.max(1) as usize;
        Self {
            storage,
            strategy,
            permits: Arc::new(Semaphore::new(permits)),
            cancel,
            overwrite,
            stats: Arc::new(WriteStats::default()),
        }
    }

    pub fn strategy(&self) -> &StorageStrategy {
        &self.strategy
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    /// Configured bound on concurrent writes.
    pub fn max_in_flight(&self) -> usize {
        self.strategy.max_in_flight_chunk_writes.max(1) as usize
    }

    /// Writes currently running.
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of writes observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.stats.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn chunks_written(&self) -> u64 {
        self.stats.chunks_written.load(Ordering::SeqCst)
    }

    pub fn bytes_written(&self) -> u64 {
        self.stats.bytes_written.load(Ordering::SeqCst)
    }

    /// Spawn a write of `data` to the chunk addressed by `key`.
    ///
    /// Suspends until a write permit is available.
    ///
    /// # Errors
    /// - `Aborted` if the session was cancelled before the write was admitted
    pub async fn submit(&self, key: ChunkKey, data: Bytes) -> Result<WriteTicket, PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Aborted);
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))?;

        if self.cancel.is_cancelled() {
            return Err(PipelineError::Aborted);
        }

        let path = self.strategy.chunk_path(&key);
        let running = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats
            .peak_in_flight
            .fetch_max(running, Ordering::SeqCst);

        let storage = self.storage.clone();
        let stats = self.stats.clone();
        let overwrite = self.overwrite;
        let task_key = key.clone();
        let task_path = path.clone();

        let handle = tokio::spawn(async move {
            let result = write_chunk(&storage, &task_path, data, overwrite).await;
            stats.in_flight.fetch_sub(1, Ordering::SeqCst);

            let outcome = match result {
                Ok(bytes) => {
                    stats.chunks_written.fetch_add(1, Ordering::SeqCst);
                    stats.bytes_written.fetch_add(bytes, Ordering::SeqCst);
                    debug!(path = %task_path, bytes, "Chunk written");
                    Ok(WriteReceipt {
                        key: task_key,
                        path: task_path,
                        bytes,
                    })
                }
                Err(e) => {
                    warn!(path = %task_path, error = %e, "Chunk write failed");
                    Err(e)
                }
            };

            // Stats settle before the permit is released.
            drop(permit);
            outcome
        });

        Ok(WriteTicket { key, path, handle })
    }

    /// Wait until every admitted write has finished.
    pub async fn drain(&self) -> Result<(), PipelineError> {
        let all = self.max_in_flight() as u32;
        let _permits = self
            .permits
            .acquire_many(all)
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))?;
        Ok(())
    }
}

async fn write_chunk(
    storage: &StorageHandle,
    path: &str,
    data: Bytes,
    overwrite: bool,
) -> Result<u64, StorageError> {
    if !overwrite && storage.exists(path).await {
        return Err(StorageError::AlreadyExists(path.to_string()));
    }
    let len = data.len() as u64;
    storage.write(path, 0, data).await?;
    Ok(len)
}
