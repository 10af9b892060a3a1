//! Storage backends.
//!
//! Archives are written through the [`StorageBackend`] trait, which exposes
//! byte-range reads and writes over `/`-separated relative paths:
//!
//! ```text
//!                 StorageHandle (root + dataset id)
//!                          │
//!              Arc<dyn StorageBackend>
//!                 ┌────────┴─────────┐
//!    OriginPrivateBackend     DirectoryBackend
//!    (in-process store)       (tokio::fs tree)
//! ```

mod backend;
mod directory;
mod handle;
mod origin;

pub use backend::{join_path, normalize_path, DirectoryHandle, StorageBackend};
pub use directory::DirectoryBackend;
pub use handle::StorageHandle;
pub use origin::{OriginPrivateBackend, OriginPrivateStore};
