//! Persistence boundary for synchronized files.
//!
//! A file is persisted as two artifacts under its (bucket, path) key:
//!
//! ```text
//! ┌───────────────┐   raw bytes          ┌──────────────────┐
//! │ DocumentRegistry │ ───────────────────► │ PersistenceAdapter│
//! │ (in-memory)   │   structured state    │  (BlobStore /     │
//! └───────────────┘   (snapshot + log)    │   MemoryAdapter)  │
//!                                         └──────────────────┘
//! ```
//!
//! - raw bytes: the plain file content, what any non-collaborative consumer
//!   of storage reads
//! - structured state: the CRDT merge state, stored as a full snapshot plus
//!   an incremental update log compacted on snapshot writes
//!
//! On cold load the two can disagree (the raw file may have been rewritten
//! outside a live session); reconciliation in the lifecycle layer decides
//! that raw bytes win.

pub mod memory;
pub mod rocks;

pub use memory::MemoryAdapter;
pub use rocks::{BlobStore, FileRecord, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (database, I/O).
    Backend(String),
    /// Stored blob failed to decompress or decode.
    CorruptBlob(String),
    /// Serialization of a stored record failed.
    SerializationError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Backend(e) => write!(f, "Storage backend error: {e}"),
            StoreError::CorruptBlob(e) => write!(f, "Corrupt stored blob: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Narrow contract the synchronization engine persists through.
///
/// Implementations are synchronous; callers run them on the blocking pool
/// under a bounded timeout.
pub trait PersistenceAdapter: Send + Sync + 'static {
    /// Raw file bytes, or None when the file does not exist.
    fn load(&self, bucket: &str, path: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Merged structured state blob (snapshot + update log), or None when
    /// no structured state has been persisted.
    fn load_structured_state(&self, bucket: &str, path: &str)
        -> Result<Option<Vec<u8>>, StoreError>;

    /// Persist raw bytes and structured state. With `write_snapshot` the
    /// state blob is a full snapshot replacing the update log; otherwise it
    /// is an incremental update appended to the log.
    fn save(
        &self,
        bucket: &str,
        path: &str,
        raw: &[u8],
        state_blob: &[u8],
        write_snapshot: bool,
    ) -> Result<(), StoreError>;

    fn exists(&self, bucket: &str, path: &str) -> Result<bool, StoreError>;
}
