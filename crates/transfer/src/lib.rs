//! Chunk bookkeeping for resumable, content-verified image transfers.
//!
//! A file is split into fixed-size chunks tracked by a [`ChunkList`].
//! Network sessions and the [`LocalCopyManager`] check chunks out of the
//! list, and the shared [`HashChecker`] verifies their contents off the
//! I/O path before they are marked complete.

mod chunk_list;
mod hash_checker;
mod local_copy;
mod progress;
mod types;

pub use chunk_list::{ChunkList, ChunkStatusChange, StatusCallback};
pub use hash_checker::{
    DEFAULT_IDLE_WORKER_TIMEOUT, DEFAULT_QUEUE_CAPACITY, HashCallback, HashChecker, HashFlags,
    HashResult, HashTaskResult, sha1_digest,
};
pub use local_copy::{CopySink, LocalCopyManager};
pub use progress::SpeedCalculator;
pub use types::{
    ChunkHash, ChunkRef, ChunkSource, ChunkSourceCatalog, ChunkStatus, FileChunk, FileRange,
    HASH_LEN, SourceFile, chunk_ranges,
};

/// Default chunk size: 16 MiB.
pub const CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid range {start}:{end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("expected {expected} chunk hashes, got {actual}")]
    HashCountMismatch { expected: usize, actual: usize },

    #[error("chunk size must be greater than 0")]
    ZeroChunkSize,
}
