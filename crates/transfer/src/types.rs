use std::fmt;
use std::path::PathBuf;

use crate::TransferError;

/// Length of a SHA-1 chunk digest in bytes.
pub const HASH_LEN: usize = 20;

/// SHA-1 digest of one chunk.
pub type ChunkHash = [u8; HASH_LEN];

/// Half-open byte interval `[start, end)` inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileRange {
    start: u64,
    end: u64,
}

impl FileRange {
    /// Creates a range, rejecting empty or inverted intervals.
    pub fn new(start: u64, end: u64) -> Result<Self, TransferError> {
        if end <= start {
            return Err(TransferError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// First byte of the range (inclusive).
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last byte of the range.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of bytes covered.
    pub fn length(&self) -> u64 {
        self.end - self.start
    }

    /// Returns `true` if `offset` lies inside the range.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end
    }
}

impl fmt::Display for FileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

/// Partitions `[0, file_size)` into contiguous ranges of `chunk_size` bytes.
///
/// The last range is shorter when `file_size` is not a multiple of
/// `chunk_size`. A zero-length file has no chunks, and neither does a zero
/// `chunk_size`.
pub fn chunk_ranges(file_size: u64, chunk_size: u64) -> Vec<FileRange> {
    if chunk_size == 0 {
        return Vec::new();
    }
    let count = file_size.div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(file_size);
            FileRange { start, end }
        })
        .collect()
}

/// Per-chunk state. The discriminant is the byte reported in status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkStatus {
    Missing = 0,
    /// Checked out to a network session.
    Uploading = 1,
    QueuedForCopy = 2,
    Copying = 3,
    Hashing = 4,
    Complete = 5,
}

impl ChunkStatus {
    /// Small integer code used in progress snapshots.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// A local file region believed to contain the same bytes as a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

/// Local copy candidates for all chunks carrying `hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSource {
    pub hash: ChunkHash,
    pub files: Vec<SourceFile>,
}

/// Catalog of previously transferred files, keyed by chunk hash.
///
/// Populated outside this crate; the transfer core only queries it.
pub trait ChunkSourceCatalog: Send + Sync {
    fn get_clone_sources(&self, hashes: &[ChunkHash]) -> Vec<ChunkSource>;
}

/// One fixed-size slice of a file and its bookkeeping.
#[derive(Debug, Clone)]
pub struct FileChunk {
    pub(crate) index: usize,
    pub(crate) range: FileRange,
    pub(crate) expected_hash: Option<ChunkHash>,
    pub(crate) status: ChunkStatus,
    pub(crate) fail_count: u32,
    pub(crate) written_to_disk: bool,
    pub(crate) sources: Vec<SourceFile>,
    pub(crate) sha1: Option<ChunkHash>,
    pub(crate) crc32: Option<u32>,
}

impl FileChunk {
    pub(crate) fn new(index: usize, range: FileRange, expected_hash: Option<ChunkHash>) -> Self {
        Self {
            index,
            range,
            expected_hash,
            status: ChunkStatus::Missing,
            fail_count: 0,
            written_to_disk: false,
            sources: Vec::new(),
            sha1: None,
            crc32: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn range(&self) -> FileRange {
        self.range
    }

    pub fn expected_hash(&self) -> Option<&ChunkHash> {
        self.expected_hash.as_ref()
    }

    pub fn status(&self) -> ChunkStatus {
        self.status
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count
    }

    pub fn written_to_disk(&self) -> bool {
        self.written_to_disk
    }

    pub(crate) fn to_ref(&self) -> ChunkRef {
        ChunkRef {
            index: self.index,
            range: self.range,
            expected_hash: self.expected_hash,
            fail_count: self.fail_count,
            sources: self.sources.clone(),
        }
    }
}

/// Snapshot of a checked-out chunk.
///
/// Whoever holds a `ChunkRef` obtained from [`crate::ChunkList`] owns the
/// chunk until it reports back through `mark_successful` or `mark_failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    pub index: usize,
    pub range: FileRange,
    pub expected_hash: Option<ChunkHash>,
    pub fail_count: u32,
    pub sources: Vec<SourceFile>,
}

impl ChunkRef {
    /// Chunk length in bytes.
    pub fn length(&self) -> u64 {
        self.range.length()
    }
}
