use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::TransferError;
use crate::types::{ChunkHash, ChunkRef, ChunkSource, ChunkStatus, FileChunk, chunk_ranges};

/// A chunk changed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStatusChange {
    pub index: usize,
    pub status: ChunkStatus,
}

/// Listener invoked for every chunk status change.
pub type StatusCallback = Box<dyn Fn(ChunkStatusChange) + Send + Sync>;

/// All chunks of one file, partitioned into missing, pending and complete.
///
/// Every transition happens under a single lock, so a chunk is never handed
/// out twice and never lost between partitions. Listeners are invoked after
/// the lock is released.
pub struct ChunkList {
    inner: Mutex<ChunkListInner>,
    changed: Notify,
    listeners: RwLock<Vec<StatusCallback>>,
    file_size: u64,
}

struct ChunkListInner {
    chunks: Vec<FileChunk>,
    /// Front is handed out first; retries are pushed to the front.
    missing: VecDeque<usize>,
    pending: Vec<usize>,
    complete: Vec<usize>,
}

impl ChunkListInner {
    fn take_pending(&mut self, index: usize) -> bool {
        match self.pending.iter().position(|&i| i == index) {
            Some(pos) => {
                self.pending.swap_remove(pos);
                true
            }
            None => false,
        }
    }
}

impl ChunkList {
    /// Splits a file of `file_size` bytes into chunks of `chunk_size`.
    ///
    /// `hashes`, when given, must hold one digest per chunk.
    pub fn new(
        file_size: u64,
        chunk_size: u64,
        hashes: Option<Vec<ChunkHash>>,
    ) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::ZeroChunkSize);
        }
        let ranges = chunk_ranges(file_size, chunk_size);
        if let Some(h) = &hashes
            && h.len() != ranges.len()
        {
            return Err(TransferError::HashCountMismatch {
                expected: ranges.len(),
                actual: h.len(),
            });
        }

        let chunks: Vec<FileChunk> = ranges
            .into_iter()
            .enumerate()
            .map(|(i, range)| FileChunk::new(i, range, hashes.as_ref().map(|h| h[i])))
            .collect();
        let missing = (0..chunks.len()).collect();

        Ok(Self {
            inner: Mutex::new(ChunkListInner {
                chunks,
                missing,
                pending: Vec::new(),
                complete: Vec::new(),
            }),
            changed: Notify::new(),
            listeners: RwLock::new(Vec::new()),
            file_size,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChunkListInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, changes: &[ChunkStatusChange]) {
        if changes.is_empty() {
            return;
        }
        self.changed.notify_waiters();
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for change in changes {
            for cb in listeners.iter() {
                cb(*change);
            }
        }
    }

    /// Registers a status change listener.
    pub fn on_status_change(&self, callback: StatusCallback) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Checks out the first missing chunk for a network session.
    ///
    /// Chunks queued for local copy are skipped. Returns `None` when no
    /// chunk is available right now.
    pub fn get_missing(&self) -> Option<ChunkRef> {
        let chunk = {
            let mut inner = self.lock();
            let pos = inner
                .missing
                .iter()
                .position(|&i| inner.chunks[i].status == ChunkStatus::Missing)?;
            let index = inner.missing.remove(pos)?;
            inner.pending.push(index);
            let chunk = &mut inner.chunks[index];
            chunk.status = ChunkStatus::Uploading;
            chunk.to_ref()
        };
        self.publish(&[ChunkStatusChange {
            index: chunk.index,
            status: ChunkStatus::Uploading,
        }]);
        Some(chunk)
    }

    /// Like [`get_missing`](Self::get_missing), but waits up to `timeout`
    /// for a chunk to come back from another owner.
    ///
    /// Returns `None` on timeout or as soon as the list is complete.
    pub async fn get_missing_wait(&self, timeout: Duration) -> Option<ChunkRef> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(chunk) = self.get_missing() {
                return Some(chunk);
            }
            if self.is_complete() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Checks out the first chunk queued for local copy.
    pub fn get_copy_candidate(&self) -> Option<ChunkRef> {
        let chunk = {
            let mut inner = self.lock();
            let pos = inner
                .missing
                .iter()
                .position(|&i| inner.chunks[i].status == ChunkStatus::QueuedForCopy)?;
            let index = inner.missing.remove(pos)?;
            inner.pending.push(index);
            let chunk = &mut inner.chunks[index];
            chunk.status = ChunkStatus::Copying;
            chunk.to_ref()
        };
        self.publish(&[ChunkStatusChange {
            index: chunk.index,
            status: ChunkStatus::Copying,
        }]);
        Some(chunk)
    }

    /// Flags a pending chunk as being verified.
    pub fn mark_hashing(&self, index: usize) -> bool {
        {
            let mut inner = self.lock();
            if !inner.pending.contains(&index) {
                warn!(chunk = index, "mark_hashing on chunk that is not pending");
                return false;
            }
            inner.chunks[index].status = ChunkStatus::Hashing;
        }
        self.publish(&[ChunkStatusChange {
            index,
            status: ChunkStatus::Hashing,
        }]);
        true
    }

    /// Moves a pending chunk to complete.
    ///
    /// Returns `false` (and changes nothing) if the chunk was not pending.
    pub fn mark_successful(&self, index: usize) -> bool {
        {
            let mut inner = self.lock();
            if !inner.take_pending(index) {
                warn!(chunk = index, "mark_successful on chunk that is not pending");
                return false;
            }
            let chunk = &mut inner.chunks[index];
            chunk.status = ChunkStatus::Complete;
            chunk.written_to_disk = true;
            inner.complete.push(index);
        }
        debug!(chunk = index, "chunk complete");
        self.publish(&[ChunkStatusChange {
            index,
            status: ChunkStatus::Complete,
        }]);
        true
    }

    /// Returns a pending chunk to the front of the missing queue.
    ///
    /// Increments the fail count and returns the new value, or `None` if the
    /// chunk was not pending. With `clear_sources` the chunk loses its local
    /// copy candidates and will be fetched over the network.
    pub fn mark_failed(&self, index: usize, clear_sources: bool) -> Option<u32> {
        let fail_count = {
            let mut inner = self.lock();
            if !inner.take_pending(index) {
                warn!(chunk = index, "mark_failed on chunk that is not pending");
                return None;
            }
            let chunk = &mut inner.chunks[index];
            chunk.fail_count += 1;
            chunk.written_to_disk = false;
            chunk.status = ChunkStatus::Missing;
            if clear_sources {
                chunk.sources.clear();
            }
            let fail_count = chunk.fail_count;
            inner.missing.push_front(index);
            fail_count
        };
        self.publish(&[ChunkStatusChange {
            index,
            status: ChunkStatus::Missing,
        }]);
        Some(fail_count)
    }

    /// Installs the expected digests after chunks may already be complete.
    ///
    /// Complete chunks whose known digest disagrees go back to the front of
    /// the missing queue with an incremented fail count. A complete chunk
    /// with no digest at all counts as a mismatch. Returns the number of
    /// chunks invalidated.
    pub fn set_expected_hashes(&self, hashes: Vec<ChunkHash>) -> Result<usize, TransferError> {
        let mut changes = Vec::new();
        {
            let mut inner = self.lock();
            if hashes.len() != inner.chunks.len() {
                return Err(TransferError::HashCountMismatch {
                    expected: inner.chunks.len(),
                    actual: hashes.len(),
                });
            }

            let mut invalid = Vec::new();
            for (chunk, hash) in inner.chunks.iter_mut().zip(hashes) {
                let known = chunk.sha1.or(chunk.expected_hash);
                chunk.expected_hash = Some(hash);
                if chunk.status == ChunkStatus::Complete && known != Some(hash) {
                    invalid.push(chunk.index);
                }
            }

            for index in invalid {
                inner.complete.retain(|&i| i != index);
                let chunk = &mut inner.chunks[index];
                chunk.status = ChunkStatus::Missing;
                chunk.written_to_disk = false;
                chunk.fail_count += 1;
                warn!(
                    chunk = index,
                    fail_count = chunk.fail_count,
                    "written chunk does not match late hash list"
                );
                inner.missing.push_front(index);
                changes.push(ChunkStatusChange {
                    index,
                    status: ChunkStatus::Missing,
                });
            }
        }
        self.publish(&changes);
        Ok(changes.len())
    }

    /// Attaches local copy candidates and queues matching missing chunks
    /// for copying. Returns the number of chunks queued.
    pub fn add_copy_sources(&self, sources: &[ChunkSource]) -> usize {
        let mut changes = Vec::new();
        {
            let mut inner = self.lock();
            let ChunkListInner {
                chunks, missing, ..
            } = &mut *inner;
            for &index in missing.iter() {
                let chunk = &mut chunks[index];
                if chunk.status != ChunkStatus::Missing {
                    continue;
                }
                let Some(expected) = chunk.expected_hash else {
                    continue;
                };
                let len = chunk.range.length();
                let files: Vec<_> = sources
                    .iter()
                    .filter(|s| s.hash == expected)
                    .flat_map(|s| s.files.iter())
                    .filter(|f| f.length == len)
                    .cloned()
                    .collect();
                if files.is_empty() {
                    continue;
                }
                chunk.sources = files;
                chunk.status = ChunkStatus::QueuedForCopy;
                changes.push(ChunkStatusChange {
                    index,
                    status: ChunkStatus::QueuedForCopy,
                });
            }
        }
        self.publish(&changes);
        changes.len()
    }

    /// Stores digests computed while the chunk passed through the hash pipeline.
    pub fn set_computed_hash(&self, index: usize, sha1: Option<ChunkHash>, crc32: Option<u32>) {
        let mut inner = self.lock();
        if let Some(chunk) = inner.chunks.get_mut(index) {
            if sha1.is_some() {
                chunk.sha1 = sha1;
            }
            if crc32.is_some() {
                chunk.crc32 = crc32;
            }
        }
    }

    /// Per-chunk CRC32 values, once every chunk has one.
    pub fn crc32_list(&self) -> Option<Vec<u32>> {
        self.lock().chunks.iter().map(|c| c.crc32).collect()
    }

    /// All expected hashes, if every chunk has one.
    pub fn expected_hashes(&self) -> Option<Vec<ChunkHash>> {
        self.lock().chunks.iter().map(|c| c.expected_hash).collect()
    }

    /// One status byte per chunk, for progress reporting.
    pub fn status_snapshot(&self) -> Vec<u8> {
        self.lock().chunks.iter().map(|c| c.status.code()).collect()
    }

    /// Returns a copy of the chunk at `index`.
    pub fn chunk(&self, index: usize) -> Option<FileChunk> {
        self.lock().chunks.get(index).cloned()
    }

    /// `true` once nothing is missing or pending.
    pub fn is_complete(&self) -> bool {
        let inner = self.lock();
        inner.missing.is_empty() && inner.pending.is_empty()
    }

    /// `true` while chunks still depend on the network or the hash pipeline.
    pub fn has_network_work(&self) -> bool {
        let inner = self.lock();
        inner
            .missing
            .iter()
            .any(|&i| inner.chunks[i].status == ChunkStatus::Missing)
            || inner.pending.iter().any(|&i| {
                matches!(
                    inner.chunks[i].status,
                    ChunkStatus::Uploading | ChunkStatus::Hashing
                )
            })
    }

    pub fn total_chunks(&self) -> usize {
        self.lock().chunks.len()
    }

    pub fn missing_count(&self) -> usize {
        self.lock().missing.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn complete_count(&self) -> usize {
        self.lock().complete.len()
    }

    /// Bytes covered by complete chunks.
    pub fn complete_bytes(&self) -> u64 {
        let inner = self.lock();
        inner
            .complete
            .iter()
            .map(|&i| inner.chunks[i].range.length())
            .sum()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Indices in the missing queue, front first.
    pub fn missing_indices(&self) -> Vec<usize> {
        self.lock().missing.iter().copied().collect()
    }
}
