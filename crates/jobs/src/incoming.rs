//! Receiving job: one destination file filled by concurrent download
//! sessions and, where possible, by local copies of identical chunks.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use imgsync_data_channel::{
    DownloadHandler, Downloader, ERROR_CANCELLED, ERROR_OUT_OF_DISK_SPACE, ERROR_OUT_OF_MEMORY,
    NextRange, SessionError,
};
use imgsync_transfer::{
    ChunkHash, ChunkList, ChunkRef, ChunkSourceCatalog, CopySink, FileRange, HashChecker,
    HashFlags, HashResult, HashTaskResult, LocalCopyManager, SpeedCalculator,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TransferConfig;
use crate::error::JobError;
use crate::pool::SessionPool;
use crate::state::{JobCore, JobState, TransferProgress};

/// Error code sent when the destination file could not be written.
pub const ERROR_WRITE_FAILED: &str = "write failed";

/// Error code sent when the hash service stopped working.
pub const ERROR_HASH_UNAVAILABLE: &str = "hash checker unavailable";

pub struct IncomingTransfer {
    core: JobCore,
    dest_path: PathBuf,
    /// `None` once the job has finished or been cancelled.
    file: Mutex<Option<File>>,
    chunks: Arc<ChunkList>,
    hasher: Arc<HashChecker>,
    copier: Mutex<Option<LocalCopyManager>>,
    speed: SpeedCalculator,
}

impl IncomingTransfer {
    /// Opens (or creates) `dest_path`, sized to `file_size`, and partitions it into chunks.
    ///
    /// Existing content is kept, but every chunk starts out missing.
    pub fn new(
        id: impl Into<String>,
        dest_path: impl Into<PathBuf>,
        file_size: u64,
        hashes: Option<Vec<ChunkHash>>,
        config: TransferConfig,
        hasher: Arc<HashChecker>,
    ) -> Result<Arc<Self>, JobError> {
        config.validate()?;
        let id = id.into();
        let dest_path = dest_path.into();
        let chunks = Arc::new(ChunkList::new(file_size, config.chunk_size, hashes)?);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&dest_path)?;
        file.set_len(file_size)?;

        info!(
            job = %id,
            path = %dest_path.display(),
            file_size,
            chunks = chunks.total_chunks(),
            "incoming transfer created"
        );

        Ok(Arc::new(Self {
            core: JobCore::new(id, config),
            dest_path,
            file: Mutex::new(Some(file)),
            chunks,
            hasher,
            copier: Mutex::new(None),
            speed: SpeedCalculator::default(),
        }))
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn dest_path(&self) -> &Path {
        &self.dest_path
    }

    pub fn state(&self) -> JobState {
        self.core.state()
    }

    /// `false` once finished, failed or cancelled.
    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    /// Every chunk is verified and on disk.
    pub fn is_complete(&self) -> bool {
        self.chunks.is_complete()
    }

    pub fn active_connection_count(&self) -> usize {
        self.core.connections()
    }

    /// One status byte per chunk.
    pub fn status_snapshot(&self) -> Vec<u8> {
        self.chunks.status_snapshot()
    }

    pub fn error_code(&self) -> Option<String> {
        self.core.error_code()
    }

    pub fn chunks(&self) -> &Arc<ChunkList> {
        &self.chunks
    }

    pub fn progress(&self) -> TransferProgress {
        let total_bytes = self.chunks.file_size();
        let done_bytes = self.chunks.complete_bytes();
        TransferProgress {
            total_bytes,
            done_bytes,
            total_chunks: self.chunks.total_chunks(),
            done_chunks: self.chunks.complete_count(),
            bytes_per_second: self.speed.bytes_per_second(),
            eta: self.speed.eta(total_bytes - done_bytes),
        }
    }

    pub fn should_reap(&self, now: Instant) -> bool {
        self.core.should_reap(now)
    }

    pub fn is_hot(&self, now: Instant) -> bool {
        self.core.is_hot(now)
    }

    /// Runs `downloader` against this job on `pool`.
    ///
    /// Refused connections are told why before they are closed.
    pub async fn add_connection<S>(
        self: &Arc<Self>,
        mut downloader: Downloader<S>,
        pool: &SessionPool,
    ) -> Result<JoinHandle<()>, JobError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connections = match self.core.admit() {
            Ok(n) => n,
            Err(e) => {
                warn!(job = %self.id(), error = %e, "connection refused");
                downloader.reject(e.peer_code()).await;
                return Err(e);
            }
        };
        let slot = match pool.try_acquire() {
            Ok(slot) => slot,
            Err(e) => {
                self.core.release();
                warn!(job = %self.id(), error = %e, "connection refused");
                downloader.reject(e.peer_code()).await;
                return Err(e);
            }
        };
        downloader.set_cancel_token(self.core.cancel_token().child_token());

        let job = Arc::clone(self);
        let handle = slot.spawn(async move { job.run_connection(downloader).await });
        info!(job = %self.id(), connections, "download connection added");
        Ok(handle)
    }

    async fn run_connection<S>(self: Arc<Self>, mut downloader: Downloader<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut handler = ConnectionHandler {
            job: Arc::clone(&self),
            current: None,
        };
        let result = downloader.download(&mut handler).await;
        if let Some(in_flight) = handler.current.take() {
            self.return_chunk(&in_flight.chunk, "connection ended mid-chunk");
        }

        match result {
            Ok(bytes) => debug!(job = %self.id(), bytes, "download session ended"),
            Err(SessionError::Cancelled) => {
                let code = self
                    .core
                    .error_code()
                    .unwrap_or_else(|| ERROR_CANCELLED.to_string());
                downloader.send_error_code(&code).await;
                downloader.close().await;
            }
            Err(e) => warn!(job = %self.id(), error = %e, "download session failed"),
        }

        let remaining = self.core.release();
        info!(job = %self.id(), remaining, "download connection closed");
        if remaining == 0 {
            self.check_finished();
        }
    }

    /// Looks up local copies of this file's chunks and starts copying them.
    ///
    /// Returns the number of chunks queued for local copy.
    pub fn add_copy_sources(
        self: &Arc<Self>,
        catalog: &dyn ChunkSourceCatalog,
    ) -> Result<usize, JobError> {
        let Some(mut hashes) = self.chunks.expected_hashes() else {
            debug!(job = %self.id(), "no hash list yet, skipping local copy lookup");
            return Ok(0);
        };
        hashes.sort_unstable();
        hashes.dedup();

        let sources = catalog.get_clone_sources(&hashes);
        let queued = self.chunks.add_copy_sources(&sources);
        info!(
            job = %self.id(),
            candidates = sources.len(),
            queued,
            "local copy sources attached"
        );
        if queued > 0 && self.is_active() {
            self.start_copier()?;
        }
        Ok(queued)
    }

    fn start_copier(self: &Arc<Self>) -> Result<(), JobError> {
        let mut copier = self.copier.lock().unwrap_or_else(PoisonError::into_inner);
        let running = copier.as_ref().is_some_and(LocalCopyManager::is_running);
        if !running {
            let manager = LocalCopyManager::start(
                self.id(),
                Arc::clone(&self.chunks),
                Arc::clone(&self.hasher),
                Arc::new(CopyFeed {
                    job: Arc::clone(self),
                }),
                self.core.cancel_token().child_token(),
            )?;
            *copier = Some(manager);
        }
        if let Some(manager) = copier.as_ref() {
            manager.trigger();
        }
        Ok(())
    }

    fn trigger_copier(&self) {
        if let Some(manager) = self
            .copier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            manager.trigger();
        }
    }

    /// Installs a hash list that arrived after the transfer started.
    ///
    /// Returns how many already written chunks were found bad and requeued.
    pub fn set_expected_hashes(&self, hashes: Vec<ChunkHash>) -> Result<usize, JobError> {
        let invalidated = self.chunks.set_expected_hashes(hashes)?;
        info!(job = %self.id(), invalidated, "hash list installed");
        Ok(invalidated)
    }

    /// Cancels the job. Idempotent.
    pub fn cancel(&self) {
        self.cancel_with_error(ERROR_CANCELLED);
    }

    /// Moves the job to `Error`, tells connected peers `code` and closes the file.
    ///
    /// Only the first call on a non-terminal job has any effect.
    pub fn cancel_with_error(&self, code: &str) {
        if self.core.fail(code) {
            self.release_resources();
        }
    }

    /// Stops everything without touching the job state. Used when reaping.
    pub(crate) fn shutdown(&self) {
        self.core.cancel_token().cancel();
        self.release_resources();
    }

    fn release_resources(&self) {
        self.trigger_copier();
        self.lock_file().take();
    }

    fn lock_file(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_chunk(&self, range: FileRange, data: &[u8]) -> io::Result<()> {
        let mut guard = self.lock_file();
        let file = guard
            .as_mut()
            .ok_or_else(|| io::Error::other("destination file is closed"))?;
        file.seek(SeekFrom::Start(range.start()))?;
        file.write_all(data)
    }

    /// Allocates the receive buffer for `chunk` after checking disk space.
    fn prepare_buffer(&self, chunk: &ChunkRef) -> Result<Vec<u8>, &'static str> {
        let len = chunk.length();
        let dir = match self.dest_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        match fs2::available_space(dir) {
            Ok(free) => {
                let needed = len.saturating_add(self.core.config().min_free_space);
                if free < needed {
                    error!(job = %self.id(), free, needed, "destination volume is full");
                    return Err(ERROR_OUT_OF_DISK_SPACE);
                }
            }
            Err(e) => warn!(job = %self.id(), error = %e, "cannot query free space"),
        }

        let len = usize::try_from(len).map_err(|_| ERROR_OUT_OF_MEMORY)?;
        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(len).is_err() {
            error!(job = %self.id(), chunk = chunk.index, len, "cannot allocate chunk buffer");
            return Err(ERROR_OUT_OF_MEMORY);
        }
        Ok(buffer)
    }

    fn return_chunk(&self, chunk: &ChunkRef, reason: &str) {
        let fail_count = self.chunks.mark_failed(chunk.index, false);
        warn!(
            job = %self.id(),
            chunk = chunk.index,
            range = %chunk.range,
            fail_count = ?fail_count,
            reason,
            "chunk returned to missing"
        );
    }

    /// Routes a fully received chunk to verification or straight to disk.
    async fn complete_chunk(self: &Arc<Self>, chunk: ChunkRef, buffer: Vec<u8>) {
        if buffer.len() as u64 != chunk.length() {
            self.return_chunk(&chunk, "chunk incomplete");
            return;
        }
        let index = chunk.index;

        if chunk.expected_hash.is_some() {
            if !self.chunks.mark_hashing(index) {
                return;
            }
            let job = Arc::clone(self);
            let hasher = Arc::clone(&self.hasher);
            // Blocks while the shared queue is full, holding this connection back.
            let queued = tokio::task::spawn_blocking(move || {
                hasher.queue(
                    chunk,
                    buffer,
                    HashFlags::CHECK | HashFlags::CALC_CRC32 | HashFlags::BLOCKING,
                    Box::new(move |result| job.hash_done(result, false)),
                )
            })
            .await
            .unwrap_or(false);
            if !queued {
                self.hash_unavailable(index, false);
            }
            return;
        }

        let range = chunk.range;
        let job = Arc::clone(self);
        let target = chunk.clone();
        let written = tokio::task::spawn_blocking(move || {
            job.write_chunk(range, &buffer)?;
            // Waits for queue space: a late hash list needs a digest of every written chunk.
            let digests = Arc::clone(&job);
            Ok::<_, io::Error>(job.hasher.queue(
                target,
                buffer,
                HashFlags::CALC_SHA1 | HashFlags::CALC_CRC32 | HashFlags::BLOCKING,
                Box::new(move |result| digests.digests_computed(result)),
            ))
        })
        .await;
        match written {
            Ok(Ok(digest_queued)) => {
                self.chunks.mark_successful(index);
                debug!(
                    job = %self.id(),
                    chunk = index,
                    digest_queued,
                    "chunk written without verification"
                );
                self.check_finished();
            }
            Ok(Err(e)) => self.write_failed(index, &e),
            Err(e) => self.return_chunk(&chunk, &format!("write task failed: {e}")),
        }
    }

    /// Hash task callback; runs on a hash worker thread.
    fn hash_done(&self, task: HashTaskResult, from_copy: bool) {
        let HashTaskResult {
            chunk,
            buffer,
            result,
            sha1,
            crc32,
        } = task;
        let source = if from_copy { "local" } else { "network" };

        match result {
            HashResult::Valid => match self.write_chunk(chunk.range, &buffer) {
                Ok(()) => {
                    self.chunks
                        .set_computed_hash(chunk.index, sha1.or(chunk.expected_hash), crc32);
                    self.chunks.mark_successful(chunk.index);
                    if !from_copy {
                        self.core.touch();
                    }
                    self.check_finished();
                }
                Err(e) => self.write_failed(chunk.index, &e),
            },
            HashResult::Invalid => {
                let fail_count = self.chunks.mark_failed(chunk.index, from_copy);
                warn!(
                    job = %self.id(),
                    chunk = chunk.index,
                    range = %chunk.range,
                    fail_count = ?fail_count,
                    source,
                    "chunk failed hash verification"
                );
            }
            HashResult::None | HashResult::Failure => self.hash_unavailable(chunk.index, from_copy),
        }
    }

    fn digests_computed(&self, task: HashTaskResult) {
        if task.result == HashResult::None {
            self.chunks
                .set_computed_hash(task.chunk.index, task.sha1, task.crc32);
        }
    }

    fn hash_unavailable(&self, index: usize, from_copy: bool) {
        let fail_count = self.chunks.mark_failed(index, from_copy);
        warn!(job = %self.id(), chunk = index, fail_count = ?fail_count, "chunk could not be hashed");
        if !self.hasher.is_valid() {
            self.cancel_with_error(ERROR_HASH_UNAVAILABLE);
        }
    }

    fn write_failed(&self, index: usize, e: &io::Error) {
        self.chunks.mark_failed(index, false);
        if !self.is_active() {
            return;
        }
        error!(job = %self.id(), chunk = index, error = %e, "cannot write destination");
        let code = if e.kind() == io::ErrorKind::StorageFull {
            ERROR_OUT_OF_DISK_SPACE
        } else {
            ERROR_WRITE_FAILED
        };
        self.cancel_with_error(code);
    }

    /// Finishes the job once every chunk is on disk and no connection is left.
    fn check_finished(&self) {
        if self.core.connections() > 0 || !self.chunks.is_complete() || !self.is_active() {
            return;
        }
        let file = self.lock_file().take();
        if let Some(Err(e)) = file.map(|f| f.sync_all()) {
            warn!(job = %self.id(), error = %e, "cannot sync destination");
        }
        if self.core.finish() {
            info!(
                job = %self.id(),
                bytes = self.chunks.file_size(),
                path = %self.dest_path.display(),
                "incoming transfer complete"
            );
        }
    }
}

/// A chunk checked out to a connection, with the bytes received so far.
struct InFlight {
    chunk: ChunkRef,
    buffer: Vec<u8>,
}

/// Per-connection glue between a [`Downloader`] and its job.
struct ConnectionHandler {
    job: Arc<IncomingTransfer>,
    current: Option<InFlight>,
}

impl DownloadHandler for ConnectionHandler {
    async fn want_range(&mut self) -> NextRange {
        if let Some(done) = self.current.take() {
            self.job.complete_chunk(done.chunk, done.buffer).await;
        }
        if !self.job.is_active() {
            return NextRange::Stop;
        }

        let wait = self.job.core.config().missing_wait();
        let cancel = self.job.core.cancel_token().clone();
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            chunk = self.job.chunks.get_missing_wait(wait) => chunk,
        };
        let Some(chunk) = chunk else {
            return NextRange::Stop;
        };

        match self.job.prepare_buffer(&chunk) {
            Ok(buffer) => {
                let range = chunk.range;
                debug!(job = %self.job.id(), chunk = chunk.index, range = %range, "requesting chunk");
                self.current = Some(InFlight { chunk, buffer });
                NextRange::Range(range)
            }
            Err(code) => {
                self.job.return_chunk(&chunk, code);
                self.job.cancel_with_error(code);
                NextRange::Stop
            }
        }
    }

    fn data_received(&mut self, offset: u64, data: &[u8]) -> bool {
        let Some(current) = self.current.as_mut() else {
            warn!(job = %self.job.id(), offset, "data received with no chunk requested");
            return false;
        };
        let range = current.chunk.range;
        let expected = range.start() + current.buffer.len() as u64;
        if offset != expected || offset + data.len() as u64 > range.end() {
            warn!(
                job = %self.job.id(),
                chunk = current.chunk.index,
                range = %range,
                offset,
                len = data.len(),
                "data outside the requested chunk"
            );
            return false;
        }
        current.buffer.extend_from_slice(data);
        self.job.speed.add_sample(data.len() as u64);
        self.job.core.touch();
        true
    }
}

/// Feeds locally copied chunks into the job's verification path.
struct CopyFeed {
    job: Arc<IncomingTransfer>,
}

impl CopySink for CopyFeed {
    fn copied(&self, chunk: ChunkRef, buffer: Vec<u8>) {
        let index = chunk.index;
        if !self.job.chunks.mark_hashing(index) {
            return;
        }
        let job = Arc::clone(&self.job);
        let queued = self.job.hasher.queue(
            chunk,
            buffer,
            HashFlags::CHECK | HashFlags::CALC_CRC32 | HashFlags::BLOCKING,
            Box::new(move |result| job.hash_done(result, true)),
        );
        if !queued {
            self.job.hash_unavailable(index, true);
        }
    }

    fn is_active(&self) -> bool {
        self.job.is_active()
    }
}
