//! Local deduplication: fill chunks from identical bytes already on disk.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk_list::ChunkList;
use crate::hash_checker::HashChecker;
use crate::types::ChunkRef;

/// Upper bound of the backpressure sleep, reached when the hash queue is full.
const MAX_BACKOFF: Duration = Duration::from_millis(1000);

/// How long the worker sleeps between completion checks when idle.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Receives chunks read from local files.
pub trait CopySink: Send + Sync {
    /// Feeds a locally read chunk into the normal completion path.
    fn copied(&self, chunk: ChunkRef, buffer: Vec<u8>);

    /// `false` once the owning job stopped accepting data.
    fn is_active(&self) -> bool;
}

/// Counting wake-up signal.
#[derive(Default)]
struct CopySignal {
    count: Mutex<usize>,
    cond: Condvar,
}

impl CopySignal {
    fn raise(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        self.cond.notify_one();
    }

    /// Consumes one signal, waiting at most `timeout`.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut count, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |c| *c == 0)
            .unwrap_or_else(PoisonError::into_inner);
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}

/// Dedicated per-job worker copying chunks from local source files.
pub struct LocalCopyManager {
    signal: Arc<CopySignal>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LocalCopyManager {
    /// Spawns the worker thread for `job_id`.
    pub fn start(
        job_id: &str,
        chunks: Arc<ChunkList>,
        hasher: Arc<HashChecker>,
        sink: Arc<dyn CopySink>,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let signal = Arc::new(CopySignal::default());
        let worker = CopyWorker {
            job_id: job_id.to_string(),
            chunks,
            hasher,
            sink,
            cancel: cancel.clone(),
            signal: Arc::clone(&signal),
            handles: HashMap::new(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("local-copy-{job_id}"))
            .spawn(move || worker.run())?;

        Ok(Self {
            signal,
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Wakes the worker because new copy candidates may exist.
    pub fn trigger(&self) {
        self.signal.raise();
    }

    /// `true` while the worker thread has not exited.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stops the worker and waits for it to exit.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.signal.raise();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("local copy worker panicked");
        }
    }
}

struct CopyWorker {
    job_id: String,
    chunks: Arc<ChunkList>,
    hasher: Arc<HashChecker>,
    sink: Arc<dyn CopySink>,
    cancel: CancellationToken,
    signal: Arc<CopySignal>,
    /// Open source files, kept for the worker's lifetime.
    handles: HashMap<PathBuf, File>,
}

impl CopyWorker {
    fn should_exit(&self) -> bool {
        self.cancel.is_cancelled() || !self.sink.is_active() || self.chunks.is_complete()
    }

    fn run(mut self) {
        debug!(job = %self.job_id, "local copy worker started");
        let mut copied = 0u64;

        while !self.should_exit() {
            let Some(chunk) = self.chunks.get_copy_candidate() else {
                self.signal.wait(IDLE_POLL);
                continue;
            };

            self.backoff();
            if self.should_exit() {
                self.chunks.mark_failed(chunk.index, false);
                break;
            }

            match self.read_chunk(&chunk) {
                Some(buffer) => {
                    copied += 1;
                    self.sink.copied(chunk, buffer);
                }
                None => {
                    let fail_count = self.chunks.mark_failed(chunk.index, true);
                    warn!(
                        job = %self.job_id,
                        chunk = chunk.index,
                        range = %chunk.range,
                        fail_count,
                        "no usable local source, falling back to network"
                    );
                }
            }
        }

        info!(
            job = %self.job_id,
            copied,
            open_sources = self.handles.len(),
            "local copy worker finished"
        );
    }

    /// Yields to the hash pipeline while network data is still waiting on it.
    fn backoff(&self) {
        if !self.chunks.has_network_work() {
            return;
        }
        let ratio = self.hasher.fill_ratio().clamp(0.0, 1.0);
        if ratio > 0.0 {
            std::thread::sleep(MAX_BACKOFF.mul_f64(ratio));
        }
    }

    fn read_chunk(&mut self, chunk: &ChunkRef) -> Option<Vec<u8>> {
        let len = usize::try_from(chunk.length()).ok()?;
        for source in &chunk.sources {
            if !self.handles.contains_key(&source.path) {
                match File::open(&source.path) {
                    Ok(f) => {
                        self.handles.insert(source.path.clone(), f);
                    }
                    Err(e) => {
                        debug!(path = %source.path.display(), error = %e, "cannot open copy source");
                        continue;
                    }
                }
            }
            let Some(file) = self.handles.get_mut(&source.path) else {
                continue;
            };

            let mut buffer = vec![0u8; len];
            let read = file
                .seek(SeekFrom::Start(source.offset))
                .and_then(|_| file.read_exact(&mut buffer));
            match read {
                Ok(()) => {
                    debug!(
                        chunk = chunk.index,
                        path = %source.path.display(),
                        offset = source.offset,
                        "chunk read from local source"
                    );
                    return Some(buffer);
                }
                Err(e) => {
                    debug!(path = %source.path.display(), error = %e, "copy source read failed");
                    self.handles.remove(&source.path);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Instant;

    use super::*;
    use crate::hash_checker::{DEFAULT_IDLE_WORKER_TIMEOUT, sha1_digest};
    use crate::types::{ChunkSource, SourceFile};

    struct RecordingSink {
        chunks: Arc<ChunkList>,
        received: Mutex<Vec<(usize, Vec<u8>)>>,
    }

    impl CopySink for RecordingSink {
        fn copied(&self, chunk: ChunkRef, buffer: Vec<u8>) {
            assert_eq!(Some(sha1_digest(&buffer)), chunk.expected_hash);
            self.chunks.mark_successful(chunk.index);
            self.received.lock().unwrap().push((chunk.index, buffer));
        }

        fn is_active(&self) -> bool {
            true
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + Duration::from_secs(5);
        while Instant::now() < end {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn copies_chunk_from_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("base.img");
        let mut f = File::create(&source_path).unwrap();
        f.write_all(b"xxxxABCDyyyy").unwrap();

        let hashes = vec![sha1_digest(b"ABCD")];
        let chunks = Arc::new(ChunkList::new(4, 4, Some(hashes.clone())).unwrap());
        let queued = chunks.add_copy_sources(&[ChunkSource {
            hash: hashes[0],
            files: vec![SourceFile {
                path: source_path,
                offset: 4,
                length: 4,
            }],
        }]);
        assert_eq!(queued, 1);

        let sink = Arc::new(RecordingSink {
            chunks: Arc::clone(&chunks),
            received: Mutex::new(Vec::new()),
        });
        let hasher = HashChecker::start(4, DEFAULT_IDLE_WORKER_TIMEOUT);
        let manager = LocalCopyManager::start(
            "job-1",
            Arc::clone(&chunks),
            hasher,
            sink.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        manager.trigger();

        assert!(wait_until(|| chunks.is_complete()));
        assert_eq!(*sink.received.lock().unwrap(), vec![(0, b"ABCD".to_vec())]);
        assert!(wait_until(|| !manager.is_running()));
        manager.stop();
    }

    #[test]
    fn unusable_source_falls_back_to_network() {
        let dir = tempfile::tempdir().unwrap();
        let hashes = vec![[5u8; 20], [6u8; 20]];
        let chunks = Arc::new(ChunkList::new(8, 4, Some(hashes)).unwrap());
        chunks.add_copy_sources(&[ChunkSource {
            hash: [6u8; 20],
            files: vec![SourceFile {
                path: dir.path().join("vanished.img"),
                offset: 0,
                length: 4,
            }],
        }]);

        let sink = Arc::new(RecordingSink {
            chunks: Arc::clone(&chunks),
            received: Mutex::new(Vec::new()),
        });
        let manager = LocalCopyManager::start(
            "job-2",
            Arc::clone(&chunks),
            HashChecker::start(4, DEFAULT_IDLE_WORKER_TIMEOUT),
            sink.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        manager.trigger();

        assert!(wait_until(|| chunks.missing_indices().first() == Some(&1)
            && chunks.chunk(1).unwrap().fail_count() == 1));
        let retry = chunks.chunk(1).unwrap();
        assert_eq!(retry.status(), crate::ChunkStatus::Missing);
        assert!(sink.received.lock().unwrap().is_empty());

        manager.stop();
        assert!(!manager.is_running());
    }

    #[test]
    fn signal_counts_triggers() {
        let signal = CopySignal::default();
        signal.raise();
        signal.raise();
        assert!(signal.wait(Duration::from_millis(1)));
        assert!(signal.wait(Duration::from_millis(1)));
        assert!(!signal.wait(Duration::from_millis(1)));
    }
}
