//! Asynchronous chunk digest pipeline.
//!
//! CPU-bound SHA-1 and CRC32 work runs on dedicated OS threads fed by a
//! bounded queue. One persistent worker always exists; extra workers are
//! spawned while the queue is nearly full and exit again after an idle
//! period. The checker is meant to be shared by every job in the process.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use bitflags::bitflags;
use sha1::{Digest, Sha1};
use tracing::{debug, error, warn};

use crate::types::{ChunkHash, ChunkRef, HASH_LEN};

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 6;

/// Extra workers exit after this long without work.
pub const DEFAULT_IDLE_WORKER_TIMEOUT: Duration = Duration::from_secs(30);

bitflags! {
    /// What a hash task should do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HashFlags: u8 {
        /// Verify against the chunk's expected hash.
        const CHECK = 0b0001;
        /// Compute and report a fresh SHA-1.
        const CALC_SHA1 = 0b0010;
        /// Compute and report a CRC32.
        const CALC_CRC32 = 0b0100;
        /// Wait for queue space instead of rejecting.
        const BLOCKING = 0b1000;
    }
}

/// Outcome of a hash task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashResult {
    /// No verification was requested.
    None,
    Valid,
    Invalid,
    /// The task could not be processed.
    Failure,
}

/// Everything handed back to the task's callback.
#[derive(Debug)]
pub struct HashTaskResult {
    pub chunk: ChunkRef,
    pub buffer: Vec<u8>,
    pub result: HashResult,
    pub sha1: Option<ChunkHash>,
    pub crc32: Option<u32>,
}

/// Invoked exactly once per accepted task, on a worker thread.
pub type HashCallback = Box<dyn FnOnce(HashTaskResult) + Send>;

struct HashTask {
    chunk: ChunkRef,
    buffer: Vec<u8>,
    flags: HashFlags,
    callback: HashCallback,
}

impl HashTask {
    fn fail(self) {
        (self.callback)(HashTaskResult {
            chunk: self.chunk,
            buffer: self.buffer,
            result: HashResult::Failure,
            sha1: None,
            crc32: None,
        });
    }
}

struct QueueState {
    queue: VecDeque<HashTask>,
    workers: usize,
    valid: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    space_ready: Condvar,
    capacity: usize,
    max_workers: usize,
    idle_timeout: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared digest service with a bounded queue and an elastic worker pool.
pub struct HashChecker {
    shared: Arc<Shared>,
    persistent: Mutex<Option<JoinHandle<()>>>,
}

impl HashChecker {
    /// Starts a checker sized to the available CPU cores.
    pub fn start(capacity: usize, idle_timeout: Duration) -> Arc<Self> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_workers(capacity, cores, idle_timeout)
    }

    /// Starts a checker allowing at most `max_workers` threads.
    pub fn with_workers(capacity: usize, max_workers: usize, idle_timeout: Duration) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: VecDeque::with_capacity(capacity),
                workers: 1,
                valid: true,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            space_ready: Condvar::new(),
            capacity: capacity.max(1),
            max_workers: max_workers.max(1),
            idle_timeout,
        });

        let handle = spawn_worker(Arc::clone(&shared), 0, true);
        if handle.is_none() {
            let mut st = shared.lock();
            st.valid = false;
            st.workers = 0;
        }

        Arc::new(Self {
            shared,
            persistent: Mutex::new(handle),
        })
    }

    /// Enqueues a task.
    ///
    /// Returns `false` if the checker is no longer valid, or if the queue is
    /// full and [`HashFlags::BLOCKING`] is not set. The callback is only
    /// invoked for accepted tasks.
    pub fn queue(
        &self,
        chunk: ChunkRef,
        buffer: Vec<u8>,
        flags: HashFlags,
        callback: HashCallback,
    ) -> bool {
        let shared = &self.shared;
        let mut st = shared.lock();
        loop {
            if !st.valid {
                return false;
            }
            if st.queue.len() < shared.capacity {
                break;
            }
            if !flags.contains(HashFlags::BLOCKING) {
                debug!(chunk = chunk.index, "hash queue full, rejecting task");
                return false;
            }
            st = shared
                .space_ready
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }

        st.queue.push_back(HashTask {
            chunk,
            buffer,
            flags,
            callback,
        });

        let nearly_full = st.queue.len() * 4 >= shared.capacity * 3;
        if nearly_full && st.workers < shared.max_workers {
            let id = st.workers;
            st.workers += 1;
            drop(st);
            if spawn_worker(Arc::clone(shared), id, false).is_none() {
                shared.lock().workers -= 1;
            }
        } else {
            drop(st);
        }
        shared.work_ready.notify_one();
        true
    }

    /// Number of tasks waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Queue fill level in `[0, 1]`.
    pub fn fill_ratio(&self) -> f64 {
        self.queue_len() as f64 / self.shared.capacity as f64
    }

    /// Live worker threads.
    pub fn worker_count(&self) -> usize {
        self.shared.lock().workers
    }

    /// `false` once the persistent worker died or the checker was shut down.
    pub fn is_valid(&self) -> bool {
        self.shared.lock().valid
    }

    /// Stops all workers. Queued tasks are failed with [`HashResult::Failure`].
    pub fn shutdown(&self) {
        let drained: Vec<HashTask> = {
            let mut st = self.shared.lock();
            if st.shutdown {
                return;
            }
            st.shutdown = true;
            st.valid = false;
            st.queue.drain(..).collect()
        };
        self.shared.work_ready.notify_all();
        self.shared.space_ready.notify_all();
        for task in drained {
            task.fail();
        }

        let handle = self
            .persistent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // The last handle can be dropped from a callback on the persistent
        // worker itself, which then exits on its own.
        if let Some(handle) = handle
            && handle.thread().id() != std::thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for HashChecker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(shared: Arc<Shared>, id: usize, persistent: bool) -> Option<JoinHandle<()>> {
    let result = std::thread::Builder::new()
        .name(format!("hash-checker-{id}"))
        .spawn(move || worker_loop(shared, persistent));
    match result {
        Ok(handle) => {
            debug!(worker = id, persistent, "hash worker started");
            Some(handle)
        }
        Err(e) => {
            warn!(worker = id, error = %e, "failed to spawn hash worker");
            None
        }
    }
}

/// Accounts for a worker leaving, including by panic.
struct WorkerGuard {
    shared: Arc<Shared>,
    persistent: bool,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let drained: Vec<HashTask> = {
            let mut st = self.shared.lock();
            st.workers = st.workers.saturating_sub(1);
            if !(self.persistent && std::thread::panicking()) || st.shutdown {
                return;
            }
            st.valid = false;
            st.queue.drain(..).collect()
        };
        error!(
            failed_tasks = drained.len(),
            "persistent hash worker died, hash checker is now invalid"
        );
        self.shared.space_ready.notify_all();
        for task in drained {
            task.fail();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, persistent: bool) {
    let _guard = WorkerGuard {
        shared: Arc::clone(&shared),
        persistent,
    };

    loop {
        let task = {
            let mut st = shared.lock();
            loop {
                if let Some(task) = st.queue.pop_front() {
                    shared.space_ready.notify_one();
                    break task;
                }
                if st.shutdown {
                    return;
                }
                if persistent {
                    st = shared
                        .work_ready
                        .wait(st)
                        .unwrap_or_else(PoisonError::into_inner);
                } else {
                    let (guard, timeout) = shared
                        .work_ready
                        .wait_timeout(st, shared.idle_timeout)
                        .unwrap_or_else(PoisonError::into_inner);
                    st = guard;
                    if timeout.timed_out() && st.queue.is_empty() {
                        debug!("idle hash worker exiting");
                        return;
                    }
                }
            }
        };
        process(task);
    }
}

fn process(task: HashTask) {
    let HashTask {
        chunk,
        buffer,
        flags,
        callback,
    } = task;

    let mut result = HashResult::None;
    let mut sha1 = None;
    let mut crc32 = None;

    if buffer.len() as u64 != chunk.length() {
        warn!(
            chunk = chunk.index,
            expected = chunk.length(),
            actual = buffer.len(),
            "hash task buffer does not match chunk length"
        );
        result = HashResult::Failure;
    } else {
        if flags.intersects(HashFlags::CHECK | HashFlags::CALC_SHA1) {
            sha1 = Some(sha1_digest(&buffer));
        }
        if flags.contains(HashFlags::CALC_CRC32) {
            crc32 = Some(crc32fast::hash(&buffer));
        }
        if flags.contains(HashFlags::CHECK) {
            result = match chunk.expected_hash {
                Some(expected) if sha1 == Some(expected) => HashResult::Valid,
                Some(expected) => {
                    debug!(
                        chunk = chunk.index,
                        expected = %hex::encode(expected),
                        actual = %sha1.map(hex::encode).unwrap_or_default(),
                        "chunk hash mismatch"
                    );
                    HashResult::Invalid
                }
                None => {
                    warn!(chunk = chunk.index, "hash check requested without expected hash");
                    HashResult::Failure
                }
            };
        }
    }

    callback(HashTaskResult {
        chunk,
        buffer,
        result,
        sha1,
        crc32,
    });
}

/// SHA-1 of `data`.
pub fn sha1_digest(data: &[u8]) -> ChunkHash {
    let digest = Sha1::digest(data);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use super::*;
    use crate::types::FileRange;

    fn chunk_for(data: &[u8], expected: Option<ChunkHash>) -> ChunkRef {
        ChunkRef {
            index: 3,
            range: FileRange::new(0, data.len() as u64).unwrap(),
            expected_hash: expected,
            fail_count: 0,
            sources: Vec::new(),
        }
    }

    fn reporter(tx: mpsc::Sender<HashTaskResult>) -> HashCallback {
        Box::new(move |r| {
            let _ = tx.send(r);
        })
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn matching_hash_is_valid() {
        let checker = HashChecker::start(4, DEFAULT_IDLE_WORKER_TIMEOUT);
        let data = b"disk image block".to_vec();
        let chunk = chunk_for(&data, Some(sha1_digest(&data)));
        let (tx, rx) = mpsc::channel();

        assert!(checker.queue(chunk, data, HashFlags::CHECK | HashFlags::BLOCKING, reporter(tx)));
        let r = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(r.result, HashResult::Valid);
        assert_eq!(r.buffer, b"disk image block");
        assert!(r.sha1.is_some());
        assert!(r.crc32.is_none());
    }

    #[test]
    fn mismatching_hash_is_invalid() {
        let checker = HashChecker::start(4, DEFAULT_IDLE_WORKER_TIMEOUT);
        let data = b"corrupted payload".to_vec();
        let chunk = chunk_for(&data, Some([0xAB; HASH_LEN]));
        let (tx, rx) = mpsc::channel();

        assert!(checker.queue(chunk, data, HashFlags::CHECK, reporter(tx)));
        let r = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(r.result, HashResult::Invalid);
        assert_eq!(r.chunk.index, 3);
    }

    #[test]
    fn calc_flags_report_digests() {
        let checker = HashChecker::start(4, DEFAULT_IDLE_WORKER_TIMEOUT);
        let data = vec![7u8; 1000];
        let (tx, rx) = mpsc::channel();

        let flags = HashFlags::CALC_SHA1 | HashFlags::CALC_CRC32;
        assert!(checker.queue(chunk_for(&data, None), data.clone(), flags, reporter(tx)));
        let r = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(r.result, HashResult::None);
        assert_eq!(r.sha1, Some(sha1_digest(&data)));
        assert_eq!(r.crc32, Some(crc32fast::hash(&data)));
    }

    #[test]
    fn check_without_expected_hash_fails() {
        let checker = HashChecker::start(4, DEFAULT_IDLE_WORKER_TIMEOUT);
        let data = vec![1u8; 8];
        let (tx, rx) = mpsc::channel();
        assert!(checker.queue(chunk_for(&data, None), data, HashFlags::CHECK, reporter(tx)));
        let r = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(r.result, HashResult::Failure);
    }

    #[test]
    fn non_blocking_queue_rejects_when_full() {
        let checker = HashChecker::with_workers(2, 1, DEFAULT_IDLE_WORKER_TIMEOUT);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let data = vec![0u8; 4];

        // Occupy the only worker.
        assert!(checker.queue(
            chunk_for(&data, None),
            data.clone(),
            HashFlags::empty(),
            Box::new(move |_| {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
            }),
        ));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let noop = || -> HashCallback { Box::new(|_| {}) };
        assert!(checker.queue(chunk_for(&data, None), data.clone(), HashFlags::empty(), noop()));
        assert!(checker.queue(chunk_for(&data, None), data.clone(), HashFlags::empty(), noop()));
        assert!(!checker.queue(chunk_for(&data, None), data.clone(), HashFlags::empty(), noop()));
        assert_eq!(checker.fill_ratio(), 1.0);

        release_tx.send(()).unwrap();
        assert!(wait_until(Duration::from_secs(5), || checker.queue_len() == 0));
    }

    #[test]
    fn extra_workers_spawn_and_retire() {
        let checker = HashChecker::with_workers(4, 3, Duration::from_millis(100));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let data = vec![0u8; 4];

        for _ in 0..4 {
            let rx = Arc::clone(&release_rx);
            assert!(checker.queue(
                chunk_for(&data, None),
                data.clone(),
                HashFlags::BLOCKING,
                Box::new(move |_| {
                    let _ = rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
                }),
            ));
        }
        assert!(checker.worker_count() > 1);
        assert!(checker.worker_count() <= 3);

        for _ in 0..4 {
            let _ = release_tx.send(());
        }
        assert!(wait_until(Duration::from_secs(5), || checker.worker_count() == 1));
        assert!(checker.is_valid());
    }

    #[test]
    fn persistent_worker_death_fails_queued_tasks() {
        let checker = HashChecker::with_workers(4, 1, DEFAULT_IDLE_WORKER_TIMEOUT);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let data = vec![0u8; 4];

        assert!(checker.queue(
            chunk_for(&data, None),
            data.clone(),
            HashFlags::empty(),
            Box::new(move |_| {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
                panic!("worker crash");
            }),
        ));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (tx, rx) = mpsc::channel();
        assert!(checker.queue(chunk_for(&data, None), data.clone(), HashFlags::CHECK, reporter(tx)));

        release_tx.send(()).unwrap();
        let r = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(r.result, HashResult::Failure);
        assert!(!checker.is_valid());
        assert!(!checker.queue(
            chunk_for(&data, None),
            data,
            HashFlags::BLOCKING,
            Box::new(|_| {})
        ));
    }

    #[test]
    fn shutdown_fails_pending_and_rejects_new() {
        let checker = HashChecker::with_workers(4, 1, DEFAULT_IDLE_WORKER_TIMEOUT);
        checker.shutdown();
        assert!(!checker.is_valid());
        let data = vec![0u8; 4];
        assert!(!checker.queue(chunk_for(&data, None), data, HashFlags::empty(), Box::new(|_| {})));
        checker.shutdown();
    }

    #[test]
    fn last_handle_dropped_inside_callback() {
        let checker = HashChecker::with_workers(2, 1, DEFAULT_IDLE_WORKER_TIMEOUT);
        let held = Arc::clone(&checker);
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let (tx, rx) = mpsc::channel();
        let data = vec![1u8; 8];

        assert!(checker.queue(
            chunk_for(&data, None),
            data,
            HashFlags::empty(),
            Box::new(move |_| {
                let _ = go_rx.recv();
                drop(held);
                let _ = tx.send(std::thread::current().id());
            }),
        ));
        drop(checker);
        go_tx.send(()).unwrap();

        let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(worker, std::thread::current().id());
    }
}
