//! Sending job: serves one source file to the sessions a peer opens
//! (or that this node opens towards the peer).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use imgsync_data_channel::{ERROR_CANCELLED, SessionError, UploadHandler, Uploader};
use imgsync_transfer::{FileRange, SpeedCalculator};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::JobError;
use crate::pool::SessionPool;
use crate::state::{JobCore, JobState, TransferProgress};

pub struct OutgoingTransfer {
    core: JobCore,
    source_path: PathBuf,
    file_size: u64,
    sent_bytes: AtomicU64,
    connect_failures: AtomicU32,
    /// A session ended because the peer had nothing left to ask for.
    peer_done: AtomicBool,
    speed: SpeedCalculator,
}

impl OutgoingTransfer {
    pub fn new(
        id: impl Into<String>,
        source_path: impl Into<PathBuf>,
        config: TransferConfig,
    ) -> Result<Arc<Self>, JobError> {
        config.validate()?;
        let id = id.into();
        let source_path = source_path.into();
        let file_size = std::fs::metadata(&source_path)?.len();
        info!(
            job = %id,
            path = %source_path.display(),
            file_size,
            "outgoing transfer created"
        );

        Ok(Arc::new(Self {
            core: JobCore::new(id, config),
            source_path,
            file_size,
            sent_bytes: AtomicU64::new(0),
            connect_failures: AtomicU32::new(0),
            peer_done: AtomicBool::new(false),
            speed: SpeedCalculator::default(),
        }))
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn state(&self) -> JobState {
        self.core.state()
    }

    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    /// The peer reported it has everything.
    pub fn is_complete(&self) -> bool {
        self.core.state() == JobState::Finished
    }

    pub fn active_connection_count(&self) -> usize {
        self.core.connections()
    }

    pub fn error_code(&self) -> Option<String> {
        self.core.error_code()
    }

    pub fn connect_fail_count(&self) -> u32 {
        self.connect_failures.load(Ordering::Relaxed)
    }

    /// Bytes sent so far, counting resent ranges again.
    pub fn progress(&self) -> TransferProgress {
        let sent = self.sent_bytes.load(Ordering::Relaxed);
        let done_bytes = if self.is_complete() {
            self.file_size
        } else {
            sent.min(self.file_size)
        };
        let chunk_size = self.core.config().chunk_size;
        TransferProgress {
            total_bytes: self.file_size,
            done_bytes,
            total_chunks: self.file_size.div_ceil(chunk_size) as usize,
            done_chunks: done_bytes.div_ceil(chunk_size) as usize,
            bytes_per_second: self.speed.bytes_per_second(),
            eta: self.speed.eta(self.file_size - done_bytes),
        }
    }

    pub fn should_reap(&self, now: Instant) -> bool {
        self.core.should_reap(now)
    }

    pub fn is_hot(&self, now: Instant) -> bool {
        self.core.is_hot(now)
    }

    /// Records a failed outbound connection attempt. Returns the running count.
    pub fn record_connect_failure(&self) -> u32 {
        let count = self.connect_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.core.touch();
        warn!(job = %self.id(), failures = count, "outbound connection failed");
        count
    }

    /// Runs `uploader` against this job on `pool`.
    pub async fn add_connection<S>(
        self: &Arc<Self>,
        mut uploader: Uploader<S>,
        pool: &SessionPool,
    ) -> Result<JoinHandle<()>, JobError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connections = match self.core.admit() {
            Ok(n) => n,
            Err(e) => {
                warn!(job = %self.id(), error = %e, "connection refused");
                uploader.reject(e.peer_code()).await;
                return Err(e);
            }
        };
        let slot = match pool.try_acquire() {
            Ok(slot) => slot,
            Err(e) => {
                self.core.release();
                warn!(job = %self.id(), error = %e, "connection refused");
                uploader.reject(e.peer_code()).await;
                return Err(e);
            }
        };
        uploader.set_cancel_token(self.core.cancel_token().child_token());

        let job = Arc::clone(self);
        let handle = slot.spawn(async move { job.run_connection(uploader).await });
        info!(job = %self.id(), connections, "upload connection added");
        Ok(handle)
    }

    async fn run_connection<S>(self: Arc<Self>, mut uploader: Uploader<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut handler = ServeHandler {
            job: Arc::clone(&self),
        };
        match uploader.upload(&self.source_path, &mut handler).await {
            Ok(bytes) => {
                debug!(job = %self.id(), bytes, "upload session ended");
                self.peer_done.store(true, Ordering::Release);
            }
            Err(SessionError::Cancelled) => {
                let code = self
                    .core
                    .error_code()
                    .unwrap_or_else(|| ERROR_CANCELLED.to_string());
                uploader.send_error_code(&code).await;
                uploader.close().await;
            }
            Err(e) => warn!(job = %self.id(), error = %e, "upload session failed"),
        }

        let remaining = self.core.release();
        info!(job = %self.id(), remaining, "upload connection closed");
        if remaining == 0 && self.peer_done.load(Ordering::Acquire) {
            self.core.finish();
        }
    }

    pub fn cancel(&self) {
        self.cancel_with_error(ERROR_CANCELLED);
    }

    /// Moves the job to `Error` and tells connected peers `code`. Idempotent.
    pub fn cancel_with_error(&self, code: &str) {
        self.core.fail(code);
    }

    pub(crate) fn shutdown(&self) {
        self.core.cancel_token().cancel();
    }
}

struct ServeHandler {
    job: Arc<OutgoingTransfer>,
}

impl UploadHandler for ServeHandler {
    fn range_requested(&mut self, range: FileRange) -> bool {
        let active = self.job.is_active();
        if !active {
            debug!(job = %self.job.id(), range = %range, "refusing range, job inactive");
        }
        active
    }

    fn range_sent(&mut self, range: FileRange) {
        self.job.sent_bytes.fetch_add(range.length(), Ordering::Relaxed);
        self.job.speed.add_sample(range.length());
        self.job.core.touch();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use imgsync_data_channel::wire::{self, ControlMessage};
    use imgsync_data_channel::{
        Accepted, DownloadHandler, Downloader, NextRange, SessionOptions, accept,
    };
    use tokio::io::{AsyncWriteExt, duplex};

    use super::*;

    /// Fetches every chunk of a file in order, keeping the bytes.
    struct Fetch {
        ranges: Vec<FileRange>,
        image: Vec<u8>,
    }

    impl Fetch {
        fn new(len: u64, chunk: u64) -> Self {
            let mut ranges = imgsync_transfer::chunk_ranges(len, chunk);
            ranges.reverse();
            Self {
                ranges,
                image: vec![0; len as usize],
            }
        }
    }

    impl DownloadHandler for Fetch {
        async fn want_range(&mut self) -> NextRange {
            self.ranges.pop().map_or(NextRange::Stop, NextRange::Range)
        }

        fn data_received(&mut self, offset: u64, data: &[u8]) -> bool {
            let start = offset as usize;
            self.image[start..start + data.len()].copy_from_slice(data);
            true
        }
    }

    fn config() -> TransferConfig {
        TransferConfig {
            chunk_size: 1024,
            ..TransferConfig::default()
        }
    }

    async fn accept_uploader(
        b: tokio::io::DuplexStream,
    ) -> Uploader<tokio::io::DuplexStream> {
        match accept(b, SessionOptions::default()).await.unwrap() {
            Accepted::PeerDownloads(u) => u,
            Accepted::PeerUploads(_) => panic!("expected the peer to download"),
        }
    }

    #[tokio::test]
    async fn serves_file_and_finishes_on_clean_end() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 241) as u8).collect();
        let src = dir.path().join("src.img");
        std::fs::write(&src, &data).unwrap();

        let job = OutgoingTransfer::new("out", &src, config()).unwrap();
        assert_eq!(job.file_size(), 5000);
        let pool = SessionPool::new(2);

        let (a, b) = duplex(16 * 1024);
        let peer = tokio::spawn(async move {
            let mut d = Downloader::connect(a, "out", SessionOptions::default()).await?;
            let mut fetch = Fetch::new(5000, 1024);
            d.download(&mut fetch).await?;
            Ok::<_, SessionError>(fetch.image)
        });
        let uploader = accept_uploader(b).await;
        job.add_connection(uploader, &pool).await.unwrap().await.unwrap();

        assert_eq!(peer.await.unwrap().unwrap(), data);
        assert_eq!(job.state(), JobState::Finished);
        assert!(job.is_complete());
        let progress = job.progress();
        assert_eq!(progress.done_bytes, 5000);
        assert_eq!(progress.done_chunks, 5);
    }

    #[tokio::test]
    async fn cancel_reaches_the_peer() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.img");
        std::fs::write(&src, vec![1u8; 4096]).unwrap();
        let job = OutgoingTransfer::new("out", &src, config()).unwrap();
        let pool = SessionPool::new(2);

        let (mut a, b) = duplex(16 * 1024);
        a.write_u8(wire::ROLE_DOWNLOAD).await.unwrap();
        wire::write_control(&mut a, &ControlMessage::Token("out".into()))
            .await
            .unwrap();
        wire::write_end_of_meta(&mut a).await.unwrap();
        let uploader = accept_uploader(b).await;
        let connection = job.add_connection(uploader, &pool).await.unwrap();

        job.cancel();
        job.cancel();
        connection.await.unwrap();
        assert_eq!(job.state(), JobState::Error);
        assert_eq!(job.active_connection_count(), 0);
        assert_eq!(job.error_code().as_deref(), Some(ERROR_CANCELLED));

        let block = wire::read_meta_block(&mut a).await.unwrap().unwrap();
        assert_eq!(block.error.as_deref(), Some(ERROR_CANCELLED));
    }

    #[tokio::test]
    async fn terminal_job_refuses_new_connections() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.img");
        std::fs::write(&src, vec![1u8; 16]).unwrap();
        let job = OutgoingTransfer::new("out", &src, config()).unwrap();
        job.cancel();

        let (mut a, b) = duplex(1024);
        a.write_u8(wire::ROLE_DOWNLOAD).await.unwrap();
        wire::write_control(&mut a, &ControlMessage::Token("out".into()))
            .await
            .unwrap();
        wire::write_end_of_meta(&mut a).await.unwrap();
        let uploader = accept_uploader(b).await;
        let err = job
            .add_connection(uploader, &SessionPool::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Terminal { .. }));

        let block = wire::read_meta_block(&mut a).await.unwrap().unwrap();
        assert_eq!(block.error.as_deref(), Some("transfer closed"));
    }

    #[tokio::test]
    async fn saturated_pool_refuses_with_server_busy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.img");
        std::fs::write(&src, vec![1u8; 16]).unwrap();
        let job = OutgoingTransfer::new("out", &src, config()).unwrap();
        let pool = SessionPool::new(1);
        let (hold_tx, hold_rx) = tokio::sync::oneshot::channel::<()>();
        let busy = pool
            .try_spawn(async move {
                let _ = hold_rx.await;
            })
            .unwrap();

        let (mut a, b) = duplex(1024);
        a.write_u8(wire::ROLE_DOWNLOAD).await.unwrap();
        wire::write_control(&mut a, &ControlMessage::Token("out".into()))
            .await
            .unwrap();
        wire::write_end_of_meta(&mut a).await.unwrap();
        let uploader = accept_uploader(b).await;
        let err = job.add_connection(uploader, &pool).await.unwrap_err();
        assert!(matches!(err, JobError::PoolRejected));

        let block = wire::read_meta_block(&mut a).await.unwrap().unwrap();
        assert_eq!(block.error.as_deref(), Some("server busy"));
        assert_eq!(job.active_connection_count(), 0);
        assert!(job.is_active());

        hold_tx.send(()).unwrap();
        busy.await.unwrap();
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            OutgoingTransfer::new("out", dir.path().join("nope.img"), config()),
            Err(JobError::Io(_))
        ));
    }

    #[test]
    fn connect_failures_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.img");
        std::fs::write(&src, b"x").unwrap();
        let job = OutgoingTransfer::new("out", &src, config()).unwrap();
        assert_eq!(job.record_connect_failure(), 1);
        assert_eq!(job.record_connect_failure(), 2);
        assert_eq!(job.connect_fail_count(), 2);
        assert!(job.is_hot(Instant::now()));
        assert!(!job.should_reap(Instant::now() + Duration::from_secs(60)));
    }
}
