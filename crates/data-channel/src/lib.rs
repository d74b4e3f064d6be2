//! Peer session protocol for moving chunk payloads between nodes.
//!
//! A session runs over an already-connected, already-authenticated byte
//! stream. The initiator announces its role with one byte, identifies the
//! transfer job with a token, and then the downloader requests ranges which
//! the uploader echoes and streams raw.
//!
//! # Wire format
//!
//! See [`wire`] module for the control sub-protocol.

pub mod downloader;
pub mod error;
pub mod handshake;
pub mod session;
pub mod uploader;
pub mod wire;

pub use downloader::{DownloadHandler, Downloader, NextRange};
pub use error::SessionError;
pub use handshake::{Accepted, accept, generate_token, validate_token};
pub use session::{Role, SessionOptions, SessionState, Transfer};
pub use uploader::{UploadHandler, Uploader};

use std::time::Duration;

/// Payload read/write block size (256 KB).
pub const IO_BUFFER_SIZE: usize = 256 * 1024;

/// Default bound on any single read or write.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Error code sent when a session read or write timed out.
pub const ERROR_TIMEOUT: &str = "timeout";

/// Error code sent when the destination volume is full.
pub const ERROR_OUT_OF_DISK_SPACE: &str = "Out of disk space";

/// Error code sent when the receiving side could not allocate a chunk buffer.
pub const ERROR_OUT_OF_MEMORY: &str = "Out of memory";

/// Error code sent when the job behind a session was cancelled.
pub const ERROR_CANCELLED: &str = "cancelled";

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;

    use imgsync_transfer::FileRange;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    /// Fetches a fixed list of ranges into an in-memory image.
    struct VecSink {
        ranges: Vec<FileRange>,
        image: Vec<u8>,
    }

    impl DownloadHandler for VecSink {
        async fn want_range(&mut self) -> NextRange {
            match self.ranges.pop() {
                Some(r) => NextRange::Range(r),
                None => NextRange::Stop,
            }
        }

        fn data_received(&mut self, offset: u64, data: &[u8]) -> bool {
            let start = offset as usize;
            match self.image.get_mut(start..start + data.len()) {
                Some(dst) => {
                    dst.copy_from_slice(data);
                    true
                }
                None => false,
            }
        }
    }

    #[derive(Default)]
    struct SentLog(Vec<FileRange>);

    impl UploadHandler for SentLog {
        fn range_sent(&mut self, range: FileRange) {
            self.0.push(range);
        }
    }

    fn write_source(dir: &Path, len: usize) -> (std::path::PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        let path = dir.join("source.img");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();
        (path, data)
    }

    fn ranges(file_size: u64, chunk: u64) -> Vec<FileRange> {
        let mut r = imgsync_transfer::chunk_ranges(file_size, chunk);
        r.reverse();
        r
    }

    async fn round_trip(len: usize, chunk: u64) {
        let dir = tempfile::tempdir().unwrap();
        let (path, data) = write_source(dir.path(), len);

        let (a, b) = duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let Accepted::PeerDownloads(mut uploader) =
                accept(b, SessionOptions::default()).await.unwrap()
            else {
                panic!("expected an uploader");
            };
            let mut log = SentLog::default();
            let sent = uploader.upload(&path, &mut log).await.unwrap();
            (sent, log.0)
        });

        let mut downloader = Downloader::connect(a, "job", SessionOptions::default())
            .await
            .unwrap();
        let mut sink = VecSink {
            ranges: ranges(len as u64, chunk),
            image: vec![0u8; len],
        };
        let received = downloader.download(&mut sink).await.unwrap();
        assert_eq!(downloader.state(), SessionState::Closed);

        let (sent, log) = server.await.unwrap();
        assert_eq!(received, len as u64);
        assert_eq!(sent, len as u64);
        assert_eq!(log.len() as u64, (len as u64).div_ceil(chunk));
        assert!(sink.image == data, "image differs from source");
    }

    #[tokio::test]
    async fn single_chunk_round_trip() {
        round_trip(1000, 4096).await;
    }

    #[tokio::test]
    async fn multi_chunk_round_trip() {
        // Three full chunks plus an uneven tail, each larger than the I/O buffer.
        let chunk = (IO_BUFFER_SIZE + 17) as u64;
        round_trip(3 * chunk as usize + 1234, chunk).await;
    }

    #[tokio::test]
    async fn range_past_end_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_source(dir.path(), 100);

        let (a, b) = duplex(4096);
        let server = tokio::spawn(async move {
            let Accepted::PeerDownloads(mut uploader) =
                accept(b, SessionOptions::default()).await.unwrap()
            else {
                panic!("expected an uploader");
            };
            uploader.upload(&path, &mut SentLog::default()).await
        });

        let mut downloader = Downloader::connect(a, "job", SessionOptions::default())
            .await
            .unwrap();
        let mut sink = VecSink {
            ranges: vec![FileRange::new(50, 200).unwrap()],
            image: vec![0u8; 200],
        };
        let err = downloader.download(&mut sink).await.unwrap_err();
        assert!(matches!(err, SessionError::Remote(_)), "got {err:?}");
        assert!(downloader.last_error().unwrap().starts_with("invalid range"));

        assert!(matches!(
            server.await.unwrap(),
            Err(SessionError::InvalidRange(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_uploader_times_out() {
        let (a, mut b) = duplex(4096);
        let options = SessionOptions {
            read_timeout: Duration::from_secs(60),
            ..SessionOptions::default()
        };

        // A peer that acknowledges the range and then goes silent.
        let peer = tokio::spawn(async move {
            assert_eq!(b.read_u8().await.unwrap(), wire::ROLE_DOWNLOAD);
            let _ = wire::read_meta_block(&mut b).await;
            let _ = wire::read_meta_block(&mut b).await;
            let range = FileRange::new(0, 1000).unwrap();
            wire::write_control(&mut b, &wire::ControlMessage::Range(range))
                .await
                .unwrap();
            wire::write_end_of_meta(&mut b).await.unwrap();
            b.write_all(&[7u8; 10]).await.unwrap();
            let last = wire::read_meta_block(&mut b).await;
            (last, b)
        });

        let mut downloader = Downloader::connect(a, "job", options).await.unwrap();
        let mut sink = VecSink {
            ranges: vec![FileRange::new(0, 1000).unwrap()],
            image: vec![0u8; 1000],
        };
        let err = downloader.download(&mut sink).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
        assert_eq!(downloader.state(), SessionState::Closed);

        let (last, _b) = peer.await.unwrap();
        assert_eq!(last.unwrap().unwrap().error.as_deref(), Some(ERROR_TIMEOUT));
    }
}
