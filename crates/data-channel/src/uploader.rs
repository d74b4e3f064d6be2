//! Sending side of a session.
//!
//! The uploader answers: it waits for a `RANGE` request, validates it
//! against the source file, echoes it and streams the bytes.

use std::io::SeekFrom;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use imgsync_transfer::FileRange;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::session::{Role, SessionOptions, Transfer};
use crate::wire::{ControlMessage, ROLE_UPLOAD};
use crate::IO_BUFFER_SIZE;

/// Error code sent when the source file cannot be opened.
const ERROR_SOURCE_UNAVAILABLE: &str = "source unavailable";

/// Callbacks an [`Uploader`] drives.
pub trait UploadHandler: Send {
    /// Whether to serve `range`. Refusing aborts the session.
    fn range_requested(&mut self, _range: FileRange) -> bool {
        true
    }

    /// `range` was written to the stream in full.
    fn range_sent(&mut self, range: FileRange);
}

pub struct Uploader<S> {
    transfer: Transfer<S>,
    buffer: Vec<u8>,
}

impl<S> Uploader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Opens a session as the initiator: role byte `'U'`, then our token.
    pub async fn connect(
        stream: S,
        token: &str,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let mut transfer = Transfer::new(stream, Role::Uploader, options);
        if let Err(e) = crate::handshake::introduce(&mut transfer, ROLE_UPLOAD, token).await {
            return Err(transfer.abort(e).await);
        }
        Ok(Self::from_transfer(transfer))
    }

    pub(crate) fn from_transfer(transfer: Transfer<S>) -> Self {
        Self {
            transfer,
            buffer: vec![0u8; IO_BUFFER_SIZE],
        }
    }

    /// Serves ranges of `path` until the peer stops asking. Returns bytes sent.
    pub async fn upload<H: UploadHandler>(
        &mut self,
        path: &Path,
        handler: &mut H,
    ) -> Result<u64, SessionError> {
        let opened = async {
            let file = File::open(path).await?;
            let size = file.metadata().await?.len();
            Ok::<_, std::io::Error>((file, size))
        };
        let (mut file, file_size) = match opened.await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open upload source");
                self.transfer.send_error_code(ERROR_SOURCE_UNAVAILABLE).await;
                self.transfer.close().await;
                return Err(e.into());
            }
        };

        self.transfer.mark_idle();
        let mut total = 0u64;
        loop {
            match self.serve_one(&mut file, file_size, handler).await {
                Ok(Some(sent)) => total += sent,
                Ok(None) => {
                    self.transfer.close().await;
                    info!(token = ?self.transfer.token(), bytes = total, "upload session finished");
                    return Ok(total);
                }
                Err(e) => return Err(self.transfer.abort(e).await),
            }
        }
    }

    /// One negotiation cycle. `None` once the peer has nothing more to ask.
    async fn serve_one<H: UploadHandler>(
        &mut self,
        file: &mut File,
        file_size: u64,
        handler: &mut H,
    ) -> Result<Option<u64>, SessionError> {
        let Some(block) = self.transfer.read_meta().await? else {
            return Ok(None);
        };
        if let Some(code) = block.error {
            return Err(SessionError::Remote(code));
        }
        let Some(range) = block.range else {
            if block.is_empty() {
                return Ok(None);
            }
            debug!("meta block without RANGE, waiting for the next one");
            return Ok(Some(0));
        };

        self.transfer.set_peer_range(range);
        if range.end() > file_size {
            return Err(SessionError::InvalidRange(format!(
                "{range} beyond end of file ({file_size} bytes)"
            )));
        }
        if !handler.range_requested(range) {
            return Err(SessionError::Protocol(format!("range {range} refused")));
        }

        self.prepare_send_range(range).await?;
        self.send_file(file).await?;
        handler.range_sent(range);
        self.transfer.finish_cycle();
        debug!(range = %range, "range sent");
        Ok(Some(range.length()))
    }

    /// Echoes `range` to confirm it; the payload follows immediately.
    pub async fn prepare_send_range(&mut self, range: FileRange) -> Result<(), SessionError> {
        self.transfer.write_control(ControlMessage::Range(range)).await?;
        self.transfer.end_meta().await?;
        self.transfer.set_peer_range(range);
        Ok(())
    }

    /// Streams exactly the negotiated range of `file`.
    pub async fn send_file(&mut self, file: &mut File) -> Result<u64, SessionError> {
        let range = self
            .transfer
            .range()
            .ok_or_else(|| SessionError::Protocol("no range negotiated".into()))?;

        file.seek(SeekFrom::Start(range.start())).await?;
        let mut remaining = range.length();
        while remaining > 0 {
            let want = remaining.min(self.buffer.len() as u64) as usize;
            let n = file.read(&mut self.buffer[..want]).await?;
            if n == 0 {
                return Err(SessionError::Protocol(format!(
                    "source ended {remaining} bytes short of {range}"
                )));
            }
            self.transfer.write_payload(&self.buffer[..n]).await?;
            remaining -= n as u64;
        }
        self.transfer.flush().await?;
        Ok(range.length())
    }

    /// Tells the peer we will not serve this connection.
    pub async fn reject(mut self, code: &str) {
        self.transfer.send_error_code(code).await;
        self.transfer.close().await;
    }
}

impl<S> Deref for Uploader<S> {
    type Target = Transfer<S>;

    fn deref(&self) -> &Self::Target {
        &self.transfer
    }
}

impl<S> DerefMut for Uploader<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transfer
    }
}
