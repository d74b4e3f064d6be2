//! Receiving side of a session.
//!
//! The downloader drives the conversation: it asks its handler which range
//! it wants next, requests it, waits for the uploader's echo and then reads
//! exactly `length` payload bytes.

use std::future::Future;
use std::ops::{Deref, DerefMut};

use imgsync_transfer::FileRange;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::error::SessionError;
use crate::session::{Role, SessionOptions, Transfer};
use crate::wire::ROLE_DOWNLOAD;
use crate::IO_BUFFER_SIZE;

/// Answer to "which range next?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRange {
    Range(FileRange),
    /// No more work on this connection.
    Stop,
}

/// Callbacks a [`Downloader`] drives.
pub trait DownloadHandler: Send {
    /// Next range to fetch. Called once before every cycle, including the first.
    fn want_range(&mut self) -> impl Future<Output = NextRange> + Send;

    /// Payload bytes for `[offset, offset + data.len())`. `false` aborts the session.
    fn data_received(&mut self, offset: u64, data: &[u8]) -> bool;
}

pub struct Downloader<S> {
    transfer: Transfer<S>,
    buffer: Vec<u8>,
}

impl<S> Downloader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Opens a session as the initiator: role byte `'D'`, then our token.
    pub async fn connect(
        stream: S,
        token: &str,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let mut transfer = Transfer::new(stream, Role::Downloader, options);
        if let Err(e) = crate::handshake::introduce(&mut transfer, ROLE_DOWNLOAD, token).await {
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

    /// Fetches ranges until the handler says stop. Returns the bytes received.
    ///
    /// On error the session has already told the peer (where useful) and
    /// closed, except for [`SessionError::Cancelled`], which leaves the
    /// stream open so the owner can send its own reason.
    pub async fn download<H: DownloadHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<u64, SessionError> {
        let mut total = 0u64;
        loop {
            let range = match handler.want_range().await {
                NextRange::Range(range) => range,
                NextRange::Stop => {
                    // A cancelled owner reports its own reason instead of a clean end.
                    if self.transfer.cancel_token().is_cancelled() {
                        return Err(SessionError::Cancelled);
                    }
                    let _ = self.transfer.end_meta().await;
                    self.transfer.close().await;
                    info!(token = ?self.transfer.token(), bytes = total, "download session finished");
                    return Ok(total);
                }
            };

            match self.fetch(range, handler).await {
                Ok(()) => total += range.length(),
                Err(e) => return Err(self.transfer.abort(e).await),
            }
        }
    }

    /// Sends `RANGE` followed by end-of-meta.
    pub async fn request_range(&mut self, range: FileRange) -> Result<(), SessionError> {
        self.transfer.send_range(range).await?;
        self.transfer.end_meta().await
    }

    async fn fetch<H: DownloadHandler>(
        &mut self,
        range: FileRange,
        handler: &mut H,
    ) -> Result<(), SessionError> {
        self.request_range(range).await?;

        let block = self.transfer.read_meta().await?.ok_or_else(|| {
            SessionError::Protocol(format!("peer closed before answering range {range}"))
        })?;
        if let Some(code) = block.error {
            return Err(SessionError::Remote(code));
        }
        match block.range {
            Some(echo) if echo == range => {}
            Some(echo) => {
                return Err(SessionError::Protocol(format!(
                    "peer answered {echo} to request {range}"
                )));
            }
            None => {
                return Err(SessionError::Protocol(format!(
                    "peer did not confirm range {range}"
                )));
            }
        }

        self.receive_binary(handler).await?;
        self.transfer.finish_cycle();
        debug!(range = %range, "range received");
        Ok(())
    }

    /// Reads exactly the negotiated range's length into `handler`.
    pub async fn receive_binary<H: DownloadHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<u64, SessionError> {
        let range = self
            .transfer
            .range()
            .ok_or_else(|| SessionError::Protocol("no range negotiated".into()))?;

        let mut offset = range.start();
        while offset < range.end() {
            let want = (range.end() - offset).min(self.buffer.len() as u64) as usize;
            let n = self.transfer.read_payload(&mut self.buffer[..want]).await?;
            if n == 0 {
                return Err(SessionError::Protocol(format!(
                    "peer closed after {} of {} bytes",
                    offset - range.start(),
                    range.length()
                )));
            }
            if !handler.data_received(offset, &self.buffer[..n]) {
                return Err(SessionError::Protocol(format!(
                    "data at offset {offset} rejected"
                )));
            }
            offset += n as u64;
        }
        Ok(range.length())
    }

    /// Tells the peer we will not fetch anything on this connection.
    pub async fn reject(mut self, code: &str) {
        self.transfer.send_error_code(code).await;
        self.transfer.close().await;
    }
}

impl<S> Deref for Downloader<S> {
    type Target = Transfer<S>;

    fn deref(&self) -> &Self::Target {
        &self.transfer
    }
}

impl<S> DerefMut for Downloader<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transfer
    }
}
