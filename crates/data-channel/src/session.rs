//! Session core shared by [`crate::Uploader`] and [`crate::Downloader`].

use std::future::Future;
use std::time::Duration;

use imgsync_transfer::FileRange;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::wire::{self, ControlMessage, MetaBlock};

/// Bound on best-effort writes made while a session is being torn down.
const ERROR_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Applies to every read and write on the stream.
    pub read_timeout: Duration,
    pub cancel: CancellationToken,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_timeout: crate::DEFAULT_READ_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }
}

/// Which side of the payload this session is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Uploader,
    Downloader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshake,
    Idle,
    /// A range is agreed for the current cycle.
    Negotiated,
    Streaming,
    Closed,
}

/// One peer connection speaking the control sub-protocol.
pub struct Transfer<S> {
    stream: S,
    role: Role,
    token: Option<String>,
    token_sent: bool,
    token_received: bool,
    range: Option<FileRange>,
    last_error: Option<String>,
    state: SessionState,
    read_timeout: Duration,
    cancel: CancellationToken,
}

/// Runs `fut` under the session's timeout and cancellation token.
pub(crate) async fn guarded<T>(
    cancel: &CancellationToken,
    timeout: Duration,
    fut: impl Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(SessionError::Timeout),
        },
    }
}

impl<S> Transfer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(stream: S, role: Role, options: SessionOptions) -> Self {
        Self {
            stream,
            role,
            token: None,
            token_sent: false,
            token_received: false,
            range: None,
            last_error: None,
            state: SessionState::Handshake,
            read_timeout: options.read_timeout,
            cancel: options.cancel,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session identity, whether sent by us or received from the peer.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Range negotiated for the current cycle.
    pub fn range(&self) -> Option<FileRange> {
        self.range
    }

    /// Last error code sent to or received from the peer.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Ties the session to its owning job's cancellation.
    pub fn set_cancel_token(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    /// Sends the session token. Only the first call goes on the wire.
    pub async fn send_token(&mut self, token: &str) -> Result<(), SessionError> {
        if self.token_sent || self.token_received {
            warn!(role = ?self.role, "token already exchanged, not sending another");
            return Ok(());
        }
        self.write_control(ControlMessage::Token(token.to_string()))
            .await?;
        self.token = Some(token.to_string());
        self.token_sent = true;
        Ok(())
    }

    /// Sends the range for this cycle. Not followed by end-of-meta.
    pub async fn send_range(&mut self, range: FileRange) -> Result<(), SessionError> {
        if let Some(current) = self.range {
            return Err(SessionError::Protocol(format!(
                "range {range} sent while {current} is still negotiated"
            )));
        }
        self.write_control(ControlMessage::Range(range)).await?;
        self.range = Some(range);
        self.state = SessionState::Negotiated;
        Ok(())
    }

    /// Best-effort `ERROR` block. Returns `false` if it could not be sent.
    pub async fn send_error_code(&mut self, code: &str) -> bool {
        self.last_error = Some(code.to_string());
        if self.state == SessionState::Closed {
            return false;
        }
        let message = ControlMessage::Error(code.to_string());
        let stream = &mut self.stream;
        let send = async move {
            wire::write_control(stream, &message).await?;
            wire::write_end_of_meta(stream).await
        };
        match tokio::time::timeout(ERROR_SEND_TIMEOUT, send).await {
            Ok(Ok(())) => {
                debug!(role = ?self.role, code, "sent error code to peer");
                true
            }
            Ok(Err(e)) => {
                debug!(role = ?self.role, code, error = %e, "could not send error code");
                false
            }
            Err(_) => {
                debug!(role = ?self.role, code, "timed out sending error code");
                false
            }
        }
    }

    /// Shuts the stream down. Idempotent, never fails.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        let _ = tokio::time::timeout(ERROR_SEND_TIMEOUT, self.stream.shutdown()).await;
    }

    /// Tells the peer why (when the error warrants it) and closes.
    ///
    /// Returns `err` so callers can write `return Err(t.abort(e).await)`.
    pub(crate) async fn abort(&mut self, err: SessionError) -> SessionError {
        if let SessionError::Remote(code) = &err {
            self.last_error = Some(code.clone());
        } else if let Some(code) = err.peer_code() {
            self.send_error_code(&code).await;
        }
        // A cancelled session is closed by its owner after sending the job's reason.
        if !matches!(err, SessionError::Cancelled) {
            self.close().await;
        }
        err
    }

    pub(crate) async fn write_control(&mut self, message: ControlMessage) -> Result<(), SessionError> {
        guarded(
            &self.cancel,
            self.read_timeout,
            wire::write_control(&mut self.stream, &message),
        )
        .await
    }

    pub(crate) async fn end_meta(&mut self) -> Result<(), SessionError> {
        guarded(
            &self.cancel,
            self.read_timeout,
            wire::write_end_of_meta(&mut self.stream),
        )
        .await
    }

    /// Reads one meta block, absorbing its token and error.
    pub(crate) async fn read_meta(&mut self) -> Result<Option<MetaBlock>, SessionError> {
        let block = guarded(
            &self.cancel,
            self.read_timeout,
            wire::read_meta_block(&mut self.stream),
        )
        .await?;
        let Some(block) = block else {
            return Ok(None);
        };

        if let Some(token) = &block.token {
            if self.token_received || self.token_sent {
                warn!(role = ?self.role, "peer sent a second token, ignoring it");
            } else {
                self.token = Some(token.clone());
                self.token_received = true;
            }
        }
        if let Some(code) = &block.error {
            self.last_error = Some(code.clone());
        }
        Ok(Some(block))
    }

    pub(crate) async fn read_role(&mut self) -> Result<u8, SessionError> {
        let stream = &mut self.stream;
        guarded(&self.cancel, self.read_timeout, async move {
            stream.read_u8().await.map_err(SessionError::from)
        })
        .await
    }

    pub(crate) async fn write_role(&mut self, role: u8) -> Result<(), SessionError> {
        let stream = &mut self.stream;
        guarded(&self.cancel, self.read_timeout, async move {
            stream.write_u8(role).await.map_err(SessionError::from)
        })
        .await
    }

    /// Reads up to `buf.len()` payload bytes; zero means the peer hung up.
    pub(crate) async fn read_payload(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        self.state = SessionState::Streaming;
        let stream = &mut self.stream;
        guarded(&self.cancel, self.read_timeout, async move {
            stream.read(buf).await.map_err(SessionError::from)
        })
        .await
    }

    pub(crate) async fn write_payload(&mut self, buf: &[u8]) -> Result<(), SessionError> {
        self.state = SessionState::Streaming;
        let stream = &mut self.stream;
        guarded(&self.cancel, self.read_timeout, async move {
            stream.write_all(buf).await.map_err(SessionError::from)
        })
        .await
    }

    pub(crate) async fn flush(&mut self) -> Result<(), SessionError> {
        let stream = &mut self.stream;
        guarded(&self.cancel, self.read_timeout, async move {
            stream.flush().await.map_err(SessionError::from)
        })
        .await
    }

    pub(crate) fn set_peer_range(&mut self, range: FileRange) {
        self.range = Some(range);
        self.state = SessionState::Negotiated;
    }

    /// Ends the current negotiation cycle.
    pub(crate) fn finish_cycle(&mut self) {
        self.range = None;
        if self.state != SessionState::Closed {
            self.state = SessionState::Idle;
        }
    }

    pub(crate) fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = SessionState::Idle;
    }
}
