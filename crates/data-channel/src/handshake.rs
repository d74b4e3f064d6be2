//! Connection setup: role byte, session token, dispatch to a role handler.

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::downloader::Downloader;
use crate::error::SessionError;
use crate::session::{Role, SessionOptions, Transfer};
use crate::uploader::Uploader;
use crate::wire::{ROLE_DOWNLOAD, ROLE_UPLOAD};

/// Random bytes behind a session token (rendered as twice as many hex chars).
const TOKEN_BYTES: usize = 16;

/// Creates a fresh session token: 32 lowercase hex characters from the OS CSPRNG.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Compares tokens without short-circuiting on the first differing byte.
pub fn validate_token(received: &str, expected: &str) -> bool {
    received.len() == expected.len()
        && received
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// A session opened by a remote initiator, ready for its role.
pub enum Accepted<S> {
    /// The peer announced `'U'`; we receive.
    PeerUploads(Downloader<S>),
    /// The peer announced `'D'`; we send.
    PeerDownloads(Uploader<S>),
}

impl<S> Accepted<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::PeerUploads(d) => d.token(),
            Self::PeerDownloads(u) => u.token(),
        }
    }

    /// Sends `code` to the peer and closes.
    pub async fn reject(self, code: &str) {
        match self {
            Self::PeerUploads(d) => d.reject(code).await,
            Self::PeerDownloads(u) => u.reject(code).await,
        }
    }
}

/// Initiator side: role byte, our token, end of meta.
pub(crate) async fn introduce<S>(
    transfer: &mut Transfer<S>,
    role: u8,
    token: &str,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    transfer.write_role(role).await?;
    transfer.send_token(token).await?;
    transfer.end_meta().await?;
    transfer.mark_idle();
    Ok(())
}

/// Acceptor side: reads the role byte and the token block.
///
/// A peer that wants to upload gets a [`Downloader`] and vice versa.
pub async fn accept<S>(stream: S, options: SessionOptions) -> Result<Accepted<S>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut transfer = Transfer::new(stream, Role::Downloader, options);
    match read_introduction(&mut transfer).await {
        Ok(role) => {
            debug!(role = ?role, token = ?transfer.token(), "accepted session");
            transfer.mark_idle();
            Ok(match role {
                Role::Downloader => Accepted::PeerUploads(Downloader::from_transfer(transfer)),
                Role::Uploader => Accepted::PeerDownloads(Uploader::from_transfer(transfer)),
            })
        }
        Err(e) => Err(transfer.abort(e).await),
    }
}

async fn read_introduction<S>(transfer: &mut Transfer<S>) -> Result<Role, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let role = match transfer.read_role().await? {
        ROLE_UPLOAD => Role::Downloader,
        ROLE_DOWNLOAD => Role::Uploader,
        other => return Err(SessionError::UnknownRole(other)),
    };
    transfer.set_role(role);

    let block = transfer
        .read_meta()
        .await?
        .ok_or_else(|| SessionError::Protocol("peer closed during handshake".into()))?;
    if let Some(code) = block.error {
        return Err(SessionError::Remote(code));
    }
    if block.token.is_none() {
        return Err(SessionError::Protocol("missing TOKEN in handshake".into()));
    }
    Ok(role)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;
    use crate::wire;

    #[test]
    fn tokens_are_hex_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn token_comparison() {
        let t = generate_token();
        assert!(validate_token(&t, &t));
        assert!(!validate_token(&t, &generate_token()));
        assert!(!validate_token("abc", "abcd"));
        assert!(!validate_token("", "a"));
    }

    #[tokio::test]
    async fn uploader_is_accepted_as_download() {
        let (a, b) = duplex(4096);
        let connect = tokio::spawn(async move {
            Uploader::connect(a, "tok-1", SessionOptions::default()).await
        });

        let accepted = accept(b, SessionOptions::default()).await.unwrap();
        assert_eq!(accepted.token(), Some("tok-1"));
        let Accepted::PeerUploads(downloader) = accepted else {
            panic!("expected a downloader");
        };
        assert_eq!(downloader.role(), Role::Downloader);

        let uploader = connect.await.unwrap().unwrap();
        assert_eq!(uploader.token(), Some("tok-1"));
    }

    #[tokio::test]
    async fn downloader_is_accepted_as_upload() {
        let (a, b) = duplex(4096);
        tokio::spawn(async move {
            let _ = Downloader::connect(a, "tok-2", SessionOptions::default()).await;
        });

        match accept(b, SessionOptions::default()).await.unwrap() {
            Accepted::PeerDownloads(uploader) => {
                assert_eq!(uploader.role(), Role::Uploader);
                assert_eq!(uploader.token(), Some("tok-2"));
            }
            Accepted::PeerUploads(_) => panic!("expected an uploader"),
        }
    }

    #[tokio::test]
    async fn unknown_role_is_rejected() {
        let (mut a, b) = duplex(4096);
        a.write_u8(b'X').await.unwrap();

        let err = accept(b, SessionOptions::default()).await.err().unwrap();
        assert!(matches!(err, SessionError::UnknownRole(b'X')));

        let block = wire::read_meta_block(&mut a).await.unwrap().unwrap();
        assert_eq!(block.error.as_deref(), Some("unknown role"));
    }

    #[tokio::test]
    async fn missing_token_is_rejected() {
        let (mut a, b) = duplex(4096);
        a.write_u8(ROLE_UPLOAD).await.unwrap();
        wire::write_end_of_meta(&mut a).await.unwrap();

        let err = accept(b, SessionOptions::default()).await.err().unwrap();
        assert!(matches!(err, SessionError::Protocol(_)));

        let block = wire::read_meta_block(&mut a).await.unwrap().unwrap();
        assert!(block.error.is_some());
        let mut rest = Vec::new();
        a.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
