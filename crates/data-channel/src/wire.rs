//! Control sub-protocol carried in-band with the chunk payload.
//!
//! # Wire format
//!
//! ```text
//! ROLE (initiator -> acceptor):  [1 byte: 'U' = I upload, 'D' = I download]
//!
//! CONTROL MESSAGE:
//!   [1 byte: L (1..=255)]
//!   [L bytes: "KEY=VALUE" UTF-8]
//!
//! END OF META BLOCK: [1 byte: 0x00]
//!
//! PAYLOAD: exactly `end - start` raw bytes, following the sender's
//!          RANGE echo, no further framing.
//! ```
//!
//! Recognized keys are `TOKEN`, `RANGE` (`"<start>:<end>"`, decimal, end
//! exclusive) and `ERROR`. Other keys are preserved as [`ControlMessage::Unknown`].

use imgsync_transfer::FileRange;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::error::SessionError;

/// Role byte of an initiator that wants to upload.
pub const ROLE_UPLOAD: u8 = b'U';

/// Role byte of an initiator that wants to download.
pub const ROLE_DOWNLOAD: u8 = b'D';

/// Longest control message body.
pub const MAX_MESSAGE_LEN: usize = u8::MAX as usize;

pub const KEY_TOKEN: &str = "TOKEN";
pub const KEY_RANGE: &str = "RANGE";
pub const KEY_ERROR: &str = "ERROR";

/// One `KEY=VALUE` control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Token(String),
    Range(FileRange),
    Error(String),
    Unknown { key: String, value: String },
}

impl ControlMessage {
    /// Encodes the message including its length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, SessionError> {
        let body = match self {
            Self::Token(token) => format!("{KEY_TOKEN}={token}"),
            Self::Range(range) => format!("{KEY_RANGE}={}:{}", range.start(), range.end()),
            Self::Error(code) => format!("{KEY_ERROR}={code}"),
            Self::Unknown { key, value } => format!("{key}={value}"),
        };
        let len = body.len();
        if len > MAX_MESSAGE_LEN {
            return Err(SessionError::Protocol(format!(
                "control message too long: {len} bytes (max {MAX_MESSAGE_LEN})"
            )));
        }

        let mut out = Vec::with_capacity(len + 1);
        out.push(len as u8);
        out.extend_from_slice(body.as_bytes());
        Ok(out)
    }

    /// Parses a message body (without the length prefix).
    pub fn parse(body: &[u8]) -> Result<Self, SessionError> {
        let text = std::str::from_utf8(body)
            .map_err(|e| SessionError::Protocol(format!("invalid UTF-8 control message: {e}")))?;
        let (key, value) = text
            .split_once('=')
            .ok_or_else(|| SessionError::Protocol(format!("control message without '=': {text:?}")))?;

        Ok(match key {
            KEY_TOKEN => Self::Token(value.to_string()),
            KEY_RANGE => Self::Range(parse_range(value)?),
            KEY_ERROR => Self::Error(value.to_string()),
            _ => Self::Unknown {
                key: key.to_string(),
                value: value.to_string(),
            },
        })
    }
}

fn parse_range(value: &str) -> Result<FileRange, SessionError> {
    let invalid = || SessionError::InvalidRange(value.to_string());
    let (start, end) = value.split_once(':').ok_or_else(invalid)?;
    let start = parse_offset(start).ok_or_else(invalid)?;
    let end = parse_offset(end).ok_or_else(invalid)?;
    FileRange::new(start, end).map_err(|_| invalid())
}

/// Plain decimal digits only; `u64::from_str` would also take a leading `+`.
fn parse_offset(text: &str) -> Option<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// All control messages of one meta block, up to its terminating zero byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaBlock {
    pub token: Option<String>,
    pub range: Option<FileRange>,
    pub error: Option<String>,
    pub unknown: Vec<(String, String)>,
}

impl MetaBlock {
    /// `true` for a bare end-of-meta marker, which means "nothing more to negotiate".
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.range.is_none() && self.error.is_none() && self.unknown.is_empty()
    }
}

/// Writes one control message.
pub async fn write_control<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ControlMessage,
) -> Result<(), SessionError> {
    let bytes = message.encode()?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Writes the end-of-meta marker and flushes.
pub async fn write_end_of_meta<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), SessionError> {
    writer.write_u8(0).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads control messages until the end-of-meta marker.
///
/// Returns `None` if the peer closed the stream at a block boundary.
pub async fn read_meta_block<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<MetaBlock>, SessionError> {
    let mut block = MetaBlock::default();
    let mut body = [0u8; MAX_MESSAGE_LEN];
    let mut first = true;

    loop {
        let len = match reader.read_u8().await {
            Ok(len) => len as usize,
            Err(e) if first && e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        first = false;
        if len == 0 {
            return Ok(Some(block));
        }

        reader.read_exact(&mut body[..len]).await?;
        match ControlMessage::parse(&body[..len])? {
            ControlMessage::Token(token) => {
                if block.token.is_some() {
                    warn!("peer sent a second TOKEN in one meta block, ignoring it");
                } else {
                    block.token = Some(token);
                }
            }
            ControlMessage::Range(range) => {
                if let Some(previous) = block.range {
                    return Err(SessionError::Protocol(format!(
                        "second RANGE {range} in meta block (already {previous})"
                    )));
                }
                block.range = Some(range);
            }
            ControlMessage::Error(code) => block.error = Some(code),
            ControlMessage::Unknown { key, value } => {
                warn!(key = %key, "ignoring unknown control message");
                block.unknown.push((key, value));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, end: u64) -> FileRange {
        FileRange::new(start, end).unwrap()
    }

    #[test]
    fn encodes_with_length_prefix() {
        let bytes = ControlMessage::Range(range(0, 16777216)).encode().unwrap();
        assert_eq!(bytes[0] as usize, bytes.len() - 1);
        assert_eq!(&bytes[1..], b"RANGE=0:16777216");
    }

    #[test]
    fn parses_known_keys() {
        assert_eq!(
            ControlMessage::parse(b"TOKEN=abc").unwrap(),
            ControlMessage::Token("abc".into())
        );
        assert_eq!(
            ControlMessage::parse(b"RANGE=10:20").unwrap(),
            ControlMessage::Range(range(10, 20))
        );
        assert_eq!(
            ControlMessage::parse(b"ERROR=Out of disk space").unwrap(),
            ControlMessage::Error("Out of disk space".into())
        );
    }

    #[test]
    fn value_may_contain_separator() {
        assert_eq!(
            ControlMessage::parse(b"X-HINT=a=b").unwrap(),
            ControlMessage::Unknown {
                key: "X-HINT".into(),
                value: "a=b".into()
            }
        );
    }

    #[test]
    fn rejects_malformed_messages() {
        assert!(matches!(
            ControlMessage::parse(b"TOKEN"),
            Err(SessionError::Protocol(_))
        ));
        assert!(matches!(
            ControlMessage::parse(&[0xff, b'=', b'x']),
            Err(SessionError::Protocol(_))
        ));
        for bad in [
            "RANGE=20:10",
            "RANGE=5:5",
            "RANGE=1-2",
            "RANGE=a:9",
            "RANGE=-1:4",
            "RANGE=+1:4",
            "RANGE=1:+4",
            "RANGE=:4",
            "RANGE= 1:4",
        ] {
            assert!(
                matches!(
                    ControlMessage::parse(bad.as_bytes()),
                    Err(SessionError::InvalidRange(_))
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn every_variant_survives_encode_and_parse() {
        let messages = [
            ControlMessage::Token("0f3a9c".into()),
            ControlMessage::Range(range(4096, 8192)),
            ControlMessage::Error("Out of disk space".into()),
            ControlMessage::Unknown {
                key: "X-HINT".into(),
                value: "a=b".into(),
            },
        ];
        for msg in messages {
            let bytes = msg.encode().unwrap();
            assert_eq!(ControlMessage::parse(&bytes[1..]).unwrap(), msg);
        }
    }

    #[test]
    fn message_too_long() {
        let msg = ControlMessage::Error("e".repeat(250));
        assert!(msg.encode().is_err());
        let msg = ControlMessage::Error("e".repeat(249));
        assert_eq!(msg.encode().unwrap().len(), 256);
    }

    #[tokio::test]
    async fn meta_block_collects_messages() {
        let mut buf = Vec::new();
        write_control(&mut buf, &ControlMessage::Token("t1".into()))
            .await
            .unwrap();
        write_control(&mut buf, &ControlMessage::Range(range(0, 4)))
            .await
            .unwrap();
        write_end_of_meta(&mut buf).await.unwrap();
        write_end_of_meta(&mut buf).await.unwrap();

        let mut cursor = &buf[..];
        let block = read_meta_block(&mut cursor).await.unwrap().unwrap();
        assert_eq!(block.token.as_deref(), Some("t1"));
        assert_eq!(block.range, Some(range(0, 4)));
        assert!(!block.is_empty());

        let empty = read_meta_block(&mut cursor).await.unwrap().unwrap();
        assert!(empty.is_empty());

        assert!(read_meta_block(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_range_is_protocol_error() {
        let mut buf = Vec::new();
        write_control(&mut buf, &ControlMessage::Range(range(0, 4)))
            .await
            .unwrap();
        write_control(&mut buf, &ControlMessage::Range(range(4, 8)))
            .await
            .unwrap();
        write_end_of_meta(&mut buf).await.unwrap();

        let mut cursor = &buf[..];
        assert!(matches!(
            read_meta_block(&mut cursor).await,
            Err(SessionError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn second_token_is_ignored() {
        let mut buf = Vec::new();
        write_control(&mut buf, &ControlMessage::Token("first".into()))
            .await
            .unwrap();
        write_control(&mut buf, &ControlMessage::Token("second".into()))
            .await
            .unwrap();
        write_end_of_meta(&mut buf).await.unwrap();

        let mut cursor = &buf[..];
        let block = read_meta_block(&mut cursor).await.unwrap().unwrap();
        assert_eq!(block.token.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn truncated_block_is_an_error() {
        let buf = [5u8, b'T', b'O'];
        let mut cursor = &buf[..];
        assert!(matches!(
            read_meta_block(&mut cursor).await,
            Err(SessionError::Io(_))
        ));
    }
}
