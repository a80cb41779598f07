//! Length-prefixed text frames.
//!
//! Each frame is a big-endian `u16` length followed by that many bytes of
//! UTF-8. The prefix caps a frame at 65 535 bytes whatever limit is configured.

use crate::FrameError;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default configured frame limit.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 512 * 1024;

/// Largest frame the length prefix can describe.
pub const LENGTH_FIELD_MAX: usize = u16::MAX as usize;

/// The limit actually enforced for a configured maximum.
pub fn effective_limit(max_frame_length: usize) -> usize {
    max_frame_length.min(LENGTH_FIELD_MAX)
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream, that is
/// one falling between frames; a stream cut inside a prefix is an error.
pub async fn read_frame<R>(reader: &mut R, max_frame_length: usize) -> Result<Option<String>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let high = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let low = reader.read_u8().await?;
    let len = usize::from(u16::from_be_bytes([high, low]));
    let max = effective_limit(max_frame_length);
    if len > max {
        return Err(FrameError::Oversized { len, max });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| FrameError::InvalidUtf8)
}

/// Check a payload against the limit before it is queued.
pub fn check_length(text: &str, max_frame_length: usize) -> Result<(), FrameError> {
    let max = effective_limit(max_frame_length);
    if text.len() > max {
        return Err(FrameError::Oversized {
            len: text.len(),
            max,
        });
    }
    Ok(())
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, text: &str, max_frame_length: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    check_length(text, max_frame_length)?;
    let mut buf = Vec::with_capacity(2 + text.len());
    buf.extend_from_slice(&(text.len() as u16).to_be_bytes());
    buf.extend_from_slice(text.as_bytes());
    writer.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_in_sequence() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, "{\"type\":\"ack\"}", 1024).await.unwrap();
        write_frame(&mut a, "", 1024).await.unwrap();
        drop(a);

        assert_eq!(
            read_frame(&mut b, 1024).await.unwrap().as_deref(),
            Some("{\"type\":\"ack\"}")
        );
        assert_eq!(read_frame(&mut b, 1024).await.unwrap().as_deref(), Some(""));
        assert_eq!(read_frame(&mut b, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn prefix_is_big_endian() {
        let mut out = Vec::new();
        write_frame(&mut out, &"x".repeat(258), 1024).await.unwrap();
        assert_eq!(&out[..2], &[1, 2]);
        assert_eq!(out.len(), 260);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let mut out = Vec::new();
        let err = write_frame(&mut out, "hello", 4).await.unwrap_err();
        assert!(matches!(err, FrameError::Oversized { len: 5, max: 4 }));
        assert!(out.is_empty());

        let mut input: &[u8] = &[0, 5, b'h', b'e', b'l', b'l', b'o'];
        let err = read_frame(&mut input, 4).await.unwrap_err();
        assert!(matches!(err, FrameError::Oversized { len: 5, max: 4 }));
    }

    #[test]
    fn configured_limit_is_capped_by_prefix() {
        assert_eq!(effective_limit(DEFAULT_MAX_FRAME_LENGTH), LENGTH_FIELD_MAX);
        assert_eq!(effective_limit(1000), 1000);
        assert!(check_length(&"x".repeat(LENGTH_FIELD_MAX + 1), DEFAULT_MAX_FRAME_LENGTH).is_err());
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let mut input: &[u8] = &[0, 5, b'h', b'e'];
        let err = read_frame(&mut input, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[tokio::test]
    async fn truncated_prefix_is_an_error() {
        let mut input: &[u8] = &[0];
        let err = read_frame(&mut input, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));

        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_utf8() {
        let mut input: &[u8] = &[0, 2, 0xff, 0xfe];
        let err = read_frame(&mut input, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidUtf8));
    }
}
