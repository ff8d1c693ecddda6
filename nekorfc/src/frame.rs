//! Length-prefixed framing shared by every connection.
//!
//! A frame is an 8 byte ASCII decimal length, left-justified and padded with spaces, followed by
//! exactly that many payload bytes: `b"5       hello"`. A zero-length frame marks the end of a
//! content stream, and a connection closed before any header byte arrives reads as an empty
//! payload as well.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Width of the length prefix
pub const HEADER_LEN: usize = 8;

/// Largest payload an 8 digit prefix can describe
pub const MAX_PAYLOAD_LEN: usize = 99_999_999;

/// Upper bound on bytes requested from the socket per read call
pub const READ_CHUNK: usize = 1024;

/// Error reading or writing a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid frame header {0:?}")]
    BadHeader(String),
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("payload of {0} bytes does not fit the length prefix")]
    TooLarge(usize),
}

/// Write `payload` as one frame, returning the total number of bytes written.
pub async fn send_frame<W>(writer: &mut W, payload: &[u8]) -> Result<usize, FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let header = format!("{:<width$}", payload.len(), width = HEADER_LEN);
    let mut message = Vec::with_capacity(HEADER_LEN + payload.len());
    message.extend_from_slice(header.as_bytes());
    message.extend_from_slice(payload);

    writer.write_all(&message).await?;
    writer.flush().await?;
    Ok(message.len())
}

/// Read one frame and return its payload.
///
/// Returns an empty payload if the remote end closed the connection before sending a header.
pub async fn receive_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(Vec::new());
            }
            return Err(FrameError::Truncated {
                expected: HEADER_LEN,
                got: filled,
            });
        }
        filled += n;
    }

    let len = parse_header(&header)?;
    // capacity follows received bytes
    let mut payload = Vec::with_capacity(len.min(READ_CHUNK));
    let mut chunk = [0u8; READ_CHUNK];
    while payload.len() < len {
        let want = READ_CHUNK.min(len - payload.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(FrameError::Truncated {
                expected: len,
                got: payload.len(),
            });
        }
        payload.extend_from_slice(&chunk[..n]);
    }

    Ok(payload)
}

fn parse_header(header: &[u8; HEADER_LEN]) -> Result<usize, FrameError> {
    let text = std::str::from_utf8(header)
        .map_err(|_| FrameError::BadHeader(String::from_utf8_lossy(header).into_owned()))?;
    text.trim_end_matches(' ')
        .parse()
        .map_err(|_| FrameError::BadHeader(text.to_owned()))
}
