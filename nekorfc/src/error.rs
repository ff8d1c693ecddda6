use crate::frame::FrameError;
use crate::message::ProtocolError;

/// Errors surfaced by clients and connection handlers
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed record: {0}")]
    Record(#[from] serde_json::Error),
    #[error("request rejected with status {0}")]
    Rejected(u16),
    #[error("connection closed by remote")]
    Closed,
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("not registered with the tracker")]
    NotRegistered,
    #[error("content stream ended after {got} of {expected} bytes")]
    IncompleteContent { expected: u64, got: u64 },
}

impl Error {
    /// Whether the connection the error came from is out of step and must be dropped
    pub fn breaks_connection(&self) -> bool {
        matches!(
            self,
            Error::Frame(_) | Error::Protocol(_) | Error::Io(_) | Error::Timeout | Error::Closed
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
