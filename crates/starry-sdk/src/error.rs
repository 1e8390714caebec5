use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("no path.")]
    NoPath,

    #[error("connect server failed: {0}")]
    Connect(String),

    /// The server refused to open the depot.
    #[error("{0}")]
    Open(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The channel timed out or failed earlier and can no longer be used.
    #[error("channel is out of sync with the server")]
    Poisoned,

    #[error("protocol error: {0}")]
    Protocol(#[from] starry_protocol::ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SdkResult<T> = Result<T, SdkError>;
