//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport is not open")]
    NotOpen,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),

    #[error("Transport rejected: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}
