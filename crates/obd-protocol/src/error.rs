//! OBD-II Error Types

use crate::transport::TransportError;
use crate::uds::NegativeResponseCode;
use thiserror::Error;

/// Errors raised by the command driver, the UDS service and the connection layer
#[derive(Debug, Clone, Error)]
pub enum ObdError {
    /// Transport could not be opened or written
    #[error("Connection error: {0}")]
    Connection(String),

    /// No adapter answered on any candidate transport
    #[error("OBD adapter not found")]
    AdapterNotFound,

    /// Transport closed or failed while requests were outstanding
    #[error("OBD connection lost")]
    ConnectionLost,

    /// Operation needs a connected driver
    #[error("OBD adapter is not connected")]
    NotConnected,

    /// No prompt terminator within the command deadline
    #[error("Timeout waiting for response to {command} after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// Malformed or truncated response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// UDS negative response (0x7F)
    #[error("Negative response to service 0x{service_id:02X}: {nrc}")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    /// Adapter rejected or did not confirm a command
    #[error("Command error: {0}")]
    Command(String),

    /// Destructive operation invoked without explicit confirmation
    #[error("Operation requires explicit confirmation")]
    ConfirmationRequired,

    /// A waiter was replaced before its response arrived
    #[error("Previous response pending")]
    ResponseSuperseded,

    /// Underlying transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ObdError {
    /// Timeout constructor
    pub fn timeout(command: &str, timeout_ms: u64) -> Self {
        ObdError::Timeout {
            command: command.to_string(),
            timeout_ms,
        }
    }

    /// Whether this error means the link is gone rather than one command failed
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ObdError::Connection(_)
                | ObdError::ConnectionLost
                | ObdError::NotConnected
                | ObdError::AdapterNotFound
                | ObdError::Transport(_)
        )
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_response_display() {
        let err = ObdError::NegativeResponse {
            service_id: 0x22,
            nrc: NegativeResponseCode::from(0x31),
        };
        assert_eq!(
            err.to_string(),
            "Negative response to service 0x22: requestOutOfRange (0x31)"
        );
    }

    #[test]
    fn test_connection_failure_classification() {
        assert!(ObdError::ConnectionLost.is_connection_failure());
        assert!(ObdError::Transport(TransportError::NotOpen).is_connection_failure());
        assert!(!ObdError::timeout("010C", 2000).is_connection_failure());
        assert!(!ObdError::Protocol("short".into()).is_connection_failure());
    }
}
