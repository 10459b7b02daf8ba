//! Client error types.

use std::time::Duration;

use thiserror::Error;

use pot_wire::WireError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Wire protocol error.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// Messaging socket error.
    #[error("socket error: {0}")]
    Socket(#[from] zmq::Error),

    /// No frame arrived within the wait window.
    #[error("no response received in {0:?}")]
    Timeout(Duration),

    /// The server answered with something other than the expected message.
    #[error("expected {expected}, got {actual}")]
    UnexpectedMessage { expected: String, actual: String },

    /// The server answered with an error-bearing REP.
    #[error("{kind}: {text}")]
    Server { kind: String, text: String },
}

impl ClientError {
    /// Builds the error for an error-bearing REP.
    pub(crate) fn server(error: &pot_wire::ErrorBody) -> Self {
        ClientError::Server {
            kind: error.kind.clone(),
            text: error.text.clone(),
        }
    }
}
