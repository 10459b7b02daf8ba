//! Proxy error types.

use thiserror::Error;

use pot_wire::WireError;

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors that can occur while running the broker proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Wire protocol error.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// Messaging socket error.
    #[error("socket error: {0}")]
    Socket(#[from] zmq::Error),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An external or internal endpoint could not be bound.
    #[error("failed to bind {endpoint}: {source}")]
    BindFailed { endpoint: String, source: zmq::Error },

    /// The proxy was started without any store to serve.
    #[error("at least one store name must be configured")]
    NoStores,

    /// A backend worker process could not be launched.
    #[error("failed to spawn worker for '{store}': {source}")]
    SpawnFailed {
        store: String,
        source: std::io::Error,
    },

    /// A proxy-originated request to a worker did not complete.
    #[error("internal request to worker '{store}' failed: {reason}")]
    InternalRequest { store: String, reason: String },

    /// A worker returned a configuration block the proxy cannot use.
    #[error("malformed configuration block: {0}")]
    BadConfigBlock(String),
}
