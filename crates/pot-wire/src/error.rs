//! Wire protocol error types.

use thiserror::Error;

/// Result type for wire protocol operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors raised while parsing or building wire frames.
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame is truncated, carries non-UTF-8 where JSON is expected, or
    /// holds an ill-formed transaction id.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// A required field is absent from the request.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The request kind is not one the broker handles.
    #[error("unhandled request type: {0}")]
    UnhandledKind(String),

    /// The request command line could not be parsed.
    #[error("malformed command: {0}")]
    BadCommand(String),

    /// The WRITE argument is not a usable JSON object.
    #[error("malformed WRITE argument: {0}")]
    BadWriteArgument(String),

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WireError {
    /// The canonical symbol carried in `error.type` on the wire.
    ///
    /// These symbols are part of the client contract and must not drift.
    pub fn symbol(&self) -> &'static str {
        match self {
            WireError::MissingField(_) => "KeyError",
            WireError::BadWriteArgument(_) => "TypeError",
            WireError::BadFrame(_)
            | WireError::UnhandledKind(_)
            | WireError::BadCommand(_)
            | WireError::Json(_) => "ValueError",
        }
    }
}
