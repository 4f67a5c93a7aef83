use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for the bridge.
///
/// Variants follow the transport-facing taxonomy: every error that crosses a
/// transport boundary maps onto one of these kinds via [`BridgeError::code`].
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed input: bad JID, empty text, missing required parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced message or chat does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is not legal in the current session state.
    #[error("precondition failed: {0}")]
    FailedPrecondition(String),

    /// Transient library failure (disconnected, send failed after retries).
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Persistent-store failure, surfaced untouched from sqlx.
    #[error("storage error: {0}")]
    Storage(String),

    /// Unexpected internal failure, including recovered panics.
    #[error("internal error: {0}")]
    Internal(String),

    /// The caller's cancellation token fired.
    #[error("canceled")]
    Canceled,

    /// A deadline elapsed (pairing window, shutdown drain).
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Wire-level status code shared by all transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Unavailable,
    Internal,
    Canceled,
    DeadlineExceeded,
}

impl BridgeError {
    /// Map this error onto the transport status code taxonomy.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::InvalidArgument,
            Self::NotFound(_) => StatusCode::NotFound,
            Self::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            Self::Unavailable(_) => StatusCode::Unavailable,
            Self::Canceled => StatusCode::Canceled,
            Self::DeadlineExceeded(_) => StatusCode::DeadlineExceeded,
            Self::Storage(_) | Self::Internal(_) | Self::Io(_) | Self::Serialization(_) => {
                StatusCode::Internal
            }
        }
    }
}
