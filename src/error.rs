//! Error taxonomy for bus operations.

use crate::error_format::RemoteError;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Routing key failed validation for the requested operation.
    /// Fatal to the call; never retried.
    #[error("{0}")]
    Validation(String),

    /// A synchronous call exceeded its deadline. The remote handler
    /// invocation is not cancelled.
    #[error("Operation Timed Out.")]
    Timeout,

    /// The remote handler of a synchronous call failed. Carries the
    /// error payload exactly as the remote service's formatter produced it.
    #[error("remote handler failed: {0}")]
    Remote(RemoteError),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The reply channel for a pending call closed before a reply arrived.
    #[error("reply channel closed before resolution")]
    ReplyDropped,
}
