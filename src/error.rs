//! Error types for yieldpoint.

use thiserror::Error;

use crate::registry::CallToken;

/// Main error type for all yieldpoint operations.
#[derive(Debug, Error)]
pub enum YieldError {
    /// A suspension point asked for a callback that is not registered.
    ///
    /// Under correct sequential use this never happens; it signals a
    /// scheduling bug.
    #[error("No callback registered for {0}")]
    CallbackNotRegistered(CallToken),

    /// An external asynchronous operation reported a failure.
    #[error("Operation failed: {error}: {reason}")]
    OperationFailed { error: String, reason: String },

    /// A database was addressed before its connection was opened.
    #[error("Database not ready: {0}")]
    NotReady(String),

    /// Malformed request (missing identifier fields, bad view path, ...).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Response written after the request was finished.
    #[error("Request already finished")]
    RequestFinished,

    /// A computation was resumed without the value it was waiting for.
    #[error("Resumption error: {0}")]
    Resumption(String),

    /// The I/O loop was dropped while work was still being scheduled.
    #[error("I/O loop closed")]
    LoopClosed,

    /// JSON conversion error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

impl YieldError {
    /// Build an [`YieldError::OperationFailed`] from its two parts.
    pub fn operation_failed(error: impl Into<String>, reason: impl Into<String>) -> Self {
        YieldError::OperationFailed {
            error: error.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using YieldError.
pub type Result<T> = std::result::Result<T, YieldError>;
