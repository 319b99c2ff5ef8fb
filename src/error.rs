//! Bridge Error Types
//!
//! One taxonomy for everything the bridge and its session sources can fail with.

use thiserror::Error;

/// Errors surfaced by the bridge and by session-source backends
#[derive(Error, Debug)]
pub enum BridgeError {
    // Subscriber-facing argument errors
    #[error("Unknown event kind: {0}")]
    InvalidEventKind(String),

    // Source lifecycle errors
    #[error("Session source unavailable: {0}")]
    SourceUnavailable(String),

    // A single session's property read failed (the producing app may have
    // crashed mid-read); recovered locally with an error marker on the record
    #[error("Session property read failed: {0}")]
    SessionRead(String),

    // The OS rejected a per-event-kind subscribe/unsubscribe; recovered
    // locally per kind
    #[error("Subscription rejected: {0}")]
    Subscription(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Bridge has been shut down")]
    TornDown,

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BridgeError> for String {
    fn from(err: BridgeError) -> String {
        err.to_string()
    }
}

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
