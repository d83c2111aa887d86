//! Error abstractions.

use thiserror::Error;

// Error messages.
pub const ERR_STAGING_WRITE: &str = "error writing staged segment data to disk";
pub const ERR_METADATA_READ: &str = "error reading segment metadata document";

/// Completion protocol & segment store error variants.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// The request is missing required fields or carries values which can not be parsed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// The caller does not hold the privilege needed for the requested action, or its view of
    /// the protocol state is stale.
    #[error("stale or unauthorized request: {0}")]
    StaleOrUnauthorized(String),
    /// Filesystem staging, activation or conversion failed.
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),
    /// The target has already reached a terminal state.
    #[error("target is already in a terminal state: {0}")]
    AlreadyTerminal(String),
    /// The runtime config or the target's on-disk contents are invalid.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

/// A result type where the error is a `CompletionError`.
pub type CompletionResult<T> = ::std::result::Result<T, CompletionError>;

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
