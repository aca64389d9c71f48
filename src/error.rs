use std::io;

/// Semantic error kinds of the engine.
///
/// Callers dispatch on these (an RPC adapter maps them 1:1 onto status
/// codes), so the distinction between the variants is part of the API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Vault, chunk or index does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed query, filter, identifier or resume token.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the current state.
    #[error("precondition failed: {0}")]
    FailedPrecondition(String),

    /// Append on a sealed chunk.
    #[error("chunk is sealed")]
    Sealed,

    /// The ingest queue is full.
    #[error("ingest queue overloaded")]
    Overloaded,

    /// The operation was cancelled via its cancellation token.
    #[error("cancelled")]
    Cancelled,

    /// The caller-supplied deadline expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-disk data failed a consistency or checksum check.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        Error::InvalidArgument(what.into())
    }

    pub fn precondition(what: impl Into<String>) -> Self {
        Error::FailedPrecondition(what.into())
    }

    pub fn corrupt(what: impl Into<String>) -> Self {
        Error::Corrupt(what.into())
    }

    pub fn internal(what: impl Into<String>) -> Self {
        Error::Internal(what.into())
    }
}
