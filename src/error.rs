//! Error types for campipe.

use thiserror::Error;

/// Result type alias using campipe's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for campipe operations.
///
/// Resource exhaustion (an empty pool) is not represented here: acquiring a
/// buffer yields `Option` so the caller decides whether to retry.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration rejected before any resource was touched.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A buffer was returned to a pool that does not hold it as busy.
    #[error("buffer {index} is not busy in pool {pool}")]
    BufferNotBusy {
        /// Pool the buffer was returned to.
        pool: u64,
        /// Per-pool index carried by the buffer.
        index: u32,
    },

    /// Unknown stream, pool, capture or node id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Pipeline graph construction or dispatch failed.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Shorthand for [`Error::InvalidState`].
    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Shorthand for [`Error::Pipeline`].
    pub(crate) fn pipeline(msg: impl Into<String>) -> Self {
        Error::Pipeline(msg.into())
    }
}
