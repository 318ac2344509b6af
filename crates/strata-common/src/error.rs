//! Error types for Strata
//!
//! This module defines the common error type used throughout the system.
//! Callers distinguish error kinds by variant; user-visible failures map
//! to stable negative errno-style codes via [`Error::errno`].

use thiserror::Error;

/// Common result type for Strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Strata
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad encoding: {0}")]
    BadEncoding(String),

    #[error("stale epoch: have {have}, delta targets {delta}")]
    EpochStale { have: u32, delta: u32 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("out of range: offset {offset} exceeds limit {limit}")]
    Range { offset: u64, limit: u64 },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("transient failure, retry after backoff: {0}")]
    Retry(String),

    #[error("internal invariant violated: {0}")]
    Fatal(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a bad encoding error
    pub fn bad_encoding(msg: impl Into<String>) -> Self {
        Self::BadEncoding(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retry(_) | Self::Timeout(_) | Self::EpochStale { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Stable numeric code reported to external callers.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => -2,            // ENOENT
            Self::Io(_) => -5,                  // EIO
            Self::EpochStale { .. } => -11,     // EAGAIN
            Self::PermissionDenied(_) => -13,   // EACCES
            Self::BadEncoding(_) => -22,        // EINVAL
            Self::Range { .. } => -34,          // ERANGE
            Self::Retry(_) => -61,              // ENODATA
            Self::Timeout(_) => -110,           // ETIMEDOUT
            Self::Fatal(_) => -125,             // ECANCELED
        }
    }
}
