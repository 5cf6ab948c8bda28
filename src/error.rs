//! Error types for the query cache.

use crate::key::QueryKey;
use std::fmt;
use std::sync::Arc;

/// Result type for query cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error produced by a fetch or mutation function, stored verbatim.
///
/// The cache never wraps or reinterprets it: `to_string()` on a stored
/// `QueryError` yields exactly the message of the original error.
pub type QueryError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Error types for the query cache.
///
/// Observers never see these as failures: fetch errors are delivered through
/// [`QueryState`](crate::state::QueryState). Only awaiting APIs such as
/// [`QueryCache::refetch`](crate::QueryCache::refetch) or
/// [`Mutation::mutate`](crate::mutation::Mutation::mutate) return them.
#[derive(Debug, Clone)]
pub enum Error {
    /// The query's fetch function failed.
    ///
    /// Carries the original error untouched. The entry keeps the last
    /// successful data, if any.
    Fetch(QueryError),

    /// A mutation function failed.
    ///
    /// Mutations are never retried, and keys listed for invalidation are
    /// left untouched.
    Mutation(QueryError),

    /// The key already holds data of a different type.
    ///
    /// Raised when two subscriptions use the same key with different data
    /// types. Each key stores exactly one canonical type.
    TypeMismatch {
        /// Key that was accessed
        key: QueryKey,
        /// Type requested by the caller
        expected: &'static str,
    },

    /// No entry, or no fetch function, is registered for the key.
    NotFound(QueryKey),

    /// The fetch task was cancelled or panicked before producing a result.
    ///
    /// **Recovery:** Refetch the key.
    Cancelled(String),

    /// Invalid cache configuration.
    ///
    /// Raised for a zero retry delay with a non-zero retry count, or when a
    /// cache operation runs outside a tokio runtime.
    ConfigError(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// The original fetch or mutation error, if this is one.
    pub fn source_error(&self) -> Option<&QueryError> {
        match self {
            Error::Fetch(e) | Error::Mutation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Fetch(e) => write!(f, "Fetch error: {}", e),
            Error::Mutation(e) => write!(f, "Mutation error: {}", e),
            Error::TypeMismatch { key, expected } => {
                write!(f, "Type mismatch for {}: expected {}", key, expected)
            }
            Error::NotFound(key) => write!(f, "No query registered for {}", key),
            Error::Cancelled(msg) => write!(f, "Fetch cancelled: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Fetch(e) | Error::Mutation(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(format!("Key serialization failed: {}", e))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Cancelled(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}
