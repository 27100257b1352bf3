//! Error types for query compilation
//!
//! The taxonomy separates user mistakes (`InvalidSearchQuery`) from requests
//! the metrics backend cannot satisfy (`IncompatibleMetricsQuery`) and from
//! time windows outside the retention policy. Collaborator failures (indexer,
//! execution adapter) propagate unchanged; no retry logic lives here.

use thiserror::Error;

/// Main error type for query building and execution
#[derive(Error, Debug)]
pub enum Error {
    /// User input is syntactically or semantically invalid
    #[error("Invalid query. {0}")]
    InvalidSearchQuery(String),

    /// Request is well-formed but cannot be satisfied by the metrics
    /// backend's merge/limit model
    #[error("Incompatible metrics query: {0}")]
    IncompatibleMetricsQuery(String),

    /// Requested time window precedes the configured retention window
    #[error("Query start {start} is outside the {retention_days}-day retention window")]
    QueryOutsideRetention {
        /// Requested start instant (RFC 3339)
        start: String,
        /// Configured retention in days
        retention_days: i64,
    },

    /// A field name could not be resolved for the active dataset
    #[error("Unknown field: {0}")]
    UnknownField(String),

    /// A field resolved, but is not selectable in this position
    #[error("Invalid field: {0}")]
    InvalidField(String),

    /// A function name is not in the registry
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// A tag key has never been interned by the indexer
    #[error("Tag key was not found: {0}")]
    TagKeyNotFound(String),

    /// Indexer failure (unavailable, internal error)
    #[error("Indexer error: {0}")]
    Indexer(String),

    /// Execution adapter failure, propagated unchanged
    #[error("Execution error: {0}")]
    Execution(String),

    /// Query parameters are internally inconsistent
    #[error("Invalid query parameters: {0}")]
    InvalidParams(String),
}

impl Error {
    /// Shorthand for an `InvalidSearchQuery` with a formatted cause
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidSearchQuery(message.into())
    }

    /// Shorthand for an `IncompatibleMetricsQuery` with a formatted cause
    pub fn incompatible(message: impl Into<String>) -> Self {
        Error::IncompatibleMetricsQuery(message.into())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
