//! Error types for hookgraph-core

use thiserror::Error;

/// Main error type for the hookgraph-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Inbound hook payload that does not match any known event shape
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Subagent transcript could not be read
    #[error("transcript error in {path}: {message}")]
    Transcript { path: String, message: String },

    /// Graph store rejected a request or was unreachable
    #[error("graph store error: {0}")]
    Graph(String),

    /// A store call exceeded its deadline
    #[error("timed out after {0}ms")]
    Timeout(u64),
}

impl Error {
    /// Whether a later attempt may succeed where this one failed.
    ///
    /// Malformed input never becomes valid on retry; an unavailable store might.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Graph(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("request failed")
                    || msg.contains("connection")
                    || msg.contains("timeout")
                    || msg.contains("(5")
                    || msg.contains("transient")
            }
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Result type alias for hookgraph-core
pub type Result<T> = std::result::Result<T, Error>;
