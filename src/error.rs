//! Error types shared across the engine.
//!
//! Every failure surfaced to a caller carries a stable machine-readable
//! `kind` string (used by the REST facade and tool servers) next to the
//! human-readable message. Internal errors from sqlx and std::io fold into
//! `storage_failed` so the storage layer can use `?` throughout.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("storage failed: {0}")]
    StorageFailed(String),

    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("no port available: {0}")]
    PortUnavailable(String),

    #[error("subprocess failed: {0}")]
    SubprocessFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable kind string for the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::UnsupportedFormat(_) => "unsupported_format",
            Error::ExtractionFailed(_) => "extraction_failed",
            Error::EmbeddingFailed(_) => "embedding_failed",
            Error::StorageFailed(_) => "storage_failed",
            Error::IndexCorrupt(_) => "index_corrupt",
            Error::PortUnavailable(_) => "port_unavailable",
            Error::SubprocessFailed(_) => "subprocess_failed",
            Error::Timeout(_) => "timeout",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::StorageFailed(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::StorageFailed(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(Error::Conflict("x".into()).kind(), "conflict");
        assert_eq!(Error::Cancelled.kind(), "cancelled");
        assert_eq!(Error::PortUnavailable("x".into()).kind(), "port_unavailable");
    }

    #[test]
    fn io_errors_fold_into_storage() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(e.kind(), "storage_failed");
    }
}
