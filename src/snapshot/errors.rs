//! # Snapshot Errors

use thiserror::Error;

/// Result type for snapshot operations
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Errors raised while reading a revision-addressed content tree
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Can't find a commit for \"{0}\"")]
    UnknownReference(String),

    #[error("Unknown snapshot: {0}")]
    UnknownSnapshot(String),

    #[error("Unknown blob: {0}")]
    UnknownBlob(String),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("Malformed tree listing: {0}")]
    MalformedListing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_reference_message() {
        let err = SnapshotError::UnknownReference("main".into());
        assert_eq!(err.to_string(), "Can't find a commit for \"main\"");
    }
}
