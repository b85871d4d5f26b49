// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Repository error types for MendDB.
//
// Every failure the detector or fixer can get back from a repository call:
// I/O errors, connectivity loss, key collisions on insert, and malformed
// documents.

use thiserror::Error;

/// Errors that can occur when interacting with a repository.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred in the underlying storage layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The repository cannot be reached (e.g., connection lost).
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    /// An insert collided with an existing identifier.
    #[error("duplicate key in {collection}: {id}")]
    DuplicateKey {
        /// Collection the insert targeted.
        collection: String,
        /// The colliding identifier.
        id: String,
    },

    /// Failed to serialize or deserialize a document.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The query was rejected by the repository.
    #[error("query failed: {0}")]
    Query(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl StoreError {
    /// Whether this error means the repository itself is unreachable, as
    /// opposed to a single operation failing.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file gone");
        let err = StoreError::Io(io_err);
        assert!(err.to_string().contains("I/O error"));
        assert!(err.is_connectivity());
    }

    #[test]
    fn test_unavailable_display() {
        let err = StoreError::Unavailable("connection refused".to_string());
        assert_eq!(err.to_string(), "repository unavailable: connection refused");
        assert!(err.is_connectivity());
    }

    #[test]
    fn test_duplicate_key_display() {
        let err = StoreError::DuplicateKey {
            collection: "orders_orphaned".to_string(),
            id: "o7".to_string(),
        };
        assert!(err.to_string().contains("orders_orphaned"));
        assert!(err.to_string().contains("o7"));
        assert!(!err.is_connectivity());
    }

    #[test]
    fn test_serde_error_converts() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: StoreError = bad.into();
        assert!(err.to_string().contains("serialization error"));
    }
}
