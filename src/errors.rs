//! Typed error hierarchy for turnflow.
//!
//! One enum per subsystem:
//! - `DocumentError`: working-document section lifecycle violations
//! - `StoreError`: authoritative turn store and turn-number allocation
//! - `IndexError`: the rebuildable SQLite turn index
//! - `PipelineError`: failures that abort a turn (only store I/O does)

use std::path::PathBuf;
use thiserror::Error;

/// Errors from `WorkingDocument` mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Section {section} already exists")]
    SectionExists { section: u8 },

    #[error("Section {section} does not exist")]
    SectionMissing { section: u8 },

    #[error("Section {section} is out of range (0..=7)")]
    InvalidSection { section: u8 },

    #[error("Section 0 is immutable once the query analysis is set")]
    QueryImmutable,
}

/// Errors from the filesystem turn store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed turn metadata at {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Turn {turn} not found for user {user_id}")]
    TurnNotFound { user_id: String, turn: u64 },

    #[error("Attempt {attempt} of turn {turn} is already archived")]
    AttemptExists { turn: u64, attempt: u32 },

    #[error("Turn counter lock poisoned")]
    LockPoisoned,

    #[error("Invalid identifier '{0}': must be non-empty and contain no path separators")]
    InvalidId(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from the turn index cache.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Turn {turn} is not indexed")]
    NotIndexed { turn: u64 },

    #[error("Invalid index row for turn {turn}: {message}")]
    InvalidRow { turn: u64, message: String },

    #[error("Index lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors that abort a pipeline turn.
///
/// Strategy, tool and validation failures are recovered inside the controller;
/// only the authoritative store can fail a turn.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Turn store error: {0}")]
    Store(#[from] StoreError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_error_carries_section_number() {
        let err = DocumentError::SectionExists { section: 3 };
        assert!(err.to_string().contains('3'));
        assert!(matches!(err, DocumentError::SectionExists { section: 3 }));
    }

    #[test]
    fn store_error_io_carries_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StoreError::io("/data/turns", io_err);
        match &err {
            StoreError::Io { path, source } => {
                assert_eq!(path, &PathBuf::from("/data/turns"));
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Io variant"),
        }
    }

    #[test]
    fn index_error_converts_from_store_error() {
        let inner = StoreError::TurnNotFound {
            user_id: "u1".into(),
            turn: 7,
        };
        let err: IndexError = inner.into();
        assert!(matches!(
            err,
            IndexError::Store(StoreError::TurnNotFound { turn: 7, .. })
        ));
    }

    #[test]
    fn pipeline_error_converts_from_document_error() {
        let err: PipelineError = DocumentError::QueryImmutable.into();
        assert!(matches!(
            err,
            PipelineError::Document(DocumentError::QueryImmutable)
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&DocumentError::QueryImmutable);
        assert_std_error(&StoreError::LockPoisoned);
        assert_std_error(&IndexError::LockPoisoned);
        assert_std_error(&PipelineError::Document(DocumentError::QueryImmutable));
    }
}
