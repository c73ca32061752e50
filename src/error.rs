//! Error taxonomy for the control engine.
//!
//! Every failure carries a machine-readable [`ErrorKind`] whose string
//! form is the wire code reported to clients. Wrapping adds context but
//! never discards the kind; the file layer's typed errors map into these
//! kinds losslessly.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::file::FileError;

/// Wire-visible failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed or out-of-contract argument from the caller.
    BadValue,
    /// A requested revision is outside the stream's log.
    RevisionNotAvailable,
    /// Conditional write lost a race (a path expected empty was not).
    PathNotEmpty,
    /// A wait or storage operation exceeded its deadline.
    TimedOut,
    /// The operation was cancelled.
    Aborted,
    /// The append retry budget was exhausted.
    TooManyRetries,
    /// A persisted change failed to decode or the log shape is invalid.
    StorageCorrupt,
    /// An internal algebraic invariant was violated; a bug, not retried.
    InvariantViolation,
    /// The named caret session does not exist.
    UnknownSession,
    /// The session exists but belongs to a different author.
    WrongAuthor,
}

impl ErrorKind {
    /// The stable wire code for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BadValue => "bad_value",
            ErrorKind::RevisionNotAvailable => "revision_not_available",
            ErrorKind::PathNotEmpty => "path_not_empty",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Aborted => "aborted",
            ErrorKind::TooManyRetries => "too_many_retries",
            ErrorKind::StorageCorrupt => "storage_corrupt",
            ErrorKind::InvariantViolation => "invariant_violation",
            ErrorKind::UnknownSession => "unknown_session",
            ErrorKind::WrongAuthor => "wrong_author",
        }
    }

    /// Whether the document must be reopened before further use.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::StorageCorrupt | ErrorKind::InvariantViolation)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A control-engine failure: a kind plus human-readable context.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ControlError {
    kind: ErrorKind,
    message: String,
}

impl ControlError {
    /// Build an error with the given kind and context message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The context message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Re-wrap with additional context, preserving the kind.
    pub fn context(self, context: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{context}: {}", self.message),
        }
    }

    /// Shorthand for a `bad_value` error.
    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadValue, message)
    }

    /// Shorthand for a `revision_not_available` error.
    pub fn revision_not_available(rev: u64, head: u64) -> Self {
        Self::new(
            ErrorKind::RevisionNotAvailable,
            format!("revision {rev} not available (head {head})"),
        )
    }
}

impl From<FileError> for ControlError {
    fn from(e: FileError) -> Self {
        let kind = match &e {
            FileError::PathNotEmpty(_) => ErrorKind::PathNotEmpty,
            FileError::PathNotFound(_) => ErrorKind::RevisionNotAvailable,
            FileError::PathHashMismatch(_) => ErrorKind::PathNotEmpty,
            FileError::TimedOut => ErrorKind::TimedOut,
            FileError::TransactionAborted(_) => ErrorKind::Aborted,
            FileError::FileNotFound => ErrorKind::StorageCorrupt,
        };
        Self::new(kind, e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(ErrorKind::BadValue.as_str(), "bad_value");
        assert_eq!(ErrorKind::TooManyRetries.as_str(), "too_many_retries");
        assert_eq!(ErrorKind::WrongAuthor.as_str(), "wrong_author");
        assert_eq!(
            ErrorKind::InvariantViolation.to_string(),
            "invariant_violation"
        );
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(ErrorKind::StorageCorrupt.is_fatal());
        assert!(ErrorKind::InvariantViolation.is_fatal());
        assert!(!ErrorKind::PathNotEmpty.is_fatal());
        assert!(!ErrorKind::Aborted.is_fatal());
    }

    #[test]
    fn test_context_preserves_kind() {
        let e = ControlError::bad_value("negative length")
            .context("caret update");
        assert_eq!(e.kind(), ErrorKind::BadValue);
        assert!(e.to_string().contains("caret update"));
        assert!(e.to_string().contains("negative length"));
    }

    #[test]
    fn test_file_error_mapping() {
        let p = crate::types::StoragePath::parse("/body/change/3").unwrap();
        let e: ControlError = FileError::PathNotEmpty(p).into();
        assert_eq!(e.kind(), ErrorKind::PathNotEmpty);

        let e: ControlError = FileError::TimedOut.into();
        assert_eq!(e.kind(), ErrorKind::TimedOut);
    }
}
