//! Unified error type for the deltaflow engine.
//!
//! All crates funnel their failures into [`Error`]. Callers that retry work
//! (the optimistic-concurrency wrapper in particular) use
//! [`Error::is_transient`] to decide whether another attempt makes sense.

use std::fmt;

/// Unified error type covering all failure modes in deltaflow.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "deltaFile", "flow").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Caller-supplied data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Flow plans or engine configuration are inconsistent.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An inbound action event was malformed or did not fit its action.
    #[error("Invalid event for {action}: {message}")]
    InvalidEvent {
        /// Name of the action the event targeted.
        action: String,
        /// Human-readable description of the problem.
        message: String,
    },

    /// An event or transition targeted an action the flow does not consider
    /// pending. Stale and duplicate worker events end up here.
    #[error("Unexpected action {action} in flow {flow} of {did}: {reason}")]
    UnexpectedAction {
        /// The DeltaFile the event belongs to.
        did: String,
        /// Flow name (or id) the event addressed.
        flow: String,
        /// Action name the event addressed.
        action: String,
        /// Why the transition was refused.
        reason: String,
    },

    /// A byte range fell outside the content it was cut from.
    #[error("Invalid range: offset {offset}, size {size} over {total} bytes")]
    InvalidRange {
        /// Requested starting offset.
        offset: u64,
        /// Requested length.
        size: u64,
        /// Total size of the source content.
        total: u64,
    },

    /// A write lost an optimistic-version race.
    #[error("Version conflict on {id}: expected {expected}, found {found}")]
    Conflict {
        /// The entity that was written.
        id: String,
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },

    /// The bounded retry around a read-advance-write cycle gave up.
    #[error("Version conflict on {id} not resolved after {attempts} attempts")]
    ConflictExhausted {
        /// The entity that kept conflicting.
        id: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A storage backend (repository, blob store) failed.
    #[error("Storage error: {source}")]
    Storage {
        /// The underlying storage error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the whole operation from a fresh read may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::Storage { .. })
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::InvalidEvent`].
    pub fn invalid_event(action: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidEvent {
            action: action.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::UnexpectedAction`].
    pub fn unexpected_action(
        did: impl fmt::Display,
        flow: impl Into<String>,
        action: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::UnexpectedAction {
            did: did.to_string(),
            flow: flow.into(),
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [`Error::Conflict`].
    pub fn conflict(id: impl fmt::Display, expected: u64, found: u64) -> Self {
        Error::Conflict {
            id: id.to_string(),
            expected,
            found,
        }
    }

    /// Convenience constructor for [`Error::Storage`].
    pub fn storage(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Storage {
            source: source.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = Error::not_found("deltaFile", "abc-123");
        assert_eq!(err.to_string(), "deltaFile not found: abc-123");
        assert!(!err.is_transient());
    }

    #[test]
    fn unexpected_action_display() {
        let err = Error::unexpected_action("d1", "smoke", "compress", "action is CANCELLED");
        assert_eq!(
            err.to_string(),
            "Unexpected action compress in flow smoke of d1: action is CANCELLED"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn invalid_range_display() {
        let err = Error::InvalidRange {
            offset: 4,
            size: 10,
            total: 8,
        };
        assert_eq!(err.to_string(), "Invalid range: offset 4, size 10 over 8 bytes");
    }

    #[test]
    fn conflict_is_transient() {
        let err = Error::conflict("d1", 3, 4);
        assert_eq!(err.to_string(), "Version conflict on d1: expected 3, found 4");
        assert!(err.is_transient());
    }

    #[test]
    fn conflict_exhausted_is_not_transient() {
        let err = Error::ConflictExhausted {
            id: "d1".into(),
            attempts: 5,
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("5 attempts"));
    }

    #[test]
    fn storage_is_transient() {
        let err = Error::storage("connection refused");
        assert!(err.to_string().contains("connection refused"));
        assert!(err.is_transient());
    }

    #[test]
    fn io_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn invalid_event_display() {
        let err = Error::invalid_event("load", "LOAD outcome for a TRANSFORM action");
        assert_eq!(
            err.to_string(),
            "Invalid event for load: LOAD outcome for a TRANSFORM action"
        );
    }
}
