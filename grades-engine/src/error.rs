//! Error types for grades-engine
//!
//! Every error is classified as terminal, transient (retry with backoff) or
//! benign (`StaleWrite`). The coordinator decides retries from
//! [`GradesError::is_transient`] alone.

use grades_common::CourseId;
use thiserror::Error;

/// Main error type for the grades engine
#[derive(Error, Debug)]
pub enum GradesError {
    /// Bad inputs to the problem score store (terminal)
    #[error("Invalid score: {0}")]
    InvalidScore(String),

    /// Block structure snapshot cannot be returned right now (transient)
    #[error("Snapshot unavailable for {course_id}: {reason}")]
    SnapshotUnavailable { course_id: CourseId, reason: String },

    /// A writer lost the race; the stored row is already as fresh (benign)
    #[error("Stale write rejected: {0}")]
    StaleWrite(String),

    /// Store did not answer in time, e.g. database lock contention (transient)
    #[error("Store timeout: {0}")]
    StoreTimeout(String),

    /// Concurrent modification detected by the store (transient)
    #[error("Store conflict: {0}")]
    StoreConflict(String),

    /// Grading policy violates its invariants (terminal)
    #[error("Grading policy inconsistency: {0}")]
    PolicyInconsistency(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Database errors not covered by the kinds above
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// grades-common error
    #[error("Common error: {0}")]
    Common(grades_common::Error),
}

impl GradesError {
    /// Transient errors are retried by the coordinator
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GradesError::SnapshotUnavailable { .. }
                | GradesError::StoreTimeout(_)
                | GradesError::StoreConflict(_)
        )
    }

    /// Stale writes count as success for callers
    pub fn is_benign(&self) -> bool {
        matches!(self, GradesError::StaleWrite(_))
    }

    /// Stable machine-readable reason code for structured events
    pub fn reason_code(&self) -> &'static str {
        match self {
            GradesError::InvalidScore(_) => "invalid_score",
            GradesError::SnapshotUnavailable { .. } => "snapshot_unavailable",
            GradesError::StaleWrite(_) => "stale_write",
            GradesError::StoreTimeout(_) => "store_timeout",
            GradesError::StoreConflict(_) => "store_conflict",
            GradesError::PolicyInconsistency(_) => "policy_inconsistency",
            GradesError::NotFound(_) => "not_found",
            GradesError::InvalidInput(_) => "invalid_input",
            GradesError::Database(_) => "database_error",
            GradesError::Serialization(_) => "serialization_error",
            GradesError::Common(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for GradesError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => GradesError::StoreTimeout(err.to_string()),
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    GradesError::StoreConflict(db_err.message().to_string())
                } else if matches!(db_err.code().as_deref(), Some("5") | Some("6"))
                    || db_err.message().contains("database is locked")
                {
                    GradesError::StoreTimeout(db_err.message().to_string())
                } else {
                    GradesError::Database(err)
                }
            }
            _ => GradesError::Database(err),
        }
    }
}

impl From<grades_common::Error> for GradesError {
    fn from(err: grades_common::Error) -> Self {
        match err {
            grades_common::Error::Database(db_err) => db_err.into(),
            grades_common::Error::NotFound(msg) => GradesError::NotFound(msg),
            grades_common::Error::InvalidInput(msg) => GradesError::InvalidInput(msg),
            other => GradesError::Common(other),
        }
    }
}

/// Convenience Result type using GradesError
pub type Result<T> = std::result::Result<T, GradesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GradesError::SnapshotUnavailable {
            course_id: CourseId::new("c"),
            reason: "mid-publish".into()
        }
        .is_transient());
        assert!(GradesError::StoreTimeout("locked".into()).is_transient());
        assert!(GradesError::StoreConflict("row changed".into()).is_transient());

        assert!(!GradesError::InvalidScore("earned > possible".into()).is_transient());
        assert!(!GradesError::PolicyInconsistency("weights".into()).is_transient());
        assert!(!GradesError::StaleWrite("older".into()).is_transient());
    }

    #[test]
    fn test_stale_write_is_benign() {
        assert!(GradesError::StaleWrite("x".into()).is_benign());
        assert!(!GradesError::StoreTimeout("x".into()).is_benign());
    }

    #[test]
    fn test_pool_timeout_maps_to_store_timeout() {
        let err: GradesError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.reason_code(), "store_timeout");
    }

    #[test]
    fn test_common_not_found_maps_through() {
        let err: GradesError = grades_common::Error::NotFound("course".into()).into();
        assert!(matches!(err, GradesError::NotFound(_)));
    }
}
