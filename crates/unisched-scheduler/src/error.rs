use thiserror::Error;

use crate::types::ExecutionStatus;

/// Errors that can occur within the scheduling engine.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed cron expression, timezone, retry policy or payload.
    /// Surfaced synchronously from `upsert_schedule`; never reaches dispatch.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another engine instance holds the schedule's lease. Expected and transient.
    #[error("Lease for schedule {schedule_id} is held by another instance")]
    LockContention { schedule_id: String },

    /// The handler exceeded the schedule's `timeout_ms` and was forcibly cancelled.
    #[error("Execution timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Persistence failure that is not a plain SQLite error (poisoned
    /// connection, undecodable row, serialisation of a stored blob).
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The execution state machine was asked to make an illegal move.
    #[error("Invalid transition for execution {execution_id}: {from} -> {to}")]
    InvalidTransition {
        execution_id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: String },

    #[error("Execution not found: {id}")]
    ExecutionNotFound { id: String },

    #[error("A handler is already registered for domain {domain}")]
    DomainAlreadyRegistered { domain: String },

    #[error("No handler registered for domain {domain}")]
    DomainNotRegistered { domain: String },

    /// Dispatch for the schedule is halted after a history write failed.
    #[error("Schedule {id} is suspended: {reason}")]
    Suspended { id: String, reason: String },
}

impl SchedulerError {
    /// Short error code string for API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::LockContention { .. } => "LOCK_CONTENTION",
            SchedulerError::Timeout { .. } => "TIMEOUT",
            SchedulerError::Database(_) => "PERSISTENCE_ERROR",
            SchedulerError::Persistence(_) => "PERSISTENCE_ERROR",
            SchedulerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SchedulerError::ScheduleNotFound { .. } => "SCHEDULE_NOT_FOUND",
            SchedulerError::ExecutionNotFound { .. } => "EXECUTION_NOT_FOUND",
            SchedulerError::DomainAlreadyRegistered { .. } => "DOMAIN_ALREADY_REGISTERED",
            SchedulerError::DomainNotRegistered { .. } => "DOMAIN_NOT_REGISTERED",
            SchedulerError::Suspended { .. } => "SCHEDULE_SUSPENDED",
        }
    }

    /// True for errors raised by the storage layer. These suspend the
    /// affected schedule instead of being retried.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_) | SchedulerError::Persistence(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_errors_share_one_code() {
        let db = SchedulerError::Database(rusqlite::Error::QueryReturnedNoRows);
        let other = SchedulerError::Persistence("connection mutex poisoned".to_string());
        assert_eq!(db.code(), "PERSISTENCE_ERROR");
        assert_eq!(other.code(), "PERSISTENCE_ERROR");
        assert!(db.is_persistence());
        assert!(!SchedulerError::Validation("x".into()).is_persistence());
    }

    #[test]
    fn invalid_transition_message_names_both_states() {
        let err = SchedulerError::InvalidTransition {
            execution_id: "e1".to_string(),
            from: ExecutionStatus::Succeeded,
            to: ExecutionStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition for execution e1: succeeded -> running"
        );
    }
}
