//! Domain error model.

use thiserror::Error;

use crate::id::JobId;
use crate::state::JobState;

/// Result type used by the job state machine.
pub type JobResult<T> = Result<T, JobError>;

/// Job domain error.
///
/// An `InvalidTransition` is a coordination bug (the caller violated the
/// eligibility contract), not a job failure. The job is left untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// A state-machine operation was invoked from an ineligible source state.
    #[error("invalid transition: cannot {operation} job {job_id} in state {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        operation: &'static str,
    },

    /// A persisted record does not satisfy the job invariants.
    #[error("invalid job record: {0}")]
    InvalidRecord(String),

    /// An identifier or enumerated value failed to parse.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl JobError {
    pub fn invalid_transition(job_id: JobId, from: JobState, operation: &'static str) -> Self {
        Self::InvalidTransition {
            job_id,
            from,
            operation,
        }
    }

    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Self::InvalidRecord(msg.into())
    }

    pub fn invalid_value(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }
}
