//! Job lifecycle state machine.
//!
//! ```text
//!   pending ──claim──► running ──complete──► completed
//!      │                 ▲   │
//!   schedule             │   └──fail──► retrying ──claim──► running
//!      ▼                 │          └─(budget spent)─► dead
//!   scheduled ──claim────┘
//!
//!   any non-terminal ──mark_dead──► dead
//! ```
//!
//! Transitions are synchronous and side-effect free beyond the in-memory
//! record. An operation invoked from an ineligible state returns
//! [`JobError::InvalidTransition`] and leaves the job unchanged.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JobError, JobResult};
use crate::job::Job;

/// Lifecycle state of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to run.
    Pending,
    /// Waiting for `run_at`.
    Scheduled,
    /// Claimed by a worker.
    Running,
    /// Failed with budget left; eligible again.
    Retrying,
    /// Transient: resolved to `retrying` or `dead` within `mark_failed`.
    Failed,
    /// Finished successfully.
    Completed,
    /// Dead-lettered.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Pending,
        JobState::Scheduled,
        JobState::Running,
        JobState::Retrying,
        JobState::Failed,
        JobState::Completed,
        JobState::Dead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Retrying => "retrying",
            JobState::Failed => "failed",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| JobError::invalid_value(format!("job state: {s}")))
    }
}

impl Job {
    /// Whether a worker may claim this job right now.
    pub fn can_run(&self) -> bool {
        self.can_run_at(Utc::now())
    }

    /// Eligibility at `now`.
    ///
    /// `pending` and `retrying` are always eligible; `scheduled` only once
    /// `run_at` is strictly in the past. Retry backoff is not encoded here;
    /// stores gate retrying jobs on their own `not_before` timestamp.
    pub fn can_run_at(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending | JobState::Retrying => true,
            JobState::Scheduled => self.run_at.is_some_and(|at| at < now),
            JobState::Running | JobState::Failed | JobState::Completed | JobState::Dead => false,
        }
    }

    /// Move an eligible job to `running`.
    pub fn claim(&mut self) -> JobResult<()> {
        self.claim_at(Utc::now())
    }

    /// Move an eligible job to `running` as of `now`.
    ///
    /// Clears any previous error and the (now meaningless) `run_at`.
    pub fn claim_at(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        if !self.can_run_at(now) {
            return Err(self.reject("claim"));
        }
        self.state = JobState::Running;
        self.error_message = None;
        self.run_at = None;
        self.last_run_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_completed(&mut self) -> JobResult<()> {
        self.require(JobState::Running, "complete")?;
        let now = Utc::now();
        self.state = JobState::Completed;
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed run.
    ///
    /// Increments `attempts` first, then lands on `retrying` while
    /// `attempts < max_attempts` and on `dead` once the budget is spent.
    /// `finished_at` is only stamped when the job is dead-lettered.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> JobResult<()> {
        self.require(JobState::Running, "fail")?;
        let now = Utc::now();
        self.attempts = self.attempts.saturating_add(1);
        self.state = JobState::Failed;
        self.error_message = Some(reason.into());
        if self.attempts < self.max_attempts {
            self.state = JobState::Retrying;
        } else {
            self.state = JobState::Dead;
            self.finished_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Dead-letter the job regardless of its remaining budget.
    ///
    /// Used for fatal, non-retryable failures. Terminal jobs are rejected.
    pub fn mark_dead(&mut self, reason: impl Into<String>) -> JobResult<()> {
        if self.state.is_terminal() {
            return Err(self.reject("dead-letter"));
        }
        let now = Utc::now();
        self.state = JobState::Dead;
        self.error_message = Some(reason.into());
        self.run_at = None;
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Defer a pending job until `run_at`.
    pub fn mark_scheduled(&mut self, run_at: DateTime<Utc>) -> JobResult<()> {
        self.require(JobState::Pending, "schedule")?;
        self.state = JobState::Scheduled;
        self.run_at = Some(run_at);
        self.updated_at = Utc::now();
        Ok(())
    }

    fn require(&self, expected: JobState, operation: &'static str) -> JobResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.reject(operation))
        }
    }

    fn reject(&self, operation: &'static str) -> JobError {
        JobError::invalid_transition(self.id, self.state, operation)
    }
}
