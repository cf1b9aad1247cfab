//! The job entity.
//!
//! A [`Job`] is a persisted unit of work. Its fields are private: producers
//! create jobs with [`Job::new`] or through a [`NewJob`] builder, and after
//! creation the lifecycle fields change only through the transition methods
//! in [`crate::state`].

use core::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JobError, JobResult};
use crate::id::JobId;
use crate::state::JobState;

/// Opaque job arguments, interpreted only by the handler.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Default retry budget for a new job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Ordering hint among eligible jobs. Never used for correctness.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
}

impl Priority {
    pub fn as_i16(self) -> i16 {
        self as i16
    }
}

impl TryFrom<i16> for Priority {
    type Error = JobError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Medium),
            3 => Ok(Priority::High),
            other => Err(JobError::invalid_value(format!("priority: {other}"))),
        }
    }
}

/// A unit of work with lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JobRecord", into = "JobRecord")]
pub struct Job {
    pub(crate) id: JobId,
    pub(crate) job_type: String,
    pub(crate) payload: Payload,
    pub(crate) state: JobState,
    pub(crate) attempts: u32,
    pub(crate) max_attempts: u32,
    pub(crate) run_at: Option<DateTime<Utc>>,
    pub(crate) last_run_at: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
    pub(crate) error_message: Option<String>,
    pub(crate) priority: Priority,
    pub(crate) idempotency_key: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new `pending` job with default priority and retry budget.
    ///
    /// `idempotency_key` is the producer's uniqueness token: stores treat a
    /// second enqueue with the same key as a no-op.
    pub fn new(
        job_type: impl Into<String>,
        payload: Payload,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self::builder(job_type, payload, idempotency_key).build()
    }

    /// Start building a job whose priority, retry budget or schedule differ
    /// from the defaults.
    pub fn builder(
        job_type: impl Into<String>,
        payload: Payload,
        idempotency_key: impl Into<String>,
    ) -> NewJob {
        NewJob {
            job_type: job_type.into(),
            payload,
            idempotency_key: idempotency_key.into(),
            priority: Priority::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            run_at: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Scheduled run time. Only ever present while the job is `scheduled`.
    pub fn run_at(&self) -> Option<DateTime<Utc>> {
        self.run_at
    }

    pub fn last_run_at(&self) -> Option<DateTime<Utc>> {
        self.last_run_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// The instant used to order this job among equal-priority peers.
    pub fn ready_at(&self) -> DateTime<Utc> {
        match (self.state, self.run_at) {
            (JobState::Scheduled, Some(at)) => at,
            _ => self.created_at,
        }
    }

    /// Convert into the flat persisted representation.
    pub fn into_record(self) -> JobRecord {
        JobRecord {
            id: self.id,
            job_type: self.job_type,
            payload: self.payload,
            state: self.state,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            run_at: self.run_at,
            last_run_at: self.last_run_at,
            finished_at: self.finished_at,
            error_message: self.error_message,
            priority: self.priority,
            idempotency_key: self.idempotency_key,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Verify the data-model invariants.
    ///
    /// - `failed` is never observable outside a transition
    /// - `finished_at` is set iff the job is terminal
    /// - `error_message` is set iff the job is `retrying` or `dead`
    /// - `run_at` is set iff the job is `scheduled`
    /// - a `retrying` job still has budget left
    pub fn check_invariants(&self) -> JobResult<()> {
        if self.state == JobState::Failed {
            return Err(JobError::invalid_record(format!(
                "job {} is in transient state failed",
                self.id
            )));
        }
        if self.finished_at.is_some() != self.state.is_terminal() {
            return Err(JobError::invalid_record(format!(
                "job {} in state {} has finished_at = {:?}",
                self.id, self.state, self.finished_at
            )));
        }
        let expects_error = matches!(self.state, JobState::Retrying | JobState::Dead);
        if self.error_message.is_some() != expects_error {
            return Err(JobError::invalid_record(format!(
                "job {} in state {} has error_message = {:?}",
                self.id, self.state, self.error_message
            )));
        }
        if self.run_at.is_some() != (self.state == JobState::Scheduled) {
            return Err(JobError::invalid_record(format!(
                "job {} in state {} has run_at = {:?}",
                self.id, self.state, self.run_at
            )));
        }
        if self.state == JobState::Retrying && self.attempts >= self.max_attempts {
            return Err(JobError::invalid_record(format!(
                "job {} is retrying with {}/{} attempts",
                self.id, self.attempts, self.max_attempts
            )));
        }
        if self.updated_at < self.created_at {
            return Err(JobError::invalid_record(format!(
                "job {} was updated before it was created",
                self.id
            )));
        }
        Ok(())
    }
}

/// A job that has not been created yet.
///
/// Priority, retry budget and schedule are fixed here, before the job
/// exists; once built, only the transitions in [`crate::state`] change it.
///
/// ```
/// use jobforge_core::{Job, JobState, Payload, Priority};
///
/// let job = Job::builder("email.send", Payload::new(), "welcome-42")
///     .with_priority(Priority::High)
///     .with_max_attempts(3)
///     .build();
/// assert_eq!(job.state(), JobState::Pending);
/// assert_eq!(job.max_attempts(), 3);
/// ```
///
/// A job that already exists has no such setters:
///
/// ```compile_fail
/// use jobforge_core::{Job, Payload};
///
/// let job = Job::new("email.send", Payload::new(), "welcome-42");
/// let job = job.with_max_attempts(1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    job_type: String,
    payload: Payload,
    idempotency_key: String,
    priority: Priority,
    max_attempts: u32,
    run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Create the job in `scheduled` state, ineligible until `run_at` passes.
    pub fn scheduled_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Create the job: `scheduled` when a run time was given, else `pending`.
    pub fn build(self) -> Job {
        let now = Utc::now();
        let state = match self.run_at {
            Some(_) => JobState::Scheduled,
            None => JobState::Pending,
        };
        Job {
            id: JobId::new(),
            job_type: self.job_type,
            payload: self.payload,
            state,
            attempts: 0,
            max_attempts: self.max_attempts,
            run_at: self.run_at,
            last_run_at: None,
            finished_at: None,
            error_message: None,
            priority: self.priority,
            idempotency_key: self.idempotency_key,
            created_at: now,
            updated_at: now,
        }
    }
}

impl From<NewJob> for Job {
    fn from(new: NewJob) -> Self {
        new.build()
    }
}

/// Flat persisted form of a [`Job`].
///
/// Storage adapters read and write this; converting back with
/// `Job::try_from` re-validates every invariant so a corrupted row cannot
/// re-enter the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: String,
    pub payload: Payload,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub priority: Priority,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRecord> for Job {
    type Error = JobError;

    fn try_from(record: JobRecord) -> Result<Self, Self::Error> {
        let job = Job {
            id: record.id,
            job_type: record.job_type,
            payload: record.payload,
            state: record.state,
            attempts: record.attempts,
            max_attempts: record.max_attempts,
            run_at: record.run_at,
            last_run_at: record.last_run_at,
            finished_at: record.finished_at,
            error_message: record.error_message,
            priority: record.priority,
            idempotency_key: record.idempotency_key,
            created_at: record.created_at,
            updated_at: record.updated_at,
        };
        job.check_invariants()?;
        Ok(job)
    }
}

impl From<Job> for JobRecord {
    fn from(job: Job) -> Self {
        job.into_record()
    }
}

/// Claiming order among eligible jobs.
///
/// Higher priority first; within a priority, earliest `run_at`/`created_at`
/// first; remaining ties fall back to creation time and then the
/// time-ordered id.
pub fn claim_ordering(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.ready_at().cmp(&b.ready_at()))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}
