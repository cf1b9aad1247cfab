//! `jobforge-core`: the job entity and its lifecycle state machine.
//!
//! This crate is **pure domain**: transitions mutate an in-memory [`Job`] and
//! never perform I/O. Persisting the result of a transition is the caller's
//! responsibility.

pub mod error;
pub mod id;
pub mod job;
pub mod state;

pub use error::{JobError, JobResult};
pub use id::JobId;
pub use job::{Job, JobRecord, NewJob, Payload, Priority, claim_ordering};
pub use state::JobState;
