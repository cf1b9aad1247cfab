//! Durable job queue: storage, retry backoff and the coordinator.
//!
//! ## Components
//!
//! - `JobStore`: persistence boundary (in-memory or Postgres)
//! - `BackoffPolicy`: delay between failed attempts
//! - `JobCoordinator`: claims jobs, runs handlers, reports outcomes
//!
//! Lifecycle rules live in `jobforge_core`; nothing here mutates a job except
//! through its transition methods.

pub mod backoff;
pub mod coordinator;
pub mod postgres;
pub mod store;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use coordinator::{
    CoordinatorConfig, CoordinatorError, CoordinatorHandle, CoordinatorStats, ExecutionError,
    JobCoordinator, JobHandler, ProcessedJob, SaveRetry,
};
pub use postgres::PgJobStore;
pub use store::{Enqueued, InMemoryJobStore, JobStats, JobStore, JobStoreError};
