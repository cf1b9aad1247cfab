//! Queue coordinator: claims jobs, runs handlers, reports outcomes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use jobforge_core::{Job, JobError, JobId, JobState, Payload};

use super::backoff::BackoffPolicy;
use super::store::{Enqueued, JobStore, JobStoreError};

/// Handler failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// Counts against the job's budget; the job is retried while budget remains.
    #[error("{0}")]
    Retryable(String),
    /// Dead-letters the job immediately.
    #[error("{0}")]
    Fatal(String),
}

impl ExecutionError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

/// Business logic for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, payload: Payload) -> Result<(), ExecutionError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ExecutionError>> + Send + 'static,
{
    async fn execute(&self, payload: Payload) -> Result<(), ExecutionError> {
        (self.0)(payload).await
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Number of concurrent worker tasks
    pub workers: usize,
    /// How long an idle worker waits before polling again
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(1),
            name: "jobforge".to_string(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn validate(&self) -> Result<(), CoordinatorError> {
        if self.workers == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "workers must be greater than 0".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(CoordinatorError::InvalidConfig(
                "poll_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Coordinator error.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid coordinator config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Transition(#[from] JobError),
    #[error("worker task panicked: {0}")]
    WorkerPanicked(String),
}

/// Result of one claim/execute/report cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedJob {
    pub job_id: JobId,
    pub job_type: String,
    /// State the job was persisted in: `completed`, `retrying` or `dead`.
    pub state: JobState,
    pub attempts: u32,
    /// Earliest time a retrying job may be claimed again.
    pub not_before: Option<DateTime<Utc>>,
}

/// Coordinator runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CoordinatorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    /// Outcomes that could not be persisted; those jobs are left `running`.
    pub outcome_save_failures: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control running workers.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) also
/// stops the workers: each finishes and reports its current job, then exits
/// without claiming another. Dropping does not wait for them.
#[derive(Debug)]
pub struct CoordinatorHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<CoordinatorStats>>,
    started: Instant,
}

impl CoordinatorHandle {
    /// Stop polling, let in-flight jobs finish, and wait for every worker.
    pub async fn shutdown(self) -> Result<(), CoordinatorError> {
        let _ = self.shutdown.send(true);
        let mut panicked = None;
        for worker in self.workers {
            if let Err(e) = worker.await {
                panicked.get_or_insert_with(|| e.to_string());
            }
        }
        match panicked {
            Some(msg) => Err(CoordinatorError::WorkerPanicked(msg)),
            None => Ok(()),
        }
    }

    /// Get current statistics.
    pub fn stats(&self) -> CoordinatorStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

/// Queue coordinator.
///
/// Claims eligible jobs from a [`JobStore`], dispatches them to registered
/// handlers, and persists the outcome through the job state machine.
///
/// Transient store errors while saving an outcome are retried up to
/// [`SaveRetry::attempts`] times. A job whose outcome still cannot be
/// persisted stays `running` in the store and is counted in
/// [`CoordinatorStats::outcome_save_failures`]; it is not counted as
/// processed.
pub struct JobCoordinator<S: JobStore> {
    store: S,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    backoff: BackoffPolicy,
    save_retry: SaveRetry,
    stats: Arc<Mutex<CoordinatorStats>>,
}

/// Retry budget for persisting a job outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveRetry {
    /// Total save calls, including the first.
    pub attempts: u32,
    /// Pause between calls.
    pub delay: Duration,
}

impl Default for SaveRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

impl<S: JobStore + 'static> JobCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            backoff: BackoffPolicy::default(),
            save_retry: SaveRetry::default(),
            stats: Arc::new(Mutex::new(CoordinatorStats::default())),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_save_retry(mut self, save_retry: SaveRetry) -> Self {
        self.save_retry = save_retry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Register a handler for a job type pattern.
    ///
    /// Patterns are an exact type name, a category such as `"email.*"`, or
    /// `"*"` for everything.
    pub fn register(&mut self, type_pattern: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(type_pattern.into(), handler);
    }

    /// Register an async closure as a handler.
    pub fn register_handler<F, Fut>(&mut self, type_pattern: impl Into<String>, handler: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ExecutionError>> + Send + 'static,
    {
        self.register(type_pattern, Arc::new(FnHandler(handler)));
    }

    fn get_handler(&self, job_type: &str) -> Option<&Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h);
        }

        // Longest matching category wins ("email.bulk.*" over "email.*").
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = job_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler);
        if category.is_some() {
            return category;
        }

        self.handlers.get("*")
    }

    /// Enqueue through the underlying store.
    pub async fn enqueue(&self, job: Job) -> Result<Enqueued, CoordinatorError> {
        Ok(self.store.enqueue(job).await?)
    }

    /// Run one claim/execute/report cycle.
    ///
    /// Returns `None` when no job is eligible.
    pub async fn process_next(&self) -> Result<Option<ProcessedJob>, CoordinatorError> {
        let Some(mut job) = self.store.claim_next(Utc::now()).await? else {
            return Ok(None);
        };
        debug!(
            job_id = %job.id(),
            job_type = job.job_type(),
            attempts = job.attempts(),
            "claimed job"
        );

        self.update_stats(|s| s.current_running += 1);
        let outcome = self.execute(&job).await;
        let reported = self.report(&mut job, outcome).await;

        self.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            match &reported {
                Ok(processed) => {
                    s.jobs_processed += 1;
                    match processed.state {
                        JobState::Completed => s.jobs_succeeded += 1,
                        JobState::Retrying => s.jobs_failed += 1,
                        JobState::Dead => {
                            s.jobs_failed += 1;
                            s.jobs_dead_lettered += 1;
                        }
                        _ => {}
                    }
                }
                Err(CoordinatorError::Store(_)) => s.outcome_save_failures += 1,
                Err(_) => {}
            }
        });

        reported.map(Some)
    }

    async fn execute(&self, job: &Job) -> Result<(), ExecutionError> {
        let Some(handler) = self.get_handler(job.job_type()) else {
            let error = format!("no handler registered for job type {:?}", job.job_type());
            warn!(job_id = %job.id(), error = %error, "no handler for job");
            return Err(ExecutionError::Fatal(error));
        };

        let handler = Arc::clone(handler);
        let payload = job.payload().clone();
        match tokio::spawn(async move { handler.execute(payload).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ExecutionError::retryable("handler panicked")),
            Err(e) => Err(ExecutionError::retryable(format!("handler task failed: {e}"))),
        }
    }

    async fn report(
        &self,
        job: &mut Job,
        outcome: Result<(), ExecutionError>,
    ) -> Result<ProcessedJob, CoordinatorError> {
        let not_before = match outcome {
            Ok(()) => {
                job.mark_completed()?;
                info!(job_id = %job.id(), job_type = job.job_type(), "job completed");
                None
            }
            Err(ExecutionError::Retryable(reason)) => {
                job.mark_failed(reason)?;
                if job.state() == JobState::Retrying {
                    let not_before = self.backoff.not_before(job.attempts(), Utc::now());
                    info!(
                        job_id = %job.id(),
                        attempts = job.attempts(),
                        max_attempts = job.max_attempts(),
                        not_before = %not_before,
                        error = job.error_message().unwrap_or_default(),
                        "job failed; retry scheduled"
                    );
                    Some(not_before)
                } else {
                    warn!(
                        job_id = %job.id(),
                        attempts = job.attempts(),
                        error = job.error_message().unwrap_or_default(),
                        "job dead-lettered after exhausting attempts"
                    );
                    None
                }
            }
            Err(ExecutionError::Fatal(reason)) => {
                job.mark_dead(reason)?;
                warn!(
                    job_id = %job.id(),
                    error = job.error_message().unwrap_or_default(),
                    "job dead-lettered"
                );
                None
            }
        };

        self.save_outcome(job, not_before).await?;

        Ok(ProcessedJob {
            job_id: job.id(),
            job_type: job.job_type().to_string(),
            state: job.state(),
            attempts: job.attempts(),
            not_before,
        })
    }

    async fn save_outcome(
        &self,
        job: &Job,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        let attempts = self.save_retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match self.store.save(job, JobState::Running, not_before).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            // A save that failed after committing shows up as a conflict on
            // the next try; the stored row already carries this outcome.
            if attempt > 1 && matches!(err, JobStoreError::Conflict(_)) {
                if let Ok(Some(stored)) = self.store.get(job.id()).await {
                    if stored.state() == job.state() && stored.attempts() == job.attempts() {
                        return Ok(());
                    }
                }
            }

            if !err.is_retryable() || attempt >= attempts {
                error!(
                    job_id = %job.id(),
                    state = %job.state(),
                    attempt,
                    error = %err,
                    "failed to persist job outcome; job left running"
                );
                return Err(err);
            }

            warn!(
                job_id = %job.id(),
                attempt,
                error = %err,
                "failed to persist job outcome; retrying"
            );
            attempt += 1;
            tokio::time::sleep(self.save_retry.delay).await;
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut CoordinatorStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Start `config.workers` worker tasks on the current tokio runtime.
    pub fn spawn(self, config: CoordinatorConfig) -> Result<CoordinatorHandle, CoordinatorError> {
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::clone(&self.stats);
        let coordinator = Arc::new(self);

        let workers = (0..config.workers)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    Arc::clone(&coordinator),
                    worker,
                    config.name.clone(),
                    config.poll_interval,
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!(coordinator = %config.name, workers = config.workers, "coordinator started");
        Ok(CoordinatorHandle {
            shutdown: shutdown_tx,
            workers,
            stats,
            started: Instant::now(),
        })
    }
}

async fn worker_loop<S: JobStore + 'static>(
    coordinator: Arc<JobCoordinator<S>>,
    worker: usize,
    name: String,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(coordinator = %name, worker, "worker started");

    loop {
        // A dropped handle closes the channel without sending `true`.
        if *shutdown.borrow() || shutdown.has_changed().is_err() {
            break;
        }

        let idle = match coordinator.process_next().await {
            Ok(Some(processed)) => {
                debug!(
                    coordinator = %name,
                    worker,
                    job_id = %processed.job_id,
                    state = %processed.state,
                    "job processed"
                );
                false
            }
            Ok(None) => true,
            Err(e) => {
                error!(coordinator = %name, worker, error = %e, "failed to process job");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    info!(coordinator = %name, worker, "worker stopped");
}
