//! Integration tests for the full queue pipeline.
//!
//! Tests: Producer → JobStore → JobCoordinator workers → handler → JobStore
//!
//! Verifies:
//! - Every enqueued job reaches a terminal state exactly once
//! - Transient failures are retried until they succeed or the budget is spent
//! - Duplicate producers are absorbed by the idempotency key

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use jobforge_core::{Job, JobState, Payload, Priority};

    use crate::jobs::{
        BackoffPolicy, CoordinatorConfig, CoordinatorHandle, ExecutionError, InMemoryJobStore,
        JobCoordinator, JobStore,
    };

    fn payload(pairs: &[(&str, serde_json::Value)]) -> Payload {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("jobforge_infra=debug")
            .try_init();
    }

    async fn wait_until_processed(handle: &CoordinatorHandle, expected: u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while handle.stats().jobs_processed < expected && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mixed_workload_settles() {
        init_tracing();
        let store = InMemoryJobStore::arc();
        let mut coordinator =
            JobCoordinator::new(Arc::clone(&store)).with_backoff(BackoffPolicy::immediate());

        // Fails on the first two attempts of every job, then succeeds.
        let attempts: Arc<Mutex<HashMap<String, u32>>> = Arc::default();
        let seen = Arc::clone(&attempts);
        coordinator.register_handler("report.render", move |payload| {
            let seen = Arc::clone(&seen);
            async move {
                let key = payload["report"].to_string();
                let attempt = {
                    let mut seen = seen.lock().unwrap();
                    let n = seen.entry(key).or_default();
                    *n += 1;
                    *n
                };
                if attempt <= 2 {
                    Err(ExecutionError::retryable(format!("render attempt {attempt} timed out")))
                } else {
                    Ok(())
                }
            }
        });
        coordinator.register_handler("email.*", |payload| async move {
            match payload.get("to") {
                Some(_) => Ok(()),
                None => Err(ExecutionError::fatal("missing recipient")),
            }
        });

        for n in 0..10 {
            coordinator
                .enqueue(Job::new(
                    "report.render",
                    payload(&[("report", serde_json::json!(n))]),
                    format!("report-{n}"),
                ))
                .await
                .unwrap();
        }
        for n in 0..10 {
            coordinator
                .enqueue(
                    Job::builder(
                        "email.send",
                        payload(&[("to", serde_json::json!(format!("user{n}@example.com")))]),
                        format!("email-{n}"),
                    )
                    .with_priority(Priority::High)
                    .build(),
                )
                .await
                .unwrap();
        }
        let broken = coordinator
            .enqueue(Job::new("email.send", Payload::new(), "email-broken"))
            .await
            .unwrap()
            .id();
        let orphan = coordinator
            .enqueue(Job::new("unknown.kind", Payload::new(), "orphan"))
            .await
            .unwrap()
            .id();

        // Producer retries its last enqueue; nothing new is created.
        let dup = coordinator
            .enqueue(Job::new("unknown.kind", Payload::new(), "orphan"))
            .await
            .unwrap();
        assert!(dup.is_duplicate());
        assert_eq!(dup.id(), orphan);

        let handle = coordinator
            .spawn(
                CoordinatorConfig::default()
                    .with_name("integration")
                    .with_workers(4)
                    .with_poll_interval(Duration::from_millis(5)),
            )
            .unwrap();
        wait_until_processed(&handle, 42).await;
        let coordinator_stats = handle.stats();
        handle.shutdown().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.completed, 20);
        assert_eq!(stats.dead, 2);
        assert_eq!(stats.pending + stats.running + stats.retrying, 0);

        // 10 reports x 3 attempts + 10 emails + 2 dead-lettered
        assert_eq!(coordinator_stats.jobs_processed, 42);
        assert_eq!(coordinator_stats.jobs_succeeded, 20);
        assert_eq!(coordinator_stats.jobs_dead_lettered, 2);

        let reports = store.list_by_type("report.render", 100).await.unwrap();
        assert!(reports.iter().all(|j| j.state() == JobState::Completed));
        assert!(reports.iter().all(|j| j.attempts() == 2));
        assert!(reports.iter().all(|j| j.error_message().is_none()));

        let broken = store.get(broken).await.unwrap().unwrap();
        assert_eq!(broken.state(), JobState::Dead);
        assert_eq!(broken.error_message(), Some("missing recipient"));

        let orphan = store.get(orphan).await.unwrap().unwrap();
        assert_eq!(orphan.state(), JobState::Dead);
        for job in store.list_by_state(JobState::Dead, 10).await.unwrap() {
            job.check_invariants().unwrap();
        }
    }

    #[tokio::test]
    async fn exhausted_budget_lands_in_dead_letter() {
        init_tracing();
        let store = InMemoryJobStore::arc();
        let mut coordinator =
            JobCoordinator::new(Arc::clone(&store)).with_backoff(BackoffPolicy::immediate());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        coordinator.register_handler("webhook.deliver", move |_payload| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ExecutionError::retryable("503 from upstream")) }
        });

        let id = coordinator
            .enqueue(
                Job::builder("webhook.deliver", Payload::new(), "hook-1")
                    .with_max_attempts(3)
                    .build(),
            )
            .await
            .unwrap()
            .id();

        while coordinator.process_next().await.unwrap().is_some() {}

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state(), JobState::Dead);
        assert_eq!(job.attempts(), 3);
        assert_eq!(job.error_message(), Some("503 from upstream"));
        assert!(job.finished_at().is_some());
    }
}
