//! Pipeline behaviour over the in-memory store: dispatch, retries, batches,
//! leases and retention.

mod fixtures;
mod helpers;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use helpers::*;
use meal_analysis_queue::models::job::{JobResult, JobStatus};
use meal_analysis_queue::services::dispatcher::{Dispatcher, DispatcherConfig};
use meal_analysis_queue::services::executor::{ExecutionOutcome, Executor};
use meal_analysis_queue::services::maintenance::{expire_pending, Maintenance, RetentionPolicy};
use meal_analysis_queue::services::queue::{JobQueue, QueueError, QueueSettings};
use meal_analysis_queue::services::store::Transition;

#[tokio::test]
async fn test_happy_path_completes_with_meal() {
    let h = Harness::new(ScriptedAnalyzer::always(Step::Succeed));
    let job = h.submit(fixtures::single_job("user-1")).await;
    assert_eq!(job.status, JobStatus::Pending);

    let (tx, handle) = h.start(3);
    let done = h.wait_terminal(&job.id).await;
    stop(tx, handle).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count, 0);
    assert_eq!(done.meal_id(), Some("meal-1"));
    assert!(done.completed_at.is_some());
    assert!(done.claim_token.is_none());
    assert_eq!(h.meals.created(), vec![(
        "user-1".to_string(),
        "https://cdn.example/lunch.png".to_string()
    )]);
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let h = Harness::new(ScriptedAnalyzer::new(
        vec![Step::Transient, Step::RateLimited],
        Step::Succeed,
    ));
    let job = h.submit(fixtures::single_job("user-1")).await;

    let (tx, handle) = h.start(3);
    let done = h.wait_terminal(&job.id).await;
    stop(tx, handle).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count, 2);
    assert_eq!(h.analyzer.calls(), 3);
}

#[tokio::test]
async fn test_malformed_image_fails_permanently() {
    let h = Harness::new(ScriptedAnalyzer::always(Step::Succeed));
    let mut new = fixtures::single_job("user-1");
    new.input = meal_analysis_queue::models::job::JobInput::Single {
        image: fixtures::broken_image("bad"),
    };
    let job = h.submit(new).await;

    let (tx, handle) = h.start(3);
    let done = h.wait_terminal(&job.id).await;
    stop(tx, handle).await;

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.retry_count, 0);
    assert!(done.error.unwrap().contains("invalid image encoding"));
    assert_eq!(h.analyzer.calls(), 0);
}

#[tokio::test]
async fn test_unsupported_image_is_not_retried() {
    let h = Harness::new(ScriptedAnalyzer::always(Step::Permanent));
    let job = h.submit(fixtures::single_job("user-1")).await;

    let (tx, handle) = h.start(3);
    let done = h.wait_terminal(&job.id).await;
    stop(tx, handle).await;

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.retry_count, 0);
    assert_eq!(h.analyzer.calls(), 1);
}

#[tokio::test]
async fn test_retry_exhaustion_keeps_last_error() {
    let h = Harness::new(ScriptedAnalyzer::always(Step::Transient));
    let job = h.submit(fixtures::single_job("user-1")).await;

    let (tx, handle) = h.start(3);
    let done = h.wait_terminal(&job.id).await;
    stop(tx, handle).await;

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.retry_count, 3);
    assert!(done.error.unwrap().contains("bad gateway"));
    assert_eq!(h.analyzer.calls(), 3);
    assert!(h.meals.created().is_empty());
}

#[tokio::test]
async fn test_meal_creation_failure_is_retried() {
    let h = Harness::new(ScriptedAnalyzer::always(Step::Succeed)).with_meals(RecordingMeals::failing(1));
    let job = h.submit(fixtures::single_job("user-1")).await;

    let (tx, handle) = h.start(3);
    let done = h.wait_terminal(&job.id).await;
    stop(tx, handle).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count, 1);
    assert_eq!(h.meals.created().len(), 1);
}

#[tokio::test]
async fn test_analysis_timeout_counts_as_transient() {
    let mut h = Harness::new(ScriptedAnalyzer::new(vec![Step::Hang], Step::Succeed));
    h.analysis_timeout = Duration::from_millis(50);
    let job = h.submit(fixtures::single_job("user-1")).await;

    let claimed = h.queue.claim(1).await.unwrap().remove(0);
    let outcome = h.executor().run(claimed).await;
    assert!(matches!(
        outcome,
        ExecutionOutcome::Retrying { retry_count: 1, .. }
    ));

    let job = h.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_concurrency_cap_is_respected() {
    let h = Harness::new(
        ScriptedAnalyzer::always(Step::Succeed).with_delay(Duration::from_millis(100)),
    );
    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(h.submit(fixtures::single_job(&format!("user-{i}"))).await.id);
    }

    let (tx, handle) = h.start(3);
    for id in &ids {
        assert_eq!(h.wait_terminal(id).await.status, JobStatus::Completed);
    }
    stop(tx, handle).await;

    assert!(h.analyzer.max_in_flight() <= 3);
    assert!(h.analyzer.max_in_flight() >= 2);
    assert_eq!(h.analyzer.calls(), 10);
}

#[tokio::test]
async fn test_tick_at_capacity_claims_nothing() {
    let h = Harness::new(
        ScriptedAnalyzer::always(Step::Succeed).with_delay(Duration::from_millis(200)),
    );
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(h.submit(fixtures::single_job("user-1")).await.id);
    }

    let dispatcher = h.dispatcher(2);
    let mut tasks = tokio::task::JoinSet::new();
    assert_eq!(dispatcher.tick(&mut tasks).await.unwrap(), 2);
    assert_eq!(dispatcher.active_count(), 2);
    assert_eq!(ids.iter().filter(|id| dispatcher.is_active(id)).count(), 2);
    assert_eq!(dispatcher.tick(&mut tasks).await.unwrap(), 0);
    assert_eq!(h.queue.stats().await.unwrap().waiting, 1);

    while tasks.join_next().await.is_some() {}
    assert_eq!(dispatcher.active_count(), 0);
    assert!(!ids.iter().any(|id| dispatcher.is_active(id)));
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_jobs() {
    let h = Harness::new(
        ScriptedAnalyzer::always(Step::Succeed).with_delay(Duration::from_millis(300)),
    );
    let job = h.submit(fixtures::single_job("user-1")).await;

    let (tx, handle) = h.start(3);
    while h.job(&job.id).await.status != JobStatus::Processing {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    stop(tx, handle).await;

    assert_eq!(h.job(&job.id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_concurrent_claims_are_exclusive() {
    let h = Harness::new(ScriptedAnalyzer::always(Step::Succeed));
    for i in 0..50 {
        h.submit(fixtures::single_job(&format!("user-{i}"))).await;
    }

    let claimers = (0..8).map(|_| {
        let queue = h.queue.clone();
        tokio::spawn(async move { queue.claim(10).await.unwrap() })
    });
    let batches = futures::future::join_all(claimers).await;

    let mut seen = HashSet::new();
    let mut total = 0;
    for batch in batches {
        for job in batch.unwrap() {
            assert_eq!(job.status, JobStatus::Processing);
            assert!(seen.insert(job.id.clone()), "job {} claimed twice", job.id);
            total += 1;
        }
    }
    assert_eq!(total, 50);
}

#[tokio::test]
async fn test_two_dispatchers_split_pending_jobs() {
    let h = Harness::new(
        ScriptedAnalyzer::always(Step::Succeed).with_delay(Duration::from_millis(200)),
    );
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(h.submit(fixtures::single_job(&format!("user-{i}"))).await.id);
    }

    let first = h.dispatcher(3);
    let second = h.dispatcher(3);
    let mut first_tasks = tokio::task::JoinSet::new();
    let mut second_tasks = tokio::task::JoinSet::new();
    let (a, b) = tokio::join!(first.tick(&mut first_tasks), second.tick(&mut second_tasks));
    assert_eq!(a.unwrap() + b.unwrap(), 5);

    for id in &ids {
        assert!(
            first.is_active(id) ^ second.is_active(id),
            "job {id} must be held by exactly one dispatcher"
        );
    }

    while first_tasks.join_next().await.is_some() {}
    while second_tasks.join_next().await.is_some() {}
    for id in &ids {
        assert_eq!(h.job(id).await.status, JobStatus::Completed);
    }
    assert_eq!(h.analyzer.calls(), 5);
}

#[tokio::test]
async fn test_batch_with_mixed_outcomes_completes() {
    let h = Harness::new(ScriptedAnalyzer::new(
        vec![Step::Succeed, Step::Permanent, Step::Succeed],
        Step::Succeed,
    ));
    let job = h
        .submit(fixtures::batch_job(
            "user-1",
            vec![fixtures::image("a"), fixtures::image("b"), fixtures::image("c")],
        ))
        .await;
    assert_eq!(job.progress.unwrap().total, 3);

    let (tx, handle) = h.start(3);
    let done = h.wait_terminal(&job.id).await;
    stop(tx, handle).await;

    assert_eq!(done.status, JobStatus::Completed);
    let progress = done.progress.unwrap();
    assert_eq!((progress.processed, progress.total), (3, 3));
    let Some(JobResult::Batch { items }) = done.result else {
        panic!("expected batch result");
    };
    assert_eq!(items.len(), 3);
    assert!(items[0].succeeded());
    assert!(!items[1].succeeded());
    assert!(items[1].error.as_deref().unwrap().contains("heic"));
    assert!(items[2].succeeded());
    assert_eq!(h.meals.created().len(), 2);
}

#[tokio::test]
async fn test_batch_all_transient_is_retried_whole() {
    let h = Harness::new(ScriptedAnalyzer::new(
        vec![Step::Transient, Step::Transient],
        Step::Succeed,
    ));
    let job = h
        .submit(fixtures::batch_job(
            "user-1",
            vec![fixtures::image("a"), fixtures::image("b")],
        ))
        .await;

    let (tx, handle) = h.start(1);
    let done = h.wait_terminal(&job.id).await;
    stop(tx, handle).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count, 1);
    assert_eq!(h.analyzer.calls(), 4);
}

#[tokio::test]
async fn test_batch_all_permanent_completes_with_errors() {
    let h = Harness::new(ScriptedAnalyzer::always(Step::Permanent));
    let job = h
        .submit(fixtures::batch_job(
            "user-1",
            vec![fixtures::image("a"), fixtures::image("b")],
        ))
        .await;

    let (tx, handle) = h.start(1);
    let done = h.wait_terminal(&job.id).await;
    stop(tx, handle).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count, 0);
    let Some(JobResult::Batch { items }) = done.result else {
        panic!("expected batch result");
    };
    assert!(items.iter().all(|i| !i.succeeded()));
}

#[tokio::test]
async fn test_expired_job_is_never_claimed() {
    let h = Harness::with_settings(
        ScriptedAnalyzer::always(Step::Succeed),
        QueueSettings {
            job_expiry: chrono::Duration::zero(),
            ..QueueSettings::default()
        },
    );
    let job = h.submit(fixtures::single_job("user-1")).await;

    assert!(h.queue.claim(5).await.unwrap().is_empty());
    assert_eq!(expire_pending(h.queue.as_ref()).await.unwrap(), 1);

    let job = h.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("expired before processing"));
    assert_eq!(h.analyzer.calls(), 0);
}

#[tokio::test]
async fn test_stale_lease_is_requeued_and_old_claim_fenced() {
    let h = Harness::with_settings(
        ScriptedAnalyzer::always(Step::Succeed),
        QueueSettings {
            lease: chrono::Duration::zero(),
            ..QueueSettings::default()
        },
    );
    let job = h.submit(fixtures::single_job("user-1")).await;
    let claimed = h.queue.claim(1).await.unwrap().remove(0);
    let stale_token = claimed.claim_token.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let maintenance = Maintenance::new(
        vec![h.queue.clone() as Arc<dyn JobQueue>],
        RetentionPolicy::default(),
        instant_retries(3),
    );
    let report = maintenance.sweep().await;
    assert_eq!(report.requeued, 1);

    let requeued = h.job(&job.id).await;
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(requeued.error.as_deref(), Some("lease expired"));

    // The new claim gets a fresh token; the old worker's write is rejected.
    let reclaimed = h.queue.claim(1).await.unwrap().remove(0);
    assert_ne!(reclaimed.claim_token, Some(stale_token));
    let err = h
        .queue
        .transition(&job.id, Transition::complete(stale_token, JobResult::Batch { items: vec![] }))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Conflict { .. }));
}

#[tokio::test]
async fn test_heartbeat_keeps_long_job_from_being_reaped() {
    let h = Harness::with_settings(
        ScriptedAnalyzer::always(Step::Succeed).with_delay(Duration::from_millis(600)),
        QueueSettings {
            lease: chrono::Duration::milliseconds(200),
            ..QueueSettings::default()
        },
    );
    let job = h.submit(fixtures::single_job("user-1")).await;
    let claimed = h.queue.claim(1).await.unwrap().remove(0);

    // Heartbeat every 50ms against a 200ms lease.
    let executor = h.executor();
    let run = tokio::spawn(async move { executor.run(claimed).await });

    let maintenance = Maintenance::new(
        vec![h.queue.clone() as Arc<dyn JobQueue>],
        RetentionPolicy::default(),
        instant_retries(3),
    );
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let report = maintenance.sweep().await;
        assert_eq!((report.requeued, report.failed), (0, 0));
    }

    assert_eq!(run.await.unwrap(), ExecutionOutcome::Completed);
    let done = h.job(&job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count, 0);
    assert_eq!(h.analyzer.calls(), 1);
}

#[tokio::test]
async fn test_jobs_without_a_free_slot_are_released() {
    let h = Harness::new(
        ScriptedAnalyzer::always(Step::Succeed).with_delay(Duration::from_millis(100)),
    );
    for _ in 0..3 {
        h.submit(fixtures::single_job("user-1")).await;
    }

    let slots = Arc::new(Semaphore::new(3));
    let queue = Arc::new(ContendedQueue::new(h.queue.clone(), slots.clone(), 2));
    let executor = Executor::new(
        queue.clone() as Arc<dyn JobQueue>,
        h.analyzer.clone(),
        h.meals.clone(),
        h.policy,
    )
    .with_heartbeat(Duration::from_millis(50));
    let dispatcher = Dispatcher::new(
        Arc::new(executor),
        DispatcherConfig {
            max_concurrent_jobs: 3,
            poll_interval: Duration::from_millis(10),
        },
    )
    .with_slots(slots.clone());

    let mut tasks = tokio::task::JoinSet::new();
    assert_eq!(dispatcher.tick(&mut tasks).await.unwrap(), 1);
    assert_eq!(dispatcher.active_count(), 1);
    assert_eq!(dispatcher.slots_in_use(), 3);

    let stats = h.queue.stats().await.unwrap();
    assert_eq!((stats.waiting, stats.active), (2, 1));
    let released: Vec<_> = h
        .queue
        .list_for_owner("user-1", 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|j| j.status == JobStatus::Pending)
        .collect();
    assert_eq!(released.len(), 2);
    assert!(released.iter().all(|j| j.retry_count == 0 && j.claim_token.is_none()));

    while tasks.join_next().await.is_some() {}
    queue.give_back();
    assert_eq!(dispatcher.slots_in_use(), 0);

    // With the budget free again the released jobs run normally.
    let mut tasks = tokio::task::JoinSet::new();
    assert_eq!(dispatcher.tick(&mut tasks).await.unwrap(), 2);
    while tasks.join_next().await.is_some() {}
    assert_eq!(h.analyzer.calls(), 3);
    assert_eq!(h.queue.stats().await.unwrap().completed, 3);
}

#[tokio::test]
async fn test_terminal_jobs_are_immutable() {
    let h = Harness::new(ScriptedAnalyzer::always(Step::Succeed));
    let job = h.submit(fixtures::single_job("user-1")).await;
    let claimed = h.queue.claim(1).await.unwrap().remove(0);
    let token = claimed.claim_token.unwrap();

    h.queue
        .transition(&job.id, Transition::fail(token, "boom".to_string(), false))
        .await
        .unwrap();

    let retry = h
        .queue
        .transition(
            &job.id,
            Transition::retry(token, "again".to_string(), chrono::Utc::now()),
        )
        .await;
    assert!(retry.is_err());
    let expire = h
        .queue
        .transition(&job.id, Transition::expire("late".to_string()))
        .await;
    assert!(expire.is_err());

    let job = h.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_retention_purges_only_old_terminal_jobs() {
    let h = Harness::new(ScriptedAnalyzer::always(Step::Succeed));
    let old = h.submit(fixtures::single_job("user-1")).await;
    let recent = h.submit(fixtures::single_job("user-1")).await;
    let pending = h.submit(fixtures::single_job("user-1")).await;

    for (id, delay) in [(&old.id, 0u64), (&recent.id, 150)] {
        tokio::time::sleep(Duration::from_millis(delay)).await;
        let claimed = h.queue.claim(1).await.unwrap().remove(0);
        assert_eq!(&claimed.id, id);
        h.queue
            .transition(
                id,
                Transition::complete(
                    claimed.claim_token.unwrap(),
                    JobResult::Single {
                        analysis: fixtures::salad(),
                        meal_id: "meal".to_string(),
                    },
                ),
            )
            .await
            .unwrap();
    }

    let maintenance = Maintenance::new(
        vec![h.queue.clone() as Arc<dyn JobQueue>],
        RetentionPolicy {
            completed: chrono::Duration::milliseconds(100),
            failed: chrono::Duration::days(7),
        },
        instant_retries(3),
    );
    let purged = maintenance
        .purge(h.queue.as_ref(), chrono::Utc::now())
        .await
        .unwrap();

    assert_eq!(purged, 1);
    assert!(h.store.snapshot(&old.id).await.is_none());
    assert!(h.store.snapshot(&recent.id).await.is_some());
    assert_eq!(h.job(&pending.id).await.status, JobStatus::Pending);
}
