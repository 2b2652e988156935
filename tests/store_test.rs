//! Coordination store tests: atomic claiming, ownership guards, retry
//! accounting, and stuck-batch reclamation.

use std::time::Duration;

use futures::future::join_all;
use sqlx::PgPool;
use uuid::Uuid;

use migrator_core::database::DatabaseConnection;
use migrator_core::models::batch::{BatchStatus, MigrationBatch};
use migrator_core::models::job::{JobStatus, MigrationJob};
use migrator_core::store::{CoordinationStore, StorePolicy};

fn store(pool: &PgPool) -> CoordinationStore {
    CoordinationStore::new(pool.clone(), StorePolicy::default())
}

async fn seed_job(pool: &PgPool) -> MigrationJob {
    MigrationJob::create(pool).await.expect("create job")
}

/// Insert `count` pending batches of `size` records each.
async fn seed_batches(pool: &PgPool, job_id: Uuid, count: i64, size: i64) {
    for number in 0..count {
        let start = number * size + 1;
        let ids: Vec<i64> = (start..start + size).collect();
        sqlx::query(
            r#"
            INSERT INTO migration_batches
                (job_id, batch_number, status, start_id, end_id, record_ids)
            VALUES ($1, $2, 'pending', $3, $4, $5)
            "#,
        )
        .bind(job_id)
        .bind(number)
        .bind(start)
        .bind(start + size - 1)
        .bind(&ids)
        .execute(pool)
        .await
        .expect("seed batch");
    }
}

#[sqlx::test]
async fn test_health_check_round_trips(pool: PgPool) {
    let db = DatabaseConnection::from_pool(pool);
    db.health_check().await.expect("store reachable");
    db.close().await;
}

#[sqlx::test]
async fn test_claim_transitions_lowest_batch_first(pool: PgPool) {
    let job = seed_job(&pool).await;
    seed_batches(&pool, job.id, 3, 5).await;
    let store = store(&pool);

    let claimed = store
        .claim_next_batch(job.id, "worker-a")
        .await
        .expect("claim")
        .expect("batch available");

    assert_eq!(claimed.batch_number, 0);
    assert_eq!(claimed.status, BatchStatus::Processing);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-a"));
    assert!(claimed.claimed_at.is_some());
    assert_eq!(claimed.record_ids, vec![1, 2, 3, 4, 5]);

    let next = store
        .claim_next_batch(job.id, "worker-b")
        .await
        .expect("claim")
        .expect("batch available");
    assert_eq!(next.batch_number, 1);
}

#[sqlx::test]
async fn test_claim_returns_none_when_drained(pool: PgPool) {
    let job = seed_job(&pool).await;
    let store = store(&pool);

    let claimed = store.claim_next_batch(job.id, "worker-a").await.expect("claim");
    assert!(claimed.is_none());
}

#[sqlx::test]
async fn test_no_double_claim_under_concurrency(pool: PgPool) {
    let job = seed_job(&pool).await;
    seed_batches(&pool, job.id, 10, 2).await;
    let store = store(&pool);

    // 3 workers, each attempting 5 claims concurrently: 15 attempts for 10
    // batches must yield exactly 10 successes with no duplicates.
    let mut tasks = Vec::new();
    for worker in 0..3 {
        for _ in 0..5 {
            let store = store.clone();
            let worker_id = format!("worker-{worker}");
            tasks.push(tokio::spawn(async move {
                store
                    .claim_next_batch(job.id, &worker_id)
                    .await
                    .expect("claim")
                    .map(|b| b.batch_number)
            }));
        }
    }

    let mut claimed: Vec<i64> = join_all(tasks)
        .await
        .into_iter()
        .filter_map(|r| r.expect("task"))
        .collect();
    claimed.sort_unstable();

    assert_eq!(claimed.len(), 10, "at most B successful claims");
    claimed.dedup();
    assert_eq!(claimed, (0..10).collect::<Vec<i64>>(), "each batch claimed once");
}

#[sqlx::test]
async fn test_bump_progress_accumulates_deltas(pool: PgPool) {
    let job = seed_job(&pool).await;
    seed_batches(&pool, job.id, 1, 10).await;
    let store = store(&pool);

    let batch = store
        .claim_next_batch(job.id, "worker-a")
        .await
        .expect("claim")
        .expect("batch");

    let updated = store
        .bump_batch_progress(batch.id, "worker-a", 7, 1)
        .await
        .expect("bump")
        .expect("accepted");
    assert_eq!(updated.processed_count, 7);
    assert_eq!(updated.failed_count, 1);

    let updated = store
        .bump_batch_progress(batch.id, "worker-a", 2, 0)
        .await
        .expect("bump")
        .expect("accepted");
    assert_eq!(updated.processed_count, 9);
    assert_eq!(updated.failed_count, 1);
}

#[sqlx::test]
async fn test_stale_writes_are_rejected(pool: PgPool) {
    let job = seed_job(&pool).await;
    seed_batches(&pool, job.id, 1, 10).await;
    let store = store(&pool);

    let batch = store
        .claim_next_batch(job.id, "worker-a")
        .await
        .expect("claim")
        .expect("batch");

    // A zombie with the wrong identity gets a no-op on every mutation.
    let rejected = store
        .bump_batch_progress(batch.id, "worker-zombie", 5, 0)
        .await
        .expect("bump");
    assert!(rejected.is_none());

    store
        .mark_batch_completed(batch.id, "worker-zombie")
        .await
        .expect("complete");
    let retried = store
        .mark_batch_failed(batch.id, "worker-zombie", "stale", true)
        .await
        .expect("fail");
    assert!(!retried);

    let current = MigrationBatch::find_by_id(&pool, batch.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(current.status, BatchStatus::Processing);
    assert_eq!(current.processed_count, 0);
    assert_eq!(current.worker_id.as_deref(), Some("worker-a"));
}

#[sqlx::test]
async fn test_mark_failed_retries_until_budget_exhausted(pool: PgPool) {
    let job = seed_job(&pool).await;
    seed_batches(&pool, job.id, 1, 10).await;
    let store = store(&pool);

    // max_retries = 3: failures 1..=3 reschedule, the 4th is terminal.
    for attempt in 1..=3 {
        let batch = store
            .claim_next_batch(job.id, "worker-a")
            .await
            .expect("claim")
            .expect("still claimable");
        let retried = store
            .mark_batch_failed(batch.id, "worker-a", "source unreachable", true)
            .await
            .expect("fail");
        assert!(retried, "failure {attempt} should reschedule");

        let current = MigrationBatch::find_by_id(&pool, batch.id)
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(current.status, BatchStatus::Pending);
        assert_eq!(current.retry_count, attempt);
        assert!(current.worker_id.is_none());
        assert!(current.claimed_at.is_none());
    }

    let batch = store
        .claim_next_batch(job.id, "worker-a")
        .await
        .expect("claim")
        .expect("still claimable");
    let retried = store
        .mark_batch_failed(batch.id, "worker-a", "source unreachable", true)
        .await
        .expect("fail");
    assert!(!retried, "budget exhausted");

    let current = MigrationBatch::find_by_id(&pool, batch.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(current.status, BatchStatus::Failed);
    assert_eq!(current.retry_count, 4);

    // Terminal batches are never reclaimed again.
    let claimed = store.claim_next_batch(job.id, "worker-b").await.expect("claim");
    assert!(claimed.is_none());
}

#[sqlx::test]
async fn test_mark_failed_without_retry_is_terminal(pool: PgPool) {
    let job = seed_job(&pool).await;
    seed_batches(&pool, job.id, 1, 10).await;
    let store = store(&pool);

    let batch = store
        .claim_next_batch(job.id, "worker-a")
        .await
        .expect("claim")
        .expect("batch");
    let retried = store
        .mark_batch_failed(batch.id, "worker-a", "unrecoverable", false)
        .await
        .expect("fail");
    assert!(!retried);

    let current = MigrationBatch::find_by_id(&pool, batch.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(current.status, BatchStatus::Failed);
}

#[sqlx::test]
async fn test_reset_stuck_batches_reschedules_with_backoff(pool: PgPool) {
    let job = seed_job(&pool).await;
    seed_batches(&pool, job.id, 2, 10).await;
    let store = store(&pool);

    // Batch 0: claimed 20 minutes ago with a 10 minute timeout -> stuck.
    let stuck = store
        .claim_next_batch(job.id, "worker-dead")
        .await
        .expect("claim")
        .expect("batch");
    sqlx::query("UPDATE migration_batches SET claimed_at = NOW() - INTERVAL '20 minutes' WHERE id = $1")
        .bind(stuck.id)
        .execute(&pool)
        .await
        .expect("age claim");

    // Batch 1: freshly claimed, must not be touched.
    let live = store
        .claim_next_batch(job.id, "worker-live")
        .await
        .expect("claim")
        .expect("batch");

    let reclaimed = store.reset_stuck_batches(job.id).await.expect("reset");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, stuck.id);
    assert_eq!(reclaimed[0].status, BatchStatus::Pending);
    assert_eq!(reclaimed[0].retry_count, 1);
    assert!(reclaimed[0].next_retry_at.is_some(), "backoff scheduled");

    let live_now = MigrationBatch::find_by_id(&pool, live.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(live_now.status, BatchStatus::Processing);

    // Backoff is enforced: the reclaimed batch is skipped until
    // next_retry_at passes, and claimable afterwards.
    let skipped = store.claim_next_batch(job.id, "worker-new").await.expect("claim");
    assert!(skipped.is_none());

    sqlx::query("UPDATE migration_batches SET next_retry_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(stuck.id)
        .execute(&pool)
        .await
        .expect("expire backoff");

    let reclaimable = store
        .claim_next_batch(job.id, "worker-new")
        .await
        .expect("claim")
        .expect("re-claimable after backoff");
    assert_eq!(reclaimable.id, stuck.id);
    assert_eq!(reclaimable.retry_count, 1);
}

#[sqlx::test]
async fn test_reset_stuck_batches_exhausted_budget_fails(pool: PgPool) {
    let job = seed_job(&pool).await;
    seed_batches(&pool, job.id, 1, 10).await;
    let store = store(&pool);

    let batch = store
        .claim_next_batch(job.id, "worker-dead")
        .await
        .expect("claim")
        .expect("batch");
    sqlx::query(
        r#"
        UPDATE migration_batches
        SET claimed_at = NOW() - INTERVAL '20 minutes', retry_count = 3
        WHERE id = $1
        "#,
    )
    .bind(batch.id)
    .execute(&pool)
    .await
    .expect("age claim");

    let reclaimed = store.reset_stuck_batches(job.id).await.expect("reset");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].status, BatchStatus::Failed);
    assert_eq!(reclaimed[0].retry_count, 4);
    assert!(reclaimed[0].next_retry_at.is_none());
}

#[sqlx::test]
async fn test_job_stats_and_rollup(pool: PgPool) {
    let job = seed_job(&pool).await;
    seed_batches(&pool, job.id, 3, 10).await;
    let store = store(&pool);

    let batch = store
        .claim_next_batch(job.id, "worker-a")
        .await
        .expect("claim")
        .expect("batch");
    store
        .bump_batch_progress(batch.id, "worker-a", 9, 1)
        .await
        .expect("bump")
        .expect("accepted");
    store
        .mark_batch_completed(batch.id, "worker-a")
        .await
        .expect("complete");

    let stats = store.job_stats(job.id).await.expect("stats");
    assert_eq!(stats.completed_batches, 1);
    assert_eq!(stats.pending_batches, 2);
    assert_eq!(stats.processing_batches, 0);
    assert_eq!(stats.failed_batches, 0);
    assert_eq!(stats.processed_records, 9);
    assert_eq!(stats.failed_records, 1);
    assert!(!stats.is_drained());

    store.update_job_stats(job.id).await.expect("rollup");
    let job_row = MigrationJob::find_by_id(&pool, job.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(job_row.completed_batches, 1);
    assert_eq!(job_row.processed_records, 9);
    assert_eq!(job_row.failed_records, 1);
}

#[sqlx::test]
async fn test_job_status_transitions_stamp_end_time(pool: PgPool) {
    let job = seed_job(&pool).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.metadata.get("start_time").is_some());

    MigrationJob::update_status(&pool, job.id, JobStatus::Running)
        .await
        .expect("running");
    let running = MigrationJob::find_by_id(&pool, job.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(running.status, JobStatus::Running);
    assert!(running.metadata.get("end_time").is_none());

    MigrationJob::update_status(&pool, job.id, JobStatus::Completed)
        .await
        .expect("completed");
    let done = MigrationJob::find_by_id(&pool, job.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.metadata.get("end_time").is_some());
}

#[sqlx::test]
async fn test_policy_timeout_is_respected(pool: PgPool) {
    let job = seed_job(&pool).await;
    seed_batches(&pool, job.id, 1, 10).await;

    // Tight timeout: a batch claimed two seconds ago already counts as
    // stuck.
    let store = CoordinationStore::new(
        pool.clone(),
        StorePolicy {
            batch_timeout: Duration::from_secs(1),
            ..StorePolicy::default()
        },
    );

    let batch = store
        .claim_next_batch(job.id, "worker-a")
        .await
        .expect("claim")
        .expect("batch");
    sqlx::query("UPDATE migration_batches SET claimed_at = NOW() - INTERVAL '2 seconds' WHERE id = $1")
        .bind(batch.id)
        .execute(&pool)
        .await
        .expect("age claim");

    let reclaimed = store.reset_stuck_batches(job.id).await.expect("reset");
    assert_eq!(reclaimed.len(), 1);
}
