#![cfg(feature = "postgres")]

use std::time::Duration;

use chrono::Utc;
use taskkit_backend::postgres::{check_pool_health, create_pg_pool, run_migrations, PoolConfig, PostgresBackend};
use taskkit_backend::Backend;
use taskkit_common::{ResultKind, Task, TaskResult};

async fn test_backend() -> Option<PostgresBackend> {
    let database_url = std::env::var("TASKKIT_TEST_DATABASE_URL").ok()?;
    let config = PoolConfig { min_connections: 1, max_connections: 2, ..PoolConfig::default() };
    let pool = create_pg_pool(&database_url, config).await.expect("pool should connect to test database");
    check_pool_health(&pool).await.expect("health check query should succeed");
    run_migrations(&pool).await.expect("migrations should apply cleanly");
    Some(PostgresBackend::new(pool))
}

#[tokio::test]
async fn enqueue_assign_complete_round_trip() {
    let Some(backend) = test_backend().await else {
        eprintln!("skipping postgres backend integration test: set TASKKIT_TEST_DATABASE_URL to run it");
        return;
    };

    let now = Utc::now();
    let task = Task::new("emails", "welcome", b"{\"to\":\"a@example.com\"}".to_vec(), now);
    backend.enqueue(task.clone()).await.unwrap();

    let assigned = backend.assign("emails", "worker-1", Duration::from_secs(30), now).await.unwrap();
    let assigned = assigned.expect("task should be assignable once due");
    assert_eq!(assigned.id, task.id);

    let not_again = backend.assign("emails", "worker-2", Duration::from_secs(30), now).await.unwrap();
    assert!(not_again.is_none(), "a second worker must not be able to claim a leased task");

    let renewed = backend.renew(assigned.id, "worker-1", Duration::from_secs(30), now).await.unwrap();
    assert!(renewed);

    let result = TaskResult { task_id: assigned.id, kind: ResultKind::Success, payload: b"sent".to_vec(), created_at: now };
    let completed = backend.complete(assigned.id, "worker-1", result).await.unwrap();
    assert!(completed);

    let fetched = backend.get_result(assigned.id, now).await.unwrap();
    assert!(fetched.is_some());
}

#[tokio::test]
async fn scheduler_lock_excludes_concurrent_holders() {
    let Some(backend) = test_backend().await else {
        eprintln!("skipping postgres backend integration test: set TASKKIT_TEST_DATABASE_URL to run it");
        return;
    };

    let now = Utc::now();
    let granted = backend.acquire_scheduler("cron", "replica-a", Duration::from_secs(10), now).await.unwrap();
    assert!(granted);

    let denied = backend.acquire_scheduler("cron", "replica-b", Duration::from_secs(10), now).await.unwrap();
    assert!(!denied);

    backend.release_scheduler("cron", "replica-a").await.unwrap();
    let granted_after_release = backend.acquire_scheduler("cron", "replica-b", Duration::from_secs(10), now).await.unwrap();
    assert!(granted_after_release);
}
