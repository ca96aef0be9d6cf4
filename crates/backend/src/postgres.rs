// Postgres reference adapter. All cross-worker coordination is a CAS
// against a row (`tasks.assignee`/`lease_expires_at`,
// `scheduler_locks.holder`/`lease_expires_at`) so correctness holds
// across any number of processes, not just within one.

use std::env;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{migrate::Migrator, PgPool, Row};
use taskkit_common::{ErrorDescriptor, ResultKind, Schedule, ScheduleEntry, Task, TaskId, TaskResult};

use crate::{Backend, BackendError, BackendResult};

const DEFAULT_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// How often [`PostgresBackend::get_result`] re-polls while waiting for
/// a result row to appear. There's no cross-connection wakeup here —
/// NOTIFY/LISTEN would work but adds a second connection mode for a
/// method that's already bounded by `block_until`.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let min_connections =
            env::var("TASKKIT_BACKEND_DB_MIN_CONNECTIONS").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_MIN_CONNECTIONS);
        let max_connections =
            env::var("TASKKIT_BACKEND_DB_MAX_CONNECTIONS").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let acquire_timeout_secs = env::var("TASKKIT_BACKEND_DB_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS);

        Self { min_connections, max_connections, acquire_timeout: Duration::from_secs(acquire_timeout_secs) }
    }
}

pub async fn create_pg_pool(database_url: &str, config: PoolConfig) -> anyhow::Result<PgPool> {
    let connect_options = database_url.parse::<PgConnectOptions>().context("failed to parse taskkit postgres connection options")?;

    PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect_options)
        .await
        .context("failed to connect to taskkit postgres")
}

pub async fn check_pool_health(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await.context("taskkit postgres health check failed")?;
    Ok(())
}

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await.context("failed to apply taskkit postgres migrations")
}

/// [`Backend`] implementation over a shared [`PgPool`]. Safe to use
/// from any number of processes against the same database.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn storage_err(err: sqlx::Error) -> BackendError {
    BackendError::Storage(err.into())
}

fn task_from_row(row: &sqlx::postgres::PgRow) -> Result<Task, sqlx::Error> {
    Ok(Task {
        id: TaskId::from(row.try_get::<uuid::Uuid, _>("id")?),
        group: row.try_get("task_group")?,
        name: row.try_get("name")?,
        data: row.try_get("data")?,
        due_at: row.try_get("due_at")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        assignee: row.try_get("assignee")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
    })
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<ScheduleEntry, sqlx::Error> {
    let schedule_json: serde_json::Value = row.try_get("schedule")?;
    let schedule: Schedule = serde_json::from_value(schedule_json).map_err(|e| sqlx::Error::Decode(e.into()))?;
    Ok(ScheduleEntry {
        key: row.try_get("key")?,
        group: row.try_get("task_group")?,
        name: row.try_get("name")?,
        data: row.try_get("data")?,
        schedule,
        last_fired_at: row.try_get("last_fired_at")?,
    })
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn enqueue(&self, task: Task) -> BackendResult<()> {
        sqlx::query(
            r#"
INSERT INTO tasks (id, task_group, name, data, due_at, retry_count, assignee, lease_expires_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(&task.group)
        .bind(&task.name)
        .bind(&task.data)
        .bind(task.due_at)
        .bind(task.retry_count as i32)
        .bind(&task.assignee)
        .bind(task.lease_expires_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn assign(
        &self,
        group: &str,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<Option<Task>> {
        let lease_seconds = lease_duration.as_secs_f64();

        let row = sqlx::query(
            r#"
WITH candidate AS (
  SELECT id
  FROM tasks
  WHERE task_group = $1
    AND due_at <= $4
    AND (lease_expires_at IS NULL OR lease_expires_at <= $4)
  ORDER BY due_at ASC, id ASC
  FOR UPDATE SKIP LOCKED
  LIMIT 1
)
UPDATE tasks t
SET assignee = $2,
    lease_expires_at = $4 + ($3 * interval '1 second')
FROM candidate
WHERE t.id = candidate.id
RETURNING t.*
            "#,
        )
        .bind(group)
        .bind(worker_id)
        .bind(lease_seconds)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(task_from_row).transpose().map_err(storage_err)
    }

    async fn renew(
        &self,
        task_id: TaskId,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let lease_seconds = lease_duration.as_secs_f64();
        let updated = sqlx::query(
            r#"
UPDATE tasks
SET lease_expires_at = $4 + ($3 * interval '1 second')
WHERE id = $1
  AND assignee = $2
  AND lease_expires_at > $4
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(worker_id)
        .bind(lease_seconds)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn complete(&self, task_id: TaskId, worker_id: &str, result: TaskResult) -> BackendResult<bool> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let deleted = sqlx::query("DELETE FROM tasks WHERE id = $1 AND assignee = $2 AND lease_expires_at > now()")
            .bind(task_id.as_uuid())
            .bind(worker_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?
            .rows_affected();

        if deleted != 1 {
            tx.rollback().await.map_err(storage_err)?;
            return Ok(false);
        }

        sqlx::query(
            r#"
INSERT INTO results (task_id, kind, payload, created_at)
VALUES ($1, $2, $3, $4)
ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(result.task_id.as_uuid())
        .bind(kind_as_str(result.kind))
        .bind(&result.payload)
        .bind(result.created_at)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(true)
    }

    async fn reschedule(
        &self,
        task_id: TaskId,
        worker_id: &str,
        new_due_at: DateTime<Utc>,
        retry_count: u32,
    ) -> BackendResult<bool> {
        let updated = sqlx::query(
            r#"
UPDATE tasks
SET assignee = NULL,
    lease_expires_at = NULL,
    due_at = $3,
    retry_count = $4
WHERE id = $1
  AND assignee = $2
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(worker_id)
        .bind(new_due_at)
        .bind(retry_count as i32)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn discard(&self, task_id: TaskId, worker_id: &str) -> BackendResult<bool> {
        let deleted = sqlx::query("DELETE FROM tasks WHERE id = $1 AND assignee = $2 AND lease_expires_at > now()")
            .bind(task_id.as_uuid())
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?
            .rows_affected();
        Ok(deleted == 1)
    }

    async fn fail_permanent(&self, task_id: TaskId, worker_id: &str, error: ErrorDescriptor) -> BackendResult<bool> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let deleted = sqlx::query("DELETE FROM tasks WHERE id = $1 AND assignee = $2 AND lease_expires_at > now()")
            .bind(task_id.as_uuid())
            .bind(worker_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?
            .rows_affected();

        if deleted != 1 {
            tx.rollback().await.map_err(storage_err)?;
            return Ok(false);
        }

        sqlx::query(
            r#"
INSERT INTO results (task_id, kind, payload, created_at)
VALUES ($1, 'error', $2, $3)
ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(task_id.as_uuid())
        .bind(error.to_json())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(true)
    }

    async fn get_result(&self, task_id: TaskId, block_until: DateTime<Utc>) -> BackendResult<Option<TaskResult>> {
        loop {
            let row = sqlx::query("SELECT task_id, kind, payload, created_at FROM results WHERE task_id = $1")
                .bind(task_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;

            if let Some(row) = row {
                let kind: String = row.try_get("kind").map_err(storage_err)?;
                return Ok(Some(TaskResult {
                    task_id,
                    kind: kind_from_str(&kind),
                    payload: row.try_get("payload").map_err(storage_err)?,
                    created_at: row.try_get("created_at").map_err(storage_err)?,
                }));
            }

            let remaining = (block_until - Utc::now()).to_std().unwrap_or_default();
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(RESULT_POLL_INTERVAL)).await;
        }
    }

    async fn acquire_scheduler(
        &self,
        scheduler_name: &str,
        holder: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let lease_seconds = lease_duration.as_secs_f64();
        let row = sqlx::query(
            r#"
INSERT INTO scheduler_locks (scheduler_name, holder, lease_expires_at)
VALUES ($1, $2, $3 + ($4 * interval '1 second'))
ON CONFLICT (scheduler_name) DO UPDATE
SET holder = CASE WHEN scheduler_locks.lease_expires_at <= $3 THEN EXCLUDED.holder ELSE scheduler_locks.holder END,
    lease_expires_at = CASE WHEN scheduler_locks.lease_expires_at <= $3 THEN EXCLUDED.lease_expires_at ELSE scheduler_locks.lease_expires_at END
RETURNING holder
            "#,
        )
        .bind(scheduler_name)
        .bind(holder)
        .bind(now)
        .bind(lease_seconds)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        let granted_to: String = row.try_get("holder").map_err(storage_err)?;
        Ok(granted_to == holder)
    }

    async fn renew_scheduler(
        &self,
        scheduler_name: &str,
        holder: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let lease_seconds = lease_duration.as_secs_f64();
        let updated = sqlx::query(
            r#"
UPDATE scheduler_locks
SET lease_expires_at = $4 + ($3 * interval '1 second')
WHERE scheduler_name = $1
  AND holder = $2
  AND lease_expires_at > $4
            "#,
        )
        .bind(scheduler_name)
        .bind(holder)
        .bind(lease_seconds)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn release_scheduler(&self, scheduler_name: &str, holder: &str) -> BackendResult<()> {
        sqlx::query("DELETE FROM scheduler_locks WHERE scheduler_name = $1 AND holder = $2")
            .bind(scheduler_name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn list_schedule_entries(&self, scheduler_name: &str) -> BackendResult<Vec<ScheduleEntry>> {
        let rows = sqlx::query(
            "SELECT key, task_group, name, data, schedule, last_fired_at FROM schedule_entries WHERE scheduler_name = $1",
        )
        .bind(scheduler_name)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(entry_from_row).collect::<Result<Vec<_>, _>>().map_err(storage_err)
    }

    async fn upsert_schedule_entry(&self, scheduler_name: &str, entry: ScheduleEntry) -> BackendResult<()> {
        let schedule_json = serde_json::to_value(&entry.schedule).expect("Schedule serializes infallibly");
        sqlx::query(
            r#"
INSERT INTO schedule_entries (scheduler_name, key, task_group, name, data, schedule, last_fired_at)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (scheduler_name, key) DO UPDATE
SET task_group = EXCLUDED.task_group,
    name = EXCLUDED.name,
    data = EXCLUDED.data,
    schedule = EXCLUDED.schedule
            "#,
        )
        .bind(scheduler_name)
        .bind(&entry.key)
        .bind(&entry.group)
        .bind(&entry.name)
        .bind(&entry.data)
        .bind(schedule_json)
        .bind(entry.last_fired_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn delete_schedule_entry(&self, scheduler_name: &str, key: &str) -> BackendResult<()> {
        sqlx::query("DELETE FROM schedule_entries WHERE scheduler_name = $1 AND key = $2")
            .bind(scheduler_name)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn mark_schedule_fired(&self, scheduler_name: &str, key: &str, fired_at: DateTime<Utc>) -> BackendResult<()> {
        sqlx::query("UPDATE schedule_entries SET last_fired_at = $3 WHERE scheduler_name = $1 AND key = $2")
            .bind(scheduler_name)
            .bind(key)
            .bind(fired_at)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

fn kind_as_str(kind: ResultKind) -> &'static str {
    match kind {
        ResultKind::Success => "success",
        ResultKind::Error => "error",
        ResultKind::Discarded => "discarded",
    }
}

fn kind_from_str(value: &str) -> ResultKind {
    match value {
        "error" => ResultKind::Error,
        "discarded" => ResultKind::Discarded,
        _ => ResultKind::Success,
    }
}
