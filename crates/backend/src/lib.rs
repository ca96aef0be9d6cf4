// taskkit-backend: the storage contract (spec §4.1) plus two adapters
// that satisfy it — a Postgres reference adapter for production and
// multi-process correctness, and an in-memory adapter for embedders
// and fast tests.

pub mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskkit_common::{ErrorDescriptor, ScheduleEntry, Task, TaskId, TaskResult};

pub use error::{BackendError, BackendResult};
pub use memory::InMemoryBackend;

/// The single source of truth for task/result/schedule state. All
/// state-changing operations are compare-and-swap against
/// `(assignee, lease_expires_at)` or an equivalent lock row — no lock
/// is ever held across a handler invocation (spec §5).
///
/// Implementations MUST be linearizable with respect to each other on
/// a single task id (spec §6).
#[async_trait]
pub trait Backend: Send + Sync {
    /// Inserts `task` with `retry_count = 0`, no assignee. Idempotent
    /// on `id`: a duplicate insert is a no-op, not an error.
    async fn enqueue(&self, task: Task) -> BackendResult<()>;

    /// Atomically selects the task in `group` with the smallest
    /// `due_at <= now` that is unassigned or lease-expired, claims it
    /// for `worker_id`, and returns it. Ties on `due_at` broken by id,
    /// lexicographically.
    async fn assign(
        &self,
        group: &str,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<Option<Task>>;

    /// Extends the lease iff `worker_id` still holds it and it hasn't
    /// expired. `false` means the lease was lost.
    async fn renew(
        &self,
        task_id: TaskId,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<bool>;

    /// Writes `result` and deletes the task row iff `worker_id` still
    /// holds the lease. `false` means the lease was lost — the caller
    /// must not treat the task as completed.
    async fn complete(&self, task_id: TaskId, worker_id: &str, result: TaskResult) -> BackendResult<bool>;

    /// Clears the assignee and sets `due_at`/`retry_count` iff the
    /// lease is held.
    async fn reschedule(
        &self,
        task_id: TaskId,
        worker_id: &str,
        new_due_at: DateTime<Utc>,
        retry_count: u32,
    ) -> BackendResult<bool>;

    /// Deletes the task row (no result) iff the lease is held.
    async fn discard(&self, task_id: TaskId, worker_id: &str) -> BackendResult<bool>;

    /// Writes an error result and deletes the task iff the lease is held.
    async fn fail_permanent(&self, task_id: TaskId, worker_id: &str, error: ErrorDescriptor) -> BackendResult<bool>;

    /// Returns the result if it exists by `block_until`, else `None`.
    /// Implementations may poll or use an internal notification
    /// mechanism; the contract is unchanged either way (spec §9).
    async fn get_result(&self, task_id: TaskId, block_until: DateTime<Utc>) -> BackendResult<Option<TaskResult>>;

    /// Compare-and-swap: succeeds when no holder exists or the
    /// existing lease is expired.
    async fn acquire_scheduler(
        &self,
        scheduler_name: &str,
        holder: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<bool>;

    /// Extends a held scheduler lock. `false` means it was lost.
    async fn renew_scheduler(
        &self,
        scheduler_name: &str,
        holder: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<bool>;

    /// Voluntarily releases a scheduler lock this holder owns.
    async fn release_scheduler(&self, scheduler_name: &str, holder: &str) -> BackendResult<()>;

    /// All schedule entries currently declared under `scheduler_name`.
    async fn list_schedule_entries(&self, scheduler_name: &str) -> BackendResult<Vec<ScheduleEntry>>;

    /// Inserts or replaces a schedule entry by `(scheduler_name, key)`.
    async fn upsert_schedule_entry(&self, scheduler_name: &str, entry: ScheduleEntry) -> BackendResult<()>;

    /// Removes a schedule entry by `(scheduler_name, key)`.
    async fn delete_schedule_entry(&self, scheduler_name: &str, key: &str) -> BackendResult<()>;

    /// Records that `key` last fired at `fired_at`.
    async fn mark_schedule_fired(&self, scheduler_name: &str, key: &str, fired_at: DateTime<Utc>) -> BackendResult<()>;
}
