// In-process backend adapter. Not linearizable across machines — only
// within the single `tokio::sync::Mutex` guarding this process's state
// — but satisfies the exact same `Backend` trait as `PostgresBackend`,
// so it's useful both for embedders who don't want a Postgres
// dependency and for this workspace's own fast unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskkit_common::{ErrorDescriptor, ResultKind, ScheduleEntry, Task, TaskId, TaskResult};
use tokio::sync::{Mutex, Notify};

use crate::{Backend, BackendResult};

#[derive(Debug, Clone)]
struct SchedulerLock {
    holder: String,
    lease_expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    results: HashMap<TaskId, TaskResult>,
    schedule_entries: HashMap<String, HashMap<String, ScheduleEntry>>,
    scheduler_locks: HashMap<String, SchedulerLock>,
}

/// Single-process [`Backend`] implementation backed by a mutex-guarded
/// map. See module docs for the linearizability caveat.
pub struct InMemoryBackend {
    state: Mutex<State>,
    result_notify: Notify,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()), result_notify: Notify::new() }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn enqueue(&self, task: Task) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state.tasks.entry(task.id).or_insert(task);
        Ok(())
    }

    async fn assign(
        &self,
        group: &str,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<Option<Task>> {
        let mut state = self.state.lock().await;

        let candidate_id = state
            .tasks
            .values()
            .filter(|task| task.group == group && task.due_at <= now)
            .filter(|task| match task.lease_expires_at {
                Some(expires_at) => expires_at <= now,
                None => true,
            })
            .min_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.id.cmp(&b.id)))
            .map(|task| task.id);

        let Some(candidate_id) = candidate_id else {
            return Ok(None);
        };

        let task = state.tasks.get_mut(&candidate_id).expect("candidate id came from this map");
        task.assignee = Some(worker_id.to_string());
        task.lease_expires_at = Some(now + chrono::Duration::from_std(lease_duration).unwrap_or_default());
        Ok(Some(task.clone()))
    }

    async fn renew(
        &self,
        task_id: TaskId,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if !task.is_leased_by(worker_id, now) {
            return Ok(false);
        }
        task.lease_expires_at = Some(now + chrono::Duration::from_std(lease_duration).unwrap_or_default());
        Ok(true)
    }

    async fn complete(&self, task_id: TaskId, worker_id: &str, result: TaskResult) -> BackendResult<bool> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get(&task_id) else {
            return Ok(false);
        };
        if !task.is_leased_by(worker_id, Utc::now()) {
            return Ok(false);
        }
        state.tasks.remove(&task_id);
        state.results.insert(task_id, result);
        drop(state);
        self.result_notify.notify_waiters();
        Ok(true)
    }

    async fn reschedule(
        &self,
        task_id: TaskId,
        worker_id: &str,
        new_due_at: DateTime<Utc>,
        retry_count: u32,
    ) -> BackendResult<bool> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if task.assignee.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        task.assignee = None;
        task.lease_expires_at = None;
        task.due_at = new_due_at;
        task.retry_count = retry_count;
        Ok(true)
    }

    async fn discard(&self, task_id: TaskId, worker_id: &str) -> BackendResult<bool> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get(&task_id) else {
            return Ok(false);
        };
        if !task.is_leased_by(worker_id, Utc::now()) {
            return Ok(false);
        }
        state.tasks.remove(&task_id);
        Ok(true)
    }

    async fn fail_permanent(&self, task_id: TaskId, worker_id: &str, error: ErrorDescriptor) -> BackendResult<bool> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get(&task_id) else {
            return Ok(false);
        };
        if !task.is_leased_by(worker_id, Utc::now()) {
            return Ok(false);
        }
        state.tasks.remove(&task_id);
        state.results.insert(
            task_id,
            TaskResult { task_id, kind: ResultKind::Error, payload: error.to_json(), created_at: Utc::now() },
        );
        drop(state);
        self.result_notify.notify_waiters();
        Ok(true)
    }

    async fn get_result(&self, task_id: TaskId, block_until: DateTime<Utc>) -> BackendResult<Option<TaskResult>> {
        loop {
            {
                let state = self.state.lock().await;
                if let Some(result) = state.results.get(&task_id) {
                    return Ok(Some(result.clone()));
                }
            }

            let remaining = (block_until - Utc::now()).to_std().unwrap_or_default();
            if remaining.is_zero() {
                return Ok(None);
            }

            let wait = remaining.min(Duration::from_millis(50));
            let _ = tokio::time::timeout(wait, self.result_notify.notified()).await;
        }
    }

    async fn acquire_scheduler(
        &self,
        scheduler_name: &str,
        holder: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let mut state = self.state.lock().await;
        let expires_at = now + chrono::Duration::from_std(lease_duration).unwrap_or_default();

        match state.scheduler_locks.get(scheduler_name) {
            Some(lock) if lock.lease_expires_at > now && lock.holder != holder => Ok(false),
            _ => {
                state
                    .scheduler_locks
                    .insert(scheduler_name.to_string(), SchedulerLock { holder: holder.to_string(), lease_expires_at: expires_at });
                Ok(true)
            }
        }
    }

    async fn renew_scheduler(
        &self,
        scheduler_name: &str,
        holder: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let mut state = self.state.lock().await;
        match state.scheduler_locks.get_mut(scheduler_name) {
            Some(lock) if lock.holder == holder && lock.lease_expires_at > now => {
                lock.lease_expires_at = now + chrono::Duration::from_std(lease_duration).unwrap_or_default();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_scheduler(&self, scheduler_name: &str, holder: &str) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        if let Some(lock) = state.scheduler_locks.get(scheduler_name) {
            if lock.holder == holder {
                state.scheduler_locks.remove(scheduler_name);
            }
        }
        Ok(())
    }

    async fn list_schedule_entries(&self, scheduler_name: &str) -> BackendResult<Vec<ScheduleEntry>> {
        let state = self.state.lock().await;
        Ok(state.schedule_entries.get(scheduler_name).map(|entries| entries.values().cloned().collect()).unwrap_or_default())
    }

    async fn upsert_schedule_entry(&self, scheduler_name: &str, entry: ScheduleEntry) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state.schedule_entries.entry(scheduler_name.to_string()).or_default().insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete_schedule_entry(&self, scheduler_name: &str, key: &str) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        if let Some(entries) = state.schedule_entries.get_mut(scheduler_name) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn mark_schedule_fired(&self, scheduler_name: &str, key: &str, fired_at: DateTime<Utc>) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.schedule_entries.get_mut(scheduler_name).and_then(|entries| entries.get_mut(key)) {
            entry.last_fired_at = Some(fired_at);
        }
        Ok(())
    }
}

/// Shared handle convenience for tests/embedders that want `Arc<dyn Backend>`.
#[must_use]
pub fn shared() -> Arc<dyn Backend> {
    Arc::new(InMemoryBackend::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskkit_common::Task;

    #[tokio::test]
    async fn enqueue_is_idempotent_on_id() {
        let backend = InMemoryBackend::new();
        let task = Task::new("g", "echo", b"hi".to_vec(), Utc::now());
        backend.enqueue(task.clone()).await.unwrap();
        backend.enqueue(task.clone()).await.unwrap();

        let assigned = backend.assign("g", "w1", Duration::from_secs(60), Utc::now()).await.unwrap();
        assert!(assigned.is_some());
        let none_left = backend.assign("g", "w2", Duration::from_secs(60), Utc::now()).await.unwrap();
        assert!(none_left.is_none());
    }

    #[tokio::test]
    async fn assign_respects_due_at_then_id_ordering() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let a = Task::new("g", "n", vec![], now + chrono::Duration::seconds(2));
        let b = Task::new("g", "n", vec![], now + chrono::Duration::seconds(1));
        let c = Task::new("g", "n", vec![], now + chrono::Duration::seconds(3));
        backend.enqueue(a.clone()).await.unwrap();
        backend.enqueue(b.clone()).await.unwrap();
        backend.enqueue(c.clone()).await.unwrap();

        let far_future = now + chrono::Duration::seconds(10);
        let first = backend.assign("g", "w1", Duration::from_secs(60), far_future).await.unwrap().unwrap();
        let second = backend.assign("g", "w1", Duration::from_secs(60), far_future).await.unwrap().unwrap();
        let third = backend.assign("g", "w1", Duration::from_secs(60), far_future).await.unwrap().unwrap();

        assert_eq!(first.id, b.id);
        assert_eq!(second.id, a.id);
        assert_eq!(third.id, c.id);
    }

    #[tokio::test]
    async fn renew_fails_once_lease_lost() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let task = Task::new("g", "n", vec![], now);
        backend.enqueue(task.clone()).await.unwrap();
        let assigned = backend.assign("g", "w1", Duration::from_millis(10), now).await.unwrap().unwrap();

        let after_expiry = now + chrono::Duration::milliseconds(50);
        let renewed = backend.renew(assigned.id, "w1", Duration::from_secs(60), after_expiry).await.unwrap();
        assert!(!renewed);

        // And a reassignment by another worker succeeds.
        let reassigned = backend.assign("g", "w2", Duration::from_secs(60), after_expiry).await.unwrap();
        assert!(reassigned.is_some());
    }

    #[tokio::test]
    async fn complete_requires_held_lease() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let task = Task::new("g", "n", vec![], now);
        backend.enqueue(task.clone()).await.unwrap();
        let assigned = backend.assign("g", "w1", Duration::from_secs(60), now).await.unwrap().unwrap();

        let result =
            TaskResult { task_id: assigned.id, kind: ResultKind::Success, payload: b"ok".to_vec(), created_at: now };
        let wrong_worker = backend.complete(assigned.id, "w2", result.clone()).await.unwrap();
        assert!(!wrong_worker);

        let ok = backend.complete(assigned.id, "w1", result).await.unwrap();
        assert!(ok);

        let fetched = backend.get_result(assigned.id, now).await.unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn get_result_times_out_when_absent() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let result = backend.get_result(TaskId::new(), now + chrono::Duration::milliseconds(20)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn scheduler_lock_is_exclusive_until_expiry() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let granted = backend.acquire_scheduler("s1", "replica-a", Duration::from_millis(50), now).await.unwrap();
        assert!(granted);

        let denied = backend.acquire_scheduler("s1", "replica-b", Duration::from_millis(50), now).await.unwrap();
        assert!(!denied);

        let after_expiry = now + chrono::Duration::milliseconds(100);
        let granted_again = backend.acquire_scheduler("s1", "replica-b", Duration::from_millis(50), after_expiry).await.unwrap();
        assert!(granted_again);
    }

    #[tokio::test]
    async fn schedule_entries_reconcile_by_key() {
        let backend = InMemoryBackend::new();
        let entry = ScheduleEntry::new("k1", "g", "n", vec![], taskkit_common::Schedule::Regular(taskkit_common::RegularSchedule::default()));
        backend.upsert_schedule_entry("s1", entry.clone()).await.unwrap();
        let entries = backend.list_schedule_entries("s1").await.unwrap();
        assert_eq!(entries.len(), 1);

        backend.delete_schedule_entry("s1", "k1").await.unwrap();
        let entries = backend.list_schedule_entries("s1").await.unwrap();
        assert!(entries.is_empty());
    }
}
