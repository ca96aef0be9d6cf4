// Core task/result domain types shared across all taskkit crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque task identifier. Stable, ≥128 bits of entropy (a UUID v4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds a deterministic id from a schedule key and firing instant.
    ///
    /// Used by the scheduler so the same occurrence always maps to the
    /// same task id, which combined with `enqueue`'s idempotence gives
    /// at-most-once materialization across scheduler failovers.
    #[must_use]
    pub fn from_occurrence(scheduler_name: &str, key: &str, fire_at: DateTime<Utc>) -> Self {
        let namespace = Uuid::NAMESPACE_OID;
        let name = format!("{scheduler_name}:{key}:{}", fire_at.timestamp_micros());
        Self(Uuid::new_v5(&namespace, name.as_bytes()))
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// The unit of work. See crate docs for the full state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    /// Routing key; determines which pools may claim this task.
    pub group: String,
    /// Handler dispatch key within `group`.
    pub name: String,
    /// Opaque payload, encoded by the handler.
    pub data: Vec<u8>,
    pub due_at: DateTime<Utc>,
    pub retry_count: u32,
    pub assignee: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Task {
    #[must_use]
    pub fn new(group: impl Into<String>, name: impl Into<String>, data: Vec<u8>, due_at: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            group: group.into(),
            name: name.into(),
            data,
            due_at,
            retry_count: 0,
            assignee: None,
            lease_expires_at: None,
        }
    }

    /// Derives this task's logical state against `now`. `done`/`failed`
    /// are backend-level facts (a result row exists) that this type
    /// alone cannot observe — callers that need those states consult
    /// the backend directly; this method only distinguishes the three
    /// states visible on the task row itself.
    #[must_use]
    pub fn state(&self, now: DateTime<Utc>) -> TaskState {
        match (&self.assignee, self.lease_expires_at) {
            (Some(_), Some(expires_at)) if expires_at > now => TaskState::Running,
            _ if self.due_at <= now => TaskState::Ready,
            _ => TaskState::Pending,
        }
    }

    #[must_use]
    pub fn is_leased_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.assignee.as_deref() == Some(worker_id)
            && self.lease_expires_at.is_some_and(|expires_at| expires_at > now)
    }
}

/// Derived task state. Never stored — always computed against a `now`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
}

/// The outcome of a completed task. Produced exactly once; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub kind: ResultKind,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Success,
    Error,
    Discarded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occurrence_id_is_deterministic() {
        let fire_at = Utc::now();
        let a = TaskId::from_occurrence("s1", "k1", fire_at);
        let b = TaskId::from_occurrence("s1", "k1", fire_at);
        assert_eq!(a, b);
    }

    #[test]
    fn occurrence_id_differs_by_key_and_time() {
        let fire_at = Utc::now();
        let a = TaskId::from_occurrence("s1", "k1", fire_at);
        let b = TaskId::from_occurrence("s1", "k2", fire_at);
        let c = TaskId::from_occurrence("s1", "k1", fire_at + chrono::Duration::seconds(1));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn state_is_pending_before_due() {
        let now = Utc::now();
        let task = Task::new("g", "n", vec![], now + chrono::Duration::seconds(10));
        assert_eq!(task.state(now), TaskState::Pending);
    }

    #[test]
    fn state_is_ready_when_due_and_unassigned() {
        let now = Utc::now();
        let task = Task::new("g", "n", vec![], now - chrono::Duration::seconds(1));
        assert_eq!(task.state(now), TaskState::Ready);
    }

    #[test]
    fn state_is_running_with_unexpired_lease() {
        let now = Utc::now();
        let mut task = Task::new("g", "n", vec![], now - chrono::Duration::seconds(1));
        task.assignee = Some("worker-1".into());
        task.lease_expires_at = Some(now + chrono::Duration::seconds(30));
        assert_eq!(task.state(now), TaskState::Running);
    }

    #[test]
    fn state_is_ready_when_lease_expired() {
        let now = Utc::now();
        let mut task = Task::new("g", "n", vec![], now - chrono::Duration::seconds(1));
        task.assignee = Some("worker-1".into());
        task.lease_expires_at = Some(now - chrono::Duration::seconds(1));
        assert_eq!(task.state(now), TaskState::Ready);
    }

    #[test]
    fn is_leased_by_checks_holder_and_expiry() {
        let now = Utc::now();
        let mut task = Task::new("g", "n", vec![], now);
        task.assignee = Some("worker-1".into());
        task.lease_expires_at = Some(now + chrono::Duration::seconds(5));
        assert!(task.is_leased_by("worker-1", now));
        assert!(!task.is_leased_by("worker-2", now));
        assert!(!task.is_leased_by("worker-1", now + chrono::Duration::seconds(10)));
    }
}
