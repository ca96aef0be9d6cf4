// taskkit-scheduler: materializes recurring `ScheduleEntry` rows into
// concrete tasks, exactly once across any number of scheduler replicas
// (spec §4.5). Mutual exclusion across replicas uses the same
// acquire-or-renew CAS shape as the teacher's
// `leader::LeaseManager::acquire` (renamed `acquire_scheduler` on
// `Backend`) — only the replica holding the lock ever ticks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use taskkit_backend::Backend;
use taskkit_common::{ScheduleEntry, Task, TaskId};
use tokio::sync::watch;
use tracing::{info, warn};

/// Upper bound on catch-up occurrences materialized in a single tick
/// for one entry, so a scheduler that was down for a long time (or a
/// misconfigured sub-second schedule) can't spin forever in one tick.
const MAX_CATCH_UP_OCCURRENCES: u32 = 10_000;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Logical name schedulers across replicas coordinate under.
    /// Mandatory: a scheduler never ticks without first holding this
    /// lock (Open Question resolution, see DESIGN.md).
    pub scheduler_name: String,
    /// Identity of this replica within `scheduler_name`.
    pub holder: String,
    pub lease_duration: Duration,
    pub tick_interval: Duration,
    pub tz: FixedOffset,
}

#[derive(Default)]
struct Counters {
    ticks_total: AtomicU64,
    occurrences_enqueued_total: AtomicU64,
}

/// Drives the tick loop for one scheduler replica (spec §4.5). Safe to
/// run one instance per replica against the same backend; at most one
/// replica holding `scheduler_name`'s lock ticks at a time.
pub struct Scheduler {
    backend: Arc<dyn Backend>,
    config: SchedulerConfig,
    counters: Counters,
}

impl Scheduler {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: SchedulerConfig) -> Self {
        Self { backend, config, counters: Counters::default() }
    }

    pub fn ticks_total(&self) -> u64 {
        self.counters.ticks_total.load(Ordering::Relaxed)
    }

    pub fn occurrences_enqueued_total(&self) -> u64 {
        self.counters.occurrences_enqueued_total.load(Ordering::Relaxed)
    }

    /// Declares the full set of entries this scheduler name should have
    /// persisted, reconciling against whatever's already there: new
    /// keys are upserted, keys no longer declared are deleted. Call
    /// this once at startup before `run` (spec §4.5's reconciliation
    /// note); safe to call again any time entries change.
    pub async fn reconcile(&self, declared: &[ScheduleEntry]) -> taskkit_backend::BackendResult<()> {
        let existing = self.backend.list_schedule_entries(&self.config.scheduler_name).await?;

        for entry in declared {
            self.backend.upsert_schedule_entry(&self.config.scheduler_name, entry.clone()).await?;
            info!(scheduler_name = %self.config.scheduler_name, key = %entry.key, "schedule entry declared");
        }

        let declared_keys: std::collections::HashSet<&str> = declared.iter().map(|e| e.key.as_str()).collect();
        for entry in &existing {
            if !declared_keys.contains(entry.key.as_str()) {
                self.backend.delete_schedule_entry(&self.config.scheduler_name, &entry.key).await?;
                info!(scheduler_name = %self.config.scheduler_name, key = %entry.key, "schedule entry removed");
            }
        }

        Ok(())
    }

    /// Runs the tick loop until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let now = Utc::now();
            match self.backend.acquire_scheduler(&self.config.scheduler_name, &self.config.holder, self.config.lease_duration, now).await {
                Ok(true) => {
                    self.counters.ticks_total.fetch_add(1, Ordering::Relaxed);
                    if let Err(error) = self.tick(now).await {
                        warn!(scheduler_name = %self.config.scheduler_name, %error, "scheduler tick failed");
                    }
                }
                Ok(false) => {
                    // Another replica holds the lock this tick; nothing to do.
                }
                Err(error) => {
                    warn!(scheduler_name = %self.config.scheduler_name, %error, "failed to acquire scheduler lock");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn tick(&self, now: DateTime<Utc>) -> taskkit_backend::BackendResult<()> {
        let entries = self.backend.list_schedule_entries(&self.config.scheduler_name).await?;

        for entry in entries {
            self.fire_due_occurrences(&entry, now).await?;
        }

        Ok(())
    }

    async fn fire_due_occurrences(&self, entry: &ScheduleEntry, now: DateTime<Utc>) -> taskkit_backend::BackendResult<()> {
        let mut anchor = entry.last_fired_at.unwrap_or(now - chrono::Duration::seconds(1));

        for _ in 0..MAX_CATCH_UP_OCCURRENCES {
            let next_fire = entry.schedule.next_after(anchor, self.config.tz);
            if next_fire > now {
                break;
            }

            let task_id = TaskId::from_occurrence(&self.config.scheduler_name, &entry.key, next_fire);
            let task = Task {
                id: task_id,
                group: entry.group.clone(),
                name: entry.name.clone(),
                data: entry.data.clone(),
                due_at: next_fire,
                retry_count: 0,
                assignee: None,
                lease_expires_at: None,
            };

            self.backend.enqueue(task).await?;
            self.backend.mark_schedule_fired(&self.config.scheduler_name, &entry.key, next_fire).await?;
            self.counters.occurrences_enqueued_total.fetch_add(1, Ordering::Relaxed);
            info!(scheduler_name = %self.config.scheduler_name, key = %entry.key, fire_at = %next_fire, "schedule entry fired");

            anchor = next_fire;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskkit_backend::memory::InMemoryBackend;
    use taskkit_common::{RegularSchedule, Schedule};

    fn utc_tz() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn config(name: &str) -> SchedulerConfig {
        SchedulerConfig {
            scheduler_name: name.to_string(),
            holder: "replica-a".to_string(),
            lease_duration: Duration::from_secs(10),
            tick_interval: Duration::from_millis(10),
            tz: utc_tz(),
        }
    }

    #[tokio::test]
    async fn reconcile_then_tick_fires_due_entry_exactly_once() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let scheduler = Scheduler::new(Arc::clone(&backend), config("cron"));

        let entry = ScheduleEntry::new(
            "daily-report",
            "reports",
            "generate",
            b"{}".to_vec(),
            Schedule::Regular(RegularSchedule::every_seconds([0])),
        );
        scheduler.reconcile(std::slice::from_ref(&entry)).await.unwrap();

        let now = Utc::now();
        scheduler.tick(now).await.unwrap();
        let fired_once = scheduler.occurrences_enqueued_total();
        assert!(fired_once <= 1);

        // A second tick at the same instant must not refire the same occurrence.
        scheduler.tick(now).await.unwrap();
        assert_eq!(scheduler.occurrences_enqueued_total(), fired_once);
    }

    #[tokio::test]
    async fn reconcile_removes_undeclared_entries() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let scheduler = Scheduler::new(Arc::clone(&backend), config("cron"));

        let entry = ScheduleEntry::new("a", "g", "n", vec![], Schedule::Regular(RegularSchedule::default()));
        scheduler.reconcile(std::slice::from_ref(&entry)).await.unwrap();
        assert_eq!(backend.list_schedule_entries("cron").await.unwrap().len(), 1);

        scheduler.reconcile(&[]).await.unwrap();
        assert!(backend.list_schedule_entries("cron").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_excludes_second_replica() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let now = Utc::now();
        let granted =
            backend.acquire_scheduler("cron", "replica-a", Duration::from_secs(10), now).await.unwrap();
        assert!(granted);
        let denied =
            backend.acquire_scheduler("cron", "replica-b", Duration::from_secs(10), now).await.unwrap();
        assert!(!denied);
    }
}
