// Single-worker state machine (spec §4.3): poll → assign → run handler →
// finalize, with a lease-renewal task running alongside the handler
// invocation so a slow task doesn't lose its claim.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskkit_backend::Backend;
use taskkit_common::{error_descriptor, Discard, HandlerRegistry, ResultKind, RetryDecision, TaskResult};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backoff::PollBackoff;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub group: String,
    pub worker_id: String,
    pub lease_duration: Duration,
}

/// Runs the poll/assign/execute/finalize loop for one `(worker_id,
/// group)` pair until `shutdown` fires. Intended to be spawned as its
/// own task by [`crate::pool::GroupPool`]; a standalone embedder can
/// also drive it directly.
pub struct Worker {
    backend: Arc<dyn Backend>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl Worker {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, registry: Arc<HandlerRegistry>, config: WorkerConfig) -> Self {
        Self { backend, registry, config }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = PollBackoff::new();

        loop {
            if *shutdown.borrow() {
                return;
            }

            let now = Utc::now();
            let assigned = self.backend.assign(&self.config.group, &self.config.worker_id, self.config.lease_duration, now).await;

            let task = match assigned {
                Ok(Some(task)) => task,
                Ok(None) => {
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
                Err(error) => {
                    warn!(group = %self.config.group, worker_id = %self.config.worker_id, %error, "assign failed, backing off");
                    let delay = backoff.next_delay();
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            backoff.reset();
            info!(task_id = %task.id, group = %task.group, name = %task.name, retry_count = task.retry_count, "task assigned");

            let (renew_shutdown_tx, renew_shutdown_rx) = watch::channel(false);
            let renew_handle = {
                let backend = Arc::clone(&self.backend);
                let task_id = task.id;
                let worker_id = self.config.worker_id.clone();
                let lease_duration = self.config.lease_duration;
                tokio::spawn(renew_lease_loop(backend, task_id, worker_id, lease_duration, renew_shutdown_rx))
            };

            self.execute_and_finalize(&task).await;

            let _ = renew_shutdown_tx.send(true);
            let _ = renew_handle.await;
        }
    }

    async fn execute_and_finalize(&self, task: &taskkit_common::Task) {
        let Some(handler) = self.registry.get(&task.group, &task.name) else {
            warn!(task_id = %task.id, group = %task.group, name = %task.name, "no handler registered, failing task permanently");
            let error = ErasedHandlerMissing { group: task.group.clone(), name: task.name.clone() };
            let descriptor = error_descriptor(&error);
            self.finalize_fail_permanent(task, descriptor).await;
            return;
        };

        match handler.run(task).await {
            Ok(payload) => {
                let result =
                    TaskResult { task_id: task.id, kind: ResultKind::Success, payload, created_at: Utc::now() };
                match self.backend.complete(task.id, &self.config.worker_id, result).await {
                    Ok(true) => info!(task_id = %task.id, "task completed"),
                    Ok(false) => warn!(task_id = %task.id, "lease lost before completion could be recorded"),
                    Err(error) => warn!(task_id = %task.id, %error, "failed to record completion"),
                }
            }
            Err(error) => {
                if error.downcast_ref::<Discard>().is_some() {
                    self.finalize_discard(task).await;
                    return;
                }

                match handler.get_retry_interval(task, error.as_ref()) {
                    RetryDecision::Retry { after } => self.finalize_retry(task, after).await,
                    RetryDecision::FailPermanently => {
                        self.finalize_fail_permanent(task, error_descriptor(error.as_ref())).await;
                    }
                    RetryDecision::Discard => self.finalize_discard(task).await,
                }
            }
        }
    }

    async fn finalize_retry(&self, task: &taskkit_common::Task, after: Duration) {
        let new_due_at = Utc::now() + chrono::Duration::from_std(after).unwrap_or_default();
        let retry_count = task.retry_count + 1;
        match self.backend.reschedule(task.id, &self.config.worker_id, new_due_at, retry_count).await {
            Ok(true) => info!(task_id = %task.id, retry_count, delay_ms = after.as_millis() as u64, "task rescheduled for retry"),
            Ok(false) => warn!(task_id = %task.id, "lease lost before retry could be recorded"),
            Err(error) => warn!(task_id = %task.id, %error, "failed to reschedule task"),
        }
    }

    async fn finalize_fail_permanent(&self, task: &taskkit_common::Task, descriptor: taskkit_common::ErrorDescriptor) {
        match self.backend.fail_permanent(task.id, &self.config.worker_id, descriptor).await {
            Ok(true) => warn!(task_id = %task.id, "task failed permanently"),
            Ok(false) => warn!(task_id = %task.id, "lease lost before permanent failure could be recorded"),
            Err(error) => warn!(task_id = %task.id, %error, "failed to record permanent failure"),
        }
    }

    async fn finalize_discard(&self, task: &taskkit_common::Task) {
        match self.backend.discard(task.id, &self.config.worker_id).await {
            Ok(true) => info!(task_id = %task.id, "task discarded"),
            Ok(false) => warn!(task_id = %task.id, "lease lost before discard could be recorded"),
            Err(error) => warn!(task_id = %task.id, %error, "failed to discard task"),
        }
    }
}

async fn renew_lease_loop(
    backend: Arc<dyn Backend>,
    task_id: taskkit_common::TaskId,
    worker_id: String,
    lease_duration: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = (lease_duration / 3).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                match backend.renew(task_id, &worker_id, lease_duration, now).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(%task_id, "lease renewal lost, another worker may claim this task");
                        return;
                    }
                    Err(error) => warn!(%task_id, %error, "lease renewal request failed"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

#[derive(Debug)]
struct ErasedHandlerMissing {
    group: String,
    name: String,
}

impl std::fmt::Display for ErasedHandlerMissing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no handler registered for group `{}` name `{}`", self.group, self.name)
    }
}

impl std::error::Error for ErasedHandlerMissing {}
