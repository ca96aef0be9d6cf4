// Group worker pool (spec §4.4): N workers sharing a group/registry,
// shut down together. Shape mirrors the teacher's
// `daemon::runtime::EmbeddedDaemonHandle` — a `watch` shutdown sender
// paired with stored `JoinHandle`s, `Drop` sending shutdown as a
// safety net so a dropped handle doesn't leak running tasks.

use std::sync::Arc;
use std::time::Duration;

use taskkit_backend::Backend;
use taskkit_common::HandlerRegistry;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::worker::{Worker, WorkerConfig};

/// Handle to a running [`GroupPool`]. Dropping it requests shutdown but
/// does not wait for workers to drain — call [`PoolHandle::join`] for
/// that.
pub struct PoolHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Requests shutdown and waits for every worker task to exit.
    pub async fn join(mut self) {
        self.shutdown();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawns `concurrency` [`Worker`] tasks polling `group`, all sharing
/// `registry` and `backend`. Enforces the concurrency bound from spec
/// §4.4 directly: exactly `concurrency` tasks run `Worker::run`, so at
/// most that many tasks in `group` are ever leased by this process at
/// once.
pub fn spawn_group_pool(
    backend: Arc<dyn Backend>,
    registry: Arc<HandlerRegistry>,
    group: impl Into<String>,
    worker_id_prefix: impl Into<String>,
    concurrency: usize,
    lease_duration: Duration,
) -> PoolHandle {
    let group = group.into();
    let worker_id_prefix = worker_id_prefix.into();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tasks = (0..concurrency.max(1))
        .map(|index| {
            let config = WorkerConfig {
                group: group.clone(),
                worker_id: format!("{worker_id_prefix}-{index}"),
                lease_duration,
            };
            let worker = Worker::new(Arc::clone(&backend), Arc::clone(&registry), config);
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move { worker.run(shutdown_rx).await })
        })
        .collect();

    PoolHandle { shutdown_tx, tasks }
}
