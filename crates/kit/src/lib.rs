// taskkit-kit: the orchestrator facade (spec §4.6) — owns the backend
// handle and handler registry, starts worker pools and the scheduler,
// and wires up graceful shutdown the same way the teacher's
// `daemon::runtime::run_standalone_with_paths` wires its own `ctrl_c`
// listener against a `broadcast` shutdown channel.

pub mod config;
pub mod result;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use taskkit_backend::{Backend, BackendResult};
use taskkit_common::{ErasedHandler, Handler, HandlerRegistry, Task, TaskId};
use taskkit_scheduler::{Scheduler, SchedulerConfig};
use taskkit_worker::{spawn_group_pool, PoolHandle};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use config::{GroupConfig, KitConfig};
pub use result::{ResultHandle, WaitError};

/// How long a graceful shutdown waits for pools/scheduler to drain
/// before the process exits anyway.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Owns the shared [`Backend`] handle and the `(group, name)` →
/// handler registry (spec §9's dispatch-table design note). One `Kit`
/// per process; cheap to clone since everything inside is `Arc`.
#[derive(Clone)]
pub struct Kit {
    backend: Arc<dyn Backend>,
    registry: Arc<HandlerRegistry>,
}

impl Kit {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, registry: HandlerRegistry) -> Self {
        Self { backend, registry: Arc::new(registry) }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Encodes `value` via `handler`, enqueues the resulting task, and
    /// returns a handle producers can use to await its result (spec
    /// §4.7). `handler` need not be the same instance registered for
    /// dispatch — only its `encode_data`/`decode_result` are used here.
    pub async fn initiate_task<H: Handler>(
        &self,
        handler: Arc<H>,
        group: impl Into<String>,
        name: impl Into<String>,
        value: H::Value,
        due_at: DateTime<Utc>,
    ) -> Result<ResultHandle<H>, result::InitiateError> {
        let group = group.into();
        let name = name.into();
        let data = handler.encode_data(&group, &name, &value)?;
        let task = Task::new(group.clone(), name.clone(), data, due_at);
        let task_id = task.id;
        self.backend.enqueue(task).await?;
        Ok(ResultHandle::new(Arc::clone(&self.backend), handler, group, name, task_id))
    }

    /// Declares the full set of schedule entries `scheduler_name`
    /// should have, reconciling with what's already persisted (spec
    /// §4.5's reconciliation note): undeclared keys are removed.
    pub async fn declare_schedule(
        &self,
        scheduler_name: &str,
        entries: &[taskkit_common::ScheduleEntry],
    ) -> BackendResult<()> {
        let existing = self.backend.list_schedule_entries(scheduler_name).await?;
        for entry in entries {
            self.backend.upsert_schedule_entry(scheduler_name, entry.clone()).await?;
        }
        let declared_keys: std::collections::HashSet<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        for entry in &existing {
            if !declared_keys.contains(entry.key.as_str()) {
                self.backend.delete_schedule_entry(scheduler_name, &entry.key).await?;
            }
        }
        Ok(())
    }

    /// Starts one worker pool per configured group plus, if configured,
    /// the scheduler tick loop — all in this process. Returns a handle
    /// that tears everything down together.
    #[must_use]
    pub fn start(&self, config: &KitConfig) -> KitHandle {
        let pools = config
            .groups
            .iter()
            .map(|group| {
                spawn_group_pool(
                    Arc::clone(&self.backend),
                    Arc::clone(&self.registry),
                    group.name.clone(),
                    format!("kit-{}", std::process::id()),
                    group.concurrency,
                    group.lease_duration,
                )
            })
            .collect();

        let scheduler = config.scheduler.as_ref().map(|scheduler_config| {
            let scheduler = Arc::new(Scheduler::new(Arc::clone(&self.backend), scheduler_config.clone()));
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task_scheduler = Arc::clone(&scheduler);
            let handle = tokio::spawn(async move { task_scheduler.run(shutdown_rx).await });
            (shutdown_tx, handle, scheduler)
        });

        KitHandle { pools, scheduler }
    }

    /// Starts one OS process per configured group (plus the scheduler,
    /// if configured) by re-invoking `binary_path` with an internal
    /// subcommand, passing that process's slice of config over an env
    /// var — the process-per-worker model from spec §6, translated to
    /// a single Rust binary instead of a forking interpreter.
    pub fn start_processes(&self, config: &KitConfig, binary_path: &Path) -> std::io::Result<ProcessesHandle> {
        let mut children = Vec::new();

        for group in &config.groups {
            let payload = ProcessPayload::Group {
                database_url: config.database_url.clone(),
                name: group.name.clone(),
                concurrency: group.concurrency,
                lease_seconds: group.lease_duration.as_secs(),
            };
            children.push(spawn_worker_process(binary_path, &payload)?);
        }

        if let Some(scheduler) = &config.scheduler {
            let payload = ProcessPayload::Scheduler {
                database_url: config.database_url.clone(),
                scheduler_name: scheduler.scheduler_name.clone(),
                tick_seconds: scheduler.tick_interval.as_secs(),
                lease_seconds: scheduler.lease_duration.as_secs(),
                tz_offset_seconds: scheduler.tz.local_minus_utc(),
            };
            children.push(spawn_worker_process(binary_path, &payload)?);
        }

        Ok(ProcessesHandle { children })
    }
}

/// Builds the registry a [`Kit`] will dispatch through. Kept separate
/// from `Kit` itself so registration happens before anything starts
/// polling.
#[derive(Default)]
pub struct KitBuilder {
    registry: HandlerRegistry,
}

impl KitBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(mut self, group: impl Into<String>, name: impl Into<String>, handler: Arc<dyn ErasedHandler>) -> Self {
        self.registry.register(group, name, handler);
        self
    }

    #[must_use]
    pub fn build(self, backend: Arc<dyn Backend>) -> Kit {
        Kit::new(backend, self.registry)
    }
}

/// Handle to an in-process [`Kit::start`] run. `Drop` requests
/// shutdown of every component as a safety net, same shape as the
/// teacher's `EmbeddedDaemonHandle`.
pub struct KitHandle {
    pools: Vec<PoolHandle>,
    scheduler: Option<(watch::Sender<bool>, JoinHandle<()>, Arc<Scheduler>)>,
}

impl KitHandle {
    pub fn shutdown(&self) {
        for pool in &self.pools {
            pool.shutdown();
        }
        if let Some((tx, _, _)) = &self.scheduler {
            let _ = tx.send(true);
        }
    }

    /// Requests shutdown and waits (up to `grace`) for every pool and
    /// the scheduler to exit.
    pub async fn join(mut self, grace: Duration) {
        self.shutdown();
        let drain = async {
            for pool in self.pools.drain(..) {
                pool.join().await;
            }
            if let Some((_, handle, _)) = self.scheduler.take() {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("kit shutdown grace period elapsed before all components drained");
        }
    }

    /// Blocks until SIGINT (and, on unix, SIGTERM) is received, then
    /// drains with `grace`. Mirrors
    /// `daemon::runtime::run_standalone_with_paths`'s own `ctrl_c`
    /// listener wired against a shutdown channel.
    pub async fn run_until_signal(self, grace: Duration) {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining kit");
        self.join(grace).await;
    }
}

impl Drop for KitHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Handle to OS processes started by [`Kit::start_processes`].
pub struct ProcessesHandle {
    children: Vec<tokio::process::Child>,
}

impl ProcessesHandle {
    /// Kills every child process. `tokio::process::Child::kill_on_drop`
    /// is also set, so a dropped handle cleans up too.
    pub fn shutdown(&mut self) {
        for child in &mut self.children {
            let _ = child.start_kill();
        }
    }

    pub async fn join(mut self) {
        for child in &mut self.children {
            let _ = child.wait().await;
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
enum ProcessPayload {
    Group { database_url: String, name: String, concurrency: usize, lease_seconds: u64 },
    Scheduler { database_url: String, scheduler_name: String, tick_seconds: u64, lease_seconds: u64, tz_offset_seconds: i32 },
}

const PROCESS_PAYLOAD_ENV: &str = "TASKKIT_PROCESS_PAYLOAD";

fn spawn_worker_process(binary_path: &Path, payload: &ProcessPayload) -> std::io::Result<tokio::process::Child> {
    let encoded = serde_json::to_string(payload).expect("ProcessPayload serializes infallibly");
    Command::new(binary_path).arg("internal-worker").env(PROCESS_PAYLOAD_ENV, encoded).kill_on_drop(true).spawn()
}

/// Decodes the payload set by [`Kit::start_processes`], for the
/// `internal-worker` subcommand to read at process startup.
pub fn process_payload_from_env() -> anyhow::Result<Option<ProcessPayloadDecoded>> {
    let Ok(raw) = std::env::var(PROCESS_PAYLOAD_ENV) else {
        return Ok(None);
    };
    let payload: ProcessPayload = serde_json::from_str(&raw)?;
    Ok(Some(match payload {
        ProcessPayload::Group { database_url, name, concurrency, lease_seconds } => ProcessPayloadDecoded::Group {
            database_url,
            group: GroupConfig { name, concurrency, lease_duration: Duration::from_secs(lease_seconds) },
        },
        ProcessPayload::Scheduler { database_url, scheduler_name, tick_seconds, lease_seconds, tz_offset_seconds } => {
            ProcessPayloadDecoded::Scheduler {
                database_url,
                scheduler: SchedulerConfig {
                    scheduler_name,
                    holder: format!("proc-{}", std::process::id()),
                    lease_duration: Duration::from_secs(lease_seconds),
                    tick_interval: Duration::from_secs(tick_seconds),
                    tz: chrono::FixedOffset::east_opt(tz_offset_seconds).unwrap_or_else(|| chrono::FixedOffset::east_opt(0).unwrap()),
                },
            }
        }
    }))
}

/// Decoded form of [`ProcessPayload`], public so `taskkit-cli`'s
/// `internal-worker` subcommand can match on it without depending on
/// the private wire enum.
pub enum ProcessPayloadDecoded {
    Group { database_url: String, group: GroupConfig },
    Scheduler { database_url: String, scheduler: SchedulerConfig },
}

/// Convenience re-export so embedders that only need one task's result
/// don't have to reach into [`taskkit_common`] for the id type.
pub type TaskIdentifier = TaskId;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use taskkit_backend::memory::InMemoryBackend;
    use taskkit_common::{CodecError, Handler, HandlerAdapter};

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        type Value = Vec<u8>;

        async fn handle(&self, task: &Task) -> Result<Self::Value, Box<dyn std::error::Error + Send + Sync>> {
            Ok(task.data.clone())
        }

        fn get_retry_interval(&self, _task: &Task, _error: &(dyn std::error::Error + Send + Sync)) -> taskkit_common::RetryDecision {
            taskkit_common::RetryDecision::FailPermanently
        }

        fn encode_data(&self, _group: &str, _name: &str, value: &Self::Value) -> Result<Vec<u8>, CodecError> {
            Ok(value.clone())
        }

        fn encode_result(&self, _task: &Task, value: &Self::Value) -> Result<Vec<u8>, CodecError> {
            Ok(value.clone())
        }

        fn decode_result(&self, _task: &Task, payload: &[u8]) -> Result<Self::Value, CodecError> {
            Ok(payload.to_vec())
        }
    }

    #[tokio::test]
    async fn initiate_task_and_await_result() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let kit = KitBuilder::new().register("echo", "say", Arc::new(HandlerAdapter(EchoHandler))).build(Arc::clone(&backend));

        let config = KitConfig {
            database_url: "memory".to_string(),
            log_filter: "info".to_string(),
            groups: vec![GroupConfig { name: "echo".to_string(), concurrency: 2, lease_duration: Duration::from_secs(10) }],
            scheduler: None,
        };
        let handle = kit.start(&config);

        let result_handle = kit.initiate_task(Arc::new(EchoHandler), "echo", "say", b"hi".to_vec(), Utc::now()).await.unwrap();
        let value = result_handle.get(Duration::from_secs(5)).await.expect("result should arrive");
        assert_eq!(value, b"hi");

        handle.join(Duration::from_secs(5)).await;
    }
}
