// `taskkit internal-worker` — the subcommand `Kit::start_processes`
// re-invokes this binary with, one OS process per configured group or
// per scheduler. Reads its slice of config from `TASKKIT_PROCESS_PAYLOAD`
// (set by the parent) rather than a config file.

use std::sync::Arc;

use anyhow::Context;
use taskkit_backend::postgres::{create_pg_pool, PoolConfig, PostgresBackend};
use taskkit_backend::Backend;
use taskkit_common::HandlerRegistry;
use taskkit_kit::ProcessPayloadDecoded;
use taskkit_scheduler::Scheduler;
use taskkit_worker::spawn_group_pool;
use tokio::sync::watch;
use tracing::info;

pub async fn run() -> anyhow::Result<()> {
    let payload = taskkit_kit::process_payload_from_env()?.context("TASKKIT_PROCESS_PAYLOAD is not set; this subcommand is only meant to be spawned by Kit::start_processes")?;

    match payload {
        ProcessPayloadDecoded::Group { database_url, group } => {
            tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
            let pool = create_pg_pool(&database_url, PoolConfig::from_env()).await?;
            let backend: Arc<dyn Backend> = Arc::new(PostgresBackend::new(pool));
            let registry = Arc::new(HandlerRegistry::new());

            info!(group = %group.name, concurrency = group.concurrency, "internal worker process starting");
            let handle = spawn_group_pool(backend, registry, group.name.clone(), format!("proc-{}", std::process::id()), group.concurrency, group.lease_duration);

            wait_for_shutdown_signal().await;
            handle.join().await;
        }
        ProcessPayloadDecoded::Scheduler { database_url, scheduler } => {
            tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
            let pool = create_pg_pool(&database_url, PoolConfig::from_env()).await?;
            let backend: Arc<dyn Backend> = Arc::new(PostgresBackend::new(pool));

            info!(scheduler_name = %scheduler.scheduler_name, "internal scheduler process starting");
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let scheduler = Scheduler::new(backend, scheduler);

            let run_loop = scheduler.run(shutdown_rx);
            tokio::pin!(run_loop);
            tokio::select! {
                _ = &mut run_loop => {}
                _ = wait_for_shutdown_signal() => {
                    let _ = shutdown_tx.send(true);
                    run_loop.await;
                }
            }
        }
    }

    Ok(())
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
