// `taskkit run` — starts every configured group's worker pool plus the
// scheduler (if configured) in this process, draining on SIGINT/SIGTERM.
//
// This binary registers no handlers of its own: embedding a handler
// means linking `taskkit-kit` into an application binary and building
// a `KitBuilder` there (see `taskkit_kit::KitBuilder`). Running
// `taskkit run` directly is useful for smoke-testing a deployment's
// connectivity and group/schedule configuration — unmatched tasks
// simply fail permanently with an "unregistered handler" result.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use taskkit_backend::postgres::{check_pool_health, create_pg_pool, run_migrations, PoolConfig, PostgresBackend};
use taskkit_kit::{KitBuilder, KitConfig};
use tracing::info;

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds to wait for pools/scheduler to drain after a shutdown
    /// signal before returning anyway.
    #[arg(long, default_value_t = 30)]
    grace_seconds: u64,

    /// Skip running migrations on startup.
    #[arg(long)]
    skip_migrate: bool,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config_path = args.config.or_else(KitConfig::default_path).context("no --config given and no default config path is available")?;
    let config = KitConfig::from_file(&config_path)?;
    super::logging::init(&config.log_filter);

    let pool = create_pg_pool(&config.database_url, PoolConfig::from_env()).await?;
    check_pool_health(&pool).await?;
    if !args.skip_migrate {
        run_migrations(&pool).await?;
    }

    let backend = PostgresBackend::new(pool);
    let kit = KitBuilder::new().build(std::sync::Arc::new(backend));

    info!(groups = config.groups.len(), scheduler = config.scheduler.is_some(), "starting kit");
    let handle = kit.start(&config);
    handle.run_until_signal(Duration::from_secs(args.grace_seconds)).await;
    Ok(())
}
