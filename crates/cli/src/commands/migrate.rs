// `taskkit migrate` — applies pending Postgres migrations.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use taskkit_backend::postgres::{create_pg_pool, run_migrations, PoolConfig};
use taskkit_kit::KitConfig;
use tracing::info;

#[derive(Debug, Args)]
pub struct MigrateArgs {
    /// Path to the kit config file. Defaults to the platform config
    /// directory (see `KitConfig::default_path`).
    #[arg(long)]
    config: Option<PathBuf>,
}

pub async fn run(args: MigrateArgs) -> anyhow::Result<()> {
    let config_path = args.config.or_else(KitConfig::default_path).context("no --config given and no default config path is available")?;
    let config = KitConfig::from_file(&config_path)?;
    super::logging::init(&config.log_filter);

    let pool = create_pg_pool(&config.database_url, PoolConfig::from_env()).await?;
    run_migrations(&pool).await?;
    info!("migrations applied");
    Ok(())
}
