// CLI subcommand dispatch.

use clap::Subcommand;

pub mod internal_worker;
pub mod migrate;
pub mod run;

pub(crate) mod logging;

#[derive(Subcommand)]
pub enum Command {
    /// Apply pending Postgres migrations
    Migrate(migrate::MigrateArgs),
    /// Start worker pools and the scheduler in this process
    Run(run::RunArgs),
    /// Internal: run the single group/scheduler described by
    /// `TASKKIT_PROCESS_PAYLOAD`. Spawned by `Kit::start_processes`,
    /// not intended to be invoked directly.
    #[command(hide = true, name = "internal-worker")]
    InternalWorker,
}

pub async fn run(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Migrate(args) => migrate::run(args).await,
        Command::Run(args) => run::run(args).await,
        Command::InternalWorker => internal_worker::run().await,
    }
}
