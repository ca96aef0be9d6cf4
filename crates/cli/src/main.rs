// taskkit CLI: operator-facing binary for running migrations and
// launching worker/scheduler processes against a configured backend.

use clap::Parser;

mod commands;

#[derive(Parser)]
#[command(name = "taskkit", about = "Distributed task runner operations")]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    commands::run(cli.command).await
}
