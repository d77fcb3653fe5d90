mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;
use osquery_broker::clienv;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(clienv::log_filter()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            queries,
            instance,
        } => commands::run::cmd_run(config, queries, instance).await?,
        Commands::Checksum { binary } => commands::checksum::cmd_checksum(&binary)?,
        Commands::Args { config } => commands::show_args::cmd_args(config)?,
    }

    Ok(())
}
