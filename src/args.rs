use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "osquery-broker")]
#[command(version)]
#[command(about = "Supervise osqueryd daemons and broker queries to them", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Launch the configured daemons and run queries against them
    Run {
        /// Broker config file (default: $OSQUERY_BROKER_CONFIG or ~/.config/osquery-broker/broker.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Query to run; repeat for several. Reads queries from stdin when omitted.
        #[arg(short = 'q', long = "query")]
        queries: Vec<String>,

        /// Instance to query instead of the default
        #[arg(short, long)]
        instance: Option<String>,
    },

    /// Print the MD5 checksum of an osqueryd binary
    Checksum {
        /// Path to the binary
        binary: PathBuf,
    },

    /// Print the launch arguments each configured instance would use
    Args {
        /// Broker config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
