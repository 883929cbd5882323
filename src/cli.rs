use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "drover",
    about = "Reconciliation-driven supervision for long-running coding-agent sessions",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the reconciliation loop over the configured projects
    Run {
        /// Sessions to spawn at startup (repeatable)
        #[arg(long = "session", value_name = "PROJECT:BRANCH[:ISSUE]")]
        sessions: Vec<String>,

        /// Override the tick interval in seconds
        #[arg(long)]
        interval: Option<u64>,

        /// Override the bounded per-tick worker count
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Show the effective configuration
    Config {
        /// Emit JSON instead of the human-readable table
        #[arg(long)]
        json: bool,
    },
}
