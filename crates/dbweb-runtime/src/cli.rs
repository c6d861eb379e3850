//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dbweb", about = "dbweb client core diagnostics")]
pub struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(long, short = 'c', global = true, env = "DBWEB_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Replay a captured frame log (one JSON event per line) and print a summary
    Replay(ReplayOpts),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(clap::Args)]
pub struct ReplayOpts {
    /// Path to the frame log
    pub path: PathBuf,

    /// Only replay frames for this topic
    #[arg(long)]
    pub topic: Option<String>,

    /// Give up waiting for delivery after this many milliseconds
    #[arg(long, default_value = "5000")]
    pub timeout_ms: u64,
}
