//! dbweb: diagnostics binary for the dbweb client core.
//! Wires the session event source, topic handlers and task registry
//! in-process and exposes them through a small CLI.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

mod cli;
mod client;
mod config;
mod replay;

fn init_tracing(config: &config::ClientConfig) {
    let filter = std::env::var("DBWEB_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| config.log_filter.clone());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    let config = config::ClientConfig::load(args.config.as_deref())?;
    init_tracing(&config);

    match args.command {
        cli::Command::Replay(opts) => {
            tracing::info!(path = %opts.path.display(), "replaying frame log");
            let (runtime, _outbound) =
                client::ClientRuntime::new(&config, Arc::new(client::OfflineTaskApi));
            let summary = replay::run(
                &runtime,
                &opts.path,
                opts.topic.as_deref(),
                Duration::from_millis(opts.timeout_ms),
            )
            .await?;
            runtime.shutdown();
            tracing::debug!(idle = runtime.is_idle(), "runtime shut down");
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        cli::Command::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
