use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

use commands::{
    CacheCommand, ConfigCommand, EnqueueCommand, QueueCommand, SyncCommand, WatchCommand,
};
use config::Config;

#[derive(Parser)]
#[command(name = "stow")]
#[command(version)]
#[command(about = "Offline cache and mutation queue with remote sync", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a mutation for later replay
    Enqueue(EnqueueCommand),

    /// Inspect and maintain the mutation queue
    Queue(QueueCommand),

    /// Read and write the local cache
    Cache(CacheCommand),

    /// Replay pending mutations against the remote
    Sync(SyncCommand),

    /// Run the background sync worker until interrupted
    Watch(WatchCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stow=info,stowaway_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let cli_config_path = cli.config.clone();
    let config = Config::load(cli.config)?;

    match &cli.command {
        Some(Commands::Enqueue(cmd)) => cmd.run(&config)?,
        Some(Commands::Queue(cmd)) => cmd.run(&config)?,
        Some(Commands::Cache(cmd)) => cmd.run(&config)?,
        Some(Commands::Sync(cmd)) => cmd.run(&config)?,
        Some(Commands::Watch(cmd)) => cmd.run(&config)?,
        Some(Commands::Config(cmd)) => cmd.run(&config, cli_config_path)?,
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
