//! Sync CLI commands for replaying the queue against the remote.

use clap::{Args, Subcommand};
use stowaway_core::{MutationQueue, SyncReport};

use super::{build_engine, open_store, print_progress, runtime, CommandError};
use crate::config::Config;

/// Replay pending mutations against the remote
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Show remote configuration and queue status
    Status,
}

impl SyncCommand {
    pub fn run(&self, config: &Config) -> Result<(), CommandError> {
        let rt = runtime()?;

        match &self.command {
            None => rt.block_on(self.sync(config)),
            Some(SyncSubcommand::Status) => rt.block_on(self.status(config)),
        }
    }

    async fn sync(&self, config: &Config) -> Result<(), CommandError> {
        let store = open_store(config).await?;
        let engine = build_engine(config, store.clone())?;

        println!("Syncing with remote...");

        let printer = tokio::spawn(print_progress(engine.subscribe()));
        let result = engine.sync_pending().await;
        match &result {
            Ok(report) if report.total > 0 => {
                let _ = printer.await;
            }
            _ => printer.abort(),
        }
        store.close().await;

        let report = result?;
        print_report(&report);
        Ok(())
    }

    async fn status(&self, config: &Config) -> Result<(), CommandError> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        match &config.remote.url {
            Some(url) => {
                println!("Remote:       {}", url);
                println!(
                    "API key:      {}",
                    if config.remote.api_key.is_some() {
                        "set"
                    } else {
                        "not set"
                    }
                );
            }
            None => {
                println!("Remote:       not configured");
                println!();
                println!("To enable sync, add to your config file:");
                println!();
                println!("  remote:");
                println!("    url: \"https://your-project.supabase.co\"");
                println!();
                println!("Or set environment variable:");
                println!("  STOW_REMOTE_URL");
            }
        }
        println!(
            "Catalog:      {} ({} registered)",
            if config.catalog.strict {
                "strict"
            } else {
                "permissive"
            },
            config.catalog.collections.len()
        );
        println!("Batch limit:  {}", config.sync.batch_limit);
        println!("Call timeout: {}s", config.sync.call_timeout_secs);
        println!();

        let store = open_store(config).await?;
        let stats = MutationQueue::new(store.clone()).try_stats().await;
        store.close().await;
        let stats = stats?;

        println!("Queue");
        println!("-----");
        println!("  pending: {}", stats.pending);
        println!("  done:    {}", stats.done);
        println!("  failed:  {}", stats.failed);

        Ok(())
    }
}

fn print_report(report: &SyncReport) {
    println!();
    if report.total == 0 {
        println!("Nothing to sync.");
        return;
    }

    for failure in &report.failures {
        println!("  ✗ {} {} - {}", failure.id, failure.action, failure.error);
    }
    println!(
        "Synced {} of {} entr{} ({} failed).",
        report.succeeded,
        report.total,
        if report.total == 1 { "y" } else { "ies" },
        report.failed
    );
    if !report.is_clean() {
        println!("Run 'stow queue retry' to requeue failed entries.");
    }
}
