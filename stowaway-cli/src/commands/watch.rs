use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use stowaway_core::SyncWorker;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;

use super::{build_engine, open_store, runtime, CommandError};
use crate::config::Config;

/// Run the background sync worker until interrupted
#[derive(Debug, Args)]
pub struct WatchCommand {
    /// Seconds between drains (default: sync.interval_secs)
    #[arg(long)]
    pub interval_secs: Option<u64>,
}

impl WatchCommand {
    pub fn run(&self, config: &Config) -> Result<(), CommandError> {
        let rt = runtime()?;
        rt.block_on(self.watch(config))
    }

    fn interval(&self, config: &Config) -> Option<Duration> {
        match self.interval_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => config.sync.interval(),
        }
    }

    async fn watch(&self, config: &Config) -> Result<(), CommandError> {
        let store = open_store(config).await?;
        let engine = Arc::new(build_engine(config, store.clone())?);
        let interval = self.interval(config);

        // No connectivity probe: the remote is treated as reachable
        let (_reachable, signal) = watch::channel(true);

        let mut progress = engine.subscribe();
        let printer = tokio::spawn(async move {
            loop {
                match progress.recv().await {
                    Ok(event) if event.processed > 0 => {
                        println!("  [{}/{}]", event.processed, event.total);
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let handle = SyncWorker::spawn(engine.clone(), signal, interval);
        match interval {
            Some(interval) => println!(
                "Watching queue (every {}s). Press Ctrl-C to stop.",
                interval.as_secs()
            ),
            None => println!("Watching queue. Press Ctrl-C to stop."),
        }

        tokio::signal::ctrl_c().await?;
        println!("Stopping...");

        handle.stop().await;
        printer.abort();
        store.close().await;
        Ok(())
    }
}
