use clap::{Args, Subcommand};
use stowaway_core::Cache;

use super::{open_store, parse_json, runtime, CommandError};
use crate::config::Config;

/// Read and write the local cache
#[derive(Debug, Args)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub command: CacheSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum CacheSubcommand {
    /// Print the cached value for a key
    Get { key: String },

    /// Store a JSON value under a key, replacing any previous value
    Set { key: String, value: String },

    /// Remove a key
    Delete { key: String },
}

impl CacheCommand {
    pub fn run(&self, config: &Config) -> Result<(), CommandError> {
        let rt = runtime()?;
        rt.block_on(async {
            let store = open_store(config).await?;
            let result = self.execute(&Cache::new(store.clone())).await;
            store.close().await;
            result
        })
    }

    async fn execute(&self, cache: &Cache) -> Result<(), CommandError> {
        match &self.command {
            CacheSubcommand::Get { key } => {
                let record = cache
                    .try_get_record(key)
                    .await?
                    .ok_or_else(|| CommandError::NotFound(format!("cache key '{}'", key)))?;
                let value = serde_json::to_string_pretty(&record.value)
                    .map_err(CommandError::InvalidJson)?;
                println!("{}", value);
                eprintln!("(updated {})", record.updated_at.to_rfc3339());
            }
            CacheSubcommand::Set { key, value } => {
                let value = parse_json(value)?;
                cache.try_set(key, &value).await?;
                println!("Cached '{}'", key);
            }
            CacheSubcommand::Delete { key } => {
                if cache.try_delete(key).await? {
                    println!("Deleted '{}'", key);
                } else {
                    println!("No cached value for '{}'", key);
                }
            }
        }
        Ok(())
    }
}
