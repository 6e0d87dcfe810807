//! Inspect and maintain the mutation queue.

use chrono::{DateTime, Duration, Utc};
use clap::{Args, Subcommand, ValueEnum};
use stowaway_core::{MutationQueue, QueueEntry, QueueStatus};

use super::{open_store, runtime, CommandError, OutputFormat};
use crate::config::Config;

#[derive(Debug, Args)]
pub struct QueueCommand {
    #[command(subcommand)]
    pub command: QueueSubcommand,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Pending,
    Done,
    Failed,
}

impl From<StatusArg> for QueueStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => QueueStatus::Pending,
            StatusArg::Done => QueueStatus::Done,
            StatusArg::Failed => QueueStatus::Failed,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum QueueSubcommand {
    /// List queue entries, oldest first
    List {
        /// Only show entries with this status
        #[arg(long, short, value_enum)]
        status: Option<StatusArg>,

        /// Maximum number of entries to show
        #[arg(long, short, default_value = "50")]
        limit: usize,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a single entry
    Show {
        id: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Count entries by status
    Stats {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Move failed entries back to pending
    Retry {
        /// Only requeue entries tried fewer times than this (default: sync.max_tries)
        #[arg(long)]
        max_tries: Option<u32>,
    },

    /// Delete done entries older than the given age
    Purge {
        #[arg(long, default_value = "7")]
        older_than_days: u32,
    },
}

impl QueueCommand {
    pub fn run(&self, config: &Config) -> Result<(), CommandError> {
        let rt = runtime()?;
        rt.block_on(async {
            let store = open_store(config).await?;
            let queue = MutationQueue::new(store.clone());
            let result = self.execute(&queue, config).await;
            store.close().await;
            result
        })
    }

    async fn execute(&self, queue: &MutationQueue, config: &Config) -> Result<(), CommandError> {
        match &self.command {
            QueueSubcommand::List {
                status,
                limit,
                format,
            } => {
                let entries = queue.try_list(status.map(QueueStatus::from), *limit).await?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", to_json(&entries)?);
                    }
                    OutputFormat::Text => {
                        if entries.is_empty() {
                            println!("Queue is empty.");
                        }
                        for entry in &entries {
                            println!("{}", summary_line(entry));
                        }
                    }
                }
            }

            QueueSubcommand::Show { id, format } => {
                let entry = queue
                    .try_get(id)
                    .await?
                    .ok_or_else(|| CommandError::NotFound(format!("queue entry {}", id)))?;
                match format {
                    OutputFormat::Json => println!("{}", to_json(&entry)?),
                    OutputFormat::Text => print_entry(&entry),
                }
            }

            QueueSubcommand::Stats { format } => {
                let stats = queue.try_stats().await?;
                match format {
                    OutputFormat::Json => println!("{}", to_json(&stats)?),
                    OutputFormat::Text => {
                        println!("pending: {}", stats.pending);
                        println!("done:    {}", stats.done);
                        println!("failed:  {}", stats.failed);
                        println!("total:   {}", stats.total());
                    }
                }
            }

            QueueSubcommand::Retry { max_tries } => {
                let max_tries = max_tries.unwrap_or(config.sync.max_tries);
                let count = queue.try_requeue_failed(max_tries).await?;
                println!(
                    "Requeued {} failed entr{}.",
                    count,
                    if count == 1 { "y" } else { "ies" }
                );
            }

            QueueSubcommand::Purge { older_than_days } => {
                let cutoff = purge_cutoff(Utc::now(), *older_than_days)?;
                let count = queue.try_purge_finished(cutoff).await?;
                println!(
                    "Purged {} done entr{}.",
                    count,
                    if count == 1 { "y" } else { "ies" }
                );
            }
        }

        Ok(())
    }
}

/// The instant `days` before `now`, or an error if it is out of range.
fn purge_cutoff(now: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>, CommandError> {
    Duration::try_days(i64::from(days))
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| {
            CommandError::InvalidArgument(format!("--older-than-days {} is out of range", days))
        })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, CommandError> {
    serde_json::to_string_pretty(value).map_err(CommandError::InvalidJson)
}

fn summary_line(entry: &QueueEntry) -> String {
    let mut line = format!(
        "{}  {:<7}  {}  {}",
        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
        entry.status,
        entry.id,
        entry.action
    );
    if entry.status == QueueStatus::Failed {
        line.push_str(&format!("  (tries: {}) {}", entry.try_count, entry.last_error));
    }
    line
}

fn print_entry(entry: &QueueEntry) {
    println!("id:         {}", entry.id);
    println!("action:     {}", entry.action);
    println!("status:     {}", entry.status);
    println!("created_at: {}", entry.created_at.to_rfc3339());
    println!("updated_at: {}", entry.updated_at.to_rfc3339());
    println!("try_count:  {}", entry.try_count);
    if !entry.last_error.is_empty() {
        println!("last_error: {}", entry.last_error);
    }
    println!("payload:");
    match serde_json::to_string_pretty(&entry.payload) {
        Ok(payload) => println!("{}", payload),
        Err(_) => println!("{}", entry.payload),
    }
}
