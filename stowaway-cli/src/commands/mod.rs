mod cache_cmd;
mod config_cmd;
mod enqueue;
mod queue_cmd;
mod sync_cmd;
mod watch;

pub use cache_cmd::CacheCommand;
pub use config_cmd::ConfigCommand;
pub use enqueue::EnqueueCommand;
pub use queue_cmd::QueueCommand;
pub use sync_cmd::SyncCommand;
pub use watch::WatchCommand;

use std::sync::Arc;

use clap::ValueEnum;
use serde_json::Value;
use stowaway_core::{
    ActionError, LocalStore, PostgrestRemote, RemoteError, StoreError, SyncEngine, SyncError,
    SyncProgress,
};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::config::Config;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Builds the runtime used by async commands.
fn runtime() -> Result<tokio::runtime::Runtime, CommandError> {
    tokio::runtime::Runtime::new().map_err(|e| CommandError::RuntimeError(e.to_string()))
}

/// Opens the local store, failing instead of degrading so the user sees why.
async fn open_store(config: &Config) -> Result<LocalStore, CommandError> {
    tracing::debug!(path = %config.database_path.value.display(), "Opening local store");
    Ok(LocalStore::try_open(&config.database_path.value).await?)
}

/// Builds a sync engine against the configured remote.
fn build_engine(config: &Config, store: LocalStore) -> Result<SyncEngine, CommandError> {
    let url = config
        .remote
        .url
        .as_ref()
        .ok_or(CommandError::NotConfigured)?;
    let remote = PostgrestRemote::new(
        url.clone(),
        config.remote.api_key.clone(),
        config.remote.timeout(),
    )?;

    Ok(SyncEngine::new(store, Arc::new(remote), config.catalog.clone())
        .with_call_timeout(config.sync.call_timeout())
        .with_batch_limit(config.sync.batch_limit))
}

fn parse_json(input: &str) -> Result<Value, CommandError> {
    serde_json::from_str(input).map_err(CommandError::InvalidJson)
}

/// Prints drain progress until the drain finishes or the channel closes.
async fn print_progress(mut rx: broadcast::Receiver<SyncProgress>) {
    loop {
        match rx.recv().await {
            Ok(progress) => {
                if progress.processed > 0 {
                    println!("  [{}/{}]", progress.processed, progress.total);
                }
                if !progress.syncing {
                    break;
                }
            }
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}

/// Errors from CLI commands
#[derive(Debug)]
pub enum CommandError {
    RuntimeError(String),
    StoreError(StoreError),
    ActionError(ActionError),
    RemoteError(RemoteError),
    SyncError(SyncError),
    InvalidJson(serde_json::Error),
    InvalidArgument(String),
    NotFound(String),
    NotConfigured,
    IoError(std::io::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::RuntimeError(e) => write!(f, "Runtime error: {}", e),
            CommandError::StoreError(StoreError::Unavailable) => {
                write!(f, "Local store is unavailable")
            }
            CommandError::StoreError(e) => write!(f, "Local store error: {}", e),
            CommandError::ActionError(e) => write!(f, "Invalid action: {}", e),
            CommandError::RemoteError(e) => write!(f, "Remote error: {}", e),
            CommandError::SyncError(e) => write!(f, "{}", e),
            CommandError::InvalidJson(e) => write!(f, "Invalid JSON: {}", e),
            CommandError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            CommandError::NotFound(what) => write!(f, "Not found: {}", what),
            CommandError::NotConfigured => write!(
                f,
                "Remote not configured. Add remote.url to config or set STOW_REMOTE_URL."
            ),
            CommandError::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::StoreError(e) => Some(e),
            CommandError::ActionError(e) => Some(e),
            CommandError::RemoteError(e) => Some(e),
            CommandError::SyncError(e) => Some(e),
            CommandError::InvalidJson(e) => Some(e),
            CommandError::IoError(e) => Some(e),
            CommandError::RuntimeError(_)
            | CommandError::InvalidArgument(_)
            | CommandError::NotFound(_)
            | CommandError::NotConfigured => None,
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        CommandError::StoreError(e)
    }
}

impl From<ActionError> for CommandError {
    fn from(e: ActionError) -> Self {
        CommandError::ActionError(e)
    }
}

impl From<RemoteError> for CommandError {
    fn from(e: RemoteError) -> Self {
        CommandError::RemoteError(e)
    }
}

impl From<SyncError> for CommandError {
    fn from(e: SyncError) -> Self {
        CommandError::SyncError(e)
    }
}

impl From<std::io::Error> for CommandError {
    fn from(e: std::io::Error) -> Self {
        CommandError::IoError(e)
    }
}
