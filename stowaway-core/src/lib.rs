//! Stowaway Core Library
//!
//! Offline persistence and synchronization: a local key/value cache, a
//! durable queue of pending mutations, and an engine that replays them
//! against a remote store once it is reachable.

pub mod action;
pub mod cache;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod queue;
pub mod remote;
pub mod store;
pub mod worker;

pub use action::{Action, ActionError, ActionKind, Document};
pub use cache::{Cache, CacheRecord};
pub use catalog::{Catalog, ChildMode, ChildSpec, CollectionSpec};
pub use engine::{EntryFailure, SyncEngine, SyncError, SyncProgress, SyncReport, DEFAULT_BATCH_LIMIT};
pub use error::StoreError;
pub use queue::{MutationQueue, QueueEntry, QueueStats, QueueStatus};
pub use remote::{PostgrestRemote, RemoteError, RemoteStore};
pub use store::LocalStore;
pub use worker::{SyncWorker, SyncWorkerHandle};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
