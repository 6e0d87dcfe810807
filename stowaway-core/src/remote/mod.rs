//! The remote side queued mutations are replayed against.
//!
//! [`RemoteStore`] is a glorified CRUD interface over named collections. The
//! sync engine only needs these five calls; everything else about the remote
//! service is out of scope.

#[cfg(any(test, feature = "mock"))]
mod memory;
mod postgrest;

#[cfg(any(test, feature = "mock"))]
pub use self::memory::MemoryRemote;
pub use self::postgrest::PostgrestRemote;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::action::Document;

/// Errors reported by a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The remote could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// The remote refused the request (validation, constraint, auth).
    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The call did not finish in time.
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// The remote answered with something unexpected.
    #[error("invalid remote response: {0}")]
    Decode(String),
}

/// Mutation interface of the remote data service.
///
/// Implementations must make `upsert`, `update` and `delete` idempotent:
/// applying the same call twice leaves the remote in the same state, and
/// deleting a missing row succeeds.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Inserts a new row.
    async fn insert(&self, collection: &str, document: &Document) -> Result<(), RemoteError>;

    /// Applies `patch` to the row with `id`.
    async fn update(&self, collection: &str, id: &str, patch: &Document)
        -> Result<(), RemoteError>;

    /// Inserts `document`, or merges it into the row matching on `conflict_key`.
    async fn upsert(
        &self,
        collection: &str,
        document: &Document,
        conflict_key: &[String],
    ) -> Result<(), RemoteError>;

    /// Deletes the row with `id`.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError>;

    /// Deletes every row whose `field` equals `value`.
    async fn delete_matching(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<(), RemoteError>;
}
