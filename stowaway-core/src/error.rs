//! Error types for local storage.

use thiserror::Error;

/// Errors returned by the `try_*` operations of the local store façades.
///
/// The non-`try` operations never return these: they log and fall back to a
/// neutral value instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The embedded database could not be opened, or has been closed.
    #[error("local store is unavailable")]
    Unavailable,

    /// The embedded database rejected a statement.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Embedded schema migrations failed to apply.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored or supplied document could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row holds a value outside its domain (e.g. an unknown status).
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Returns true if the error means the store is not usable at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_display() {
        let err = StoreError::Unavailable;
        assert!(err.is_unavailable());
        assert_eq!(err.to_string(), "local store is unavailable");
    }

    #[test]
    fn test_from_serde_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: StoreError = json_err.into();
        assert!(!err.is_unavailable());
        assert!(err.to_string().starts_with("serialization error"));
    }
}
