//! In-memory remote store for testing.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{RemoteError, RemoteStore};
use crate::action::{id_string, Document, ID_FIELD};

/// In-memory [`RemoteStore`] with switchable failure modes.
///
/// Rows live in a `HashMap` of collections behind a [`Mutex`], so all trait
/// methods operate on `&self`. Inserts reject a duplicate `id` like a primary
/// key would; upserts merge into the row matching the conflict key.
///
/// Available in tests and behind the `mock` feature.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    collections: HashMap<String, Vec<Document>>,
    offline: bool,
    rejecting: HashSet<String>,
    latency: Option<Duration>,
    calls: Vec<String>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While offline every call fails with [`RemoteError::Network`].
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Makes every call touching `collection` fail with a rejection.
    pub fn reject_collection(&self, collection: &str) {
        self.state().rejecting.insert(collection.to_string());
    }

    /// Delays every call by `latency` before it takes effect.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    /// Current rows of `collection`, in insertion order.
    pub fn rows(&self, collection: &str) -> Vec<Document> {
        self.state()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Calls received so far, as `"<op> <collection>"`, including failed ones.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Records the call, applies latency, and checks failure modes.
    async fn enter(&self, op: &str, collection: &str) -> Result<(), RemoteError> {
        let latency = {
            let mut state = self.state();
            state.calls.push(format!("{} {}", op, collection));
            state.latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let state = self.state();
        if state.offline {
            return Err(RemoteError::Network("remote is offline".into()));
        }
        if state.rejecting.contains(collection) {
            return Err(RemoteError::Rejected {
                status: 400,
                message: format!("writes to '{}' are rejected", collection),
            });
        }
        Ok(())
    }
}

fn row_id(row: &Document) -> Option<String> {
    row.get(ID_FIELD).and_then(id_string)
}

fn merge(row: &mut Document, patch: &Document) {
    for (key, value) in patch {
        row.insert(key.clone(), value.clone());
    }
}

fn matches_key(row: &Document, document: &Document, conflict_key: &[String]) -> bool {
    conflict_key.iter().all(|column| {
        let wanted = document.get(column).unwrap_or(&Value::Null);
        !wanted.is_null() && row.get(column) == Some(wanted)
    })
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn insert(&self, collection: &str, document: &Document) -> Result<(), RemoteError> {
        self.enter("insert", collection).await?;

        let mut state = self.state();
        let rows = state.collections.entry(collection.to_string()).or_default();
        if let Some(id) = row_id(document) {
            if rows.iter().any(|row| row_id(row).as_deref() == Some(id.as_str())) {
                return Err(RemoteError::Rejected {
                    status: 409,
                    message: format!("duplicate key id={} in '{}'", id, collection),
                });
            }
        }
        rows.push(document.clone());
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &Document,
    ) -> Result<(), RemoteError> {
        self.enter("update", collection).await?;

        let mut state = self.state();
        if let Some(rows) = state.collections.get_mut(collection) {
            for row in rows.iter_mut() {
                if row_id(row).as_deref() == Some(id) {
                    merge(row, patch);
                }
            }
        }
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        document: &Document,
        conflict_key: &[String],
    ) -> Result<(), RemoteError> {
        self.enter("upsert", collection).await?;

        let mut state = self.state();
        let rows = state.collections.entry(collection.to_string()).or_default();
        match rows
            .iter_mut()
            .find(|row| matches_key(row, document, conflict_key))
        {
            Some(row) => merge(row, document),
            None => rows.push(document.clone()),
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.enter("delete", collection).await?;

        let mut state = self.state();
        if let Some(rows) = state.collections.get_mut(collection) {
            rows.retain(|row| row_id(row).as_deref() != Some(id));
        }
        Ok(())
    }

    async fn delete_matching(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<(), RemoteError> {
        self.enter("delete_matching", collection).await?;

        let mut state = self.state();
        if let Some(rows) = state.collections.get_mut(collection) {
            rows.retain(|row| row.get(field).and_then(id_string).as_deref() != Some(value));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn id_key() -> Vec<String> {
        vec!["id".to_string()]
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_id() {
        let remote = MemoryRemote::new();
        remote.insert("t", &doc(json!({"id": "1"}))).await.unwrap();

        let err = remote.insert("t", &doc(json!({"id": "1"}))).await.unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { status: 409, .. }));

        // Rows without an id are plain appends
        remote.insert("t", &doc(json!({"v": 1}))).await.unwrap();
        remote.insert("t", &doc(json!({"v": 1}))).await.unwrap();
        assert_eq!(remote.rows("t").len(), 3);
    }

    #[tokio::test]
    async fn test_upsert_merges_by_conflict_key() {
        let remote = MemoryRemote::new();
        let key = vec!["lote_id".to_string(), "dia".to_string()];

        remote
            .upsert("d", &doc(json!({"lote_id": "L1", "dia": "1", "kg": 3})), &key)
            .await
            .unwrap();
        remote
            .upsert("d", &doc(json!({"lote_id": "L1", "dia": "1", "kg": 5})), &key)
            .await
            .unwrap();
        remote
            .upsert("d", &doc(json!({"lote_id": "L1", "dia": "2", "kg": 1})), &key)
            .await
            .unwrap();

        let rows = remote.rows("d");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["kg"], json!(5));
    }

    #[tokio::test]
    async fn test_update_and_delete_are_idempotent() {
        let remote = MemoryRemote::new();
        remote
            .upsert("t", &doc(json!({"id": 1, "a": 1})), &id_key())
            .await
            .unwrap();

        remote.update("t", "1", &doc(json!({"a": 2}))).await.unwrap();
        remote.update("t", "1", &doc(json!({"a": 2}))).await.unwrap();
        assert_eq!(remote.rows("t"), vec![doc(json!({"id": 1, "a": 2}))]);

        remote.delete("t", "1").await.unwrap();
        remote.delete("t", "1").await.unwrap();
        remote.delete("never-created", "1").await.unwrap();
        assert!(remote.rows("t").is_empty());
    }

    #[tokio::test]
    async fn test_delete_matching() {
        let remote = MemoryRemote::new();
        for (id, parent) in [("a", "X"), ("b", "X"), ("c", "Y")] {
            remote
                .insert("items", &doc(json!({"id": id, "parent": parent})))
                .await
                .unwrap();
        }

        remote.delete_matching("items", "parent", "X").await.unwrap();
        assert_eq!(remote.rows("items"), vec![doc(json!({"id": "c", "parent": "Y"}))]);
    }

    #[tokio::test]
    async fn test_failure_modes() {
        let remote = MemoryRemote::new();

        remote.set_offline(true);
        let err = remote.delete("t", "1").await.unwrap_err();
        assert!(matches!(err, RemoteError::Network(_)));

        remote.set_offline(false);
        remote.reject_collection("t");
        let err = remote.delete("t", "1").await.unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { status: 400, .. }));
        remote.delete("other", "1").await.unwrap();

        assert_eq!(remote.calls(), vec!["delete t", "delete t", "delete other"]);
    }
}
