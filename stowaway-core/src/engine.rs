//! Drains the mutation queue against a remote store.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::action::{id_string, Action, ActionError};
use crate::catalog::{Catalog, ChildMode};
use crate::queue::{MutationQueue, QueueEntry};
use crate::remote::{RemoteError, RemoteStore};
use crate::store::LocalStore;

/// Maximum number of entries a single drain picks up.
pub const DEFAULT_BATCH_LIMIT: usize = 1000;

const PROGRESS_CAPACITY: usize = 64;

/// Progress of the current drain, broadcast after every entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub syncing: bool,
    pub pending: usize,
    pub processed: usize,
    pub total: usize,
}

/// An entry that failed during a drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryFailure {
    pub id: String,
    pub action: String,
    pub error: String,
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<EntryFailure>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("a sync is already in progress")]
    AlreadyRunning,
}

/// Why a single entry could not be replayed.
#[derive(Debug, Error)]
enum ReplayError {
    #[error(transparent)]
    Invalid(#[from] ActionError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Clears the drain latch when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Replays pending queue entries, oldest first, one at a time.
///
/// Each entry is marked `done` when its remote calls succeed and `failed`
/// (with the error text) otherwise; a failure never stops the drain. Only one
/// drain runs per engine at a time.
pub struct SyncEngine {
    queue: MutationQueue,
    remote: Arc<dyn RemoteStore>,
    catalog: Catalog,
    progress: broadcast::Sender<SyncProgress>,
    call_timeout: Option<Duration>,
    batch_limit: usize,
    draining: AtomicBool,
}

impl SyncEngine {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteStore>, catalog: Catalog) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            queue: MutationQueue::new(store),
            remote,
            catalog,
            progress,
            call_timeout: None,
            batch_limit: DEFAULT_BATCH_LIMIT,
            draining: AtomicBool::new(false),
        }
    }

    /// Bounds every remote call; an expired call fails its entry.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Validates `tag`/`payload` against the catalog and enqueues it.
    ///
    /// Invalid actions are rejected without touching the queue. `Ok(None)`
    /// means the action was valid but the store could not record it.
    pub async fn enqueue(&self, tag: &str, payload: Value) -> Result<Option<String>, ActionError> {
        let action = Action::parse(tag, payload, &self.catalog)?;
        Ok(self.queue.enqueue(&action).await)
    }

    /// Drains the pending entries present when the drain starts.
    pub async fn sync_pending(&self) -> Result<SyncReport, SyncError> {
        let _guard = DrainGuard::acquire(&self.draining).ok_or(SyncError::AlreadyRunning)?;

        let entries = self.queue.list_pending(self.batch_limit).await;
        let total = entries.len();
        let mut report = SyncReport {
            total,
            ..SyncReport::default()
        };

        if total == 0 {
            return Ok(report);
        }

        self.emit(SyncProgress {
            syncing: true,
            pending: total,
            processed: 0,
            total,
        });

        for (index, entry) in entries.iter().enumerate() {
            match self.replay_entry(entry).await {
                Ok(()) => {
                    self.queue.mark_done(&entry.id).await;
                    report.succeeded += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::warn!(
                        id = %entry.id,
                        action = %entry.action,
                        error = %message,
                        "Queued mutation failed"
                    );
                    self.queue.mark_failed(&entry.id, &message).await;
                    report.failed += 1;
                    report.failures.push(EntryFailure {
                        id: entry.id.clone(),
                        action: entry.action.clone(),
                        error: message,
                    });
                }
            }

            let processed = index + 1;
            self.emit(SyncProgress {
                syncing: processed < total,
                pending: total - processed,
                processed,
                total,
            });
        }

        tracing::info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            "Sync finished"
        );

        Ok(report)
    }

    fn emit(&self, progress: SyncProgress) {
        // No subscribers is fine
        let _ = self.progress.send(progress);
    }

    async fn replay_entry(&self, entry: &QueueEntry) -> Result<(), ReplayError> {
        let action = Action::parse(&entry.action, entry.payload.clone(), &self.catalog)?;
        tracing::debug!(id = %entry.id, action = %entry.action, "Replaying mutation");
        self.dispatch(&action).await
    }

    async fn dispatch(&self, action: &Action) -> Result<(), ReplayError> {
        let spec = self
            .catalog
            .resolve(action.namespace())
            .ok_or_else(|| ActionError::UnregisteredNamespace(action.namespace().to_string()))?;
        let collection = spec.collection.as_str();

        match action {
            Action::Insert { document, .. } => {
                self.call(self.remote.insert(collection, document)).await?;
            }
            Action::Upsert { document, .. } => {
                let (parent, batches) = spec.split(document);
                self.call(self.remote.upsert(collection, &parent, &spec.conflict_key))
                    .await?;

                for batch in batches {
                    let child = batch.spec;
                    match &child.mode {
                        ChildMode::Replace => {
                            self.call(self.remote.delete_matching(
                                &child.collection,
                                &child.parent_field,
                                &batch.parent_key,
                            ))
                            .await?;
                            for row in &batch.rows {
                                self.call(self.remote.insert(&child.collection, row)).await?;
                            }
                        }
                        ChildMode::Upsert { conflict_key } => {
                            for row in &batch.rows {
                                self.call(self.remote.upsert(&child.collection, row, conflict_key))
                                    .await?;
                            }
                        }
                    }
                }
            }
            Action::Update { id, patch, .. } => {
                let id = row_key(action, id)?;
                self.call(self.remote.update(collection, &id, patch)).await?;
            }
            Action::Delete { id, .. } => {
                let id = row_key(action, id)?;
                self.call(self.remote.delete(collection, &id)).await?;
            }
        }

        Ok(())
    }

    async fn call<F>(&self, call: F) -> Result<(), RemoteError>
    where
        F: Future<Output = Result<(), RemoteError>>,
    {
        match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| RemoteError::Timeout(limit))?,
            None => call.await,
        }
    }
}

fn row_key(action: &Action, id: &Value) -> Result<String, ActionError> {
    id_string(id).ok_or_else(|| ActionError::InvalidId { tag: action.tag() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Document;
    use crate::catalog::{ChildSpec, CollectionSpec};
    use crate::queue::QueueStatus;
    use crate::remote::MemoryRemote;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn diet_catalog() -> Catalog {
        Catalog::permissive().register(
            "diet",
            CollectionSpec::new("dietas")
                .with_child(ChildSpec::new("items", "dieta_items", "dieta_id")),
        )
    }

    async fn setup(catalog: Catalog) -> (SyncEngine, Arc<MemoryRemote>) {
        let store = LocalStore::try_open_in_memory().await.unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let engine = SyncEngine::new(store, remote.clone(), catalog);
        (engine, remote)
    }

    async fn enqueue(engine: &SyncEngine, tag: &str, payload: Value) -> String {
        engine.enqueue(tag, payload).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_upsert_twice_leaves_one_remote_row() {
        let (engine, remote) = setup(diet_catalog()).await;
        let first = enqueue(&engine, "diet.upsert", json!({"id": "X", "kg": 10})).await;
        let second = enqueue(&engine, "diet.upsert", json!({"id": "X", "kg": 12})).await;

        let report = engine.sync_pending().await.unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(report.succeeded, 2);
        assert!(report.is_clean());
        assert_eq!(remote.rows("dietas"), vec![doc(json!({"id": "X", "kg": 12}))]);
        for id in [first, second] {
            assert_eq!(engine.queue().get(&id).await.unwrap().status, QueueStatus::Done);
        }
    }

    #[tokio::test]
    async fn test_replaying_upsert_is_idempotent() {
        let (engine, remote) = setup(diet_catalog()).await;
        enqueue(&engine, "diet.upsert", json!({"id": "X", "kg": 10})).await;
        engine.sync_pending().await.unwrap();
        let after_first = remote.rows("dietas");

        // Same mutation replayed, e.g. after a crash before mark_done
        enqueue(&engine, "diet.upsert", json!({"id": "X", "kg": 10})).await;
        engine.sync_pending().await.unwrap();

        assert_eq!(remote.rows("dietas"), after_first);
    }

    #[tokio::test]
    async fn test_failed_entry_does_not_stop_drain() {
        let (engine, remote) = setup(Catalog::permissive()).await;
        let a = enqueue(&engine, "lote.upsert", json!({"id": "L1"})).await;
        let b = enqueue(&engine, "animal.upsert", json!({"id": "A1"})).await;
        let c = enqueue(&engine, "lote.upsert", json!({"id": "L2"})).await;
        remote.reject_collection("animal");

        let report = engine.sync_pending().await.unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].id, b);
        assert_eq!(report.failures[0].action, "animal.upsert");

        let queue = engine.queue();
        assert_eq!(queue.get(&a).await.unwrap().status, QueueStatus::Done);
        assert_eq!(queue.get(&c).await.unwrap().status, QueueStatus::Done);
        let failed = queue.get(&b).await.unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert!(failed.last_error.contains("rejected"));
        assert_eq!(remote.rows("lote").len(), 2);
    }

    #[tokio::test]
    async fn test_offline_remote_fails_every_entry_once() {
        let (engine, remote) = setup(Catalog::permissive()).await;
        for i in 0..5 {
            enqueue(&engine, "lote.upsert", json!({"id": i})).await;
        }
        remote.set_offline(true);

        let report = engine.sync_pending().await.unwrap();
        assert_eq!(report.failed, 5);

        let queue = engine.queue();
        assert!(queue.list_pending(10).await.is_empty());
        let failed = queue.list(Some(QueueStatus::Failed), 10).await;
        assert_eq!(failed.len(), 5);
        assert!(failed.iter().all(|e| e.try_count == 1));
        assert!(failed.iter().all(|e| e.last_error.contains("offline")));

        // Failed entries stay put until explicitly requeued
        remote.set_offline(false);
        assert_eq!(engine.sync_pending().await.unwrap().total, 0);
        assert_eq!(queue.requeue_failed(3).await, 5);
        let report = engine.sync_pending().await.unwrap();
        assert_eq!(report.succeeded, 5);
        assert_eq!(remote.rows("lote").len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_tag_fails_permanently() {
        let store = LocalStore::try_open_in_memory().await.unwrap();
        let remote = Arc::new(MemoryRemote::new());
        sqlx::query(
            "INSERT INTO queue (id, action, payload, status, created_at, updated_at) \
             VALUES ('legacy', 'diet.frobnicate', '{}', 'pending', 0, 0)",
        )
        .execute(store.pool().unwrap())
        .await
        .unwrap();
        let engine = SyncEngine::new(store, remote.clone(), Catalog::permissive());
        let ok = enqueue(&engine, "lote.upsert", json!({"id": "L1"})).await;

        let report = engine.sync_pending().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        let entry = engine.queue().get("legacy").await.unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);
        assert!(entry.last_error.contains("diet.frobnicate"));
        assert_eq!(engine.queue().get(&ok).await.unwrap().status, QueueStatus::Done);
        assert!(remote.calls().iter().all(|call| !call.contains("frobnicate")));
    }

    #[tokio::test]
    async fn test_strict_catalog_fails_unregistered_namespace() {
        let store = LocalStore::try_open_in_memory().await.unwrap();
        let remote = Arc::new(MemoryRemote::new());

        // Recorded while the namespace was still known
        MutationQueue::new(store.clone())
            .enqueue(&Action::upsert("lote", doc(json!({"id": "L1"}))))
            .await
            .unwrap();

        let catalog = Catalog::strict().register("diet", CollectionSpec::new("dietas"));
        let engine = SyncEngine::new(store, remote.clone(), catalog);
        let report = engine.sync_pending().await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(report.failures[0].error.contains("lote"));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_actions() {
        let (engine, _remote) = setup(diet_catalog()).await;

        assert!(matches!(
            engine.enqueue("diet.explode", json!({})).await,
            Err(ActionError::UnknownTag(_))
        ));
        assert!(matches!(
            engine.enqueue("diet.delete", json!({"kg": 1})).await,
            Err(ActionError::MissingField { .. })
        ));
        assert_eq!(engine.queue().stats().await.total(), 0);
    }

    #[tokio::test]
    async fn test_progress_events() {
        let (engine, _remote) = setup(Catalog::permissive()).await;
        for i in 0..3 {
            enqueue(&engine, "lote.upsert", json!({"id": i})).await;
        }
        let mut rx = engine.subscribe();

        engine.sync_pending().await.unwrap();

        let mut events = Vec::new();
        while let Ok(progress) = rx.try_recv() {
            events.push((progress.syncing, progress.pending, progress.processed, progress.total));
        }
        assert_eq!(
            events,
            vec![
                (true, 3, 0, 3),
                (true, 2, 1, 3),
                (true, 1, 2, 3),
                (false, 0, 3, 3)
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_queue_emits_nothing() {
        let (engine, remote) = setup(Catalog::permissive()).await;
        let mut rx = engine.subscribe();

        let report = engine.sync_pending().await.unwrap();

        assert_eq!(report, SyncReport::default());
        assert!(rx.try_recv().is_err());
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let store = LocalStore::try_open_in_memory().await.unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.set_latency(Duration::from_millis(200));
        let engine = SyncEngine::new(store, remote.clone(), Catalog::permissive())
            .with_call_timeout(Duration::from_millis(20));
        let id = enqueue(&engine, "lote.upsert", json!({"id": "L1"})).await;

        let report = engine.sync_pending().await.unwrap();

        assert_eq!(report.failed, 1);
        let entry = engine.queue().get(&id).await.unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);
        assert!(entry.last_error.contains("timed out"));
        assert!(remote.rows("lote").is_empty());
    }

    #[tokio::test]
    async fn test_composite_upsert_writes_parent_then_children() {
        let (engine, remote) = setup(diet_catalog()).await;
        enqueue(
            &engine,
            "diet.upsert",
            json!({"id": "X", "lote_id": "L1", "items": [{"alimento": "maiz"}, {"alimento": "soja"}]}),
        )
        .await;

        engine.sync_pending().await.unwrap();

        assert_eq!(
            remote.calls(),
            vec![
                "upsert dietas",
                "delete_matching dieta_items",
                "insert dieta_items",
                "insert dieta_items"
            ]
        );
        assert_eq!(remote.rows("dietas"), vec![doc(json!({"id": "X", "lote_id": "L1"}))]);
        let items = remote.rows("dieta_items");
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|row| row["dieta_id"] == json!("X")));

        // A later upsert replaces the children
        enqueue(
            &engine,
            "diet.upsert",
            json!({"id": "X", "lote_id": "L1", "items": [{"alimento": "avena"}]}),
        )
        .await;
        engine.sync_pending().await.unwrap();

        assert_eq!(
            remote.rows("dieta_items"),
            vec![doc(json!({"alimento": "avena", "dieta_id": "X"}))]
        );
    }

    #[tokio::test]
    async fn test_upsert_children_by_own_key() {
        let catalog = Catalog::strict().register(
            "diet",
            CollectionSpec::new("dietas").with_child(
                ChildSpec::new("items", "dieta_items", "dieta_id").with_mode(ChildMode::Upsert {
                    conflict_key: vec!["dieta_id".into(), "alimento".into()],
                }),
            ),
        );
        let (engine, remote) = setup(catalog).await;
        let payload = json!({"id": "X", "items": [{"alimento": "maiz", "kg": 1}]});
        enqueue(&engine, "diet.upsert", payload.clone()).await;
        enqueue(&engine, "diet.upsert", payload).await;

        engine.sync_pending().await.unwrap();

        assert_eq!(remote.rows("dieta_items").len(), 1);
        assert!(remote.calls().iter().all(|call| !call.starts_with("delete")));
    }

    #[tokio::test]
    async fn test_upsert_child_without_key_is_never_queued() {
        let catalog = Catalog::strict().register(
            "diet",
            CollectionSpec::new("dietas").with_child(
                ChildSpec::new("items", "dieta_items", "dieta_id").with_mode(ChildMode::Upsert {
                    conflict_key: vec!["dieta_id".into(), "alimento".into()],
                }),
            ),
        );
        let (engine, remote) = setup(catalog).await;

        let err = engine
            .enqueue("diet.upsert", json!({"id": "X", "items": [{"kg": 1}]}))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::MissingField { .. }));
        assert_eq!(engine.queue().stats().await.total(), 0);

        // Keyed rows replayed twice still leave one child row
        let payload = json!({"id": "X", "items": [{"alimento": "maiz", "kg": 1}]});
        enqueue(&engine, "diet.upsert", payload.clone()).await;
        engine.sync_pending().await.unwrap();
        enqueue(&engine, "diet.upsert", payload).await;
        let report = engine.sync_pending().await.unwrap();

        assert!(report.is_clean());
        assert_eq!(
            remote.rows("dieta_items"),
            vec![doc(json!({"alimento": "maiz", "kg": 1, "dieta_id": "X"}))]
        );
    }

    #[tokio::test]
    async fn test_numeric_parent_id_reaches_children_unchanged() {
        let (engine, remote) = setup(diet_catalog()).await;
        enqueue(&engine, "diet.upsert", json!({"id": 7, "items": [{"a": 1}]})).await;

        engine.sync_pending().await.unwrap();

        assert_eq!(remote.rows("dietas"), vec![doc(json!({"id": 7}))]);
        assert_eq!(remote.rows("dieta_items"), vec![doc(json!({"a": 1, "dieta_id": 7}))]);

        // The replace still finds the numeric children
        enqueue(&engine, "diet.upsert", json!({"id": 7, "items": [{"a": 2}]})).await;
        engine.sync_pending().await.unwrap();
        assert_eq!(remote.rows("dieta_items"), vec![doc(json!({"a": 2, "dieta_id": 7}))]);
    }

    #[tokio::test]
    async fn test_numeric_ids_update_and_delete() {
        let (engine, remote) = setup(Catalog::permissive()).await;
        enqueue(&engine, "animal.insert", json!({"id": 7, "peso": 400})).await;
        let update = enqueue(&engine, "animal.update", json!({"id": 7, "peso": 410})).await;
        enqueue(&engine, "animal.insert", json!({"id": 8})).await;
        let delete = enqueue(&engine, "animal.delete", json!({"id": 8})).await;

        let stored = engine.queue().get(&update).await.unwrap();
        assert_eq!(stored.payload, json!({"id": 7, "peso": 410}));
        assert_eq!(engine.queue().get(&delete).await.unwrap().payload, json!({"id": 8}));

        let report = engine.sync_pending().await.unwrap();

        assert_eq!(report.succeeded, 4);
        assert_eq!(remote.rows("animal"), vec![doc(json!({"id": 7, "peso": 410}))]);
    }

    #[tokio::test]
    async fn test_insert_update_delete() {
        let (engine, remote) = setup(Catalog::permissive()).await;
        enqueue(&engine, "animal.insert", json!({"id": "a1", "peso": 400})).await;
        enqueue(&engine, "animal.update", json!({"id": "a1", "peso": 410})).await;
        enqueue(&engine, "animal.delete", json!({"id": "ghost"})).await;

        let report = engine.sync_pending().await.unwrap();

        assert_eq!(report.succeeded, 3);
        assert_eq!(remote.rows("animal"), vec![doc(json!({"id": "a1", "peso": 410}))]);

        // Replaying the insert hits the duplicate id
        enqueue(&engine, "animal.insert", json!({"id": "a1", "peso": 400})).await;
        let report = engine.sync_pending().await.unwrap();
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_rejected() {
        let store = LocalStore::try_open_in_memory().await.unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.set_latency(Duration::from_millis(50));
        let engine = SyncEngine::new(store, remote.clone(), Catalog::permissive());
        enqueue(&engine, "lote.upsert", json!({"id": "L1"})).await;

        let (first, second) = tokio::join!(engine.sync_pending(), engine.sync_pending());

        assert_eq!(first.unwrap().succeeded, 1);
        assert_eq!(second, Err(SyncError::AlreadyRunning));
        assert!(!engine.is_syncing());
        assert_eq!(remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_drains_nothing() {
        let remote = Arc::new(MemoryRemote::new());
        let engine = SyncEngine::new(LocalStore::unavailable(), remote.clone(), Catalog::permissive());

        assert_eq!(engine.enqueue("lote.upsert", json!({"id": 1})).await, Ok(None));
        assert_eq!(engine.sync_pending().await.unwrap(), SyncReport::default());
        assert!(remote.calls().is_empty());
    }
}
