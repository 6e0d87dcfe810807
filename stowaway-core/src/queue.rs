//! Durable, append-only log of mutations waiting to be replayed remotely.
//!
//! Entries start `pending` and move to `done` or `failed` exactly once. They
//! are never removed on failure; [`MutationQueue::requeue_failed`] is the only
//! way back to `pending`, and [`MutationQueue::purge_finished`] the only way
//! out of the table.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::TryRngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::Action;
use crate::error::StoreError;
use crate::store::{self, log_degraded, LocalStore};

const COLUMNS: &str = "id, action, payload, status, created_at, updated_at, try_count, last_error";

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Done,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Done => "done",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "done" => Some(QueueStatus::Done),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    /// Stored tag, e.g. `diet.upsert`
    pub action: String,
    pub payload: Value,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub try_count: u32,
    /// Last failure message, empty if none
    pub last_error: String,
}

/// Entry counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub done: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.done + self.failed
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    action: String,
    payload: String,
    status: String,
    created_at: i64,
    updated_at: i64,
    try_count: i64,
    last_error: String,
}

impl TryFrom<QueueRow> for QueueEntry {
    type Error = StoreError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        let status = QueueStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("entry {} has status '{}'", row.id, row.status))
        })?;

        // Undecodable payloads are kept as raw text so the entry still
        // surfaces (and fails visibly) instead of vanishing from listings.
        let payload = match serde_json::from_str(&row.payload) {
            Ok(value) => value,
            Err(_) => Value::String(row.payload),
        };

        Ok(QueueEntry {
            id: row.id,
            action: row.action,
            payload,
            status,
            created_at: store::micros_to_datetime(row.created_at),
            updated_at: store::micros_to_datetime(row.updated_at),
            try_count: u32::try_from(row.try_count).unwrap_or(u32::MAX),
            last_error: row.last_error,
        })
    }
}

/// Enqueue/list/mark façade over the `queue` table.
///
/// Every operation is a single statement, so concurrent callers never observe
/// a half-written entry. No lock is held between [`list_pending`] and the
/// marks that follow it; running one drain at a time is the caller's job.
///
/// [`list_pending`]: MutationQueue::list_pending
#[derive(Debug, Clone)]
pub struct MutationQueue {
    store: LocalStore,
}

impl MutationQueue {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Records `action` as a new pending entry and returns its id.
    ///
    /// `None` means the write was not recorded (logged); any optimistic cache
    /// write the caller already made stands alone.
    pub async fn enqueue(&self, action: &Action) -> Option<String> {
        match self.try_enqueue(action).await {
            Ok(id) => Some(id),
            Err(e) => {
                log_degraded("enqueue", &action.tag(), &e);
                None
            }
        }
    }

    /// Records `action` stamped with the current time.
    ///
    /// The stamp never falls behind the newest entry already queued, so a
    /// clock stepping backwards cannot move this entry ahead of earlier ones.
    pub async fn try_enqueue(&self, action: &Action) -> Result<String, StoreError> {
        let now = store::datetime_to_micros(store::now());
        self.insert_entry(
            action,
            now,
            r#"
            INSERT INTO queue (id, action, payload, status, created_at, updated_at, try_count, last_error)
            SELECT ?, ?, ?, 'pending', stamp, stamp, 0, ''
            FROM (SELECT MAX(?, COALESCE(MAX(created_at), 0)) AS stamp FROM queue)
            "#,
        )
        .await
    }

    /// Enqueues with an explicit creation time, e.g. when importing entries
    /// recorded elsewhere. Replay order follows `created_at`.
    pub async fn try_enqueue_at(
        &self,
        action: &Action,
        created_at: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        self.insert_entry(
            action,
            store::datetime_to_micros(created_at),
            r#"
            INSERT INTO queue (id, action, payload, status, created_at, updated_at, try_count, last_error)
            SELECT ?, ?, ?, 'pending', stamp, stamp, 0, ''
            FROM (SELECT ? AS stamp)
            "#,
        )
        .await
    }

    async fn insert_entry(
        &self,
        action: &Action,
        created_at: i64,
        sql: &str,
    ) -> Result<String, StoreError> {
        let pool = self.store.pool()?;
        let id = generate_entry_id();
        let tag = action.tag();
        let payload = serde_json::to_string(&action.payload())?;

        sqlx::query(sql)
            .bind(&id)
            .bind(&tag)
            .bind(&payload)
            .bind(created_at)
            .execute(pool)
            .await?;

        tracing::debug!(id = %id, action = %tag, "Enqueued mutation");
        Ok(id)
    }

    /// Returns up to `limit` pending entries, oldest first.
    pub async fn list_pending(&self, limit: usize) -> Vec<QueueEntry> {
        match self.try_list_pending(limit).await {
            Ok(entries) => entries,
            Err(e) => {
                log_degraded("list_pending", "queue", &e);
                Vec::new()
            }
        }
    }

    pub async fn try_list_pending(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        let pool = self.store.pool()?;

        let indexed: Result<Vec<QueueRow>, sqlx::Error> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM queue INDEXED BY idx_queue_status \
             WHERE status = 'pending' ORDER BY created_at ASC, rowid ASC LIMIT ?"
        ))
        .bind(sql_limit(limit))
        .fetch_all(pool)
        .await;

        let rows = match indexed {
            Ok(rows) => rows,
            Err(e) => {
                // Never report an empty queue just because the index path broke
                tracing::warn!(error = %e, "Status index query failed, falling back to full scan");
                let rows: Vec<QueueRow> = sqlx::query_as(&format!(
                    "SELECT {COLUMNS} FROM queue ORDER BY created_at ASC, rowid ASC"
                ))
                .fetch_all(pool)
                .await?;
                rows.into_iter()
                    .filter(|row| row.status == QueueStatus::Pending.as_str())
                    .take(limit)
                    .collect()
            }
        };

        rows.into_iter().map(QueueEntry::try_from).collect()
    }

    /// Returns up to `limit` entries, optionally filtered by status, oldest first.
    pub async fn list(&self, status: Option<QueueStatus>, limit: usize) -> Vec<QueueEntry> {
        match self.try_list(status, limit).await {
            Ok(entries) => entries,
            Err(e) => {
                log_degraded("list", "queue", &e);
                Vec::new()
            }
        }
    }

    pub async fn try_list(
        &self,
        status: Option<QueueStatus>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let pool = self.store.pool()?;

        let rows: Vec<QueueRow> = match status {
            Some(status) => {
                sqlx::query_as(&format!(
                    "SELECT {COLUMNS} FROM queue WHERE status = ? \
                     ORDER BY created_at ASC, rowid ASC LIMIT ?"
                ))
                .bind(status.as_str())
                .bind(sql_limit(limit))
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {COLUMNS} FROM queue ORDER BY created_at ASC, rowid ASC LIMIT ?"
                ))
                .bind(sql_limit(limit))
                .fetch_all(pool)
                .await?
            }
        };

        rows.into_iter().map(QueueEntry::try_from).collect()
    }

    /// Looks up a single entry by id.
    pub async fn get(&self, id: &str) -> Option<QueueEntry> {
        match self.try_get(id).await {
            Ok(entry) => entry,
            Err(e) => {
                log_degraded("get", id, &e);
                None
            }
        }
    }

    pub async fn try_get(&self, id: &str) -> Result<Option<QueueEntry>, StoreError> {
        let pool = self.store.pool()?;

        let row: Option<QueueRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM queue WHERE id = ?"))
                .bind(id)
                .fetch_optional(pool)
                .await?;

        row.map(QueueEntry::try_from).transpose()
    }

    /// Marks a pending entry as done.
    ///
    /// Returns false (no-op) if the entry does not exist or is not pending.
    pub async fn mark_done(&self, id: &str) -> bool {
        match self.try_mark_done(id).await {
            Ok(changed) => changed,
            Err(e) => {
                log_degraded("mark_done", id, &e);
                false
            }
        }
    }

    pub async fn try_mark_done(&self, id: &str) -> Result<bool, StoreError> {
        let pool = self.store.pool()?;

        let result = sqlx::query(
            "UPDATE queue SET status = 'done', updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(store::datetime_to_micros(store::now()))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Marks a pending entry as failed, bumping its try count and recording
    /// `message`.
    ///
    /// Returns false (no-op) if the entry does not exist or is not pending.
    pub async fn mark_failed(&self, id: &str, message: &str) -> bool {
        match self.try_mark_failed(id, message).await {
            Ok(changed) => changed,
            Err(e) => {
                log_degraded("mark_failed", id, &e);
                false
            }
        }
    }

    pub async fn try_mark_failed(&self, id: &str, message: &str) -> Result<bool, StoreError> {
        let pool = self.store.pool()?;

        let result = sqlx::query(
            r#"
            UPDATE queue
            SET status = 'failed', try_count = try_count + 1, last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(message)
        .bind(store::datetime_to_micros(store::now()))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Counts entries by status.
    pub async fn stats(&self) -> QueueStats {
        match self.try_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                log_degraded("stats", "queue", &e);
                QueueStats::default()
            }
        }
    }

    pub async fn try_stats(&self) -> Result<QueueStats, StoreError> {
        let pool = self.store.pool()?;

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM queue GROUP BY status")
                .fetch_all(pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match QueueStatus::parse(&status) {
                Some(QueueStatus::Pending) => stats.pending = count,
                Some(QueueStatus::Done) => stats.done = count,
                Some(QueueStatus::Failed) => stats.failed = count,
                None => {}
            }
        }
        Ok(stats)
    }

    /// Retry policy: moves failed entries with `try_count < max_tries` back to
    /// pending. They keep their `created_at`, so they replay ahead of newer
    /// entries. Returns how many entries were requeued.
    pub async fn requeue_failed(&self, max_tries: u32) -> u64 {
        match self.try_requeue_failed(max_tries).await {
            Ok(count) => count,
            Err(e) => {
                log_degraded("requeue_failed", "queue", &e);
                0
            }
        }
    }

    pub async fn try_requeue_failed(&self, max_tries: u32) -> Result<u64, StoreError> {
        let pool = self.store.pool()?;

        let result = sqlx::query(
            "UPDATE queue SET status = 'pending', updated_at = ? WHERE status = 'failed' AND try_count < ?",
        )
        .bind(store::datetime_to_micros(store::now()))
        .bind(i64::from(max_tries))
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Retention policy: deletes `done` entries last updated before `cutoff`.
    /// Failed entries are kept for diagnostics. Returns how many were deleted.
    pub async fn purge_finished(&self, cutoff: DateTime<Utc>) -> u64 {
        match self.try_purge_finished(cutoff).await {
            Ok(count) => count,
            Err(e) => {
                log_degraded("purge_finished", "queue", &e);
                0
            }
        }
    }

    pub async fn try_purge_finished(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let pool = self.store.pool()?;

        let result = sqlx::query("DELETE FROM queue WHERE status = 'done' AND updated_at < ?")
            .bind(store::datetime_to_micros(cutoff))
            .execute(pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Generates a queue entry id: a random UUID, or a clock/counter based id if
/// the OS random source fails.
fn generate_entry_id() -> String {
    let mut bytes = [0u8; 16];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "OS random source unavailable, using fallback id");
            fallback_entry_id()
        }
    }
}

fn fallback_entry_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    format!("q-{:x}-{:x}-{:x}", nanos, std::process::id(), seq)
}
