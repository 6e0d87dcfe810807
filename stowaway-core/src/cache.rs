//! Key/value cache of "last known good" documents served while offline.
//!
//! Values fully replace each other on write; there is no expiry. Callers decide
//! freshness using [`CacheRecord::is_stale`].

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::store::{self, log_degraded, LocalStore};

/// A cached document and the time it was last written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

impl CacheRecord {
    /// Time elapsed since the record was written.
    pub fn age(&self) -> Duration {
        Utc::now() - self.updated_at
    }

    /// Returns true if the record is older than `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }
}

#[derive(sqlx::FromRow)]
struct CacheRow {
    key: String,
    value: String,
    updated_at: i64,
}

impl TryFrom<CacheRow> for CacheRecord {
    type Error = StoreError;

    fn try_from(row: CacheRow) -> Result<Self, Self::Error> {
        Ok(CacheRecord {
            value: serde_json::from_str(&row.value)?,
            key: row.key,
            updated_at: store::micros_to_datetime(row.updated_at),
        })
    }
}

/// Read/write façade over the `cache` table.
#[derive(Debug, Clone)]
pub struct Cache {
    store: LocalStore,
}

impl Cache {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if let Err(e) = self.try_set(key, value).await {
            log_degraded("cache_set", key, &e);
        }
    }

    pub async fn try_set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let pool = self.store.pool()?;
        let value = serde_json::to_string(value)?;

        sqlx::query(
            r#"
            INSERT INTO cache (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(store::datetime_to_micros(store::now()))
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Returns the value stored under `key`.
    ///
    /// `None` if the key is absent, the stored document does not decode as `T`,
    /// or the store is unavailable.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.try_get(key).await {
            Ok(value) => value,
            Err(e) => {
                log_degraded("cache_get", key, &e);
                None
            }
        }
    }

    pub async fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.try_get_record(key).await? {
            Some(record) => Ok(Some(serde_json::from_value(record.value)?)),
            None => Ok(None),
        }
    }

    /// Returns the full record stored under `key`, including its write time.
    pub async fn get_record(&self, key: &str) -> Option<CacheRecord> {
        match self.try_get_record(key).await {
            Ok(record) => record,
            Err(e) => {
                log_degraded("cache_get_record", key, &e);
                None
            }
        }
    }

    pub async fn try_get_record(&self, key: &str) -> Result<Option<CacheRecord>, StoreError> {
        let pool = self.store.pool()?;

        let row: Option<CacheRow> =
            sqlx::query_as("SELECT key, value, updated_at FROM cache WHERE key = ?")
                .bind(key)
                .fetch_optional(pool)
                .await?;

        row.map(CacheRecord::try_from).transpose()
    }

    /// Removes the record under `key`. No-op if absent.
    pub async fn delete(&self, key: &str) {
        if let Err(e) = self.try_delete(key).await {
            log_degraded("cache_delete", key, &e);
        }
    }

    /// Returns true if a record was removed.
    pub async fn try_delete(&self, key: &str) -> Result<bool, StoreError> {
        let pool = self.store.pool()?;

        let result = sqlx::query("DELETE FROM cache WHERE key = ?")
            .bind(key)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
