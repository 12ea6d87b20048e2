//! libSQL job ledger: JSON records keyed by job id.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, params};
use serde_json::Value;
use tracing::info;

use super::{JobStore, STATUS_COMPLETED};
use crate::error::StoreError;
use crate::store::migrations;

/// libSQL-backed [`JobStore`].
///
/// Holds one connection reused for all operations.
pub struct LibSqlJobStore {
    _db: libsql::Database,
    conn: Connection,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Open(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::with_database(db).await?;
        info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;
        Self::with_database(db).await
    }

    async fn with_database(db: libsql::Database) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self { _db: db, conn })
    }
}

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT record FROM jobs WHERE key = ?1", params![key])
            .await
            .map_err(|e| StoreError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("get row parse: {e}")))?;
                Ok(Some(serde_json::from_str(&record)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get: {e}"))),
        }
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let record = serde_json::to_string(&value)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO jobs (key, record, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(key) DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at",
                params![key, record, now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("put: {e}")))?;
        Ok(())
    }

    async fn update_status(&self, key: &str, status: &str) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET record = json_set(record, '$.status', ?2), updated_at = ?3
                 WHERE key = ?1 AND coalesce(json_extract(record, '$.status'), '') != ?4",
                params![key, status, now, STATUS_COMPLETED],
            )
            .await
            .map_err(|e| StoreError::Query(format!("update_status: {e}")))?;
        Ok(changed > 0)
    }
}
