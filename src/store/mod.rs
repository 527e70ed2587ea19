// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The local cache store.
//!
//! A single SQLite database owns every cached row:
//!
//! ```text
//! services         (id, service, data JSON, created, updated)  PK (id, service)
//! blob_files       (row_id, record_id, filename, data BLOB,
//!                   expiration, created, updated)              UNIQUE (record_id, filename)
//! cached_responses (request_key, response_data, cached_at)     PK request_key
//! ```
//!
//! The schema version lives in `PRAGMA user_version`; v2 added `blob_files`
//! and v3 added `cached_responses`, so older cache files migrate forward in
//! place. The `data` column stores the full merged record JSON (domain
//! fields, control flags and the system fields), which keeps every filter
//! compilable to `json_extract` over one column.
//!
//! The store is created once by the client and shared as an `Arc`; service
//! handles never close it.

pub mod blobs;
pub mod records;
pub mod responses;

use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::resilience::{with_backoff, Backoff};
use crate::schema::SchemaRegistry;

/// Current cache schema version.
const SCHEMA_VERSION: i64 = 3;

/// Shared handle over the embedded cache database.
pub struct RecordStore {
    pool: SqlitePool,
    registry: Arc<SchemaRegistry>,
}

impl RecordStore {
    /// Open (and migrate) the cache database described by `config`.
    pub async fn open(
        config: &SyncConfig,
        registry: Arc<SchemaRegistry>,
    ) -> Result<Self, SyncError> {
        let in_memory = config.db_path.is_none();
        let options = match &config.db_path {
            Some(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5)),
            None => SqliteConnectOptions::new().in_memory(true),
        };

        // An in-memory database lives and dies with its connection, so the
        // pool must keep exactly one alive forever.
        let mut pool_options = SqlitePoolOptions::new();
        if in_memory {
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            pool_options = pool_options.max_connections(5);
        }

        let pool = with_backoff("cache database open", &Backoff::open_database(), || {
            let pool_options = pool_options.clone();
            let options = options.clone();
            async move {
                pool_options
                    .connect_with(options)
                    .await
                    .map_err(SyncError::from)
            }
        })
        .await?;

        let store = Self { pool, registry };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap a caller-supplied pool, migrating its schema in place.
    pub async fn from_pool(
        pool: SqlitePool,
        registry: Arc<SchemaRegistry>,
    ) -> Result<Self, SyncError> {
        let store = Self { pool, registry };
        store.migrate().await?;
        Ok(store)
    }

    /// The underlying pool, for sharing with plug-in tables.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), SyncError> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;

        if version >= SCHEMA_VERSION {
            return Ok(());
        }
        debug!(from = version, to = SCHEMA_VERSION, "migrating cache schema");

        if version < 1 {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS services (
                    id TEXT NOT NULL,
                    service TEXT NOT NULL,
                    data TEXT NOT NULL,
                    created TEXT NOT NULL,
                    updated TEXT NOT NULL,
                    PRIMARY KEY (id, service)
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
            sqlx::query("CREATE INDEX IF NOT EXISTS idx_services_service ON services (service)")
                .execute(&self.pool)
                .await?;
        }

        if version < 2 {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS blob_files (
                    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    record_id TEXT NOT NULL,
                    filename TEXT NOT NULL,
                    data BLOB NOT NULL,
                    expiration TEXT,
                    created TEXT NOT NULL,
                    updated TEXT NOT NULL,
                    UNIQUE (record_id, filename)
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
        }

        if version < 3 {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS cached_responses (
                    request_key TEXT PRIMARY KEY,
                    response_data TEXT NOT NULL,
                    cached_at TEXT NOT NULL
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
        }

        // PRAGMA does not accept bind parameters.
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) async fn test_store() -> RecordStore {
    RecordStore::open(&SyncConfig::default(), Arc::new(SchemaRegistry::new()))
        .await
        .expect("open in-memory store")
}
