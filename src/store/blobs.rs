// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-record file blob cache.
//!
//! Blobs are keyed by `(record_id, filename)`; a filename is only meaningful
//! within its record. Replacement is atomic (delete-then-insert in one
//! transaction) and a `NULL` expiration never auto-expires.
//!
//! When a locally buffered upload succeeds on the server, the server renames
//! each file to `<stem>_<nonce>.<ext>`; [`match_server_filename`] pairs the
//! original name with the server's pick so the bytes can be re-cached under
//! the canonical name.

use sqlx::Row;

use super::RecordStore;
use crate::error::SyncError;
use crate::record::now_iso;

/// One cached file blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobFile {
    pub record_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    /// ISO-8601 expiry; `None` never expires.
    pub expiration: Option<String>,
    pub created: String,
    pub updated: String,
}

impl RecordStore {
    /// Store a blob, atomically replacing any prior rows for the same key.
    pub async fn set_file(
        &self,
        record_id: &str,
        filename: &str,
        bytes: Vec<u8>,
        expiration: Option<String>,
    ) -> Result<(), SyncError> {
        let now = now_iso();
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM blob_files WHERE record_id = ? AND filename = ?")
            .bind(record_id)
            .bind(filename)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO blob_files (record_id, filename, data, expiration, created, updated) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record_id)
        .bind(filename)
        .bind(bytes)
        .bind(expiration)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_file(
        &self,
        record_id: &str,
        filename: &str,
    ) -> Result<Option<BlobFile>, SyncError> {
        let row = sqlx::query(
            "SELECT record_id, filename, data, expiration, created, updated \
             FROM blob_files WHERE record_id = ? AND filename = ?",
        )
        .bind(record_id)
        .bind(filename)
        .fetch_optional(self.pool())
        .await?;

        row.map(|r| {
            Ok(BlobFile {
                record_id: r.try_get("record_id")?,
                filename: r.try_get("filename")?,
                bytes: r.try_get("data")?,
                expiration: r.try_get("expiration")?,
                created: r.try_get("created")?,
                updated: r.try_get("updated")?,
            })
        })
        .transpose()
    }

    pub async fn delete_file(&self, record_id: &str, filename: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM blob_files WHERE record_id = ? AND filename = ?")
            .bind(record_id)
            .bind(filename)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Drop every blob owned by a record.
    pub async fn delete_record_files(&self, record_id: &str) -> Result<u64, SyncError> {
        let result = sqlx::query("DELETE FROM blob_files WHERE record_id = ?")
            .bind(record_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Maintenance: delete blobs whose expiration has passed. Rows without
    /// an expiration are exempt.
    pub(crate) async fn cleanup_files(&self, now: &str) -> Result<u64, SyncError> {
        let result =
            sqlx::query("DELETE FROM blob_files WHERE expiration IS NOT NULL AND expiration < ?")
                .bind(now)
                .execute(self.pool())
                .await?;
        Ok(result.rows_affected())
    }
}

/// Pair an uploaded file's original name with the server's renamed entry:
/// prefer an exact match, otherwise any server name starting with
/// `<stem>_`.
#[must_use]
pub fn match_server_filename(original: &str, server_names: &[String]) -> Option<String> {
    if server_names.iter().any(|n| n == original) {
        return Some(original.to_string());
    }
    let stem = match original.rsplit_once('.') {
        Some((stem, _ext)) => stem,
        None => original,
    };
    let prefix = format!("{stem}_");
    server_names
        .iter()
        .find(|n| n.starts_with(&prefix))
        .cloned()
}
