// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! CRUD over the `services` table.
//!
//! Rows are keyed by `(id, service)`. Control flags travel inside the `data`
//! JSON, so the pending scan and maintenance pass are plain `json_extract`
//! predicates. Partial updates three-way merge (existing → patch → forced
//! id) before validation, so a patch never fails for required fields the
//! persisted row already has.

use serde_json::{Map, Value};
use sqlx::Row;

use super::RecordStore;
use crate::error::SyncError;
use crate::record::{Record, FLAG_DELETED, FLAG_NO_SYNC, FLAG_SYNCED, SCHEMA_SERVICE};
use crate::resilience::{with_backoff, Backoff};
use crate::schema::validate::validate;

/// Predicate fragment selecting pending rows (unsynced, not local-only).
pub(crate) const PENDING_PREDICATE: &str = "json_extract(data,'$.synced') = 0 \
     AND (json_extract(data,'$.noSync') IS NULL OR json_extract(data,'$.noSync') = 0)";

impl RecordStore {
    /// Fetch one row by primary key.
    pub async fn get_row(&self, service: &str, id: &str) -> Result<Option<Record>, SyncError> {
        let row = sqlx::query(
            "SELECT id, service, data, created, updated FROM services \
             WHERE service = ? AND id = ?",
        )
        .bind(service)
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|r| decode_row(&r)).transpose()
    }

    /// Insert or replace a full row.
    pub async fn upsert(&self, record: &Record) -> Result<(), SyncError> {
        let data = record.to_value().to_string();
        with_backoff("record upsert", &Backoff::statement(), || async {
            sqlx::query(
                "INSERT INTO services (id, service, data, created, updated) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(id, service) DO UPDATE SET \
                    data = excluded.data, \
                    created = excluded.created, \
                    updated = excluded.updated",
            )
            .bind(&record.id)
            .bind(&record.service)
            .bind(&data)
            .bind(&record.created)
            .bind(&record.updated)
            .execute(self.pool())
            .await
            .map_err(SyncError::from)?;
            Ok(())
        })
        .await
    }

    /// Create a row from caller-supplied data (control flags included by the
    /// caller). Validates against the cached schema when `validate_data` is
    /// set and a schema exists.
    pub async fn create_row(
        &self,
        service: &str,
        data: Map<String, Value>,
        validate_data: bool,
    ) -> Result<Record, SyncError> {
        let record = Record::new_local(service, data);
        if validate_data {
            if let Some(collection) = self.registry().by_name(service) {
                validate(&collection, &record.data)?;
            }
        }
        self.upsert(&record).await?;
        if service == SCHEMA_SERVICE {
            self.registry().ingest_record(&record);
        }
        Ok(record)
    }

    /// Partially update a row. The patch is merged over the persisted data
    /// (or applied to a fresh row when none exists), the id is forced, and
    /// `updated` is stamped.
    pub async fn update_row(
        &self,
        service: &str,
        id: &str,
        patch: Map<String, Value>,
        validate_data: bool,
    ) -> Result<Record, SyncError> {
        let mut record = match self.get_row(service, id).await? {
            Some(existing) => existing,
            None => {
                let mut data = Map::new();
                data.insert("id".into(), Value::String(id.to_string()));
                Record::new_local(service, data)
            }
        };

        for (key, value) in patch {
            if key == "id" || key == "created" || key == "updated" {
                continue;
            }
            record.data.insert(key, value);
        }
        record.touch();

        if validate_data {
            if let Some(collection) = self.registry().by_name(service) {
                validate(&collection, &record.data)?;
            }
        }
        self.upsert(&record).await?;
        if service == SCHEMA_SERVICE {
            self.registry().ingest_record(&record);
        }
        Ok(record)
    }

    /// Delete a row and, in the same transaction, every file blob its
    /// file-typed fields reference.
    pub async fn delete_row(&self, service: &str, id: &str) -> Result<(), SyncError> {
        let Some(record) = self.get_row(service, id).await? else {
            return Ok(());
        };
        let filenames = self.file_names_of(&record);

        let mut tx = self.pool().begin().await?;
        for filename in &filenames {
            sqlx::query("DELETE FROM blob_files WHERE record_id = ? AND filename = ?")
                .bind(&record.id)
                .bind(filename)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM services WHERE id = ? AND service = ?")
            .bind(&record.id)
            .bind(&record.service)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Bulk upsert of server-shaped items; every row lands marked synced.
    pub async fn set_local(&self, service: &str, items: &[Value]) -> Result<usize, SyncError> {
        let mut written = 0;
        for item in items {
            let mut record = Record::from_server_value(service, item);
            record.mark_synced();
            self.upsert(&record).await?;
            if service == SCHEMA_SERVICE {
                self.registry().ingest_record(&record);
            }
            written += 1;
        }
        Ok(written)
    }

    /// Timestamp-aware bulk upsert: writes only rows that are absent locally
    /// or whose incoming `updated` is strictly newer.
    pub async fn merge_local(&self, service: &str, items: &[Value]) -> Result<usize, SyncError> {
        let mut written = 0;
        for item in items {
            let mut incoming = Record::from_server_value(service, item);
            incoming.mark_synced();
            let keep = match self.get_row(service, &incoming.id).await? {
                Some(local) => local.is_older_than(&incoming),
                None => true,
            };
            if keep {
                self.upsert(&incoming).await?;
                if service == SCHEMA_SERVICE {
                    self.registry().ingest_record(&incoming);
                }
                written += 1;
            }
        }
        Ok(written)
    }

    /// Merge a full server listing, then drop local rows the listing no
    /// longer contains (see the stale reconciler for the guard rules).
    pub async fn sync_local(
        &self,
        service: &str,
        items: &[Value],
        filter: Option<&str>,
    ) -> Result<usize, SyncError> {
        let written = self.merge_local(service, items).await?;
        self.reconcile_stale(service, items, filter).await?;
        Ok(written)
    }

    /// Services that currently hold pending rows.
    pub async fn pending_services(&self) -> Result<Vec<String>, SyncError> {
        let sql = format!("SELECT DISTINCT service FROM services WHERE {PENDING_PREDICATE}");
        let rows = sqlx::query(&sql).fetch_all(self.pool()).await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("service").map_err(SyncError::from))
            .collect()
    }

    /// Pending rows of one service, in local insertion order.
    pub async fn pending_rows(&self, service: &str) -> Result<Vec<Record>, SyncError> {
        let sql = format!(
            "SELECT id, service, data, created, updated FROM services \
             WHERE service = ? AND {PENDING_PREDICATE} ORDER BY created, id"
        );
        let rows = sqlx::query(&sql)
            .bind(service)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(decode_row).collect()
    }

    /// Total pending rows across all services.
    pub async fn pending_count(&self) -> Result<u64, SyncError> {
        let sql = format!("SELECT COUNT(*) AS cnt FROM services WHERE {PENDING_PREDICATE}");
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(self.pool()).await?;
        Ok(count as u64)
    }

    /// Maintenance: delete synced, non-local-only, non-tombstone rows older
    /// than `cutoff` (strict `<`). Schema rows are exempt.
    pub(crate) async fn cleanup_records(&self, cutoff: &str) -> Result<u64, SyncError> {
        let result = sqlx::query(
            "DELETE FROM services WHERE service != ? \
             AND json_extract(data,'$.synced') = 1 \
             AND (json_extract(data,'$.noSync') IS NULL OR json_extract(data,'$.noSync') = 0) \
             AND (json_extract(data,'$.deleted') IS NULL OR json_extract(data,'$.deleted') = 0) \
             AND updated < ?",
        )
        .bind(SCHEMA_SERVICE)
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Filenames referenced by the record's file-typed fields, per schema.
    pub(crate) fn file_names_of(&self, record: &Record) -> Vec<String> {
        let Some(collection) = self.registry().by_name(&record.service) else {
            return Vec::new();
        };
        let mut names = Vec::new();
        for field in collection.file_fields() {
            match record.data.get(&field.name) {
                Some(Value::String(name)) if !name.is_empty() => names.push(name.clone()),
                Some(Value::Array(items)) => {
                    names.extend(
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .filter(|n| !n.is_empty())
                            .map(str::to_string),
                    );
                }
                _ => {}
            }
        }
        names
    }
}

pub(crate) fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<Record, SyncError> {
    let id: String = row.try_get("id")?;
    let service: String = row.try_get("service")?;
    let data_text: String = row.try_get("data")?;
    let created: String = row.try_get("created")?;
    let updated: String = row.try_get("updated")?;

    let mut data = serde_json::from_str::<Value>(&data_text)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    // The columns are authoritative for the system fields.
    data.remove("id");
    data.remove("created");
    data.remove("updated");

    Ok(Record {
        id,
        service,
        data,
        created,
        updated,
    })
}

/// Flag helper used by callers building pending rows.
pub(crate) fn with_flags(
    mut data: Map<String, Value>,
    synced: bool,
    is_new: bool,
    no_sync: bool,
) -> Map<String, Value> {
    data.insert(FLAG_SYNCED.into(), Value::Bool(synced));
    data.insert(crate::record::FLAG_IS_NEW.into(), Value::Bool(is_new));
    data.insert(FLAG_NO_SYNC.into(), Value::Bool(no_sync));
    data.entry(FLAG_DELETED).or_insert(Value::Bool(false));
    data
}
