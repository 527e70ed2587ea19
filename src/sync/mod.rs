// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The sync manager.
//!
//! Watches the connectivity stream; on every `false → true` edge (and on
//! app-resume while online) it drains the pending rows: for each collection
//! with unsynced, non-local-only rows, the rows are replayed through the
//! policy engine with the resilient `CacheAndNetwork` policy, in local
//! insertion order:
//!
//! - tombstones replay as deletes
//! - `isNew` rows replay as creates, stripped of server-owned fields (local
//!   ids are server-compatible, so no remap is needed)
//! - everything else replays as a full update
//!
//! A failed row is logged and iteration continues. One drain runs at a
//! time: concurrent triggers coalesce onto the running drain, and
//! [`SyncManager::sync_completed`] lets callers await it. The pending scan
//! is a point-in-time snapshot; rows that appear mid-drain wait for the
//! next edge.

pub mod reconcile;

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::metrics;
use crate::policy::{PolicyEngine, RequestPolicy};
use crate::query::ListQuery;
use crate::record::{Record, FLAG_DELETED, FLAG_IS_NEW, FLAG_NO_SYNC, FLAG_SYNCED, SCHEMA_SERVICE};
use crate::remote::Connectivity;
use crate::store::RecordStore;

/// Fields owned by the server, stripped before replaying a create.
const SERVER_OWNED_FIELDS: &[&str] = &[
    "created",
    "updated",
    "collectionId",
    "collectionName",
    "expand",
    FLAG_SYNCED,
    FLAG_IS_NEW,
    FLAG_DELETED,
];

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub failed: usize,
}

/// Drives pending-row replay on connectivity restoration.
pub struct SyncManager {
    store: Arc<RecordStore>,
    engine: Arc<PolicyEngine>,
    connectivity: Arc<dyn Connectivity>,
    /// Held for the duration of a drain; coalesces duplicate triggers.
    drain_guard: Arc<Mutex<()>>,
    watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(
        store: Arc<RecordStore>,
        engine: Arc<PolicyEngine>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            engine,
            connectivity,
            drain_guard: Arc::new(Mutex::new(())),
            watcher: parking_lot::Mutex::new(None),
        })
    }

    /// Start watching connectivity edges. Idempotent.
    pub fn start(&self) {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return;
        }
        let guard = Arc::clone(&self.drain_guard);
        let store = Arc::clone(&self.store);
        let engine = Arc::clone(&self.engine);
        let mut rx = self.connectivity.subscribe();
        *slot = Some(tokio::spawn(async move {
            let mut online = *rx.borrow();
            while rx.changed().await.is_ok() {
                let now_online = *rx.borrow();
                if now_online && !online {
                    debug!("connectivity restored, triggering drain");
                    spawn_drain(
                        Arc::clone(&guard),
                        Arc::clone(&store),
                        Arc::clone(&engine),
                    );
                }
                online = now_online;
            }
        }));
    }

    /// Stop the connectivity watcher.
    pub fn stop(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }

    /// App-lifecycle resume hook: drain if currently online.
    pub fn notify_resumed(&self) {
        if self.connectivity.is_connected() {
            self.trigger_drain();
        }
    }

    /// Launch a drain unless one is already running (duplicate triggers
    /// coalesce onto the running pass).
    pub fn trigger_drain(&self) {
        spawn_drain(
            Arc::clone(&self.drain_guard),
            Arc::clone(&self.store),
            Arc::clone(&self.engine),
        );
    }

    /// Wait until no drain is running.
    pub async fn sync_completed(&self) {
        let _guard = self.drain_guard.lock().await;
    }

    /// Number of rows awaiting replay.
    pub async fn pending_count(&self) -> Result<u64, SyncError> {
        self.store.pending_count().await
    }

    /// One full drain pass over every collection with pending rows.
    pub async fn drain(&self) -> Result<DrainReport, SyncError> {
        drain_rows(&self.store, &self.engine).await
    }
}

/// Spawn a drain unless one is already running; duplicate triggers coalesce
/// onto the running pass.
fn spawn_drain(guard: Arc<Mutex<()>>, store: Arc<RecordStore>, engine: Arc<PolicyEngine>) {
    tokio::spawn(async move {
        let Ok(_guard) = guard.try_lock_owned() else {
            debug!("drain already running, trigger coalesced");
            return;
        };
        if let Err(err) = drain_rows(&store, &engine).await {
            warn!(error = %err, "drain pass failed");
        }
    });
}

async fn drain_rows(
    store: &RecordStore,
    engine: &PolicyEngine,
) -> Result<DrainReport, SyncError> {
    let mut report = DrainReport::default();
    let services = store.pending_services().await?;
    for service in services {
        if is_reserved(&service) {
            continue;
        }
        // Snapshot: rows that appear after this SELECT wait for the
        // next drain.
        let rows = store.pending_rows(&service).await?;
        for row in rows {
            match replay_row(store, engine, &service, &row).await {
                Ok(()) => report.replayed += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        service = %service,
                        id = %row.id,
                        error = %err,
                        "pending row replay failed, continuing"
                    );
                }
            }
        }
    }
    metrics::record_drained(report.replayed, report.failed);
    if let Ok(pending) = store.pending_count().await {
        metrics::set_pending_rows(pending as usize);
    }
    if report.replayed > 0 || report.failed > 0 {
        info!(
            replayed = report.replayed,
            failed = report.failed,
            "drain pass finished"
        );
    }
    Ok(report)
}

async fn replay_row(
    store: &RecordStore,
    engine: &PolicyEngine,
    service: &str,
    row: &Record,
) -> Result<(), SyncError> {
    if row.deleted() {
        return engine
            .delete(service, &row.id, RequestPolicy::CacheAndNetwork)
            .await;
    }
    let files = buffered_uploads(store, service, row).await?;
    if row.is_new() {
        let body = create_body(row);
        engine
            .create(
                service,
                body,
                files,
                &ListQuery::new(),
                RequestPolicy::CacheAndNetwork,
            )
            .await?;
        return Ok(());
    }
    let body = update_body(row);
    engine
        .update(
            service,
            &row.id,
            body,
            files,
            &ListQuery::new(),
            RequestPolicy::CacheAndNetwork,
        )
        .await?;
    Ok(())
}

/// Re-attach locally buffered blobs to the replayed request, keyed by the
/// file fields the schema declares.
async fn buffered_uploads(
    store: &RecordStore,
    service: &str,
    row: &Record,
) -> Result<Vec<crate::remote::FileUpload>, SyncError> {
    let Some(collection) = store.registry().by_name(service) else {
        return Ok(Vec::new());
    };
    let mut uploads = Vec::new();
    for field in collection.file_fields() {
        let names: Vec<String> = match row.data.get(&field.name) {
            Some(Value::String(name)) if !name.is_empty() => vec![name.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect(),
            _ => continue,
        };
        for name in names {
            if let Some(blob) = store.get_file(&row.id, &name).await? {
                uploads.push(crate::remote::FileUpload {
                    field: field.name.clone(),
                    filename: name,
                    bytes: blob.bytes,
                });
            }
        }
    }
    Ok(uploads)
}

fn is_reserved(service: &str) -> bool {
    service == SCHEMA_SERVICE || service.starts_with('_')
}

/// Replay body for a locally created row: the record JSON minus
/// server-owned fields, keeping the local id.
fn create_body(row: &Record) -> Map<String, Value> {
    let mut body = row.data.clone();
    for field in SERVER_OWNED_FIELDS {
        body.remove(*field);
    }
    body.remove(FLAG_NO_SYNC);
    body.insert("id".into(), Value::String(row.id.clone()));
    body
}

/// Replay body for a locally modified row: the full record JSON minus
/// control flags.
fn update_body(row: &Record) -> Map<String, Value> {
    let mut body = row.data.clone();
    for field in [FLAG_SYNCED, FLAG_IS_NEW, FLAG_NO_SYNC, FLAG_DELETED, "expand"] {
        body.remove(field);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row_with(data: Value) -> Record {
        let mut record = Record::new_local("posts", data.as_object().cloned().unwrap());
        record.id = "abc123def456ghi".into();
        record
    }

    #[test]
    fn reserved_services_are_skipped() {
        assert!(is_reserved("schema"));
        assert!(is_reserved("_internal"));
        assert!(!is_reserved("posts"));
    }

    #[test]
    fn create_body_strips_server_owned_fields() {
        let row = row_with(json!({
            "title": "Hi",
            "collectionId": "c1",
            "collectionName": "posts",
            "expand": {"author": {}},
            "synced": false,
            "isNew": true,
            "noSync": false,
            "deleted": false,
        }));
        let body = create_body(&row);
        assert_eq!(body["id"], json!("abc123def456ghi"));
        assert_eq!(body["title"], json!("Hi"));
        for key in ["collectionId", "collectionName", "expand", "synced", "isNew", "deleted", "noSync", "created", "updated"] {
            assert!(!body.contains_key(key), "leaked '{key}'");
        }
    }

    #[test]
    fn update_body_keeps_domain_fields_only() {
        let row = row_with(json!({
            "title": "Hi",
            "views": 2,
            "synced": false,
            "isNew": false,
            "deleted": false,
        }));
        let body = update_body(&row);
        assert_eq!(body.len(), 2);
        assert_eq!(body["views"], json!(2));
    }
}
