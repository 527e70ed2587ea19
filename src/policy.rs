// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The request policy engine.
//!
//! Every read and write is routed through one of five strategies:
//!
//! | Policy          | Reads                          | Writes                        |
//! |-----------------|--------------------------------|-------------------------------|
//! | CacheOnly       | cache, fail on miss            | local-only row (`noSync`)     |
//! | NetworkOnly     | remote, fail offline           | remote, no cache side effects |
//! | CacheFirst      | cache now, refresh in back     | cache now, push in back       |
//! | NetworkFirst    | remote, fall back to cache     | remote strictly, then cache   |
//! | CacheAndNetwork | remote, fall back to cache     | remote best-effort, cache always |
//!
//! `CacheAndNetwork` is the resilient offline-first default: writes always
//! land in the cache, tagged `synced` according to the remote outcome, and
//! the sync manager replays whatever stayed pending.
//!
//! Background work (CacheFirst refreshes and pushes) is spawned onto the
//! runtime and the handles are retained, so the owning client can abort
//! everything on shutdown instead of leaking tasks across a reload.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::metrics;
use crate::query::ListQuery;
use crate::record::{Record, FLAG_DELETED, FLAG_IS_NEW, FLAG_NO_SYNC, FLAG_SYNCED, SCHEMA_SERVICE};
use crate::remote::{Connectivity, FileUpload, ListPage, RemoteClient};
use crate::schema::validate::validate;
use crate::store::blobs::match_server_filename;
use crate::store::RecordStore;

/// The five routing strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestPolicy {
    CacheOnly,
    NetworkOnly,
    CacheFirst,
    NetworkFirst,
    #[default]
    CacheAndNetwork,
}

/// Routes reads and writes through the cache, the remote, or both.
///
/// The engine composes a shared [`RecordStore`] handle with the injected
/// [`RemoteClient`] and [`Connectivity`] seams; it owns neither.
pub struct PolicyEngine {
    store: Arc<RecordStore>,
    remote: Arc<dyn RemoteClient>,
    connectivity: Arc<dyn Connectivity>,
    config: SyncConfig,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl PolicyEngine {
    pub fn new(
        store: Arc<RecordStore>,
        remote: Arc<dyn RemoteClient>,
        connectivity: Arc<dyn Connectivity>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            config,
            background: parking_lot::Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    #[must_use]
    pub fn remote(&self) -> &Arc<dyn RemoteClient> {
        &self.remote
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.connectivity.is_connected()
    }

    /// Abort every retained background task.
    pub fn shutdown(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
    }

    /// Wait for currently spawned background tasks to settle (used by tests
    /// and by callers that need CacheFirst side effects flushed).
    pub async fn drain_background(&self) {
        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn spawn_background(&self, future: impl std::future::Future<Output = ()> + Send + 'static) {
        let mut tasks = self.background.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(tokio::spawn(future));
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fetch a single record.
    #[tracing::instrument(skip(self, query))]
    pub async fn get_one(
        &self,
        service: &str,
        id: &str,
        query: &ListQuery,
        policy: RequestPolicy,
    ) -> Result<Value, SyncError> {
        match policy {
            RequestPolicy::CacheOnly => self.cache_get_one(service, id, query).await,
            RequestPolicy::NetworkOnly => {
                self.require_online()?;
                self.remote
                    .get_one(service, id, &query.to_remote_params())
                    .await
            }
            RequestPolicy::CacheFirst => {
                match self.cache_get_one_opt(service, id, query).await? {
                    Some(value) => {
                        if self.is_online() {
                            self.spawn_refresh_one(service, id);
                        }
                        Ok(value)
                    }
                    None if self.is_online() => {
                        let fetched = self
                            .remote
                            .get_one(service, id, &query.to_remote_params())
                            .await?;
                        self.ingest_canonical(service, &fetched).await?;
                        self.cache_get_one(service, id, query).await
                    }
                    None => Err(SyncError::CacheMiss {
                        service: service.into(),
                        id: id.into(),
                    }),
                }
            }
            RequestPolicy::NetworkFirst | RequestPolicy::CacheAndNetwork => {
                let remote_err = if self.is_online() {
                    match self
                        .remote
                        .get_one(service, id, &query.to_remote_params())
                        .await
                    {
                        Ok(fetched) => {
                            self.ingest_canonical(service, &fetched).await?;
                            metrics::record_operation("network", "get", "success");
                            return Ok(fetched);
                        }
                        Err(err) => {
                            debug!(error = %err, "remote fetch failed, falling back to cache");
                            err
                        }
                    }
                } else {
                    SyncError::Offline
                };

                match self.cache_get_one_opt(service, id, query).await? {
                    Some(value) => Ok(value),
                    None => Err(SyncError::Unavailable {
                        service: service.into(),
                        id: id.into(),
                        remote: Some(Box::new(remote_err)),
                    }),
                }
            }
        }
    }

    /// Fetch one page of records.
    #[tracing::instrument(skip(self, query))]
    pub async fn get_list(
        &self,
        service: &str,
        page: u32,
        per_page: u32,
        query: &ListQuery,
        policy: RequestPolicy,
    ) -> Result<ListPage, SyncError> {
        match policy {
            RequestPolicy::CacheOnly => self.cache_get_list(service, page, per_page, query).await,
            RequestPolicy::NetworkOnly => {
                self.require_online()?;
                self.remote
                    .get_list(service, page, per_page, &query.to_remote_params())
                    .await
            }
            RequestPolicy::CacheFirst => {
                let local = self.cache_get_list(service, page, per_page, query).await?;
                if self.is_online() {
                    if local.items.is_empty() {
                        let fetched = self.network_get_list(service, page, per_page, query).await?;
                        return Ok(fetched);
                    }
                    self.spawn_refresh_list(service, page, per_page, query.clone());
                }
                Ok(local)
            }
            RequestPolicy::NetworkFirst | RequestPolicy::CacheAndNetwork => {
                if self.is_online() {
                    match self.network_get_list(service, page, per_page, query).await {
                        Ok(fetched) => return Ok(fetched),
                        Err(err) => {
                            debug!(error = %err, "remote list failed, falling back to cache")
                        }
                    }
                }
                self.cache_get_list(service, page, per_page, query).await
            }
        }
    }

    /// Fetch every record matching the query. On the network path this
    /// paginates to exhaustion, then reconciles the cache against the full
    /// listing (same filter).
    #[tracing::instrument(skip(self, query))]
    pub async fn get_full_list(
        &self,
        service: &str,
        query: &ListQuery,
        policy: RequestPolicy,
    ) -> Result<Vec<Value>, SyncError> {
        match policy {
            RequestPolicy::CacheOnly => self.store.query(service, query).await,
            RequestPolicy::NetworkOnly => {
                self.require_online()?;
                self.fetch_all_pages(service, query).await
            }
            RequestPolicy::CacheFirst => {
                let local = self.store.query(service, query).await?;
                if self.is_online() {
                    if local.is_empty() {
                        return self.network_full_list(service, query).await;
                    }
                    self.spawn_refresh_full_list(service, query.clone());
                }
                Ok(local)
            }
            RequestPolicy::NetworkFirst | RequestPolicy::CacheAndNetwork => {
                if self.is_online() {
                    match self.network_full_list(service, query).await {
                        Ok(items) => return Ok(items),
                        Err(err) => {
                            debug!(error = %err, "full-list fetch failed, falling back to cache")
                        }
                    }
                }
                self.store.query(service, query).await
            }
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Create a record.
    #[tracing::instrument(skip(self, body, files, query))]
    pub async fn create(
        &self,
        service: &str,
        mut body: Map<String, Value>,
        files: Vec<FileUpload>,
        query: &ListQuery,
        policy: RequestPolicy,
    ) -> Result<Value, SyncError> {
        let id = ensure_id(&mut body);
        apply_file_fields(&mut body, &files, &self.store, service);
        self.validate_payload(service, &body)?;
        let remote_body = Value::Object(strip_control_flags(body.clone()));

        match policy {
            RequestPolicy::CacheOnly => {
                let record = self
                    .local_create(service, body, true, /* no_sync */ true, &files)
                    .await?;
                Ok(record.to_value())
            }
            RequestPolicy::NetworkOnly => {
                self.require_online()?;
                self.remote
                    .create(service, &remote_body, &files, &query.to_remote_params())
                    .await
            }
            RequestPolicy::CacheFirst => {
                let record = self
                    .local_create(service, body, true, /* no_sync */ false, &files)
                    .await?;
                if self.is_online() {
                    self.spawn_push_create(service, id, remote_body, files, query.clone());
                }
                Ok(record.to_value())
            }
            RequestPolicy::NetworkFirst => {
                self.require_online()?;
                let canonical = self
                    .remote_create_with_fallback(service, &id, &remote_body, &files, query)
                    .await?;
                self.finalize_remote_write(service, &id, &canonical, &files)
                    .await?;
                Ok(canonical)
            }
            RequestPolicy::CacheAndNetwork => {
                if self.is_online() {
                    match self
                        .remote_create_with_fallback(service, &id, &remote_body, &files, query)
                        .await
                    {
                        Ok(canonical) => {
                            self.finalize_remote_write(service, &id, &canonical, &files)
                                .await?;
                            metrics::record_operation("network", "create", "success");
                            return Ok(canonical);
                        }
                        Err(err) => {
                            warn!(error = %err, "remote create failed, keeping pending row");
                        }
                    }
                }
                let record = self
                    .local_create(service, body, true, /* no_sync */ false, &files)
                    .await?;
                metrics::record_operation("cache", "create", "success");
                Ok(record.to_value())
            }
        }
    }

    /// Update a record (partial body).
    #[tracing::instrument(skip(self, body, files, query))]
    pub async fn update(
        &self,
        service: &str,
        id: &str,
        mut body: Map<String, Value>,
        files: Vec<FileUpload>,
        query: &ListQuery,
        policy: RequestPolicy,
    ) -> Result<Value, SyncError> {
        apply_file_fields(&mut body, &files, &self.store, service);
        let remote_body = Value::Object(strip_control_flags(body.clone()));

        match policy {
            RequestPolicy::CacheOnly => {
                let record = self
                    .local_update(service, id, body, /* no_sync */ Some(true), &files)
                    .await?;
                Ok(record.to_value())
            }
            RequestPolicy::NetworkOnly => {
                self.require_online()?;
                self.remote
                    .update(service, id, &remote_body, &files, &query.to_remote_params())
                    .await
            }
            RequestPolicy::CacheFirst => {
                let record = self
                    .local_update(service, id, body, Some(false), &files)
                    .await?;
                if self.is_online() {
                    self.spawn_push_update(service, id.to_string(), remote_body, files, query.clone());
                }
                Ok(record.to_value())
            }
            RequestPolicy::NetworkFirst => {
                self.require_online()?;
                let canonical = self
                    .remote_update_with_fallback(service, id, &remote_body, &files, query)
                    .await?;
                self.finalize_remote_write(service, id, &canonical, &files)
                    .await?;
                Ok(canonical)
            }
            RequestPolicy::CacheAndNetwork => {
                if self.is_online() {
                    match self
                        .remote_update_with_fallback(service, id, &remote_body, &files, query)
                        .await
                    {
                        Ok(canonical) => {
                            self.finalize_remote_write(service, id, &canonical, &files)
                                .await?;
                            metrics::record_operation("network", "update", "success");
                            return Ok(canonical);
                        }
                        Err(err) => {
                            warn!(error = %err, "remote update failed, keeping pending row");
                        }
                    }
                }
                let record = self
                    .local_update(service, id, body, Some(false), &files)
                    .await?;
                metrics::record_operation("cache", "update", "success");
                Ok(record.to_value())
            }
        }
    }

    /// Delete a record.
    #[tracing::instrument(skip(self))]
    pub async fn delete(
        &self,
        service: &str,
        id: &str,
        policy: RequestPolicy,
    ) -> Result<(), SyncError> {
        match policy {
            RequestPolicy::CacheOnly => {
                // Tombstone via the CacheOnly update path; no row removal.
                self.local_update(service, id, tombstone_patch(), Some(true), &[])
                    .await?;
                Ok(())
            }
            RequestPolicy::NetworkOnly => {
                self.require_online()?;
                self.remote.delete(service, id).await
            }
            RequestPolicy::CacheFirst => {
                self.store.delete_row(service, id).await?;
                if self.is_online() {
                    let remote = Arc::clone(&self.remote);
                    let service = service.to_string();
                    let id = id.to_string();
                    self.spawn_background(async move {
                        // The local row is already gone; a failure here is the
                        // documented CacheFirst-delete trade-off.
                        if let Err(err) = remote.delete(&service, &id).await {
                            warn!(service = %service, id = %id, error = %err, "background delete failed");
                        }
                    });
                }
                Ok(())
            }
            RequestPolicy::NetworkFirst => {
                self.require_online()?;
                match self.remote.delete(service, id).await {
                    Ok(()) => self.store.delete_row(service, id).await,
                    // Already gone remotely: converge.
                    Err(SyncError::Remote { status: 404, .. }) => {
                        self.store.delete_row(service, id).await
                    }
                    Err(err) => Err(err),
                }
            }
            RequestPolicy::CacheAndNetwork => {
                if self.is_online() {
                    match self.remote.delete(service, id).await {
                        Ok(()) | Err(SyncError::Remote { status: 404, .. }) => {
                            metrics::record_operation("network", "delete", "success");
                            return self.store.delete_row(service, id).await;
                        }
                        Err(err) => {
                            warn!(error = %err, "remote delete failed, keeping tombstone");
                        }
                    }
                }
                self.local_update(service, id, tombstone_patch(), None, &[])
                    .await?;
                metrics::record_operation("cache", "delete", "success");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Cache paths
    // ------------------------------------------------------------------

    async fn cache_get_one_opt(
        &self,
        service: &str,
        id: &str,
        query: &ListQuery,
    ) -> Result<Option<Value>, SyncError> {
        let escaped = id.replace('\'', "\\'");
        let scoped = ListQuery {
            filter: Some(format!("id = '{escaped}'")),
            limit: Some(1),
            ..query.clone()
        };
        let mut rows = self.store.query(service, &scoped).await?;
        Ok(rows.pop())
    }

    async fn cache_get_one(
        &self,
        service: &str,
        id: &str,
        query: &ListQuery,
    ) -> Result<Value, SyncError> {
        self.cache_get_one_opt(service, id, query)
            .await?
            .ok_or_else(|| SyncError::CacheMiss {
                service: service.into(),
                id: id.into(),
            })
    }

    async fn cache_get_list(
        &self,
        service: &str,
        page: u32,
        per_page: u32,
        query: &ListQuery,
    ) -> Result<ListPage, SyncError> {
        let page = page.max(1);
        let scoped = ListQuery {
            limit: Some(i64::from(per_page)),
            offset: Some(i64::from(per_page) * (i64::from(page) - 1)),
            ..query.clone()
        };
        let items = self.store.query(service, &scoped).await?;
        let total = self.store.count(service, query.filter.as_deref()).await?;
        Ok(ListPage {
            page,
            per_page,
            total_items: Some(total),
            items,
        })
    }

    // ------------------------------------------------------------------
    // Network paths
    // ------------------------------------------------------------------

    fn require_online(&self) -> Result<(), SyncError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(SyncError::Offline)
        }
    }

    async fn network_get_list(
        &self,
        service: &str,
        page: u32,
        per_page: u32,
        query: &ListQuery,
    ) -> Result<ListPage, SyncError> {
        let fetched = self
            .remote
            .get_list(service, page, per_page, &query.to_remote_params())
            .await?;
        for item in &fetched.items {
            self.ingest_canonical(service, item).await?;
        }
        Ok(fetched)
    }

    async fn network_full_list(
        &self,
        service: &str,
        query: &ListQuery,
    ) -> Result<Vec<Value>, SyncError> {
        let items = self.fetch_all_pages(service, query).await?;
        for item in &items {
            self.ingest_expansions(service, item).await?;
        }
        self.store
            .sync_local(service, &items, query.filter.as_deref())
            .await?;
        Ok(items)
    }

    async fn fetch_all_pages(
        &self,
        service: &str,
        query: &ListQuery,
    ) -> Result<Vec<Value>, SyncError> {
        let per_page = self.config.list_page_size.max(1);
        let params = query.to_remote_params();
        let fetch = async {
            let mut items = Vec::new();
            let mut page = 1u32;
            loop {
                let fetched = self
                    .remote
                    .get_list(service, page, per_page, &params)
                    .await?;
                let got = fetched.items.len();
                items.extend(fetched.items);
                if got < per_page as usize {
                    break;
                }
                page += 1;
            }
            Ok(items)
        };

        tokio::time::timeout(self.config.list_timeout(), fetch)
            .await
            .map_err(|_| SyncError::Remote {
                status: 0,
                body: "full-list fetch timed out".into(),
            })?
    }

    // ------------------------------------------------------------------
    // Local write paths
    // ------------------------------------------------------------------

    async fn local_create(
        &self,
        service: &str,
        mut data: Map<String, Value>,
        is_new: bool,
        no_sync: bool,
        files: &[FileUpload],
    ) -> Result<Record, SyncError> {
        data.insert(FLAG_SYNCED.into(), Value::Bool(false));
        data.insert(FLAG_IS_NEW.into(), Value::Bool(is_new));
        data.insert(FLAG_NO_SYNC.into(), Value::Bool(no_sync));
        data.entry(FLAG_DELETED).or_insert(Value::Bool(false));

        let record = self.store.create_row(service, data, false).await?;
        for file in files {
            self.store
                .set_file(&record.id, &file.filename, file.bytes.clone(), None)
                .await?;
        }
        Ok(record)
    }

    async fn local_update(
        &self,
        service: &str,
        id: &str,
        mut patch: Map<String, Value>,
        no_sync: Option<bool>,
        files: &[FileUpload],
    ) -> Result<Record, SyncError> {
        patch.insert(FLAG_SYNCED.into(), Value::Bool(false));
        if let Some(no_sync) = no_sync {
            patch.insert(FLAG_NO_SYNC.into(), Value::Bool(no_sync));
        }
        // Validation sees the merged row, so a partial patch never trips a
        // required field the persisted data already carries.
        let record = self.store.update_row(service, id, patch, true).await?;
        for file in files {
            self.store
                .set_file(&record.id, &file.filename, file.bytes.clone(), None)
                .await?;
        }
        Ok(record)
    }

    fn validate_payload(&self, service: &str, data: &Map<String, Value>) -> Result<(), SyncError> {
        match self.store.registry().by_name(service) {
            Some(collection) => validate(&collection, data),
            None if self.config.strict_validation && service != SCHEMA_SERVICE => {
                Err(SyncError::SchemaMissing {
                    collection: service.to_string(),
                })
            }
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Remote write helpers
    // ------------------------------------------------------------------

    /// Create on the server; an `HTTP 400` for a create that carried an id
    /// probes for "already exists" and falls back to update.
    async fn remote_create_with_fallback(
        &self,
        service: &str,
        id: &str,
        body: &Value,
        files: &[FileUpload],
        query: &ListQuery,
    ) -> Result<Value, SyncError> {
        let params = query.to_remote_params();
        match self.remote.create(service, body, files, &params).await {
            Ok(canonical) => Ok(canonical),
            Err(SyncError::Remote { status: 400, .. }) => {
                debug!(service, id, "create returned 400, retrying as update");
                self.remote.update(service, id, body, files, &params).await
            }
            Err(err) => Err(err),
        }
    }

    /// Update on the server; `404`/`400` probe for "does not exist yet" and
    /// fall back to create-with-id.
    async fn remote_update_with_fallback(
        &self,
        service: &str,
        id: &str,
        body: &Value,
        files: &[FileUpload],
        query: &ListQuery,
    ) -> Result<Value, SyncError> {
        let params = query.to_remote_params();
        match self.remote.update(service, id, body, files, &params).await {
            Ok(canonical) => Ok(canonical),
            Err(err) if err.is_recoverable_status() => {
                debug!(service, id, "update probe failed, retrying as create");
                let mut with_id = body.as_object().cloned().unwrap_or_default();
                with_id.insert("id".into(), Value::String(id.to_string()));
                self.remote
                    .create(service, &Value::Object(with_id), files, &params)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Install a server-confirmed record in the cache: reconcile a changed
    /// id, re-cache uploaded blobs under the server's filenames, and mark
    /// the row synced.
    async fn finalize_remote_write(
        &self,
        service: &str,
        local_id: &str,
        canonical: &Value,
        files: &[FileUpload],
    ) -> Result<(), SyncError> {
        let record = self.ingest_canonical(service, canonical).await?;

        if record.id != local_id {
            warn!(
                service,
                local_id,
                server_id = %record.id,
                "server assigned a different id, replacing local row"
            );
            self.store.delete_row(service, local_id).await?;
            self.store.delete_record_files(local_id).await?;
        }

        for file in files {
            let server_names = filenames_in(canonical, &file.field);
            match match_server_filename(&file.filename, &server_names) {
                Some(server_name) => {
                    if server_name != file.filename {
                        self.store.delete_file(&record.id, &file.filename).await?;
                    }
                    self.store
                        .set_file(&record.id, &server_name, file.bytes.clone(), None)
                        .await?;
                }
                None => {
                    warn!(
                        field = %file.field,
                        filename = %file.filename,
                        "uploaded file missing from server response"
                    );
                }
            }
        }
        Ok(())
    }

    /// Store a server-shaped record as synced, after pushing any populated
    /// `expand` tree into the respective collections. The embedded `expand`
    /// itself is not persisted; expansion always re-derives it from rows.
    pub(crate) async fn ingest_canonical(
        &self,
        service: &str,
        value: &Value,
    ) -> Result<Record, SyncError> {
        self.ingest_expansions(service, value).await?;
        let mut record = Record::from_server_value(service, value);
        record.data.remove("expand");
        record.mark_synced();
        self.store.upsert(&record).await?;
        if service == SCHEMA_SERVICE {
            self.store.registry().ingest_record(&record);
        }
        Ok(record)
    }

    fn ingest_expansions<'a>(
        &'a self,
        service: &'a str,
        value: &'a Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SyncError>> + Send + 'a>>
    {
        Box::pin(async move {
            let Some(expand) = value.get("expand").and_then(Value::as_object) else {
                return Ok(());
            };
            let Some(collection) = self.store.registry().by_name(service) else {
                warn!(service, "cannot place expanded records without a schema");
                return Ok(());
            };
            for (field_name, related) in expand {
                let target = collection
                    .field(field_name)
                    .and_then(|f| f.data.collection_id.as_deref())
                    .and_then(|id| self.store.registry().by_id(id));
                let Some(target) = target else {
                    warn!(service, field = %field_name, "expanded field has no relation target");
                    continue;
                };
                match related {
                    Value::Array(items) => {
                        for item in items {
                            self.ingest_canonical(&target.name, item).await?;
                        }
                    }
                    Value::Object(_) => {
                        self.ingest_canonical(&target.name, related).await?;
                    }
                    _ => {}
                }
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Background tasks (CacheFirst)
    // ------------------------------------------------------------------

    fn spawn_refresh_one(&self, service: &str, id: &str) {
        let remote = Arc::clone(&self.remote);
        let store = Arc::clone(&self.store);
        let service = service.to_string();
        let id = id.to_string();
        self.spawn_background(async move {
            match remote.get_one(&service, &id, &[]).await {
                // Timestamp-aware merge: an out-of-order response never
                // clobbers a newer local copy (last-write-wins).
                Ok(fetched) => {
                    if let Err(err) = store.merge_local(&service, &[fetched]).await {
                        warn!(service = %service, id = %id, error = %err, "background refresh write failed");
                    }
                }
                Err(err) => debug!(service = %service, id = %id, error = %err, "background refresh failed"),
            }
        });
    }

    fn spawn_refresh_list(&self, service: &str, page: u32, per_page: u32, query: ListQuery) {
        let remote = Arc::clone(&self.remote);
        let store = Arc::clone(&self.store);
        let service = service.to_string();
        self.spawn_background(async move {
            match remote
                .get_list(&service, page, per_page, &query.to_remote_params())
                .await
            {
                Ok(fetched) => {
                    if let Err(err) = store.merge_local(&service, &fetched.items).await {
                        warn!(service = %service, error = %err, "background list merge failed");
                    }
                }
                Err(err) => debug!(service = %service, error = %err, "background list refresh failed"),
            }
        });
    }

    fn spawn_refresh_full_list(&self, service: &str, query: ListQuery) {
        let remote = Arc::clone(&self.remote);
        let store = Arc::clone(&self.store);
        let per_page = self.config.list_page_size.max(1);
        let service = service.to_string();
        self.spawn_background(async move {
            let params = query.to_remote_params();
            let mut items = Vec::new();
            let mut page = 1u32;
            loop {
                match remote.get_list(&service, page, per_page, &params).await {
                    Ok(fetched) => {
                        let got = fetched.items.len();
                        items.extend(fetched.items);
                        if got < per_page as usize {
                            break;
                        }
                        page += 1;
                    }
                    Err(err) => {
                        debug!(service = %service, error = %err, "background full-list refresh failed");
                        return;
                    }
                }
            }
            if let Err(err) = store
                .sync_local(&service, &items, query.filter.as_deref())
                .await
            {
                warn!(service = %service, error = %err, "background sync_local failed");
            }
        });
    }

    fn spawn_push_create(
        &self,
        service: &str,
        id: String,
        body: Value,
        files: Vec<FileUpload>,
        query: ListQuery,
    ) {
        let this = self.clone_for_background();
        let service = service.to_string();
        self.spawn_background(async move {
            match this
                .remote_create_with_fallback(&service, &id, &body, &files, &query)
                .await
            {
                Ok(canonical) => {
                    if let Err(err) = this
                        .finalize_remote_write(&service, &id, &canonical, &files)
                        .await
                    {
                        warn!(service = %service, id = %id, error = %err, "background create finalize failed");
                    }
                }
                // The row stays pending; the sync manager retries it.
                Err(err) => warn!(service = %service, id = %id, error = %err, "background create failed"),
            }
        });
    }

    fn spawn_push_update(
        &self,
        service: &str,
        id: String,
        body: Value,
        files: Vec<FileUpload>,
        query: ListQuery,
    ) {
        let this = self.clone_for_background();
        let service = service.to_string();
        self.spawn_background(async move {
            match this
                .remote_update_with_fallback(&service, &id, &body, &files, &query)
                .await
            {
                Ok(canonical) => {
                    if let Err(err) = this
                        .finalize_remote_write(&service, &id, &canonical, &files)
                        .await
                    {
                        warn!(service = %service, id = %id, error = %err, "background update finalize failed");
                    }
                }
                Err(err) => warn!(service = %service, id = %id, error = %err, "background update failed"),
            }
        });
    }

    /// A detached engine sharing the same seams, for captured background
    /// work (its own task list is never populated).
    fn clone_for_background(&self) -> Arc<PolicyEngine> {
        Arc::new(PolicyEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.remote),
            Arc::clone(&self.connectivity),
            self.config.clone(),
        ))
    }
}

// ----------------------------------------------------------------------
// Free helpers
// ----------------------------------------------------------------------

/// Use the caller's id when present, otherwise generate a
/// server-compatible one.
fn ensure_id(body: &mut Map<String, Value>) -> String {
    match body.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            let id = crate::id::generate();
            body.insert("id".into(), Value::String(id.clone()));
            id
        }
    }
}

/// Point the record's file fields at the buffered filenames (string for
/// single fields, list for multi).
fn apply_file_fields(
    body: &mut Map<String, Value>,
    files: &[FileUpload],
    store: &RecordStore,
    service: &str,
) {
    if files.is_empty() {
        return;
    }
    let collection = store.registry().by_name(service);
    let mut grouped: Map<String, Value> = Map::new();
    for file in files {
        let multi = collection
            .as_ref()
            .and_then(|c| c.field(&file.field))
            .map(|f| f.is_multi());
        let many = multi.unwrap_or_else(|| {
            files.iter().filter(|f| f.field == file.field).count() > 1
        });
        if many {
            let slot = grouped
                .entry(file.field.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(list) = slot.as_array_mut() {
                list.push(Value::String(file.filename.clone()));
            }
        } else {
            grouped.insert(file.field.clone(), Value::String(file.filename.clone()));
        }
    }
    for (field, names) in grouped {
        body.insert(field, names);
    }
}

fn strip_control_flags(mut body: Map<String, Value>) -> Map<String, Value> {
    for key in [FLAG_SYNCED, FLAG_IS_NEW, FLAG_NO_SYNC, FLAG_DELETED, "expand"] {
        body.remove(key);
    }
    body
}

fn tombstone_patch() -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert(FLAG_DELETED.into(), Value::Bool(true));
    patch
}

/// Filenames the server stored under a field (string or list).
fn filenames_in(canonical: &Value, field: &str) -> Vec<String> {
    match canonical.get(field) {
        Some(Value::String(name)) if !name.is_empty() => vec![name.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
