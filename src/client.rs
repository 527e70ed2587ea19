// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The client facade.
//!
//! [`SyncClient`] owns the cache store and wires the policy engine, sync
//! manager and realtime ingest together. Collection handles from
//! [`SyncClient::collection`] hold shared, non-owning references; dropping a
//! handle never closes the store.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use recordsync::{ManualConnectivity, SyncClient, SyncConfig};
//! # async fn demo(remote: Arc<dyn recordsync::RemoteClient>) -> Result<(), recordsync::SyncError> {
//! let connectivity = Arc::new(ManualConnectivity::new(true));
//! let client = SyncClient::open(SyncConfig::default(), remote, connectivity).await?;
//!
//! let posts = client.collection("posts");
//! let body = serde_json::json!({"title": "Hi"}).as_object().cloned().unwrap();
//! let record = posts.create(body, Vec::new(), None).await?;
//! println!("created {}", record["id"]);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::maintenance::MaintenanceReport;
use crate::policy::{PolicyEngine, RequestPolicy};
use crate::query::ListQuery;
use crate::record::SCHEMA_SERVICE;
use crate::remote::{
    Connectivity, FileUpload, ListPage, RealtimeAction, RemoteClient, SendRequest,
};
use crate::store::responses::request_key;
use crate::store::RecordStore;
use crate::sync::SyncManager;

/// The offline-first sync client.
pub struct SyncClient {
    config: SyncConfig,
    store: Arc<RecordStore>,
    engine: Arc<PolicyEngine>,
    sync: Arc<SyncManager>,
    remote: Arc<dyn RemoteClient>,
    connectivity: Arc<dyn Connectivity>,
    subscriptions: Arc<parking_lot::Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl SyncClient {
    /// Open the cache database and start the connectivity watcher.
    pub async fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteClient>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Result<Self, SyncError> {
        let registry = Arc::new(crate::schema::SchemaRegistry::new());
        let store = Arc::new(RecordStore::open(&config, registry).await?);

        // Warm the registry from schema rows persisted by earlier runs.
        let schemas = store.query(SCHEMA_SERVICE, &ListQuery::new()).await?;
        for schema in &schemas {
            let record = crate::record::Record::from_server_value(SCHEMA_SERVICE, schema);
            store.registry().ingest_record(&record);
        }

        let engine = Arc::new(PolicyEngine::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            Arc::clone(&connectivity),
            config.clone(),
        ));
        let sync = SyncManager::new(
            Arc::clone(&store),
            Arc::clone(&engine),
            Arc::clone(&connectivity),
        );
        sync.start();

        Ok(Self {
            config,
            store,
            engine,
            sync,
            remote,
            connectivity,
            subscriptions: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        })
    }

    /// A handle onto one collection.
    #[must_use]
    pub fn collection(&self, service: &str) -> RecordService {
        RecordService {
            service: service.to_string(),
            engine: Arc::clone(&self.engine),
            store: Arc::clone(&self.store),
            remote: Arc::clone(&self.remote),
            connectivity: Arc::clone(&self.connectivity),
            default_policy: self.config.request_policy,
            subscriptions: Arc::clone(&self.subscriptions),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    #[must_use]
    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.connectivity.is_connected()
    }

    /// Bootstrap collection schemas from a bundled JSON snapshot. The rows
    /// are also persisted so future runs start with them.
    pub async fn load_schema_snapshot(&self, json: &str) -> Result<usize, SyncError> {
        let count = self.store.registry().load_snapshot(json)?;
        let items: Vec<Value> = serde_json::from_str(json)
            .map_err(|e| SyncError::Storage(format!("invalid schema snapshot: {e}")))?;
        self.store.set_local(SCHEMA_SERVICE, &items).await?;
        Ok(count)
    }

    /// Send a request to an arbitrary route, answering idempotent reads from
    /// the response cache while offline.
    pub async fn send(&self, request: SendRequest) -> Result<Value, SyncError> {
        let key = request_key(
            &request.method,
            &request.path,
            &request.query,
            request.body.as_ref(),
            !request.files.is_empty(),
            &self.config.response_blocklist,
        );

        if self.connectivity.is_connected() {
            match self.remote.send(request).await {
                Ok(value) => {
                    if let Some(key) = &key {
                        self.store.put_response(key, &value).await?;
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if let Some(key) = &key {
                        if let Some(cached) = self.store.get_response(key).await? {
                            debug!(error = %err, "remote send failed, answering from response cache");
                            return Ok(cached);
                        }
                    }
                    return Err(err);
                }
            }
        }

        if let Some(key) = &key {
            if let Some(cached) = self.store.get_response(key).await? {
                return Ok(cached);
            }
        }
        Err(SyncError::Offline)
    }

    /// Run maintenance with the client-level TTL.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, SyncError> {
        self.store.run_maintenance(self.config.cache_ttl()).await
    }

    /// Run maintenance with an explicit TTL (`None` disables cleanup).
    pub async fn run_maintenance_with(
        &self,
        ttl: Option<Duration>,
    ) -> Result<MaintenanceReport, SyncError> {
        self.store.run_maintenance(ttl).await
    }

    /// App-lifecycle resume hook.
    pub fn notify_resumed(&self) {
        self.sync.notify_resumed();
    }

    /// Wait for the currently running drain (if any) to finish.
    pub async fn sync_completed(&self) {
        self.sync.sync_completed().await;
    }

    /// Stop watchers, abort background tasks and close the database.
    pub async fn shutdown(&self) {
        self.sync.stop();
        self.engine.shutdown();
        for (_, handle) in self.subscriptions.lock().drain() {
            handle.abort();
        }
        self.store.close().await;
    }
}

/// A shared, non-owning handle onto one collection.
#[derive(Clone)]
pub struct RecordService {
    service: String,
    engine: Arc<PolicyEngine>,
    store: Arc<RecordStore>,
    remote: Arc<dyn RemoteClient>,
    connectivity: Arc<dyn Connectivity>,
    default_policy: RequestPolicy,
    subscriptions: Arc<parking_lot::Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl RecordService {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.service
    }

    fn resolve(&self, policy: Option<RequestPolicy>) -> RequestPolicy {
        policy.unwrap_or(self.default_policy)
    }

    pub async fn get_one(
        &self,
        id: &str,
        policy: Option<RequestPolicy>,
    ) -> Result<Value, SyncError> {
        self.get_one_with(id, &ListQuery::new(), policy).await
    }

    pub async fn get_one_with(
        &self,
        id: &str,
        query: &ListQuery,
        policy: Option<RequestPolicy>,
    ) -> Result<Value, SyncError> {
        self.engine
            .get_one(&self.service, id, query, self.resolve(policy))
            .await
    }

    /// `get_one` that maps a miss to `None` instead of an error.
    pub async fn get_one_or_none(
        &self,
        id: &str,
        policy: Option<RequestPolicy>,
    ) -> Result<Option<Value>, SyncError> {
        match self.get_one(id, policy).await {
            Ok(value) => Ok(Some(value)),
            Err(SyncError::CacheMiss { .. })
            | Err(SyncError::Unavailable { .. })
            | Err(SyncError::Remote { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn get_list(
        &self,
        page: u32,
        per_page: u32,
        query: &ListQuery,
        policy: Option<RequestPolicy>,
    ) -> Result<ListPage, SyncError> {
        self.engine
            .get_list(&self.service, page, per_page, query, self.resolve(policy))
            .await
    }

    pub async fn get_full_list(
        &self,
        query: &ListQuery,
        policy: Option<RequestPolicy>,
    ) -> Result<Vec<Value>, SyncError> {
        self.engine
            .get_full_list(&self.service, query, self.resolve(policy))
            .await
    }

    /// Count local rows matching a filter.
    pub async fn count(&self, filter: Option<&str>) -> Result<u64, SyncError> {
        self.store.count(&self.service, filter).await
    }

    pub async fn create(
        &self,
        body: Map<String, Value>,
        files: Vec<FileUpload>,
        policy: Option<RequestPolicy>,
    ) -> Result<Value, SyncError> {
        self.engine
            .create(
                &self.service,
                body,
                files,
                &ListQuery::new(),
                self.resolve(policy),
            )
            .await
    }

    pub async fn update(
        &self,
        id: &str,
        body: Map<String, Value>,
        files: Vec<FileUpload>,
        policy: Option<RequestPolicy>,
    ) -> Result<Value, SyncError> {
        self.engine
            .update(
                &self.service,
                id,
                body,
                files,
                &ListQuery::new(),
                self.resolve(policy),
            )
            .await
    }

    pub async fn delete(
        &self,
        id: &str,
        policy: Option<RequestPolicy>,
    ) -> Result<(), SyncError> {
        self.engine
            .delete(&self.service, id, self.resolve(policy))
            .await
    }

    /// The reactive full-list variant: emits the cache contents first, then
    /// one merged update after the remote fetch and reconcile complete. No
    /// partial pages are ever interleaved into the stream.
    pub fn watch_list(&self, query: ListQuery) -> mpsc::Receiver<Vec<Value>> {
        let (tx, rx) = mpsc::channel(2);
        let this = self.clone();
        tokio::spawn(async move {
            match this.store.query(&this.service, &query).await {
                Ok(rows) => {
                    if tx.send(rows).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(service = %this.service, error = %err, "watch_list cache read failed");
                    return;
                }
            }

            if !this.connectivity.is_connected() {
                return;
            }
            if let Err(err) = this
                .engine
                .get_full_list(&this.service, &query, RequestPolicy::NetworkFirst)
                .await
            {
                debug!(service = %this.service, error = %err, "watch_list refresh failed");
                return;
            }
            match this.store.query(&this.service, &query).await {
                Ok(rows) => {
                    let _ = tx.send(rows).await;
                }
                Err(err) => {
                    warn!(service = %this.service, error = %err, "watch_list merged read failed");
                }
            }
        });
        rx
    }

    /// Subscribe to realtime events for this collection (`record_id = "*"`
    /// for the whole collection) and apply them to the cache: creates and
    /// updates land synced, deletes remove the row.
    pub async fn subscribe(&self, record_id: &str) -> Result<(), SyncError> {
        let topic = self.topic(record_id);
        let mut events = self.remote.subscribe(&topic).await?;

        let engine = Arc::clone(&self.engine);
        let store = Arc::clone(&self.store);
        let service = self.service.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(record) = event.record else { continue };
                let result = match event.action {
                    RealtimeAction::Create | RealtimeAction::Update => {
                        engine.ingest_canonical(&service, &record).await.map(|_| ())
                    }
                    RealtimeAction::Delete => match record.get("id").and_then(Value::as_str) {
                        Some(id) => store.delete_row(&service, id).await,
                        None => Ok(()),
                    },
                };
                if let Err(err) = result {
                    warn!(service = %service, error = %err, "realtime event apply failed");
                }
            }
        });

        if let Some(stale) = self.subscriptions.lock().insert(topic, handle) {
            stale.abort();
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, record_id: &str) -> Result<(), SyncError> {
        let topic = self.topic(record_id);
        if let Some(handle) = self.subscriptions.lock().remove(&topic) {
            handle.abort();
        }
        self.remote.unsubscribe(&topic).await
    }

    fn topic(&self, record_id: &str) -> String {
        if record_id == "*" || record_id.is_empty() {
            self.service.clone()
        } else {
            format!("{}/{}", self.service, record_id)
        }
    }
}
