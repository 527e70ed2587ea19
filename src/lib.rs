//! # recordsync
//!
//! An offline-first synchronization core for record-oriented backends.
//! Reads and writes proceed whether or not the network is available, against
//! a transparent local mirror that converges with the server when
//! connectivity returns.
//!
//! ## Architecture
//!
//! ```text
//!                caller
//!                  │
//!                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Policy Engine                          │
//! │  • Five strategies: CacheOnly / NetworkOnly / CacheFirst /  │
//! │    NetworkFirst / CacheAndNetwork                           │
//! │  • Distinct read/write/delete semantics per strategy        │
//! └─────────────────────────────────────────────────────────────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────────────────┐   ┌────────────────────────────┐
//! │   Cache Store (SQLite)   │   │   RemoteClient (injected)  │
//! │  • services / blob_files │   │  • CRUD + arbitrary routes │
//! │    / cached_responses    │   │  • realtime subscriptions  │
//! │  • filter → SQL compiler │   │  • multipart file upload   │
//! │  • relation expansion    │   └────────────────────────────┘
//! └──────────────────────────┘                │
//!        ▲                                    │
//!        │        ┌───────────────────────────┘
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Sync Manager                          │
//! │  • Drains pending rows on connectivity restoration          │
//! │  • Stale reconcile after full filtered listings             │
//! │  • Coalesced drains, awaitable completion                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use recordsync::{ManualConnectivity, RequestPolicy, SyncClient, SyncConfig};
//!
//! # async fn demo(remote: Arc<dyn recordsync::RemoteClient>) -> Result<(), recordsync::SyncError> {
//! let connectivity = Arc::new(ManualConnectivity::new(false)); // offline
//! let client = SyncClient::open(SyncConfig::default(), remote, connectivity.clone()).await?;
//!
//! // Writes succeed offline; the row is tagged pending.
//! let posts = client.collection("posts");
//! let body = serde_json::json!({"title": "Hi"}).as_object().cloned().unwrap();
//! let record = posts.create(body, Vec::new(), None).await?;
//! assert_eq!(record["synced"], serde_json::json!(false));
//!
//! // Coming back online triggers a drain; await its completion.
//! connectivity.set_online(true);
//! client.sync_completed().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`client`]: the [`SyncClient`] facade and per-collection handles
//! - [`policy`]: the five-way request policy engine
//! - [`store`]: the SQLite cache (records, file blobs, cached responses)
//! - [`query`]: filter compiler, list queries and relation expansion
//! - [`schema`]: collection schema registry and validation
//! - [`sync`]: pending-row drains and stale reconciliation
//! - [`maintenance`]: TTL cleanup
//! - [`remote`]: the injected transport and connectivity seams

pub mod client;
pub mod config;
pub mod error;
pub mod id;
pub mod maintenance;
pub mod metrics;
pub mod policy;
pub mod query;
pub mod record;
pub mod remote;
pub mod resilience;
pub mod schema;
pub mod store;
pub mod sync;

pub use client::{RecordService, SyncClient};
pub use config::SyncConfig;
pub use error::SyncError;
pub use maintenance::MaintenanceReport;
pub use policy::{PolicyEngine, RequestPolicy};
pub use query::filter::{CompiledFilter, SqlParam};
pub use query::ListQuery;
pub use record::Record;
pub use remote::{
    Connectivity, FileUpload, ListPage, ManualConnectivity, RealtimeAction, RealtimeEvent,
    RemoteClient, SendRequest,
};
pub use schema::{Collection, FieldSchema, FieldType, SchemaRegistry};
pub use store::blobs::BlobFile;
pub use store::RecordStore;
pub use sync::{DrainReport, SyncManager};
