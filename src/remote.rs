// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! External seams: the remote transport and the connectivity probe.
//!
//! The sync core never talks HTTP itself. It consumes a [`RemoteClient`]
//! (CRUD, arbitrary routes, realtime subscriptions, multipart file upload)
//! and a [`Connectivity`] probe (a boolean watch stream with a rising edge
//! on reconnect). Both are injected so tests can drive them
//! deterministically.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::SyncError;

/// One page of a remote list response.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub page: u32,
    pub per_page: u32,
    pub total_items: Option<u64>,
    pub items: Vec<Value>,
}

/// A file buffered for multipart upload, keyed by the record field it
/// belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub field: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Action attached to a realtime event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeAction {
    Create,
    Update,
    Delete,
}

/// A server-pushed realtime event for a subscribed topic.
#[derive(Debug, Clone)]
pub struct RealtimeEvent {
    pub action: RealtimeAction,
    pub record: Option<Value>,
}

/// An arbitrary-route request passed through [`RemoteClient::send`].
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub path: String,
    pub method: String,
    /// Query parameters, order-insensitive.
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub files: Vec<FileUpload>,
}

/// The remote transport contract.
///
/// Implementations own authentication, retries at the HTTP layer, and the
/// realtime connection. Errors map onto [`SyncError::Remote`] with the
/// response status; transport-level failures (DNS, TLS, timeouts) should use
/// status `0`.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get_one(
        &self,
        service: &str,
        id: &str,
        query: &[(String, String)],
    ) -> Result<Value, SyncError>;

    async fn get_list(
        &self,
        service: &str,
        page: u32,
        per_page: u32,
        query: &[(String, String)],
    ) -> Result<ListPage, SyncError>;

    async fn create(
        &self,
        service: &str,
        body: &Value,
        files: &[FileUpload],
        query: &[(String, String)],
    ) -> Result<Value, SyncError>;

    async fn update(
        &self,
        service: &str,
        id: &str,
        body: &Value,
        files: &[FileUpload],
        query: &[(String, String)],
    ) -> Result<Value, SyncError>;

    async fn delete(&self, service: &str, id: &str) -> Result<(), SyncError>;

    /// Send a request to an arbitrary route.
    async fn send(&self, request: SendRequest) -> Result<Value, SyncError>;

    /// Open a realtime subscription. Events arrive on the returned channel
    /// until [`unsubscribe`](Self::unsubscribe) is called or the client is
    /// dropped.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<RealtimeEvent>, SyncError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), SyncError>;
}

/// The connectivity probe contract.
///
/// `subscribe()` hands out a watch receiver; a `false → true` transition is
/// the signal the sync manager drains on. Emitting `true` repeatedly must be
/// harmless (edges are detected by the consumer).
pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> bool;
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// A [`Connectivity`] implementation driven by hand. Useful in tests and for
/// embedders that already track network state.
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    pub fn set_online(&self, online: bool) {
        // send_replace never fails even with no active receivers.
        self.tx.send_replace(online);
    }
}

impl Connectivity for ManualConnectivity {
    fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
