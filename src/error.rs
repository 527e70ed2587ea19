// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the sync core.
//!
//! Every failure surfaced to a caller is a [`SyncError`]. Which variants a
//! policy recovers from (vs. surfaces) is decided in [`crate::policy`];
//! background failures are logged at warning level and left as pending rows.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The selected policy required network access but connectivity is down.
    #[error("network required but connectivity is down")]
    Offline,

    /// A cache-only read found no matching row.
    #[error("record not found in local cache: {service}/{id}")]
    CacheMiss { service: String, id: String },

    /// The server returned a non-2xx response.
    ///
    /// `status == 400` and `status == 404` are probe signals for the
    /// create↔update fallbacks under the NetworkFirst and CacheAndNetwork
    /// write policies.
    #[error("remote request failed with status {status}: {body}")]
    Remote { status: u16, body: String },

    /// Both the remote attempt and the cache fallback came up empty under
    /// NetworkFirst. Carries the remote failure when there was one.
    #[error("no remote result and no cached copy for {service}/{id}")]
    Unavailable {
        service: String,
        id: String,
        #[source]
        remote: Option<Box<SyncError>>,
    },

    /// Local schema validation rejected the payload.
    #[error("validation failed for field '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// Strict validation was requested for a collection with no cached schema.
    #[error("no cached schema for collection '{collection}'")]
    SchemaMissing { collection: String },

    /// A filter, sort or expand expression failed to parse.
    #[error("invalid query expression: {0}")]
    Filter(String),

    /// The underlying SQLite store failed.
    #[error("storage backend error: {0}")]
    Storage(String),
}

impl SyncError {
    /// True when a remote error status is one of the create↔update
    /// fallback probes.
    #[must_use]
    pub fn is_recoverable_status(&self) -> bool {
        matches!(self, Self::Remote { status, .. } if *status == 400 || *status == 404)
    }

}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
