// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stale-record reconciliation.
//!
//! After a full filtered listing from the server, local rows that match the
//! same filter but were absent from the response are stale and get deleted.
//! Rows with local changes are protected: pending, local-only and tombstone
//! rows always survive. An empty server response that would wipe more than
//! [`EMPTY_RESPONSE_GUARD`] rows aborts instead, so a misbehaving server
//! cannot flush the cache.

use std::collections::HashSet;

use serde_json::Value;
use tracing::warn;

use crate::error::SyncError;
use crate::metrics;
use crate::query::ListQuery;
use crate::store::RecordStore;

/// Abort threshold for reconciling against an empty server response.
pub const EMPTY_RESPONSE_GUARD: usize = 10;

impl RecordStore {
    /// Delete local rows matching `filter` that the server listing no longer
    /// contains. Returns how many rows were removed.
    pub async fn reconcile_stale(
        &self,
        service: &str,
        items: &[Value],
        filter: Option<&str>,
    ) -> Result<usize, SyncError> {
        let incoming_ids: HashSet<&str> = items
            .iter()
            .filter_map(|item| item.get("id").and_then(Value::as_str))
            .collect();

        // Candidates come from the same filter the server answered.
        let mut query = ListQuery::new();
        if let Some(filter) = filter {
            query = query.filter(filter);
        }
        let candidates = self.query(service, &query).await?;

        let mut stale = Vec::new();
        for candidate in &candidates {
            let Some(id) = candidate.get("id").and_then(Value::as_str) else {
                continue;
            };
            if incoming_ids.contains(id) {
                continue;
            }
            let synced = candidate.get("synced").and_then(Value::as_bool).unwrap_or(false);
            let no_sync = candidate.get("noSync").and_then(Value::as_bool).unwrap_or(false);
            let deleted = candidate.get("deleted").and_then(Value::as_bool).unwrap_or(false);
            if !synced || no_sync || deleted {
                continue;
            }
            stale.push(id.to_string());
        }

        if incoming_ids.is_empty() && stale.len() > EMPTY_RESPONSE_GUARD {
            warn!(
                service,
                candidates = stale.len(),
                "empty server response would delete too many rows, aborting reconcile"
            );
            return Ok(0);
        }

        for id in &stale {
            self.delete_row(service, id).await?;
        }
        metrics::record_reconciled(stale.len());
        Ok(stale.len())
    }
}
