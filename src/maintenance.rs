// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! TTL-based cache maintenance.
//!
//! One pass deletes, with a strict `<` cutoff:
//! - synced, non-local-only, non-tombstone records older than the TTL
//!   (unsynced rows survive indefinitely)
//! - cached responses older than the TTL
//! - file blobs whose expiration has passed
//!
//! A `None` TTL disables the pass entirely and returns zeros.

use std::time::Duration;

use crate::error::SyncError;
use crate::metrics;
use crate::record::{format_iso, now_iso};
use crate::store::RecordStore;

/// Counts of what one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub deleted_records: u64,
    pub deleted_responses: u64,
    pub deleted_files: u64,
}

impl MaintenanceReport {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.deleted_records + self.deleted_responses + self.deleted_files
    }
}

impl RecordStore {
    /// Run one maintenance pass. `ttl = None` is a no-op.
    pub async fn run_maintenance(
        &self,
        ttl: Option<Duration>,
    ) -> Result<MaintenanceReport, SyncError> {
        let Some(ttl) = ttl else {
            return Ok(MaintenanceReport::default());
        };

        let now = time::OffsetDateTime::now_utc();
        let cutoff = format_iso(now - ttl);

        let report = MaintenanceReport {
            deleted_records: self.cleanup_records(&cutoff).await?,
            deleted_responses: self.cleanup_responses(&cutoff).await?,
            deleted_files: self.cleanup_files(&now_iso()).await?,
        };
        metrics::record_maintenance(
            report.deleted_records,
            report.deleted_responses,
            report.deleted_files,
        );
        Ok(report)
    }
}
