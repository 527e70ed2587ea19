// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record data model.
//!
//! A [`Record`] is the atomic unit that flows through the cache: a JSON
//! document identified by `(id, service)` plus two ISO-8601 timestamps.
//! The `data` object carries the domain fields together with four reserved
//! control flags:
//!
//! - `synced`: the row reflects a server-confirmed state
//! - `isNew`: created locally, never existed on the server
//! - `noSync`: local-only, never sent to the server
//! - `deleted`: tombstone captured while offline
//!
//! A row with `synced = false` and `noSync ≠ true` is *pending* and will be
//! replayed by the sync manager.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::id;

/// Control flag: server-confirmed state.
pub const FLAG_SYNCED: &str = "synced";
/// Control flag: created locally, unknown to the server.
pub const FLAG_IS_NEW: &str = "isNew";
/// Control flag: local-only row, excluded from sync.
pub const FLAG_NO_SYNC: &str = "noSync";
/// Control flag: offline deletion tombstone.
pub const FLAG_DELETED: &str = "deleted";

/// Reserved collection holding the collection schemas themselves.
pub const SCHEMA_SERVICE: &str = "schema";

/// A single cached record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub service: String,
    pub data: Map<String, Value>,
    pub created: String,
    pub updated: String,
}

impl Record {
    /// Build a locally created record. Assigns a fresh ID unless `data`
    /// already carries a non-empty `id`, and stamps both timestamps with the
    /// current instant.
    pub fn new_local(service: &str, mut data: Map<String, Value>) -> Self {
        let record_id = match data.get("id").and_then(Value::as_str) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => id::generate(),
        };
        data.remove("id");
        let now = now_iso();
        Self {
            id: record_id,
            service: service.to_string(),
            data,
            created: now.clone(),
            updated: now,
        }
    }

    /// Ingest a server-shaped JSON record. Timestamps accept the fallback
    /// keys `createdAt`/`updatedAt` and are normalized to RFC 3339; a missing
    /// timestamp defaults to now.
    pub fn from_server_value(service: &str, value: &Value) -> Self {
        let mut data = value.as_object().cloned().unwrap_or_default();
        let record_id = data
            .remove("id")
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(id::generate);
        let created = take_timestamp(&mut data, "created", "createdAt");
        let updated = take_timestamp(&mut data, "updated", "updatedAt");
        Self {
            id: record_id,
            service: service.to_string(),
            data,
            created,
            updated,
        }
    }

    /// The full JSON shape: `data` merged with `id`, `created`, `updated`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut out = self.data.clone();
        out.insert("id".into(), Value::String(self.id.clone()));
        out.insert("created".into(), Value::String(self.created.clone()));
        out.insert("updated".into(), Value::String(self.updated.clone()));
        Value::Object(out)
    }

    fn flag(&self, key: &str) -> bool {
        self.data.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    #[must_use]
    pub fn synced(&self) -> bool {
        self.flag(FLAG_SYNCED)
    }

    #[must_use]
    pub fn is_new(&self) -> bool {
        self.flag(FLAG_IS_NEW)
    }

    #[must_use]
    pub fn no_sync(&self) -> bool {
        self.flag(FLAG_NO_SYNC)
    }

    #[must_use]
    pub fn deleted(&self) -> bool {
        self.flag(FLAG_DELETED)
    }

    /// Pending rows are replayed by the sync manager.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.synced() && !self.no_sync()
    }

    pub fn set_flag(&mut self, key: &str, value: bool) {
        self.data.insert(key.to_string(), Value::Bool(value));
    }

    /// Mark the row as reflecting server state. `isNew` cannot survive a
    /// confirmed sync.
    pub fn mark_synced(&mut self) {
        self.set_flag(FLAG_SYNCED, true);
        self.set_flag(FLAG_IS_NEW, false);
        self.set_flag(FLAG_DELETED, false);
    }

    pub fn touch(&mut self) {
        self.updated = now_iso();
    }

    /// True when `other.updated` is strictly newer than this row's.
    #[must_use]
    pub fn is_older_than(&self, other: &Self) -> bool {
        match (parse_datetime(&self.updated), parse_datetime(&other.updated)) {
            (Some(a), Some(b)) => a < b,
            // Unparseable timestamps fall back to lexicographic order.
            _ => self.updated < other.updated,
        }
    }
}

/// Current instant as RFC 3339 with millisecond precision.
#[must_use]
pub fn now_iso() -> String {
    format_iso(OffsetDateTime::now_utc())
}

/// Format a datetime the way timestamps are persisted. Always UTC with
/// exactly three fractional digits, so stored values compare
/// lexicographically in SQL.
#[must_use]
pub fn format_iso(dt: OffsetDateTime) -> String {
    let fmt = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    );
    dt.to_offset(time::UtcOffset::UTC)
        .format(&fmt)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00.000Z"))
}

/// Parse a timestamp in any of the accepted shapes: RFC 3339, the backend's
/// space-separated variant (`2024-01-01 10:00:00.000Z`), or a bare date.
#[must_use]
pub fn parse_datetime(raw: &str) -> Option<OffsetDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Some(dt);
    }
    if trimmed.contains(' ') {
        let swapped = trimmed.replacen(' ', "T", 1);
        if let Ok(dt) = OffsetDateTime::parse(&swapped, &Rfc3339) {
            return Some(dt);
        }
    }
    if trimmed.len() == 10 {
        let expanded = format!("{trimmed}T00:00:00Z");
        if let Ok(dt) = OffsetDateTime::parse(&expanded, &Rfc3339) {
            return Some(dt);
        }
    }
    None
}

fn take_timestamp(data: &mut Map<String, Value>, key: &str, fallback: &str) -> String {
    let raw = data
        .remove(key)
        .or_else(|| data.remove(fallback))
        .and_then(|v| v.as_str().map(str::to_string));
    match raw.as_deref().and_then(parse_datetime) {
        Some(dt) => format_iso(dt),
        None => now_iso(),
    }
}
