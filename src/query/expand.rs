// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relation expansion.
//!
//! `expand` is a comma-separated list of dotted paths (`author`,
//! `author.company,tags`). For each top-level relation the engine resolves
//! the target collection through the schema, gathers every referenced ID
//! across the result set, issues a single batched lookup, and attaches the
//! related records under `expand.<field>`: a single object (or null) for
//! single relations, a list for multi, matching the server's shape exactly.
//!
//! The remaining dotted tail recurses as the batched query's own expand, up
//! to a depth of 6. Indirect back-reference expansion is not implemented.

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::SyncError;
use crate::query::ListQuery;
use crate::store::RecordStore;

/// Maximum dotted-path depth an expansion may reach.
pub const MAX_EXPAND_DEPTH: usize = 6;

impl RecordStore {
    /// Expand relations in-place across a decoded result set.
    pub(crate) async fn apply_expand(
        &self,
        rows: &mut [Value],
        service: &str,
        expand: &str,
        depth: usize,
    ) -> Result<(), SyncError> {
        if depth >= MAX_EXPAND_DEPTH {
            return Err(SyncError::Filter(format!(
                "expand depth exceeds the maximum of {MAX_EXPAND_DEPTH}"
            )));
        }
        if rows.is_empty() {
            return Ok(());
        }

        for segment in split_segments(expand) {
            let (head, tail) = match segment.split_once('.') {
                Some((head, tail)) => (head, Some(tail)),
                None => (segment.as_str(), None),
            };
            if head.contains("_via_") {
                return Err(SyncError::Filter(format!(
                    "indirect expand not supported: '{head}'"
                )));
            }
            self.expand_relation(rows, service, head, tail, depth).await?;
        }
        Ok(())
    }

    async fn expand_relation(
        &self,
        rows: &mut [Value],
        service: &str,
        field_name: &str,
        tail: Option<&str>,
        depth: usize,
    ) -> Result<(), SyncError> {
        let Some(collection) = self.registry().by_name(service) else {
            return Err(SyncError::SchemaMissing {
                collection: service.to_string(),
            });
        };
        let Some(field) = collection.field(field_name) else {
            warn!(service, field = field_name, "expand of unknown field skipped");
            return Ok(());
        };
        let Some(target_id) = field.data.collection_id.as_deref() else {
            warn!(service, field = field_name, "expand of non-relation field skipped");
            return Ok(());
        };
        let Some(target) = self.registry().by_id(target_id) else {
            return Err(SyncError::SchemaMissing {
                collection: target_id.to_string(),
            });
        };

        // Gather every referenced ID across the result set.
        let mut ids = BTreeSet::new();
        for row in rows.iter() {
            collect_ids(row.get(field_name), &mut ids);
        }
        let related = if ids.is_empty() {
            HashMap::new()
        } else {
            let filter = ids
                .iter()
                .map(|id| format!("id = '{}'", id.replace('\'', "\\'")))
                .collect::<Vec<_>>()
                .join(" || ");
            let mut query = ListQuery::new().filter(format!("({filter})"));
            if let Some(tail) = tail {
                query = query.expand(tail);
            }
            // Type-erased so the async recursion has a finite type.
            let nested: std::pin::Pin<
                Box<dyn std::future::Future<Output = Result<Vec<Value>, SyncError>> + Send + '_>,
            > = Box::pin(self.query_at_depth(&target.name, &query, depth + 1));
            let fetched = nested.await?;
            fetched
                .into_iter()
                .filter_map(|value| {
                    let id = value.get("id")?.as_str()?.to_string();
                    Some((id, value))
                })
                .collect::<HashMap<String, Value>>()
        };

        let multi = field.is_multi();
        for row in rows.iter_mut() {
            let attached = if multi {
                let mut items = Vec::new();
                if let Some(Value::Array(refs)) = row.get(field_name) {
                    for id in refs.iter().filter_map(Value::as_str) {
                        if let Some(value) = related.get(id) {
                            items.push(value.clone());
                        }
                    }
                }
                Value::Array(items)
            } else {
                match row.get(field_name).and_then(Value::as_str) {
                    Some(id) => related.get(id).cloned().unwrap_or(Value::Null),
                    None => Value::Null,
                }
            };

            let Some(object) = row.as_object_mut() else {
                continue;
            };
            let expand_slot = object
                .entry("expand")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(slot) = expand_slot.as_object_mut() {
                slot.insert(field_name.to_string(), attached);
            }
        }
        Ok(())
    }
}

fn split_segments(expand: &str) -> Vec<String> {
    expand
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn collect_ids(value: Option<&Value>, ids: &mut BTreeSet<String>) {
    match value {
        Some(Value::String(id)) if !id.is_empty() => {
            ids.insert(id.clone());
        }
        Some(Value::Array(items)) => {
            for id in items.iter().filter_map(Value::as_str) {
                if !id.is_empty() {
                    ids.insert(id.to_string());
                }
            }
        }
        _ => {}
    }
}
