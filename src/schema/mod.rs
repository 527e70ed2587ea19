// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collection schema registry.
//!
//! Schemas drive three things: payload validation, single-vs-multi
//! disambiguation for `select`/`file`/`relation` fields, and relation
//! targeting during expansion. The registry is a concurrent cache populated
//! from a bundled JSON snapshot (offline bootstrap) and/or schema records
//! ingested from the server.
//!
//! The `maxSelect` option is authoritative for cardinality: absent or `<= 1`
//! means single-valued, `>= 2` means multi-valued.
//!
//! # Example
//!
//! ```
//! use recordsync::schema::SchemaRegistry;
//!
//! let registry = SchemaRegistry::new();
//! registry.load_snapshot(r#"[
//!     {"id": "c_posts", "name": "posts", "fields": [
//!         {"name": "title", "type": "text", "required": true},
//!         {"name": "tags", "type": "select", "data": {"maxSelect": 5}}
//!     ]}
//! ]"#).unwrap();
//!
//! let posts = registry.by_name("posts").unwrap();
//! assert!(posts.field("tags").unwrap().is_multi());
//! assert!(registry.by_id("c_posts").is_some());
//! ```

pub mod validate;

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::record::Record;

/// Typed field kinds recognized by validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Editor,
    Number,
    Bool,
    Date,
    Url,
    Email,
    Select,
    File,
    Relation,
    Json,
    #[serde(other)]
    Unknown,
}

/// Per-field options. `maxSelect` decides cardinality; `collectionId`
/// targets the related collection for `relation` fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldOptions {
    #[serde(default, rename = "maxSelect")]
    pub max_select: Option<u32>,
    #[serde(default, rename = "collectionId")]
    pub collection_id: Option<String>,
}

/// One field of a collection schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub data: FieldOptions,
}

impl FieldSchema {
    /// Multi-valued iff `maxSelect >= 2`.
    #[must_use]
    pub fn is_multi(&self) -> bool {
        self.data.max_select.is_some_and(|m| m >= 2)
    }
}

/// A collection schema: the record shape stored under the reserved
/// `schema` service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "schema")]
    pub fields: Vec<FieldSchema>,
}

impl Collection {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// All file-typed fields, used for blob cascade on record delete.
    pub fn file_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields
            .iter()
            .filter(|f| f.field_type == FieldType::File)
    }
}

/// Concurrent schema cache with name and id lookups.
pub struct SchemaRegistry {
    by_name: DashMap<String, Arc<Collection>>,
    id_index: DashMap<String, String>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            id_index: DashMap::new(),
        }
    }

    /// Register or replace a collection schema.
    pub fn register(&self, collection: Collection) {
        self.id_index
            .insert(collection.id.clone(), collection.name.clone());
        self.by_name
            .insert(collection.name.clone(), Arc::new(collection));
    }

    #[must_use]
    pub fn by_name(&self, service: &str) -> Option<Arc<Collection>> {
        self.by_name.get(service).map(|c| Arc::clone(c.value()))
    }

    #[must_use]
    pub fn by_id(&self, id: &str) -> Option<Arc<Collection>> {
        let name = self.id_index.get(id)?;
        self.by_name(name.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Bootstrap from a bundled JSON array of collections. Returns how many
    /// were registered.
    pub fn load_snapshot(&self, json: &str) -> Result<usize, SyncError> {
        let collections: Vec<Collection> = serde_json::from_str(json)
            .map_err(|e| SyncError::Storage(format!("invalid schema snapshot: {e}")))?;
        let count = collections.len();
        for collection in collections {
            self.register(collection);
        }
        Ok(count)
    }

    /// Ingest a schema record (`service = "schema"`); rows with an
    /// unrecognized shape are skipped.
    pub fn ingest_record(&self, record: &Record) {
        let value = Value::Object(record.data.clone());
        let mut parsed: Collection = match serde_json::from_value(value) {
            Ok(c) => c,
            Err(_) => return,
        };
        if parsed.id.is_empty() {
            parsed.id = record.id.clone();
        }
        if parsed.name.is_empty() {
            return;
        }
        self.register(parsed);
    }
}
