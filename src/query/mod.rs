// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local query engine.
//!
//! Builds a full SELECT from `(filter, sort, fields, limit, offset)` and
//! decodes rows dynamically:
//!
//! - no `fields` → the whole record JSON is returned per row
//! - `fields` set → system fields project to their columns, anything else
//!   becomes `json_extract(data, '$.F') AS F`, and aggregates like
//!   `COUNT(*)` pass through verbatim
//! - `sort` is a comma-separated list; a `-` prefix means DESC, `+` or
//!   nothing means ASC, with the same column-vs-json_extract logic
//!
//! Relation expansion runs as a post-pass over the decoded rows (see
//! [`expand`]).

pub mod expand;
pub mod filter;

use serde_json::{Map, Number, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::error::SyncError;
use crate::query::filter::SqlParam;
use crate::store::records::decode_row;
use crate::store::RecordStore;

/// Fields projected straight from columns in SELECT and ORDER BY.
const SYSTEM_FIELDS: &[&str] = &["id", "service", "created", "updated"];

/// Query options for list reads, local and remote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    pub filter: Option<String>,
    pub sort: Option<String>,
    pub fields: Option<String>,
    pub expand: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    #[must_use]
    pub fn fields(mut self, fields: impl Into<String>) -> Self {
        self.fields = Some(fields.into());
        self
    }

    #[must_use]
    pub fn expand(mut self, expand: impl Into<String>) -> Self {
        self.expand = Some(expand.into());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// The equivalent remote query parameters.
    #[must_use]
    pub fn to_remote_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(filter) = &self.filter {
            params.push(("filter".to_string(), filter.clone()));
        }
        if let Some(sort) = &self.sort {
            params.push(("sort".to_string(), sort.clone()));
        }
        if let Some(fields) = &self.fields {
            params.push(("fields".to_string(), fields.clone()));
        }
        if let Some(expand) = &self.expand {
            params.push(("expand".to_string(), expand.clone()));
        }
        params
    }
}

impl RecordStore {
    /// Run a local query, including relation expansion.
    pub async fn query(
        &self,
        service: &str,
        query: &ListQuery,
    ) -> Result<Vec<Value>, SyncError> {
        self.query_at_depth(service, query, 0).await
    }

    pub(crate) fn query_at_depth<'a>(
        &'a self,
        service: &'a str,
        query: &'a ListQuery,
        depth: usize,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<Value>, SyncError>> + Send + 'a>> {
        Box::pin(async move {
            let mut rows = self.query_rows(service, query).await?;
            if let Some(expand) = query.expand.as_deref() {
                if !expand.trim().is_empty() {
                    self.apply_expand(&mut rows, service, expand, depth).await?;
                }
            }
            Ok(rows)
        })
    }

    /// Execute the SQL for a query, without expansion.
    async fn query_rows(
        &self,
        service: &str,
        query: &ListQuery,
    ) -> Result<Vec<Value>, SyncError> {
        let projected = query.fields.as_deref().map(str::trim).filter(|f| !f.is_empty());
        let select = match projected {
            None => "id, service, data, created, updated".to_string(),
            Some(fields) => build_select(fields)?,
        };

        let mut sql = format!("SELECT {select} FROM services WHERE service = ?");
        let mut params: Vec<SqlParam> = Vec::new();

        if let Some(raw) = query.filter.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
            let compiled = filter::compile(raw)?;
            sql.push_str(" AND (");
            sql.push_str(&compiled.sql);
            sql.push(')');
            params.extend(compiled.params);
        }

        if let Some(sort) = query.sort.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            sql.push_str(" ORDER BY ");
            sql.push_str(&build_order_by(sort)?);
        }

        if query.limit.is_some() || query.offset.is_some() {
            // A negative LIMIT means "no limit" in SQLite.
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(SqlParam::Integer(query.limit.unwrap_or(-1)));
            params.push(SqlParam::Integer(query.offset.unwrap_or(0)));
        }

        let mut q = sqlx::query(&sql).bind(service);
        for param in &params {
            q = match param {
                SqlParam::Text(text) => q.bind(text.clone()),
                SqlParam::Number(num) => q.bind(*num),
                SqlParam::Integer(int) => q.bind(*int),
            };
        }

        let rows = q.fetch_all(self.pool()).await?;
        if projected.is_none() {
            rows.iter()
                .map(|row| decode_row(row).map(|r| r.to_value()))
                .collect()
        } else {
            rows.iter().map(row_to_value).collect()
        }
    }

    /// `COUNT(*)` over the same WHERE machinery.
    pub async fn count(
        &self,
        service: &str,
        filter: Option<&str>,
    ) -> Result<u64, SyncError> {
        let mut sql = "SELECT COUNT(*) FROM services WHERE service = ?".to_string();
        let mut params: Vec<SqlParam> = Vec::new();
        if let Some(raw) = filter.map(str::trim).filter(|f| !f.is_empty()) {
            let compiled = filter::compile(raw)?;
            sql.push_str(" AND (");
            sql.push_str(&compiled.sql);
            sql.push(')');
            params.extend(compiled.params);
        }

        let mut q = sqlx::query_scalar::<_, i64>(&sql).bind(service);
        for param in &params {
            q = match param {
                SqlParam::Text(text) => q.bind(text.clone()),
                SqlParam::Number(num) => q.bind(*num),
                SqlParam::Integer(int) => q.bind(*int),
            };
        }
        let count = q.fetch_one(self.pool()).await?;
        Ok(count as u64)
    }
}

fn build_select(fields: &str) -> Result<String, SyncError> {
    let mut terms = Vec::new();
    for raw in fields.split(',') {
        let term = raw.trim();
        if term.is_empty() {
            continue;
        }
        if term == "*" {
            terms.push("id, service, data, created, updated".to_string());
        } else if term.contains('(') {
            // Aggregates pass through untouched.
            ensure_safe_aggregate(term)?;
            terms.push(term.to_string());
        } else if SYSTEM_FIELDS.contains(&term) {
            terms.push(term.to_string());
        } else {
            let path = safe_field_path(term)?;
            terms.push(format!("json_extract(data,'$.{path}') AS \"{term}\""));
        }
    }
    if terms.is_empty() {
        return Err(SyncError::Filter("empty fields projection".into()));
    }
    Ok(terms.join(", "))
}

fn build_order_by(sort: &str) -> Result<String, SyncError> {
    let mut terms = Vec::new();
    for raw in sort.split(',') {
        let term = raw.trim();
        if term.is_empty() {
            continue;
        }
        let (direction, name) = if let Some(rest) = term.strip_prefix('-') {
            ("DESC", rest)
        } else if let Some(rest) = term.strip_prefix('+') {
            ("ASC", rest)
        } else {
            ("ASC", term)
        };
        let column = if SYSTEM_FIELDS.contains(&name) {
            name.to_string()
        } else {
            format!("json_extract(data,'$.{}')", safe_field_path(name)?)
        };
        terms.push(format!("{column} {direction}"));
    }
    if terms.is_empty() {
        return Err(SyncError::Filter("empty sort expression".into()));
    }
    Ok(terms.join(", "))
}

/// Constrain identifiers interpolated into SQL to identifier/path
/// characters. Everything else is rejected before it can reach the query.
fn safe_field_path(name: &str) -> Result<&str, SyncError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if ok {
        Ok(name)
    } else {
        Err(SyncError::Filter(format!("invalid field name '{name}'")))
    }
}

fn ensure_safe_aggregate(term: &str) -> Result<(), SyncError> {
    let ok = term
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_.*() ".contains(c));
    if ok {
        Ok(())
    } else {
        Err(SyncError::Filter(format!("invalid aggregate '{term}'")))
    }
}

/// Decode a projected row column-by-column into a JSON object.
fn row_to_value(row: &SqliteRow) -> Result<Value, SyncError> {
    let mut out = Map::new();
    for column in row.columns() {
        out.insert(column.name().to_string(), decode_column(row, column.ordinal())?);
    }
    Ok(Value::Object(out))
}

fn decode_column(row: &SqliteRow, idx: usize) -> Result<Value, SyncError> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();
    drop(raw);

    Ok(match type_name.as_str() {
        "INTEGER" => Value::Number(row.try_get::<i64, _>(idx)?.into()),
        "REAL" => {
            let num: f64 = row.try_get(idx)?;
            Number::from_f64(num).map_or(Value::Null, Value::Number)
        }
        // Blobs have no JSON shape; projecting one yields null.
        "BLOB" => Value::Null,
        _ => {
            let text: String = row.try_get(idx)?;
            // json_extract returns objects/arrays as JSON text.
            if text.starts_with('{') || text.starts_with('[') {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            } else {
                Value::String(text)
            }
        }
    })
}
