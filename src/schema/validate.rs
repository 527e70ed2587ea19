// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Schema-driven payload validation.
//!
//! Each field is checked against its declared type; `select`, `file` and
//! `relation` fields additionally check cardinality (string vs list of
//! strings per `maxSelect`). System fields are skipped. Empty strings for
//! non-required `date`/`url`/`email` fields pass through.

use serde_json::{Map, Value};

use super::{Collection, FieldSchema, FieldType};
use crate::error::SyncError;
use crate::record::parse_datetime;

/// Validate a full payload against a collection schema.
///
/// Partial updates must be merged with the persisted row before calling
/// this, so required fields that already exist are not reported missing.
pub fn validate(collection: &Collection, data: &Map<String, Value>) -> Result<(), SyncError> {
    for field in &collection.fields {
        if field.system {
            continue;
        }
        match data.get(&field.name) {
            None | Some(Value::Null) => {
                if field.required {
                    return Err(missing(field));
                }
            }
            Some(value) => validate_field(field, value)?,
        }
    }
    Ok(())
}

fn validate_field(field: &FieldSchema, value: &Value) -> Result<(), SyncError> {
    match field.field_type {
        FieldType::Text | FieldType::Editor => {
            let text = require_string(field, value)?;
            if field.required && text.is_empty() {
                return Err(missing(field));
            }
        }
        FieldType::Number => {
            if !value.is_number() {
                return Err(wrong_type(field, "a number", value));
            }
        }
        FieldType::Bool => {
            if !value.is_boolean() {
                return Err(wrong_type(field, "a boolean", value));
            }
        }
        FieldType::Date => {
            let text = require_string(field, value)?;
            if text.is_empty() {
                if field.required {
                    return Err(missing(field));
                }
            } else if parse_datetime(text).is_none() {
                return Err(invalid(field, "not a parseable ISO-8601 datetime"));
            }
        }
        FieldType::Url => {
            let text = require_string(field, value)?;
            if text.is_empty() {
                if field.required {
                    return Err(missing(field));
                }
            } else if !is_absolute_url(text) {
                return Err(invalid(field, "not an absolute URL"));
            }
        }
        FieldType::Email => {
            let text = require_string(field, value)?;
            if text.is_empty() {
                if field.required {
                    return Err(missing(field));
                }
            } else if !is_email(text) {
                return Err(invalid(field, "not a valid email address"));
            }
        }
        FieldType::Select | FieldType::File | FieldType::Relation => {
            validate_cardinality(field, value)?;
        }
        FieldType::Json | FieldType::Unknown => {}
    }
    Ok(())
}

/// `maxSelect <= 1` or absent means a single string; `>= 2` means a list of
/// strings.
fn validate_cardinality(field: &FieldSchema, value: &Value) -> Result<(), SyncError> {
    if field.is_multi() {
        let items = value
            .as_array()
            .ok_or_else(|| wrong_type(field, "a list of strings", value))?;
        if field.required && items.is_empty() {
            return Err(missing(field));
        }
        for item in items {
            if !item.is_string() {
                return Err(wrong_type(field, "a list of strings", value));
            }
        }
    } else {
        let text = require_string(field, value)?;
        if field.required && text.is_empty() {
            return Err(missing(field));
        }
    }
    Ok(())
}

fn require_string<'a>(field: &FieldSchema, value: &'a Value) -> Result<&'a str, SyncError> {
    value
        .as_str()
        .ok_or_else(|| wrong_type(field, "a string", value))
}

fn is_absolute_url(text: &str) -> bool {
    let Some((scheme, rest)) = text.split_once("://") else {
        return false;
    };
    !scheme.is_empty()
        && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        && !rest.is_empty()
        && !text.contains(char::is_whitespace)
}

fn is_email(text: &str) -> bool {
    let Some((local, domain)) = text.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !text.contains(char::is_whitespace)
        && text.matches('@').count() == 1
}

fn missing(field: &FieldSchema) -> SyncError {
    SyncError::Validation {
        field: field.name.clone(),
        reason: "required field is missing or empty".into(),
    }
}

fn wrong_type(field: &FieldSchema, expected: &str, got: &Value) -> SyncError {
    SyncError::Validation {
        field: field.name.clone(),
        reason: format!("expected {expected}, got {got}"),
    }
}

fn invalid(field: &FieldSchema, reason: &str) -> SyncError {
    SyncError::Validation {
        field: field.name.clone(),
        reason: reason.into(),
    }
}
