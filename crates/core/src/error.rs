//! Error taxonomy for store operations.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::selector::SelectorError;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{resource} {name:?} not found")]
    NotFound { resource: String, name: String },

    #[error("{resource} {name:?} already exists")]
    AlreadyExists { resource: String, name: String },

    /// Stale version token or failed precondition.
    #[error("operation cannot be fulfilled on {resource} {name:?}: {message}")]
    Conflict { resource: String, name: String, message: String },

    #[error("{resource} {name:?} is invalid: {}", join_field_errors(.errors))]
    ValidationFailed { resource: String, name: String, errors: Vec<FieldError> },

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid resource version {0:?}")]
    InvalidResourceVersion(String),

    #[error("invalid selector: {0}")]
    InvalidSelector(#[from] SelectorError),

    /// Watch requested from a revision the backend no longer retains.
    #[error("too old resource version: {requested} (oldest retained {oldest})")]
    Gone { requested: u64, oldest: u64 },

    /// Transient backend failure; never retried by the engine.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("codec: {0}")]
    Codec(String),

    /// Per-item failures collected by delete-collection.
    #[error("{} item(s) failed, {deleted} deleted: {}", .failures.len(), join_item_errors(.failures))]
    Aggregate { deleted: usize, failures: Vec<ItemError> },
}

impl StoreError {
    pub fn not_found(resource: &str, name: &str) -> Self {
        StoreError::NotFound { resource: resource.to_string(), name: name.to_string() }
    }

    pub fn already_exists(resource: &str, name: &str) -> Self {
        StoreError::AlreadyExists { resource: resource.to_string(), name: name.to_string() }
    }

    pub fn conflict(resource: &str, name: &str, message: impl Into<String>) -> Self {
        StoreError::Conflict {
            resource: resource.to_string(),
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid(resource: &str, name: &str, errors: Vec<FieldError>) -> Self {
        StoreError::ValidationFailed { resource: resource.to_string(), name: name.to_string(), errors }
    }

    pub fn invalid_name(name: &str, reason: impl Into<String>) -> Self {
        StoreError::InvalidName { name: name.to_string(), reason: reason.into() }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound { .. }) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists { .. }) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
    pub fn is_invalid(&self) -> bool { matches!(self, StoreError::ValidationFailed { .. }) }
    pub fn is_gone(&self) -> bool { matches!(self, StoreError::Gone { .. }) }

    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not_found",
            StoreError::AlreadyExists { .. } => "already_exists",
            StoreError::Conflict { .. } => "conflict",
            StoreError::ValidationFailed { .. } => "invalid",
            StoreError::InvalidName { .. } => "invalid_name",
            StoreError::InvalidResourceVersion(_) => "invalid_resource_version",
            StoreError::InvalidSelector(_) => "invalid_selector",
            StoreError::Gone { .. } => "gone",
            StoreError::BackendUnavailable(_) => "unavailable",
            StoreError::Codec(_) => "codec",
            StoreError::Aggregate { .. } => "aggregate",
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// A failed item inside an aggregate error.
#[derive(Debug)]
pub struct ItemError {
    pub name: String,
    pub error: StoreError,
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldErrorKind {
    Required,
    Invalid,
    Forbidden,
    Immutable,
    TooLong,
}

/// A single validation failure on one field of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub kind: FieldErrorKind,
    /// Dotted path, e.g. `metadata.name` or `involvedObject.namespace`.
    pub field: String,
    pub value: Option<String>,
    pub detail: String,
}

impl FieldError {
    pub fn required(field: &str, detail: impl Into<String>) -> Self {
        Self { kind: FieldErrorKind::Required, field: field.to_string(), value: None, detail: detail.into() }
    }

    pub fn invalid(field: &str, value: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: FieldErrorKind::Invalid,
            field: field.to_string(),
            value: Some(value.into()),
            detail: detail.into(),
        }
    }

    pub fn forbidden(field: &str, detail: impl Into<String>) -> Self {
        Self { kind: FieldErrorKind::Forbidden, field: field.to_string(), value: None, detail: detail.into() }
    }

    pub fn immutable(field: &str) -> Self {
        Self {
            kind: FieldErrorKind::Immutable,
            field: field.to_string(),
            value: None,
            detail: "field is immutable".to_string(),
        }
    }

    pub fn too_long(field: &str, value: impl Into<String>, max: usize) -> Self {
        Self {
            kind: FieldErrorKind::TooLong,
            field: field.to_string(),
            value: Some(value.into()),
            detail: format!("must have at most {} characters", max),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FieldErrorKind::Required => "Required value",
            FieldErrorKind::Invalid => "Invalid value",
            FieldErrorKind::Forbidden => "Forbidden",
            FieldErrorKind::Immutable => "Invalid value",
            FieldErrorKind::TooLong => "Too long",
        };
        write!(f, "{}: {}", self.field, kind)?;
        if let Some(v) = &self.value {
            write!(f, ": {:?}", v)?;
        }
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    let parts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

fn join_item_errors(failures: &[ItemError]) -> String {
    let parts: Vec<String> = failures.iter().map(|e| e.to_string()).collect();
    parts.join("; ")
}
