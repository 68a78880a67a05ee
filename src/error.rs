//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::sql::TemplateError;

/// Startup errors: bad declarations, unreadable resource files, bad environment.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("invalid primary key on {resource}: {reason}")]
    InvalidPrimaryKey { resource: String, reason: String },
    #[error("duplicate route: {0}")]
    DuplicateRoute(String),
    #[error("resource {resource}: unknown field '{field}' in {list}")]
    UnknownField {
        resource: String,
        list: &'static str,
        field: String,
    },
    #[error("resource {0}: nested extension requires a parent and an extension column")]
    MissingExtensionTarget(String),
    #[error("environment variable {key}: invalid value '{value}'")]
    Env { key: &'static str, value: String },
    #[error("config load: {0}")]
    Load(String),
    #[error("template: {0}")]
    Template(#[from] TemplateError),
    #[error("validation: {0}")]
    Validation(String),
}

/// Field name to list of messages (or to a nested map for nested bodies).
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(pub Map<String, Value>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: &str, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.push(field, message);
        errors
    }

    /// Appends a message to the field's list, creating it when absent.
    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        let entry = self
            .0
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(list) => list.push(Value::String(message.into())),
            other => *other = Value::Array(vec![Value::String(message.into())]),
        }
    }

    pub fn insert_nested(&mut self, field: &str, nested: FieldErrors) {
        self.0.insert(field.to_string(), Value::Object(nested.0));
    }

    /// Wraps all errors under one envelope key, e.g. `{"payload": {...}}`.
    pub fn wrap(self, key: &str) -> Self {
        let mut outer = Self::new();
        outer.insert_nested(key, self);
        outer
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }
}

impl std::fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation not allowed: {0}")]
    MethodNotAllowed(String),
    #[error("validation: {0}")]
    Validation(FieldErrors),
    #[error("no rows matched the update")]
    UpdateFailed,
    #[error("{0}")]
    DeleteFailed(String),
    #[error("authentication required")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("statement timed out")]
    Timeout,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl AppError {
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        AppError::Validation(FieldErrors::single(field, message))
    }

    pub fn delete_failed() -> Self {
        AppError::DeleteFailed("no rows matched the delete".into())
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Field errors are the body itself, keyed by field name.
        if let AppError::Validation(errors) = self {
            return (StatusCode::BAD_REQUEST, Json(errors)).into_response();
        }
        let (status, code) = match &self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::MethodNotAllowed(_) => (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::UpdateFailed => (StatusCode::NOT_FOUND, "update_failed"),
            AppError::DeleteFailed(_) => (StatusCode::NOT_FOUND, "delete_failed"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            AppError::Db(e) => {
                if let sqlx::Error::PoolTimedOut = e {
                    (StatusCode::SERVICE_UNAVAILABLE, "database_unavailable")
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, "database_error")
                }
            }
            AppError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Template(_) => (StatusCode::INTERNAL_SERVER_ERROR, "template_error"),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}
