//! Response shapes for the generated resource routes.

use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Paginated collection.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListPage {
    pub data: Vec<Value>,
    pub total_count: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Updated {
    pub updated: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deleted {
    pub deleted_resource_records: i64,
    pub deleted_m2m_refs: i64,
}

/// `{<pk name>: value}` returned by create.
pub fn created_key(pk: &str, value: Value) -> (StatusCode, Json<Value>) {
    let mut body = Map::new();
    body.insert(pk.to_string(), value);
    (StatusCode::CREATED, Json(Value::Object(body)))
}

pub fn ok<T: Serialize>(data: T) -> (StatusCode, Json<T>) {
    (StatusCode::OK, Json(data))
}

pub fn error_body(code: &str, message: String, details: Option<serde_json::Value>) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}
