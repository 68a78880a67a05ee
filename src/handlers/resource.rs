//! Resource CRUD handlers. Each resolves the resource by path segment and hands the
//! request to a [`Dispatcher`].

use crate::config::Operation;
use crate::error::AppError;
use crate::extractors::SessionContext;
use crate::service::Dispatcher;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::Response,
};
use serde_json::{Map, Value};

/// Query pairs as a JSON object. Repeated keys collect into an array; `a.b=1` becomes
/// `{"a": {"b": "1"}}` so foreign-key sub-filters reach the lookup contract.
pub fn group_query(pairs: Vec<(String, String)>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in pairs {
        let nested = key
            .split_once('.')
            .filter(|(outer, inner)| !outer.is_empty() && !inner.is_empty())
            .map(|(outer, inner)| (outer.to_string(), inner.to_string()));
        let (target, key) = match nested {
            Some((outer, inner)) => {
                let entry = out.entry(outer).or_insert_with(|| Value::Object(Map::new()));
                if !entry.is_object() {
                    *entry = Value::Object(Map::new());
                }
                let Value::Object(m) = entry else { continue };
                (m, inner)
            }
            None => (&mut out, key),
        };
        match target.get_mut(&key) {
            Some(Value::Array(list)) => list.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                target.insert(key, Value::String(value));
            }
        }
    }
    out
}

fn parse_body(body: &Bytes) -> Result<Option<Value>, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON body: {}", e)))
}

fn require_body(body: &Bytes) -> Result<Value, AppError> {
    Ok(parse_body(body)?.unwrap_or(Value::Null))
}

/// GET /:route with filters in the query string.
pub async fn get_one(
    State(state): State<AppState>,
    Path(route): Path<String>,
    session: SessionContext,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response, AppError> {
    Dispatcher::for_route(&state, &route, session)?
        .get(group_query(pairs))
        .await
}

/// POST /:route/get with filters in a JSON body.
pub async fn get_by_body(
    State(state): State<AppState>,
    Path(route): Path<String>,
    session: SessionContext,
    body: Bytes,
) -> Result<Response, AppError> {
    let dispatcher = Dispatcher::for_route(&state, &route, session)?;
    let input = match require_body(&body)? {
        Value::Object(m) => m,
        Value::Null => Map::new(),
        _ => return Err(AppError::field("_schema", "Invalid input type.")),
    };
    dispatcher.get(input).await
}

/// GET /:route/list
pub async fn list(
    State(state): State<AppState>,
    Path(route): Path<String>,
    session: SessionContext,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response, AppError> {
    Dispatcher::for_route(&state, &route, session)?
        .list(group_query(pairs))
        .await
}

pub async fn create(
    State(state): State<AppState>,
    Path(route): Path<String>,
    session: SessionContext,
    body: Bytes,
) -> Result<Response, AppError> {
    let dispatcher = Dispatcher::for_route(&state, &route, session)?;
    dispatcher.post(require_body(&body)?).await
}

pub async fn replace(
    State(state): State<AppState>,
    Path(route): Path<String>,
    session: SessionContext,
    body: Bytes,
) -> Result<Response, AppError> {
    let dispatcher = Dispatcher::for_route(&state, &route, session)?;
    dispatcher.update(Operation::Put, require_body(&body)?).await
}

pub async fn modify(
    State(state): State<AppState>,
    Path(route): Path<String>,
    session: SessionContext,
    body: Bytes,
) -> Result<Response, AppError> {
    let dispatcher = Dispatcher::for_route(&state, &route, session)?;
    dispatcher.update(Operation::Patch, require_body(&body)?).await
}

/// DELETE /:route with the filter in the query string, a JSON body, or both.
pub async fn remove(
    State(state): State<AppState>,
    Path(route): Path<String>,
    session: SessionContext,
    Query(pairs): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let dispatcher = Dispatcher::for_route(&state, &route, session)?;
    dispatcher.delete(group_query(pairs), parse_body(&body)?).await
}
