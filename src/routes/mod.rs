//! Router assembly: service routes, generated resource routes and a JSON 404 fallback.

pub mod common;
pub mod resource;

pub use common::common_routes;
pub use resource::resource_routes;

use crate::response::error_body;
use crate::state::AppState;
use axum::{http::StatusCode, http::Uri, response::IntoResponse, Json, Router};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

async fn not_found(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(error_body("not_found", format!("no route for {}", uri.path()), None)),
    )
}

/// Full application router. Bodies larger than `body_limit` bytes are rejected with 413.
pub fn app(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .merge(common_routes(state.clone()))
        .merge(resource_routes(state))
        .fallback(not_found)
        .layer(ServiceBuilder::new().layer(RequestBodyLimitLayer::new(body_limit)))
}
