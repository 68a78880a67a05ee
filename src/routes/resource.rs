//! Generated resource routes. One parameterized path serves every resource; handlers
//! resolve the resource from the segment, so unknown routes answer 404.

use crate::handlers::resource::{create, get_by_body, get_one, list, modify, remove, replace};
use crate::state::AppState;
use axum::{routing::get, routing::post, Router};

pub fn resource_routes(state: AppState) -> Router {
    let crud = get(get_one).post(create).put(replace).patch(modify).delete(remove);
    Router::new()
        .route("/:route", crud.clone())
        .route("/:route/", crud)
        .route("/:route/get", post(get_by_body))
        .route("/:route/get/", post(get_by_body))
        .route("/:route/list", get(list))
        .route("/:route/list/", get(list))
        .with_state(state)
}
