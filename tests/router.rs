//! Router behavior that is decided before any statement runs. The pool connects lazily
//! and is never used by these requests.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use resource_sdk::extractors::session::{ACTOR_ID_HEADER, ROLES_HEADER};
use resource_sdk::{app, parse_resources, resolve, AppState, HookRegistry, ResourceSet};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tower::ServiceExt;

const SHOP: &str = include_str!("fixtures/shop.json");

fn router() -> Router {
    let set = ResourceSet {
        resources: parse_resources(SHOP).unwrap(),
    };
    let registry = resolve(&set).unwrap();
    let pool = PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(200))
        .connect_lazy("postgres://nobody@127.0.0.1:1/none")
        .unwrap();
    let state = AppState::new(pool, registry, HookRegistry::new(), Duration::from_secs(1)).unwrap();
    app(state, 4096)
}

async fn send(req: Request<Body>) -> (StatusCode, Value) {
    let res = router().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_is_served() {
    let (status, body) = send(empty_request("GET", "/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn version_counts_resources() {
    let (status, body) = send(empty_request("GET", "/version")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resources"], 9);
}

#[tokio::test]
async fn unknown_resource_is_not_found() {
    let (status, body) = send(empty_request("GET", "/nothing?id=1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, body) = send(empty_request("GET", "/a/b/c")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn excluded_operation_is_not_allowed() {
    let req = json_request("PUT", "/plainresource", json!({"select": {"id": 1}, "payload": {"name": "x"}}));
    let (status, _) = send(req).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let (status, _) = send(empty_request("DELETE", "/operator?city=Rome")).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn update_envelope_parts_are_required() {
    let (status, body) = send(json_request("PATCH", "/dist", json!({"select": {}}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({"select": ["This field cannot be empty"], "payload": ["This field is required"]})
    );
}

#[tokio::test]
async fn put_without_payload_is_rejected() {
    let (status, body) = send(json_request("PUT", "/dist/", json!({"select": {"id": 1}}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"payload": ["This field is required"]}));
}

#[tokio::test]
async fn update_errors_are_grouped_by_envelope_key() {
    let req = json_request(
        "PATCH",
        "/dist",
        json!({"select": {"id": "abc"}, "payload": {"meta": "too long", "nope": 1}}),
    );
    let (status, body) = send(req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({
            "select": {"id": ["Not a valid integer."]},
            "payload": {"meta": ["Longer than maximum length 2."], "nope": ["Unknown field."]}
        })
    );
}

#[tokio::test]
async fn create_reports_field_errors() {
    let (status, body) = send(json_request("POST", "/product", json!({"name": 5}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({
            "name": ["Not a valid string."],
            "descr": ["Missing data for required field."],
            "producer": ["Missing data for required field."]
        })
    );

    let (status, body) = send(json_request("POST", "/product", json!([1, 2]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"_schema": ["Invalid input type."]}));
}

#[tokio::test]
async fn read_only_fields_are_rejected_on_create() {
    let (status, body) = send(json_request("POST", "/customop", json!({"address": "1 Main", "state": "DC"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"state": ["Unknown field."]}));
}

#[tokio::test]
async fn bad_pagination_is_reported_under_query() {
    let (status, body) = send(empty_request("GET", "/dist/list?order_by=name&page=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({"query": {
            "order_by": ["Must be one of: meta."],
            "page": ["Must be greater than or equal to 1."]
        }})
    );
}

#[tokio::test]
async fn filters_outside_get_by_are_unknown() {
    let (status, body) = send(empty_request("GET", "/dist?meta=ab")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"meta": ["Unknown field."]}));
}

#[tokio::test]
async fn invalid_selection_is_rejected() {
    let (status, body) = send(empty_request("GET", "/product?id=1&select=name,producer.nope,ghost")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"select": ["Invalid field name(s): producer.nope, ghost."]}));
}

#[tokio::test]
async fn empty_delete_is_rejected() {
    let (status, body) = send(empty_request("DELETE", "/dist")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"_schema": ["Payload cannot be empty"]}));
}

#[tokio::test]
async fn delete_filters_use_delete_by() {
    let (status, body) = send(json_request("DELETE", "/dist", json!({"name": "Acme"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"name": ["Unknown field."]}));
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let req = Request::builder()
        .method("POST")
        .uri("/dist")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn oversized_body_is_refused() {
    let big = "x".repeat(8192);
    let (status, _) = send(json_request("POST", "/dist", json!({"name": big}))).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn protected_operations_need_a_session() {
    let (status, _) = send(json_request("POST", "/store", json!({"name": "Corner"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .method("POST")
        .uri("/store")
        .header("content-type", "application/json")
        .header(ACTOR_ID_HEADER, "7")
        .header(ROLES_HEADER, "guest")
        .body(Body::from(json!({"name": "Corner"}).to_string()))
        .unwrap();
    let (status, _) = send(req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let req = Request::builder()
        .method("DELETE")
        .uri("/store?id=1")
        .header(ACTOR_ID_HEADER, "7")
        .header(ROLES_HEADER, "staff")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn public_operations_skip_the_session_check() {
    let (status, body) = send(empty_request("GET", "/store?ghost=1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"ghost": ["Unknown field."]}));
}

#[tokio::test]
async fn page_beyond_offset_range_is_a_bad_request() {
    let (status, body) = send(empty_request("GET", "/dist/list?page=9223372036854775807&limit=10")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"query": {"page": ["Page is out of range."]}}));
}
