mod common;

use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, Method, Request, StatusCode};
use axum::Router;
use common::*;
use schemaforge::app;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn call(router: &Router, method: Method, uri: &str, tenant: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(t) = tenant {
        req = req.header("X-Tenant-ID", t);
    }
    let req = match body {
        Some(b) => req.header(CONTENT_TYPE, "application/json").body(Body::from(b.to_string())),
        None => req.body(Body::empty()),
    }
    .unwrap();
    let res = router.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, value)
}

#[tokio::test]
async fn health_and_readiness() {
    let router = app(state());
    let (status, body) = call(&router, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    let (status, body) = call(&router, Method::GET, "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["storage"], "ok");
}

#[tokio::test]
async fn tenant_header_is_required() {
    let router = app(state());
    let (status, body) = call(&router, Method::GET, "/entities", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
    let (status, _) = call(&router, Method::GET, "/entities", Some("Not A Tenant"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn define_publish_and_use_an_entity() {
    let router = app(state());
    let t = Some(TENANT);

    let (status, body) = call(&router, Method::POST, "/entities", t, Some(json!({"name": "customer"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["status"], "draft");

    let (status, _) = call(
        &router,
        Method::POST,
        &format!("/entities/{}/fields", id),
        t,
        Some(json!({"name": "email", "field_type": {"type": "email"}, "constraints": {"required": true, "unique": true}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = call(&router, Method::POST, &format!("/entities/{}/preview-migration", id), t, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["changes"][0]["kind"], "CREATE_TABLE");

    let (status, body) = call(&router, Method::POST, &format!("/entities/{}/publish", id), t, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["entity"]["version"], 1);

    let (status, body) = call(
        &router,
        Method::POST,
        "/dynamic-data/customer/records",
        t,
        Some(json!({"email": "ada@example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let record_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &router,
        Method::POST,
        "/dynamic-data/customer/records",
        t,
        Some(json!({"email": "ada@example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "validation_error");
    assert_eq!(body["error"]["field"], "email");

    let (status, body) = call(&router, Method::GET, "/dynamic-data/customer/records?email=ada@example.com", t, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 1);
    assert_eq!(body["data"][0]["id"], record_id.as_str());

    let (status, body) = call(
        &router,
        Method::PUT,
        &format!("/dynamic-data/customer/records/{}", record_id),
        t,
        Some(json!({"email": "ada@lovelace.org"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["email"], "ada@lovelace.org");

    let (status, body) = call(&router, Method::GET, &format!("/entities/{}/migrations", id), t, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["count"], 1);
    assert_eq!(body["data"][0]["status"], "completed");

    let (status, _) = call(&router, Method::DELETE, &format!("/entities/{}", id), t, None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(
        &router,
        Method::DELETE,
        &format!("/dynamic-data/customer/records/{}", record_id),
        t,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(
        &router,
        Method::GET,
        &format!("/dynamic-data/customer/records/{}", record_id),
        t,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn query_endpoint_and_bulk() {
    let state = state();
    published_customer(&state, TENANT).await;
    let router = app(state);
    let t = Some(TENANT);

    let (status, body) = call(
        &router,
        Method::POST,
        "/dynamic-data/customer/records/bulk",
        t,
        Some(json!({"items": [{"name": "Ada"}, {"email": "nameless@example.com"}, {"name": "Bob"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["failed"], 1);
    assert_eq!(body["succeeded"], 2);
    assert_eq!(body["results"][1]["error"]["field"], "name");

    let (status, body) = call(
        &router,
        Method::POST,
        "/dynamic-data/customer/records/query",
        t,
        Some(json!({"filter": {"field": "name", "op": "in", "value": ["Ada", "Bob"]}, "sort": [{"field": "name", "direction": "desc"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 2);
    assert_eq!(body["data"][0]["name"], "Bob");

    let (status, body) = call(
        &router,
        Method::POST,
        "/dynamic-data/customer/records/query",
        t,
        Some(json!({"filter": {"field": "name", "op": "matches", "value": "A"}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn malformed_ids_and_bodies_get_structured_errors() {
    let router = app(state());
    let (status, body) = call(&router, Method::GET, "/entities/not-a-uuid", Some(TENANT), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = call(&router, Method::POST, "/entities", Some(TENANT), Some(json!({"label": "no name"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = call(&router, Method::POST, "/entities", Some(TENANT), Some(json!({"name": "Bad Name"}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["field"], "name");
}
