//! HTTP contract of the render service.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use component_ssr::{server, Renderer, RendererConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app() -> Router {
    server::router(Arc::new(Renderer::new(RendererConfig::default()).unwrap()))
}

async fn send(method: Method, uri: &str, body: Option<String>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.map(Body::from).unwrap_or_else(Body::empty))
        .unwrap();

    let response = app().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn post_json(uri: &str, body: Value) -> (StatusCode, Value) {
    send(Method::POST, uri, Some(body.to_string())).await
}

#[tokio::test]
async fn test_health() {
    let (status, body) = send(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_render_ok() {
    let code = r#"import { jsx } from "react/jsx-runtime";
        export default ({ name }) => jsx("p", { children: ["Hi ", name] });"#;
    let (status, body) = post_json("/render", json!({"code": code, "props": {"name": "<Ada>"}})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"html": "<p>Hi <!-- -->&lt;Ada&gt;</p>"}));
}

#[tokio::test]
async fn test_root_route_renders_too() {
    let (status, body) = post_json("/", json!({"code": "export default () => 'root'"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["html"], "root");
}

#[tokio::test]
async fn test_missing_code_is_400() {
    let (status, body) = post_json("/render", json!({"props": {}})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing or invalid 'code' field");
    assert!(body.get("stage").is_none());
}

#[tokio::test]
async fn test_malformed_json_is_400() {
    let (status, body) = send(Method::POST, "/render", Some("{not json".to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("Invalid JSON body"));
}

#[tokio::test]
async fn test_polluting_props_are_400() {
    let (status, body) = post_json(
        "/render",
        json!({"code": "export default () => null", "props": {"__proto__": {"admin": true}}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("__proto__"));
}

#[tokio::test]
async fn test_pipeline_failures_are_500_with_stage() {
    let (status, body) = post_json("/render", json!({"code": "export const Test = () => null;"})).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["stage"], "ExecutionError");
    assert!(body["error"].as_str().unwrap().contains("no valid component found"));

    let (status, body) = post_json(
        "/render",
        json!({"code": "import {x} from 'totally-unknown-module'; export default () => x;"}),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["stage"], "CompileError");

    let (status, body) = post_json(
        "/render",
        json!({"code": "export default () => { throw new Error('nope'); }"}),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["stage"], "RenderError");
    assert_eq!(body["error"], "Component rendering failed: Error: nope");
}
