//! HTTP transport.
//!
//! - `POST /render` (and `POST /`): `{ code, props?, importMap?, files? }`
//!   → `200 { html }`, `400 { error }`, `500 { error, stage }`
//! - `GET /health` → `{ status: "ok" }`

use crate::pipeline::{PipelineError, RenderRequest, Renderer};
use crate::sandbox::ConsoleOutput;
use crate::sanitize::{sanitize_props, SanitizeError};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

/// Rejected before the pipeline starts.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Invalid JSON body: {0}")]
    Body(String),

    #[error("Missing or invalid 'code' field")]
    MissingCode,

    #[error("Invalid request: {0}")]
    Shape(String),

    #[error(transparent)]
    Props(#[from] SanitizeError),
}

#[derive(Debug, Serialize)]
struct HtmlBody {
    html: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<&'static str>,
}

fn error_response(status: StatusCode, error: String, stage: Option<&'static str>) -> Response {
    (status, Json(ErrorBody { error, stage })).into_response()
}

impl IntoResponse for InputError {
    fn into_response(self) -> Response {
        error_response(StatusCode::BAD_REQUEST, self.to_string(), None)
    }
}

/// Build the router. State is only the shared, immutable renderer.
pub fn router(renderer: Arc<Renderer>) -> Router {
    Router::new()
        .route("/", post(render_handler))
        .route("/render", post(render_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(renderer)
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn render_handler(
    State(renderer): State<Arc<Renderer>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let request = match parse_request(body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "rejected render request");
            return e.into_response();
        }
    };

    match renderer.render(request).await {
        Ok(output) => {
            log_console(&output.console);
            (StatusCode::OK, Json(HtmlBody { html: output.html })).into_response()
        }
        Err(PipelineError::Props(e)) => InputError::Props(e).into_response(),
        Err(e) => {
            let stage = e.stage().as_str();
            error!(stage, error = %e, "render failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), Some(stage))
        }
    }
}

fn parse_request(body: Result<Json<Value>, JsonRejection>) -> Result<RenderRequest, InputError> {
    let Json(body) = body.map_err(|e| InputError::Body(e.body_text()))?;

    match body.get("code") {
        Some(Value::String(code)) if !code.trim().is_empty() => {}
        _ => return Err(InputError::MissingCode),
    }

    let mut request: RenderRequest = serde_json::from_value(body).map_err(|e| InputError::Shape(e.to_string()))?;
    request.props = sanitize_props(std::mem::take(&mut request.props))?;
    Ok(request)
}

fn log_console(console: &ConsoleOutput) {
    for line in &console.logs {
        debug!(target: "component_ssr::console", "{}", line);
    }
    for line in &console.warns {
        warn!(target: "component_ssr::console", "{}", line);
    }
    for line in &console.errors {
        error!(target: "component_ssr::console", "{}", line);
    }
    if console.dropped > 0 {
        warn!(dropped = console.dropped, "console output truncated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> Result<RenderRequest, InputError> {
        parse_request(Ok(Json(value)))
    }

    #[test]
    fn test_parse_minimal() {
        let request = parse(json!({ "code": "export default () => null" })).unwrap();
        assert_eq!(request.props, json!({}));
        assert!(request.import_map.is_none());
    }

    #[test]
    fn test_missing_code() {
        assert!(matches!(parse(json!({ "props": {} })), Err(InputError::MissingCode)));
        assert!(matches!(parse(json!({ "code": "  " })), Err(InputError::MissingCode)));
        assert!(matches!(parse(json!({ "code": 42 })), Err(InputError::MissingCode)));
    }

    #[test]
    fn test_bad_props() {
        assert!(matches!(
            parse(json!({ "code": "x", "props": [1] })),
            Err(InputError::Props(SanitizeError::NotAnObject))
        ));
        assert!(matches!(
            parse(json!({ "code": "x", "props": { "__proto__": {} } })),
            Err(InputError::Props(SanitizeError::ForbiddenKey(_)))
        ));
    }

    #[test]
    fn test_bad_import_map_shape() {
        assert!(matches!(
            parse(json!({ "code": "x", "importMap": { "a": 1 } })),
            Err(InputError::Shape(_))
        ));
    }
}
