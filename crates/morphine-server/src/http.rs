//! Host HTTP surface: operator API plus the mounted extensions.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use morphine_extensions::{ExtensionError, ExtensionId, ExtensionManager, ExtensionSummary};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Full application router.
pub(crate) fn app(manager: Arc<ExtensionManager>) -> Router {
    let extensions = manager.router();
    Router::new()
        .route("/health", get(health))
        .route("/api/extensions", get(list_extensions))
        .route("/api/extensions/:id/reload", post(reload_extension))
        .route("/api/extensions/:id/unload", post(unload_extension))
        .with_state(manager)
        .merge(extensions)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_extensions(State(manager): State<Arc<ExtensionManager>>) -> Json<Vec<ExtensionSummary>> {
    Json(manager.list())
}

async fn reload_extension(
    State(manager): State<Arc<ExtensionManager>>,
    Path(id): Path<String>,
) -> Response {
    let result = match ExtensionId::new(id) {
        Ok(id) => manager.reload(&id).await.map(|ext| ext.summary()),
        Err(e) => Err(e),
    };
    match result {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn unload_extension(
    State(manager): State<Arc<ExtensionManager>>,
    Path(id): Path<String>,
) -> Response {
    let result = match ExtensionId::new(id) {
        Ok(id) => manager.unload(&id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(error: &ExtensionError) -> Response {
    let status = match error {
        ExtensionError::NotFound(_) => StatusCode::NOT_FOUND,
        ExtensionError::InvalidId(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    warn!(kind = error.kind(), error = %error, "Extension operation failed");
    (
        status,
        Json(json!({ "success": false, "kind": error.kind(), "message": error.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    fn fixture() -> (tempfile::TempDir, Arc<ExtensionManager>) {
        let dir = tempfile::tempdir().unwrap();
        let ext = dir.path().join("Hello");
        std::fs::create_dir(&ext).unwrap();
        std::fs::write(
            ext.join("manifest.json"),
            r#"{"version":"0.2.0","author":"ops","index":"index.js"}"#,
        )
        .unwrap();
        std::fs::write(
            ext.join("index.js"),
            r#"export function init(u) { u.app.get("/", () => ({ hello: "world" })); }"#,
        )
        .unwrap();
        let manager = Arc::new(ExtensionManager::builder(dir.path()).build());
        (dir, manager)
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_health() {
        let (_dir, manager) = fixture();
        let (status, body) = call(&app(manager), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_and_serve_extensions() {
        let (_dir, manager) = fixture();
        manager.load_all().await.unwrap();
        let app = app(Arc::clone(&manager));

        let (status, body) = call(&app, "GET", "/api/extensions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "Hello");
        assert_eq!(body[0]["version"], "0.2.0");

        let (status, body) = call(&app, "GET", "/extensions/hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hello"], "world");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unload_then_reload_over_api() {
        let (_dir, manager) = fixture();
        manager.load_all().await.unwrap();
        let app = app(Arc::clone(&manager));

        let (status, _) = call(&app, "POST", "/api/extensions/Hello/unload").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", "/extensions/hello").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "POST", "/api/extensions/Hello/unload").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "NotFound");

        let (status, body) = call(&app, "POST", "/api/extensions/Hello/reload").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "active");
        let (status, _) = call(&app, "GET", "/extensions/hello").await;
        assert_eq!(status, StatusCode::OK);
    }
}
