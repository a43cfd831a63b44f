//! Shared harness for extension integration tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use morphine_extensions::{ExtensionId, ExtensionManager, SandboxConfig};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

/// An extensions directory plus a manager pointed at it.
#[allow(dead_code)]
pub struct Harness {
    /// Manager under test.
    pub manager: ExtensionManager,
    /// Router with every extension nested under `/extensions`.
    pub router: Router,
    dir: TempDir,
}

#[allow(dead_code)]
impl Harness {
    /// Harness with short sandbox limits so timeout tests stay fast.
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// Harness with explicit sandbox limits.
    pub fn with_config(config: SandboxConfig) -> Self {
        let dir = TempDir::new().expect("failed to create tempdir");
        let manager = ExtensionManager::builder(dir.path())
            .sandbox_config(config)
            .env_lookup(std::sync::Arc::new(|name: &str| {
                (name == "GREETING").then(|| "hello from host".to_owned())
            }))
            .build();
        let router = manager.router();
        Self {
            manager,
            router,
            dir,
        }
    }

    /// Extensions root.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `<root>/<id>/manifest.json` and `<root>/<id>/index.js`.
    pub fn extension(&self, id: &str, manifest: Value, source: &str) -> PathBuf {
        let dir = self.root().join(id);
        std::fs::create_dir_all(&dir).expect("create extension dir");
        std::fs::write(dir.join("manifest.json"), manifest.to_string()).expect("write manifest");
        std::fs::write(dir.join("index.js"), source).expect("write entry");
        dir
    }

    /// Write an extension with a default manifest plus extra permissions.
    pub fn simple(&self, id: &str, permissions: Value, source: &str) -> PathBuf {
        self.extension(
            id,
            json!({
                "version": "1.0.0",
                "author": "tests",
                "index": "index.js",
                "permissions": permissions,
            }),
            source,
        )
    }

    /// Issue a request through the nested router.
    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Reply {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("build request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        Reply {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        }
    }

    /// `GET uri`.
    pub async fn get(&self, uri: &str) -> Reply {
        self.request(Method::GET, uri, None).await
    }
}

/// A collected response.
#[allow(dead_code)]
pub struct Reply {
    /// Status code.
    pub status: StatusCode,
    /// Body as text.
    pub body: String,
}

#[allow(dead_code)]
impl Reply {
    /// Body parsed as JSON.
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).expect("body is JSON")
    }
}

/// Sandbox limits small enough for tests.
pub fn fast_config() -> SandboxConfig {
    SandboxConfig {
        turn_timeout: Duration::from_millis(300),
        init_timeout: Some(Duration::from_secs(2)),
        handler_timeout: Duration::from_secs(2),
        cleanup_timeout: Duration::from_secs(1),
        ..SandboxConfig::default()
    }
}

/// Shorthand for a validated id.
#[allow(dead_code)]
pub fn id(s: &str) -> ExtensionId {
    ExtensionId::new(s).expect("valid id")
}
