//! Isolation and capability enforcement inside the sandbox.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::StatusCode;
use common::{Harness, fast_config, id};
use morphine_extensions::{
    DataAccess, DataAccessError, ExecuteResult, ExtensionError, ExtensionManager, Row,
};
use serde_json::{Value, json};
use tower::ServiceExt;

#[tokio::test(flavor = "multi_thread")]
async fn test_infinite_loop_at_load_times_out() {
    let h = Harness::new();
    h.simple(
        "Steady",
        json!({}),
        r#"export function init(u) { u.app.get("/ok", () => ({ ok: true })); }"#,
    );
    h.simple("Spin", json!({}), "while (true) {}\nexport function init() {}");
    h.manager.load(&id("Steady")).await.unwrap();

    let started = Instant::now();
    let err = h.manager.load(&id("Spin")).await.unwrap_err();
    assert!(matches!(err, ExtensionError::SandboxTimeout { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!h.manager.registry().contains(&id("Spin")));

    let reply = h.get("/extensions/steady/ok").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json(), json!({ "ok": true }));
    assert_eq!(h.get("/extensions/spin").await.status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupted_async_continuation_leaves_sandbox_usable() {
    let h = Harness::new();
    h.simple(
        "Later",
        json!({}),
        r#"
        export function init(u) {
          u.app.get("/later", async () => { await null; for (;;) {} });
          u.app.get("/fine", () => "fine");
        }
        "#,
    );
    h.manager.load(&id("Later")).await.unwrap();

    let reply = h.get("/extensions/later/later").await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    for _ in 0..3 {
        let reply = h.get("/extensions/later/fine").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, "fine");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hung_init_promise_times_out() {
    let mut config = fast_config();
    config.init_timeout = Some(Duration::from_millis(200));
    let h = Harness::with_config(config);
    h.simple(
        "Hang",
        json!({}),
        "export function init() { return new Promise(() => {}); }",
    );
    let err = h.manager.load(&id("Hang")).await.unwrap_err();
    assert!(
        matches!(err, ExtensionError::SandboxTimeout { phase: "init", .. }),
        "{err}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_runaway_handler_returns_500_and_others_survive() {
    let h = Harness::new();
    h.simple(
        "Mixed",
        json!({}),
        r#"
        export function init(u) {
          u.app.get("/spin", () => { for (;;) {} });
          u.app.get("/throw", () => { throw new Error("kaboom"); });
          u.app.get("/ok", () => ({ ok: true }));
        }
        "#,
    );
    h.manager.load(&id("Mixed")).await.unwrap();

    let reply = h.get("/extensions/mixed/throw").await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        reply.json(),
        json!({ "message": "Internal Server Error", "success": false })
    );

    let reply = h.get("/extensions/mixed/spin").await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!reply.body.contains("kaboom"));

    // The sandbox keeps serving after an interrupted handler.
    let reply = h.get("/extensions/mixed/ok").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json(), json!({ "ok": true }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_denied_capabilities_are_absent() {
    let h = Harness::new();
    h.simple(
        "Locked",
        json!({ "env": ["GREETING", "UNSET_VAR"] }),
        r#"
        export function init(u) {
          u.app.get("/globals", () => ({
            fetch: typeof fetch,
            setTimeout: typeof setTimeout,
            env: process.env,
          }));
          u.app.get("/require", () => {
            try { require("fs"); return "loaded"; } catch (e) { return e.message; }
          });
        }
        "#,
    );
    h.manager.load(&id("Locked")).await.unwrap();

    let globals = h.get("/extensions/locked/globals").await.json();
    assert_eq!(globals["fetch"], "undefined");
    assert_eq!(globals["setTimeout"], "undefined");
    assert_eq!(globals["env"], json!({ "GREETING": "hello from host" }));

    let reply = h.get("/extensions/locked/require").await;
    assert!(reply.body.contains("require is not available"), "{}", reply.body);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_granted_network_exposes_fetch() {
    let h = Harness::new();
    h.simple(
        "Net",
        json!({ "network": true }),
        r#"export function init(u) { u.app.get("/", () => typeof fetch); }"#,
    );
    h.manager.load(&id("Net")).await.unwrap();
    assert_eq!(h.get("/extensions/net").await.body, "function");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_file_stays_inside_root() {
    let h = Harness::new();
    let dir = h.simple(
        "Reader",
        json!({}),
        r#"
        export function init(u) {
          u.app.get("/inside", () => u.readFile("data/notes.txt"));
          u.app.get("/outside", () => {
            try { return u.readFile("../../etc/passwd"); } catch (e) { return `denied: ${e.message}`; }
          });
        }
        "#,
    );
    std::fs::create_dir(dir.join("data")).unwrap();
    std::fs::write(dir.join("data").join("notes.txt"), "remember the milk").unwrap();
    h.manager.load(&id("Reader")).await.unwrap();

    assert_eq!(h.get("/extensions/reader/inside").await.body, "remember the milk");
    let reply = h.get("/extensions/reader/outside").await;
    assert!(reply.body.starts_with("denied: access denied"), "{}", reply.body);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timers_fire_when_granted() {
    let h = Harness::new();
    h.simple(
        "Clock",
        json!({ "timers": true }),
        r#"
        let ticks = 0;
        export function init(u) {
          const handle = setInterval(() => { ticks += 1; if (ticks >= 3) clearInterval(handle); }, 5);
          u.app.get("/ticks", () => ({ ticks }));
          u.app.get("/later", () => new Promise((resolve) => setTimeout(() => resolve("done"), 10)));
        }
        "#,
    );
    h.manager.load(&id("Clock")).await.unwrap();

    assert_eq!(h.get("/extensions/clock/later").await.body, "done");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.get("/extensions/clock/ticks").await.json()["ticks"], 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_routes_closed_after_init() {
    let h = Harness::new();
    h.simple(
        "Late",
        json!({}),
        r#"
        let app;
        export function init(u) {
          app = u.app;
          u.app.get("/add", () => {
            try { app.get("/sneaky", () => "x"); return "registered"; } catch (e) { return e.message; }
          });
        }
        "#,
    );
    h.manager.load(&id("Late")).await.unwrap();

    let reply = h.get("/extensions/late/add").await;
    assert_ne!(reply.body, "registered");
    assert_eq!(h.get("/extensions/late/sneaky").await.status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_static_mount_serves_public_dir() {
    let h = Harness::new();
    let dir = h.simple(
        "Site",
        json!({}),
        r#"export function init(u) { u.mountStatic(); u.app.get("/api", () => "api"); }"#,
    );
    std::fs::create_dir(dir.join("public")).unwrap();
    std::fs::write(dir.join("public").join("index.html"), "<h1>site</h1>").unwrap();
    std::fs::write(dir.join("public").join("app.css"), "body{}").unwrap();
    h.manager.load(&id("Site")).await.unwrap();

    assert_eq!(h.get("/extensions/site/static/app.css").await.body, "body{}");
    assert_eq!(h.get("/extensions/site/static/").await.body, "<h1>site</h1>");
    assert_eq!(h.get("/extensions/site/api").await.body, "api");
}

/// Records every statement and returns canned rows.
#[derive(Default)]
struct RecordingData {
    calls: AtomicUsize,
}

#[async_trait]
impl DataAccess for RecordingData {
    async fn query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>, DataAccessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if sql.contains("broken") {
            return Err(DataAccessError::new("syntax error near broken"));
        }
        let mut row = Row::new();
        row.insert("sql".into(), Value::String(sql.to_owned()));
        row.insert("params".into(), Value::Array(params));
        Ok(vec![row])
    }

    async fn execute(
        &self,
        _sql: &str,
        params: Vec<Value>,
    ) -> Result<ExecuteResult, DataAccessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExecuteResult {
            affected_rows: u64::try_from(params.len()).unwrap(),
            insert_id: Some(7),
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_db_calls_reach_data_access() {
    let dir = tempfile::tempdir().unwrap();
    let data = Arc::new(RecordingData::default());
    let manager = ExtensionManager::builder(dir.path())
        .sandbox_config(fast_config())
        .data_access(Arc::clone(&data) as Arc<dyn DataAccess>)
        .build();
    let ext_dir = dir.path().join("Db");
    std::fs::create_dir(&ext_dir).unwrap();
    std::fs::write(
        ext_dir.join("manifest.json"),
        r#"{"version":"1","author":"t","index":"index.js"}"#,
    )
    .unwrap();
    std::fs::write(
        ext_dir.join("index.js"),
        r#"
        export function init(u) {
          u.app.get("/rows", async () => await u.db.query("SELECT ?", 1, "two"));
          u.app.post("/write", async () => await u.db.execute("INSERT", "a", "b"));
          u.app.get("/bad", async () => {
            try { await u.db.query("broken"); return "no"; } catch (e) { return e.message; }
          });
        }
        "#,
    )
    .unwrap();
    manager.load(&morphine_extensions::ExtensionId::from_static("Db")).await.unwrap();

    let router = manager.router();
    let call = |method: &str, uri: &str| {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(axum::body::Body::empty())
            .unwrap()
    };
    let response = router.clone().oneshot(call("GET", "/extensions/db/rows")).await.unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let rows: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(rows, json!([{ "sql": "SELECT ?", "params": [1, "two"] }]));

    let response = router.clone().oneshot(call("POST", "/extensions/db/write")).await.unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let result: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(result, json!({ "affectedRows": 2, "insertId": 7 }));

    let response = router.oneshot(call("GET", "/extensions/db/bad")).await.unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("syntax error near broken"));

    assert_eq!(data.calls.load(Ordering::SeqCst), 3);
}
