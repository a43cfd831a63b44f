//! Cross-extension messaging over the shared bus.

mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode};
use common::{Harness, fast_config, id};
use morphine_events::Event;
use morphine_extensions::ExtensionError;
use serde_json::json;

const RECEIVER: &str = r#"
let inbox = [];
export function init(u) {
  extension.on("ping", (event) => { inbox.push({ type: event.type, detail: event.detail }); });
  extension.onGlobal("extensionLoaded", (event) => { inbox.push({ type: event.type, id: event.detail.id }); });
  u.app.get("/inbox", () => inbox);
  u.app.delete("/inbox", () => { inbox = []; return null; });
}
"#;

const SENDER: &str = r#"
export function init(u) {
  u.app.post("/poke/:target", (ctx) => {
    const delivered = extension.sendToExtension(ctx.params.target, "ping", ctx.body);
    return { delivered };
  });
  u.app.get("/spoof", () => {
    try { extension.onGlobal("extension:Receiver:ping", () => {}); return "subscribed"; }
    catch (e) { return e.message; }
  });
}
"#;

#[tokio::test(flavor = "multi_thread")]
async fn test_send_to_extension_delivers_with_sender() {
    let h = Harness::new();
    h.simple("Receiver", json!({}), RECEIVER);
    h.simple("Sender", json!({}), SENDER);
    h.manager.load(&id("Receiver")).await.unwrap();
    h.manager.load(&id("Sender")).await.unwrap();

    let reply = h
        .request(Method::POST, "/extensions/sender/poke/Receiver", Some(json!({ "x": 1 })))
        .await;
    assert_eq!(reply.json(), json!({ "delivered": 1 }));

    let inbox = h.get("/extensions/receiver/inbox").await.json();
    assert_eq!(
        inbox,
        json!([
            { "type": "extensionLoaded", "id": "Receiver" },
            { "type": "extensionLoaded", "id": "Sender" },
            { "type": "ping", "detail": { "from": "Sender", "data": { "x": 1 } } },
        ])
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cannot_subscribe_to_foreign_namespace() {
    let h = Harness::new();
    h.simple("Sender", json!({}), SENDER);
    h.manager.load(&id("Sender")).await.unwrap();

    let reply = h.get("/extensions/sender/spoof").await;
    assert!(reply.body.contains("another extension's namespace"), "{}", reply.body);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_host_events_reach_scoped_subscribers() {
    let h = Harness::new();
    h.simple("Receiver", json!({}), RECEIVER);
    h.manager.load(&id("Receiver")).await.unwrap();

    let delivered = h
        .manager
        .bus()
        .publish(Event::direct("host", "Receiver", "ping", json!("hello")));
    assert_eq!(delivered, 1);

    // Delivery is queued to the worker; give it a moment.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let inbox = h.get("/extensions/receiver/inbox").await.json();
    let last = inbox.as_array().and_then(|items| items.last()).unwrap();
    assert_eq!(last["detail"], json!({ "from": "host", "data": "hello" }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unload_drops_subscriptions() {
    let h = Harness::new();
    h.simple("Receiver", json!({}), RECEIVER);
    h.manager.load(&id("Receiver")).await.unwrap();
    assert_eq!(h.manager.bus().registry().len(), 2);

    h.manager.unload(&id("Receiver")).await.unwrap();
    assert_eq!(h.manager.bus().registry().len(), 0);
    assert_eq!(
        h.manager
            .bus()
            .publish(Event::direct("host", "Receiver", "ping", json!(null))),
        0
    );
    assert_eq!(
        h.get("/extensions/receiver/inbox").await.status,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reload_does_not_duplicate_subscriptions() {
    let h = Harness::new();
    h.simple("Receiver", json!({}), RECEIVER);
    h.manager.load(&id("Receiver")).await.unwrap();
    h.manager.reload(&id("Receiver")).await.unwrap();
    assert_eq!(h.manager.bus().registry().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_attempt_cannot_strip_reloaded_subscriptions() {
    let mut config = fast_config();
    config.turn_timeout = Duration::from_secs(2);
    config.init_timeout = Some(Duration::from_millis(200));
    let h = Harness::with_config(config);

    // The worker is still busy in a timer when init times out.
    h.simple(
        "Racy",
        json!({ "timers": true }),
        r#"
        export function init() {
          extension.on("ping", () => {});
          setTimeout(() => { const end = Date.now() + 900; while (Date.now() < end) {} }, 50);
          return new Promise(() => {});
        }
        "#,
    );
    let err = h.manager.load(&id("Racy")).await.unwrap_err();
    assert!(
        matches!(err, ExtensionError::SandboxTimeout { phase: "init", .. }),
        "{err}"
    );
    assert_eq!(h.manager.bus().registry().owned_by("Racy"), 0);

    h.simple(
        "Racy",
        json!({ "timers": true }),
        r#"export function init(u) { extension.on("ping", () => {}); u.app.get("/ok", () => "ok"); }"#,
    );
    h.manager.reload(&id("Racy")).await.unwrap();
    assert_eq!(h.manager.bus().registry().owned_by("Racy"), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(h.manager.registry().is_active(&id("Racy")));
    assert_eq!(h.manager.bus().registry().owned_by("Racy"), 1);
    assert_eq!(
        h.manager
            .bus()
            .publish(Event::direct("host", "Racy", "ping", json!(null))),
        1
    );
    assert_eq!(h.get("/extensions/racy/ok").await.status, StatusCode::OK);
}
