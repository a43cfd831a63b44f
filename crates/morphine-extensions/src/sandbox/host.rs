//! Native functions behind the shim's `host` object.
//!
//! Everything here runs on the worker thread inside a JS turn. Functions
//! either answer synchronously or hand async work to the tokio runtime and
//! post the outcome back as [`Command::Complete`].

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use morphine_events::{
    EXTENSION_NAMESPACE, Event, EventBus, EventSubscriber, SubscriberId, scoped_topic,
};
use rquickjs::{Ctx, Exception, Function, Object};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::protocol::{Command, RouteMethod, RouteSpec, StaticMount};
use super::timers::TimerQueue;
use crate::capabilities::CapabilityGrant;
use crate::data::DataAccess;
use crate::extension::ExtensionId;

/// Routes and mounts collected until initialization completes.
#[derive(Debug, Default)]
struct Registration {
    routes: Vec<RouteSpec>,
    statics: Vec<StaticMount>,
    sealed: bool,
}

/// Worker-local state shared by every native function.
pub(crate) struct HostState {
    pub(crate) id: ExtensionId,
    pub(crate) name: String,
    pub(crate) grant: Arc<CapabilityGrant>,
    pub(crate) bus: EventBus,
    pub(crate) data: Arc<dyn DataAccess>,
    pub(crate) http: reqwest::Client,
    pub(crate) handle: Handle,
    pub(crate) sender: Sender<Command>,
    pub(crate) timers: RefCell<TimerQueue>,
    registration: RefCell<Registration>,
    subscriptions: RefCell<Vec<SubscriberId>>,
}

impl HostState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ExtensionId,
        name: String,
        grant: Arc<CapabilityGrant>,
        bus: EventBus,
        data: Arc<dyn DataAccess>,
        http: reqwest::Client,
        handle: Handle,
        sender: Sender<Command>,
    ) -> Self {
        Self {
            id,
            name,
            grant,
            bus,
            data,
            http,
            handle,
            sender,
            timers: RefCell::new(TimerQueue::default()),
            registration: RefCell::new(Registration::default()),
            subscriptions: RefCell::new(Vec::new()),
        }
    }

    /// Close registration and take what was registered.
    pub(crate) fn seal(&self) -> (Vec<RouteSpec>, Vec<StaticMount>) {
        let mut registration = self.registration.borrow_mut();
        registration.sealed = true;
        (
            std::mem::take(&mut registration.routes),
            std::mem::take(&mut registration.statics),
        )
    }

    fn ensure_open(&self) -> Result<(), String> {
        if self.registration.borrow().sealed {
            return Err("routes and static mounts can only be registered during init".into());
        }
        Ok(())
    }

    fn log(&self, level: &str, message: &str) {
        match level {
            "warn" => warn!(extension_id = %self.id, "[{}] {}", self.name, message),
            "error" => error!(extension_id = %self.id, "[{}] {}", self.name, message),
            _ => info!(extension_id = %self.id, "[{}] {}", self.name, message),
        }
    }

    fn register_route(&self, method: &str, path: &str) -> Result<u32, String> {
        self.ensure_open()?;
        let method = RouteMethod::parse(method).ok_or_else(|| format!("unknown method {method}"))?;
        let mut registration = self.registration.borrow_mut();
        let index = u32::try_from(registration.routes.len()).map_err(|e| e.to_string())?;
        debug!(extension_id = %self.id, %method, path, "Registered route");
        registration.routes.push(RouteSpec {
            method,
            path: path.to_owned(),
            index,
        });
        Ok(index)
    }

    fn mount_static(&self, dir: &str, prefix: &str, index_html: bool) -> Result<bool, String> {
        self.ensure_open()?;
        let resolved = self.grant.fs().resolve(dir).map_err(|e| e.to_string())?;
        if !resolved.is_dir() {
            warn!(
                extension_id = %self.id,
                dir = %resolved.display(),
                "Static directory does not exist, skipping mount"
            );
            return Ok(false);
        }
        let url_prefix = normalize_prefix(prefix);
        debug!(extension_id = %self.id, dir = %resolved.display(), %url_prefix, "Mounted static directory");
        self.registration.borrow_mut().statics.push(StaticMount {
            dir: resolved,
            url_prefix,
            index_html,
        });
        Ok(true)
    }

    fn subscribe(&self, name: &str, handler: u32, global: bool) -> Result<SubscriberId, String> {
        let topic = if global {
            if is_namespaced(name) {
                return Err(format!(
                    "cannot subscribe to another extension's namespace: {name}"
                ));
            }
            name.to_owned()
        } else {
            scoped_topic(self.id.as_str(), name)
        };
        let subscriber = SandboxSubscriber {
            sender: self.sender.clone(),
            handler,
            event_type: name.to_owned(),
        };
        let sub = self
            .bus
            .registry()
            .register(topic, Some(self.id.as_str()), Arc::new(subscriber));
        self.subscriptions.borrow_mut().push(sub);
        debug!(extension_id = %self.id, event = name, global, %sub, "Subscribed");
        Ok(sub)
    }

    fn unsubscribe(&self, sub: SubscriberId) -> bool {
        let mut owned = self.subscriptions.borrow_mut();
        let Some(pos) = owned.iter().position(|s| *s == sub) else {
            return false;
        };
        owned.swap_remove(pos);
        self.bus.registry().unregister(sub)
    }

    /// Drop every subscription this sandbox made. Other sandboxes for the
    /// same id keep theirs. Returns how many were still registered.
    pub(crate) fn release_subscriptions(&self) -> usize {
        let registry = self.bus.registry();
        self.subscriptions
            .borrow_mut()
            .drain(..)
            .filter(|sub| registry.unregister(*sub))
            .count()
    }

    fn emit(&self, name: &str, data: &str) -> Result<usize, String> {
        let payload: Value = serde_json::from_str(data).map_err(|e| e.to_string())?;
        Ok(self
            .bus
            .publish(Event::scoped(self.id.as_str(), name, payload)))
    }

    fn send(&self, target: &str, name: &str, data: &str) -> Result<usize, String> {
        let target = ExtensionId::new(target).map_err(|e| e.to_string())?;
        let payload: Value = serde_json::from_str(data).map_err(|e| e.to_string())?;
        Ok(self.bus.publish(Event::direct(
            self.id.as_str(),
            target.as_str(),
            name,
            payload,
        )))
    }

    fn schedule(&self, id: u32, delay_ms: f64, repeat: bool) -> Result<(), String> {
        if !self.grant.timers() {
            return Err("timers are not granted".into());
        }
        self.timers
            .borrow_mut()
            .schedule(id, clamp_delay(delay_ms), repeat, Instant::now());
        Ok(())
    }

    /// Start an async host call. Its outcome arrives as `Command::Complete`.
    fn start_call(&self, kind: &str, call: u32, payload: &str) -> Result<(), String> {
        let payload: Value = serde_json::from_str(payload).map_err(|e| e.to_string())?;
        let work: BoxFuture<'static, Result<Value, String>> = match kind {
            "db.query" => {
                let data = Arc::clone(&self.data);
                let SqlCall { sql, params } = parse_payload(payload)?;
                async move {
                    data.query(&sql, params)
                        .await
                        .map(|rows| Value::Array(rows.into_iter().map(Value::Object).collect()))
                        .map_err(|e| e.to_string())
                }
                .boxed()
            },
            "db.execute" => {
                let data = Arc::clone(&self.data);
                let SqlCall { sql, params } = parse_payload(payload)?;
                async move {
                    let result = data.execute(&sql, params).await.map_err(|e| e.to_string())?;
                    serde_json::to_value(result).map_err(|e| e.to_string())
                }
                .boxed()
            },
            "fetch" if self.grant.network() => {
                fetch(self.http.clone(), parse_payload(payload)?).boxed()
            },
            "fetch" => return Err("network access is not granted".into()),
            other => return Err(format!("unknown host call: {other}")),
        };

        let sender = self.sender.clone();
        let id = self.id.clone();
        let kind = kind.to_owned();
        self.handle.spawn(async move {
            let outcome = work.await;
            if let Err(message) = &outcome {
                debug!(extension_id = %id, %kind, %message, "Host call failed");
            }
            // The worker may already be gone; nothing to settle then.
            let _ = sender.send(Command::Complete { call, outcome });
        });
        Ok(())
    }
}

/// Bus subscriber that forwards matching events to one JS handler.
struct SandboxSubscriber {
    sender: Sender<Command>,
    handler: u32,
    event_type: String,
}

impl EventSubscriber for SandboxSubscriber {
    fn on_event(&self, event: &Event, _bus: &EventBus) {
        let _ = self.sender.send(Command::Deliver {
            handler: self.handler,
            event_type: self.event_type.clone(),
            detail: event.payload.clone(),
        });
    }
}

#[derive(Debug, Deserialize)]
struct SqlCall {
    sql: String,
    #[serde(default)]
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct FetchCall {
    url: String,
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, Value>,
    body: Option<String>,
}

fn parse_payload<T: for<'de> Deserialize<'de>>(payload: Value) -> Result<T, String> {
    serde_json::from_value(payload).map_err(|e| format!("invalid host call payload: {e}"))
}

async fn fetch(client: reqwest::Client, call: FetchCall) -> Result<Value, String> {
    let method = reqwest::Method::from_bytes(call.method.as_bytes()).map_err(|e| e.to_string())?;
    let mut request = client.request(method, &call.url);
    for (name, value) in call.headers {
        let value = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        request = request.header(name, value);
    }
    if let Some(body) = call.body {
        request = request.body(body);
    }

    let response = request.send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    let url = response.url().to_string();
    let headers: Map<String, Value> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), Value::String(v.to_owned())))
        })
        .collect();
    let body = response.text().await.map_err(|e| e.to_string())?;

    Ok(json!({
        "status": status.as_u16(),
        "statusText": status.canonical_reason().unwrap_or_default(),
        "url": url,
        "headers": headers,
        "body": body,
    }))
}

/// Whether `name` addresses an extension namespace.
fn is_namespaced(name: &str) -> bool {
    name.strip_prefix(EXTENSION_NAMESPACE)
        .is_some_and(|rest| rest.starts_with(':'))
}

/// `assets/` → `/assets`; empty → `/`.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        format!("/{trimmed}")
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_delay(delay_ms: f64) -> Duration {
    if delay_ms.is_finite() && delay_ms > 0.0 {
        // Browsers clamp to a signed 32-bit millisecond count.
        Duration::from_millis(delay_ms.min(f64::from(i32::MAX)) as u64)
    } else {
        Duration::ZERO
    }
}

fn throw<T>(ctx: &Ctx<'_>, message: impl Display) -> rquickjs::Result<T> {
    Err(Exception::throw_message(ctx, &message.to_string()))
}

fn clamp_count(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Build the `host` object handed to the shim.
///
/// Subscription ids cross the boundary as JS numbers.
#[allow(
    clippy::too_many_lines,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub(crate) fn install<'js>(ctx: &Ctx<'js>, state: &Rc<HostState>) -> rquickjs::Result<Object<'js>> {
    let host = Object::new(ctx.clone())?;

    let s = Rc::clone(state);
    host.set(
        "log",
        Function::new(ctx.clone(), move |level: String, message: String| {
            s.log(&level, &message);
        })?,
    )?;

    let s = Rc::clone(state);
    host.set(
        "registerRoute",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, method: String, path: String| -> rquickjs::Result<u32> {
                s.register_route(&method, &path).or_else(|e| throw(&ctx, e))
            },
        )?,
    )?;

    let s = Rc::clone(state);
    host.set(
        "assertOpen",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<()> {
            s.ensure_open().or_else(|e| throw(&ctx, e))
        })?,
    )?;

    let s = Rc::clone(state);
    host.set(
        "mountStatic",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, dir: String, prefix: String, index_html: bool| {
                s.mount_static(&dir, &prefix, index_html)
                    .or_else(|e| throw(&ctx, e))
            },
        )?,
    )?;

    let s = Rc::clone(state);
    host.set(
        "readFile",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, path: String| -> rquickjs::Result<String> {
                s.grant
                    .fs()
                    .read_to_string(&path)
                    .or_else(|e| throw(&ctx, e))
            },
        )?,
    )?;

    let s = Rc::clone(state);
    host.set(
        "call",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, kind: String, call: u32, payload: String| {
                s.start_call(&kind, call, &payload).or_else(|e| throw(&ctx, e))
            },
        )?,
    )?;

    let s = Rc::clone(state);
    host.set(
        "subscribe",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: String, handler: u32, global: bool| {
                s.subscribe(&name, handler, global)
                    .map(|sub| sub.as_u64() as f64)
                    .or_else(|e| throw(&ctx, e))
            },
        )?,
    )?;

    let s = Rc::clone(state);
    host.set(
        "unsubscribe",
        Function::new(
            ctx.clone(),
            move |sub: f64| s.unsubscribe(SubscriberId::from_u64(sub as u64)),
        )?,
    )?;

    let s = Rc::clone(state);
    host.set(
        "emit",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: String, data: String| -> rquickjs::Result<u32> {
                s.emit(&name, &data)
                    .map(clamp_count)
                    .or_else(|e| throw(&ctx, e))
            },
        )?,
    )?;

    let s = Rc::clone(state);
    host.set(
        "send",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, target: String, name: String, data: String| -> rquickjs::Result<u32> {
                s.send(&target, &name, &data)
                    .map(clamp_count)
                    .or_else(|e| throw(&ctx, e))
            },
        )?,
    )?;

    let s = Rc::clone(state);
    host.set(
        "schedule",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, id: u32, delay: f64, repeat: bool| {
                s.schedule(id, delay, repeat).or_else(|e| throw(&ctx, e))
            },
        )?,
    )?;

    let s = Rc::clone(state);
    host.set(
        "cancel",
        Function::new(ctx.clone(), move |id: u32| {
            s.timers.borrow_mut().cancel(id);
        })?,
    )?;

    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("/static"), "/static");
        assert_eq!(normalize_prefix("assets/"), "/assets");
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix(""), "/");
    }

    #[test]
    fn test_namespace_detection() {
        assert!(is_namespaced("extension:Other:created"));
        assert!(!is_namespaced("extensionLoaded"));
        assert!(!is_namespaced("orders"));
    }

    #[test]
    fn test_clamp_delay() {
        assert_eq!(clamp_delay(-5.0), Duration::ZERO);
        assert_eq!(clamp_delay(f64::NAN), Duration::ZERO);
        assert_eq!(clamp_delay(15.7), Duration::from_millis(15));
        assert_eq!(
            clamp_delay(f64::INFINITY),
            Duration::ZERO,
            "non-finite delays fire immediately"
        );
        assert_eq!(
            clamp_delay(1e12),
            Duration::from_millis(u64::try_from(i32::MAX).unwrap())
        );
    }

    #[test]
    fn test_sql_payload_defaults_params() {
        let call: SqlCall = parse_payload(json!({ "sql": "SELECT 1" })).unwrap();
        assert_eq!(call.sql, "SELECT 1");
        assert!(call.params.is_empty());
        assert!(parse_payload::<SqlCall>(json!({ "params": [] })).is_err());
    }
}
