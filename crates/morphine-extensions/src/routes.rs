//! Mounting extension routes under `/extensions/<id>`.
//!
//! Each active extension gets its own [`Router`], built once from the routes
//! and static mounts it registered during init. The outer dispatcher looks the
//! router up by path segment on every request, so mounting and unmounting
//! never rebuild the host's router. A mounted router only receives requests
//! while the registry reports its extension as active.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, MethodRouter, any};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Value, json};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, error, warn};

use crate::error::{ExtensionError, ExtensionResult};
use crate::extension::{ExtensionId, LoadedExtension};
use crate::registry::ExtensionRegistry;
use crate::sandbox::{HandlerRequest, RouteMethod, RouteSpec, Sandbox};

/// Path under which every extension is mounted.
pub const EXTENSIONS_PREFIX: &str = "/extensions";

/// Largest request body forwarded to a handler.
const MAX_BODY_SIZE: usize = 2_097_152;

/// URL prefix for `id`.
#[must_use]
pub fn prefix_for(id: &ExtensionId) -> String {
    format!("{EXTENSIONS_PREFIX}/{}", id.route_segment())
}

struct Mounted {
    extension: Arc<LoadedExtension>,
    router: Router,
}

/// Live table of extension routers keyed by lower-cased id.
pub struct RouteMount {
    registry: Arc<ExtensionRegistry>,
    mounts: DashMap<String, Mounted>,
}

impl RouteMount {
    /// Empty table gated on `registry`.
    #[must_use]
    pub fn new(registry: Arc<ExtensionRegistry>) -> Self {
        Self {
            registry,
            mounts: DashMap::new(),
        }
    }

    /// Build and install the router for `extension`.
    ///
    /// Replaces an existing mount of the same extension.
    ///
    /// # Errors
    ///
    /// [`ExtensionError::InvalidRoute`] if the registered paths cannot form a
    /// router, or if another extension already owns the same lower-cased
    /// segment.
    pub fn mount(&self, extension: Arc<LoadedExtension>) -> ExtensionResult<()> {
        let id = extension.id().clone();
        let segment = id.route_segment();
        let router = build_router(&extension)?;

        match self.mounts.entry(segment) {
            Entry::Occupied(occupied) if occupied.get().extension.id() != &id => {
                Err(ExtensionError::InvalidRoute {
                    id,
                    message: format!(
                        "prefix {} is already mounted by {}",
                        occupied.key(),
                        occupied.get().extension.id()
                    ),
                })
            },
            Entry::Occupied(mut occupied) => {
                occupied.insert(Mounted { extension, router });
                debug!(extension_id = %id, "Remounted extension routes");
                Ok(())
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Mounted { extension, router });
                debug!(extension_id = %id, prefix = %prefix_for(&id), "Mounted extension routes");
                Ok(())
            },
        }
    }

    /// Remove the mount for `id`. Returns `false` if it was not mounted.
    pub fn unmount(&self, id: &ExtensionId) -> bool {
        let removed = self
            .mounts
            .remove_if(&id.route_segment(), |_, mounted| mounted.extension.id() == id);
        removed.is_some()
    }

    /// Whether `id` currently has a mount.
    #[must_use]
    pub fn is_mounted(&self, id: &ExtensionId) -> bool {
        self.mounts
            .get(&id.route_segment())
            .is_some_and(|mounted| mounted.extension.id() == id)
    }

    /// Number of mounted extensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    /// Whether nothing is mounted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Router for `segment`, if the registry says its extension is serving.
    fn live_router(&self, segment: &str) -> Option<Router> {
        let (id, router) = {
            let mounted = self.mounts.get(segment)?;
            (mounted.extension.id().clone(), mounted.router.clone())
        };
        self.registry.is_active(&id).then_some(router)
    }

    /// Router that forwards `/<segment>/...` to the matching extension.
    ///
    /// Meant to be nested at [`EXTENSIONS_PREFIX`].
    pub fn dispatcher(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/:segment", any(forward))
            .route("/:segment/", any(forward))
            .route("/:segment/*rest", any(forward))
            .with_state(Arc::clone(self))
    }
}

impl std::fmt::Debug for RouteMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteMount")
            .field("mounted", &self.mounts.len())
            .finish()
    }
}

async fn forward(State(mount): State<Arc<RouteMount>>, request: Request) -> Response {
    let Some((segment, rest)) = split_segment(request.uri().path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(router) = mount.live_router(&segment.to_ascii_lowercase()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let path_and_query = match request.uri().query() {
        Some(query) => format!("/{rest}?{query}"),
        None => format!("/{rest}"),
    };
    let Ok(uri) = path_and_query.parse::<Uri>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    // Fresh request: the dispatcher's own path params live in the
    // extensions and would otherwise merge into the extension's.
    let (parts, body) = request.into_parts();
    let mut forwarded = Request::new(body);
    *forwarded.method_mut() = parts.method;
    *forwarded.uri_mut() = uri;
    *forwarded.version_mut() = parts.version;
    *forwarded.headers_mut() = parts.headers;

    match router.oneshot(forwarded).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

/// `/Seg/a/b` → (`Seg`, `a/b`).
fn split_segment(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.strip_prefix('/')?;
    let (segment, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
    (!segment.is_empty()).then_some((segment, rest))
}

/// Translate a registered path to axum syntax. A bare `*` segment becomes a
/// named wildcard.
fn axum_path(path: &str) -> String {
    if path == "*" || path == "/*" {
        return "/*wildcard".to_owned();
    }
    match path.strip_suffix("/*") {
        Some(head) => format!("{head}/*wildcard"),
        None => path.to_owned(),
    }
}

fn method_filter(method: RouteMethod) -> Option<MethodFilter> {
    match method {
        RouteMethod::Get => Some(MethodFilter::GET),
        RouteMethod::Post => Some(MethodFilter::POST),
        RouteMethod::Put => Some(MethodFilter::PUT),
        RouteMethod::Patch => Some(MethodFilter::PATCH),
        RouteMethod::Delete => Some(MethodFilter::DELETE),
        RouteMethod::All => None,
    }
}

fn build_router(extension: &LoadedExtension) -> ExtensionResult<Router> {
    let id = extension.id();
    let invalid = |message: String| ExtensionError::InvalidRoute {
        id: id.clone(),
        message,
    };

    // Group by path, keeping registration order.
    let mut grouped: Vec<(String, Vec<&RouteSpec>)> = Vec::new();
    for spec in &extension.exports().routes {
        if !spec.path.starts_with('/') && spec.path != "*" {
            return Err(invalid(format!("route path must start with '/': {}", spec.path)));
        }
        let path = axum_path(&spec.path);
        match grouped.iter_mut().find(|(p, _)| *p == path) {
            Some((_, specs)) => specs.push(spec),
            None => grouped.push((path, vec![spec])),
        }
    }

    let sandbox = extension.sandbox();
    let statics = &extension.exports().statics;
    let built = catch_unwind(AssertUnwindSafe(|| {
        let mut router = Router::new();
        for (path, specs) in &grouped {
            let mut methods = MethodRouter::new();
            let mut seen = HashSet::new();
            for spec in specs {
                if !seen.insert(spec.method) {
                    warn!(
                        extension_id = %id,
                        method = %spec.method,
                        path = %spec.path,
                        "Duplicate route ignored; first registration wins"
                    );
                    continue;
                }
                let handler = route_handler(Arc::clone(sandbox), spec.index);
                methods = match method_filter(spec.method) {
                    Some(filter) => methods.on(filter, handler),
                    None => methods.fallback(handler),
                };
            }
            router = router.route(path, methods);
        }
        for mount in statics {
            let service = ServeDir::new(&mount.dir).append_index_html_on_directories(mount.index_html);
            router = if mount.url_prefix == "/" {
                router.fallback_service(service)
            } else {
                router.nest_service(&mount.url_prefix, service)
            };
        }
        router
    }));

    built.map_err(|panic| {
        let message = panic
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| panic.downcast_ref::<&str>().map(|s| (*s).to_owned()))
            .unwrap_or_else(|| "conflicting routes".to_owned());
        invalid(message)
    })
}

type HandlerFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>;

/// Axum handler that forwards to route `index` in `sandbox`.
fn route_handler(
    sandbox: Arc<Sandbox>,
    index: u32,
) -> impl Fn(Option<Path<HashMap<String, String>>>, Query<BTreeMap<String, String>>, Request) -> HandlerFuture
+ Clone
+ Send
+ Sync
+ 'static {
    move |params, Query(query), request| {
        let sandbox = Arc::clone(&sandbox);
        Box::pin(async move {
            let params = params.map(|Path(p)| p).unwrap_or_default();
            invoke(&sandbox, index, params, query, request).await
        })
    }
}

async fn invoke(
    sandbox: &Sandbox,
    index: u32,
    params: HashMap<String, String>,
    query: BTreeMap<String, String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, MAX_BODY_SIZE).await else {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    };

    let request = HandlerRequest {
        method: parts.method.as_str().to_owned(),
        path: parts.uri.path().to_owned(),
        params: params
            .into_iter()
            .map(|(k, v)| if k == "wildcard" { ("*".to_owned(), v) } else { (k, v) })
            .collect(),
        query,
        headers: header_map(&parts.headers),
        body: parse_body(&parts.headers, &bytes),
    };

    let method = request.method.clone();
    let path = request.path.clone();
    match sandbox.dispatch(index, request).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            error!(
                extension_id = %sandbox.id(),
                %method,
                %path,
                kind = e.kind(),
                error = %e,
                "Route handler failed"
            );
            internal_error()
        },
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect()
}

/// JSON bodies are parsed; anything else is passed as text.
fn parse_body(headers: &HeaderMap, bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"));
    if is_json {
        if let Ok(value) = serde_json::from_slice(bytes) {
            return value;
        }
    }
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}

/// Generic 500; details stay in the log.
pub(crate) fn internal_error() -> Response {
    let body = json!({ "message": "Internal Server Error", "success": false });
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_is_lowercase() {
        let id = ExtensionId::from_static("ShopCart");
        assert_eq!(prefix_for(&id), "/extensions/shopcart");
    }

    #[test]
    fn test_split_segment() {
        assert_eq!(split_segment("/Shop"), Some(("Shop", "")));
        assert_eq!(split_segment("/Shop/"), Some(("Shop", "")));
        assert_eq!(split_segment("/Shop/items/3"), Some(("Shop", "items/3")));
        assert_eq!(split_segment("/"), None);
        assert_eq!(split_segment(""), None);
    }

    #[test]
    fn test_axum_path_wildcards() {
        assert_eq!(axum_path("/items/:id"), "/items/:id");
        assert_eq!(axum_path("/files/*"), "/files/*wildcard");
        assert_eq!(axum_path("*"), "/*wildcard");
    }

    #[test]
    fn test_parse_body() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_body(&headers, b""), Value::Null);
        assert_eq!(parse_body(&headers, b"plain"), json!("plain"));

        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        assert_eq!(parse_body(&headers, br#"{"a":1}"#), json!({ "a": 1 }));
        assert_eq!(parse_body(&headers, b"{broken"), json!("{broken"));
    }

    #[tokio::test]
    async fn test_internal_error_shape() {
        let response = internal_error();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({ "message": "Internal Server Error", "success": false }));
    }

    #[tokio::test]
    async fn test_unknown_segment_is_not_found() {
        let mount = Arc::new(RouteMount::new(Arc::new(ExtensionRegistry::new())));
        let app = Router::new().nest(EXTENSIONS_PREFIX, mount.dispatcher());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/extensions/missing/anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
