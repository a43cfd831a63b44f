//! Values exchanged between the host and a sandbox worker.

use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::ExtensionResult;

/// HTTP method a route answers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
    /// Any method not otherwise routed on the same path.
    All,
}

impl RouteMethod {
    /// Parse the verb used by `utils.app.<verb>`.
    #[must_use]
    pub fn parse(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            "ALL" => Some(Self::All),
            _ => None,
        }
    }

    /// Upper-case verb.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::All => "ALL",
        }
    }
}

impl std::fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A route registered during initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSpec {
    /// Method filter.
    pub method: RouteMethod,
    /// Path relative to the extension prefix, with `:param` segments.
    pub path: String,
    /// Handler slot inside the sandbox.
    pub index: u32,
}

/// A static directory registered during initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaticMount {
    /// Absolute directory, already confined to the extension root.
    pub dir: PathBuf,
    /// Mount point relative to the extension prefix.
    pub url_prefix: String,
    /// Serve `index.html` for directory requests.
    pub index_html: bool,
}

/// Everything an extension registered before it went live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportSurface {
    /// Whether a cleanup export exists.
    pub has_cleanup: bool,
    /// Routes in registration order.
    pub routes: Vec<RouteSpec>,
    /// Static mounts in registration order.
    pub statics: Vec<StaticMount>,
}

/// Request context handed to a route handler, serialized into the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HandlerRequest {
    /// Upper-case method.
    pub method: String,
    /// Path relative to the extension prefix.
    pub path: String,
    /// Captured `:param` values.
    pub params: BTreeMap<String, String>,
    /// Decoded query string.
    pub query: BTreeMap<String, String>,
    /// Lower-case header names.
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body, the raw text for other bodies, or `null`.
    pub body: Value,
}

/// How a handler's return value was encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// `undefined` or `null`.
    Empty,
    /// A string.
    Text,
    /// Anything else, JSON encoded.
    Json,
}

/// Shaped handler result coming back from the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HandlerResponse {
    /// Status code from `ctx.set.status` or `ctx.status(...)`.
    pub status: u16,
    /// Headers from `ctx.set.headers`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body encoding.
    pub kind: ResponseKind,
    /// Encoded body.
    #[serde(default)]
    pub body: String,
}

impl IntoResponse for HandlerResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let content_type = match self.kind {
            ResponseKind::Empty => None,
            ResponseKind::Text => Some("text/plain; charset=utf-8"),
            ResponseKind::Json => Some("application/json"),
        };

        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        if let Some(content_type) = content_type {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        for (name, value) in self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                },
                _ => warn!(header = %name, "Dropping invalid response header"),
            }
        }
        response
    }
}

/// Messages processed by the worker loop.
#[derive(Debug)]
pub(crate) enum Command {
    /// Run a route handler.
    Dispatch {
        route: u32,
        request: HandlerRequest,
        reply: oneshot::Sender<ExtensionResult<HandlerResponse>>,
    },
    /// Deliver a bus event to a JS handler.
    Deliver {
        handler: u32,
        event_type: String,
        detail: Value,
    },
    /// Settle a pending host call.
    Complete {
        call: u32,
        outcome: Result<Value, String>,
    },
    /// Run the cleanup export.
    Cleanup {
        reply: oneshot::Sender<ExtensionResult<()>>,
    },
    /// Tear down and exit.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_method_parse() {
        assert_eq!(RouteMethod::parse("get"), Some(RouteMethod::Get));
        assert_eq!(RouteMethod::parse("ALL"), Some(RouteMethod::All));
        assert_eq!(RouteMethod::parse("HEAD"), None);
    }

    #[test]
    fn test_json_response() {
        let response: HandlerResponse = serde_json::from_str(
            r#"{"status":201,"headers":{"x-total":"3"},"kind":"json","body":"[1,2,3]"}"#,
        )
        .unwrap();
        let response = response.into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()["x-total"], "3");
    }

    #[test]
    fn test_invalid_header_dropped() {
        let response = HandlerResponse {
            status: 200,
            headers: BTreeMap::from([("bad header".to_owned(), "v".to_owned())]),
            kind: ResponseKind::Text,
            body: "ok".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(response.headers().len(), 1);
    }
}
