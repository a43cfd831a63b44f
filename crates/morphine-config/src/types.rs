//! Configuration types for the Morphine host.
//!
//! Every struct implements [`Default`] with the same values as the embedded
//! `defaults.toml`, so a bare `[section]` header produces a working
//! configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener.
    pub server: ServerSection,
    /// Extension discovery and sandbox limits.
    pub extensions: ExtensionsSection,
    /// Relational store used by the extension data-access proxy.
    pub database: DatabaseSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// ServerSection
// ---------------------------------------------------------------------------

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Socket address to bind, e.g. `127.0.0.1:3000`.
    pub bind: String,
}

impl ServerSection {
    /// Parsed bind address.
    ///
    /// # Errors
    ///
    /// Returns the parse error if `bind` is not a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.bind.parse()
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExtensionsSection
// ---------------------------------------------------------------------------

/// Extension discovery and sandbox limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionsSection {
    /// Directory scanned for extension subdirectories.
    pub dir: PathBuf,
    /// Budget for each synchronous sandbox turn, including the initial run.
    pub load_timeout_ms: u64,
    /// Bound on the initializer promise. `0` disables it.
    pub init_timeout_ms: u64,
    /// Bound on a single request handler, including async work.
    pub handler_timeout_ms: u64,
    /// Heap limit per sandbox.
    pub memory_limit_bytes: usize,
    /// Default URL segment for `mountStatic`.
    pub static_prefix: String,
}

impl ExtensionsSection {
    /// Synchronous execution budget.
    #[must_use]
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Initializer bound, if enabled.
    #[must_use]
    pub fn init_timeout(&self) -> Option<Duration> {
        (self.init_timeout_ms > 0).then(|| Duration::from_millis(self.init_timeout_ms))
    }

    /// Request handler bound.
    #[must_use]
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

impl Default for ExtensionsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("extensions"),
            load_timeout_ms: 2000,
            init_timeout_ms: 10_000,
            handler_timeout_ms: 30_000,
            memory_limit_bytes: 67_108_864,
            static_prefix: "/static".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// DatabaseSection
// ---------------------------------------------------------------------------

/// Relational store settings.
///
/// The URL usually embeds credentials, so it is redacted from `Debug` and
/// omitted when serialized.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Connection URL (`sqlite://…`, `mysql://…`). Data access is disabled when unset.
    pub url: Option<String>,
    /// Pool size.
    pub max_connections: u32,
}

impl std::fmt::Debug for DatabaseSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSection")
            .field("has_url", &self.url.is_some())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl Serialize for DatabaseSection {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DatabaseSection", 1)?;
        state.serialize_field("max_connections", &self.max_connections)?;
        state.end()
    }
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging settings, mirrored into `morphine_telemetry::LogConfig` at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Base level.
    pub level: String,
    /// `pretty`, `compact` or `json`.
    pub format: String,
    /// Extra filter directives.
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}
