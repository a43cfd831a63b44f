//! Extension manifest parsing and validation.
//!
//! Every extension directory carries a `manifest.json`:
//!
//! ```json
//! {
//!   "version": "1.0.0",
//!   "author": "ACME",
//!   "index": "index.ts",
//!   "name": "Products",
//!   "dependencies": ["Accounts"],
//!   "permissions": {
//!     "console": { "log": true, "error": true },
//!     "network": false,
//!     "timers": true,
//!     "env": ["SHOP_CURRENCY"],
//!     "publicDir": "public"
//!   }
//! }
//! ```
//!
//! Validation runs to completion before any extension code is compiled.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{ExtensionError, ExtensionResult};

/// Manifest file name inside every extension directory.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Default static-asset directory.
pub const DEFAULT_PUBLIC_DIR: &str = "public";

/// Manifests larger than this are rejected unread.
const MAX_MANIFEST_SIZE: u64 = 1_048_576;

/// Console methods an extension may be granted.
pub const CONSOLE_METHODS: [&str; 4] = ["log", "info", "warn", "error"];

/// A validated, fully defaulted extension manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Manifest version string.
    pub version: String,
    /// Author.
    pub author: String,
    /// Entry file path, relative to the extension directory.
    pub index: String,
    /// Display name; the directory name when not declared.
    pub name: String,
    /// Free-form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ids of extensions that must be active first.
    pub dependencies: Vec<String>,
    /// Declared capabilities.
    pub permissions: Permissions,
}

/// Declared permission set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    /// Console access.
    pub console: ConsolePermission,
    /// Whether `fetch` is present.
    pub network: bool,
    /// Whether timer primitives are present.
    pub timers: bool,
    /// Environment variable names to copy into the sandbox, in order.
    pub env: Vec<String>,
    /// Static-asset directory, relative to the extension directory.
    pub public_dir: String,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            console: ConsolePermission::default(),
            network: false,
            timers: false,
            env: Vec::new(),
            public_dir: DEFAULT_PUBLIC_DIR.to_owned(),
        }
    }
}

/// Console permission: all methods, none, or a per-method selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ConsolePermission {
    /// Every method enabled (`true`) or disabled (`false`).
    All(bool),
    /// Per-method flags; a method missing from the map is enabled.
    Methods(BTreeMap<String, bool>),
}

impl Default for ConsolePermission {
    fn default() -> Self {
        Self::All(false)
    }
}

impl ConsolePermission {
    /// Whether `method` is allowed.
    #[must_use]
    pub fn allows(&self, method: &str) -> bool {
        match self {
            Self::All(enabled) => *enabled,
            Self::Methods(map) => map.get(method).copied().unwrap_or(true),
        }
    }

    /// Interpret the raw manifest value. Anything other than `true` or an
    /// object disables the console.
    fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Bool(enabled)) => Self::All(*enabled),
            Some(Value::Object(map)) => Self::Methods(
                CONSOLE_METHODS
                    .iter()
                    .map(|m| ((*m).to_owned(), map.get(*m).is_none_or(is_truthy)))
                    .collect(),
            ),
            _ => Self::All(false),
        }
    }
}

/// JS truthiness of a JSON value; `null` counts as unset.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    version: Option<String>,
    author: Option<String>,
    index: Option<String>,
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    permissions: Option<RawPermissions>,
    public_dir: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawPermissions {
    console: Option<Value>,
    #[serde(default)]
    network: bool,
    #[serde(default)]
    timers: bool,
    #[serde(default)]
    env: Vec<String>,
    public_dir: Option<String>,
}

impl Manifest {
    /// Parse and validate manifest JSON. `dir_name` supplies the default name.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError::ManifestInvalid`] for malformed JSON, wrong
    /// field types, or a missing or empty required field.
    pub fn parse(source: &str, path: &Path, dir_name: &str) -> ExtensionResult<Self> {
        let invalid = |message: String| ExtensionError::ManifestInvalid {
            path: path.to_path_buf(),
            message,
        };

        let raw: RawManifest = serde_json::from_str(source).map_err(|e| invalid(e.to_string()))?;

        let required = |value: Option<String>, field: &str| {
            value
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| invalid(format!("missing required field `{field}`")))
        };
        let version = required(raw.version, "version")?;
        let author = required(raw.author, "author")?;
        let index = required(raw.index, "index")?;

        let perms = raw.permissions.unwrap_or_default();
        let public_dir = perms
            .public_dir
            .or(raw.public_dir)
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PUBLIC_DIR.to_owned());

        if let Some(dep) = raw.dependencies.iter().find(|d| d.trim().is_empty()) {
            return Err(invalid(format!("invalid dependency name `{dep}`")));
        }

        Ok(Self {
            version,
            author,
            index,
            name: raw
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| dir_name.to_owned()),
            description: raw.description,
            dependencies: raw.dependencies,
            permissions: Permissions {
                console: ConsolePermission::from_value(perms.console.as_ref()),
                network: perms.network,
                timers: perms.timers,
                env: perms.env,
                public_dir,
            },
        })
    }

    /// The manifest as a JSON value, as exposed to sandboxes and events.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Read and validate `<dir>/manifest.json`.
///
/// # Errors
///
/// Returns [`ExtensionError::ManifestInvalid`] if the file is missing,
/// oversized, unreadable, or fails [`Manifest::parse`].
pub fn load_manifest(dir: &Path) -> ExtensionResult<Manifest> {
    let path = manifest_path(dir);
    let invalid = |message: String| ExtensionError::ManifestInvalid {
        path: path.clone(),
        message,
    };

    let metadata = std::fs::metadata(&path).map_err(|e| invalid(e.to_string()))?;
    if !metadata.is_file() {
        return Err(invalid("not a regular file".into()));
    }
    if metadata.len() > MAX_MANIFEST_SIZE {
        return Err(invalid(format!(
            "manifest is {} bytes, exceeding the {MAX_MANIFEST_SIZE} byte limit",
            metadata.len()
        )));
    }
    let source = std::fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;

    let dir_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let manifest = Manifest::parse(&source, &path, &dir_name)?;
    debug!(
        path = %path.display(),
        name = %manifest.name,
        version = %manifest.version,
        "Loaded extension manifest"
    );
    Ok(manifest)
}

/// Path of the manifest inside `dir`.
#[must_use]
pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE_NAME)
}
