//! Extension identity, lifecycle state and the loaded-extension record.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capabilities::CapabilityGrant;
use crate::error::{ExtensionError, ExtensionResult};
use crate::manifest::Manifest;
use crate::sandbox::{ExportSurface, Sandbox};

/// Maximum identifier length.
const MAX_ID_LEN: usize = 64;

/// Identifier of an extension: its directory name under the extensions root.
///
/// Case is preserved for display and event topics; the URL segment is the
/// lowercased form (see [`ExtensionId::route_segment`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ExtensionId(String);

impl<'de> Deserialize<'de> for ExtensionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl ExtensionId {
    /// Create a new `ExtensionId`, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError::InvalidId`] if the id is empty, too long,
    /// hidden, or contains characters outside `[A-Za-z0-9._-]`.
    pub fn new(id: impl Into<String>) -> ExtensionResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Create an `ExtensionId` without validation (for tests and internal use).
    #[must_use]
    pub fn from_static(id: &str) -> Self {
        Self(id.to_string())
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased form used as the URL prefix segment.
    #[must_use]
    pub fn route_segment(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    /// Check whether a string is a valid extension id.
    #[must_use]
    pub fn is_valid_id(id: &str) -> bool {
        Self::validate(id).is_ok()
    }

    fn validate(id: &str) -> ExtensionResult<()> {
        if id.is_empty() {
            return Err(ExtensionError::InvalidId(
                "extension id must not be empty".into(),
            ));
        }
        if id.len() > MAX_ID_LEN {
            return Err(ExtensionError::InvalidId(format!(
                "extension id must be at most {MAX_ID_LEN} characters, got: {id}"
            )));
        }
        if id.starts_with('.') {
            return Err(ExtensionError::InvalidId(format!(
                "extension id must not start with a dot, got: {id}"
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ExtensionError::InvalidId(format!(
                "extension id must contain only alphanumerics, '-', '_' and '.', got: {id}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ExtensionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of an extension.
///
/// ```text
/// Discovered → Validating → Compiling → Sandboxed → Active → Unloaded
///      └───────────┴────────────┴───────────┴──→ Failed
/// ```
///
/// `Active`, `Failed` and `Unloaded` are terminal for one load attempt; a new
/// attempt (load or reload) starts again at `Discovered`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum ExtensionState {
    /// Directory found, nothing read yet.
    Discovered,
    /// Manifest is being read and checked.
    Validating,
    /// Entry file is being transpiled.
    Compiling,
    /// Code has run inside its sandbox; initializer pending.
    Sandboxed,
    /// Initialized, registered and routable.
    Active,
    /// The load attempt failed.
    Failed(String),
    /// Torn down after being active.
    Unloaded,
}

impl ExtensionState {
    /// Whether the state machine permits moving to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        use ExtensionState as S;
        match (self, next) {
            (S::Discovered, S::Validating)
            | (S::Validating, S::Compiling)
            | (S::Compiling, S::Sandboxed)
            | (S::Sandboxed, S::Active)
            | (S::Active, S::Unloaded)
            | (S::Failed(_) | S::Unloaded, S::Discovered) => true,
            (S::Discovered | S::Validating | S::Compiling | S::Sandboxed, S::Failed(_)) => true,
            _ => false,
        }
    }

    /// Whether a load attempt has finished in this state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Active | Self::Failed(_) | Self::Unloaded)
    }

    /// Short name without the failure reason.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Validating => "validating",
            Self::Compiling => "compiling",
            Self::Sandboxed => "sandboxed",
            Self::Active => "active",
            Self::Failed(_) => "failed",
            Self::Unloaded => "unloaded",
        }
    }
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// A fully initialized extension as held by the registry.
///
/// The sandbox handle is owned here; routes hold clones of it only for
/// dispatch and lose access once the extension is unmounted.
pub struct LoadedExtension {
    id: ExtensionId,
    manifest: Manifest,
    root: PathBuf,
    grant: Arc<CapabilityGrant>,
    sandbox: Arc<Sandbox>,
    exports: ExportSurface,
    source_hash: String,
    loaded_at: DateTime<Utc>,
    active: AtomicBool,
}

impl LoadedExtension {
    pub(crate) fn new(
        id: ExtensionId,
        manifest: Manifest,
        root: PathBuf,
        grant: Arc<CapabilityGrant>,
        sandbox: Arc<Sandbox>,
        exports: ExportSurface,
        source_hash: String,
    ) -> Self {
        Self {
            id,
            manifest,
            root,
            grant,
            sandbox,
            exports,
            source_hash,
            loaded_at: Utc::now(),
            active: AtomicBool::new(false),
        }
    }

    /// Extension id.
    #[must_use]
    pub fn id(&self) -> &ExtensionId {
        &self.id
    }

    /// Parsed manifest.
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Extension directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Capabilities granted at load time.
    #[must_use]
    pub fn grant(&self) -> &CapabilityGrant {
        &self.grant
    }

    /// What the extension exposed after initialization.
    #[must_use]
    pub fn exports(&self) -> &ExportSurface {
        &self.exports
    }

    /// BLAKE3 hash of the entry source that was compiled.
    #[must_use]
    pub fn source_hash(&self) -> &str {
        &self.source_hash
    }

    /// When the extension became active.
    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Whether requests may still be dispatched to this extension.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    /// Serializable snapshot for listings.
    #[must_use]
    pub fn summary(&self) -> ExtensionSummary {
        ExtensionSummary {
            id: self.id.clone(),
            state: if self.is_active() {
                ExtensionState::Active
            } else {
                ExtensionState::Unloaded
            },
            name: Some(self.manifest.name.clone()),
            version: Some(self.manifest.version.clone()),
            author: Some(self.manifest.author.clone()),
            prefix: Some(crate::routes::prefix_for(&self.id)),
            routes: self.exports.routes.len(),
            loaded_at: Some(self.loaded_at),
        }
    }
}

impl fmt::Debug for LoadedExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedExtension")
            .field("id", &self.id)
            .field("version", &self.manifest.version)
            .field("root", &self.root)
            .field("active", &self.is_active())
            .field("routes", &self.exports.routes.len())
            .finish_non_exhaustive()
    }
}

/// Listing entry for an extension, loaded or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionSummary {
    /// Extension id.
    pub id: ExtensionId,
    /// Current lifecycle state.
    #[serde(flatten)]
    pub state: ExtensionState,
    /// Display name from the manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Manifest version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Manifest author.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// URL prefix, when mounted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Number of registered routes.
    pub routes: usize,
    /// Activation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,
}
