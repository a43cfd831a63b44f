//! Capability grants derived from manifests.
//!
//! A [`CapabilityGrant`] is computed once, immediately before a sandbox is
//! built, and handed to it by value. It has no setters: changing what an
//! extension may do requires a reload.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::{ExtensionError, ExtensionResult};
use crate::extension::ExtensionId;
use crate::manifest::{CONSOLE_METHODS, Manifest};

/// Largest file `readFile` will return.
const MAX_READ_SIZE: u64 = 8_388_608;

/// Which console methods are live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsoleGrant {
    log: bool,
    info: bool,
    warn: bool,
    error: bool,
}

impl ConsoleGrant {
    /// Whether `method` forwards to the host logger.
    #[must_use]
    pub fn allows(&self, method: &str) -> bool {
        match method {
            "log" => self.log,
            "info" => self.info,
            "warn" => self.warn,
            "error" => self.error,
            _ => false,
        }
    }

    /// Whether any method is enabled.
    #[must_use]
    pub fn any(&self) -> bool {
        CONSOLE_METHODS.iter().any(|m| self.allows(m))
    }
}

/// Read access confined to one directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsScope {
    root: PathBuf,
}

impl FsScope {
    /// Scope rooted at `root`, canonicalized so symlinked roots compare
    /// correctly.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `root` does not exist.
    pub fn new(root: &Path) -> ExtensionResult<Self> {
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    /// Canonical root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `requested` against the root, following symlinks, and refuse
    /// anything that lands outside it.
    ///
    /// Leading `/` is ignored; all paths are relative to the root. Components
    /// that do not exist yet are appended after canonicalizing the deepest
    /// existing ancestor; a `..` among them is refused outright since it
    /// cannot be resolved physically.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError::AccessDenied`] when the resolved path is not
    /// beneath the root.
    pub fn resolve(&self, requested: &str) -> ExtensionResult<PathBuf> {
        let denied = |reason: String| ExtensionError::AccessDenied {
            requested: requested.to_owned(),
            reason,
        };

        let joined = self.root.join(make_relative(requested));
        let mut current = joined.clone();
        let mut missing: Vec<OsString> = Vec::new();

        let resolved = loop {
            if std::fs::symlink_metadata(&current).is_ok() {
                let mut resolved = current
                    .canonicalize()
                    .map_err(|e| denied(format!("cannot resolve: {e}")))?;
                for component in missing.into_iter().rev() {
                    resolved.push(component);
                }
                break resolved;
            }
            let Some(parent) = current.parent() else {
                return Err(denied("no existing ancestor".into()));
            };
            match current.file_name() {
                Some(name) => missing.push(name.to_os_string()),
                None => return Err(denied("unresolvable `..` in missing path".into())),
            }
            current = parent.to_path_buf();
        };

        if !resolved.starts_with(&self.root) {
            debug!(requested, resolved = %resolved.display(), "Path escapes extension root");
            return Err(denied(format!(
                "resolves to {}, outside the extension root",
                resolved.display()
            )));
        }
        Ok(resolved)
    }

    /// Read a UTF-8 file beneath the root.
    ///
    /// # Errors
    ///
    /// [`ExtensionError::AccessDenied`] for paths outside the root,
    /// [`ExtensionError::Io`] for missing, oversized or unreadable files.
    pub fn read_to_string(&self, requested: &str) -> ExtensionResult<String> {
        let path = self.resolve(requested)?;
        let metadata = std::fs::metadata(&path)?;
        if metadata.len() > MAX_READ_SIZE {
            return Err(ExtensionError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{requested} exceeds the {MAX_READ_SIZE} byte read limit"),
            )));
        }
        Ok(std::fs::read_to_string(path)?)
    }
}

/// Strip root and prefix components so the path joins under the scope root.
fn make_relative(requested: &str) -> &Path {
    let mut components = Path::new(requested).components();
    while let Some(c) = components.clone().next() {
        if matches!(c, Component::RootDir | Component::Prefix(_)) {
            components.next();
        } else {
            break;
        }
    }
    components.as_path()
}

/// The immutable set of host facilities one sandbox may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityGrant {
    extension_id: ExtensionId,
    console: ConsoleGrant,
    network: bool,
    timers: bool,
    env: Vec<(String, String)>,
    fs: FsScope,
    public_dir: String,
    granted_at: DateTime<Utc>,
}

impl CapabilityGrant {
    /// Derive a grant from `manifest`.
    ///
    /// `lookup_env` is consulted only for whitelisted names; unset variables
    /// are omitted from the sandbox view. The result owns copies of every
    /// value.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the extension root cannot be canonicalized.
    pub fn from_manifest(
        id: &ExtensionId,
        manifest: &Manifest,
        root: &Path,
        lookup_env: &dyn Fn(&str) -> Option<String>,
    ) -> ExtensionResult<Self> {
        let perms = &manifest.permissions;
        let env = perms
            .env
            .iter()
            .filter_map(|name| lookup_env(name).map(|value| (name.clone(), value)))
            .collect();

        let grant = Self {
            extension_id: id.clone(),
            console: ConsoleGrant {
                log: perms.console.allows("log"),
                info: perms.console.allows("info"),
                warn: perms.console.allows("warn"),
                error: perms.console.allows("error"),
            },
            network: perms.network,
            timers: perms.timers,
            env,
            fs: FsScope::new(root)?,
            public_dir: perms.public_dir.clone(),
            granted_at: Utc::now(),
        };
        debug!(
            extension_id = %id,
            network = grant.network,
            timers = grant.timers,
            console = grant.console.any(),
            env_vars = grant.env.len(),
            "Built capability grant"
        );
        Ok(grant)
    }

    /// The extension this grant belongs to.
    #[must_use]
    pub fn extension_id(&self) -> &ExtensionId {
        &self.extension_id
    }

    /// Console methods.
    #[must_use]
    pub fn console(&self) -> ConsoleGrant {
        self.console
    }

    /// Whether `fetch` is installed.
    #[must_use]
    pub fn network(&self) -> bool {
        self.network
    }

    /// Whether timer primitives are installed.
    #[must_use]
    pub fn timers(&self) -> bool {
        self.timers
    }

    /// Whitelisted environment variables that were set, in manifest order.
    #[must_use]
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Scoped filesystem access.
    #[must_use]
    pub fn fs(&self) -> &FsScope {
        &self.fs
    }

    /// Default static-asset directory.
    #[must_use]
    pub fn public_dir(&self) -> &str {
        &self.public_dir
    }

    /// When the grant was computed.
    #[must_use]
    pub fn granted_at(&self) -> DateTime<Utc> {
        self.granted_at
    }
}
