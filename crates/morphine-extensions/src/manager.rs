//! Extension lifecycle: load, unload, reload and the discovery pass.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use morphine_events::{Event, EventBus};
use tracing::{debug, info, warn};

use crate::capabilities::{CapabilityGrant, FsScope};
use crate::data::DataAccess;
use crate::discovery::discover;
use crate::error::{ExtensionError, ExtensionResult};
use crate::extension::{ExtensionId, ExtensionState, ExtensionSummary, LoadedExtension};
use crate::manifest::load_manifest;
use crate::registry::ExtensionRegistry;
use crate::routes::{EXTENSIONS_PREFIX, RouteMount};
use crate::sandbox::{LaunchSpec, SandboxConfig, SandboxExecutor};
use crate::transpiler::SourceTranspiler;

/// Looks up a host environment variable for the capability grant.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Outcome of [`ExtensionManager::load_all`].
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Extensions that are active after the pass, in load order.
    pub loaded: Vec<ExtensionId>,
    /// Extensions that failed, with the reason.
    pub failed: Vec<(ExtensionId, ExtensionError)>,
}

impl DiscoveryReport {
    /// Whether every discovered extension loaded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Builder for [`ExtensionManager`].
pub struct ExtensionManagerBuilder {
    dir: PathBuf,
    bus: Option<EventBus>,
    data: Option<Arc<dyn DataAccess>>,
    http: Option<reqwest::Client>,
    config: SandboxConfig,
    env: Option<EnvLookup>,
}

impl ExtensionManagerBuilder {
    /// Share `bus` with the host instead of creating a new one.
    #[must_use]
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Backend for `utils.db`.
    #[must_use]
    pub fn data_access(mut self, data: Arc<dyn DataAccess>) -> Self {
        self.data = Some(data);
        self
    }

    /// Client used by sandbox `fetch`.
    #[must_use]
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Sandbox limits.
    #[must_use]
    pub fn sandbox_config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Environment source for whitelisted variables. Defaults to the process
    /// environment.
    #[must_use]
    pub fn env_lookup(mut self, env: EnvLookup) -> Self {
        self.env = Some(env);
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> ExtensionManager {
        let bus = self.bus.unwrap_or_default();
        let registry = Arc::new(ExtensionRegistry::new());
        let mut executor = SandboxExecutor::new(self.config, bus.clone());
        if let Some(data) = self.data {
            executor = executor.with_data_access(data);
        }
        if let Some(http) = self.http {
            executor = executor.with_http_client(http);
        }
        ExtensionManager {
            dir: self.dir,
            mount: Arc::new(RouteMount::new(Arc::clone(&registry))),
            registry,
            transpiler: Arc::new(SourceTranspiler::new()),
            executor,
            bus,
            env: self
                .env
                .unwrap_or_else(|| Arc::new(|name: &str| std::env::var(name).ok())),
        }
    }
}

/// Drives extensions through their lifecycle.
///
/// Operations on one id are serialized through the registry's per-id lock;
/// operations on different ids run independently.
pub struct ExtensionManager {
    dir: PathBuf,
    registry: Arc<ExtensionRegistry>,
    mount: Arc<RouteMount>,
    transpiler: Arc<SourceTranspiler>,
    executor: SandboxExecutor,
    bus: EventBus,
    env: EnvLookup,
}

impl ExtensionManager {
    /// Manager for extensions living under `dir`.
    #[must_use]
    pub fn builder(dir: impl Into<PathBuf>) -> ExtensionManagerBuilder {
        ExtensionManagerBuilder {
            dir: dir.into(),
            bus: None,
            data: None,
            http: None,
            config: SandboxConfig::default(),
            env: None,
        }
    }

    /// Extensions directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    /// The event bus shared with every sandbox.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The compile cache.
    #[must_use]
    pub fn transpiler(&self) -> &SourceTranspiler {
        &self.transpiler
    }

    /// Router serving every extension under [`EXTENSIONS_PREFIX`].
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new().nest(EXTENSIONS_PREFIX, self.mount.dispatcher())
    }

    /// Every known extension, loaded or not.
    #[must_use]
    pub fn list(&self) -> Vec<ExtensionSummary> {
        self.registry.list()
    }

    /// Load the extension in `<dir>/<id>`.
    ///
    /// # Errors
    ///
    /// [`ExtensionError::AlreadyLoaded`] if it is active,
    /// [`ExtensionError::NotFound`] if its directory is missing, otherwise
    /// whatever stage of the pipeline failed. The extension is then `Failed`.
    pub async fn load(&self, id: &ExtensionId) -> ExtensionResult<Arc<LoadedExtension>> {
        let _guard = self.registry.lock(id).await;
        self.load_locked(id).await
    }

    /// Tear down an active extension.
    ///
    /// # Errors
    ///
    /// [`ExtensionError::NotFound`] if it is not loaded. Cleanup failures are
    /// logged, not returned.
    pub async fn unload(&self, id: &ExtensionId) -> ExtensionResult<()> {
        let _guard = self.registry.lock(id).await;
        self.unload_locked(id).await
    }

    /// Unload (if loaded) and load again from fresh source.
    ///
    /// # Errors
    ///
    /// Whatever the new load attempt fails with.
    pub async fn reload(&self, id: &ExtensionId) -> ExtensionResult<Arc<LoadedExtension>> {
        let _guard = self.registry.lock(id).await;
        let dir = self.dir.join(id.as_str());
        let dropped = self
            .transpiler
            .invalidate_dir(&dir.canonicalize().unwrap_or(dir));
        debug!(extension_id = %id, dropped, "Invalidated compile cache");
        if self.registry.contains(id) {
            self.unload_locked(id).await?;
        }
        self.load_locked(id).await
    }

    /// Discover and load every extension, dependencies first.
    ///
    /// One extension failing never stops the pass.
    ///
    /// # Errors
    ///
    /// Only if the extensions directory itself cannot be read.
    pub async fn load_all(&self) -> ExtensionResult<DiscoveryReport> {
        let mut report = DiscoveryReport::default();
        for found in discover(&self.dir)? {
            match self.load(&found.id).await {
                Ok(_) | Err(ExtensionError::AlreadyLoaded(_)) => report.loaded.push(found.id),
                Err(e) => report.failed.push((found.id, e)),
            }
        }
        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Discovery pass complete"
        );
        Ok(report)
    }

    /// Unload everything, most recently loaded first.
    pub async fn unload_all(&self) {
        let mut loaded: Vec<Arc<LoadedExtension>> = self
            .registry
            .ids()
            .iter()
            .filter_map(|id| self.registry.get(id))
            .collect();
        loaded.sort_by_key(|ext| std::cmp::Reverse(ext.loaded_at()));
        for ext in loaded {
            if let Err(e) = self.unload(ext.id()).await {
                warn!(extension_id = %ext.id(), error = %e, "Unload failed during shutdown");
            }
        }
    }

    async fn load_locked(&self, id: &ExtensionId) -> ExtensionResult<Arc<LoadedExtension>> {
        if self.registry.contains(id) {
            return Err(ExtensionError::AlreadyLoaded(id.clone()));
        }
        let dir = self.dir.join(id.as_str());
        if !dir.is_dir() {
            return Err(ExtensionError::NotFound(id.clone()));
        }

        self.registry.transition(id, ExtensionState::Discovered)?;
        match self.run_pipeline(id, &dir).await {
            Ok(extension) => Ok(extension),
            Err(e) => {
                warn!(extension_id = %id, kind = e.kind(), error = %e, "Extension failed to load");
                self.bus.registry().unregister_owner(id.as_str());
                if let Err(te) = self
                    .registry
                    .transition(id, ExtensionState::Failed(e.to_string()))
                {
                    warn!(extension_id = %id, error = %te, "Could not record failure");
                }
                Err(e)
            },
        }
    }

    async fn run_pipeline(
        &self,
        id: &ExtensionId,
        dir: &Path,
    ) -> ExtensionResult<Arc<LoadedExtension>> {
        self.registry.transition(id, ExtensionState::Validating)?;
        let manifest = load_manifest(dir)?;
        for dependency in &manifest.dependencies {
            let active = ExtensionId::new(dependency.clone())
                .is_ok_and(|dep| self.registry.is_active(&dep));
            if !active {
                return Err(ExtensionError::DependencyUnavailable {
                    id: id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        self.registry.transition(id, ExtensionState::Compiling)?;
        let entry = FsScope::new(dir)?.resolve(&manifest.index)?;
        if !entry.is_file() {
            return Err(ExtensionError::EntryNotFound(entry));
        }
        let transpiler = Arc::clone(&self.transpiler);
        let path = entry.clone();
        let compiled = tokio::task::spawn_blocking(move || transpiler.compile(&path))
            .await
            .map_err(|e| ExtensionError::CompileError {
                path: entry.clone(),
                message: e.to_string(),
            })??;
        debug!(
            extension_id = %id,
            from_cache = compiled.from_cache,
            hash = %compiled.source_hash,
            "Compiled entry"
        );

        let grant = Arc::new(CapabilityGrant::from_manifest(
            id,
            &manifest,
            dir,
            self.env.as_ref(),
        )?);
        let booting = self
            .executor
            .launch(LaunchSpec {
                id: id.clone(),
                name: manifest.name.clone(),
                manifest: manifest.to_json(),
                grant: Arc::clone(&grant),
                code: Arc::clone(&compiled.code),
                entry,
            })
            .await?;
        if let Err(e) = self.registry.transition(id, ExtensionState::Sandboxed) {
            booting.abort().await;
            return Err(e);
        }

        let (sandbox, exports) = booting.initialize().await?;
        let extension = Arc::new(LoadedExtension::new(
            id.clone(),
            manifest,
            dir.to_path_buf(),
            grant,
            Arc::new(sandbox),
            exports,
            compiled.source_hash,
        ));

        // Mounted routes stay unreachable until the registry reports Active.
        let activated = self
            .mount
            .mount(Arc::clone(&extension))
            .and_then(|()| self.activate(&extension));
        if let Err(e) = activated {
            self.mount.unmount(id);
            self.registry.remove(id);
            extension.sandbox().shutdown().await;
            return Err(e);
        }

        self.bus
            .publish(Event::extension_loaded(id.as_str(), extension.manifest().to_json()));
        info!(
            extension_id = %id,
            version = %extension.manifest().version,
            routes = extension.exports().routes.len(),
            prefix = %crate::routes::prefix_for(id),
            "Extension loaded"
        );
        Ok(extension)
    }

    fn activate(&self, extension: &Arc<LoadedExtension>) -> ExtensionResult<()> {
        self.registry.insert(Arc::clone(extension));
        self.registry.transition(extension.id(), ExtensionState::Active)?;
        extension.activate();
        Ok(())
    }

    async fn unload_locked(&self, id: &ExtensionId) -> ExtensionResult<()> {
        let Some(extension) = self.registry.get(id) else {
            return Err(ExtensionError::NotFound(id.clone()));
        };
        extension.deactivate();

        if extension.exports().has_cleanup {
            if let Err(e) = extension.sandbox().cleanup().await {
                warn!(extension_id = %id, error = %e, "Cleanup failed");
            }
        }

        let subscriptions = self.bus.registry().unregister_owner(id.as_str());
        self.mount.unmount(id);
        self.registry.remove(id);
        extension.sandbox().shutdown().await;
        self.registry.transition(id, ExtensionState::Unloaded)?;

        self.bus.publish(Event::extension_unloaded(id.as_str()));
        info!(extension_id = %id, subscriptions, "Extension unloaded");
        Ok(())
    }
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("dir", &self.dir)
            .field("registry", &self.registry)
            .field("mount", &self.mount)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::sandbox::HandlerRequest;

    fn hello(dir: &Path) -> ExtensionId {
        let ext = dir.join("Hello");
        std::fs::create_dir(&ext).unwrap();
        std::fs::write(
            ext.join("manifest.json"),
            r#"{"version":"1.0.0","author":"a","index":"index.js"}"#,
        )
        .unwrap();
        std::fs::write(
            ext.join("index.js"),
            r#"export function init(u) { u.app.get("/", () => ({ hello: "world" })); }"#,
        )
        .unwrap();
        ExtensionId::from_static("Hello")
    }

    async fn status(manager: &ExtensionManager, uri: &str) -> StatusCode {
        manager
            .router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_missing_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ExtensionManager::builder(dir.path()).build();
        let err = manager
            .load(&ExtensionId::from_static("Nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::NotFound(_)));
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_unload_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ExtensionManager::builder(dir.path()).build();
        let err = manager
            .unload(&ExtensionId::from_static("Nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_empty_discovery_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ExtensionManager::builder(dir.path()).build();
        let report = manager.load_all().await.unwrap();
        assert!(report.is_clean());
        assert!(report.loaded.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_manifest_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let ext = dir.path().join("Broken");
        std::fs::create_dir(&ext).unwrap();
        std::fs::write(ext.join("manifest.json"), r#"{"author":"a","index":"index.js"}"#)
            .unwrap();

        let manager = ExtensionManager::builder(dir.path()).build();
        let id = ExtensionId::from_static("Broken");
        let err = manager.load(&id).await.unwrap_err();
        assert!(matches!(err, ExtensionError::ManifestInvalid { .. }));
        assert!(matches!(
            manager.registry().state(&id),
            Some(ExtensionState::Failed(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_routes_follow_registry_state() {
        let dir = tempfile::tempdir().unwrap();
        let id = hello(dir.path());
        let manager = ExtensionManager::builder(dir.path()).build();
        manager.load(&id).await.unwrap();
        assert_eq!(status(&manager, "/extensions/hello").await, StatusCode::OK);

        // Still mounted, but no longer in the registry.
        let removed = manager.registry.remove(&id).unwrap();
        assert!(manager.mount.is_mounted(&id));
        assert_eq!(status(&manager, "/extensions/hello").await, StatusCode::NOT_FOUND);
        removed.sandbox().shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reload_leaves_old_sandbox_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let id = hello(dir.path());
        let manager = ExtensionManager::builder(dir.path()).build();
        let first = manager.load(&id).await.unwrap();
        let old = Arc::clone(first.sandbox());

        let second = manager.reload(&id).await.unwrap();
        assert!(!Arc::ptr_eq(&old, second.sandbox()));

        let err = old.dispatch(0, HandlerRequest::default()).await.unwrap_err();
        assert!(matches!(err, ExtensionError::SandboxUnavailable { .. }), "{err}");
        let fresh = second
            .sandbox()
            .dispatch(0, HandlerRequest::default())
            .await
            .unwrap();
        assert_eq!(fresh.status, 200);
        manager.unload_all().await;
    }
}
