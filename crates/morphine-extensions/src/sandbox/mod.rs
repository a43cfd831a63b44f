//! Isolated execution of extension code.
//!
//! Each extension runs in its own `QuickJS` runtime on a dedicated worker
//! thread. The worker owns the runtime outright; the host talks to it only
//! through a command channel and never touches JS values directly. The
//! runtime's globals are assembled from a [`CapabilityGrant`]: anything the
//! grant withholds (network, timers) is absent rather than guarded.
//!
//! Every synchronous entry into JS (the initial run, each job, each
//! handler, timer or event delivery) is bounded by the turn budget through
//! the engine's interrupt hook. Async work is bounded separately on the host
//! side by the init and handler timeouts.

mod budget;
mod host;
mod protocol;
mod timers;
mod worker;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use morphine_events::EventBus;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::capabilities::CapabilityGrant;
use crate::data::{DataAccess, UnavailableDataAccess};
use crate::error::{ExtensionError, ExtensionResult};
use crate::extension::ExtensionId;

pub use protocol::{
    ExportSurface, HandlerRequest, HandlerResponse, ResponseKind, RouteMethod, RouteSpec,
    StaticMount,
};

pub(crate) use protocol::Command;

/// Native stack reserved for each worker thread.
const WORKER_STACK_SIZE: usize = 4_194_304;

/// Limits applied to every sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Budget for each synchronous entry into JS.
    pub turn_timeout: Duration,
    /// Bound on the module run and initializer promises. `None` waits forever.
    pub init_timeout: Option<Duration>,
    /// Bound on a request handler, including its async work.
    pub handler_timeout: Duration,
    /// Bound on the cleanup export during unload.
    pub cleanup_timeout: Duration,
    /// Heap limit in bytes.
    pub memory_limit: usize,
    /// JS stack limit in bytes.
    pub max_stack_size: usize,
    /// Default URL prefix for `mountStatic`.
    pub static_prefix: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(2),
            init_timeout: Some(Duration::from_secs(10)),
            handler_timeout: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(5),
            memory_limit: 67_108_864,
            max_stack_size: 1_048_576,
            static_prefix: "/static".to_owned(),
        }
    }
}

/// What to run in a new sandbox.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Extension id.
    pub id: ExtensionId,
    /// Display name used to tag log lines.
    pub name: String,
    /// Manifest as JSON, exposed as `extension.manifest`.
    pub manifest: Value,
    /// Capability snapshot.
    pub grant: Arc<CapabilityGrant>,
    /// Compiled entry code.
    pub code: Arc<str>,
    /// Entry file the code was compiled from.
    pub entry: PathBuf,
}

/// Builds sandboxes. Shared host services are injected once here.
#[derive(Clone)]
pub struct SandboxExecutor {
    config: SandboxConfig,
    bus: EventBus,
    data: Arc<dyn DataAccess>,
    http: reqwest::Client,
}

impl SandboxExecutor {
    /// Executor publishing on `bus` with no data access.
    #[must_use]
    pub fn new(config: SandboxConfig, bus: EventBus) -> Self {
        Self {
            config,
            bus,
            data: Arc::new(UnavailableDataAccess),
            http: reqwest::Client::new(),
        }
    }

    /// Use `data` for `utils.db`.
    #[must_use]
    pub fn with_data_access(mut self, data: Arc<dyn DataAccess>) -> Self {
        self.data = data;
        self
    }

    /// Use `client` for `fetch`.
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Sandbox limits.
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Start a worker, run the compiled module and locate its initializer.
    ///
    /// Returns once the module body has finished; the initializer has been
    /// started but not necessarily settled. Await
    /// [`BootingSandbox::initialize`] for that.
    ///
    /// # Errors
    ///
    /// - [`ExtensionError::SandboxTimeout`] if the run exceeds its budget
    /// - [`ExtensionError::ExecutionFailed`] if the module throws
    /// - [`ExtensionError::EntrypointMissing`] / [`ExtensionError::EntrypointAmbiguous`]
    /// - [`ExtensionError::SandboxUnavailable`] if the worker cannot start
    pub async fn launch(&self, spec: LaunchSpec) -> ExtensionResult<BootingSandbox> {
        let id = spec.id.clone();
        let unavailable = |message: String| ExtensionError::SandboxUnavailable {
            id: id.clone(),
            message,
        };
        let handle = tokio::runtime::Handle::try_current().map_err(|e| unavailable(e.to_string()))?;

        let (tx, rx) = std::sync::mpsc::channel();
        let (executed_tx, executed_rx) = oneshot::channel();
        let (initialized_tx, initialized_rx) = oneshot::channel();

        let boot = worker::Boot {
            spec,
            config: self.config.clone(),
            bus: self.bus.clone(),
            data: Arc::clone(&self.data),
            http: self.http.clone(),
            handle,
            commands: rx,
            sender: tx.clone(),
            executed: executed_tx,
            initialized: initialized_tx,
        };
        let thread = std::thread::Builder::new()
            .name(format!("ext-{id}"))
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || worker::run(boot))
            .map_err(|e| unavailable(e.to_string()))?;

        let sandbox = Sandbox {
            id: id.clone(),
            commands: tx,
            thread: Mutex::new(Some(thread)),
            handler_timeout: self.config.handler_timeout,
            cleanup_timeout: self.config.cleanup_timeout,
        };

        let executed = match bounded(executed_rx, self.config.init_timeout, &id, "run").await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(unavailable("worker exited during run".into())),
            Err(e) => Err(e),
        };
        let has_cleanup = match executed {
            Ok(has_cleanup) => has_cleanup,
            Err(e) => {
                sandbox.shutdown().await;
                return Err(e);
            },
        };
        debug!(extension_id = %id, has_cleanup, "Module executed");

        Ok(BootingSandbox {
            sandbox,
            initialized: initialized_rx,
            has_cleanup,
            init_timeout: self.config.init_timeout,
        })
    }
}

impl std::fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Await `rx`, optionally bounded. The outer error is the timeout.
async fn bounded<T>(
    rx: oneshot::Receiver<T>,
    limit: Option<Duration>,
    id: &ExtensionId,
    phase: &'static str,
) -> ExtensionResult<Result<T, oneshot::error::RecvError>> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, rx)
            .await
            .map_err(|_| ExtensionError::SandboxTimeout {
                id: id.clone(),
                phase,
                limit_ms: millis(limit),
            }),
        None => Ok(rx.await),
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A sandbox whose module has run and whose initializer is in flight.
#[derive(Debug)]
pub struct BootingSandbox {
    sandbox: Sandbox,
    initialized: oneshot::Receiver<ExtensionResult<ExportSurface>>,
    has_cleanup: bool,
    init_timeout: Option<Duration>,
}

impl BootingSandbox {
    /// Wait for the initializer to settle.
    ///
    /// On failure the worker is stopped and joined before this returns, so
    /// nothing it registered outlives the attempt.
    ///
    /// # Errors
    ///
    /// [`ExtensionError::SandboxTimeout`] if the initializer does not settle
    /// within the init timeout or spins past the turn budget,
    /// [`ExtensionError::ExecutionFailed`] if it throws or rejects.
    pub async fn initialize(self) -> ExtensionResult<(Sandbox, ExportSurface)> {
        let Self {
            sandbox,
            initialized,
            has_cleanup,
            init_timeout,
        } = self;
        let id = sandbox.id.clone();
        let outcome = match bounded(initialized, init_timeout, &id, "init").await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExtensionError::SandboxUnavailable {
                id: id.clone(),
                message: "worker exited during init".into(),
            }),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(mut exports) => {
                exports.has_cleanup = has_cleanup;
                Ok((sandbox, exports))
            },
            Err(e) => {
                sandbox.shutdown().await;
                Err(e)
            },
        }
    }

    /// Give up on the sandbox and wait for its worker to exit.
    pub async fn abort(self) {
        self.sandbox.shutdown().await;
    }
}

/// Host-side handle to a running sandbox.
///
/// Dropping the handle stops the worker.
pub struct Sandbox {
    id: ExtensionId,
    commands: std::sync::mpsc::Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    handler_timeout: Duration,
    cleanup_timeout: Duration,
}

impl Sandbox {
    /// Extension this sandbox runs.
    #[must_use]
    pub fn id(&self) -> &ExtensionId {
        &self.id
    }

    /// Run the handler registered as route `route`.
    ///
    /// # Errors
    ///
    /// [`ExtensionError::SandboxTimeout`] past the handler timeout,
    /// [`ExtensionError::ExecutionFailed`] if the handler throws,
    /// [`ExtensionError::SandboxUnavailable`] if the worker is gone.
    pub async fn dispatch(
        &self,
        route: u32,
        request: HandlerRequest,
    ) -> ExtensionResult<HandlerResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Dispatch {
            route,
            request,
            reply,
        })?;
        let outcome = bounded(rx, Some(self.handler_timeout), &self.id, "handler").await?;
        outcome.map_err(|_| self.gone())?
    }

    /// Await the cleanup export, if any, bounded by the cleanup timeout.
    ///
    /// # Errors
    ///
    /// [`ExtensionError::CleanupFailed`] if it throws, rejects, or times out.
    pub async fn cleanup(&self) -> ExtensionResult<()> {
        let failed = |message: String| ExtensionError::CleanupFailed {
            id: self.id.clone(),
            message,
        };
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cleanup { reply })
            .map_err(|e| failed(e.to_string()))?;
        match bounded(rx, Some(self.cleanup_timeout), &self.id, "cleanup").await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(failed("worker exited".into())),
            Err(e) => Err(failed(e.to_string())),
        }
    }

    /// Stop the worker and wait for it to release the runtime.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let thread = self.thread.lock().ok().and_then(|mut guard| guard.take());
        if let Some(thread) = thread {
            let id = self.id.clone();
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!(extension_id = %id, "Sandbox worker did not exit cleanly");
            }
        }
    }

    pub(crate) fn send(&self, command: Command) -> ExtensionResult<()> {
        self.commands.send(command).map_err(|_| self.gone())
    }

    fn gone(&self) -> ExtensionError {
        ExtensionError::SandboxUnavailable {
            id: self.id.clone(),
            message: "sandbox worker has stopped".into(),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("handler_timeout", &self.handler_timeout)
            .finish_non_exhaustive()
    }
}
