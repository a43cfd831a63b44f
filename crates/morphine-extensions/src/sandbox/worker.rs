//! The sandbox worker thread.
//!
//! Owns the `QuickJS` runtime for one extension. Every entry into JS is a
//! budgeted turn; after each turn the job queue is drained and host-visible
//! tasks are polled so waiting callers can be answered.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::Instant;

use morphine_events::EventBus;
use rquickjs::{CatchResultExt, Context, Ctx, Function, Object, Persistent, Runtime};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use super::budget::Budget;
use super::host::{self, HostState};
use super::protocol::{Command, ExportSurface, HandlerRequest, HandlerResponse};
use super::{LaunchSpec, SandboxConfig, millis};
use crate::data::DataAccess;
use crate::error::{ExtensionError, ExtensionResult};
use crate::extension::ExtensionId;

const SHIM_SOURCE: &str = include_str!("shim.js");

/// Everything a worker needs, moved onto its thread.
pub(crate) struct Boot {
    pub(crate) spec: LaunchSpec,
    pub(crate) config: SandboxConfig,
    pub(crate) bus: EventBus,
    pub(crate) data: Arc<dyn DataAccess>,
    pub(crate) http: reqwest::Client,
    pub(crate) handle: Handle,
    pub(crate) commands: Receiver<Command>,
    pub(crate) sender: Sender<Command>,
    pub(crate) executed: oneshot::Sender<ExtensionResult<bool>>,
    pub(crate) initialized: oneshot::Sender<ExtensionResult<ExportSurface>>,
}

/// Thread entry point.
pub(crate) fn run(boot: Boot) {
    let Boot {
        spec,
        config,
        bus,
        data,
        http,
        handle,
        commands,
        sender,
        executed,
        initialized,
    } = boot;
    let id = spec.id.clone();

    let state = Rc::new(HostState::new(
        spec.id.clone(),
        spec.name.clone(),
        Arc::clone(&spec.grant),
        bus,
        data,
        http,
        handle,
        sender,
    ));
    let mut worker = match Worker::new(state, config) {
        Ok(worker) => worker,
        Err(e) => {
            error!(extension_id = %id, error = %e, "Failed to create sandbox runtime");
            let _ = executed.send(Err(e));
            return;
        },
    };

    match worker.start(&spec) {
        Ok(task) => {
            worker.waiters.insert(task, Waiter::Run(executed));
            worker.pending_init = Some(initialized);
            worker.pump();
            worker.serve(&commands);
        },
        Err(e) => {
            let _ = executed.send(Err(e));
        },
    }
    worker.teardown();
}

/// Caller waiting on a JS task.
enum Waiter {
    Run(oneshot::Sender<ExtensionResult<bool>>),
    Init(oneshot::Sender<ExtensionResult<ExportSurface>>),
    Dispatch(oneshot::Sender<ExtensionResult<HandlerResponse>>),
    Cleanup(oneshot::Sender<ExtensionResult<()>>),
}

impl Waiter {
    fn is_closed(&self) -> bool {
        match self {
            Self::Run(tx) => tx.is_closed(),
            Self::Init(tx) => tx.is_closed(),
            Self::Dispatch(tx) => tx.is_closed(),
            Self::Cleanup(tx) => tx.is_closed(),
        }
    }

    fn is_boot(&self) -> bool {
        matches!(self, Self::Run(_) | Self::Init(_))
    }

    fn fail(self, err: ExtensionError) {
        match self {
            Self::Run(tx) => {
                let _ = tx.send(Err(err));
            },
            Self::Init(tx) => {
                let _ = tx.send(Err(err));
            },
            Self::Dispatch(tx) => {
                let _ = tx.send(Err(err));
            },
            Self::Cleanup(tx) => {
                let _ = tx.send(Err(err));
            },
        }
    }
}

/// Settled task as reported by the shim's `takeTask`.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum TaskOutcome {
    Resolved {
        #[serde(default)]
        value: Value,
    },
    Rejected {
        #[serde(default)]
        error: String,
    },
}

/// What the module body exposed, as located by the shim.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Located {
    has_init: bool,
    has_cleanup: bool,
    ambiguous: Option<String>,
}

/// Why a turn did not complete.
enum TurnError {
    Interrupted,
    Thrown(String),
}

struct Worker {
    id: ExtensionId,
    config: SandboxConfig,
    state: Rc<HostState>,
    budget: Budget,
    waiters: HashMap<u32, Waiter>,
    pending_init: Option<oneshot::Sender<ExtensionResult<ExportSurface>>>,
    next_task: u32,
    // Drop order matters: the shim handle, then the context, then the runtime.
    shim: Option<Persistent<Object<'static>>>,
    context: Context,
    runtime: Runtime,
}

impl Worker {
    fn new(state: Rc<HostState>, config: SandboxConfig) -> ExtensionResult<Self> {
        let id = state.id.clone();
        let unavailable = |e: rquickjs::Error| ExtensionError::SandboxUnavailable {
            id: id.clone(),
            message: e.to_string(),
        };

        let runtime = Runtime::new().map_err(unavailable)?;
        runtime.set_memory_limit(config.memory_limit);
        runtime.set_max_stack_size(config.max_stack_size);
        let budget = Budget::default();
        let hook = budget.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || hook.should_interrupt())));
        let context = Context::full(&runtime).map_err(unavailable)?;

        Ok(Self {
            id,
            config,
            state,
            budget,
            waiters: HashMap::new(),
            pending_init: None,
            next_task: 1,
            shim: None,
            context,
            runtime,
        })
    }

    /// Install the shim, evaluate the wrapped module and start running it.
    fn start(&mut self, spec: &LaunchSpec) -> ExtensionResult<u32> {
        let grant = grant_json(spec, &self.config);
        let state = Rc::clone(&self.state);
        let installed = {
            let _guard = self.budget.arm(self.config.turn_timeout);
            self.context.with(|ctx| {
                let run = || -> rquickjs::Result<Persistent<Object<'static>>> {
                    let factory: Function = ctx.eval(SHIM_SOURCE)?;
                    let host = host::install(&ctx, &state)?;
                    let grant = ctx.json_parse(grant)?;
                    let shim: Object = factory.call((host, grant))?;
                    Ok(Persistent::save(&ctx, shim))
                };
                run().catch(&ctx).map_err(|e| e.to_string())
            })
        };
        self.shim = Some(installed.map_err(|message| ExtensionError::SandboxUnavailable {
            id: self.id.clone(),
            message,
        })?);

        let wrapped = wrap_module(&spec.code);
        let compiled = {
            let _guard = self.budget.arm(self.config.turn_timeout);
            self.context.with(|ctx| {
                let factory: rquickjs::Result<Function> = ctx.eval(wrapped);
                factory
                    .map(|f| Persistent::save(&ctx, f))
                    .catch(&ctx)
                    .map_err(|e| e.to_string())
            })
        };
        let factory = compiled.map_err(|message| ExtensionError::CompileError {
            path: spec.entry.clone(),
            message,
        })?;

        let task = self.next_task();
        self.turn(move |ctx, shim| {
            let factory = factory.restore(ctx)?;
            shim.get::<_, Function>("run")?.call::<_, ()>((task, factory))
        })
        .map_err(|e| self.turn_error(e, "run"))?;
        debug!(extension_id = %self.id, "Module started");
        Ok(task)
    }

    fn next_task(&mut self) -> u32 {
        let task = self.next_task;
        self.next_task = self.next_task.wrapping_add(1);
        task
    }

    /// Run `f` against the shim under the turn budget.
    fn turn<R>(
        &self,
        f: impl for<'js> FnOnce(&Ctx<'js>, Object<'js>) -> rquickjs::Result<R>,
    ) -> Result<R, TurnError> {
        let Some(shim) = self.shim.clone() else {
            return Err(TurnError::Thrown("sandbox shim is not installed".into()));
        };
        let guard = self.budget.arm(self.config.turn_timeout);
        let result = self.context.with(|ctx| {
            let run = || -> rquickjs::Result<R> {
                let shim = shim.restore(&ctx)?;
                f(&ctx, shim)
            };
            run().catch(&ctx).map_err(|e| e.to_string())
        });
        let tripped = guard.tripped();
        drop(guard);
        match result {
            Ok(value) => Ok(value),
            Err(_) if tripped => Err(TurnError::Interrupted),
            Err(message) => Err(TurnError::Thrown(message)),
        }
    }

    fn turn_error(&self, err: TurnError, phase: &'static str) -> ExtensionError {
        match err {
            TurnError::Interrupted => self.timeout(phase),
            TurnError::Thrown(message) => ExtensionError::ExecutionFailed {
                id: self.id.clone(),
                message,
            },
        }
    }

    fn timeout(&self, phase: &'static str) -> ExtensionError {
        ExtensionError::SandboxTimeout {
            id: self.id.clone(),
            phase,
            limit_ms: millis(self.config.turn_timeout),
        }
    }

    /// Drain the job queue and settle finished tasks until neither makes
    /// progress. Settling a task can start another (run → init).
    fn pump(&mut self) {
        loop {
            self.drain_jobs();
            let settled = self.poll_tasks();
            if !settled && !self.runtime.is_job_pending() {
                break;
            }
        }
    }

    fn drain_jobs(&mut self) {
        loop {
            let guard = self.budget.arm(self.config.turn_timeout);
            let step = self.runtime.execute_pending_job();
            let tripped = guard.tripped();
            drop(guard);
            match step {
                Ok(true) => {},
                Ok(false) => break,
                Err(_) if tripped => {
                    let message = self.take_exception();
                    warn!(
                        extension_id = %self.id,
                        error = %message,
                        "Pending job exceeded the turn budget"
                    );
                    self.fail_all("job");
                },
                Err(_) => {
                    let message = self.take_exception();
                    error!(extension_id = %self.id, error = %message, "Uncaught error in pending job");
                },
            }
        }
    }

    /// Clear the pending exception left by a failed job.
    fn take_exception(&self) -> String {
        self.context.with(|ctx| {
            let pending: rquickjs::Result<()> = Err(rquickjs::Error::Exception);
            pending
                .catch(&ctx)
                .err()
                .map(|e| e.to_string())
                .unwrap_or_default()
        })
    }

    /// An interrupted job leaves its promise unsettled; fail whoever waits.
    fn fail_all(&mut self, phase: &'static str) {
        let ids: Vec<u32> = self.waiters.keys().copied().collect();
        for task in ids {
            if let Some(waiter) = self.waiters.remove(&task) {
                if waiter.is_boot() {
                    self.pending_init = None;
                }
                waiter.fail(self.timeout(phase));
                self.drop_task(task);
            }
        }
    }

    fn drop_task(&self, task: u32) {
        let _ = self.turn(move |_, shim| shim.get::<_, Function>("dropTask")?.call::<_, ()>((task,)));
    }

    /// Returns whether any waiter was answered.
    fn poll_tasks(&mut self) -> bool {
        let mut settled = false;
        let ids: Vec<u32> = self.waiters.keys().copied().collect();
        for task in ids {
            if self.waiters.get(&task).is_some_and(Waiter::is_closed) {
                trace!(extension_id = %self.id, task, "Caller gone, dropping task");
                self.waiters.remove(&task);
                self.drop_task(task);
                continue;
            }
            let taken = self.turn(move |_, shim| {
                shim.get::<_, Function>("takeTask")?
                    .call::<_, Option<String>>((task,))
            });
            let outcome = match taken {
                Ok(None) => continue,
                Ok(Some(json)) => serde_json::from_str::<TaskOutcome>(&json).unwrap_or_else(|e| {
                    TaskOutcome::Rejected {
                        error: format!("malformed task state: {e}"),
                    }
                }),
                Err(e) => TaskOutcome::Rejected {
                    error: match e {
                        TurnError::Interrupted => "task poll interrupted".into(),
                        TurnError::Thrown(message) => message,
                    },
                },
            };
            if let Some(waiter) = self.waiters.remove(&task) {
                self.settle(waiter, outcome);
                settled = true;
            }
        }
        settled
    }

    fn settle(&mut self, waiter: Waiter, outcome: TaskOutcome) {
        let failed = |message: String| ExtensionError::ExecutionFailed {
            id: self.id.clone(),
            message,
        };
        match (waiter, outcome) {
            (Waiter::Run(tx), TaskOutcome::Resolved { value }) => {
                match self.locate(value) {
                    Ok(has_cleanup) => {
                        let _ = tx.send(Ok(has_cleanup));
                        self.start_init();
                    },
                    Err(e) => {
                        self.pending_init = None;
                        let _ = tx.send(Err(e));
                    },
                }
            },
            (Waiter::Init(tx), TaskOutcome::Resolved { .. }) => {
                let (routes, statics) = self.state.seal();
                info!(
                    extension_id = %self.id,
                    routes = routes.len(),
                    statics = statics.len(),
                    "Extension initialized"
                );
                let _ = tx.send(Ok(ExportSurface {
                    has_cleanup: false,
                    routes,
                    statics,
                }));
            },
            (Waiter::Dispatch(tx), TaskOutcome::Resolved { value }) => {
                let response = serde_json::from_value::<HandlerResponse>(value)
                    .map_err(|e| failed(format!("unexpected handler result: {e}")));
                let _ = tx.send(response);
            },
            (Waiter::Cleanup(tx), TaskOutcome::Resolved { .. }) => {
                let _ = tx.send(Ok(()));
            },
            (Waiter::Cleanup(tx), TaskOutcome::Rejected { error }) => {
                let _ = tx.send(Err(ExtensionError::CleanupFailed {
                    id: self.id.clone(),
                    message: error,
                }));
            },
            (waiter, TaskOutcome::Rejected { error }) => {
                if waiter.is_boot() {
                    self.pending_init = None;
                }
                waiter.fail(failed(error));
            },
        }
    }

    /// Check what the module body exposed. Returns whether cleanup exists.
    fn locate(&self, value: Value) -> ExtensionResult<bool> {
        let located: Located =
            serde_json::from_value(value).map_err(|e| ExtensionError::ExecutionFailed {
                id: self.id.clone(),
                message: format!("unexpected module result: {e}"),
            })?;
        match located.ambiguous.as_deref() {
            Some("cleanup") => {
                return Err(ExtensionError::EntrypointAmbiguous {
                    id: self.id.clone(),
                    export: "cleanup",
                });
            },
            Some(_) => {
                return Err(ExtensionError::EntrypointAmbiguous {
                    id: self.id.clone(),
                    export: "init",
                });
            },
            None => {},
        }
        if !located.has_init {
            return Err(ExtensionError::EntrypointMissing(self.id.clone()));
        }
        Ok(located.has_cleanup)
    }

    fn start_init(&mut self) {
        let Some(reply) = self.pending_init.take() else {
            return;
        };
        let task = self.next_task();
        match self.turn(move |_, shim| shim.get::<_, Function>("init")?.call::<_, ()>((task,))) {
            Ok(()) => {
                self.waiters.insert(task, Waiter::Init(reply));
            },
            Err(e) => {
                let _ = reply.send(Err(self.turn_error(e, "init")));
            },
        }
    }

    fn serve(&mut self, commands: &Receiver<Command>) {
        loop {
            self.fire_due_timers();
            let next_due = self.state.timers.borrow().next_due();
            let received = match next_due {
                Some(due) => commands.recv_timeout(due.saturating_duration_since(Instant::now())),
                None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {},
            }
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        loop {
            let Some(timer) = self.state.timers.borrow_mut().pop_due(now) else {
                break;
            };
            let fired = self.turn(move |_, shim| {
                shim.get::<_, Function>("fireTimer")?.call::<_, ()>((timer,))
            });
            match fired {
                Ok(()) => {},
                Err(TurnError::Interrupted) => {
                    warn!(extension_id = %self.id, timer, "Timer callback exceeded the turn budget");
                },
                Err(TurnError::Thrown(message)) => {
                    error!(extension_id = %self.id, timer, error = %message, "Timer callback failed");
                },
            }
            self.pump();
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Dispatch {
                route,
                request,
                reply,
            } => self.dispatch(route, &request, reply),
            Command::Deliver {
                handler,
                event_type,
                detail,
            } => {
                let detail = detail.to_string();
                let delivered = self.turn(move |_, shim| {
                    shim.get::<_, Function>("deliver")?
                        .call::<_, ()>((handler, event_type, detail))
                });
                match delivered {
                    Ok(()) => {},
                    Err(TurnError::Interrupted) => {
                        warn!(extension_id = %self.id, "Event handler exceeded the turn budget");
                    },
                    Err(TurnError::Thrown(message)) => {
                        error!(extension_id = %self.id, error = %message, "Event handler failed");
                    },
                }
            },
            Command::Complete { call, outcome } => {
                let (ok, data) = match outcome {
                    Ok(value) => (true, value.to_string()),
                    Err(message) => (false, message),
                };
                if let Err(TurnError::Thrown(message)) = self.turn(move |_, shim| {
                    shim.get::<_, Function>("complete")?
                        .call::<_, ()>((call, ok, data))
                }) {
                    warn!(extension_id = %self.id, call, error = %message, "Failed to settle host call");
                }
            },
            Command::Cleanup { reply } => {
                let task = self.next_task();
                match self.turn(move |_, shim| {
                    shim.get::<_, Function>("cleanup")?.call::<_, ()>((task,))
                }) {
                    Ok(()) => {
                        self.waiters.insert(task, Waiter::Cleanup(reply));
                    },
                    Err(e) => {
                        let message = match e {
                            TurnError::Interrupted => "cleanup exceeded the turn budget".into(),
                            TurnError::Thrown(message) => message,
                        };
                        let _ = reply.send(Err(ExtensionError::CleanupFailed {
                            id: self.id.clone(),
                            message,
                        }));
                    },
                }
            },
            Command::Shutdown => {},
        }
        self.pump();
    }

    fn dispatch(
        &mut self,
        route: u32,
        request: &HandlerRequest,
        reply: oneshot::Sender<ExtensionResult<HandlerResponse>>,
    ) {
        let request = match serde_json::to_string(request) {
            Ok(json) => json,
            Err(e) => {
                let _ = reply.send(Err(ExtensionError::ExecutionFailed {
                    id: self.id.clone(),
                    message: e.to_string(),
                }));
                return;
            },
        };
        let task = self.next_task();
        match self.turn(move |_, shim| {
            shim.get::<_, Function>("dispatch")?
                .call::<_, ()>((task, route, request))
        }) {
            Ok(()) => {
                self.waiters.insert(task, Waiter::Dispatch(reply));
            },
            Err(e) => {
                let _ = reply.send(Err(self.turn_error(e, "handler")));
                self.drop_task(task);
            },
        }
    }

    fn teardown(mut self) {
        let removed = self.state.release_subscriptions();
        let timers = self.state.timers.borrow().len();
        self.state.timers.borrow_mut().clear();
        self.waiters.clear();
        self.pending_init = None;
        self.shim = None;
        debug!(
            extension_id = %self.id,
            subscriptions = removed,
            timers,
            "Sandbox worker stopped"
        );
    }
}

/// Wrap compiled module code so its body runs as an async function with
/// CommonJS-style bindings, returning the top-level lifecycle functions.
fn wrap_module(code: &str) -> String {
    format!(
        "(async function (module, exports, require) {{\n{code}\n;return {{ \
         init: typeof init === \"function\" ? init : undefined, \
         cleanup: typeof cleanup === \"function\" ? cleanup : undefined }};\n}})"
    )
}

/// Capability snapshot in the shape the shim reads.
fn grant_json(spec: &LaunchSpec, config: &SandboxConfig) -> String {
    let grant = &spec.grant;
    let env: serde_json::Map<String, Value> = grant
        .env()
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    json!({
        "id": spec.id.as_str(),
        "name": spec.name,
        "prefix": crate::routes::prefix_for(&spec.id),
        "root": grant.fs().root().display().to_string(),
        "manifest": spec.manifest,
        "console": grant.console(),
        "network": grant.network(),
        "timers": grant.timers(),
        "env": env,
        "publicDir": grant.public_dir(),
        "staticPrefix": config.static_prefix,
    })
    .to_string()
}
