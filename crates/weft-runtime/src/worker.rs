//! The runtime thread.
//!
//! QuickJS values are bound to the thread that owns the runtime, so every
//! live instance gets one dedicated OS thread. Work arrives as boxed jobs over
//! a channel and runs in FIFO order. A job that panics or leaves the engine
//! out of memory retires the thread; the environment notices through the
//! `terminated` flag and starts a fresh one on next access.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use rquickjs::promise::PromiseState;
use rquickjs::{Context, Ctx, Function, Module, Object, Persistent, Runtime, Value};
use sha2::{Digest, Sha256};
use weft_core::ConsoleMessage;
use weft_core::value::RuntimeValue;

use crate::bridge::{self, ScriptResultExt};
use crate::console::{ConsoleCapture, message_from_args};
use crate::environment::{EntryCall, ExecutionOutcome, RuntimeOptions};
use crate::error::RuntimeError;
use crate::inspector::{self, Inspector, InspectorEvent};

const PRELUDE: &str = include_str!("prelude.js");

/// Native stack for the runtime thread. Must exceed the engine's own limit.
const THREAD_STACK_SIZE: usize = 16 * 1024 * 1024;

/// Longest single sleep while waiting on a timer.
const MAX_TIMER_SLEEP: Duration = Duration::from_millis(50);

pub(crate) type Job = Box<dyn FnOnce(&mut Engine) + Send>;

enum Command {
    Run(Job),
    Shutdown,
}

/// Sending side of a runtime thread.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    tx: mpsc::Sender<Command>,
    terminated: Arc<AtomicBool>,
    epoch: u64,
}

impl WorkerHandle {
    /// Start a runtime thread and wait until its engine is initialized.
    /// With `debugger` the engine accepts inspector clients on that socket.
    pub(crate) fn spawn(
        options: &RuntimeOptions,
        epoch: u64,
        debugger: Option<Arc<TcpListener>>,
    ) -> Result<Self, RuntimeError> {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let terminated = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&terminated);
        let options = options.clone();

        std::thread::Builder::new()
            .name(format!("weft-runtime-{epoch}"))
            .stack_size(THREAD_STACK_SIZE)
            .spawn(move || match Engine::new(&options, epoch, debugger.as_deref(), Arc::clone(&flag)) {
                Ok(engine) => {
                    let _ = ready_tx.send(Ok(()));
                    run_loop(engine, rx, &flag);
                }
                Err(e) => {
                    flag.store(true, Ordering::SeqCst);
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| RuntimeError::Fault(format!("failed to spawn runtime thread: {e}")))?;

        ready_rx.recv().map_err(|_| {
            RuntimeError::Fault("runtime thread exited during initialization".into())
        })??;

        tracing::info!(epoch, "Script runtime started");
        Ok(Self {
            tx,
            terminated,
            epoch,
        })
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Queue a job. Fails when the thread is gone; the job is dropped.
    pub(crate) fn send(&self, job: Job) -> Result<(), RuntimeError> {
        self.tx
            .send(Command::Run(job))
            .map_err(|_| RuntimeError::Fault("runtime thread is gone".into()))
    }

    /// Ask the thread to exit once the jobs already queued have run.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

fn run_loop(mut engine: Engine, rx: mpsc::Receiver<Command>, terminated: &AtomicBool) {
    let epoch = engine.epoch;
    while let Ok(command) = rx.recv() {
        let job = match command {
            Command::Run(job) => job,
            Command::Shutdown => break,
        };
        if panic::catch_unwind(AssertUnwindSafe(|| job(&mut engine))).is_err() {
            tracing::error!(epoch, "Script job panicked, retiring runtime");
            break;
        }
        if engine.is_poisoned() {
            tracing::error!(epoch, "Script engine faulted, retiring runtime");
            break;
        }
    }
    terminated.store(true, Ordering::SeqCst);
    // Jobs still queued are dropped with the receiver; their handles report a fault.
    drop(rx);
    drop(engine);
    tracing::info!(epoch, "Script runtime stopped");
}

struct CachedModule {
    hash: String,
    namespace: Persistent<Object<'static>>,
}

/// State reachable from host functions called by scripts.
#[derive(Default)]
struct EngineShared {
    console: RefCell<ConsoleCapture>,
    inspector: RefCell<Option<Inspector>>,
}

impl EngineShared {
    fn record(&self, message: ConsoleMessage) {
        if let Some(inspector) = self.inspector.borrow_mut().as_mut() {
            inspector.emit(&InspectorEvent::Console {
                level: message.level,
                text: message.text.clone(),
            });
        }
        self.console.borrow_mut().record(message);
    }

    fn emit(&self, event: &InspectorEvent) {
        if let Some(inspector) = self.inspector.borrow_mut().as_mut() {
            inspector.emit(event);
        }
    }
}

/// One QuickJS runtime plus its context, living on the runtime thread.
pub(crate) struct Engine {
    // Persistent values must be released while the runtime is still alive.
    modules: RefCell<HashMap<PathBuf, CachedModule>>,
    shared: Rc<EngineShared>,
    context: Context,
    _runtime: Runtime,
    epoch: u64,
    next_module: Cell<u64>,
    /// Shared with the [`WorkerHandle`]; set as soon as the engine is unusable.
    terminated: Arc<AtomicBool>,
}

impl Engine {
    fn new(
        options: &RuntimeOptions,
        epoch: u64,
        debugger: Option<&TcpListener>,
        terminated: Arc<AtomicBool>,
    ) -> Result<Self, RuntimeError> {
        let runtime = Runtime::new().map_err(|e| RuntimeError::Fault(e.to_string()))?;
        if let Some(limit) = options.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(size) = options.max_stack_size {
            runtime.set_max_stack_size(size);
        }
        let context = Context::full(&runtime).map_err(|e| RuntimeError::Fault(e.to_string()))?;
        let shared = Rc::new(EngineShared::default());
        let started = Instant::now();
        context.with(|ctx| install_prelude(&ctx, &shared, started).or_fault(&ctx))?;

        let engine = Self {
            modules: RefCell::new(HashMap::new()),
            shared,
            context,
            _runtime: runtime,
            epoch,
            next_module: Cell::new(0),
            terminated,
        };
        if let Some(listener) = debugger
            && let Err(e) = engine.attach_inspector(listener)
        {
            tracing::warn!(epoch, error = %e, "Debug inspector unavailable for this runtime");
        }
        Ok(engine)
    }

    /// Run `body` inside the context. A fault marks the engine unusable
    /// before the caller sees the error, so the next access already gets a
    /// fresh instance.
    pub(crate) fn run_scoped<T, F>(&self, body: F) -> Result<T, RuntimeError>
    where
        F: for<'js> FnOnce(&ScriptScope<'_, 'js>) -> Result<T, RuntimeError>,
    {
        let result = self.context.with(|ctx| body(&ScriptScope { engine: self, ctx }));
        if let Err(e) = &result
            && e.is_fault()
        {
            self.terminated.store(true, Ordering::SeqCst);
        }
        result
    }

    fn is_poisoned(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Accept inspector clients on `listener`. A client already attached
    /// through the same port stays attached.
    pub(crate) fn attach_inspector(&self, listener: &TcpListener) -> Result<(), RuntimeError> {
        let mut inspector = self.shared.inspector.borrow_mut();
        let port = inspector::local_port(listener)?;
        if inspector.as_ref().is_some_and(|existing| existing.port() == port) {
            return Ok(());
        }
        *inspector = Some(Inspector::attach(listener)?);
        Ok(())
    }

    pub(crate) fn disable_inspector(&self) {
        if self.shared.inspector.borrow_mut().take().is_some() {
            tracing::info!(epoch = self.epoch, "Debug inspector closed");
        }
    }

    pub(crate) fn cached_modules(&self) -> usize {
        self.modules.borrow().len()
    }
}

fn install_prelude<'js>(
    ctx: &Ctx<'js>,
    shared: &Rc<EngineShared>,
    started: Instant,
) -> rquickjs::Result<()> {
    let host = Object::new(ctx.clone())?;
    host.set(
        "now",
        Function::new(ctx.clone(), move || started.elapsed().as_secs_f64() * 1000.0)?,
    )?;
    let console = Rc::clone(shared);
    host.set(
        "console",
        Function::new(ctx.clone(), move |level: i32, lines: Vec<String>| {
            console.record(message_from_args(level, lines));
        })?,
    )?;
    let prelude: Function = ctx.eval(PRELUDE)?;
    prelude.call::<_, ()>((host,))
}

/// Access to the runtime from inside a body scheduled on it.
pub struct ScriptScope<'a, 'js> {
    engine: &'a Engine,
    ctx: Ctx<'js>,
}

impl<'a, 'js> ScriptScope<'a, 'js> {
    pub fn ctx(&self) -> &Ctx<'js> {
        &self.ctx
    }

    /// Epoch of the instance the body is running on.
    pub fn epoch(&self) -> u64 {
        self.engine.epoch
    }

    pub(crate) fn engine(&self) -> &'a Engine {
        self.engine
    }

    /// Evaluate a classic script and return its completion value.
    pub fn eval(&self, source: &str) -> Result<Value<'js>, RuntimeError> {
        self.ctx.eval::<Value, _>(source).or_fault(&self.ctx)
    }

    pub fn to_js(&self, value: &RuntimeValue) -> Result<Value<'js>, RuntimeError> {
        bridge::to_js(&self.ctx, value)
    }

    pub fn from_js(&self, value: Value<'js>) -> Result<RuntimeValue, RuntimeError> {
        bridge::from_js(&self.ctx, value)
    }

    /// Load the ES module at `path` and return one of its exported functions.
    ///
    /// Modules are cached by path and content hash; changed content is
    /// declared again under a fresh module name.
    pub fn import_entry(&self, path: &Path, export: &str) -> Result<Function<'js>, RuntimeError> {
        let namespace = self.module_namespace(path)?;
        let entry: Value = namespace.get(export).or_fault(&self.ctx)?;
        entry
            .into_function()
            .ok_or_else(|| RuntimeError::EntryNotFound {
                path: path.to_path_buf(),
                export: export.to_string(),
            })
    }

    fn module_namespace(&self, path: &Path) -> Result<Object<'js>, RuntimeError> {
        let source = std::fs::read(path).map_err(|e| RuntimeError::Artifact {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let hash = hex::encode(Sha256::digest(&source));

        let cached = self
            .engine
            .modules
            .borrow()
            .get(path)
            .filter(|module| module.hash == hash)
            .map(|module| module.namespace.clone());
        if let Some(namespace) = cached {
            return namespace.restore(&self.ctx).or_fault(&self.ctx);
        }

        let id = self.engine.next_module.get();
        self.engine.next_module.set(id + 1);
        let name = format!("{}#{id}", path.display());
        let (module, evaluated) = Module::declare(self.ctx.clone(), name, source)
            .and_then(|module| module.eval())
            .or_fault(&self.ctx)?;
        self.settle(evaluated.into_value())?;
        let namespace = module.namespace().or_fault(&self.ctx)?;

        tracing::debug!(path = %path.display(), hash = %&hash[..12], "Loaded script module");
        self.engine.modules.borrow_mut().insert(
            path.to_path_buf(),
            CachedModule {
                hash,
                namespace: Persistent::save(&self.ctx, namespace.clone()),
            },
        );
        Ok(namespace)
    }

    /// Drive `value` to settlement if it is a promise.
    ///
    /// Runs queued jobs, then due timers, sleeping until the next timer when
    /// there is nothing else to do. A promise with nothing left that could
    /// settle it is reported as [`RuntimeError::Stalled`].
    pub fn settle(&self, value: Value<'js>) -> Result<Value<'js>, RuntimeError> {
        let Some(promise) = value.as_promise().cloned() else {
            return Ok(value);
        };
        while promise.state() == PromiseState::Pending {
            if self.ctx.execute_pending_job() {
                continue;
            }
            let next = self.run_timers()?;
            if self.ctx.execute_pending_job() || promise.state() != PromiseState::Pending {
                continue;
            }
            if next < 0.0 {
                return Err(RuntimeError::Stalled);
            }
            std::thread::sleep(Duration::from_secs_f64(next / 1000.0).min(MAX_TIMER_SLEEP));
        }
        match promise.result::<Value>() {
            Some(result) => result.or_fault(&self.ctx),
            None => Err(RuntimeError::Stalled),
        }
    }

    /// Run due timers; returns milliseconds until the next one, or a negative
    /// number when none are scheduled.
    fn run_timers(&self) -> Result<f64, RuntimeError> {
        let helpers = bridge::helpers(&self.ctx).or_fault(&self.ctx)?;
        let run: Function = helpers.get("runTimers").or_fault(&self.ctx)?;
        run.call(()).or_fault(&self.ctx)
    }

    fn clear_timers(&self) -> Result<(), RuntimeError> {
        let helpers = bridge::helpers(&self.ctx).or_fault(&self.ctx)?;
        let clear: Function = helpers.get("clearTimers").or_fault(&self.ctx)?;
        clear.call(()).or_fault(&self.ctx)
    }

    /// Number of timers scheduled and not yet fired or cleared.
    pub fn pending_timers(&self) -> Result<usize, RuntimeError> {
        let helpers = bridge::helpers(&self.ctx).or_fault(&self.ctx)?;
        let pending: Function = helpers.get("pendingTimers").or_fault(&self.ctx)?;
        pending.call(()).or_fault(&self.ctx)
    }

    /// Import the entry, call it with `(inputs, context)` and await the result.
    ///
    /// Console output is captured for the duration of the call. Script errors
    /// are reported in the outcome next to the captured console; faults are
    /// returned as errors.
    pub(crate) fn execute(&self, call: &EntryCall) -> Result<ExecutionOutcome, RuntimeError> {
        let shared = &self.engine.shared;
        if let Some(inspector) = shared.inspector.borrow_mut().as_mut() {
            inspector.wait_for_client()?;
        }
        shared.emit(&InspectorEvent::Execute {
            artifact: call.artifact.display().to_string(),
            export: call.export.clone(),
            epoch: self.engine.epoch,
        });

        shared.console.borrow_mut().begin();
        let result = self.call_entry(call);
        let cleared = self.clear_timers();
        let console = shared.console.borrow_mut().finish();

        shared.emit(&InspectorEvent::Settled {
            ok: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        });

        match result {
            Err(e) if e.is_fault() => Err(e),
            result => {
                cleared?;
                Ok(ExecutionOutcome {
                    value: result,
                    console,
                    epoch: self.engine.epoch,
                })
            }
        }
    }

    fn call_entry(&self, call: &EntryCall) -> Result<RuntimeValue, RuntimeError> {
        let entry = self.import_entry(&call.artifact, &call.export)?;
        let inputs = self.to_js(&call.inputs)?;
        let context = self.to_js(&call.context)?;
        let value: Value = entry.call((inputs, context)).or_fault(&self.ctx)?;
        let value = self.settle(value)?;
        self.from_js(value)
    }
}
