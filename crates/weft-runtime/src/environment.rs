use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rquickjs::Value;
use serde::{Deserialize, Serialize};
use weft_core::ConsoleMessage;
use weft_core::value::RuntimeValue;

use crate::error::RuntimeError;
use crate::handle::ExecutionHandle;
use crate::inspector;
use crate::worker::{Job, ScriptScope, WorkerHandle};

/// Engine resource limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Heap limit in bytes.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: Option<usize>,
    /// Script stack limit in bytes.
    #[serde(default = "default_max_stack_size")]
    pub max_stack_size: Option<usize>,
}

fn default_memory_limit() -> Option<usize> {
    Some(256 * 1024 * 1024)
}

fn default_max_stack_size() -> Option<usize> {
    Some(1024 * 1024)
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            memory_limit: default_memory_limit(),
            max_stack_size: default_max_stack_size(),
        }
    }
}

/// A call to an exported entry function of a built artifact.
#[derive(Debug, Clone)]
pub struct EntryCall {
    pub artifact: PathBuf,
    pub export: String,
    pub inputs: RuntimeValue,
    pub context: RuntimeValue,
}

impl EntryCall {
    pub fn new(artifact: impl Into<PathBuf>, export: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            export: export.into(),
            inputs: RuntimeValue::Object(Default::default()),
            context: RuntimeValue::Object(Default::default()),
        }
    }

    pub fn with_inputs(mut self, inputs: RuntimeValue) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_context(mut self, context: RuntimeValue) -> Self {
        self.context = context;
        self
    }
}

/// Result of one entry call together with the console output it produced.
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// The settled return value, or the error the script raised.
    pub value: Result<RuntimeValue, RuntimeError>,
    pub console: Vec<ConsoleMessage>,
    pub epoch: u64,
}

enum Lifecycle {
    Unborn,
    Live(WorkerHandle),
    Disposed,
}

struct State {
    lifecycle: Lifecycle,
    epoch: u64,
    /// Whether an instance was already created under `epoch`.
    epoch_used: bool,
    debugger: Option<DebugSocket>,
}

/// The inspector socket. Owned here rather than by an instance so the port
/// stays bound across resets; every instance accepts on a clone.
struct DebugSocket {
    listener: Arc<TcpListener>,
    port: u16,
}

struct Shared {
    options: RuntimeOptions,
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_epoch(&self) -> u64 {
        self.lock().epoch
    }
}

/// The process-wide script runtime.
///
/// Cheap to clone; clones share one instance. The instance is created on
/// first use and recreated after [`reset`](Self::reset) or a fault. Each
/// creation starts a new epoch, and results computed under an older epoch
/// are reported as [`RuntimeError::Stale`].
#[derive(Clone)]
pub struct RuntimeEnvironment {
    shared: Arc<Shared>,
}

impl RuntimeEnvironment {
    pub fn new(options: RuntimeOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                state: Mutex::new(State {
                    lifecycle: Lifecycle::Unborn,
                    epoch: 1,
                    epoch_used: false,
                    debugger: None,
                }),
            }),
        }
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.shared.options
    }

    /// The current epoch. Advances when the live instance is reset or lost.
    pub fn epoch(&self) -> u64 {
        self.shared.current_epoch()
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    pub fn is_live(&self) -> bool {
        matches!(self.shared.lock().lifecycle, Lifecycle::Live(_))
    }

    /// Run `body` on the runtime thread and block until it returns.
    ///
    /// Must not be called from inside another body.
    pub fn run<T, F>(&self, body: F) -> Result<T, RuntimeError>
    where
        T: Send + 'static,
        F: for<'js> FnOnce(&ScriptScope<'_, 'js>) -> Result<T, RuntimeError> + Send + 'static,
    {
        self.schedule(body).wait()
    }

    /// Run `body` on the runtime thread; a returned promise is driven to
    /// settlement by the runtime's event loop.
    pub fn run_async<F>(&self, body: F) -> ExecutionHandle<RuntimeValue>
    where
        F: for<'js> FnOnce(&ScriptScope<'_, 'js>) -> Result<Value<'js>, RuntimeError>
            + Send
            + 'static,
    {
        self.schedule(move |scope| {
            let value = body(scope)?;
            let value = scope.settle(value)?;
            scope.from_js(value)
        })
    }

    /// Import `call.export` from `call.artifact`, call it with the inputs and
    /// context, and await the result.
    pub fn execute_entry(&self, call: EntryCall) -> ExecutionHandle<ExecutionOutcome> {
        self.schedule(move |scope| scope.execute(&call))
    }

    /// Tear down the live instance.
    ///
    /// Executions already queued finish on the old instance before it stops,
    /// and their results come back stale. Resetting when nothing is live does
    /// nothing.
    pub fn reset(&self) {
        let mut state = self.shared.lock();
        let Lifecycle::Live(worker) = std::mem::replace(&mut state.lifecycle, Lifecycle::Disposed)
        else {
            return;
        };
        worker.shutdown();
        state.epoch += 1;
        state.epoch_used = false;
        tracing::info!(retired = worker.epoch(), epoch = state.epoch, "Script runtime reset");
    }

    /// Open the debug inspector on `127.0.0.1:port` (0 picks a free port) and
    /// keep it open across resets. Returns the bound port.
    pub fn enable_debugger(&self, port: u16) -> Result<u16, RuntimeError> {
        let listener = {
            let mut state = self.shared.lock();
            match &state.debugger {
                Some(socket) if port == 0 || socket.port == port => Arc::clone(&socket.listener),
                _ => {
                    let listener = Arc::new(inspector::listen(port)?);
                    let port = inspector::local_port(&listener)?;
                    state.debugger = Some(DebugSocket {
                        listener: Arc::clone(&listener),
                        port,
                    });
                    listener
                }
            }
        };
        self.run(move |scope| scope.engine().attach_inspector(&listener))?;
        self.debugger_port()
            .ok_or_else(|| RuntimeError::Inspector("debugger disabled while enabling".into()))
    }

    /// Close the inspector socket. The port is released once the live
    /// instance has dropped its clone.
    pub fn disable_debugger(&self) {
        let mut state = self.shared.lock();
        if state.debugger.take().is_none() {
            return;
        }
        if let Lifecycle::Live(worker) = &state.lifecycle {
            let _ = worker.send(Box::new(|engine| engine.disable_inspector()));
        }
    }

    pub fn debugger_port(&self) -> Option<u16> {
        self.shared.lock().debugger.as_ref().map(|socket| socket.port)
    }

    /// Number of entry modules cached by the live instance; zero when none is live.
    pub fn cached_modules(&self) -> usize {
        if !self.is_live() {
            return 0;
        }
        self.run(|scope| Ok(scope.engine().cached_modules()))
            .unwrap_or_default()
    }

    fn schedule<T, F>(&self, body: F) -> ExecutionHandle<T>
    where
        T: Send + 'static,
        F: for<'js> FnOnce(&ScriptScope<'_, 'js>) -> Result<T, RuntimeError> + Send + 'static,
    {
        let mut state = self.shared.lock();
        let epoch = match self.live_worker(&mut state).map(WorkerHandle::epoch) {
            Ok(epoch) => epoch,
            Err(e) => return ExecutionHandle::ready(state.epoch, Err(e)),
        };

        let (handle, completer) = ExecutionHandle::pair(epoch);
        let shared = Arc::downgrade(&self.shared);
        let job: Job = Box::new(move |engine| {
            if let Some(stale) = staleness(&shared, epoch) {
                completer.complete(Err(stale));
                return;
            }
            let result = engine.run_scoped(body);
            let result = match staleness(&shared, epoch) {
                Some(stale) if result.is_ok() => Err(stale),
                _ => result,
            };
            completer.complete(result);
        });

        if let Lifecycle::Live(worker) = &state.lifecycle
            && let Err(e) = worker.send(job)
        {
            tracing::warn!(epoch, error = %e, "Script runtime lost");
            state.lifecycle = Lifecycle::Disposed;
            state.epoch += 1;
            state.epoch_used = false;
        }
        handle
    }

    /// The live worker, creating one if needed. A worker whose thread has
    /// died is disposed and replaced.
    fn live_worker<'s>(&self, state: &'s mut State) -> Result<&'s WorkerHandle, RuntimeError> {
        if let Lifecycle::Live(worker) = &state.lifecycle
            && worker.is_terminated()
        {
            tracing::warn!(epoch = worker.epoch(), "Script runtime faulted, recreating");
            state.lifecycle = Lifecycle::Disposed;
            state.epoch += 1;
            state.epoch_used = false;
        }

        if !matches!(state.lifecycle, Lifecycle::Live(_)) {
            if state.epoch_used {
                state.epoch += 1;
            }
            let debugger = state.debugger.as_ref().map(|socket| Arc::clone(&socket.listener));
            let worker = WorkerHandle::spawn(&self.shared.options, state.epoch, debugger)?;
            state.epoch_used = true;
            state.lifecycle = Lifecycle::Live(worker);
        }

        match &state.lifecycle {
            Lifecycle::Live(worker) => Ok(worker),
            Lifecycle::Unborn | Lifecycle::Disposed => {
                Err(RuntimeError::Fault("script runtime is not running".into()))
            }
        }
    }
}

impl Default for RuntimeEnvironment {
    fn default() -> Self {
        Self::new(RuntimeOptions::default())
    }
}

impl std::fmt::Debug for RuntimeEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        let lifecycle = match state.lifecycle {
            Lifecycle::Unborn => "unborn",
            Lifecycle::Live(_) => "live",
            Lifecycle::Disposed => "disposed",
        };
        f.debug_struct("RuntimeEnvironment")
            .field("lifecycle", &lifecycle)
            .field("epoch", &state.epoch)
            .field("debugger_port", &state.debugger.as_ref().map(|socket| socket.port))
            .finish()
    }
}

/// `Some` when work scheduled under `epoch` no longer belongs to the current
/// instance. A dropped environment makes everything stale.
fn staleness(shared: &Weak<Shared>, epoch: u64) -> Option<RuntimeError> {
    let current = match shared.upgrade() {
        Some(shared) => shared.current_epoch(),
        None => epoch + 1,
    };
    (current != epoch).then_some(RuntimeError::Stale {
        executed: epoch,
        current,
    })
}
