//! Isolate thread.
//!
//! Each [`Isolate`](crate::runtime::isolate::Isolate) owns a dedicated OS
//! thread holding the engine heap. Commands arrive through
//! [`IsolateCommand`] and run strictly one after another; the queue is the
//! isolate's exclusion token. Host functions invoked from script run on this
//! thread too, and any eval/attach they issue against the same isolate runs
//! inline on the active scope instead of being queued.

use crate::runtime::config::{EvalOptions, IsolateConfig};
use crate::runtime::context::EvalOutcome;
use crate::runtime::conversion::{error_to_engine, error_to_host, to_engine, to_host};
use crate::runtime::error::{BridgeError, TerminationReason};
use crate::runtime::handle::{CommandHandle, Responder};
use crate::runtime::initialize_platform_once;
use crate::runtime::isolate::HeapStats;
use crate::runtime::js_value::{JSValue, JsErrorValue};
use crate::runtime::ops::{parse_path, FunctionRegistry, HostError, HostFunction};
use crate::runtime::watchdog::{Cause, Interrupter, Watchdog};
use deno_core::v8;
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub(crate) type IsolateId = u64;
pub(crate) type ContextId = u64;

thread_local! {
    /// Isolate owned by the current thread, if it is an isolate thread.
    static CURRENT_ISOLATE: Cell<Option<IsolateId>> = const { Cell::new(None) };

    /// Scope of the host-function call currently executing on this thread.
    static ACTIVE_SCOPE: Cell<Option<(IsolateId, *mut c_void)>> = const { Cell::new(None) };
}

/// Commands sent to the isolate thread.
pub(crate) enum IsolateCommand {
    CreateContext {
        shared: Arc<ContextShared>,
        responder: Responder<()>,
    },
    Eval {
        context: ContextId,
        source: String,
        options: EvalOptions,
        responder: Responder<JSValue>,
    },
    Attach {
        context: ContextId,
        path: String,
        function: Arc<dyn HostFunction>,
        responder: Responder<()>,
    },
    DropContext {
        context: ContextId,
    },
    IdleNotification {
        budget: Duration,
        responder: Responder<bool>,
    },
    HeapStats {
        responder: Responder<HeapStats>,
    },
    Shutdown,
}

/// Context state reachable from both the host and the isolate thread.
pub(crate) struct ContextShared {
    pub(crate) id: ContextId,
    pub(crate) registry: FunctionRegistry,
    last_outcome: Mutex<Option<EvalOutcome>>,
}

impl ContextShared {
    pub(crate) fn new(id: ContextId) -> Self {
        Self {
            id,
            registry: FunctionRegistry::new(),
            last_outcome: Mutex::new(None),
        }
    }

    pub(crate) fn last_outcome(&self) -> Option<EvalOutcome> {
        *self.last_outcome.lock()
    }

    fn record(&self, outcome: EvalOutcome) {
        *self.last_outcome.lock() = Some(outcome);
    }
}

struct ContextEntry {
    context: v8::Global<v8::Context>,
    shared: Arc<ContextShared>,
}

/// Per-isolate state stored in an isolate slot.
struct IsolateState {
    id: IsolateId,
    interrupter: Arc<Interrupter>,
    contexts: RefCell<HashMap<ContextId, ContextEntry>>,
}

impl IsolateState {
    fn lookup(&self, id: ContextId) -> Result<(v8::Global<v8::Context>, Arc<ContextShared>), BridgeError> {
        self.contexts
            .borrow()
            .get(&id)
            .map(|entry| (entry.context.clone(), entry.shared.clone()))
            .ok_or(BridgeError::ContextClosed)
    }
}

fn isolate_state(isolate: &v8::Isolate) -> Result<Rc<IsolateState>, BridgeError> {
    isolate
        .get_slot::<Rc<IsolateState>>()
        .cloned()
        .ok_or(BridgeError::IsolateClosed)
}

/// Handles returned to the owner of a freshly spawned isolate thread.
pub(crate) struct SpawnedIsolate {
    pub(crate) commands: CommandHandle,
    pub(crate) interrupter: Arc<Interrupter>,
    pub(crate) thread: JoinHandle<()>,
}

pub(crate) fn spawn_isolate_thread(
    id: IsolateId,
    config: IsolateConfig,
) -> Result<SpawnedIsolate, BridgeError> {
    config.validate()?;
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<IsolateCommand>();
    let (init_tx, init_rx) = std::sync::mpsc::channel::<Arc<Interrupter>>();

    let thread = std::thread::Builder::new()
        .name(format!("jsbridge-isolate-{}", id))
        .spawn(move || {
            CURRENT_ISOLATE.with(|current| current.set(Some(id)));
            let core = IsolateCore::new(id, &config);
            let _ = init_tx.send(core.state.interrupter.clone());
            core.run(cmd_rx);
        })
        .map_err(|e| BridgeError::Configuration(format!("Failed to spawn isolate thread: {}", e)))?;

    let interrupter = init_rx
        .recv()
        .map_err(|_| BridgeError::Configuration("Isolate thread failed to start".to_string()))?;

    Ok(SpawnedIsolate {
        commands: CommandHandle::new(cmd_tx),
        interrupter,
        thread,
    })
}

/// True when called from the thread owning isolate `id`.
pub(crate) fn is_isolate_thread(id: IsolateId) -> bool {
    CURRENT_ISOLATE.with(Cell::get) == Some(id)
}

/// Run `f` on the active scope if a host function of isolate `id` is
/// executing on this thread. Returns `None` when the caller must queue.
pub(crate) fn try_inline<R>(id: IsolateId, f: impl FnOnce(&mut v8::HandleScope) -> R) -> Option<R> {
    let (active_id, raw) = ACTIVE_SCOPE.with(Cell::get)?;
    if active_id != id {
        return None;
    }
    // SAFETY: the pointer was set by `dispatch_host_call` for the duration
    // of the host call that is running further up this thread's stack, and
    // that frame does not touch its scope until the call returns.
    let scope = unsafe { &mut *(raw as *mut v8::HandleScope) };
    Some(f(scope))
}

/// Restores the previous active scope on drop.
struct ActiveScopeGuard {
    previous: Option<(IsolateId, *mut c_void)>,
}

impl ActiveScopeGuard {
    fn enter(id: IsolateId, scope: &mut v8::HandleScope) -> Self {
        let raw = scope as *mut v8::HandleScope as *mut c_void;
        let previous = ACTIVE_SCOPE.with(|active| active.replace(Some((id, raw))));
        Self { previous }
    }
}

impl Drop for ActiveScopeGuard {
    fn drop(&mut self) {
        ACTIVE_SCOPE.with(|active| active.set(self.previous));
    }
}

extern "C" fn near_heap_limit_callback(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` is the interrupter registered in `IsolateCore::new`,
    // which outlives the isolate.
    let interrupter = unsafe { &*(data as *const Interrupter) };
    tracing::warn!(
        heap_limit = current_heap_limit,
        "Heap limit reached, terminating evaluation"
    );
    interrupter.heap_limit();
    // Leave room for the termination to unwind.
    current_heap_limit.saturating_mul(2)
}

struct IsolateCore {
    // Dropped before `state`, which keeps the heap-limit callback data alive.
    isolate: v8::OwnedIsolate,
    state: Rc<IsolateState>,
    /// Configured heap cap, restored after the callback raises it.
    max_heap_size: Option<usize>,
}

impl IsolateCore {
    fn new(id: IsolateId, config: &IsolateConfig) -> Self {
        initialize_platform_once();

        let mut params = v8::CreateParams::default();
        if let Some(max) = config.max_heap_size {
            params = params.heap_limits(config.initial_heap_size.unwrap_or(0), max);
        }
        if let Some(snapshot) = &config.snapshot {
            params = params.snapshot_blob(snapshot.startup_data());
        }

        let mut isolate = v8::Isolate::new(params);
        let interrupter = Arc::new(Interrupter::new(isolate.thread_safe_handle()));
        isolate.add_near_heap_limit_callback(
            near_heap_limit_callback,
            Arc::as_ptr(&interrupter) as *mut c_void,
        );

        let state = Rc::new(IsolateState {
            id,
            interrupter,
            contexts: RefCell::new(HashMap::new()),
        });
        isolate.set_slot(state.clone());

        tracing::debug!(
            isolate = id,
            from_snapshot = config.snapshot.is_some(),
            "Isolate thread started"
        );
        Self {
            isolate,
            state,
            max_heap_size: config.max_heap_size,
        }
    }

    /// Bring the heap cap back down after the near-heap-limit callback
    /// raised it to let a terminated script unwind.
    fn restore_heap_limit(&mut self) {
        let Some(max) = self.max_heap_size else {
            return;
        };
        // Reclaim what the terminated script left behind before lowering the cap.
        self.isolate.low_memory_notification();
        self.isolate
            .remove_near_heap_limit_callback(near_heap_limit_callback, max);
        let data = Arc::as_ptr(&self.state.interrupter) as *mut c_void;
        self.isolate
            .add_near_heap_limit_callback(near_heap_limit_callback, data);
        tracing::debug!(isolate = self.state.id, heap_limit = max, "Heap limit restored");
    }

    fn run(mut self, mut rx: mpsc::UnboundedReceiver<IsolateCommand>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                IsolateCommand::CreateContext { shared, responder } => {
                    let scope = &mut v8::HandleScope::new(&mut self.isolate);
                    responder.send(register_context(scope, shared));
                }
                IsolateCommand::Eval {
                    context,
                    source,
                    options,
                    responder,
                } => {
                    responder.send(self.eval(context, &source, options));
                }
                IsolateCommand::Attach {
                    context,
                    path,
                    function,
                    responder,
                } => {
                    let scope = &mut v8::HandleScope::new(&mut self.isolate);
                    responder.send(attach_in_scope(scope, context, &path, function));
                }
                IsolateCommand::DropContext { context } => {
                    if self.state.contexts.borrow_mut().remove(&context).is_some() {
                        tracing::debug!(isolate = self.state.id, context, "Context dropped");
                    }
                }
                IsolateCommand::IdleNotification { budget, responder } => {
                    let started = Instant::now();
                    self.isolate.low_memory_notification();
                    let elapsed = started.elapsed();
                    tracing::trace!(
                        isolate = self.state.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Idle collection finished"
                    );
                    responder.send(Ok(elapsed <= budget));
                }
                IsolateCommand::HeapStats { responder } => {
                    responder.send(Ok(heap_stats(&mut self.isolate)));
                }
                IsolateCommand::Shutdown => break,
            }
        }
        self.shutdown();
    }

    fn shutdown(mut self) {
        let leaked = self.state.contexts.borrow().len();
        if leaked > 0 {
            tracing::debug!(
                isolate = self.state.id,
                contexts = leaked,
                "Releasing contexts still open at shutdown"
            );
        }
        // Globals must be released while the isolate is still alive.
        self.state.contexts.borrow_mut().clear();
        self.isolate.remove_slot::<Rc<IsolateState>>();
        tracing::debug!(isolate = self.state.id, "Isolate thread stopped");
    }

    /// Run a top-level evaluation under the watchdog.
    fn eval(
        &mut self,
        context_id: ContextId,
        source: &str,
        options: EvalOptions,
    ) -> Result<JSValue, BridgeError> {
        let (global, shared) = self.state.lookup(context_id)?;
        let interrupter = self.state.interrupter.clone();
        let started = Instant::now();

        let generation = interrupter.begin();
        let watchdog = options
            .timeout
            .map(|timeout| Watchdog::arm(interrupter.clone(), generation, timeout));

        let (result, cause) = {
            let scope = &mut v8::HandleScope::new(&mut self.isolate);
            let context = v8::Local::new(scope, &global);
            let scope = &mut v8::ContextScope::new(scope, context);
            let tc = &mut v8::TryCatch::new(scope);

            let run = compile_and_run(tc, source);
            // Result conversion below is not covered by the deadline.
            if let Some(watchdog) = watchdog {
                watchdog.disarm();
            }
            let result = run.and_then(|value| {
                check_memory(tc, options.max_memory).map_err(RunFailure::Error)?;
                convert_result(tc, value)
            });
            (result, interrupter.finish())
        };
        interrupter.cancel_termination();
        if cause == Some(Cause::HeapLimit) {
            self.restore_heap_limit();
        }

        let (outcome, result) = match (result, cause) {
            (Ok(value), _) => (EvalOutcome::Completed, Ok(value)),
            (Err(_), Some(cause)) => termination_outcome(cause),
            (Err(RunFailure::Terminated), None) => termination_outcome(Cause::Interrupted),
            (Err(RunFailure::Error(err)), None) => (EvalOutcome::Errored, Err(err)),
        };
        shared.record(outcome);

        tracing::debug!(
            isolate = self.state.id,
            context = context_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = ?outcome,
            "Evaluation finished"
        );
        result
    }
}

fn termination_outcome(cause: Cause) -> (EvalOutcome, Result<JSValue, BridgeError>) {
    let outcome = match cause {
        Cause::Timeout(requested) => EvalOutcome::TimedOut { requested },
        Cause::Interrupted => EvalOutcome::Interrupted,
        Cause::HeapLimit => EvalOutcome::Errored,
    };
    (outcome, Err(termination_error(Some(cause))))
}

fn termination_error(cause: Option<Cause>) -> BridgeError {
    match cause {
        Some(Cause::Timeout(requested)) => BridgeError::ScriptTerminated {
            reason: TerminationReason::Timeout { requested },
        },
        Some(Cause::HeapLimit) => {
            BridgeError::Allocation("Script exceeded the isolate heap limit".to_string())
        }
        Some(Cause::Interrupted) | None => BridgeError::ScriptTerminated {
            reason: TerminationReason::Interrupted,
        },
    }
}

fn heap_stats(isolate: &mut v8::Isolate) -> HeapStats {
    let stats = isolate.get_heap_statistics();
    HeapStats {
        total_heap_size: stats.total_heap_size(),
        used_heap_size: stats.used_heap_size(),
        heap_size_limit: stats.heap_size_limit(),
        external_memory: stats.external_memory(),
    }
}

fn check_memory(isolate: &mut v8::Isolate, limit: Option<usize>) -> Result<(), BridgeError> {
    let Some(limit) = limit else {
        return Ok(());
    };
    let used = heap_stats(isolate).used_heap_size;
    if used > limit {
        return Err(BridgeError::Allocation(format!(
            "Used heap of {} bytes exceeds max_memory of {} bytes",
            used, limit
        )));
    }
    Ok(())
}

/// How a compile-and-run attempt failed.
enum RunFailure {
    Terminated,
    Error(BridgeError),
}

fn compile_and_run<'s>(
    tc: &mut v8::TryCatch<'_, v8::HandleScope<'s>>,
    source: &str,
) -> Result<v8::Local<'s, v8::Value>, RunFailure> {
    let code = v8::String::new(tc, source).ok_or_else(|| {
        RunFailure::Error(BridgeError::Allocation(format!(
            "Source of {} bytes is too large",
            source.len()
        )))
    })?;

    let Some(script) = v8::Script::compile(tc, code, None) else {
        if tc.has_terminated() {
            return Err(RunFailure::Terminated);
        }
        return Err(RunFailure::Error(BridgeError::Compile {
            message: compile_message(tc),
        }));
    };

    match script.run(tc) {
        Some(value) => Ok(value),
        None => Err(caught_failure(tc)),
    }
}

fn compile_message(tc: &mut v8::TryCatch<v8::HandleScope>) -> String {
    let Some(message) = tc.message() else {
        return "Script compilation failed".to_string();
    };
    let text = message.get(tc).to_rust_string_lossy(tc);
    let text = text.strip_prefix("Uncaught ").unwrap_or(&text).to_string();
    match message.get_line_number(tc) {
        Some(line) => format!("{} (line {})", text, line),
        None => text,
    }
}

/// Classify whatever the try-catch scope is holding after a failed call.
fn caught_failure(tc: &mut v8::TryCatch<v8::HandleScope>) -> RunFailure {
    if tc.has_terminated() || tc.is_execution_terminating() {
        return RunFailure::Terminated;
    }
    match tc.exception() {
        Some(exception) => RunFailure::Error(BridgeError::Runtime {
            value: thrown_value(tc, exception),
        }),
        None => RunFailure::Error(BridgeError::Runtime {
            value: JSValue::Error(JsErrorValue::new("Error", "Script failed without an exception")),
        }),
    }
}

fn thrown_value(scope: &mut v8::HandleScope, exception: v8::Local<v8::Value>) -> JSValue {
    let exception = v8::Local::new(scope, exception);
    if exception.is_native_error() {
        if let Ok(object) = v8::Local::<v8::Object>::try_from(exception) {
            if let Ok(error) = error_to_host(scope, object) {
                return JSValue::Error(error);
            }
        }
    }
    match to_host(scope, exception) {
        Ok(value) => value,
        Err(_) => JSValue::String(exception.to_rust_string_lossy(scope)),
    }
}

fn convert_result<'s>(
    tc: &mut v8::TryCatch<'_, v8::HandleScope<'s>>,
    value: v8::Local<'s, v8::Value>,
) -> Result<JSValue, RunFailure> {
    match to_host(tc, value) {
        Ok(converted) => Ok(converted),
        Err(err) => {
            // A getter threw or was terminated part way through.
            if tc.has_caught() || tc.is_execution_terminating() {
                Err(caught_failure(tc))
            } else {
                Err(RunFailure::Error(err))
            }
        }
    }
}

/// Run `source` to completion in the current context, discarding its value.
pub(crate) fn run_script(scope: &mut v8::HandleScope, source: &str) -> Result<(), BridgeError> {
    let tc = &mut v8::TryCatch::new(scope);
    match compile_and_run(tc, source) {
        Ok(_) => Ok(()),
        Err(RunFailure::Error(err)) => Err(err),
        Err(RunFailure::Terminated) => Err(termination_error(None)),
    }
}

/// Create the engine context for `shared` and register it on this isolate.
pub(crate) fn register_context(
    scope: &mut v8::HandleScope<'_, ()>,
    shared: Arc<ContextShared>,
) -> Result<(), BridgeError> {
    let state = isolate_state(scope)?;
    let context = v8::Context::new(scope, Default::default());
    let global = v8::Global::new(scope, context);
    let id = shared.id;
    state.contexts.borrow_mut().insert(
        id,
        ContextEntry {
            context: global,
            shared,
        },
    );
    tracing::debug!(isolate = state.id, context = id, "Context created");
    Ok(())
}

/// Evaluate on the scope of a running host call. The outer evaluation's
/// watchdog stays in charge.
pub(crate) fn eval_inline(
    scope: &mut v8::HandleScope,
    context_id: ContextId,
    source: &str,
) -> Result<JSValue, BridgeError> {
    let state = isolate_state(scope)?;
    let (global, _) = state.lookup(context_id)?;

    let scope = &mut v8::HandleScope::new(scope);
    let context = v8::Local::new(scope, &global);
    let scope = &mut v8::ContextScope::new(scope, context);
    let tc = &mut v8::TryCatch::new(scope);

    match compile_and_run(tc, source).and_then(|value| convert_result(tc, value)) {
        Ok(value) => Ok(value),
        Err(RunFailure::Error(err)) => Err(err),
        Err(RunFailure::Terminated) => {
            // Keep the termination travelling up through the outer script.
            tc.rethrow();
            Err(termination_error(state.interrupter.current_cause()))
        }
    }
}

pub(crate) fn heap_stats_inline(scope: &mut v8::HandleScope) -> HeapStats {
    heap_stats(scope)
}

/// Register `function` under `path` and materialise the global binding.
pub(crate) fn attach_in_scope(
    scope: &mut v8::HandleScope<'_, ()>,
    context_id: ContextId,
    path: &str,
    function: Arc<dyn HostFunction>,
) -> Result<(), BridgeError> {
    let state = isolate_state(scope)?;
    let (global, shared) = state.lookup(context_id)?;

    let previous = shared.registry.insert(path, function)?;

    let scope = &mut v8::HandleScope::new(scope);
    let context = v8::Local::new(scope, &global);
    let scope = &mut v8::ContextScope::new(scope, context);
    let tc = &mut v8::TryCatch::new(scope);

    let result = install_binding(tc, context_id, path);
    match &result {
        Ok(()) => tracing::debug!(isolate = state.id, context = context_id, path, "Host function attached"),
        Err(_) => shared.registry.restore(path, previous),
    }
    result
}

fn property_failure(tc: &mut v8::TryCatch<v8::HandleScope>, path: &str) -> BridgeError {
    match caught_failure(tc) {
        RunFailure::Error(err) => err,
        RunFailure::Terminated => {
            BridgeError::Conversion(format!("Attaching '{}' was terminated", path))
        }
    }
}

fn install_binding(
    tc: &mut v8::TryCatch<v8::HandleScope>,
    context_id: ContextId,
    path: &str,
) -> Result<(), BridgeError> {
    let segments = parse_path(path)?;
    let Some((last, namespaces)) = segments.split_last() else {
        return Err(BridgeError::InvalidPath(path.to_string()));
    };

    let context = tc.get_current_context();
    let mut target = context.global(tc);

    for segment in namespaces {
        let key = engine_string(tc, segment)?;
        let existing = match target.get(tc, key.into()) {
            Some(value) => value,
            None => return Err(property_failure(tc, path)),
        };

        if existing.is_undefined() {
            let namespace = v8::Object::new(tc);
            store_property(tc, target, key, namespace.into(), path, segment)?;
            target = namespace;
        } else if existing.is_object() && !existing.is_function() && !existing.is_array() {
            target = v8::Local::<v8::Object>::try_from(existing)
                .map_err(|_| BridgeError::Conversion("Failed to cast namespace".to_string()))?;
        } else {
            return Err(BridgeError::NameConflict {
                path: path.to_string(),
                segment: segment.to_string(),
            });
        }
    }

    let id = v8::Number::new(tc, context_id as f64);
    let full_path = engine_string(tc, path)?;
    let data = v8::Array::new_with_elements(tc, &[id.into(), full_path.into()]);
    let function = v8::Function::builder(dispatch_host_call)
        .data(data.into())
        .build(tc)
        .ok_or_else(|| BridgeError::Allocation(format!("Failed to create binding for '{}'", path)))?;
    let name = engine_string(tc, last)?;
    function.set_name(name);

    store_property(tc, target, name, function.into(), path, last)
}

/// Assign `target[key] = value` and confirm it took. Sloppy-mode stores
/// into frozen objects or read-only properties succeed without writing.
fn store_property(
    tc: &mut v8::TryCatch<v8::HandleScope>,
    target: v8::Local<v8::Object>,
    key: v8::Local<v8::String>,
    value: v8::Local<v8::Value>,
    path: &str,
    segment: &str,
) -> Result<(), BridgeError> {
    if target.set(tc, key.into(), value).is_none() {
        return Err(property_failure(tc, path));
    }
    let Some(stored) = target.get(tc, key.into()) else {
        return Err(property_failure(tc, path));
    };
    if !stored.strict_equals(value) {
        return Err(BridgeError::NameConflict {
            path: path.to_string(),
            segment: segment.to_string(),
        });
    }
    Ok(())
}

fn engine_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &str,
) -> Result<v8::Local<'s, v8::String>, BridgeError> {
    v8::String::new(scope, value)
        .ok_or_else(|| BridgeError::Allocation(format!("String of {} bytes is too large", value.len())))
}

fn throw_error(scope: &mut v8::HandleScope, error: &JsErrorValue) {
    if let Ok(exception) = error_to_engine(scope, error) {
        scope.throw_exception(exception);
    }
}

/// Read the `[context id, path]` pair stored on a binding.
fn binding_target(
    scope: &mut v8::HandleScope,
    data: v8::Local<v8::Value>,
) -> Option<(ContextId, String)> {
    let data = v8::Local::<v8::Array>::try_from(data).ok()?;
    let id = data.get_index(scope, 0)?.number_value(scope)?;
    let path = data.get_index(scope, 1)?.to_rust_string_lossy(scope);
    Some((id as ContextId, path))
}

fn dispatch_host_call<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    mut rv: v8::ReturnValue,
) {
    let Ok(state) = isolate_state(scope) else {
        return;
    };
    let Some((context_id, path)) = binding_target(scope, args.data()) else {
        throw_error(scope, &JsErrorValue::new("Error", "Malformed host function binding"));
        return;
    };
    let Ok((_, shared)) = state.lookup(context_id) else {
        throw_error(scope, &JsErrorValue::new("Error", "Context has been disposed"));
        return;
    };
    let Some(function) = shared.registry.get(&path) else {
        throw_error(
            scope,
            &JsErrorValue::new("ReferenceError", format!("{} is not attached", path)),
        );
        return;
    };

    let mut converted = Vec::with_capacity(args.length().max(0) as usize);
    for index in 0..args.length() {
        match to_host(scope, args.get(index)) {
            Ok(value) => converted.push(value),
            Err(err) => {
                if !scope.is_execution_terminating() {
                    let message = format!("Argument {} of {}: {}", index, path, err);
                    throw_error(scope, &HostError::type_error(message).to_error_value());
                }
                return;
            }
        }
    }

    let outcome = {
        let _active = ActiveScopeGuard::enter(state.id, scope);
        catch_unwind(AssertUnwindSafe(|| function.invoke(converted)))
    };

    // A nested call was terminated; let the termination unwind the script.
    if scope.is_execution_terminating() {
        return;
    }

    match outcome {
        Ok(Ok(value)) => match to_engine(scope, &value) {
            Ok(result) => rv.set(result),
            Err(err) => {
                let message = format!("Result of {}: {}", path, err);
                throw_error(scope, &HostError::type_error(message).to_error_value());
            }
        },
        Ok(Err(host_error)) => throw_error(scope, &host_error.to_error_value()),
        Err(_) => {
            tracing::error!(isolate = state.id, path = %path, "Host function panicked");
            throw_error(
                scope,
                &JsErrorValue::new("Error", format!("Host function {} panicked", path)),
            );
        }
    }
}
