//! The shared V8 isolate and the contexts carved out of it.
//!
//! V8 isolates are `!Send`, so the isolate lives on a dedicated thread with
//! its own single-threaded tokio runtime. [`IsolateClient`] is the `Send +
//! Sync` handle the pool talks to; commands are processed in FIFO order and
//! answered over oneshot channels.
//!
//! The isolate is a bare `v8::Isolate` rather than a deno_core `JsRuntime`:
//! no host bindings, module loader or isolate-wide embedder callbacks exist
//! for callback code to reach. Every context is a fresh `v8::Context` with
//! code generation primitives removed.
//!
//! Each JS entry (hardening, compile, invoke) runs under the [`Watchdog`],
//! which terminates execution at the deadline. Memory is bounded twice: a
//! near-heap-limit callback terminates runaway heap allocation before V8
//! aborts the process, and ArrayBuffer backing stores come from a budgeted
//! allocator that refuses to grow past the same ceiling.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use deno_core::{serde_v8, v8, JsRuntime};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::SandboxError;
use crate::pool::ContextId;

/// Script run in every new context before any callback source.
const HARDEN_CONTEXT: &str = r#"
(() => {
    delete globalThis.eval;
    delete globalThis.WebAssembly;
    const lock = (proto) => Object.defineProperty(proto, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    lock(Function.prototype);
    lock(Object.getPrototypeOf(function* () {}));
    lock(Object.getPrototypeOf(async function () {}));
    lock(Object.getPrototypeOf(async function* () {}));
})();
"#;

/// Resource limits applied by the isolate thread.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IsolateLimits {
    pub memory_limit: usize,
    pub compile_timeout: Duration,
    pub invoke_timeout: Duration,
}

type Reply<T> = oneshot::Sender<Result<T, SandboxError>>;

/// Requests processed by the isolate thread.
pub(crate) enum IsolateCommand {
    CreateContext {
        id: ContextId,
        reply: Reply<()>,
    },
    Compile {
        id: ContextId,
        source: String,
        reply: Reply<()>,
    },
    Invoke {
        id: ContextId,
        args: Vec<Value>,
        reply: Reply<Option<Value>>,
    },
    Release {
        id: ContextId,
        reply: Reply<()>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// `Send + Sync` handle to the isolate thread.
pub(crate) struct IsolateClient {
    tx: mpsc::UnboundedSender<IsolateCommand>,
}

impl IsolateClient {
    /// Start the isolate thread and wait until the isolate is constructed.
    ///
    /// This blocks the calling thread while V8 starts up.
    pub(crate) fn spawn(limits: IsolateLimits) -> Result<Self, SandboxError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), SandboxError>>();

        std::thread::Builder::new()
            .name("chartbox-isolate".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(SandboxError::IsolateStartup(e.to_string())));
                        return;
                    }
                };

                let dispose_reply = rt.block_on(async move {
                    let host = match IsolateHost::new(limits) {
                        Ok(host) => host,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return None;
                        }
                    };
                    if ready_tx.send(Ok(())).is_err() {
                        return None;
                    }
                    host.run(rx).await
                });

                // The host (and with it the isolate) is gone by now.
                if let Some(reply) = dispose_reply {
                    let _ = reply.send(());
                }
                tracing::debug!("isolate thread exited");
            })
            .map_err(|e| SandboxError::IsolateStartup(e.to_string()))?;

        ready_rx.recv().map_err(|_| {
            SandboxError::IsolateStartup("isolate thread panicked during startup".into())
        })??;

        Ok(Self { tx })
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> IsolateCommand,
    ) -> Result<T, SandboxError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| SandboxError::Disposed)?;
        rx.await.map_err(|_| SandboxError::Disposed)?
    }

    pub(crate) async fn create_context(&self, id: ContextId) -> Result<(), SandboxError> {
        self.request(|reply| IsolateCommand::CreateContext { id, reply })
            .await
    }

    pub(crate) async fn compile(&self, id: ContextId, source: String) -> Result<(), SandboxError> {
        self.request(|reply| IsolateCommand::Compile { id, source, reply })
            .await
    }

    pub(crate) async fn invoke(
        &self,
        id: ContextId,
        args: Vec<Value>,
    ) -> Result<Option<Value>, SandboxError> {
        self.request(|reply| IsolateCommand::Invoke { id, args, reply })
            .await
    }

    pub(crate) async fn release(&self, id: ContextId) -> Result<(), SandboxError> {
        self.request(|reply| IsolateCommand::Release { id, reply })
            .await
    }

    /// Tear down every context and the isolate. Returns once the isolate
    /// thread has dropped its isolate, or immediately if it already has.
    pub(crate) async fn dispose(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(IsolateCommand::Dispose { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    /// Set by the callback, cleared by whoever reports the failure.
    triggered: AtomicBool,
    /// Heap limit V8 started with, restored after every exhaustion.
    initial_limit: AtomicUsize,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut c_void,
    current_heap_limit: usize,
    initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed `HeapLimitState` owned by the
    // `IsolateHost`, which drops its isolate before the box. V8 only calls
    // this on the isolate thread while the isolate is alive.
    let state = unsafe { &*(data as *const HeapLimitState) };
    state
        .initial_limit
        .store(initial_heap_limit, Ordering::SeqCst);
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Byte budget shared by every ArrayBuffer backing store in the isolate.
struct ArrayBufferBudget {
    used: AtomicUsize,
    limit: usize,
    /// Set when an allocation was refused, cleared by whoever reports it.
    denied: AtomicBool,
}

impl ArrayBufferBudget {
    fn new(limit: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit,
            denied: AtomicBool::new(false),
        }
    }

    fn reserve(&self, len: usize) -> bool {
        let granted = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(len).filter(|&total| total <= self.limit)
            })
            .is_ok();
        if !granted {
            self.denied.store(true, Ordering::SeqCst);
        }
        granted
    }

    fn give_back(&self, len: usize) {
        self.used.fetch_sub(len, Ordering::SeqCst);
    }
}

// The allocator callbacks may run on V8 background threads; the budget is
// only touched through atomics.

unsafe extern "C" fn budget_allocate(budget: &ArrayBufferBudget, len: usize) -> *mut c_void {
    if !budget.reserve(len) {
        // V8 turns a null backing store into a RangeError in the caller.
        return std::ptr::null_mut();
    }
    Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut [u8] as *mut c_void
}

unsafe extern "C" fn budget_free(budget: &ArrayBufferBudget, data: *mut c_void, len: usize) {
    budget.give_back(len);
    if data.is_null() {
        return;
    }
    // SAFETY: `data` and `len` describe a boxed slice handed out by
    // `budget_allocate`.
    drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(data as *mut u8, len)) });
}

unsafe extern "C" fn budget_drop(budget: *const ArrayBufferBudget) {
    // SAFETY: the allocator owns one strong count, taken in
    // `budgeted_allocator`.
    drop(unsafe { Arc::from_raw(budget) });
}

static BUDGET_VTABLE: v8::RustAllocatorVtable<ArrayBufferBudget> = v8::RustAllocatorVtable {
    allocate: budget_allocate,
    // Zeroed as well: uninitialized memory must never be observable from JS.
    allocate_uninitialized: budget_allocate,
    free: budget_free,
    drop: budget_drop,
};

fn budgeted_allocator(budget: &Arc<ArrayBufferBudget>) -> v8::UniqueRef<v8::Allocator> {
    // SAFETY: the handle is a leaked strong count released by `budget_drop`,
    // and the vtable is 'static.
    unsafe { v8::new_rust_allocator(Arc::into_raw(Arc::clone(budget)), &BUDGET_VTABLE) }
}

#[derive(Default)]
struct WatchState {
    deadline: Option<Instant>,
    fired: bool,
    stopped: bool,
}

struct WatchShared {
    state: Mutex<WatchState>,
    signal: Condvar,
}

/// Persistent CPU watchdog for the isolate.
///
/// `arm` sets a deadline, `disarm` clears it and reports whether the deadline
/// passed first. Once `disarm` returns, the watchdog cannot fire for that
/// run any more.
pub(crate) struct Watchdog {
    shared: Arc<WatchShared>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn spawn(handle: v8::IsolateHandle) -> std::io::Result<Self> {
        let shared = Arc::new(WatchShared {
            state: Mutex::new(WatchState::default()),
            signal: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("chartbox-watchdog".into())
            .spawn(move || {
                let shared = thread_shared;
                let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
                loop {
                    if state.stopped {
                        break;
                    }
                    match state.deadline {
                        None => {
                            state = shared
                                .signal
                                .wait(state)
                                .unwrap_or_else(PoisonError::into_inner);
                        }
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                state.deadline = None;
                                state.fired = true;
                                handle.terminate_execution();
                            } else {
                                state = shared
                                    .signal
                                    .wait_timeout(state, deadline - now)
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .0;
                            }
                        }
                    }
                }
            })?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// A timeout too large to represent as an `Instant` never fires.
    fn arm(&self, timeout: Duration) {
        let mut state = self.lock();
        state.deadline = Instant::now().checked_add(timeout);
        state.fired = false;
        self.shared.signal.notify_one();
    }

    fn disarm(&self) -> bool {
        let mut state = self.lock();
        state.deadline = None;
        let fired = std::mem::take(&mut state.fired);
        self.shared.signal.notify_one();
        fired
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WatchState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        {
            let mut state = self.lock();
            state.stopped = true;
            self.shared.signal.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// One hardened context and the callback compiled into it.
struct HostedContext {
    context: v8::Global<v8::Context>,
    function: Option<v8::Global<v8::Function>>,
}

/// Owner of the isolate. Lives only on the isolate thread.
///
/// Field order is drop order: context handles are reset while the isolate is
/// alive, the watchdog stops before the isolate goes away, and the heap-limit
/// state outlives the isolate that points at it.
struct IsolateHost {
    contexts: HashMap<ContextId, HostedContext>,
    watchdog: Watchdog,
    isolate: v8::OwnedIsolate,
    heap_state: Box<HeapLimitState>,
    buffers: Arc<ArrayBufferBudget>,
    limits: IsolateLimits,
}

impl IsolateHost {
    fn new(limits: IsolateLimits) -> Result<Self, SandboxError> {
        // Platform, flags and ICU data, once per process.
        JsRuntime::init_platform(None, false);

        let buffers = Arc::new(ArrayBufferBudget::new(limits.memory_limit));
        let create_params = v8::CreateParams::default()
            .heap_limits(0, limits.memory_limit)
            .array_buffer_allocator(budgeted_allocator(&buffers));
        let mut isolate = v8::Isolate::new(create_params);

        let heap_state = Box::new(HeapLimitState {
            handle: isolate.thread_safe_handle(),
            triggered: AtomicBool::new(false),
            initial_limit: AtomicUsize::new(0),
        });
        isolate.add_near_heap_limit_callback(near_heap_limit_callback, heap_state_ptr(&heap_state));

        let watchdog = Watchdog::spawn(isolate.thread_safe_handle())
            .map_err(|e| SandboxError::IsolateStartup(format!("failed to start watchdog: {e}")))?;

        tracing::info!(memory_limit = limits.memory_limit, "isolate started");

        Ok(Self {
            contexts: HashMap::new(),
            watchdog,
            isolate,
            heap_state,
            buffers,
            limits,
        })
    }

    /// Serve commands until disposal or until every client is gone.
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<IsolateCommand>,
    ) -> Option<oneshot::Sender<()>> {
        while let Some(command) = rx.recv().await {
            match command {
                IsolateCommand::CreateContext { id, reply } => {
                    let _ = reply.send(self.create_context(id));
                }
                IsolateCommand::Compile { id, source, reply } => {
                    let _ = reply.send(self.compile(&id, &source));
                }
                IsolateCommand::Invoke { id, args, reply } => {
                    let _ = reply.send(self.invoke(&id, &args));
                }
                IsolateCommand::Release { id, reply } => {
                    let _ = reply.send(self.release(&id));
                }
                IsolateCommand::Dispose { reply } => {
                    let leaked = self.contexts.len();
                    if leaked > 0 {
                        tracing::info!(contexts = leaked, "disposing isolate with live contexts");
                    }
                    self.contexts.clear();
                    return Some(reply);
                }
            }
        }
        None
    }

    fn create_context(&mut self, id: ContextId) -> Result<(), SandboxError> {
        if self.contexts.contains_key(&id) {
            return Err(SandboxError::ContextCreation {
                reason: format!("context {id} already exists"),
            });
        }

        self.watchdog.arm(self.limits.compile_timeout);
        let outcome = {
            let scope = &mut v8::HandleScope::new(&mut self.isolate);
            let context = v8::Context::new(scope, Default::default());
            let global = v8::Global::new(scope, context);
            let scope = &mut v8::ContextScope::new(scope, context);
            let tc = &mut v8::TryCatch::new(scope);
            run_script(tc, HARDEN_CONTEXT).map(|()| global)
        };
        let failure = self.finish_run(self.limits.compile_timeout);

        match (outcome, failure) {
            (Ok(context), None) => {
                self.contexts.insert(
                    id,
                    HostedContext {
                        context,
                        function: None,
                    },
                );
                Ok(())
            }
            (_, Some(err)) => Err(SandboxError::ContextCreation {
                reason: err.to_string(),
            }),
            (Err(message), None) => Err(SandboxError::ContextCreation { reason: message }),
        }
    }

    fn compile(&mut self, id: &ContextId, source: &str) -> Result<(), SandboxError> {
        let hosted = self
            .contexts
            .get(id)
            .ok_or_else(|| SandboxError::ContextNotFound { id: id.clone() })?;
        let wrapped = format!("({source})");

        self.watchdog.arm(self.limits.compile_timeout);
        let outcome = {
            let scope = &mut v8::HandleScope::new(&mut self.isolate);
            let context = v8::Local::new(scope, &hosted.context);
            let scope = &mut v8::ContextScope::new(scope, context);
            let tc = &mut v8::TryCatch::new(scope);
            compile_function(tc, &wrapped)
        };
        if let Some(err) = self.finish_run(self.limits.compile_timeout) {
            return Err(err);
        }

        let function = outcome?;
        if let Some(hosted) = self.contexts.get_mut(id) {
            hosted.function = Some(function);
        }
        Ok(())
    }

    fn invoke(&mut self, id: &ContextId, args: &[Value]) -> Result<Option<Value>, SandboxError> {
        let hosted = self
            .contexts
            .get(id)
            .ok_or_else(|| SandboxError::ContextNotFound { id: id.clone() })?;
        let function = hosted.function.as_ref().ok_or_else(|| SandboxError::JsError {
            message: format!("context {id} holds no compiled callback"),
        })?;

        self.watchdog.arm(self.limits.invoke_timeout);
        let outcome = {
            let scope = &mut v8::HandleScope::new(&mut self.isolate);
            let context = v8::Local::new(scope, &hosted.context);
            let scope = &mut v8::ContextScope::new(scope, context);
            let tc = &mut v8::TryCatch::new(scope);
            call_function(tc, function, args)
        };
        if let Some(err) = self.finish_run(self.limits.invoke_timeout) {
            return Err(err);
        }
        outcome
    }

    fn release(&mut self, id: &ContextId) -> Result<(), SandboxError> {
        match self.contexts.remove(id) {
            Some(_) => Ok(()),
            None => Err(SandboxError::ContextNotFound { id: id.clone() }),
        }
    }

    /// Disarm the watchdog and classify a terminated run. Clears any pending
    /// termination so the isolate stays usable for the next command, and
    /// puts the heap limit back where it started after an exhaustion.
    fn finish_run(&mut self, timeout: Duration) -> Option<SandboxError> {
        let timed_out = self.watchdog.disarm();
        let heap_exhausted = self.heap_state.triggered.swap(false, Ordering::SeqCst);
        let buffers_denied = self.buffers.denied.swap(false, Ordering::SeqCst);

        if timed_out || heap_exhausted {
            self.isolate.cancel_terminate_execution();
        }
        if heap_exhausted {
            self.isolate.low_memory_notification();
            // The callback raised the limit by its grace; removing it
            // restores the initial limit, then it is armed again.
            let initial = self.heap_state.initial_limit.load(Ordering::SeqCst);
            self.isolate
                .remove_near_heap_limit_callback(near_heap_limit_callback, initial);
            let data = heap_state_ptr(&self.heap_state);
            self.isolate
                .add_near_heap_limit_callback(near_heap_limit_callback, data);
            tracing::debug!(heap_limit = initial, "heap limit restored");
        }
        if heap_exhausted || buffers_denied {
            return Some(SandboxError::HeapLimitExceeded);
        }
        if timed_out {
            return Some(SandboxError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        None
    }
}

fn heap_state_ptr(state: &HeapLimitState) -> *mut c_void {
    state as *const HeapLimitState as *mut c_void
}

fn exception_message(tc: &mut v8::TryCatch<v8::HandleScope>) -> String {
    match tc.exception() {
        Some(exception) => exception.to_rust_string_lossy(tc),
        None => "execution terminated".to_string(),
    }
}

fn run_script(tc: &mut v8::TryCatch<v8::HandleScope>, code: &str) -> Result<(), String> {
    let source = v8::String::new(tc, code).ok_or_else(|| "failed to allocate source".to_string())?;
    let Some(script) = v8::Script::compile(tc, source, None) else {
        return Err(exception_message(tc));
    };
    match script.run(tc) {
        Some(_) => Ok(()),
        None => Err(exception_message(tc)),
    }
}

fn compile_function(
    tc: &mut v8::TryCatch<v8::HandleScope>,
    code: &str,
) -> Result<v8::Global<v8::Function>, SandboxError> {
    let js_error = |message: String| SandboxError::JsError { message };

    let source = v8::String::new(tc, code)
        .ok_or_else(|| js_error("failed to allocate callback source".into()))?;
    let Some(script) = v8::Script::compile(tc, source, None) else {
        return Err(js_error(exception_message(tc)));
    };
    let Some(value) = script.run(tc) else {
        return Err(js_error(exception_message(tc)));
    };
    let function = v8::Local::<v8::Function>::try_from(value).map_err(|_| {
        SandboxError::NotAFunction {
            found: value.type_of(tc).to_rust_string_lossy(tc),
        }
    })?;
    Ok(v8::Global::new(tc, function))
}

fn call_function(
    tc: &mut v8::TryCatch<v8::HandleScope>,
    function: &v8::Global<v8::Function>,
    args: &[Value],
) -> Result<Option<Value>, SandboxError> {
    let function = v8::Local::new(tc, function);

    // serde_v8 builds fresh V8 values in the entered context: a deep copy.
    let mut argv = Vec::with_capacity(args.len());
    for arg in args {
        let value = serde_v8::to_v8(tc, arg).map_err(|e| SandboxError::JsError {
            message: format!("failed to copy argument into sandbox: {e}"),
        })?;
        argv.push(value);
    }

    let receiver: v8::Local<v8::Value> = v8::undefined(tc).into();
    let Some(result) = function.call(tc, receiver, &argv) else {
        return Err(SandboxError::JsError {
            message: exception_message(tc),
        });
    };

    if result.is_undefined() {
        return Ok(None);
    }
    if result.is_function() || result.is_symbol() {
        return Err(SandboxError::JsError {
            message: "callback returned a value that cannot leave the sandbox".into(),
        });
    }
    serde_v8::from_v8::<Value>(tc, result)
        .map(Some)
        .map_err(|e| SandboxError::JsError {
            message: format!("failed to copy result out of sandbox: {e}"),
        })
}
