//! Pool of isolated execution contexts sharing one V8 isolate.
//!
//! The pool owns the bookkeeping (ids, timestamps, capacity) on the async
//! side; the V8 contexts themselves live on the isolate thread and are
//! addressed by [`ContextId`].
//!
//! **Lifecycle invariant**: once [`ContextPool::dispose_all`] has run, no
//! operation reaches the isolate again. Creation, compilation and invocation
//! fail with [`SandboxError::Disposed`], removal reports `false` and the idle
//! sweep reports zero.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::SandboxError;
use crate::isolate::{IsolateClient, IsolateLimits};
use crate::screener::DEFAULT_MAX_SOURCE_SIZE;

/// Opaque identifier of one execution context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ContextId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Configuration for a [`ContextPool`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// V8 heap ceiling for the shared isolate, in bytes.
    pub memory_limit: usize,
    /// Contexts unused for longer than this are reclaimed by the reaper.
    pub idle_timeout: Duration,
    /// How often the reaper sweeps.
    pub reap_interval: Duration,
    /// Budget for hardening a context and compiling a callback into it.
    pub compile_timeout: Duration,
    /// Budget for a single callback invocation.
    pub invoke_timeout: Duration,
    /// Largest callback source accepted by the screener.
    pub max_source_size: usize,
    /// Maximum number of live contexts.
    pub max_contexts: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 128 * 1024 * 1024,
            idle_timeout: Duration::from_secs(120),
            reap_interval: Duration::from_secs(60),
            compile_timeout: Duration::from_millis(3000),
            invoke_timeout: Duration::from_millis(1000),
            max_source_size: DEFAULT_MAX_SOURCE_SIZE,
            max_contexts: 1024,
        }
    }
}

impl SandboxConfig {
    fn isolate_limits(&self) -> IsolateLimits {
        IsolateLimits {
            memory_limit: self.memory_limit,
            compile_timeout: self.compile_timeout,
            invoke_timeout: self.invoke_timeout,
        }
    }
}

/// Atomic counters for pool observability.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Contexts created.
    pub created: AtomicU64,
    /// Contexts released explicitly or by the reaper.
    pub released: AtomicU64,
    /// Contexts released by the reaper.
    pub reaped: AtomicU64,
    /// Callback sources rejected by the screener.
    pub rejected: AtomicU64,
    /// Callback sources that failed to compile to a function.
    pub compile_failures: AtomicU64,
    /// Invocations that reached the isolate.
    pub invocations: AtomicU64,
    /// Invocations that failed (timeout, exception, heap limit).
    pub invocation_failures: AtomicU64,
    /// Invocations of callbacks whose context was already gone.
    pub stale_invocations: AtomicU64,
}

/// Snapshot of one live context.
#[derive(Debug, Clone)]
pub struct ContextInfo {
    /// Context id.
    pub id: ContextId,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
    /// Time since the context was last used.
    pub idle: Duration,
}

#[derive(Debug)]
struct ContextEntry {
    created_at: DateTime<Utc>,
    created: Instant,
    last_used: Instant,
}

/// Isolated execution contexts carved from one V8 isolate.
pub struct ContextPool {
    config: SandboxConfig,
    isolate: IsolateClient,
    contexts: Mutex<HashMap<ContextId, ContextEntry>>,
    metrics: PoolMetrics,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ContextPool {
    /// Start the isolate and, when called inside a tokio runtime, the idle
    /// reaper.
    pub fn new(config: SandboxConfig) -> Result<Arc<Self>, SandboxError> {
        let isolate = IsolateClient::spawn(config.isolate_limits())?;
        let pool = Arc::new(Self {
            config,
            isolate,
            contexts: Mutex::new(HashMap::new()),
            metrics: PoolMetrics::default(),
            reaper: std::sync::Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        if tokio::runtime::Handle::try_current().is_ok() {
            pool.start_reaper();
        }
        Ok(pool)
    }

    /// The configuration this pool was built with.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Pool counters.
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Whether [`dispose_all`](Self::dispose_all) has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Create and harden a fresh context.
    #[tracing::instrument(skip(self))]
    pub async fn create_context(&self) -> Result<ContextId, SandboxError> {
        if self.is_disposed() {
            return Err(SandboxError::Disposed);
        }

        let id = ContextId::generate();
        {
            let mut contexts = self.contexts.lock().await;
            if contexts.len() >= self.config.max_contexts {
                return Err(SandboxError::CapacityExceeded {
                    max: self.config.max_contexts,
                });
            }
            let now = Instant::now();
            contexts.insert(
                id.clone(),
                ContextEntry {
                    created_at: Utc::now(),
                    created: now,
                    last_used: now,
                },
            );
        }

        if let Err(e) = self.isolate.create_context(id.clone()).await {
            self.contexts.lock().await.remove(&id);
            return Err(match e {
                SandboxError::Disposed | SandboxError::ContextCreation { .. } => e,
                other => SandboxError::ContextCreation {
                    reason: other.to_string(),
                },
            });
        }

        self.metrics.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(context_id = %id, "context created");
        Ok(id)
    }

    /// Compile a function-literal source into the context.
    #[tracing::instrument(skip(self, id, source), fields(context_id = %id))]
    pub async fn compile(&self, id: &ContextId, source: &str) -> Result<(), SandboxError> {
        if self.is_disposed() {
            return Err(SandboxError::Disposed);
        }
        if !self.contains(id).await {
            return Err(SandboxError::ContextNotFound { id: id.clone() });
        }

        let result = self.isolate.compile(id.clone(), source.to_string()).await;
        if let Err(e) = &result {
            self.metrics.compile_failures.fetch_add(1, Ordering::Relaxed);
            if matches!(e, SandboxError::HeapLimitExceeded) {
                self.remove_context(id).await;
            }
        }
        result
    }

    /// Call the context's compiled callback with deep copies of `args`.
    ///
    /// Refreshes the context's last-used time. A heap-limit failure removes
    /// the context.
    pub async fn invoke(
        &self,
        id: &ContextId,
        args: Vec<Value>,
    ) -> Result<Option<Value>, SandboxError> {
        if self.is_disposed() {
            return Err(SandboxError::Disposed);
        }
        {
            let mut contexts = self.contexts.lock().await;
            let entry = contexts
                .get_mut(id)
                .ok_or_else(|| SandboxError::ContextNotFound { id: id.clone() })?;
            entry.last_used = Instant::now();
        }

        self.metrics.invocations.fetch_add(1, Ordering::Relaxed);
        let result = self.isolate.invoke(id.clone(), args).await;
        if let Err(e) = &result {
            self.metrics
                .invocation_failures
                .fetch_add(1, Ordering::Relaxed);
            if matches!(e, SandboxError::HeapLimitExceeded) {
                tracing::warn!(context_id = %id, "heap limit reached, removing context");
                self.remove_context(id).await;
            }
        }
        result
    }

    /// Release a context. Returns `true` only if it was live and released.
    #[tracing::instrument(skip(self, id), fields(context_id = %id))]
    pub async fn remove_context(&self, id: &ContextId) -> bool {
        if self.is_disposed() {
            return false;
        }
        if self.contexts.lock().await.remove(id).is_none() {
            tracing::debug!("context already removed");
            return false;
        }

        match self.isolate.release(id.clone()).await {
            Ok(()) => {
                self.metrics.released.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to release context");
                false
            }
        }
    }

    /// Remove every context idle for longer than the idle timeout.
    pub async fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Instant::now()).await
    }

    /// [`cleanup_expired`](Self::cleanup_expired) against an explicit clock.
    ///
    /// A context idle for exactly the timeout is kept.
    pub async fn cleanup_expired_at(&self, now: Instant) -> usize {
        if self.is_disposed() {
            return 0;
        }

        let expired: Vec<ContextId> = {
            let contexts = self.contexts.lock().await;
            contexts
                .iter()
                .filter(|(_, entry)| {
                    now.saturating_duration_since(entry.last_used) > self.config.idle_timeout
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut removed = 0;
        for id in expired {
            if self.remove_context(&id).await {
                self.metrics.reaped.fetch_add(1, Ordering::Relaxed);
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "reaped idle contexts");
        }
        removed
    }

    /// Start the periodic idle sweep. A no-op if one is already running.
    ///
    /// The task holds only a weak reference and exits once the pool is
    /// disposed or dropped.
    pub fn start_reaper(self: &Arc<Self>) {
        let mut reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner);
        if reaper.as_ref().is_some_and(|task| !task.is_finished()) || self.is_disposed() {
            return;
        }

        let pool: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.reap_interval;
        *reaper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if pool.is_disposed() {
                    break;
                }
                pool.cleanup_expired().await;
            }
            tracing::debug!("reaper stopped");
        }));
    }

    /// Tear down every context and the isolate. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn dispose_all(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        let dropped = {
            let mut contexts = self.contexts.lock().await;
            let count = contexts.len();
            contexts.clear();
            count
        };
        self.isolate.dispose().await;
        tracing::info!(contexts = dropped, "context pool disposed");
    }

    /// Number of live contexts.
    pub async fn len(&self) -> usize {
        self.contexts.lock().await.len()
    }

    /// Whether no contexts are live.
    pub async fn is_empty(&self) -> bool {
        self.contexts.lock().await.is_empty()
    }

    /// Whether `id` is live.
    pub async fn contains(&self, id: &ContextId) -> bool {
        self.contexts.lock().await.contains_key(id)
    }

    /// When `id` was last created or invoked.
    pub async fn last_used(&self, id: &ContextId) -> Option<Instant> {
        self.contexts.lock().await.get(id).map(|entry| entry.last_used)
    }

    /// Snapshot of live contexts, oldest first.
    pub async fn contexts(&self) -> Vec<ContextInfo> {
        let now = Instant::now();
        let contexts = self.contexts.lock().await;
        let mut entries: Vec<(&ContextId, &ContextEntry)> = contexts.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.created);
        entries
            .into_iter()
            .map(|(id, entry)| ContextInfo {
                id: id.clone(),
                created_at: entry.created_at,
                idle: now.saturating_duration_since(entry.last_used),
            })
            .collect()
    }
}

impl Drop for ContextPool {
    fn drop(&mut self) {
        // The isolate thread winds down once its channel closes.
        if let Some(task) = self
            .reaper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
