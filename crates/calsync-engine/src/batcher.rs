//! Request batcher for outbound provider calls.
//!
//! Requests submitted within `batch_timeout` of the first pending one are
//! flushed together. A flush orders them by priority then arrival, groups
//! them by `(provider, method)` and cuts each group into sub-batches of at
//! most `max_batch_size`. Sub-batches are dispatched in that order, each
//! holding one of `max_concurrent_batches` permits while its requests run
//! concurrently.
//!
//! ```text
//! submit ──► pending ──(window)──► sort ─► group ─► chunk ─► permit ─► run
//!               ▲                                                     │
//!               └──────────────── retry after backoff ◄───────────────┘
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use calsync_core::{Priority, ProviderKind};
use calsync_providers::{ProviderError, ProviderResult};
use futures_util::future::{BoxFuture, FutureExt, join_all};
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::config::BatcherConfig;
use crate::error::{EngineError, EngineResult};
use crate::retry::RetryPolicy;

/// Identifier of a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// How a request is grouped, ordered and retried.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub kind: ProviderKind,
    /// Operation name; requests with the same kind and method batch together.
    pub method: &'static str,
    /// What the request addresses (account, event id), for logs.
    pub target: String,
    pub priority: Priority,
    /// `None` means a single attempt.
    pub retry: Option<RetryPolicy>,
    /// Overrides the configured request timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new(kind: ProviderKind, method: &'static str, target: impl Into<String>) -> Self {
        Self {
            kind,
            method,
            target: target.into(),
            priority: Priority::default(),
            retry: None,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Batcher statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatcherStats {
    pub pending: usize,
    pub executing_batches: usize,
    pub batches_dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    /// Requests dropped from the queue at their deadline, never dispatched.
    pub timed_out: u64,
    pub cancelled: u64,
}

type Call = Arc<dyn Fn() -> BoxFuture<'static, ProviderResult<()>> + Send + Sync>;

struct Pending {
    id: RequestId,
    seq: u64,
    options: RequestOptions,
    attempts: u32,
    call: Call,
    outcome: oneshot::Sender<EngineResult<()>>,
}

#[derive(Default)]
struct Queue {
    pending: Vec<Pending>,
    /// Arrival of the oldest pending request; opens the collection window.
    window_opened: Option<Instant>,
    closed: bool,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

struct BatcherCore {
    config: BatcherConfig,
    queue: Mutex<Queue>,
    notify: Notify,
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
    executing: AtomicUsize,
    counters: Counters,
}

struct Running {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Coalesces provider calls into prioritized, concurrency-bounded batches.
pub struct RequestBatcher {
    core: Arc<BatcherCore>,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for RequestBatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBatcher")
            .field("config", &self.core.config)
            .finish_non_exhaustive()
    }
}

/// A submitted request.
pub struct BatchHandle<T> {
    id: RequestId,
    result: BoxFuture<'static, EngineResult<T>>,
}

impl<T> BatchHandle<T> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the outcome. Gives up at the request's deadline.
    pub async fn wait(self) -> EngineResult<T> {
        self.result.await
    }
}

impl<T> fmt::Debug for BatchHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchHandle").field("id", &self.id).finish()
    }
}

impl RequestBatcher {
    pub fn new(config: BatcherConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_batches.max(1)));
        Self {
            core: Arc::new(BatcherCore {
                config,
                queue: Mutex::new(Queue::default()),
                notify: Notify::new(),
                permits,
                next_id: AtomicU64::new(1),
                executing: AtomicUsize::new(0),
                counters: Counters::default(),
            }),
            running: Mutex::new(None),
        }
    }

    /// Starts the dispatcher. Does nothing if already running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }
        self.core.lock().closed = false;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(Arc::clone(&self.core), shutdown_rx));
        *running = Some(Running { task, shutdown });
    }

    /// Stops the dispatcher and rejects everything still queued.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(e) = running.task.await
                && e.is_panic()
            {
                error!(error = %e, "batch dispatcher panicked");
            }
        }

        let rejected = {
            let mut queue = self.core.lock();
            queue.closed = true;
            queue.window_opened = None;
            std::mem::take(&mut queue.pending)
        };
        if !rejected.is_empty() {
            debug!(count = rejected.len(), "rejecting queued requests on stop");
        }
        for request in rejected {
            let _ = request.outcome.send(Err(EngineError::Stopped));
        }
    }

    /// Queues a request. `call` is invoked once per attempt.
    pub fn submit<T, F, Fut>(&self, options: RequestOptions, call: F) -> BatchHandle<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProviderResult<T>> + Send + 'static,
    {
        let id = RequestId(self.core.next_id.fetch_add(1, Ordering::Relaxed));
        let timeout = options.timeout.unwrap_or(self.core.config.request_timeout);
        let deadline = Instant::now() + timeout;

        // the typed value travels through the slot; the queue only sees ()
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let erased: Call = {
            let slot = Arc::clone(&slot);
            Arc::new(move || {
                let attempt = call();
                let slot = Arc::clone(&slot);
                async move {
                    let value = attempt.await?;
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
                    Ok(())
                }
                .boxed()
            })
        };

        let (outcome, receiver) = oneshot::channel();
        trace!(request = %id, method = options.method, target = %options.target, "request submitted");
        self.core.enqueue(Pending {
            id,
            seq: id.0,
            options,
            attempts: 0,
            call: erased,
            outcome,
        });

        let core = Arc::clone(&self.core);
        let result = async move {
            match tokio::time::timeout_at(deadline, receiver).await {
                Ok(Ok(Ok(()))) => slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .ok_or_else(|| {
                        EngineError::from(ProviderError::internal("request resolved without a value"))
                    }),
                Ok(Ok(Err(e))) => Err(e),
                Ok(Err(_)) => Err(EngineError::Stopped),
                Err(_) => {
                    core.expire(id);
                    Err(EngineError::from(ProviderError::timeout(format!(
                        "request timed out after {:?}",
                        timeout
                    ))))
                }
            }
        }
        .boxed();

        BatchHandle { id, result }
    }

    /// Submits and waits.
    pub async fn execute<T, F, Fut>(&self, options: RequestOptions, call: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProviderResult<T>> + Send + 'static,
    {
        self.submit(options, call).wait().await
    }

    /// Removes a queued request; its waiter gets [`EngineError::Cancelled`].
    /// Returns false once the request has been dispatched.
    pub fn cancel(&self, id: RequestId) -> bool {
        let Some(request) = self.core.remove(id) else {
            return false;
        };
        self.core.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(request = %id, "request cancelled");
        let _ = request.outcome.send(Err(EngineError::Cancelled));
        true
    }

    pub fn stats(&self) -> BatcherStats {
        let counters = &self.core.counters;
        BatcherStats {
            pending: self.core.lock().pending.len(),
            executing_batches: self.core.executing.load(Ordering::Relaxed),
            batches_dispatched: counters.dispatched.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
        }
    }
}

impl Drop for RequestBatcher {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.task.abort();
        }
    }
}

impl BatcherCore {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, request: Pending) {
        let mut queue = self.lock();
        if queue.closed {
            drop(queue);
            let _ = request.outcome.send(Err(EngineError::Stopped));
            return;
        }
        if queue.pending.is_empty() {
            queue.window_opened = Some(Instant::now());
        }
        queue.pending.push(request);
        drop(queue);
        self.notify.notify_one();
    }

    fn remove(&self, id: RequestId) -> Option<Pending> {
        let mut queue = self.lock();
        let index = queue.pending.iter().position(|request| request.id == id)?;
        let request = queue.pending.remove(index);
        if queue.pending.is_empty() {
            queue.window_opened = None;
        }
        Some(request)
    }

    /// Drops a request whose waiter hit its deadline while it was queued.
    /// One already dispatched is left to finish and is counted there.
    fn expire(&self, id: RequestId) {
        if self.remove(id).is_some() {
            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            debug!(request = %id, "request timed out while queued");
        } else {
            debug!(request = %id, "request timed out in flight");
        }
    }

    fn window_end(&self) -> Option<Instant> {
        self.lock()
            .window_opened
            .map(|opened| opened + self.config.batch_timeout)
    }

    /// Drains the queue into ordered sub-batches.
    fn take_batches(&self) -> Vec<Vec<Pending>> {
        let mut drained = {
            let mut queue = self.lock();
            queue.window_opened = None;
            std::mem::take(&mut queue.pending)
        };
        // waiters that already gave up
        drained.retain(|request| !request.outcome.is_closed());
        drained.sort_by_key(|request| (request.options.priority, request.seq));

        let mut groups: Vec<((ProviderKind, &'static str), Vec<Pending>)> = Vec::new();
        for request in drained {
            let key = (request.options.kind, request.options.method);
            match groups.iter_mut().find(|(group, _)| *group == key) {
                Some((_, members)) => members.push(request),
                None => groups.push((key, vec![request])),
            }
        }

        let size = self.config.max_batch_size.max(1);
        let mut batches = Vec::new();
        for (_, members) in groups {
            let mut members = members.into_iter().peekable();
            while members.peek().is_some() {
                batches.push(members.by_ref().take(size).collect());
            }
        }
        batches
    }

    async fn run_batch(self: Arc<Self>, batch: Vec<Pending>, _permit: OwnedSemaphorePermit) {
        self.executing.fetch_add(1, Ordering::Relaxed);
        if let Some(first) = batch.first() {
            debug!(
                size = batch.len(),
                provider = %first.options.kind,
                method = first.options.method,
                "dispatching batch"
            );
        }
        join_all(
            batch
                .into_iter()
                .map(|request| Arc::clone(&self).run_request(request)),
        )
        .await;
        self.executing.fetch_sub(1, Ordering::Relaxed);
    }

    async fn run_request(self: Arc<Self>, mut request: Pending) {
        request.attempts += 1;
        let error = match (request.call)().await {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                let _ = request.outcome.send(Ok(()));
                return;
            }
            Err(e) => e,
        };

        let retry_in = match request.options.retry.as_ref() {
            Some(policy) if error.can_resend() && policy.allows_another(request.attempts) => {
                Some(policy.backoff_with_hint(request.attempts, error.retry_after()))
            }
            _ => None,
        };

        match retry_in {
            Some(delay) => {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                warn!(
                    request = %request.id,
                    method = request.options.method,
                    target = %request.options.target,
                    attempt = request.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "request failed, retrying"
                );
                let core = Arc::clone(&self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    core.enqueue(request);
                });
            }
            None => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                debug!(request = %request.id, attempts = request.attempts, error = %error, "request failed");
                let error = if request.attempts > 1 {
                    EngineError::permanent(request.attempts, error)
                } else {
                    EngineError::Provider(error)
                };
                let _ = request.outcome.send(Err(error));
            }
        }
    }
}

async fn run_loop(core: Arc<BatcherCore>, mut shutdown: watch::Receiver<bool>) {
    debug!(
        batch_timeout_ms = core.config.batch_timeout.as_millis() as u64,
        max_batch_size = core.config.max_batch_size,
        max_concurrent_batches = core.config.max_concurrent_batches,
        "batch dispatcher started"
    );
    'dispatch: loop {
        match core.window_end() {
            Some(flush_at) => tokio::select! {
                _ = tokio::time::sleep_until(flush_at) => {}
                _ = shutdown.changed() => break,
            },
            None => {
                tokio::select! {
                    _ = core.notify.notified() => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            }
        }

        let mut batches = core.take_batches().into_iter();
        while let Some(batch) = batches.next() {
            let permit = tokio::select! {
                permit = Arc::clone(&core.permits).acquire_owned() => permit,
                _ = shutdown.changed() => {
                    for request in std::iter::once(batch).chain(batches).flatten() {
                        let _ = request.outcome.send(Err(EngineError::Stopped));
                    }
                    break 'dispatch;
                }
            };
            let Ok(permit) = permit else { break 'dispatch };
            core.counters.dispatched.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(Arc::clone(&core).run_batch(batch, permit));
        }
    }
    debug!("batch dispatcher stopped");
}
