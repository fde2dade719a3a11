//! Credential lease refresh scheduling.
//!
//! Each provider with a registered [`LeaseRefresher`] and a stored lease is
//! armed in one min-heap at `expires_at - refresh_margin`. A single loop
//! fires due entries. Failed refreshes are retried with the shared
//! [`RetryPolicy`]; refresh errors that another attempt cannot fix (revoked
//! grant, missing permission, malformed request) end the schedule for that
//! provider and mark it as needing reauthentication.
//!
//! At most one refresh per provider is in flight. A manual refresh that
//! arrives while one is running waits for it instead of spending the same
//! refresh token twice.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use calsync_core::ProviderKind;
use calsync_providers::{
    CredentialLease, CredentialStore, LeaseRefresher, ProviderError, ProviderErrorCode,
    ProviderResult,
};
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::LeaseConfig;
use crate::retry::RetryPolicy;

/// Longest the loop sleeps when nothing is armed.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

type Refresh = Shared<BoxFuture<'static, ProviderResult<CredentialLease>>>;

/// Why a provider's lease could not be refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseFailure {
    pub code: ProviderErrorCode,
    pub message: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
    /// The schedule was dropped; the user has to sign in again.
    pub reauth_required: bool,
}

/// Snapshot of the lease scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeaseHealth {
    pub is_running: bool,
    pub scheduled_providers: Vec<ProviderKind>,
    pub next_refresh: Option<DateTime<Utc>>,
    pub failures: BTreeMap<ProviderKind, LeaseFailure>,
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    due: Instant,
    attempt: u32,
}

#[derive(Debug, Clone, Copy)]
struct Due {
    kind: ProviderKind,
    attempts: u32,
    generation: u64,
}

#[derive(Default)]
struct LeaseTable {
    heap: BinaryHeap<Reverse<(Instant, ProviderKind)>>,
    armed: HashMap<ProviderKind, Armed>,
    refreshing: HashSet<ProviderKind>,
    in_flight: HashMap<ProviderKind, Refresh>,
    /// Bumped by `clear_schedule`; a refresh started under an older
    /// generation does not re-arm.
    generations: HashMap<ProviderKind, u64>,
    failures: BTreeMap<ProviderKind, LeaseFailure>,
}

impl LeaseTable {
    fn generation(&self, kind: ProviderKind) -> u64 {
        self.generations.get(&kind).copied().unwrap_or(0)
    }
}

struct LeaseCore {
    config: LeaseConfig,
    retry: RetryPolicy,
    store: Arc<dyn CredentialStore>,
    refreshers: HashMap<ProviderKind, Arc<dyn LeaseRefresher>>,
    table: Mutex<LeaseTable>,
    notify: Notify,
}

struct Running {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Schedules refreshes of provider credential leases.
pub struct LeaseScheduler {
    core: Arc<LeaseCore>,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for LeaseScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseScheduler")
            .field("config", &self.core.config)
            .field("providers", &self.core.refreshers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl LeaseScheduler {
    pub fn new(
        config: LeaseConfig,
        retry: RetryPolicy,
        store: Arc<dyn CredentialStore>,
        refreshers: HashMap<ProviderKind, Arc<dyn LeaseRefresher>>,
    ) -> Self {
        Self {
            core: Arc::new(LeaseCore {
                config,
                retry,
                store,
                refreshers,
                table: Mutex::new(LeaseTable::default()),
                notify: Notify::new(),
            }),
            running: Mutex::new(None),
        }
    }

    /// Arms every provider that has a refresher and a stored lease, then
    /// starts the refresh loop. Does nothing if already running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let mut kinds: Vec<ProviderKind> = self.core.refreshers.keys().copied().collect();
        kinds.sort();
        for kind in kinds {
            match self.schedule_token_refresh(kind) {
                Ok(Some(at)) => debug!(provider = %kind, refresh_at = %at, "lease refresh armed"),
                Ok(None) => debug!(provider = %kind, "no lease stored, nothing to refresh"),
                Err(e) => warn!(provider = %kind, error = %e, "could not arm lease refresh"),
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(Arc::clone(&self.core), shutdown_rx));
        *running = Some(Running { task, shutdown });
        info!(providers = self.core.refreshers.len(), "lease scheduler started");
    }

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
                error!(error = %e, "lease scheduler loop panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn has_refresher(&self, kind: ProviderKind) -> bool {
        self.core.refreshers.contains_key(&kind)
    }

    /// Arms a refresh for `kind` from its stored lease.
    ///
    /// Returns when the refresh is due, or `None` if no lease is stored. A
    /// lease already inside the margin is refreshed immediately.
    pub fn schedule_token_refresh(&self, kind: ProviderKind) -> ProviderResult<Option<DateTime<Utc>>> {
        if !self.core.refreshers.contains_key(&kind) {
            return Err(ProviderError::configuration("no lease refresher registered").with_provider(kind));
        }
        let Some(lease) = self.core.store.retrieve(kind)? else {
            self.clear_schedule(kind);
            return Ok(None);
        };
        let refresh_at = lease.refresh_at(self.core.config.margin());
        self.core.arm(kind, refresh_at, 0);
        Ok(Some(refresh_at))
    }

    /// Refreshes the lease for `kind` now, with a single attempt.
    ///
    /// Joins a refresh already in flight for `kind` rather than starting a
    /// second one; the task that started it then owns the rescheduling.
    pub async fn refresh_provider_token(&self, kind: ProviderKind) -> ProviderResult<CredentialLease> {
        let (refresh, started, generation) = self.core.join_refresh(kind);
        if !started {
            debug!(provider = %kind, "joining refresh already in flight");
            return refresh.await;
        }

        match refresh.await {
            Ok(lease) => {
                self.core.rearm(kind, &lease, generation);
                Ok(lease)
            }
            Err(e) => {
                if e.code().is_terminal_for_refresh() {
                    self.core.give_up(kind, &e, 1);
                } else {
                    self.core.record_failure(kind, &e, 1, false);
                }
                Err(e)
            }
        }
    }

    /// Drops any pending refresh for `kind`. A refresh already running
    /// completes but does not re-arm. Returns true if one was armed or
    /// running.
    pub fn clear_schedule(&self, kind: ProviderKind) -> bool {
        let mut table = self.core.lock();
        *table.generations.entry(kind).or_insert(0) += 1;
        let removed = table.armed.remove(&kind).is_some() || table.in_flight.contains_key(&kind);
        drop(table);
        if removed {
            debug!(provider = %kind, "lease schedule cleared");
        }
        removed
    }

    /// Last recorded refresh failure for `kind`.
    pub fn failure(&self, kind: ProviderKind) -> Option<LeaseFailure> {
        self.core.lock().failures.get(&kind).cloned()
    }

    pub fn get_health_status(&self) -> LeaseHealth {
        let now = Instant::now();
        let wall = Utc::now();
        let table = self.core.lock();

        let mut scheduled: Vec<ProviderKind> = table
            .armed
            .keys()
            .chain(table.refreshing.iter())
            .copied()
            .collect();
        scheduled.sort();
        scheduled.dedup();

        let next_refresh = table
            .armed
            .values()
            .map(|armed| armed.due.saturating_duration_since(now))
            .min()
            .map(|delay| wall + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()));

        LeaseHealth {
            is_running: self.is_running(),
            scheduled_providers: scheduled,
            next_refresh,
            failures: table.failures.clone(),
        }
    }
}

impl Drop for LeaseScheduler {
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

impl LeaseCore {
    fn lock(&self) -> MutexGuard<'_, LeaseTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(&self, kind: ProviderKind, refresh_at: DateTime<Utc>, attempt: u32) {
        let delay = (refresh_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.arm_after(kind, delay, attempt);
    }

    fn arm_after(&self, kind: ProviderKind, delay: Duration, attempt: u32) {
        let due = Instant::now() + delay;
        {
            let mut table = self.lock();
            table.armed.insert(kind, Armed { due, attempt });
            table.heap.push(Reverse((due, kind)));
        }
        self.notify.notify_one();
    }

    /// Pops every due entry and marks it as refreshing.
    fn take_due(&self) -> Vec<Due> {
        let now = Instant::now();
        let mut guard = self.lock();
        let table = &mut *guard;

        let mut due = Vec::new();
        while let Some(&Reverse((at, kind))) = table.heap.peek() {
            if at > now {
                break;
            }
            table.heap.pop();
            let live = table.armed.get(&kind).is_some_and(|armed| armed.due == at);
            if !live || table.refreshing.contains(&kind) {
                continue;
            }
            if let Some(armed) = table.armed.remove(&kind) {
                table.refreshing.insert(kind);
                due.push(Due {
                    kind,
                    attempts: armed.attempt,
                    generation: table.generation(kind),
                });
            }
        }
        due
    }

    fn next_wake(&self) -> Instant {
        let fallback = Instant::now() + IDLE_WAKE;
        match self.lock().heap.peek() {
            Some(&Reverse((at, _))) => at.min(fallback),
            None => fallback,
        }
    }

    /// The refresh in flight for `kind`, starting one if there is none.
    /// Also returns whether this call started it and the schedule
    /// generation it started under.
    fn join_refresh(self: &Arc<Self>, kind: ProviderKind) -> (Refresh, bool, u64) {
        let mut table = self.lock();
        let generation = table.generation(kind);
        if let Some(refresh) = table.in_flight.get(&kind) {
            return (refresh.clone(), false, generation);
        }
        let core = Arc::clone(self);
        let refresh = async move {
            let result = core.refresh_once(kind).await;
            core.lock().in_flight.remove(&kind);
            result
        }
        .boxed()
        .shared();
        table.in_flight.insert(kind, refresh.clone());
        (refresh, true, generation)
    }

    fn is_current(&self, kind: ProviderKind, generation: u64) -> bool {
        self.lock().generation(kind) == generation
    }

    async fn refresh_once(&self, kind: ProviderKind) -> ProviderResult<CredentialLease> {
        let refresher = self.refreshers.get(&kind).cloned().ok_or_else(|| {
            ProviderError::configuration("no lease refresher registered").with_provider(kind)
        })?;
        let current = self.store.retrieve(kind)?.ok_or_else(|| {
            ProviderError::auth_expired("no credential lease stored").with_provider(kind)
        })?;

        let renewed = refresher.refresh(&current).await?;
        self.store.store(kind, renewed.clone())?;
        self.lock().failures.remove(&kind);
        Ok(renewed)
    }

    /// Arms the next refresh from a freshly stored lease, unless the
    /// schedule was cleared since `generation`.
    fn rearm(&self, kind: ProviderKind, lease: &CredentialLease, generation: u64) {
        let refresh_at = lease.refresh_at(self.config.margin());
        if !self.is_current(kind, generation) {
            info!(provider = %kind, expires_at = %lease.expires_at, "credential lease refreshed, schedule cleared");
            return;
        }
        self.arm(kind, refresh_at, 0);
        info!(
            provider = %kind,
            expires_at = %lease.expires_at,
            next_refresh = %refresh_at,
            "credential lease refreshed"
        );
    }

    async fn run_scheduled(self: Arc<Self>, due: Due) {
        let Due { kind, generation, .. } = due;
        let attempt = due.attempts + 1;
        let (refresh, _, _) = self.join_refresh(kind);
        let result = refresh.await;
        self.lock().refreshing.remove(&kind);

        let e = match result {
            Ok(lease) => {
                self.rearm(kind, &lease, generation);
                return;
            }
            Err(e) => e,
        };
        if e.code().is_terminal_for_refresh() || !self.retry.allows_another(attempt) {
            self.give_up(kind, &e, attempt);
            return;
        }
        if !self.is_current(kind, generation) {
            self.record_failure(kind, &e, attempt, false);
            debug!(provider = %kind, error = %e, "refresh failed after schedule was cleared");
            return;
        }

        let delay = self.retry.backoff_with_hint(attempt, e.retry_after());
        self.record_failure(kind, &e, attempt, false);
        warn!(
            provider = %kind,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "credential refresh failed, retrying"
        );
        self.arm_after(kind, delay, attempt);
    }

    fn give_up(&self, kind: ProviderKind, e: &ProviderError, attempts: u32) {
        self.lock().armed.remove(&kind);
        self.record_failure(kind, e, attempts, true);
        error!(
            provider = %kind,
            code = %e.code(),
            attempts,
            error = %e,
            "credential refresh failed, reauthentication required"
        );
    }

    fn record_failure(&self, kind: ProviderKind, e: &ProviderError, attempts: u32, reauth_required: bool) {
        self.lock().failures.insert(
            kind,
            LeaseFailure {
                code: e.code(),
                message: e.to_string(),
                attempts,
                at: Utc::now(),
                reauth_required,
            },
        );
    }
}

async fn run_loop(core: Arc<LeaseCore>, mut shutdown: watch::Receiver<bool>) {
    loop {
        for due in core.take_due() {
            debug!(provider = %due.kind, attempts = due.attempts, "lease refresh due");
            tokio::spawn(Arc::clone(&core).run_scheduled(due));
        }

        let wake_at = core.next_wake();
        tokio::select! {
            _ = tokio::time::sleep_until(wake_at) => {}
            _ = core.notify.notified() => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("lease scheduler stopped");
}
