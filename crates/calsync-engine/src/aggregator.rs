//! Composition root: one query and command surface over every account.
//!
//! ```text
//!  caller ──► CalendarAggregator ──► TtlCache ──hit──► value
//!                                       │ miss (single flight)
//!                                       ▼
//!                               RequestBatcher ──► EventProvider ──► normalize
//!
//!  SyncScheduler ──JobRunner──► AggregatorInner (refills the cache)
//!  LeaseScheduler ──────────────► CredentialStore (keeps tokens fresh)
//! ```
//!
//! Reads go through the cache. A background events sync keeps the whole
//! synced range per account, and any read inside it is served from there.
//! Mutations go straight to the provider and invalidate the account's cached
//! event ranges. A call rejected for an expired credential is resent once
//! after a lease refresh. Call
//! [`start`](CalendarAggregator::start) before issuing requests: the batcher
//! only dispatches while running.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use calsync_core::{AccountId, EventDraft, Priority, ProviderKind, TimeWindow};
use calsync_providers::{
    AccountProfile, BoxFuture, CalendarInfo, CanonicalEvent, CredentialStore, EventProvider,
    LeaseRefresher, MemoryCredentialStore, ProviderError, ProviderErrorCode, ProviderResult,
    normalize_events,
};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::activity::ActivityMonitor;
use crate::batcher::{BatchHandle, BatcherStats, RequestBatcher, RequestOptions};
use crate::cache::{CacheKey, CacheStats, TtlCache};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::lease::{LeaseHealth, LeaseScheduler};
use crate::scheduler::{JobId, JobKind, JobRunner, SchedulerStats, SyncJob, SyncScheduler};

/// Whether an account's credentials currently work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    /// The account needs to be re-authorized.
    Disconnected { reason: ProviderErrorCode },
    /// Not verified yet.
    Unknown,
}

/// What the engine knows about one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountConnection {
    pub id: AccountId,
    pub provider_kind: ProviderKind,
    pub status: ConnectionStatus,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub calendar_count: Option<usize>,
    pub profile: Option<AccountProfile>,
    /// Message of the most recent failed call, cleared on success.
    pub last_error: Option<String>,
}

/// Values held in the aggregator's cache.
#[derive(Debug, Clone)]
pub enum CachePayload {
    Events(Arc<Vec<CanonicalEvent>>),
    /// Everything a background sync fetched for one account.
    Synced {
        window: TimeWindow,
        events: Arc<Vec<CanonicalEvent>>,
    },
    Account(AccountConnection),
    Calendars(Arc<Vec<CalendarInfo>>),
}

impl CachePayload {
    fn name(&self) -> &'static str {
        match self {
            Self::Events(_) => "events",
            Self::Synced { .. } => "synced events",
            Self::Account(_) => "account",
            Self::Calendars(_) => "calendars",
        }
    }

    fn mismatch(self, expected: &str) -> EngineError {
        ProviderError::internal(format!(
            "cache entry holds {} where {} was expected",
            self.name(),
            expected
        ))
        .into()
    }

    fn into_events(self) -> EngineResult<Vec<CanonicalEvent>> {
        match self {
            Self::Events(events) => Ok(Arc::unwrap_or_clone(events)),
            other => Err(other.mismatch("events")),
        }
    }

    /// The synced events overlapping `window`, if the sync covered all of it.
    fn synced_within(&self, window: &TimeWindow) -> Option<Vec<CanonicalEvent>> {
        match self {
            Self::Synced { window: synced, events } if synced.covers(window) => Some(
                events
                    .iter()
                    .filter(|event| event.overlaps(window))
                    .cloned()
                    .collect(),
            ),
            _ => None,
        }
    }

    fn into_account(self) -> EngineResult<AccountConnection> {
        match self {
            Self::Account(connection) => Ok(connection),
            other => Err(other.mismatch("account")),
        }
    }

    fn into_calendars(self) -> EngineResult<Vec<CalendarInfo>> {
        match self {
            Self::Calendars(calendars) => Ok(Arc::unwrap_or_clone(calendars)),
            other => Err(other.mismatch("calendars")),
        }
    }
}

fn payload_weight(payload: &CachePayload) -> usize {
    let strings = |event: &CanonicalEvent| {
        event.id.len()
            + event.title.len()
            + event.description.as_ref().map_or(0, String::len)
            + event.location.as_ref().map_or(0, String::len)
    };
    mem::size_of::<CachePayload>()
        + match payload {
            CachePayload::Events(events) | CachePayload::Synced { events, .. } => events
                .iter()
                .map(|event| mem::size_of::<CanonicalEvent>() + strings(event))
                .sum(),
            CachePayload::Account(_) => mem::size_of::<AccountConnection>(),
            CachePayload::Calendars(calendars) => {
                calendars.len() * mem::size_of::<CalendarInfo>()
            }
        }
}

fn events_key(account: &AccountId, window: &TimeWindow) -> CacheKey {
    CacheKey::new("events")
        .segment(account)
        .segment(window.start.timestamp())
        .segment(window.end.timestamp())
}

/// Under the account's events prefix, so mutations drop it too.
fn synced_key(account: &AccountId) -> CacheKey {
    CacheKey::new("events").segment(account).segment("synced")
}

fn account_key(account: &AccountId) -> CacheKey {
    CacheKey::new("account").segment(account)
}

fn calendars_key(account: &AccountId) -> CacheKey {
    CacheKey::new("calendars").segment(account)
}

fn into_provider_error(e: EngineError) -> ProviderError {
    match e {
        EngineError::Provider(e) => e,
        EngineError::PermanentFailure { last, .. } => last,
        EngineError::UnknownAccount { id } => {
            ProviderError::configuration(format!("unknown account {id}"))
        }
        // interrupted, not failed: the job runs again after a restart
        other @ (EngineError::Stopped | EngineError::Cancelled) => {
            ProviderError::timeout(format!("request not completed: {other}"))
        }
        other => ProviderError::internal(other.to_string()),
    }
}

#[derive(Debug, Clone, Default)]
struct Observed {
    verified: bool,
    disconnected: Option<ProviderErrorCode>,
    last_verified_at: Option<DateTime<Utc>>,
    calendar_count: Option<usize>,
    profile: Option<AccountProfile>,
    last_error: Option<String>,
}

struct AggregatorInner {
    config: EngineConfig,
    providers: BTreeMap<AccountId, Arc<dyn EventProvider>>,
    cache: TtlCache<CachePayload, EngineError>,
    batcher: RequestBatcher,
    leases: LeaseScheduler,
    connections: Mutex<HashMap<AccountId, Observed>>,
}

/// Builder for [`CalendarAggregator`].
pub struct AggregatorBuilder {
    config: EngineConfig,
    providers: Vec<Arc<dyn EventProvider>>,
    store: Option<Arc<dyn CredentialStore>>,
    refreshers: HashMap<ProviderKind, Arc<dyn LeaseRefresher>>,
}

impl AggregatorBuilder {
    /// Registers an account. Account ids must be unique.
    pub fn with_provider(mut self, provider: Arc<dyn EventProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Sets where credential leases are kept. Defaults to an in-memory store.
    pub fn with_credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Registers the refresher used to renew `kind`'s lease.
    pub fn with_refresher(mut self, kind: ProviderKind, refresher: Arc<dyn LeaseRefresher>) -> Self {
        self.refreshers.insert(kind, refresher);
        self
    }

    /// Assembles the services. Nothing runs until `start`.
    pub fn build(self) -> EngineResult<CalendarAggregator> {
        let mut providers = BTreeMap::new();
        for provider in self.providers {
            let account = provider.account_id().clone();
            if providers.insert(account.clone(), provider).is_some() {
                return Err(EngineError::config(format!("account {account} is registered twice")));
            }
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryCredentialStore::new()) as Arc<dyn CredentialStore>);
        let leases = LeaseScheduler::new(
            self.config.lease.clone(),
            self.config.retry.clone(),
            store,
            self.refreshers,
        );
        let connections = providers
            .keys()
            .map(|account| (account.clone(), Observed::default()))
            .collect();

        let inner = Arc::new(AggregatorInner {
            cache: TtlCache::with_weigher(payload_weight),
            batcher: RequestBatcher::new(self.config.batcher.clone()),
            leases,
            connections: Mutex::new(connections),
            providers,
            config: self.config,
        });
        let activity = Arc::new(ActivityMonitor::new(inner.config.activity.clone()));
        let scheduler = SyncScheduler::new(
            inner.config.scheduler.clone(),
            inner.config.retry.clone(),
            Arc::clone(&activity),
            Arc::clone(&inner) as Arc<dyn JobRunner>,
        );

        Ok(CalendarAggregator {
            inner,
            scheduler,
            activity,
        })
    }
}

/// Unified view over every registered calendar account.
pub struct CalendarAggregator {
    inner: Arc<AggregatorInner>,
    scheduler: SyncScheduler,
    activity: Arc<ActivityMonitor>,
}

impl std::fmt::Debug for CalendarAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalendarAggregator")
            .field("accounts", &self.inner.providers.keys().collect::<Vec<_>>())
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl CalendarAggregator {
    pub fn builder(config: EngineConfig) -> AggregatorBuilder {
        AggregatorBuilder {
            config,
            providers: Vec::new(),
            store: None,
            refreshers: HashMap::new(),
        }
    }

    /// Registered account ids, sorted.
    pub fn accounts(&self) -> Vec<AccountId> {
        self.inner.providers.keys().cloned().collect()
    }

    /// Starts the batcher, the lease and sync schedulers, and the cache
    /// sweeper.
    pub fn start(&self) {
        self.inner.batcher.start();
        self.inner.leases.start();
        self.scheduler.start();
        self.inner
            .cache
            .start_sweeper(self.inner.config.cache.sweep_interval);
        info!(accounts = self.inner.providers.len(), "calendar aggregator started");
    }

    /// Stops every background service. Queued requests are rejected.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
        self.inner.leases.stop().await;
        self.inner.batcher.stop().await;
        self.inner.cache.stop_sweeper();
        info!("calendar aggregator stopped");
    }

    /// Every registered account with its last known status. Does not touch
    /// the network.
    pub fn get_connected_accounts(&self) -> Vec<AccountConnection> {
        self.inner
            .providers
            .keys()
            .map(|account| self.inner.connection(account))
            .collect()
    }

    /// Account status, verified against the provider at most once per
    /// `account_ttl`.
    pub async fn get_account_info(&self, account: &AccountId) -> EngineResult<AccountConnection> {
        let provider = Arc::clone(self.inner.provider(account)?);
        let inner = Arc::clone(&self.inner);
        let result = self
            .inner
            .cache
            .get_or_set(
                &account_key(account).to_string(),
                self.inner.config.cache.account_ttl,
                move || async move {
                    inner
                        .verify(&provider, Priority::Medium, true)
                        .await
                        .map(CachePayload::Account)
                },
            )
            .await;

        match result {
            // calls made since the entry was cached may have changed the status
            Ok(payload) => payload
                .into_account()
                .map(|_| self.inner.connection(account)),
            Err(e) if e.provider_code().is_some_and(|code| code.disconnects_account()) => {
                Ok(self.inner.connection(account))
            }
            Err(e) => Err(e),
        }
    }

    /// Events of one account overlapping `[start, end)`, sorted by start.
    ///
    /// A window inside the last background sync is answered from it.
    pub async fn get_events(
        &self,
        account: &AccountId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<CanonicalEvent>> {
        let window = checked_window(start, end)?;
        let provider = Arc::clone(self.inner.provider(account)?);
        if let Some(events) = self
            .inner
            .cache
            .get_matching(&synced_key(account).to_string(), |payload| match payload {
                CachePayload::Synced { window: synced, .. } => synced.covers(&window),
                _ => false,
            })
            .and_then(|payload| payload.synced_within(&window))
        {
            debug!(account = %account, count = events.len(), "served from synced range");
            return Ok(events);
        }

        let key = events_key(account, &window).to_string();
        let inner = Arc::clone(&self.inner);
        self.inner
            .cache
            .get_or_set(&key, self.inner.config.cache.events_ttl, move || async move {
                inner
                    .fetch_events(&provider, window, Priority::High, true)
                    .await
                    .map(|events| CachePayload::Events(Arc::new(events)))
            })
            .await?
            .into_events()
    }

    /// Events of every account overlapping `[start, end)`, merged and sorted.
    ///
    /// Accounts that fail are logged and left out; their status is visible
    /// through [`get_connected_accounts`](Self::get_connected_accounts).
    pub async fn get_all_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<CanonicalEvent>> {
        checked_window(start, end)?;
        let fetches = self
            .inner
            .providers
            .keys()
            .map(|account| async move { (account, self.get_events(account, start, end).await) });

        let mut events = Vec::new();
        for (account, result) in join_all(fetches).await {
            match result {
                Ok(mut batch) => events.append(&mut batch),
                Err(e) => {
                    warn!(account = %account, code = e.code(), error = %e, "skipping account");
                }
            }
        }
        events.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Ok(events)
    }

    pub async fn create_event(
        &self,
        account: &AccountId,
        draft: EventDraft,
    ) -> EngineResult<CanonicalEvent> {
        draft.validate().map_err(ProviderError::invalid_request)?;
        let provider = self.inner.provider(account)?;
        let draft = Arc::new(draft);

        let raw = self
            .inner
            .call(provider, "create_event", Priority::High, false, move |provider| {
                let draft = Arc::clone(&draft);
                async move { provider.create_event(&draft).await }
            })
            .await?;
        self.inner.invalidate_events(account);

        let event = provider.normalize(raw, account)?;
        info!(account = %account, event = %event.id, "created event");
        Ok(event)
    }

    pub async fn update_event(
        &self,
        account: &AccountId,
        event_id: &str,
        draft: EventDraft,
    ) -> EngineResult<CanonicalEvent> {
        draft.validate().map_err(ProviderError::invalid_request)?;
        let provider = self.inner.provider(account)?;
        let draft = Arc::new(draft);
        let target = event_id.to_string();

        let raw = self
            .inner
            .call(provider, "update_event", Priority::High, false, move |provider| {
                let draft = Arc::clone(&draft);
                let target = target.clone();
                async move { provider.update_event(&target, &draft).await }
            })
            .await?;
        self.inner.invalidate_events(account);

        let event = provider.normalize(raw, account)?;
        info!(account = %account, event = %event.id, "updated event");
        Ok(event)
    }

    pub async fn delete_event(&self, account: &AccountId, event_id: &str) -> EngineResult<()> {
        let provider = self.inner.provider(account)?;
        let target = event_id.to_string();

        self.inner
            .call(provider, "delete_event", Priority::High, false, move |provider| {
                let target = target.clone();
                async move { provider.delete_event(&target).await }
            })
            .await?;
        self.inner.invalidate_events(account);

        info!(account = %account, event = event_id, "deleted event");
        Ok(())
    }

    /// Calendars of one account, cached for `calendars_ttl`.
    pub async fn list_calendars(&self, account: &AccountId) -> EngineResult<Vec<CalendarInfo>> {
        let provider = Arc::clone(self.inner.provider(account)?);
        let inner = Arc::clone(&self.inner);
        self.inner
            .cache
            .get_or_set(
                &calendars_key(account).to_string(),
                self.inner.config.cache.calendars_ttl,
                move || async move {
                    inner
                        .fetch_calendars(&provider, Priority::Medium, true)
                        .await
                        .map(|calendars| CachePayload::Calendars(Arc::new(calendars)))
                },
            )
            .await?
            .into_calendars()
    }

    /// Verifies every account now, bypassing the cache.
    pub async fn test_all_connections(&self) -> Vec<AccountConnection> {
        let checks = self.inner.providers.values().map(|provider| async move {
            let account = provider.account_id();
            match self.inner.verify(provider, Priority::High, false).await {
                Ok(connection) => {
                    self.inner.cache.set(
                        account_key(account),
                        CachePayload::Account(connection.clone()),
                        self.inner.config.cache.account_ttl,
                    );
                    self.inner.with_lease_status(connection)
                }
                Err(e) => {
                    warn!(account = %account, code = e.code(), error = %e, "connection check failed");
                    self.inner.connection(account)
                }
            }
        });
        join_all(checks).await
    }

    /// Schedules recurring background syncs for every account.
    pub fn schedule_account_syncs(&self) -> Vec<JobId> {
        self.scheduler.schedule_account_syncs(&self.accounts())
    }

    /// Syncs one account immediately, outside the job queue.
    pub async fn force_sync_account(&self, account: &AccountId) -> EngineResult<()> {
        self.inner.provider(account)?;
        self.scheduler
            .force_sync_account(account)
            .await
            .map_err(EngineError::from)
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        info!("cache cleared");
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn get_sync_stats(&self) -> SchedulerStats {
        self.scheduler.get_stats()
    }

    pub fn get_lease_health(&self) -> LeaseHealth {
        self.inner.leases.get_health_status()
    }

    pub fn get_batcher_stats(&self) -> BatcherStats {
        self.inner.batcher.stats()
    }

    /// Marks the user as active, which gates background syncs.
    pub fn record_activity(&self) {
        self.activity.record_activity();
        // gating may have flipped from idle to active
        self.scheduler.wake();
    }
}

fn checked_window(start: DateTime<Utc>, end: DateTime<Utc>) -> EngineResult<TimeWindow> {
    TimeWindow::try_new(start, end).ok_or_else(|| {
        ProviderError::invalid_request(format!(
            "window end {} is before start {}",
            end.to_rfc3339(),
            start.to_rfc3339()
        ))
        .into()
    })
}

impl AggregatorInner {
    fn provider(&self, account: &AccountId) -> EngineResult<&Arc<dyn EventProvider>> {
        self.providers
            .get(account)
            .ok_or_else(|| EngineError::unknown_account(account.clone()))
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<AccountId, Observed>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Submits one provider call to the batcher.
    fn request<T, F, Fut>(
        &self,
        provider: &Arc<dyn EventProvider>,
        method: &'static str,
        priority: Priority,
        retry: bool,
        call: F,
    ) -> BatchHandle<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn EventProvider>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProviderResult<T>> + Send + 'static,
    {
        let mut options =
            RequestOptions::new(provider.kind(), method, provider.account_id().to_string())
                .with_priority(priority);
        if retry {
            options = options.with_retry(self.config.retry.clone());
        }
        let provider = Arc::clone(provider);
        self.batcher
            .submit(options, move || call(Arc::clone(&provider)))
    }

    /// Runs one provider call and records the outcome on the account.
    ///
    /// A call rejected with `AuthExpired` is resent once after the lease
    /// scheduler renews the credential. The account is disconnected only
    /// when that refresh fails or the resent call is rejected again.
    async fn call<T, F, Fut>(
        &self,
        provider: &Arc<dyn EventProvider>,
        method: &'static str,
        priority: Priority,
        retry: bool,
        call: F,
    ) -> EngineResult<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn EventProvider>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProviderResult<T>> + Send + 'static,
    {
        let call = Arc::new(call);
        let send = || {
            let call = Arc::clone(&call);
            self.request(provider, method, priority, retry, move |provider| call(provider))
        };

        let mut result = send().wait().await;
        let expired = matches!(
            &result,
            Err(e) if e.provider_code() == Some(ProviderErrorCode::AuthExpired)
        );
        if expired && self.refresh_credentials(provider).await {
            debug!(account = %provider.account_id(), method, "resending with refreshed credential");
            result = send().wait().await;
        }
        self.observe(provider.account_id(), &result);
        result
    }

    /// Renews `provider`'s lease after a rejection. Concurrent rejections
    /// for the same provider kind share one refresh.
    async fn refresh_credentials(&self, provider: &Arc<dyn EventProvider>) -> bool {
        let kind = provider.kind();
        if !self.leases.has_refresher(kind) {
            return false;
        }
        match self.leases.refresh_provider_token(kind).await {
            Ok(lease) => {
                info!(
                    account = %provider.account_id(),
                    provider = %kind,
                    expires_at = %lease.expires_at,
                    "credential refreshed after rejection"
                );
                true
            }
            Err(e) => {
                warn!(
                    account = %provider.account_id(),
                    provider = %kind,
                    code = %e.code(),
                    error = %e,
                    "credential refresh failed"
                );
                false
            }
        }
    }

    async fn fetch_events(
        &self,
        provider: &Arc<dyn EventProvider>,
        window: TimeWindow,
        priority: Priority,
        retry: bool,
    ) -> EngineResult<Vec<CanonicalEvent>> {
        let account = provider.account_id();
        let raw = self
            .call(provider, "list_events", priority, retry, move |provider| async move {
                provider.list_events(window).await
            })
            .await?;

        let mut events = normalize_events(raw, account, provider.local_context());
        events.retain(|event| event.overlaps(&window));
        events.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        debug!(account = %account, count = events.len(), "fetched events");
        Ok(events)
    }

    async fn fetch_calendars(
        &self,
        provider: &Arc<dyn EventProvider>,
        priority: Priority,
        retry: bool,
    ) -> EngineResult<Vec<CalendarInfo>> {
        let account = provider.account_id();
        let calendars = self
            .call(provider, "list_calendars", priority, retry, |provider| async move {
                provider.list_calendars().await
            })
            .await?;
        if let Some(observed) = self.connections().get_mut(account) {
            observed.calendar_count = Some(calendars.len());
        }
        Ok(calendars)
    }

    /// Runs the provider's connection test and returns the updated status.
    async fn verify(
        &self,
        provider: &Arc<dyn EventProvider>,
        priority: Priority,
        retry: bool,
    ) -> EngineResult<AccountConnection> {
        let account = provider.account_id();
        let profile = self
            .call(provider, "test_connection", priority, retry, |provider| async move {
                provider.test_connection().await
            })
            .await?;
        if let Some(observed) = self.connections().get_mut(account) {
            observed.profile = Some(profile);
        }
        Ok(self.connection(account))
    }

    /// Updates an account's status from the outcome of a provider call.
    fn observe<T>(&self, account: &AccountId, result: &EngineResult<T>) {
        let mut connections = self.connections();
        let Some(observed) = connections.get_mut(account) else {
            return;
        };
        match result {
            Ok(_) => {
                if observed.disconnected.take().is_some() {
                    info!(account = %account, "account reconnected");
                }
                observed.verified = true;
                observed.last_verified_at = Some(Utc::now());
                observed.last_error = None;
            }
            Err(e) => {
                observed.last_error = Some(e.to_string());
                if let Some(code) = e.provider_code()
                    && code.disconnects_account()
                {
                    if observed.disconnected.is_none() {
                        warn!(account = %account, reason = %code.as_str(), "account disconnected");
                    }
                    observed.disconnected = Some(code);
                }
            }
        }
    }

    fn connection(&self, account: &AccountId) -> AccountConnection {
        let observed = self.connections().get(account).cloned().unwrap_or_default();
        let status = match observed.disconnected {
            Some(reason) => ConnectionStatus::Disconnected { reason },
            None if observed.verified => ConnectionStatus::Connected,
            None => ConnectionStatus::Unknown,
        };
        let kind = self
            .providers
            .get(account)
            .map_or(ProviderKind::Google, |provider| provider.kind());

        self.with_lease_status(AccountConnection {
            id: account.clone(),
            provider_kind: kind,
            status,
            last_verified_at: observed.last_verified_at,
            calendar_count: observed.calendar_count,
            profile: observed.profile,
            last_error: observed.last_error,
        })
    }

    /// A lease that could not be refreshed overrides any cached status.
    fn with_lease_status(&self, mut connection: AccountConnection) -> AccountConnection {
        if let Some(failure) = self.leases.failure(connection.provider_kind)
            && failure.reauth_required
            && failure.code.disconnects_account()
        {
            connection.status = ConnectionStatus::Disconnected {
                reason: failure.code,
            };
        }
        connection
    }

    fn invalidate_events(&self, account: &AccountId) {
        let pattern = CacheKey::new("events").segment(account).children_pattern();
        let removed = self.cache.invalidate_pattern(&pattern);
        debug!(account = %account, pattern = %pattern, removed, "invalidated cached events");
    }

    /// Refreshes one kind of cached data for one account.
    async fn sync(
        &self,
        kind: JobKind,
        priority: Priority,
        provider: &Arc<dyn EventProvider>,
    ) -> EngineResult<()> {
        let account = provider.account_id();
        let cache = &self.config.cache;
        match kind {
            JobKind::Events => {
                let span = chrono::Duration::from_std(self.config.scheduler.sync_window)
                    .unwrap_or_else(|_| chrono::Duration::days(7));
                let window = TimeWindow::from_now(Utc::now(), span);
                let events = self.fetch_events(provider, window, priority, false).await?;
                self.cache.set(
                    synced_key(account),
                    CachePayload::Synced {
                        window,
                        events: Arc::new(events),
                    },
                    cache.events_ttl,
                );
            }
            JobKind::AccountInfo => {
                let connection = self.verify(provider, priority, false).await?;
                self.cache
                    .set(account_key(account), CachePayload::Account(connection), cache.account_ttl);
            }
            JobKind::CalendarList => {
                let calendars = self.fetch_calendars(provider, priority, false).await?;
                self.cache.set(
                    calendars_key(account),
                    CachePayload::Calendars(Arc::new(calendars)),
                    cache.calendars_ttl,
                );
            }
        }
        Ok(())
    }
}

impl JobRunner for AggregatorInner {
    /// A job without an account syncs every account and fails with the
    /// first error.
    fn run<'a>(&'a self, job: &'a SyncJob) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            let providers: Vec<&Arc<dyn EventProvider>> = match &job.account {
                Some(account) => vec![self.provider(account).map_err(into_provider_error)?],
                None => self.providers.values().collect(),
            };

            let mut first_error = None;
            for provider in providers {
                if let Err(e) = self.sync(job.kind, job.priority, provider).await {
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), |e| Err(into_provider_error(e)))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use calsync_providers::raw_event::GoogleEventTime;
    use calsync_providers::{CredentialLease, GoogleEvent, LocalContext, RawEvent};
    use chrono::TimeZone;

    use super::*;
    use crate::retry::RetryPolicy;

    struct FakeProvider {
        account: AccountId,
        context: LocalContext,
        events: Vec<RawEvent>,
        failure: Mutex<Option<ProviderError>>,
        list_calls: AtomicUsize,
        test_calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(account: &str, events: Vec<RawEvent>) -> Self {
            Self {
                account: AccountId::new(account),
                context: LocalContext::new(chrono_tz::Tz::UTC),
                events,
                failure: Mutex::new(None),
                list_calls: AtomicUsize::new(0),
                test_calls: AtomicUsize::new(0),
            }
        }

        fn failing(self, error: ProviderError) -> Self {
            *self.failure.lock().unwrap() = Some(error);
            self
        }

        fn check(&self) -> ProviderResult<()> {
            match self.failure.lock().unwrap().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn echo(id: &str, draft: &EventDraft) -> RawEvent {
            google_event(id, &draft.title, draft.start, draft.end)
        }
    }

    impl EventProvider for FakeProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Google
        }

        fn account_id(&self) -> &AccountId {
            &self.account
        }

        fn local_context(&self) -> &LocalContext {
            &self.context
        }

        fn list_events(&self, _window: TimeWindow) -> BoxFuture<'_, ProviderResult<Vec<RawEvent>>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                self.check()?;
                Ok(self.events.clone())
            })
        }

        fn get_event<'a>(&'a self, event_id: &'a str) -> BoxFuture<'a, ProviderResult<RawEvent>> {
            Box::pin(async move {
                self.events
                    .iter()
                    .find(|raw| raw.id() == Some(event_id))
                    .cloned()
                    .ok_or_else(|| ProviderError::not_found(event_id))
            })
        }

        fn create_event<'a>(
            &'a self,
            draft: &'a EventDraft,
        ) -> BoxFuture<'a, ProviderResult<RawEvent>> {
            Box::pin(async move {
                self.check()?;
                Ok(Self::echo("created", draft))
            })
        }

        fn update_event<'a>(
            &'a self,
            event_id: &'a str,
            draft: &'a EventDraft,
        ) -> BoxFuture<'a, ProviderResult<RawEvent>> {
            Box::pin(async move {
                self.check()?;
                Ok(Self::echo(event_id, draft))
            })
        }

        fn delete_event<'a>(&'a self, _event_id: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
            Box::pin(async move { self.check() })
        }

        fn list_calendars(&self) -> BoxFuture<'_, ProviderResult<Vec<CalendarInfo>>> {
            Box::pin(async move {
                self.check()?;
                Ok(vec![
                    CalendarInfo::new("primary", "Work").with_primary(true),
                    CalendarInfo::new("holidays", "Holidays"),
                ])
            })
        }

        fn test_connection(&self) -> BoxFuture<'_, ProviderResult<AccountProfile>> {
            self.test_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                self.check()?;
                Ok(AccountProfile {
                    email: Some(format!("{}@example.com", self.account)),
                    ..AccountProfile::default()
                })
            })
        }
    }

    /// Renews the lease after a delay; clears the rejection on `heals`.
    struct CountingRefresher {
        calls: AtomicUsize,
        heals: Vec<Arc<FakeProvider>>,
        outcome: Option<ProviderError>,
    }

    impl CountingRefresher {
        fn healing(heals: &[Arc<FakeProvider>]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                heals: heals.to_vec(),
                outcome: None,
            })
        }

        fn failing(error: ProviderError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                heals: Vec::new(),
                outcome: Some(error),
            })
        }
    }

    impl LeaseRefresher for CountingRefresher {
        fn refresh<'a>(
            &'a self,
            lease: &'a CredentialLease,
        ) -> BoxFuture<'a, ProviderResult<CredentialLease>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                if let Some(e) = &self.outcome {
                    return Err(e.clone());
                }
                for provider in &self.heals {
                    *provider.failure.lock().unwrap() = None;
                }
                Ok(CredentialLease::new(
                    lease.kind,
                    "fresh",
                    Utc::now() + chrono::Duration::hours(1),
                ))
            })
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap()
    }

    fn google_event(id: &str, title: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> RawEvent {
        let time = |value: DateTime<Utc>| GoogleEventTime {
            date_time: Some(value.to_rfc3339()),
            ..GoogleEventTime::default()
        };
        RawEvent::Google(GoogleEvent {
            id: Some(id.to_string()),
            summary: Some(title.to_string()),
            start: time(start),
            end: time(end),
            ..GoogleEvent::default()
        })
    }

    fn config() -> EngineConfig {
        EngineConfig::default().with_retry(RetryPolicy::new(1))
    }

    fn with_refresher(
        providers: &[Arc<FakeProvider>],
        refresher: Arc<CountingRefresher>,
    ) -> CalendarAggregator {
        let store = Arc::new(MemoryCredentialStore::new().with_lease(
            CredentialLease::new(
                ProviderKind::Google,
                "stale",
                Utc::now() + chrono::Duration::hours(1),
            )
            .with_refresh_token("refresh"),
        ));
        let builder = CalendarAggregator::builder(
            EngineConfig::default().with_retry(RetryPolicy::new(3)),
        )
        .with_credentials(store)
        .with_refresher(ProviderKind::Google, refresher);
        providers
            .iter()
            .fold(builder, |builder, provider| {
                builder.with_provider(Arc::clone(provider) as Arc<dyn EventProvider>)
            })
            .build()
            .unwrap()
    }

    /// Wall-clock now without the sub-second part.
    fn whole_second_now() -> DateTime<Utc> {
        DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap()
    }

    fn aggregator(providers: &[Arc<FakeProvider>]) -> CalendarAggregator {
        let builder = providers.iter().fold(
            CalendarAggregator::builder(config()),
            |builder, provider| builder.with_provider(Arc::clone(provider) as Arc<dyn EventProvider>),
        );
        builder.build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn second_read_is_served_from_cache() {
        let provider = Arc::new(FakeProvider::new(
            "acc1",
            vec![google_event("e1", "Standup", at(9), at(10))],
        ));
        let aggregator = aggregator(&[Arc::clone(&provider)]);
        aggregator.start();
        let account = AccountId::new("acc1");

        let first = aggregator.get_events(&account, at(0), at(23)).await.unwrap();
        let second = aggregator.get_events(&account, at(0), at(23)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].title, "Standup");
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 1);
        let stats = aggregator.get_cache_stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));

        aggregator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn events_outside_the_window_are_dropped_and_sorted() {
        let provider = Arc::new(FakeProvider::new(
            "acc1",
            vec![
                google_event("late", "Late", at(15), at(16)),
                google_event("early", "Early", at(9), at(10)),
                google_event("outside", "Tomorrow", at(0) + chrono::Duration::days(1), at(1) + chrono::Duration::days(1)),
            ],
        ));
        let aggregator = aggregator(&[provider]);
        aggregator.start();

        let events = aggregator
            .get_events(&AccountId::new("acc1"), at(0), at(23))
            .await
            .unwrap();
        let ids: Vec<&str> = events.iter().map(|event| event.id.as_str()).collect();
        assert_eq!(ids, ["early", "late"]);
    }

    #[tokio::test]
    async fn unknown_account_is_rejected() {
        let aggregator = aggregator(&[]);
        let err = aggregator
            .get_events(&AccountId::new("ghost"), at(0), at(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown_account");
    }

    #[tokio::test]
    async fn inverted_window_is_rejected() {
        let aggregator = aggregator(&[Arc::new(FakeProvider::new("acc1", Vec::new()))]);
        let err = aggregator
            .get_events(&AccountId::new("acc1"), at(5), at(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn duplicate_account_is_a_config_error() {
        let err = CalendarAggregator::builder(config())
            .with_provider(Arc::new(FakeProvider::new("acc1", Vec::new())))
            .with_provider(Arc::new(FakeProvider::new("acc1", Vec::new())))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "configuration");
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_invalidate_only_that_account() {
        let acc1 = Arc::new(FakeProvider::new("acc1", vec![google_event("e1", "A", at(9), at(10))]));
        let acc10 = Arc::new(FakeProvider::new("acc10", vec![google_event("e2", "B", at(9), at(10))]));
        let aggregator = aggregator(&[Arc::clone(&acc1), Arc::clone(&acc10)]);
        aggregator.start();
        let (one, ten) = (AccountId::new("acc1"), AccountId::new("acc10"));

        aggregator.get_events(&one, at(0), at(23)).await.unwrap();
        aggregator.get_events(&ten, at(0), at(23)).await.unwrap();

        let created = aggregator
            .create_event(&one, EventDraft::new("Review", at(11), at(12)))
            .await
            .unwrap();
        assert_eq!(created.id, "created");
        assert_eq!(created.title, "Review");
        assert_eq!(created.account_id, one);

        aggregator.get_events(&one, at(0), at(23)).await.unwrap();
        aggregator.get_events(&ten, at(0), at(23)).await.unwrap();
        assert_eq!(acc1.list_calls.load(Ordering::SeqCst), 2);
        assert_eq!(acc10.list_calls.load(Ordering::SeqCst), 1);

        aggregator.delete_event(&one, "e1").await.unwrap();
        aggregator.get_events(&one, at(0), at(23)).await.unwrap();
        assert_eq!(acc1.list_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn update_returns_the_normalized_event() {
        let aggregator = aggregator(&[Arc::new(FakeProvider::new("acc1", Vec::new()))]);
        aggregator.start();

        let updated = aggregator
            .update_event(
                &AccountId::new("acc1"),
                "e1",
                EventDraft::new("Moved", at(14), at(15)),
            )
            .await
            .unwrap();
        assert_eq!(updated.id, "e1");
        assert_eq!(updated.start_time, at(14));
    }

    #[tokio::test]
    async fn invalid_draft_never_reaches_the_provider() {
        let aggregator = aggregator(&[Arc::new(FakeProvider::new("acc1", Vec::new()))]);
        let err = aggregator
            .create_event(&AccountId::new("acc1"), EventDraft::new("  ", at(1), at(2)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test(start_paused = true)]
    async fn all_events_skip_failing_accounts() {
        let good = Arc::new(FakeProvider::new(
            "acc1",
            vec![
                google_event("b", "Second", at(11), at(12)),
                google_event("a", "First", at(8), at(9)),
            ],
        ));
        let bad = Arc::new(
            FakeProvider::new("acc2", Vec::new()).failing(ProviderError::network("offline")),
        );
        let aggregator = aggregator(&[good, bad]);
        aggregator.start();

        let events = aggregator.get_all_events(at(0), at(23)).await.unwrap();
        let ids: Vec<&str> = events.iter().map(|event| event.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);

        let accounts = aggregator.get_connected_accounts();
        assert_eq!(accounts[0].status, ConnectionStatus::Connected);
        assert_eq!(accounts[1].status, ConnectionStatus::Unknown);
        assert!(accounts[1].last_error.as_deref().unwrap().contains("offline"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_auth_disconnects_the_account() {
        let provider = Arc::new(
            FakeProvider::new("acc1", Vec::new()).failing(ProviderError::auth_expired("token revoked")),
        );
        let aggregator = aggregator(&[provider]);
        aggregator.start();
        let account = AccountId::new("acc1");

        let err = aggregator.get_events(&account, at(0), at(1)).await.unwrap_err();
        assert_eq!(err.code(), "auth_expired");

        let expected = ConnectionStatus::Disconnected {
            reason: ProviderErrorCode::AuthExpired,
        };
        assert_eq!(aggregator.get_connected_accounts()[0].status, expected);
        let info = aggregator.get_account_info(&account).await.unwrap();
        assert_eq!(info.status, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_credential_is_refreshed_once_and_resent() {
        let acc1 = Arc::new(
            FakeProvider::new("acc1", vec![google_event("e1", "Standup", at(9), at(10))])
                .failing(ProviderError::auth_expired("token expired")),
        );
        let acc2 = Arc::new(
            FakeProvider::new("acc2", vec![google_event("e2", "Review", at(11), at(12))])
                .failing(ProviderError::auth_expired("token expired")),
        );
        let refresher = CountingRefresher::healing(&[Arc::clone(&acc1), Arc::clone(&acc2)]);
        let aggregator = with_refresher(
            &[Arc::clone(&acc1), Arc::clone(&acc2)],
            Arc::clone(&refresher),
        );
        aggregator.start();

        let events = aggregator.get_all_events(at(0), at(23)).await.unwrap();
        let ids: Vec<&str> = events.iter().map(|event| event.id.as_str()).collect();
        assert_eq!(ids, ["e1", "e2"]);

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(acc1.list_calls.load(Ordering::SeqCst), 2);
        assert_eq!(acc2.list_calls.load(Ordering::SeqCst), 2);
        assert!(
            aggregator
                .get_connected_accounts()
                .iter()
                .all(|account| account.status == ConnectionStatus::Connected)
        );
        assert!(aggregator.get_lease_health().failures.is_empty());
        aggregator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_disconnects_the_account() {
        let provider = Arc::new(
            FakeProvider::new("acc1", Vec::new()).failing(ProviderError::auth_expired("token expired")),
        );
        let refresher = CountingRefresher::failing(ProviderError::auth_expired("grant revoked"));
        let aggregator = with_refresher(&[Arc::clone(&provider)], Arc::clone(&refresher));
        aggregator.start();

        let err = aggregator
            .get_events(&AccountId::new("acc1"), at(0), at(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "auth_expired");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            aggregator.get_connected_accounts()[0].status,
            ConnectionStatus::Disconnected {
                reason: ProviderErrorCode::AuthExpired
            }
        );
        let failure = &aggregator.get_lease_health().failures[&ProviderKind::Google];
        assert!(failure.reauth_required);
        aggregator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn account_info_is_cached() {
        let provider = Arc::new(FakeProvider::new("acc1", Vec::new()));
        let aggregator = aggregator(&[Arc::clone(&provider)]);
        aggregator.start();
        let account = AccountId::new("acc1");

        let calendars = aggregator.list_calendars(&account).await.unwrap();
        assert_eq!(calendars.len(), 2);

        let info = aggregator.get_account_info(&account).await.unwrap();
        aggregator.get_account_info(&account).await.unwrap();
        assert_eq!(provider.test_calls.load(Ordering::SeqCst), 1);
        assert_eq!(info.status, ConnectionStatus::Connected);
        assert_eq!(info.calendar_count, Some(2));
        assert_eq!(
            info.profile.and_then(|profile| profile.email).as_deref(),
            Some("acc1@example.com")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connection_test_bypasses_the_cache() {
        let provider = Arc::new(FakeProvider::new("acc1", Vec::new()));
        let aggregator = aggregator(&[Arc::clone(&provider)]);
        aggregator.start();

        aggregator.get_account_info(&AccountId::new("acc1")).await.unwrap();
        let results = aggregator.test_all_connections().await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ConnectionStatus::Connected);
        assert_eq!(provider.test_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sync_fills_the_cache() {
        let provider = Arc::new(FakeProvider::new("acc1", Vec::new()));
        let aggregator = aggregator(&[Arc::clone(&provider)]);
        aggregator.start();

        let jobs = aggregator.schedule_account_syncs();
        assert_eq!(jobs.len(), 2);
        assert!(aggregator.schedule_account_syncs().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.test_calls.load(Ordering::SeqCst), 1);
        let stats = aggregator.get_sync_stats();
        assert_eq!(stats.completed_runs, 2);
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(aggregator.get_cache_stats().total_items, 2);

        aggregator.clear_cache();
        assert_eq!(aggregator.get_cache_stats().total_items, 0);
        aggregator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn background_sync_keeps_caller_entries() {
        let base = whole_second_now();
        let provider = Arc::new(FakeProvider::new(
            "acc1",
            vec![google_event(
                "e1",
                "Standup",
                base + chrono::Duration::hours(2),
                base + chrono::Duration::hours(3),
            )],
        ));
        let aggregator = aggregator(&[Arc::clone(&provider)]);
        aggregator.start();
        let account = AccountId::new("acc1");
        let end = base + chrono::Duration::days(1);

        let first = aggregator.get_events(&account, base, end).await.unwrap();
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 1);

        aggregator.schedule_account_syncs();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 2);

        let again = aggregator.get_events(&account, base, end).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 2);
        aggregator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reads_inside_the_synced_range_skip_the_provider() {
        let base = whole_second_now();
        let hours = |h: i64| base + chrono::Duration::hours(h);
        let provider = Arc::new(FakeProvider::new(
            "acc1",
            vec![
                google_event("soon", "Standup", hours(2), hours(3)),
                google_event("later", "Offsite", hours(48), hours(50)),
            ],
        ));
        let aggregator = aggregator(&[Arc::clone(&provider)]);
        aggregator.start();
        let account = AccountId::new("acc1");

        aggregator.schedule_account_syncs();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 1);

        let now = Utc::now();
        let window = (now + chrono::Duration::hours(1), now + chrono::Duration::hours(5));
        let events = aggregator.get_events(&account, window.0, window.1).await.unwrap();
        let ids: Vec<&str> = events.iter().map(|event| event.id.as_str()).collect();
        assert_eq!(ids, ["soon"]);
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 1);
        let stats = aggregator.get_cache_stats();
        assert_eq!((stats.hits, stats.misses), (1, 0));

        // a window reaching back before the sync started is fetched
        aggregator
            .get_events(&account, base - chrono::Duration::hours(1), hours(5))
            .await
            .unwrap();
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 2);

        aggregator
            .create_event(&account, EventDraft::new("Review", hours(4), hours(5)))
            .await
            .unwrap();
        aggregator.get_events(&account, window.0, window.1).await.unwrap();
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 3);
        aggregator.stop().await;
    }

    #[test]
    fn interrupted_requests_stay_retryable() {
        let stopped = into_provider_error(EngineError::Stopped);
        assert_eq!(stopped.code(), ProviderErrorCode::Timeout);
        assert!(stopped.is_retryable());
        assert!(into_provider_error(EngineError::Cancelled).is_retryable());

        let unknown = into_provider_error(EngineError::unknown_account(AccountId::new("ghost")));
        assert_eq!(unknown.code(), ProviderErrorCode::Configuration);
        assert!(!unknown.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn force_sync_runs_once_per_kind() {
        let provider = Arc::new(FakeProvider::new("acc1", Vec::new()));
        let aggregator = aggregator(&[Arc::clone(&provider)]);
        aggregator.start();

        aggregator
            .force_sync_account(&AccountId::new("acc1"))
            .await
            .unwrap();
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.test_calls.load(Ordering::SeqCst), 1);
        assert_eq!(aggregator.get_sync_stats().forced_runs, 2);

        let err = aggregator
            .force_sync_account(&AccountId::new("ghost"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown_account");
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_is_reflected_in_health() {
        let aggregator = aggregator(&[]);
        assert!(!aggregator.get_lease_health().is_running);

        aggregator.start();
        assert!(aggregator.get_lease_health().is_running);
        assert!(aggregator.get_sync_stats().is_running);

        aggregator.record_activity();
        assert!(!aggregator.get_sync_stats().is_idle);

        aggregator.stop().await;
        assert!(!aggregator.get_lease_health().is_running);
        assert!(!aggregator.get_sync_stats().is_running);
    }
}
