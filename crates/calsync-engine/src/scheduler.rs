//! Background scheduler for calendar sync.
//!
//! Jobs live in one table and one min-heap keyed by their next run time. A
//! single loop sleeps until the earlier of the tick interval and the earliest
//! due job (or until notified), then admits ready jobs:
//!
//! - highest priority first, then earliest due
//! - at most `max_concurrent_jobs` executing at once
//! - only while the activity policy allows background work
//!
//! A successful recurring job is re-armed one interval later. A failed job
//! is retried with exponential backoff until its retry budget runs out;
//! errors that cannot succeed on retry fail it at once.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use calsync_core::{AccountId, Priority};
use calsync_providers::{BoxFuture, ProviderError, ProviderResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::activity::ActivityMonitor;
use crate::config::SchedulerConfig;
use crate::retry::RetryPolicy;

/// What a job refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Events,
    AccountInfo,
    CalendarList,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::AccountInfo => "account_info",
            Self::CalendarList => "calendar_list",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Request to schedule a job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub kind: JobKind,
    pub account: Option<AccountId>,
    pub priority: Priority,
    /// Delay before the first run.
    pub delay: Duration,
    /// Re-run interval; `None` runs once.
    pub interval: Option<Duration>,
    /// Attempts before the job is dropped; defaults to the retry policy's.
    pub max_retries: Option<u32>,
}

impl JobSpec {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            account: None,
            priority: Priority::default(),
            delay: Duration::ZERO,
            interval: None,
            max_retries: None,
        }
    }

    pub fn for_account(kind: JobKind, account: AccountId) -> Self {
        Self {
            account: Some(account),
            ..Self::new(kind)
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn recurring(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A job as tracked by the scheduler.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub id: JobId,
    pub kind: JobKind,
    pub account: Option<AccountId>,
    pub priority: Priority,
    pub scheduled_at: DateTime<Utc>,
    pub next_run_at: Instant,
    pub last_run_at: Option<DateTime<Utc>>,
    pub interval: Option<Duration>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl SyncJob {
    pub fn is_recurring(&self) -> bool {
        self.interval.is_some()
    }
}

/// Executes jobs on behalf of the scheduler.
pub trait JobRunner: Send + Sync + 'static {
    fn run<'a>(&'a self, job: &'a SyncJob) -> BoxFuture<'a, ProviderResult<()>>;
}

/// Scheduler statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub is_running: bool,
    pub total_jobs: usize,
    pub executing_jobs: usize,
    pub completed_runs: u64,
    pub retried_runs: u64,
    pub failed_jobs: u64,
    pub timed_out_runs: u64,
    pub forced_runs: u64,
    /// Seconds until the next queued job is due.
    pub next_run_in_secs: Option<u64>,
    pub is_idle: bool,
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, SyncJob>,
    heap: BinaryHeap<Reverse<(Instant, JobId)>>,
    executing: HashSet<JobId>,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    forced: AtomicU64,
}

struct SchedulerCore {
    config: SchedulerConfig,
    retry: RetryPolicy,
    activity: Arc<ActivityMonitor>,
    runner: Arc<dyn JobRunner>,
    table: Mutex<JobTable>,
    notify: Notify,
    next_id: AtomicU64,
    counters: Counters,
}

struct Running {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Sync job scheduler.
pub struct SyncScheduler {
    core: Arc<SchedulerCore>,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("config", &self.core.config)
            .finish_non_exhaustive()
    }
}

impl SyncScheduler {
    pub fn new(
        config: SchedulerConfig,
        retry: RetryPolicy,
        activity: Arc<ActivityMonitor>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                config,
                retry,
                activity,
                runner,
                table: Mutex::new(JobTable::default()),
                notify: Notify::new(),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
            running: Mutex::new(None),
        }
    }

    /// Starts the scheduling loop. Does nothing if already running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(Arc::clone(&self.core), shutdown_rx));
        *running = Some(Running { task, shutdown });
    }

    /// Stops the loop. Executions already started run to completion.
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
                error!(error = %e, "sync scheduler loop panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Wakes the loop so it re-evaluates due jobs now.
    pub fn wake(&self) {
        self.core.notify.notify_one();
    }

    /// Adds a job. It becomes ready after `spec.delay`.
    pub fn schedule_job(&self, spec: JobSpec) -> JobId {
        let id = {
            let mut table = self.core.lock();
            self.core.insert_job(&mut table, spec)
        };
        self.core.notify.notify_one();
        id
    }

    /// Schedules recurring Events (high priority) and AccountInfo (low
    /// priority) jobs for each account, staggering first runs by
    /// `stagger` per account. Kinds that already have a recurring job for
    /// the account are skipped. Returns the ids of the new jobs.
    pub fn schedule_account_syncs(&self, accounts: &[AccountId]) -> Vec<JobId> {
        let config = &self.core.config;
        let plan = [
            (JobKind::Events, Priority::High, config.events_interval),
            (JobKind::AccountInfo, Priority::Low, config.account_interval),
        ];

        let mut created = Vec::new();
        {
            let mut table = self.core.lock();
            for (index, account) in accounts.iter().enumerate() {
                let delay = config
                    .stagger
                    .saturating_mul(u32::try_from(index).unwrap_or(u32::MAX));
                for (kind, priority, interval) in plan {
                    let exists = table.jobs.values().any(|job| {
                        job.kind == kind && job.is_recurring() && job.account.as_ref() == Some(account)
                    });
                    if exists {
                        trace!(account = %account, kind = %kind, "recurring job already scheduled");
                        continue;
                    }
                    let spec = JobSpec::for_account(kind, account.clone())
                        .with_priority(priority)
                        .with_delay(delay)
                        .recurring(interval);
                    created.push(self.core.insert_job(&mut table, spec));
                }
            }
        }

        if !created.is_empty() {
            info!(accounts = accounts.len(), jobs = created.len(), "scheduled account syncs");
            self.core.notify.notify_one();
        }
        created
    }

    /// Runs an Events and an AccountInfo sync for `account` right now,
    /// outside the queue, with a single attempt each.
    pub async fn force_sync_account(&self, account: &AccountId) -> ProviderResult<()> {
        for kind in [JobKind::Events, JobKind::AccountInfo] {
            let job = SyncJob {
                id: JobId(self.core.next_id.fetch_add(1, Ordering::Relaxed)),
                kind,
                account: Some(account.clone()),
                priority: Priority::High,
                scheduled_at: Utc::now(),
                next_run_at: Instant::now(),
                last_run_at: None,
                interval: None,
                retry_count: 0,
                max_retries: 1,
            };
            self.core.counters.forced.fetch_add(1, Ordering::Relaxed);
            debug!(job = %job.id, account = %account, kind = %kind, "forced sync");
            self.core.execute(&job).await?;
        }
        Ok(())
    }

    /// Removes a job. An execution already in progress finishes but is not
    /// rescheduled. Returns false if the job does not exist.
    pub fn cancel_job(&self, id: JobId) -> bool {
        let removed = self.core.lock().jobs.remove(&id).is_some();
        if removed {
            debug!(job = %id, "cancelled job");
        }
        removed
    }

    /// Removes every job. Returns how many were removed.
    pub fn clear_jobs(&self) -> usize {
        let mut table = self.core.lock();
        let count = table.jobs.len();
        table.jobs.clear();
        table.heap.clear();
        debug!(count, "cleared jobs");
        count
    }

    pub fn get_job(&self, id: JobId) -> Option<SyncJob> {
        self.core.lock().jobs.get(&id).cloned()
    }

    /// All jobs, earliest due first.
    pub fn jobs(&self) -> Vec<SyncJob> {
        let mut jobs: Vec<SyncJob> = self.core.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|job| (job.next_run_at, job.id));
        jobs
    }

    pub fn get_stats(&self) -> SchedulerStats {
        let now = Instant::now();
        let (total_jobs, executing_jobs, next_due) = {
            let table = self.core.lock();
            let next_due = table
                .jobs
                .values()
                .filter(|job| !table.executing.contains(&job.id))
                .map(|job| job.next_run_at)
                .min();
            (table.jobs.len(), table.executing.len(), next_due)
        };
        let counters = &self.core.counters;

        SchedulerStats {
            is_running: self.is_running(),
            total_jobs,
            executing_jobs,
            completed_runs: counters.completed.load(Ordering::Relaxed),
            retried_runs: counters.retried.load(Ordering::Relaxed),
            failed_jobs: counters.failed.load(Ordering::Relaxed),
            timed_out_runs: counters.timed_out.load(Ordering::Relaxed),
            forced_runs: counters.forced.load(Ordering::Relaxed),
            next_run_in_secs: next_due.map(|due| due.saturating_duration_since(now).as_secs()),
            is_idle: self.core.activity.is_idle(),
        }
    }
}

impl Drop for SyncScheduler {
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

impl SchedulerCore {
    fn lock(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert_job(&self, table: &mut JobTable, spec: JobSpec) -> JobId {
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let job = SyncJob {
            id,
            kind: spec.kind,
            account: spec.account,
            priority: spec.priority,
            scheduled_at: Utc::now(),
            next_run_at: Instant::now() + spec.delay,
            last_run_at: None,
            interval: spec.interval,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(self.retry.max_attempts).max(1),
        };
        debug!(
            job = %id,
            kind = %job.kind,
            priority = %job.priority,
            delay_ms = spec.delay.as_millis() as u64,
            recurring = job.is_recurring(),
            "scheduled job"
        );
        table.heap.push(Reverse((job.next_run_at, id)));
        table.jobs.insert(id, job);
        id
    }

    /// Runs one attempt with the per-job timeout.
    async fn execute(&self, job: &SyncJob) -> ProviderResult<()> {
        match tokio::time::timeout(self.config.job_timeout, self.runner.run(job)).await {
            Ok(result) => result,
            Err(_) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                Err(ProviderError::timeout(format!(
                    "{} timed out after {:?}",
                    job.kind, self.config.job_timeout
                )))
            }
        }
    }

    /// Admits ready jobs. Returns true if ready jobs were left waiting.
    fn admit_ready(self: &Arc<Self>) -> bool {
        let now = Instant::now();
        let mut guard = self.lock();
        let table = &mut *guard;

        let mut ready = Vec::new();
        while let Some(&Reverse((at, id))) = table.heap.peek() {
            if at > now {
                break;
            }
            table.heap.pop();
            // stale heap entries are skipped
            let live = table.jobs.get(&id).is_some_and(|job| job.next_run_at == at);
            if live && !table.executing.contains(&id) {
                ready.push(id);
            }
        }
        if ready.is_empty() {
            return false;
        }

        let free = self
            .config
            .max_concurrent_jobs
            .max(1)
            .saturating_sub(table.executing.len());
        let admit = if self.activity.allows_sync() {
            free.min(ready.len())
        } else {
            trace!(ready = ready.len(), "background sync paused by activity policy");
            0
        };

        ready.sort_by_key(|id| {
            let job = &table.jobs[id];
            (job.priority, job.next_run_at, job.id)
        });
        let waiting = ready.split_off(admit);
        for id in &waiting {
            let at = table.jobs[id].next_run_at;
            table.heap.push(Reverse((at, *id)));
        }

        let admitted: Vec<SyncJob> = ready
            .into_iter()
            .map(|id| {
                table.executing.insert(id);
                table.jobs[&id].clone()
            })
            .collect();
        drop(guard);

        for job in admitted {
            let core = Arc::clone(self);
            tokio::spawn(async move {
                trace!(job = %job.id, kind = %job.kind, "executing job");
                let result = core.execute(&job).await;
                core.complete(&job, result);
                core.notify.notify_one();
            });
        }
        !waiting.is_empty()
    }

    fn complete(&self, executed: &SyncJob, result: ProviderResult<()>) {
        let now = Instant::now();
        let mut guard = self.lock();
        let table = &mut *guard;
        table.executing.remove(&executed.id);

        let Some(job) = table.jobs.get_mut(&executed.id) else {
            debug!(job = %executed.id, "job removed while executing");
            return;
        };
        job.last_run_at = Some(Utc::now());
        let id = job.id;
        let kind = job.kind;

        let error = match result {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                job.retry_count = 0;
                let interval = job.interval;
                match interval {
                    Some(interval) => {
                        job.next_run_at = now + interval;
                        table.heap.push(Reverse((job.next_run_at, id)));
                        debug!(job = %id, kind = %kind, next_in_secs = interval.as_secs(), "job succeeded");
                    }
                    None => {
                        table.jobs.remove(&id);
                        debug!(job = %id, kind = %kind, "one-shot job succeeded");
                    }
                }
                return;
            }
            Err(error) => error,
        };

        if !error.is_retryable() {
            table.jobs.remove(&id);
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(job = %id, kind = %kind, code = %error.code(), error = %error, "job failed permanently");
            return;
        }

        job.retry_count += 1;
        if job.retry_count < job.max_retries {
            let delay = self
                .retry
                .backoff_with_hint(job.retry_count, error.retry_after());
            job.next_run_at = now + delay;
            table.heap.push(Reverse((job.next_run_at, id)));
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            warn!(
                job = %id,
                kind = %kind,
                retry = job.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "job failed, retrying"
            );
        } else {
            let attempts = job.retry_count;
            table.jobs.remove(&id);
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(job = %id, kind = %kind, attempts, error = %error, "job exhausted its retries");
        }
    }

    /// When the loop should next look at the heap.
    fn next_wake(&self, blocked: bool) -> Instant {
        let tick = Instant::now() + self.config.tick_interval;
        if blocked {
            return tick;
        }
        match self.lock().heap.peek() {
            Some(&Reverse((at, _))) => at.min(tick),
            None => tick,
        }
    }
}

async fn run_loop(core: Arc<SchedulerCore>, mut shutdown: watch::Receiver<bool>) {
    info!(
        max_concurrent_jobs = core.config.max_concurrent_jobs,
        tick_secs = core.config.tick_interval.as_secs(),
        "sync scheduler started"
    );
    loop {
        let blocked = core.admit_ready();
        let wake_at = core.next_wake(blocked);
        tokio::select! {
            _ = tokio::time::sleep_until(wake_at) => {}
            _ = core.notify.notified() => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("sync scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActivityConfig;
    use calsync_providers::ProviderErrorCode;
    use std::sync::atomic::AtomicUsize;

    type Outcome = Box<dyn Fn(&SyncJob) -> ProviderResult<()> + Send + Sync>;

    struct TestRunner {
        calls: Mutex<Vec<(SyncJob, Instant)>>,
        outcome: Outcome,
        work: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl TestRunner {
        fn new(work: Duration, outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                outcome,
                work,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn ok(work: Duration) -> Arc<Self> {
            Self::new(work, Box::new(|_| Ok(())))
        }

        fn failing(code: ProviderErrorCode) -> Arc<Self> {
            Self::new(
                Duration::ZERO,
                Box::new(move |_| Err(ProviderError::new(code, "nope"))),
            )
        }

        fn calls(&self) -> Vec<(SyncJob, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl JobRunner for TestRunner {
        fn run<'a>(&'a self, job: &'a SyncJob) -> BoxFuture<'a, ProviderResult<()>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push((job.clone(), Instant::now()));
                let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(active, Ordering::SeqCst);
                tokio::time::sleep(self.work).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                (self.outcome)(job)
            })
        }
    }

    fn scheduler(runner: Arc<TestRunner>, config: SchedulerConfig) -> SyncScheduler {
        SyncScheduler::new(
            config,
            RetryPolicy::default(),
            Arc::new(ActivityMonitor::default()),
            runner,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn admits_by_priority_under_concurrency_cap() {
        let runner = TestRunner::ok(Duration::from_secs(1));
        let scheduler = scheduler(
            Arc::clone(&runner),
            SchedulerConfig::default().with_max_concurrent_jobs(1),
        );
        scheduler.schedule_job(JobSpec::new(JobKind::Events).with_priority(Priority::Low));
        scheduler.schedule_job(JobSpec::new(JobKind::AccountInfo).with_priority(Priority::High));
        scheduler.schedule_job(JobSpec::new(JobKind::CalendarList).with_priority(Priority::Medium));

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(10)).await;
        scheduler.stop().await;

        let order: Vec<Priority> = runner.calls().iter().map(|(job, _)| job.priority).collect();
        assert_eq!(order, vec![Priority::High, Priority::Medium, Priority::Low]);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.get_stats().completed_runs, 3);
        assert_eq!(scheduler.get_stats().total_jobs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn low_priority_waits_for_a_free_slot() {
        let runner = TestRunner::ok(Duration::from_secs(1));
        let scheduler = scheduler(
            Arc::clone(&runner),
            SchedulerConfig::default().with_max_concurrent_jobs(2),
        );
        scheduler.schedule_job(
            JobSpec::for_account(JobKind::AccountInfo, AccountId::from("a"))
                .with_priority(Priority::Low),
        );
        scheduler.schedule_job(
            JobSpec::for_account(JobKind::Events, AccountId::from("a"))
                .with_priority(Priority::High),
        );
        scheduler.schedule_job(
            JobSpec::for_account(JobKind::Events, AccountId::from("b"))
                .with_priority(Priority::High),
        );

        let started = Instant::now();
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(10)).await;
        scheduler.stop().await;

        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        for (job, at) in &calls[..2] {
            assert_eq!(job.kind, JobKind::Events);
            assert_eq!(job.priority, Priority::High);
            assert_eq!(*at, started);
        }
        let accounts: Vec<_> = calls[..2].iter().map(|(job, _)| job.account.clone()).collect();
        assert!(accounts.contains(&Some(AccountId::from("a"))));
        assert!(accounts.contains(&Some(AccountId::from("b"))));

        let (low, low_at) = &calls[2];
        assert_eq!(low.kind, JobKind::AccountInfo);
        assert_eq!(*low_at - started, Duration::from_secs(1));
        assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.get_stats().completed_runs, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_priority_runs_in_due_order() {
        let runner = TestRunner::ok(Duration::ZERO);
        let scheduler = scheduler(Arc::clone(&runner), SchedulerConfig::default());
        let late = scheduler.schedule_job(JobSpec::new(JobKind::Events).with_delay(Duration::from_secs(2)));
        let early = scheduler.schedule_job(JobSpec::new(JobKind::Events).with_delay(Duration::from_secs(1)));

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        scheduler.stop().await;

        let ids: Vec<JobId> = runner.calls().iter().map(|(job, _)| job.id).collect();
        assert_eq!(ids, vec![early, late]);
    }

    #[tokio::test(start_paused = true)]
    async fn recurring_job_is_rearmed() {
        let runner = TestRunner::ok(Duration::ZERO);
        let scheduler = scheduler(Arc::clone(&runner), SchedulerConfig::default());
        scheduler.schedule_job(JobSpec::new(JobKind::Events).recurring(Duration::from_secs(60)));

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(150)).await;
        scheduler.stop().await;

        assert_eq!(runner.calls().len(), 3);
        assert_eq!(scheduler.get_stats().total_jobs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_job_is_dropped_and_counted_once() {
        let runner = TestRunner::failing(ProviderErrorCode::NetworkError);
        let scheduler = scheduler(Arc::clone(&runner), SchedulerConfig::default());
        let id = scheduler.schedule_job(JobSpec::new(JobKind::Events).recurring(Duration::from_secs(60)));

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        scheduler.stop().await;

        assert_eq!(runner.calls().len(), 3);
        let stats = scheduler.get_stats();
        assert_eq!(stats.failed_jobs, 1);
        assert_eq!(stats.retried_runs, 2);
        assert!(scheduler.get_job(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_follow_backoff() {
        let runner = TestRunner::failing(ProviderErrorCode::Timeout);
        let scheduler = scheduler(Arc::clone(&runner), SchedulerConfig::default());
        scheduler.schedule_job(JobSpec::new(JobKind::Events));

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        scheduler.stop().await;

        let calls = runner.calls();
        let first_gap = calls[1].1 - calls[0].1;
        let second_gap = calls[2].1 - calls[1].1;
        assert!(first_gap >= Duration::from_secs(5) && first_gap <= Duration::from_millis(5500));
        assert!(second_gap >= Duration::from_secs(10) && second_gap <= Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_is_respected() {
        let runner = TestRunner::new(
            Duration::ZERO,
            Box::new(|_| {
                Err(ProviderError::rate_limited("slow down").with_retry_after(Duration::from_secs(120)))
            }),
        );
        let scheduler = scheduler(Arc::clone(&runner), SchedulerConfig::default());
        scheduler.schedule_job(JobSpec::new(JobKind::Events).with_max_retries(2));

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(600)).await;
        scheduler.stop().await;

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].1 - calls[0].1 >= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_fails_at_once() {
        let runner = TestRunner::failing(ProviderErrorCode::PermissionDenied);
        let scheduler = scheduler(Arc::clone(&runner), SchedulerConfig::default());
        scheduler.schedule_job(JobSpec::new(JobKind::AccountInfo).recurring(Duration::from_secs(60)));

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(600)).await;
        scheduler.stop().await;

        assert_eq!(runner.calls().len(), 1);
        let stats = scheduler.get_stats();
        assert_eq!(stats.failed_jobs, 1);
        assert_eq!(stats.retried_runs, 0);
        assert_eq!(stats.total_jobs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_job_times_out() {
        let runner = TestRunner::ok(Duration::from_secs(600));
        let scheduler = scheduler(
            Arc::clone(&runner),
            SchedulerConfig::default().with_job_timeout(Duration::from_secs(5)),
        );
        scheduler.schedule_job(JobSpec::new(JobKind::Events).with_max_retries(1));

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(60)).await;
        scheduler.stop().await;

        let stats = scheduler.get_stats();
        assert_eq!(stats.timed_out_runs, 1);
        assert_eq!(stats.failed_jobs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_gating() {
        let runner = TestRunner::ok(Duration::ZERO);
        let activity = Arc::new(ActivityMonitor::new(ActivityConfig {
            idle_threshold: Duration::from_secs(300),
            enabled_when_idle: true,
            enabled_when_active: false,
        }));
        let scheduler = SyncScheduler::new(
            SchedulerConfig::default(),
            RetryPolicy::default(),
            Arc::clone(&activity),
            Arc::clone(&runner) as Arc<dyn JobRunner>,
        );
        scheduler.schedule_job(JobSpec::new(JobKind::Events));
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(240)).await;
        assert!(runner.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(runner.calls().len(), 1);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn account_syncs_are_staggered_and_not_duplicated() {
        let runner = TestRunner::ok(Duration::ZERO);
        let scheduler = scheduler(Arc::clone(&runner), SchedulerConfig::default());
        let accounts = vec![AccountId::from("a"), AccountId::from("b")];

        let created = scheduler.schedule_account_syncs(&accounts);
        assert_eq!(created.len(), 4);
        assert!(scheduler.schedule_account_syncs(&accounts).is_empty());

        let jobs = scheduler.jobs();
        let start = jobs[0].next_run_at;
        let b_events = jobs
            .iter()
            .find(|job| job.kind == JobKind::Events && job.account == Some(AccountId::from("b")))
            .unwrap();
        assert_eq!(b_events.next_run_at - start, Duration::from_secs(2));
        assert_eq!(b_events.priority, Priority::High);
        assert!(
            jobs.iter()
                .filter(|job| job.kind == JobKind::AccountInfo)
                .all(|job| job.priority == Priority::Low && job.is_recurring())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_job_never_runs() {
        let runner = TestRunner::ok(Duration::ZERO);
        let scheduler = scheduler(Arc::clone(&runner), SchedulerConfig::default());
        let id = scheduler.schedule_job(JobSpec::new(JobKind::Events).with_delay(Duration::from_secs(10)));
        assert!(scheduler.cancel_job(id));
        assert!(!scheduler.cancel_job(id));

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(60)).await;
        scheduler.stop().await;
        assert!(runner.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_jobs_empties_queue() {
        let runner = TestRunner::ok(Duration::ZERO);
        let scheduler = scheduler(Arc::clone(&runner), SchedulerConfig::default());
        scheduler.schedule_account_syncs(&[AccountId::from("a")]);
        assert_eq!(scheduler.clear_jobs(), 2);
        assert_eq!(scheduler.get_stats().total_jobs, 0);
        assert_eq!(scheduler.get_stats().next_run_in_secs, None);
    }

    #[tokio::test(start_paused = true)]
    async fn force_sync_bypasses_queue() {
        let runner = TestRunner::ok(Duration::ZERO);
        let scheduler = scheduler(Arc::clone(&runner), SchedulerConfig::default());

        scheduler.force_sync_account(&AccountId::from("a")).await.unwrap();

        let kinds: Vec<JobKind> = runner.calls().iter().map(|(job, _)| job.kind).collect();
        assert_eq!(kinds, vec![JobKind::Events, JobKind::AccountInfo]);
        assert_eq!(scheduler.get_stats().forced_runs, 2);
        assert_eq!(scheduler.get_stats().total_jobs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn force_sync_reports_first_error() {
        let runner = TestRunner::failing(ProviderErrorCode::AuthExpired);
        let scheduler = scheduler(Arc::clone(&runner), SchedulerConfig::default());
        let err = scheduler
            .force_sync_account(&AccountId::from("a"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::AuthExpired);
        assert_eq!(runner.calls().len(), 1);
    }
}
