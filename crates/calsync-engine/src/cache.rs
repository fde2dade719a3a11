//! Expiring key/value cache with single-flight loading.
//!
//! [`TtlCache`] stores cloned values under string keys. Entries expire
//! lazily on read and are purged by an optional background sweeper.
//! [`TtlCache::get_or_set`] guarantees that concurrent misses for the same
//! key share one computation.
//!
//! Keys are built with [`CacheKey`], which escapes each segment so that glob
//! patterns passed to [`TtlCache::invalidate_pattern`] cannot match across
//! segment boundaries.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use regex::Regex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

type Flight<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

/// A cached value and its lifetime.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            inserted_at: now,
            expires_at: now + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct InFlight<V, E> {
    id: u64,
    flight: Flight<V, E>,
}

struct State<V, E> {
    entries: HashMap<String, CacheEntry<V>>,
    in_flight: HashMap<String, InFlight<V, E>>,
    next_flight: u64,
}

struct Inner<V, E> {
    state: Mutex<State<V, E>>,
    hits: AtomicU64,
    misses: AtomicU64,
    weigher: fn(&V) -> usize,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V, E> Inner<V, E> {
    fn lock(&self) -> MutexGuard<'_, State<V, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(now));
        before - state.entries.len()
    }
}

impl<V, E> Drop for Inner<V, E> {
    fn drop(&mut self) {
        let sweeper = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = sweeper.take() {
            handle.abort();
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Entries currently stored, expired or not.
    pub total_items: usize,
    /// Stored entries past their expiry that were not yet purged.
    pub expired_items: usize,
    /// Rough footprint of keys and values.
    pub approx_memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    /// Keys with a computation in progress.
    pub in_flight: usize,
}

impl CacheStats {
    /// Fraction of lookups served from the cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

fn default_weight<V>(_: &V) -> usize {
    std::mem::size_of::<V>()
}

/// Generic TTL cache.
///
/// Cloning the cache yields another handle to the same storage.
pub struct TtlCache<V, E> {
    inner: Arc<Inner<V, E>>,
}

impl<V, E> Clone for TtlCache<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> fmt::Debug for TtlCache<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("TtlCache")
            .field("entries", &state.entries.len())
            .field("in_flight", &state.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl<V, E> Default for TtlCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> TtlCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates an empty cache that weighs values by their inline size.
    pub fn new() -> Self {
        Self::with_weigher(default_weight::<V>)
    }

    /// Creates an empty cache with a custom size estimate for values.
    pub fn with_weigher(weigher: fn(&V) -> usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    in_flight: HashMap::new(),
                    next_flight: 0,
                }),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                weigher,
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Stores `value` under `key` for `ttl`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        trace!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache set");
        self.inner
            .lock()
            .entries
            .insert(key, CacheEntry::new(value, ttl));
    }

    /// Returns the value for `key` unless it is missing or expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.inner.lock();
        match state.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => {
                state.entries.remove(key);
            }
            None => {}
        }
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Returns the value for `key` if it is live and `accept` takes it,
    /// counting a hit. Anything else is not counted, so the caller can fall
    /// back to [`get_or_set`](Self::get_or_set) for a single miss.
    pub fn get_matching(&self, key: &str, accept: impl FnOnce(&V) -> bool) -> Option<V> {
        let now = Instant::now();
        let state = self.inner.lock();
        let entry = state.entries.get(key)?;
        if entry.is_expired(now) || !accept(&entry.value) {
            return None;
        }
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Removes `key`. Returns true if an entry was stored.
    ///
    /// A computation in progress for the key is detached: its callers still
    /// get the result, but it is not written back.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.inner.lock();
        state.in_flight.remove(key);
        state.entries.remove(key).is_some()
    }

    /// Removes every entry whose key matches a glob (`*` any run, `?` one
    /// character). Returns the number of entries removed.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let regex = match glob_to_regex(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                warn!(pattern, error = %e, "invalid cache pattern");
                return 0;
            }
        };

        let mut state = self.inner.lock();
        let before = state.entries.len();
        state.entries.retain(|key, _| !regex.is_match(key));
        state.in_flight.retain(|key, _| !regex.is_match(key));
        let removed = before - state.entries.len();
        debug!(pattern, removed, "invalidated cache entries");
        removed
    }

    /// Removes everything.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.in_flight.clear();
        debug!(count, "cleared cache");
    }

    /// Drops expired entries now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let state = self.inner.lock();
        let weigh = self.inner.weigher;
        let overhead = std::mem::size_of::<CacheEntry<V>>();

        CacheStats {
            total_items: state.entries.len(),
            expired_items: state
                .entries
                .values()
                .filter(|entry| entry.is_expired(now))
                .count(),
            approx_memory_bytes: state
                .entries
                .iter()
                .map(|(key, entry)| key.len() + overhead + weigh(&entry.value))
                .sum(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            in_flight: state.in_flight.len(),
        }
    }

    /// Age of the entry for `key`, if one is stored.
    pub fn age(&self, key: &str) -> Option<Duration> {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.inserted_at.elapsed())
    }

    /// Returns the cached value or computes it with `factory`.
    ///
    /// Concurrent calls for the same missing key share one invocation of
    /// `factory` and all receive its result. Errors are returned to every
    /// waiter but not cached. The computation runs on its own task, so
    /// dropping a caller never cancels it for the others.
    pub async fn get_or_set<F, Fut>(&self, key: &str, ttl: Duration, factory: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let flight = {
            let now = Instant::now();
            let mut state = self.inner.lock();
            match state.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.value.clone());
                }
                Some(_) => {
                    state.entries.remove(key);
                }
                None => {}
            }
            self.inner.misses.fetch_add(1, Ordering::Relaxed);

            if let Some(existing) = state.in_flight.get(key) {
                trace!(key, "joining in-flight computation");
                existing.flight.clone()
            } else {
                let id = state.next_flight;
                state.next_flight += 1;
                let flight = self.launch(key.to_string(), id, ttl, factory);
                state.in_flight.insert(
                    key.to_string(),
                    InFlight {
                        id,
                        flight: flight.clone(),
                    },
                );
                tokio::spawn(flight.clone());
                flight
            }
        };

        flight.await
    }

    fn launch<F, Fut>(&self, key: String, id: u64, ttl: Duration, factory: F) -> Flight<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        async move {
            let result = factory().await;

            // registry removal and insert happen under one lock
            let mut state = inner.lock();
            let current = state
                .in_flight
                .get(&key)
                .is_some_and(|flight| flight.id == id);
            if current {
                state.in_flight.remove(&key);
                if let Ok(value) = &result {
                    state
                        .entries
                        .insert(key, CacheEntry::new(value.clone(), ttl));
                }
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Starts the background task that purges expired entries every
    /// `every`. Does nothing if one is already running.
    pub fn start_sweeper(&self, every: Duration) {
        let mut slot = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let every = every.max(Duration::from_millis(1));
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let removed = inner.purge_expired();
                if removed > 0 {
                    debug!(removed, "swept expired cache entries");
                }
            }
        }));
        debug!(every_ms = every.as_millis() as u64, "cache sweeper started");
    }

    /// Stops the background sweeper.
    pub fn stop_sweeper(&self) {
        let handle = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("cache sweeper stopped");
        }
    }
}

/// Compiles a `*`/`?` glob into an anchored regex.
fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push_str("(?s)^");
    let mut buf = [0u8; 4];
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c => pattern.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

/// Builder for `{kind}_{segment}_{segment}...` cache keys.
///
/// Segments are escaped so a segment never contains `_`, `*`, `?` or a bare
/// `%`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    segments: Vec<String>,
}

impl CacheKey {
    pub fn new(kind: &str) -> Self {
        Self {
            segments: vec![escape_segment(kind)],
        }
    }

    /// Appends one segment.
    pub fn segment(mut self, value: impl fmt::Display) -> Self {
        self.segments.push(escape_segment(&value.to_string()));
        self
    }

    /// Glob matching every key that extends this one by at least one segment.
    pub fn children_pattern(&self) -> String {
        format!("{}_*", self)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("_"))
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}

fn escape_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '_' => out.push_str("%5F"),
            '*' => out.push_str("%2A"),
            '?' => out.push_str("%3F"),
            c => out.push(c),
        }
    }
    out
}
