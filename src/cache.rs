//! Time-bounded correlation cache.
//!
//! Maps a call id to the handler waiting for its reply. Each entry is
//! timestamped on insertion and expires once older than the configured
//! timeout. Expiry is triggered two ways:
//!
//! - lazily, when [`get`](CorrelationCache::get) or
//!   [`take`](CorrelationCache::take) finds a stale entry
//! - by a background sweep that ticks once per timeout period
//!
//! Because the sweep period equals the timeout, an entry inserted just after
//! a pass can live for almost two periods. An entry is never evicted before
//! one full timeout has elapsed.
//!
//! Every entry reaches exactly one terminal action: it is handed out by
//! `take`, it is expired (firing the expiry callback and the observer), or it
//! is discarded silently by [`remove`](CorrelationCache::remove) or
//! [`shutdown`](CorrelationCache::shutdown). The terminal action is decided by
//! whoever wins the atomic removal from the map.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default correlation timeout (two minutes).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Smallest accepted timeout; the sweep interval cannot be zero.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Process-wide expiry callback, receives the evicted value.
pub type ExpiryCallback<V> = Arc<dyn Fn(&str, V) + Send + Sync>;

/// Per-cache expiry observer.
pub type ExpiryObserver<V> = Arc<dyn Fn(&str, &V) + Send + Sync>;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

struct CacheInner<V> {
    entries: DashMap<String, CacheEntry<V>>,
    timeout: Duration,
    callback: RwLock<Option<ExpiryCallback<V>>>,
    on_expire: RwLock<Option<ExpiryObserver<V>>>,
}

impl<V: Clone> CacheInner<V> {
    #[inline]
    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) > self.timeout
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();

        // Collect first: callbacks may touch the map and must not run under a
        // shard lock.
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| self.is_expired(e.value(), now))
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for key in stale {
            // A put between collection and here resets the age; re-check.
            if let Some((key, entry)) = self
                .entries
                .remove_if(&key, |_, e| self.is_expired(e, now))
            {
                self.expire(&key, entry.value);
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::debug!("Correlation sweep evicted {} entries", evicted);
        }
        evicted
    }

    fn expire(&self, key: &str, value: V) {
        tracing::debug!("Pending call {} expired", key);

        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            let value = value.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(key, value))).is_err() {
                tracing::error!("Expiry callback panicked for {}", key);
            }
        }

        let observer = self.on_expire.read().clone();
        if let Some(observer) = observer {
            if catch_unwind(AssertUnwindSafe(|| observer(key, &value))).is_err() {
                tracing::error!("Expiry observer panicked for {}", key);
            }
        }
    }
}

/// Concurrent id → pending handler map with timed expiry.
///
/// Callers never take an external lock; the sweep task mutates the same map
/// concurrently with `put`/`get`/`take`/`remove`.
pub struct CorrelationCache<V> {
    inner: Arc<CacheInner<V>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V> CorrelationCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache with the given timeout (clamped to [`MIN_TIMEOUT`]).
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                timeout: timeout.max(MIN_TIMEOUT),
                callback: RwLock::new(None),
                on_expire: RwLock::new(None),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Configured timeout, also the sweep period.
    #[inline]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Set the process-wide expiry callback.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&str, V) + Send + Sync + 'static,
    {
        *self.inner.callback.write() = Some(Arc::new(callback));
    }

    /// Set the per-cache expiry observer.
    pub fn set_on_expire<F>(&self, observer: F)
    where
        F: Fn(&str, &V) + Send + Sync + 'static,
    {
        *self.inner.on_expire.write() = Some(Arc::new(observer));
    }

    /// Insert or overwrite; the entry's age restarts at zero.
    pub fn put(&self, key: impl Into<String>, value: V) {
        self.inner.entries.insert(
            key.into(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Look up a live entry without removing it.
    ///
    /// A stale entry is removed and expired on the spot.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.inner.entries.get(key) {
            if !self.inner.is_expired(entry.value(), now) {
                return Some(entry.value.clone());
            }
        }

        if let Some((key, entry)) = self
            .inner
            .entries
            .remove_if(key, |_, e| self.inner.is_expired(e, now))
        {
            self.inner.expire(&key, entry.value);
        }
        None
    }

    /// Remove a live entry and hand it out.
    ///
    /// Only one caller can ever obtain a given entry. A stale entry is expired
    /// instead and `None` is returned.
    pub fn take(&self, key: &str) -> Option<V> {
        let (key, entry) = self.inner.entries.remove(key)?;
        if self.inner.is_expired(&entry, Instant::now()) {
            self.inner.expire(&key, entry.value);
            return None;
        }
        Some(entry.value)
    }

    /// Delete an entry without firing any callback.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// Number of entries, including stale ones not yet swept.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Run a single sweep pass now. Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Start the background sweep (no-op if already running).
    ///
    /// Must be called from within a tokio runtime. The first pass runs one
    /// timeout after start, then once per timeout.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            tracing::debug!("Correlation sweep already running");
            return;
        }

        let period = self.inner.timeout;
        let weak = Arc::downgrade(&self.inner);
        *sweeper = Some(tokio::spawn(sweep_loop(weak, period)));
    }

    /// Whether the background sweep is running.
    pub fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop the sweep and discard all entries without firing callbacks.
    pub fn shutdown(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
        self.inner.entries.clear();
    }
}

impl<V> Default for CorrelationCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl<V> Drop for CorrelationCache<V> {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

async fn sweep_loop<V: Clone>(inner: Weak<CacheInner<V>>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(cache) = inner.upgrade() else {
            return;
        };
        cache.sweep();
    }
}
