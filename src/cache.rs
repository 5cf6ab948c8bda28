//! Query cache - main entry point for cached reads and writes.
//!
//! [`QueryCache`] owns every entry, deduplicates fetches, tracks staleness,
//! garbage-collects unobserved entries and applies mutation-driven
//! invalidation. It is cheap to clone (an `Arc` increment) and every clone
//! shares the same entries.

use crate::clock::{Clock, TokioClock};
use crate::entry::{ObserverId, ObserverRegistration, QueryEntry, SharedFetch};
use crate::error::{Error, QueryError, Result};
use crate::fetcher::{self, ErasedFetcher, MutationFn, QueryData, QueryFn};
use crate::key::QueryKey;
use crate::mutation::Mutation;
use crate::observability::{CacheEvent, ListenerId, NoOpMetrics, QueryMetrics};
use crate::observer::QueryObserver;
use crate::options::{FetchSettings, MutationOptions, QueryCacheConfig, QueryOptions};
use crate::state::QueryState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;

type EventListener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Shared state behind every [`QueryCache`] clone and every observer.
pub(crate) struct CacheInner {
    entries: DashMap<QueryKey, QueryEntry>,
    config: QueryCacheConfig,
    clock: Arc<dyn Clock>,
    metrics: Box<dyn QueryMetrics>,
    listeners: RwLock<Vec<(ListenerId, EventListener)>>,
    next_id: AtomicU64,
}

/// Async query cache.
///
/// # Example
///
/// ```no_run
/// use query_kit::{query_key, QueryCache, QueryOptions};
///
/// #[tokio::main]
/// async fn main() -> query_kit::Result<()> {
///     let cache = QueryCache::new();
///
///     let mut heroes = cache.subscribe(
///         "super-heroes",
///         || async { Ok::<_, std::io::Error>(vec!["Batman".to_string()]) },
///         QueryOptions::default(),
///     )?;
///
///     let state = heroes.settled().await;
///     assert_eq!(state.data.as_deref(), Some(&vec!["Batman".to_string()]));
///
///     // A second observer on the same key shares the cached entry.
///     let again = cache.subscribe(
///         query_key!["super-heroes"],
///         || async { Ok::<_, std::io::Error>(Vec::<String>::new()) },
///         QueryOptions::default(),
///     )?;
///     # drop(again);
///     Ok(())
/// }
/// ```
///
/// Every operation that may start a fetch must run inside a tokio runtime.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

/// Builder for a [`QueryCache`] with custom config, clock or metrics.
pub struct QueryCacheBuilder {
    config: QueryCacheConfig,
    clock: Arc<dyn Clock>,
    metrics: Box<dyn QueryMetrics>,
}

impl QueryCacheBuilder {
    pub fn with_config(mut self, config: QueryCacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the time and timer source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Box<dyn QueryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Build the cache.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if the config fails validation.
    pub fn build(self) -> Result<QueryCache> {
        self.config.validate()?;
        Ok(QueryCache {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                config: self.config,
                clock: self.clock,
                metrics: self.metrics,
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        })
    }
}

/// Cache statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub observed_entries: usize,
    pub observers: usize,
    pub fetching_entries: usize,
    pub stale_entries: usize,
    pub error_entries: usize,
}

impl QueryCache {
    /// Create a cache with default config, the tokio clock and no metrics.
    pub fn new() -> Self {
        QueryCache {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                config: QueryCacheConfig::default(),
                clock: Arc::new(TokioClock),
                metrics: Box::new(NoOpMetrics),
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn builder() -> QueryCacheBuilder {
        QueryCacheBuilder {
            config: QueryCacheConfig::default(),
            clock: Arc::new(TokioClock),
            metrics: Box::new(NoOpMetrics),
        }
    }

    /// Create a cache with the given config.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if the config fails validation.
    pub fn with_config(config: QueryCacheConfig) -> Result<Self> {
        Self::builder().with_config(config).build()
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.inner.config
    }

    /// Register interest in `key`.
    ///
    /// - No entry yet: one is created and fetched immediately.
    /// - Fresh success data: served from cache, no fetch.
    /// - Stale data: served from cache while `refetch_on_mount` decides
    ///   whether to revalidate in the background.
    ///
    /// The returned observer unsubscribes when dropped.
    ///
    /// # Errors
    /// - `Error::TypeMismatch`: `key` already holds data of another type
    /// - `Error::ConfigError`: called outside a tokio runtime
    pub fn subscribe<T, S, Q>(
        &self,
        key: impl Into<QueryKey>,
        query_fn: Q,
        options: QueryOptions<T, S>,
    ) -> Result<QueryObserver<T, S>>
    where
        T: Send + Sync + 'static,
        S: Send + Sync + 'static,
        Q: QueryFn<T>,
    {
        let key = key.into();
        let runtime = runtime_handle()?;
        self.inner
            .subscribe(key, fetcher::erase(query_fn), options, &runtime)
    }

    /// Subscribe to several keys sharing one set of options.
    ///
    /// Each key gets its own entry and its own (deduplicated) fetch, so the
    /// queries run in parallel.
    ///
    /// # Errors
    /// Fails on the first key that cannot be subscribed; observers created
    /// before it are dropped and unsubscribe.
    pub fn subscribe_many<T, S, Q, I, K>(
        &self,
        queries: I,
        options: QueryOptions<T, S>,
    ) -> Result<Vec<QueryObserver<T, S>>>
    where
        T: Send + Sync + 'static,
        S: Send + Sync + 'static,
        Q: QueryFn<T>,
        I: IntoIterator<Item = (K, Q)>,
        K: Into<QueryKey>,
    {
        queries
            .into_iter()
            .map(|(key, query_fn)| self.subscribe(key, query_fn, options.clone()))
            .collect()
    }

    /// Force a fetch of `key` even if its data is fresh, and wait for it.
    ///
    /// Attaches to a fetch already in flight instead of starting another.
    ///
    /// # Errors
    /// - `Error::NotFound`: no entry or no fetch function for `key`
    /// - `Error::Fetch`: the fetch failed (the entry keeps its last data)
    pub async fn refetch(&self, key: &QueryKey) -> Result<()> {
        let runtime = runtime_handle()?;
        let fetch = self.inner.refetch(key, &runtime)?;
        fetch.await.map(|_| ())
    }

    /// Fetch `key` imperatively and return its data.
    ///
    /// Returns cached data when fresh, otherwise waits for a (deduplicated)
    /// fetch. Entries created here have no observers and are collected after
    /// `cache_time`.
    ///
    /// The `on_success` and `on_error` listeners in `options` run once the
    /// fetch this call waited on completes; they do not run for a cache hit.
    /// `enabled` and `refetch_on_*` only concern observers and are ignored
    /// here.
    ///
    /// # Errors
    /// - `Error::TypeMismatch`: `key` holds data of another type
    /// - `Error::Fetch`: the fetch failed
    pub async fn fetch_query<T, Q>(
        &self,
        key: impl Into<QueryKey>,
        query_fn: Q,
        options: QueryOptions<T>,
    ) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        Q: QueryFn<T>,
    {
        let key = key.into();
        let runtime = runtime_handle()?;
        let fetch = self
            .inner
            .fetch_query::<T>(&key, fetcher::erase(query_fn), &options, &runtime)?;

        let data = match fetch {
            FetchQuery::Cached(data) => data,
            FetchQuery::Pending(fetch) => match fetch.await {
                Ok(data) => {
                    if let Some(value) = (*data).downcast_ref::<T>() {
                        for listener in &options.on_success {
                            listener(value);
                        }
                    }
                    data
                }
                Err(e) => {
                    if let Some(error) = e.source_error() {
                        for listener in &options.on_error {
                            listener(error);
                        }
                    }
                    return Err(e);
                }
            },
        };

        data.downcast::<T>().map_err(|_| Error::TypeMismatch {
            key,
            expected: std::any::type_name::<T>(),
        })
    }

    /// Canonical data cached for `key`, if any.
    pub fn get_query_data<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<Arc<T>> {
        self.inner.evict_if_expired(key, self.inner.clock.now());
        self.inner
            .entries
            .get(key)
            .and_then(|entry| entry.data.clone())
            .and_then(|data| data.downcast::<T>().ok())
    }

    /// Replace the cached data for `key` wholesale, as if it had just been
    /// fetched.
    ///
    /// # Errors
    /// Returns `Error::TypeMismatch` if `key` holds data of another type.
    pub fn set_query_data<T: Send + Sync + 'static>(
        &self,
        key: impl Into<QueryKey>,
        data: T,
    ) -> Result<()> {
        let key = key.into();
        self.inner.set_query_data::<T>(key, Arc::new(data))
    }

    /// Read model for `key` without subscribing.
    pub fn get_query_state<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
    ) -> Option<QueryState<T>> {
        let now = self.inner.clock.now();
        self.inner.evict_if_expired(key, now);
        let project: crate::options::Projection<T, T> = Arc::new(|data| data);
        self.inner.entries.get(key).and_then(|entry| {
            entry.ensure_type::<T>().ok()?;
            Some(entry.snapshot(now, entry.settings.stale_time, &project))
        })
    }

    /// Mark `key` stale. The next subscribe or refetch fetches it again.
    ///
    /// Returns false if no entry exists.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        self.inner.invalidate(std::slice::from_ref(key)) > 0
    }

    /// Mark every entry whose key starts with `prefix` stale.
    ///
    /// Returns the number of entries invalidated.
    pub fn invalidate_matching(&self, prefix: &QueryKey) -> usize {
        let keys: Vec<QueryKey> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        self.inner.invalidate(&keys)
    }

    /// Signal that the application regained focus.
    ///
    /// Refetches observed entries whose observers' `refetch_on_window_focus`
    /// policy asks for it. Returns the number of fetches started; entries
    /// already fetching are coalesced into their current fetch.
    pub fn focus(&self) -> usize {
        match runtime_handle() {
            Ok(runtime) => self.inner.focus(&runtime),
            Err(e) => {
                warn!("Ignoring focus signal: {}", e);
                0
            }
        }
    }

    /// Create a reusable mutation handle.
    pub fn mutation<V, R, M>(
        &self,
        mutation_fn: M,
        options: MutationOptions<V, R>,
    ) -> Mutation<V, R>
    where
        V: Clone + Send + Sync + 'static,
        R: Send + Sync + 'static,
        M: MutationFn<V, R>,
    {
        Mutation::new(self.clone(), mutation_fn, options)
    }

    /// Run a mutation once.
    ///
    /// # Errors
    /// Returns `Error::Mutation` with the original error if it fails.
    pub async fn mutate<V, R, M>(
        &self,
        mutation_fn: M,
        variables: V,
        options: MutationOptions<V, R>,
    ) -> Result<Arc<R>>
    where
        V: Clone + Send + Sync + 'static,
        R: Send + Sync + 'static,
        M: MutationFn<V, R>,
    {
        self.mutation(mutation_fn, options).mutate(variables).await
    }

    /// Register a listener called on every entry transition.
    ///
    /// Listeners run synchronously after the entry lock is released, so they
    /// may call back into the cache.
    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id());
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Remove an entry immediately, observed or not.
    ///
    /// A fetch in flight for it still completes, but its result is dropped.
    pub fn remove(&self, key: &QueryKey) -> bool {
        let removed = self.inner.entries.remove(key).is_some();
        if removed {
            self.inner.emit(vec![CacheEvent::Removed { key: key.clone() }]);
        }
        removed
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let keys: Vec<QueryKey> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        self.inner.entries.clear();
        warn!("⚠ Query cache CLEAR executed - {} entries dropped", keys.len());
        self.inner.emit(
            keys.into_iter()
                .map(|key| CacheEvent::Removed { key })
                .collect(),
        );
    }

    /// Evict every expired entry now instead of waiting for its timer.
    ///
    /// Returns the number of entries evicted.
    pub fn collect_garbage(&self) -> usize {
        let now = self.inner.clock.now();
        let keys: Vec<QueryKey> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.iter()
            .filter(|key| self.inner.evict_if_expired(key, now))
            .count()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of entries with a fetch in flight.
    pub fn fetching_count(&self) -> usize {
        self.inner
            .entries
            .iter()
            .filter(|entry| entry.is_fetching)
            .count()
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.inner.clock.now();
        self.inner
            .entries
            .iter()
            .fold(CacheStats::default(), |mut stats, entry| {
                stats.total_entries += 1;
                stats.observers += entry.observers.len();
                if !entry.observers.is_empty() {
                    stats.observed_entries += 1;
                }
                if entry.is_fetching {
                    stats.fetching_entries += 1;
                }
                if entry.is_stale(now) {
                    stats.stale_entries += 1;
                }
                if entry.error.is_some() {
                    stats.error_entries += 1;
                }
                stats
            })
    }

    /// Print cache statistics to debug log.
    pub fn log_stats(&self) {
        let stats = self.stats();
        debug!(
            "Query cache stats: {} entries ({} observed, {} fetching, {} stale, {} failed)",
            stats.total_entries,
            stats.observed_entries,
            stats.fetching_entries,
            stats.stale_entries,
            stats.error_entries
        );
    }

    pub(crate) fn from_inner(inner: Arc<CacheInner>) -> Self {
        QueryCache { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<CacheInner> {
        &self.inner
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) enum FetchQuery {
    Cached(QueryData),
    Pending(SharedFetch),
}

impl CacheInner {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    pub(crate) fn with_entry<R>(
        &self,
        key: &QueryKey,
        f: impl FnOnce(&QueryEntry) -> R,
    ) -> Option<R> {
        self.entries.get(key).map(|entry| f(entry.value()))
    }

    /// Call every event listener, outside any entry lock.
    pub(crate) fn emit(&self, events: Vec<CacheEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<EventListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for event in &events {
            for listener in &listeners {
                listener(event);
            }
        }
    }

    fn subscribe<T, S>(
        self: &Arc<Self>,
        key: QueryKey,
        fetcher: ErasedFetcher,
        options: QueryOptions<T, S>,
        runtime: &Handle,
    ) -> Result<QueryObserver<T, S>>
    where
        T: Send + Sync + 'static,
        S: Send + Sync + 'static,
    {
        let now = self.clock.now();
        let settings = options.resolve(&self.config);
        let observer_id = self.next_id();
        let mut events = Vec::new();

        self.evict_if_expired(&key, now);

        let notifications = {
            let mut entry = match self.entries.entry(key.clone()) {
                Entry::Occupied(occupied) => occupied.into_ref(),
                Entry::Vacant(vacant) => {
                    events.push(CacheEvent::Added { key: key.clone() });
                    vacant.insert(QueryEntry::new::<T>(key.clone(), settings))
                }
            };

            if let Err(e) = entry.ensure_type::<T>() {
                warn!("{} holds {}, refusing subscriber", key, entry.type_name);
                return Err(e);
            }

            entry.fetcher = Some(fetcher);
            entry.set_settings(settings);
            entry.expires_at = None;
            entry.gc_generation += 1;
            entry.observers.insert(
                observer_id,
                ObserverRegistration {
                    enabled: options.enabled,
                    stale_time: settings.stale_time,
                    refetch_on_window_focus: options.refetch_on_window_focus,
                    on_success: erase_success_listeners(&options),
                    on_error: options.on_error.clone(),
                },
            );
            events.push(CacheEvent::ObserversChanged {
                key: key.clone(),
                observers: entry.observers.len(),
            });

            let is_stale = entry.is_stale_for(now, settings.stale_time);
            let should_fetch = options.enabled
                && (entry.data.is_none() || options.refetch_on_mount.should_refetch(is_stale));

            if should_fetch {
                self.metrics.record_miss(&key);
                self.start_fetch(&mut entry, runtime, &mut events)?;
            } else if entry.data.is_some() {
                self.metrics.record_hit(&key);
            }

            entry.subscribe_notifications()
        };

        self.emit(events);

        Ok(QueryObserver::new(
            Arc::clone(self),
            key,
            observer_id,
            settings.stale_time,
            options.project,
            notifications,
        ))
    }

    /// Remove one observer; arm the garbage-collection timer when it was the
    /// last one.
    pub(crate) fn unsubscribe(self: &Arc<Self>, key: &QueryKey, observer_id: ObserverId) {
        let now = self.clock.now();
        let mut events = Vec::new();

        let gc = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.observers.remove(&observer_id).is_none() {
                    None
                } else {
                    events.push(CacheEvent::ObserversChanged {
                        key: key.clone(),
                        observers: entry.observers.len(),
                    });
                    if entry.observers.is_empty() {
                        entry.expires_at = None;
                        arm_gc(&mut entry, now)
                    } else {
                        None
                    }
                }
            }
            None => None,
        };

        self.emit(events);

        if let Some((generation, delay)) = gc {
            debug!("{} unobserved, collecting in {:?}", key, delay);
            self.schedule_gc(key.clone(), generation, delay);
        }
    }

    fn refetch(self: &Arc<Self>, key: &QueryKey, runtime: &Handle) -> Result<SharedFetch> {
        let mut events = Vec::new();
        let fetch = {
            let mut entry = self
                .entries
                .get_mut(key)
                .ok_or_else(|| Error::NotFound(key.clone()))?;
            self.start_fetch(&mut entry, runtime, &mut events)?
        };
        self.emit(events);
        Ok(fetch)
    }

    /// Start fetches for keys that currently have enabled observers.
    pub(crate) fn refetch_observed(self: &Arc<Self>, keys: &[QueryKey]) -> usize {
        let runtime = match runtime_handle() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Skipping refetch of invalidated queries: {}", e);
                return 0;
            }
        };

        let mut events = Vec::new();
        let mut started = 0;
        for key in keys {
            if let Some(mut entry) = self.entries.get_mut(key) {
                let observed = entry.observers.values().any(|o| o.enabled);
                if observed && entry.fetcher.is_some() {
                    if let Err(e) = self.start_fetch(&mut entry, &runtime, &mut events) {
                        warn!("Could not refetch {}: {}", key, e);
                    } else {
                        started += 1;
                    }
                }
            }
        }
        self.emit(events);
        started
    }

    fn fetch_query<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        key: &QueryKey,
        fetcher: ErasedFetcher,
        options: &QueryOptions<T>,
        runtime: &Handle,
    ) -> Result<FetchQuery> {
        let now = self.clock.now();
        let settings = options.resolve(&self.config);
        let mut events = Vec::new();

        self.evict_if_expired(key, now);

        let result = {
            let mut entry = match self.entries.entry(key.clone()) {
                Entry::Occupied(occupied) => occupied.into_ref(),
                Entry::Vacant(vacant) => {
                    events.push(CacheEvent::Added { key: key.clone() });
                    vacant.insert(QueryEntry::new::<T>(key.clone(), settings))
                }
            };
            entry.ensure_type::<T>()?;

            entry.fetcher = Some(fetcher);
            entry.set_settings(settings);

            match entry.data.clone() {
                Some(data) if !entry.is_stale_for(now, settings.stale_time) => {
                    self.metrics.record_hit(key);
                    FetchQuery::Cached(data)
                }
                _ => {
                    self.metrics.record_miss(key);
                    FetchQuery::Pending(self.start_fetch(&mut entry, runtime, &mut events)?)
                }
            }
        };

        self.emit(events);
        Ok(result)
    }

    fn set_query_data<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        key: QueryKey,
        data: QueryData,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut events = Vec::new();

        self.evict_if_expired(&key, now);

        let gc = {
            let mut entry = match self.entries.entry(key.clone()) {
                Entry::Occupied(occupied) => occupied.into_ref(),
                Entry::Vacant(vacant) => {
                    events.push(CacheEvent::Added { key: key.clone() });
                    vacant.insert(QueryEntry::new::<T>(
                        key.clone(),
                        FetchSettings::from_config(&self.config),
                    ))
                }
            };
            entry.ensure_type::<T>()?;
            entry.set_data(data, now);
            events.push(CacheEvent::Updated {
                key: key.clone(),
                status: entry.status,
                is_fetching: entry.is_fetching,
            });

            if entry.observers.is_empty() && entry.expires_at.is_none() {
                arm_gc(&mut entry, now)
            } else {
                None
            }
        };

        self.emit(events);

        if let Some((generation, delay)) = gc {
            self.schedule_gc(key, generation, delay);
        }
        Ok(())
    }

    /// Mark the given keys stale. Returns how many existed.
    pub(crate) fn invalidate(&self, keys: &[QueryKey]) -> usize {
        let mut events = Vec::new();
        for key in keys {
            if let Some(mut entry) = self.entries.get_mut(key) {
                entry.invalidate();
                events.push(CacheEvent::Invalidated { key: key.clone() });
            }
        }
        debug!("✓ Invalidated {} of {} queries", events.len(), keys.len());
        let count = events.len();
        self.emit(events);
        count
    }

    fn focus(self: &Arc<Self>, runtime: &Handle) -> usize {
        let now = self.clock.now();
        let keys: Vec<QueryKey> = self
            .entries
            .iter()
            .filter(|entry| {
                entry.fetcher.is_some()
                    && entry.observers.values().any(|o| {
                        o.enabled
                            && o.refetch_on_window_focus
                                .should_refetch(entry.is_stale_for(now, o.stale_time))
                    })
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut events = Vec::new();
        let mut started = 0;
        for key in &keys {
            if let Some(mut entry) = self.entries.get_mut(key) {
                if entry.in_flight.is_some() {
                    self.metrics.record_dedup(key);
                    continue;
                }
                match self.start_fetch(&mut entry, runtime, &mut events) {
                    Ok(_) => started += 1,
                    Err(e) => warn!("Focus refetch of {} failed to start: {}", key, e),
                }
            }
        }
        self.emit(events);
        debug!("Focus: {} refetches started", started);
        started
    }

    /// Start a fetch for a locked entry, or attach to the one in flight.
    fn start_fetch(
        self: &Arc<Self>,
        entry: &mut QueryEntry,
        runtime: &Handle,
        events: &mut Vec<CacheEvent>,
    ) -> Result<SharedFetch> {
        if let Some(in_flight) = &entry.in_flight {
            self.metrics.record_dedup(&entry.key);
            return Ok(in_flight.future.clone());
        }

        let fetcher = entry
            .fetcher
            .clone()
            .ok_or_else(|| Error::NotFound(entry.key.clone()))?;
        let id = self.next_id();
        let key = entry.key.clone();
        let settings = entry.settings;
        let weak: Weak<CacheInner> = Arc::downgrade(self);

        debug!("» Fetching {} (fetch #{})", key, id);

        let task = {
            let inner = Arc::clone(self);
            let key = key.clone();
            runtime.spawn(async move { inner.run_fetch(key, id, fetcher, settings).await })
        };
        let future = async move {
            match task.await {
                Ok(result) => result,
                // Aborted before completing: release the entry.
                Err(e) => {
                    let error = Error::from(e);
                    match weak.upgrade() {
                        Some(inner) => {
                            let error: QueryError = Arc::new(error);
                            inner.complete_fetch(&key, id, Err(error))
                        }
                        None => Err(error),
                    }
                }
            }
        }
        .boxed()
        .shared();

        entry.in_flight = Some(crate::entry::InFlight {
            id,
            started_at: self.clock.now(),
            invalidations: entry.invalidations,
            future: future.clone(),
        });
        entry.begin_fetch();
        events.push(CacheEvent::Updated {
            key: entry.key.clone(),
            status: entry.status,
            is_fetching: entry.is_fetching,
        });

        Ok(future)
    }

    async fn run_fetch(
        self: Arc<Self>,
        key: QueryKey,
        id: u64,
        fetcher: ErasedFetcher,
        settings: FetchSettings,
    ) -> Result<QueryData> {
        let attempt = fetcher::fetch_with_retry(
            &key,
            &fetcher,
            settings.retry,
            settings.retry_delay,
            self.clock.as_ref(),
        );
        let result = match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(&*panic);
                error!("Fetch #{} for {} panicked: {}", id, key, message);
                let error: QueryError =
                    Arc::new(Error::Cancelled(format!("fetch panicked: {}", message)));
                Err(error)
            }
        };
        self.complete_fetch(&key, id, result)
    }

    /// Apply a finished fetch to its entry and notify everyone attached.
    fn complete_fetch(
        self: &Arc<Self>,
        key: &QueryKey,
        id: u64,
        result: std::result::Result<QueryData, QueryError>,
    ) -> Result<QueryData> {
        let now = self.clock.now();
        let mut events = Vec::new();
        let mut success_listeners = Vec::new();
        let mut error_listeners = Vec::new();
        let mut elapsed = Duration::ZERO;
        let mut gc = None;

        match self.entries.get_mut(key) {
            Some(mut entry) if entry.in_flight.as_ref().is_some_and(|f| f.id == id) => {
                if let Some(in_flight) = &entry.in_flight {
                    elapsed = now.saturating_duration_since(in_flight.started_at);
                }
                match &result {
                    Ok(data) => {
                        entry.apply_success(Arc::clone(data), now);
                        debug!("✓ Fetched {} ({} fetches so far)", key, entry.fetch_count);
                        success_listeners = entry.success_listeners();
                    }
                    Err(e) => {
                        entry.apply_error(Arc::clone(e));
                        error_listeners = entry.error_listeners();
                    }
                }
                events.push(CacheEvent::Updated {
                    key: key.clone(),
                    status: entry.status,
                    is_fetching: entry.is_fetching,
                });
                // cache_time counts from the end of a fetch nobody watched.
                if entry.observers.is_empty() {
                    entry.expires_at = None;
                    gc = arm_gc(&mut entry, now);
                }
            }
            _ => debug!(
                "Discarding result of fetch #{} for {}: entry was removed",
                id, key
            ),
        }

        self.emit(events);

        match &result {
            Ok(data) => {
                self.metrics.record_fetch(key, elapsed);
                for listener in &success_listeners {
                    listener(data);
                }
            }
            Err(e) => {
                self.metrics.record_error(key, &e.to_string());
                for listener in &error_listeners {
                    listener(e);
                }
            }
        }

        if let Some((generation, delay)) = gc {
            self.schedule_gc(key.clone(), generation, delay);
        }

        result.map_err(Error::Fetch)
    }

    fn schedule_gc(self: &Arc<Self>, key: QueryKey, generation: u64, delay: Duration) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                debug!("No runtime to collect {}; it expires on next access", key);
                return;
            }
        };

        let weak: Weak<CacheInner> = Arc::downgrade(self);
        let sleep = self.clock.sleep(delay);
        runtime.spawn(async move {
            sleep.await;
            if let Some(inner) = weak.upgrade() {
                inner.collect(&key, generation);
            }
        });
    }

    /// Timer callback: evict `key` if nothing touched it since the timer was
    /// armed.
    fn collect(&self, key: &QueryKey, generation: u64) {
        let now = self.clock.now();
        let removed = self
            .entries
            .remove_if(key, |_, entry| {
                entry.gc_generation == generation && entry.is_expired(now)
            })
            .is_some();

        if removed {
            self.metrics.record_eviction(key);
            self.emit(vec![CacheEvent::Removed { key: key.clone() }]);
        }
    }

    /// Evict `key` if it is past its expiry, whether or not its timer ran.
    pub(crate) fn evict_if_expired(&self, key: &QueryKey, now: Instant) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some();

        if removed {
            self.metrics.record_eviction(key);
            self.emit(vec![CacheEvent::Removed { key: key.clone() }]);
        }
        removed
    }
}

/// Set `expires_at` if unset and return the timer to arm, if any.
///
/// An infinite `cache_time` never arms a timer.
fn arm_gc(entry: &mut QueryEntry, now: Instant) -> Option<(u64, Duration)> {
    entry.gc_generation += 1;
    if entry.expires_at.is_none() {
        entry.expires_at = now.checked_add(entry.settings.cache_time);
    }
    entry
        .expires_at
        .map(|at| (entry.gc_generation, at.saturating_duration_since(now)))
}

fn erase_success_listeners<T: Send + Sync + 'static, S>(
    options: &QueryOptions<T, S>,
) -> Option<crate::entry::ErasedSuccessListener> {
    if options.on_success.is_empty() {
        return None;
    }
    let listeners = options.on_success.clone();
    Some(Arc::new(move |data: &QueryData| {
        if let Some(value) = (**data).downcast_ref::<T>() {
            for listener in &listeners {
                listener(value);
            }
        }
    }))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn runtime_handle() -> Result<Handle> {
    Handle::try_current()
        .map_err(|e| Error::ConfigError(format!("query cache requires a tokio runtime: {}", e)))
}
