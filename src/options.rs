//! Configuration for the cache, individual queries and mutations.
//!
//! Settings come in two layers:
//!
//! - **Cache-wide defaults (`QueryCacheConfig`)**: set once on the
//!   [`QueryCache`](crate::QueryCache) with `with_config()`.
//! - **Per-query overrides (`QueryOptions`)**: passed to `subscribe()`.
//!   Any unset `stale_time`, `cache_time`, `retry` or `retry_delay` falls back
//!   to the cache-wide value.
//!
//! ```
//! use query_kit::options::{QueryOptions, RefetchPolicy};
//! use std::time::Duration;
//!
//! let options = QueryOptions::<Vec<String>>::default()
//!     .stale_time(Duration::from_secs(10))
//!     .refetch_on_window_focus(RefetchPolicy::Never)
//!     .select(|heroes: &Vec<String>| heroes.len());
//! # let _ = options;
//! ```

use crate::error::{Error, QueryError, Result};
use crate::key::QueryKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default retention of unobserved entries: 5 minutes.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(300);

/// Default base delay between fetch retries.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// When a trigger (mount, window focus) should refetch an entry.
///
/// Replaces the `true` / `false` / `"always"` flag of the usual hook APIs.
///
/// | Policy | Fresh data | Stale data |
/// |--------|-----------|------------|
/// | `Never` | no fetch | no fetch |
/// | `IfStale` | no fetch | fetch |
/// | `Always` | fetch | fetch |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefetchPolicy {
    Never,
    #[default]
    IfStale,
    Always,
}

impl RefetchPolicy {
    pub fn should_refetch(self, is_stale: bool) -> bool {
        match self {
            RefetchPolicy::Never => false,
            RefetchPolicy::IfStale => is_stale,
            RefetchPolicy::Always => true,
        }
    }
}

impl From<bool> for RefetchPolicy {
    fn from(enabled: bool) -> Self {
        if enabled {
            RefetchPolicy::IfStale
        } else {
            RefetchPolicy::Never
        }
    }
}

impl fmt::Display for RefetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefetchPolicy::Never => write!(f, "Never"),
            RefetchPolicy::IfStale => write!(f, "IfStale"),
            RefetchPolicy::Always => write!(f, "Always"),
        }
    }
}

/// Cache-wide defaults.
///
/// Deserializable so it can live in an application config file:
///
/// ```
/// use query_kit::options::QueryCacheConfig;
/// use std::time::Duration;
///
/// let config: QueryCacheConfig = serde_json::from_str(
///     r#"{"stale_time":{"secs":10,"nanos":0},"retry":2}"#,
/// ).unwrap();
/// assert_eq!(config.stale_time, Duration::from_secs(10));
/// assert_eq!(config.cache_time, Duration::from_secs(300));
/// assert_eq!(config.retry, 2);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    /// How long fetched data counts as fresh. `Duration::ZERO` means always
    /// stale, `Duration::MAX` means never stale.
    pub stale_time: Duration,

    /// How long an entry without observers is retained.
    pub cache_time: Duration,

    /// Automatic retries after a failed fetch (0 = none).
    pub retry: u32,

    /// Base delay between retries, doubled after every attempt.
    pub retry_delay: Duration,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        QueryCacheConfig {
            stale_time: Duration::ZERO,
            cache_time: DEFAULT_CACHE_TIME,
            retry: 0,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl QueryCacheConfig {
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Check the configuration for contradictions.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if retries are enabled with a zero delay.
    pub fn validate(&self) -> Result<()> {
        if self.retry > 0 && self.retry_delay.is_zero() {
            return Err(Error::ConfigError(
                "retry_delay must be non-zero when retry is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Listener called with the fetched data after every successful fetch.
pub type SuccessListener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Listener called with the error after every failed fetch.
pub type ErrorListener = Arc<dyn Fn(&QueryError) + Send + Sync>;

/// Observer-side projection from canonical data to what the observer reads.
pub(crate) type Projection<T, S> = Arc<dyn Fn(Arc<T>) -> Arc<S> + Send + Sync>;

/// Per-query options passed to [`QueryCache::subscribe`](crate::QueryCache::subscribe).
///
/// `T` is the type produced by the fetch function and stored in the cache;
/// `S` is what the observer reads after the optional [`select`](Self::select)
/// projection.
pub struct QueryOptions<T, S = T> {
    /// Freshness window. `None` inherits [`QueryCacheConfig::stale_time`].
    pub stale_time: Option<Duration>,

    /// Retention after the last observer leaves. `None` inherits
    /// [`QueryCacheConfig::cache_time`].
    pub cache_time: Option<Duration>,

    /// Refetch policy when subscribing to an existing entry.
    pub refetch_on_mount: RefetchPolicy,

    /// Refetch policy when [`QueryCache::focus`](crate::QueryCache::focus) fires.
    pub refetch_on_window_focus: RefetchPolicy,

    /// Retry count override.
    pub retry: Option<u32>,

    /// Retry delay override.
    pub retry_delay: Option<Duration>,

    /// When false, subscribing never triggers a fetch by itself.
    pub enabled: bool,

    pub(crate) on_success: Vec<SuccessListener<T>>,
    pub(crate) on_error: Vec<ErrorListener>,
    pub(crate) project: Projection<T, S>,
}

impl<T: Send + Sync + 'static> Default for QueryOptions<T, T> {
    fn default() -> Self {
        QueryOptions {
            stale_time: None,
            cache_time: None,
            refetch_on_mount: RefetchPolicy::default(),
            refetch_on_window_focus: RefetchPolicy::default(),
            retry: None,
            retry_delay: None,
            enabled: true,
            on_success: Vec::new(),
            on_error: Vec::new(),
            project: Arc::new(|data| data),
        }
    }
}

impl<T: Send + Sync + 'static> QueryOptions<T, T> {
    /// Shorthand for `QueryOptions::default()`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Project the canonical data before it reaches the observer.
    ///
    /// The projection runs on every read; what is stored in the cache is
    /// unaffected.
    pub fn select<S, F>(self, select: F) -> QueryOptions<T, S>
    where
        F: Fn(&T) -> S + Send + Sync + 'static,
    {
        QueryOptions {
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            refetch_on_mount: self.refetch_on_mount,
            refetch_on_window_focus: self.refetch_on_window_focus,
            retry: self.retry,
            retry_delay: self.retry_delay,
            enabled: self.enabled,
            on_success: self.on_success,
            on_error: self.on_error,
            project: Arc::new(move |data: Arc<T>| Arc::new(select(&data))),
        }
    }
}

impl<T, S> QueryOptions<T, S> {
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    pub fn refetch_on_mount(mut self, policy: impl Into<RefetchPolicy>) -> Self {
        self.refetch_on_mount = policy.into();
        self
    }

    pub fn refetch_on_window_focus(mut self, policy: impl Into<RefetchPolicy>) -> Self {
        self.refetch_on_window_focus = policy.into();
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Register a listener for successful fetches.
    ///
    /// Called once per fetch completion while this observer is subscribed,
    /// with the canonical (unprojected) data.
    pub fn on_success<F>(mut self, listener: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_success.push(Arc::new(listener));
        self
    }

    /// Register a listener for failed fetches.
    pub fn on_error<F>(mut self, listener: F) -> Self
    where
        F: Fn(&QueryError) + Send + Sync + 'static,
    {
        self.on_error.push(Arc::new(listener));
        self
    }

    pub(crate) fn resolve(&self, config: &QueryCacheConfig) -> FetchSettings {
        FetchSettings {
            stale_time: self.stale_time.unwrap_or(config.stale_time),
            cache_time: self.cache_time.unwrap_or(config.cache_time),
            retry: self.retry.unwrap_or(config.retry),
            retry_delay: self.retry_delay.unwrap_or(config.retry_delay),
        }
    }
}

impl<T, S> Clone for QueryOptions<T, S> {
    fn clone(&self) -> Self {
        QueryOptions {
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            refetch_on_mount: self.refetch_on_mount,
            refetch_on_window_focus: self.refetch_on_window_focus,
            retry: self.retry,
            retry_delay: self.retry_delay,
            enabled: self.enabled,
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            project: self.project.clone(),
        }
    }
}

impl<T, S> fmt::Debug for QueryOptions<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("refetch_on_mount", &self.refetch_on_mount)
            .field("refetch_on_window_focus", &self.refetch_on_window_focus)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("enabled", &self.enabled)
            .field("on_success", &self.on_success.len())
            .field("on_error", &self.on_error.len())
            .finish()
    }
}

/// Options resolved against the cache-wide config.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FetchSettings {
    pub stale_time: Duration,
    pub cache_time: Duration,
    pub retry: u32,
    pub retry_delay: Duration,
}

impl FetchSettings {
    pub(crate) fn from_config(config: &QueryCacheConfig) -> Self {
        FetchSettings {
            stale_time: config.stale_time,
            cache_time: config.cache_time,
            retry: config.retry,
            retry_delay: config.retry_delay,
        }
    }
}

type MutationSuccessListener<V, R> = Arc<dyn Fn(&R, &V) + Send + Sync>;
type MutationErrorListener<V> = Arc<dyn Fn(&QueryError, &V) + Send + Sync>;
type MutationSettledListener<V, R> =
    Arc<dyn Fn(Option<&R>, Option<&QueryError>, &V) + Send + Sync>;

/// Options for a [`Mutation`](crate::mutation::Mutation).
///
/// The cache never infers what a write affects: list the keys to
/// invalidate explicitly.
///
/// ```
/// use query_kit::{query_key, options::MutationOptions};
///
/// let options = MutationOptions::<String, u64>::default()
///     .invalidate(query_key!["super-heroes"])
///     .refetch_active(true);
/// assert_eq!(options.invalidate_keys.len(), 1);
/// ```
pub struct MutationOptions<V, R> {
    /// Keys marked stale after a successful mutation.
    pub invalidate_keys: Vec<QueryKey>,

    /// Also refetch invalidated keys that currently have observers.
    pub refetch_active: bool,

    pub(crate) on_success: Vec<MutationSuccessListener<V, R>>,
    pub(crate) on_error: Vec<MutationErrorListener<V>>,
    pub(crate) on_settled: Vec<MutationSettledListener<V, R>>,
}

impl<V, R> Default for MutationOptions<V, R> {
    fn default() -> Self {
        MutationOptions {
            invalidate_keys: Vec::new(),
            refetch_active: false,
            on_success: Vec::new(),
            on_error: Vec::new(),
            on_settled: Vec::new(),
        }
    }
}

impl<V, R> MutationOptions<V, R> {
    /// Add a key to invalidate on success.
    pub fn invalidate(mut self, key: impl Into<QueryKey>) -> Self {
        self.invalidate_keys.push(key.into());
        self
    }

    pub fn invalidate_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<QueryKey>,
    {
        self.invalidate_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn refetch_active(mut self, refetch_active: bool) -> Self {
        self.refetch_active = refetch_active;
        self
    }

    pub fn on_success<F>(mut self, listener: F) -> Self
    where
        F: Fn(&R, &V) + Send + Sync + 'static,
    {
        self.on_success.push(Arc::new(listener));
        self
    }

    pub fn on_error<F>(mut self, listener: F) -> Self
    where
        F: Fn(&QueryError, &V) + Send + Sync + 'static,
    {
        self.on_error.push(Arc::new(listener));
        self
    }

    /// Listener called after either outcome.
    pub fn on_settled<F>(mut self, listener: F) -> Self
    where
        F: Fn(Option<&R>, Option<&QueryError>, &V) + Send + Sync + 'static,
    {
        self.on_settled.push(Arc::new(listener));
        self
    }
}

impl<V, R> fmt::Debug for MutationOptions<V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("invalidate_keys", &self.invalidate_keys)
            .field("refetch_active", &self.refetch_active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refetch_policy_default() {
        assert_eq!(RefetchPolicy::default(), RefetchPolicy::IfStale);
    }

    #[test]
    fn test_refetch_policy_decisions() {
        assert!(!RefetchPolicy::Never.should_refetch(true));
        assert!(RefetchPolicy::IfStale.should_refetch(true));
        assert!(!RefetchPolicy::IfStale.should_refetch(false));
        assert!(RefetchPolicy::Always.should_refetch(false));
    }

    #[test]
    fn test_refetch_policy_from_bool() {
        assert_eq!(RefetchPolicy::from(true), RefetchPolicy::IfStale);
        assert_eq!(RefetchPolicy::from(false), RefetchPolicy::Never);
    }

    #[test]
    fn test_config_defaults() {
        let config = QueryCacheConfig::default();
        assert_eq!(config.stale_time, Duration::ZERO);
        assert_eq!(config.cache_time, Duration::from_secs(300));
        assert_eq!(config.retry, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate_rejects_zero_retry_delay() {
        let config = QueryCacheConfig::default()
            .with_retry(3)
            .with_retry_delay(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_options_resolve_against_config() {
        let config = QueryCacheConfig::default()
            .with_stale_time(Duration::from_secs(5))
            .with_retry(2);

        let options = QueryOptions::<u32>::default().cache_time(Duration::from_secs(1));
        let settings = options.resolve(&config);

        assert_eq!(settings.stale_time, Duration::from_secs(5));
        assert_eq!(settings.cache_time, Duration::from_secs(1));
        assert_eq!(settings.retry, 2);
        assert_eq!(settings.retry_delay, DEFAULT_RETRY_DELAY);
    }

    #[test]
    fn test_select_projects_without_touching_source() {
        let options = QueryOptions::<Vec<&'static str>>::default()
            .retry(1)
            .select(|names: &Vec<&'static str>| names.len());

        let source = Arc::new(vec!["Batman", "Superman"]);
        let projected = (options.project)(source.clone());

        assert_eq!(*projected, 2);
        assert_eq!(source.len(), 2);
        assert_eq!(options.retry, Some(1));
    }

    #[test]
    fn test_mutation_options_builder() {
        let options = MutationOptions::<(), ()>::default()
            .invalidate("super-heroes")
            .invalidate_keys(vec![crate::query_key!["super-hero", 1]])
            .on_success(|_, _| {});

        assert_eq!(options.invalidate_keys.len(), 2);
        assert_eq!(options.on_success.len(), 1);
        assert!(!options.refetch_active);
    }
}
