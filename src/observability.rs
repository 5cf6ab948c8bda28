//! Observability for cache operations.
//!
//! Two hooks are available:
//!
//! - **Metrics (`QueryMetrics`)**: counters and timings for hits, misses,
//!   fetches, deduplicated fetches, errors and evictions.
//! - **Events (`CacheEvent`)**: a listener list on the
//!   [`QueryCache`](crate::QueryCache) fired on every entry transition.
//!
//! ```ignore
//! use query_kit::observability::QueryMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl QueryMetrics for PrometheusMetrics {
//!     fn record_fetch(&self, _key: &QueryKey, _duration: Duration) {
//!         // histogram!("query_fetch_latency").record(duration);
//!     }
//! }
//!
//! let cache = QueryCache::builder()
//!     .with_metrics(Box::new(PrometheusMetrics))
//!     .build()?;
//! ```
//!
//! The default is [`NoOpMetrics`]. [`LogMetrics`] writes every record to
//! the `log` facade at debug level.

use crate::key::QueryKey;
use crate::state::QueryStatus;
use std::time::Duration;

/// Trait for query metrics collection.
pub trait QueryMetrics: Send + Sync {
    /// Fresh cached data served without a fetch.
    fn record_hit(&self, key: &QueryKey) {
        debug!("Query HIT: {}", key);
    }

    /// A read that triggered a fetch (missing, stale or forced).
    fn record_miss(&self, key: &QueryKey) {
        debug!("Query MISS: {}", key);
    }

    /// A fetch attached to one already in flight.
    fn record_dedup(&self, key: &QueryKey) {
        debug!("Query DEDUP: {}", key);
    }

    /// A fetch completed successfully.
    fn record_fetch(&self, key: &QueryKey, duration: Duration) {
        debug!("Query FETCH: {} took {:?}", key, duration);
    }

    /// A fetch failed after all retries.
    fn record_error(&self, key: &QueryKey, error: &str) {
        warn!("Query ERROR for {}: {}", key, error);
    }

    /// An unobserved entry was garbage collected.
    fn record_eviction(&self, key: &QueryKey) {
        debug!("Query EVICT: {}", key);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl QueryMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &QueryKey) {}
    fn record_miss(&self, _key: &QueryKey) {}
    fn record_dedup(&self, _key: &QueryKey) {}
    fn record_fetch(&self, _key: &QueryKey, _duration: Duration) {}
    fn record_error(&self, _key: &QueryKey, _error: &str) {}
    fn record_eviction(&self, _key: &QueryKey) {}
}

/// Metrics implementation that only logs, using the trait's defaults.
#[derive(Clone, Default)]
pub struct LogMetrics;

impl QueryMetrics for LogMetrics {}

/// Entry transition reported to cache listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheEvent {
    /// A new entry was created.
    Added { key: QueryKey },
    /// Status or fetching flag changed.
    Updated {
        key: QueryKey,
        status: QueryStatus,
        is_fetching: bool,
    },
    /// Entry was marked stale.
    Invalidated { key: QueryKey },
    /// Observer count changed.
    ObserversChanged { key: QueryKey, observers: usize },
    /// Entry left the cache (garbage collection, `remove`, `clear`).
    Removed { key: QueryKey },
}

impl CacheEvent {
    pub fn key(&self) -> &QueryKey {
        match self {
            CacheEvent::Added { key }
            | CacheEvent::Updated { key, .. }
            | CacheEvent::Invalidated { key }
            | CacheEvent::ObserversChanged { key, .. }
            | CacheEvent::Removed { key } => key,
        }
    }
}

/// Identifier returned when registering a cache listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_noop_metrics() {
        let metrics = NoOpMetrics;
        let key = QueryKey::from("heroes");
        metrics.record_hit(&key);
        metrics.record_fetch(&key, Duration::from_millis(3));
        metrics.record_error(&key, "boom");
    }

    #[test]
    fn test_custom_metrics_override() {
        #[derive(Default)]
        struct Counting {
            fetches: Mutex<Vec<String>>,
        }

        impl QueryMetrics for Counting {
            fn record_fetch(&self, key: &QueryKey, _duration: Duration) {
                self.fetches.lock().unwrap().push(key.to_string());
            }
        }

        let metrics = Counting::default();
        metrics.record_fetch(&QueryKey::from("heroes"), Duration::ZERO);
        metrics.record_hit(&QueryKey::from("heroes"));

        assert_eq!(*metrics.fetches.lock().unwrap(), vec![r#"["heroes"]"#]);
    }

    #[test]
    fn test_event_key() {
        let key = crate::query_key!["hero", 1];
        let event = CacheEvent::Updated {
            key: key.clone(),
            status: QueryStatus::Loading,
            is_fetching: true,
        };
        assert_eq!(event.key(), &key);
    }
}
