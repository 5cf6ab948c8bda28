//! Per-key cache entry and its state transitions.
//!
//! Entries live in the [`QueryCache`](crate::QueryCache) store. All methods
//! here are synchronous and run under the store's per-key lock, so a reader
//! never observes an entry mid-transition.

use crate::error::{Error, QueryError};
use crate::fetcher::{ErasedFetcher, QueryData};
use crate::key::QueryKey;
use crate::options::{ErrorListener, FetchSettings, Projection, RefetchPolicy};
use crate::state::{QueryState, QueryStatus};
use futures::future::{BoxFuture, Shared};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub(crate) type ObserverId = u64;

/// Outcome of one fetch, shared by every caller attached to it.
pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<QueryData, Error>>>;

/// Success listener with the data type erased.
pub(crate) type ErasedSuccessListener = Arc<dyn Fn(&QueryData) + Send + Sync>;

/// What the entry remembers about one observer.
pub(crate) struct ObserverRegistration {
    pub enabled: bool,
    pub stale_time: Duration,
    pub refetch_on_window_focus: RefetchPolicy,
    pub on_success: Option<ErasedSuccessListener>,
    pub on_error: Vec<ErrorListener>,
}

/// Pending fetch attached to an entry.
pub(crate) struct InFlight {
    pub id: u64,
    pub started_at: Instant,
    /// `invalidations` when the fetch started.
    pub invalidations: u64,
    pub future: SharedFetch,
}

/// Cached state for one [`QueryKey`].
pub(crate) struct QueryEntry {
    pub key: QueryKey,
    pub type_id: TypeId,
    pub type_name: &'static str,

    pub status: QueryStatus,
    pub data: Option<QueryData>,
    pub error: Option<QueryError>,
    pub fetched_at: Option<Instant>,
    /// `None` while nothing was fetched or when the stale time is infinite.
    pub stale_at: Option<Instant>,
    /// Set when the last observer leaves.
    pub expires_at: Option<Instant>,
    pub invalidated: bool,
    /// Bumped on every invalidation. A fetch that started before the latest
    /// one leaves the entry stale.
    pub invalidations: u64,
    pub is_fetching: bool,
    pub error_count: u32,
    pub fetch_count: u64,

    pub settings: FetchSettings,
    pub fetcher: Option<ErasedFetcher>,
    pub in_flight: Option<InFlight>,
    pub observers: HashMap<ObserverId, ObserverRegistration>,
    /// Bumped on every unsubscribe-to-zero and every resubscribe; a pending
    /// garbage-collection timer only fires if it still matches.
    pub gc_generation: u64,

    notify: watch::Sender<u64>,
}

impl QueryEntry {
    pub fn new<T: Any>(key: QueryKey, settings: FetchSettings) -> Self {
        let (notify, _) = watch::channel(0);
        QueryEntry {
            key,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            status: QueryStatus::Idle,
            data: None,
            error: None,
            fetched_at: None,
            stale_at: None,
            expires_at: None,
            invalidated: false,
            invalidations: 0,
            is_fetching: false,
            error_count: 0,
            fetch_count: 0,
            settings,
            fetcher: None,
            in_flight: None,
            observers: HashMap::new(),
            gc_generation: 0,
            notify,
        }
    }

    /// Check the entry holds data of type `T`.
    pub fn ensure_type<T: Any>(&self) -> Result<(), Error> {
        if self.type_id == TypeId::of::<T>() {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                key: self.key.clone(),
                expected: std::any::type_name::<T>(),
            })
        }
    }

    /// Staleness against the entry's own stale time.
    pub fn is_stale(&self, now: Instant) -> bool {
        if self.invalidated || self.fetched_at.is_none() {
            return true;
        }
        self.stale_at.is_some_and(|at| now >= at)
    }

    /// Staleness as judged by an observer with its own stale time.
    pub fn is_stale_for(&self, now: Instant, stale_time: Duration) -> bool {
        if self.invalidated {
            return true;
        }
        match self.fetched_at {
            None => true,
            Some(fetched_at) => fetched_at
                .checked_add(stale_time)
                .is_some_and(|at| now >= at),
        }
    }

    /// True once unobserved, idle and past `expires_at`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.observers.is_empty()
            && self.in_flight.is_none()
            && self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn set_settings(&mut self, settings: FetchSettings) {
        let cache_time = self.settings.cache_time.max(settings.cache_time);
        self.settings = FetchSettings {
            cache_time,
            ..settings
        };
        self.stale_at = self
            .fetched_at
            .and_then(|at| at.checked_add(self.settings.stale_time));
    }

    /// Enter the fetching state.
    ///
    /// Cached success data keeps `status = success`; anything else moves to
    /// `loading` while retaining the last data and error.
    pub fn begin_fetch(&mut self) {
        self.is_fetching = true;
        if !(self.status == QueryStatus::Success && self.data.is_some()) {
            self.status = QueryStatus::Loading;
        }
        self.bump();
    }

    /// Store fetched data.
    ///
    /// The entry stays invalidated if an invalidation landed while the fetch
    /// was in flight, since the data may predate it.
    pub fn apply_success(&mut self, data: QueryData, now: Instant) {
        self.data = Some(data);
        self.error = None;
        self.status = QueryStatus::Success;
        self.fetched_at = Some(now);
        self.stale_at = now.checked_add(self.settings.stale_time);
        self.invalidated = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.invalidations != self.invalidations);
        self.is_fetching = false;
        self.error_count = 0;
        self.fetch_count += 1;
        self.in_flight = None;
        self.bump();
    }

    pub fn apply_error(&mut self, error: QueryError) {
        self.error = Some(error);
        self.status = QueryStatus::Error;
        self.is_fetching = false;
        self.error_count += 1;
        self.fetch_count += 1;
        self.in_flight = None;
        self.bump();
    }

    /// Replace the data directly, as if a fetch had just succeeded.
    pub fn set_data(&mut self, data: QueryData, now: Instant) {
        let in_flight = self.in_flight.take();
        let is_fetching = self.is_fetching;
        self.apply_success(data, now);
        self.fetch_count -= 1;
        self.in_flight = in_flight;
        self.is_fetching = is_fetching;
    }

    pub fn invalidate(&mut self) {
        self.invalidated = true;
        self.invalidations += 1;
        self.bump();
    }

    pub fn subscribe_notifications(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    /// Wake every observer waiting on a change.
    pub fn bump(&self) {
        self.notify.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Build the read model for an observer.
    pub fn snapshot<T, S>(
        &self,
        now: Instant,
        stale_time: Duration,
        project: &Projection<T, S>,
    ) -> QueryState<S>
    where
        T: Send + Sync + 'static,
    {
        let data = self
            .data
            .clone()
            .and_then(|data| data.downcast::<T>().ok())
            .map(|data| project(data));

        QueryState {
            status: self.status,
            data,
            error: self.error.clone(),
            is_fetching: self.is_fetching,
            is_stale: self.is_stale_for(now, stale_time),
            data_updated_at: self.fetched_at,
            error_count: self.error_count,
        }
    }

    /// Listeners to call after a completed fetch, collected so they can run
    /// outside the lock.
    pub fn success_listeners(&self) -> Vec<ErasedSuccessListener> {
        self.observers
            .values()
            .filter_map(|o| o.on_success.clone())
            .collect()
    }

    pub fn error_listeners(&self) -> Vec<ErrorListener> {
        self.observers
            .values()
            .flat_map(|o| o.on_error.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::QueryCacheConfig;
    use futures::FutureExt;
    use std::io;

    fn entry(stale_time: Duration) -> QueryEntry {
        let settings = FetchSettings::from_config(
            &QueryCacheConfig::default().with_stale_time(stale_time),
        );
        QueryEntry::new::<String>(QueryKey::from("heroes"), settings)
    }

    fn data(s: &str) -> QueryData {
        Arc::new(s.to_string())
    }

    #[test]
    fn test_new_entry_is_idle_and_stale() {
        let e = entry(Duration::ZERO);
        assert_eq!(e.status, QueryStatus::Idle);
        assert!(e.is_stale(Instant::now()));
        assert!(e.ensure_type::<String>().is_ok());
        assert!(matches!(
            e.ensure_type::<u32>(),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_first_fetch_goes_to_loading() {
        let mut e = entry(Duration::ZERO);
        e.begin_fetch();
        assert_eq!(e.status, QueryStatus::Loading);
        assert!(e.is_fetching);
    }

    #[test]
    fn test_refetch_keeps_success_status() {
        let mut e = entry(Duration::ZERO);
        e.apply_success(data("Batman"), Instant::now());
        e.begin_fetch();
        assert_eq!(e.status, QueryStatus::Success);
        assert!(e.is_fetching);
        assert!(e.data.is_some());
    }

    #[test]
    fn test_error_keeps_previous_data() {
        let mut e = entry(Duration::ZERO);
        e.apply_success(data("Batman"), Instant::now());
        e.begin_fetch();
        e.apply_error(Arc::new(io::Error::new(io::ErrorKind::Other, "network down")));

        assert_eq!(e.status, QueryStatus::Error);
        assert_eq!(e.error.as_ref().map(|e| e.to_string()).as_deref(), Some("network down"));
        let kept = e.data.clone().and_then(|d| d.downcast::<String>().ok());
        assert_eq!(kept.as_deref().map(String::as_str), Some("Batman"));
        assert_eq!(e.error_count, 1);
    }

    #[test]
    fn test_success_clears_error() {
        let mut e = entry(Duration::ZERO);
        e.apply_error(Arc::new(io::Error::new(io::ErrorKind::Other, "boom")));
        e.begin_fetch();
        assert_eq!(e.status, QueryStatus::Loading);
        assert!(e.error.is_some());

        e.apply_success(data("Batman"), Instant::now());
        assert_eq!(e.status, QueryStatus::Success);
        assert!(e.error.is_none());
        assert_eq!(e.error_count, 0);
    }

    #[test]
    fn test_stale_window() {
        let mut e = entry(Duration::from_secs(10));
        let now = Instant::now();
        e.apply_success(data("Batman"), now);

        assert!(!e.is_stale(now + Duration::from_secs(9)));
        assert!(e.is_stale(now + Duration::from_secs(10)));
        assert!(!e.is_stale_for(now + Duration::from_secs(60), Duration::MAX));
        assert!(e.is_stale_for(now, Duration::ZERO));
    }

    #[test]
    fn test_infinite_stale_time_never_stale() {
        let mut e = entry(Duration::MAX);
        let now = Instant::now();
        e.apply_success(data("Batman"), now);
        assert!(e.stale_at.is_none());
        assert!(!e.is_stale(now + Duration::from_secs(86_400)));
    }

    #[test]
    fn test_invalidate_forces_stale() {
        let mut e = entry(Duration::MAX);
        let now = Instant::now();
        e.apply_success(data("Batman"), now);
        e.invalidate();
        assert!(e.is_stale(now));
        assert!(e.is_stale_for(now, Duration::MAX));

        e.apply_success(data("Batman"), now);
        assert!(!e.is_stale(now));
    }

    #[test]
    fn test_invalidation_during_fetch_keeps_entry_stale() {
        let mut e = entry(Duration::MAX);
        let now = Instant::now();
        e.apply_success(data("Batman"), now);

        e.in_flight = Some(InFlight {
            id: 1,
            started_at: now,
            invalidations: e.invalidations,
            future: futures::future::pending().boxed().shared(),
        });
        e.begin_fetch();
        e.invalidate();
        e.apply_success(data("Batman"), now);

        assert!(e.in_flight.is_none());
        assert!(e.is_stale(now));
        assert!(e.is_stale_for(now, Duration::MAX));

        e.in_flight = Some(InFlight {
            id: 2,
            started_at: now,
            invalidations: e.invalidations,
            future: futures::future::pending().boxed().shared(),
        });
        e.begin_fetch();
        e.apply_success(data("Batman"), now);
        assert!(!e.is_stale(now));
    }

    #[test]
    fn test_expiry_requires_no_observers() {
        let mut e = entry(Duration::ZERO);
        let now = Instant::now();
        assert!(!e.is_expired(now));

        e.expires_at = Some(now);
        assert!(e.is_expired(now));

        e.observers.insert(
            1,
            ObserverRegistration {
                enabled: true,
                stale_time: Duration::ZERO,
                refetch_on_window_focus: RefetchPolicy::IfStale,
                on_success: None,
                on_error: Vec::new(),
            },
        );
        assert!(!e.is_expired(now));
    }

    #[test]
    fn test_cache_time_keeps_longest() {
        let mut e = entry(Duration::ZERO);
        let short = FetchSettings {
            cache_time: Duration::from_secs(1),
            ..e.settings
        };
        e.set_settings(short);
        assert_eq!(e.settings.cache_time, Duration::from_secs(300));
    }

    #[test]
    fn test_bump_notifies_receivers() {
        let e = entry(Duration::ZERO);
        let mut rx = e.subscribe_notifications();
        e.bump();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert!(!rx.has_changed().unwrap());
    }
}
