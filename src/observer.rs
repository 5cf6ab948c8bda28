//! Subscription handle returned by [`QueryCache::subscribe`](crate::QueryCache::subscribe).

use crate::cache::CacheInner;
use crate::entry::ObserverId;
use crate::error::Result;
use crate::key::QueryKey;
use crate::options::Projection;
use crate::state::QueryState;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A live interest in one query key.
///
/// Reads go through the observer's `select` projection and are judged
/// stale against its own `stale_time`. Dropping the observer unsubscribes;
/// when the last observer of a key goes, the entry's `cache_time` countdown
/// starts.
pub struct QueryObserver<T, S = T> {
    inner: Arc<CacheInner>,
    key: QueryKey,
    id: ObserverId,
    stale_time: Duration,
    project: Projection<T, S>,
    notifications: watch::Receiver<u64>,
}

impl<T, S> QueryObserver<T, S>
where
    T: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    pub(crate) fn new(
        inner: Arc<CacheInner>,
        key: QueryKey,
        id: ObserverId,
        stale_time: Duration,
        project: Projection<T, S>,
        notifications: watch::Receiver<u64>,
    ) -> Self {
        QueryObserver {
            inner,
            key,
            id,
            stale_time,
            project,
            notifications,
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Current state of the query.
    ///
    /// Reports `idle` if the entry was removed from the cache behind this
    /// observer's back.
    pub fn state(&self) -> QueryState<S> {
        let now = self.inner.now();
        self.inner
            .with_entry(&self.key, |entry| {
                entry.snapshot(now, self.stale_time, &self.project)
            })
            .unwrap_or_else(QueryState::idle)
    }

    /// Wait for the next change and return the new state.
    ///
    /// Returns `None` once the entry is gone.
    pub async fn changed(&mut self) -> Option<QueryState<S>> {
        self.notifications.changed().await.ok()?;
        self.notifications.borrow_and_update();
        Some(self.state())
    }

    /// Wait until no fetch is running and return the state.
    ///
    /// Returns immediately when the entry is idle or already settled.
    pub async fn settled(&mut self) -> QueryState<S> {
        loop {
            self.notifications.borrow_and_update();
            let state = self.state();
            if !state.is_fetching {
                return state;
            }
            if self.notifications.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Refetch this query now and wait for the outcome.
    ///
    /// # Errors
    /// - `Error::NotFound`: the entry was removed
    /// - `Error::Fetch`: the fetch failed; the state still holds previous data
    pub async fn refetch(&mut self) -> Result<QueryState<S>> {
        let cache = crate::cache::QueryCache::from_inner(Arc::clone(&self.inner));
        cache.refetch(&self.key).await?;
        Ok(self.settled().await)
    }

    /// Stop observing. Same as dropping the observer.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T, S> Drop for QueryObserver<T, S> {
    fn drop(&mut self) {
        self.inner.unsubscribe(&self.key, self.id);
    }
}

impl<T, S> fmt::Debug for QueryObserver<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("stale_time", &self.stale_time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{QueryCache, QueryKey, QueryOptions, QueryStatus};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_select_projects_observer_data() {
        let cache = QueryCache::new();
        let mut names = cache
            .subscribe(
                "super-heroes",
                || async { Ok::<_, io::Error>(vec![("Batman", 1939), ("Superman", 1938)]) },
                QueryOptions::default().select(|heroes: &Vec<(&'static str, u32)>| {
                    heroes.iter().map(|(name, _)| name.to_string()).collect::<Vec<_>>()
                }),
            )
            .unwrap();

        let state = names.settled().await;
        assert_eq!(
            state.data.as_deref(),
            Some(&vec!["Batman".to_string(), "Superman".to_string()])
        );

        let raw = cache
            .get_query_data::<Vec<(&'static str, u32)>>(&QueryKey::from("super-heroes"))
            .unwrap();
        assert_eq!(raw.len(), 2);
    }

    #[tokio::test]
    async fn test_changed_reports_transitions() {
        let cache = QueryCache::new();
        let mut observer = cache
            .subscribe(
                "hero",
                || async { Ok::<_, io::Error>("Batman".to_string()) },
                QueryOptions::default(),
            )
            .unwrap();

        let state = observer.changed().await.unwrap();
        assert_eq!(state.status, QueryStatus::Success);
        assert!(!state.is_fetching);
    }

    #[tokio::test]
    async fn test_observer_refetch() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut observer = cache
            .subscribe(
                "counter",
                move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<_, io::Error>(n) }
                },
                QueryOptions::default(),
            )
            .unwrap();

        observer.settled().await;
        let state = observer.refetch().await.unwrap();
        assert_eq!(state.data.as_deref(), Some(&1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_removed_entry_reads_idle() {
        let cache = QueryCache::new();
        let mut observer = cache
            .subscribe(
                "hero",
                || async { Ok::<_, io::Error>(1_u8) },
                QueryOptions::default(),
            )
            .unwrap();
        observer.settled().await;

        assert!(cache.remove(observer.key()));
        assert!(observer.state().is_idle());
        assert!(observer.changed().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let cache = QueryCache::new();
        let observer = cache
            .subscribe(
                "hero",
                || async { Ok::<_, io::Error>(1_u8) },
                QueryOptions::default().enabled(false),
            )
            .unwrap();
        assert_eq!(cache.stats().observers, 1);
        assert_eq!(observer.state().status, QueryStatus::Idle);

        drop(observer);
        assert_eq!(cache.stats().observers, 0);
    }
}
