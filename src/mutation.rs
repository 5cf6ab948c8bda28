//! Mutations: writes that invalidate cached queries when they succeed.

use crate::cache::QueryCache;
use crate::error::{Error, QueryError, Result};
use crate::fetcher::MutationFn;
use crate::options::MutationOptions;
use crate::state::{MutationState, MutationStatus};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Reusable mutation handle created by
/// [`QueryCache::mutation`](crate::QueryCache::mutation).
///
/// Every call to [`mutate`](Self::mutate) runs the mutation function exactly
/// once. On success the keys listed in [`MutationOptions`] are marked stale
/// (and refetched if observed and `refetch_active` is set). On failure
/// nothing is invalidated.
pub struct Mutation<V, R> {
    cache: QueryCache,
    mutation_fn: Arc<dyn MutationFn<V, R>>,
    options: MutationOptions<V, R>,
    state: Mutex<MutationState<V, R>>,
}

impl<V, R> Mutation<V, R>
where
    V: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    pub(crate) fn new<M>(
        cache: QueryCache,
        mutation_fn: M,
        options: MutationOptions<V, R>,
    ) -> Self
    where
        M: MutationFn<V, R>,
    {
        Mutation {
            cache,
            mutation_fn: Arc::new(mutation_fn),
            options,
            state: Mutex::new(MutationState::idle()),
        }
    }

    /// Run the mutation with `variables`.
    ///
    /// # Errors
    /// Returns `Error::Mutation` carrying the error reported by the mutation
    /// function.
    pub async fn mutate(&self, variables: V) -> Result<Arc<R>> {
        let variables = Arc::new(variables);
        self.set_state(MutationState {
            status: MutationStatus::Loading,
            data: None,
            error: None,
            variables: Some(Arc::clone(&variables)),
        });

        debug!("» Running mutation");
        match self.mutation_fn.mutate((*variables).clone()).await {
            Ok(result) => {
                let result = Arc::new(result);
                self.on_success(&result, &variables);
                Ok(result)
            }
            Err(e) => {
                self.on_error(&e, &variables);
                Err(Error::Mutation(e))
            }
        }
    }

    fn on_success(&self, result: &Arc<R>, variables: &Arc<V>) {
        self.set_state(MutationState {
            status: MutationStatus::Success,
            data: Some(Arc::clone(result)),
            error: None,
            variables: Some(Arc::clone(variables)),
        });

        let inner = self.cache.inner();
        let invalidated = inner.invalidate(&self.options.invalidate_keys);
        info!("✓ Mutation succeeded, invalidated {} queries", invalidated);
        if self.options.refetch_active {
            inner.refetch_observed(&self.options.invalidate_keys);
        }

        for listener in &self.options.on_success {
            listener(result.as_ref(), variables.as_ref());
        }
        for listener in &self.options.on_settled {
            listener(Some(result.as_ref()), None, variables.as_ref());
        }
    }

    fn on_error(&self, error: &QueryError, variables: &Arc<V>) {
        warn!("Mutation failed: {}", error);
        self.set_state(MutationState {
            status: MutationStatus::Error,
            data: None,
            error: Some(Arc::clone(error)),
            variables: Some(Arc::clone(variables)),
        });

        for listener in &self.options.on_error {
            listener(error, variables.as_ref());
        }
        for listener in &self.options.on_settled {
            listener(None, Some(error), variables.as_ref());
        }
    }

    /// State of the most recent call.
    pub fn state(&self) -> MutationState<V, R> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the last outcome.
    pub fn reset(&self) {
        self.set_state(MutationState::idle());
    }

    fn set_state(&self, state: MutationState<V, R>) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

impl<V, R> fmt::Debug for Mutation<V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{query_key, Error, MutationOptions, QueryCache, QueryCacheConfig, QueryKey};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_success_invalidates_listed_keys() {
        let config = QueryCacheConfig::default().with_stale_time(Duration::from_secs(60));
        let cache = QueryCache::with_config(config).unwrap();
        cache
            .set_query_data("super-heroes", vec!["Batman".to_string()])
            .unwrap();
        cache.set_query_data(query_key!["villains"], 3_u32).unwrap();

        let add_hero = cache.mutation(
            |name: String| async move { Ok::<_, String>(name.len()) },
            MutationOptions::default().invalidate("super-heroes"),
        );
        let result = add_hero.mutate("Hulk".to_string()).await.unwrap();

        assert_eq!(*result, 4);
        let heroes = cache
            .get_query_state::<Vec<String>>(&QueryKey::from("super-heroes"))
            .unwrap();
        assert!(heroes.is_stale);
        let villains = cache
            .get_query_state::<u32>(&query_key!["villains"])
            .unwrap();
        assert!(!villains.is_stale);
        assert!(add_hero.state().is_success());
        assert_eq!(add_hero.state().variables.as_deref().map(String::as_str), Some("Hulk"));
    }

    #[tokio::test]
    async fn test_failure_invalidates_nothing() {
        let cache = QueryCache::new();
        let invalidations = Arc::new(AtomicUsize::new(0));
        let counter = invalidations.clone();
        cache.on_event(move |event| {
            if matches!(event, crate::CacheEvent::Invalidated { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        cache.set_query_data("super-heroes", 1_u8).unwrap();

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        let result = cache
            .mutate(
                |_: ()| async { Err::<(), _>("server rejected") },
                (),
                MutationOptions::default()
                    .invalidate("super-heroes")
                    .on_error(move |e, _| {
                        assert_eq!(e.to_string(), "server rejected");
                        seen.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .await;

        assert!(matches!(result, Err(Error::Mutation(_))));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(invalidations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_runs_once_per_call() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let settled = Arc::new(AtomicUsize::new(0));
        let settled_counter = settled.clone();

        let mutation = cache.mutation(
            move |n: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, String>(n * 2) }
            },
            MutationOptions::default().on_settled(move |result, error, _| {
                assert!(result.is_some() && error.is_none());
                settled_counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        mutation.mutate(1).await.unwrap();
        mutation.mutate(2).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(settled.load(Ordering::SeqCst), 2);

        mutation.reset();
        assert_eq!(mutation.state().status, crate::state::MutationStatus::Idle);
    }
}
