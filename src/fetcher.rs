//! Fetch and mutation function abstractions.
//!
//! The cache never talks to a transport itself. Callers hand it a
//! [`QueryFn`] per query and a [`MutationFn`] per mutation; both are
//! implemented for plain async closures, so most code never names the
//! traits:
//!
//! ```
//! use query_kit::fetcher::QueryFn;
//!
//! let fetch_heroes = || async { Ok::<_, std::io::Error>(vec!["Batman".to_string()]) };
//!
//! # tokio_test_block_on(async {
//! let heroes = fetch_heroes.fetch().await.unwrap();
//! assert_eq!(heroes, vec!["Batman".to_string()]);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```
//!
//! Any error type convertible into `Box<dyn Error + Send + Sync>` works,
//! including `String` and `&str`. It is stored verbatim as a
//! [`QueryError`].

use crate::clock::Clock;
use crate::error::QueryError;
use crate::key::QueryKey;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Canonical, type-erased data stored in a cache entry.
pub(crate) type QueryData = Arc<dyn Any + Send + Sync>;

/// Fetch function with its output type erased.
pub(crate) type ErasedFetcher =
    Arc<dyn Fn() -> BoxFuture<'static, Result<QueryData, QueryError>> + Send + Sync>;

/// Trait for query fetch functions.
///
/// Invoked by the cache at most once per key at any time; concurrent
/// readers share the result.
pub trait QueryFn<T>: Send + Sync + 'static {
    /// Start one fetch.
    ///
    /// # Errors
    /// Returns the transport or server failure. It is stored on the entry
    /// unchanged.
    fn fetch(&self) -> BoxFuture<'static, Result<T, QueryError>>;
}

impl<T, E, F, Fut> QueryFn<T> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn fetch(&self) -> BoxFuture<'static, Result<T, QueryError>> {
        (self)().map(|r| r.map_err(into_query_error)).boxed()
    }
}

/// Trait for mutation functions.
///
/// Executed exactly once per call: mutations are not deduplicated and
/// never retried.
pub trait MutationFn<V, R>: Send + Sync + 'static {
    /// Run the mutation with the given variables.
    ///
    /// # Errors
    /// Returns the failure reported by the write.
    fn mutate(&self, variables: V) -> BoxFuture<'static, Result<R, QueryError>>;
}

impl<V, R, E, F, Fut> MutationFn<V, R> for F
where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn mutate(&self, variables: V) -> BoxFuture<'static, Result<R, QueryError>> {
        (self)(variables).map(|r| r.map_err(into_query_error)).boxed()
    }
}

pub(crate) fn into_query_error<E>(e: E) -> QueryError
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    Arc::from(e.into())
}

/// Erase the output type of a fetch function so entries can hold it.
pub(crate) fn erase<T, Q>(query_fn: Q) -> ErasedFetcher
where
    T: Send + Sync + 'static,
    Q: QueryFn<T>,
{
    Arc::new(move || {
        query_fn
            .fetch()
            .map(|r| r.map(|data| Arc::new(data) as QueryData))
            .boxed()
    })
}

/// Run a fetch, retrying failures up to `retry` times with exponential
/// backoff starting at `retry_delay`.
pub(crate) async fn fetch_with_retry(
    key: &QueryKey,
    fetcher: &ErasedFetcher,
    retry: u32,
    retry_delay: Duration,
    clock: &dyn Clock,
) -> Result<QueryData, QueryError> {
    let max_attempts = retry.saturating_add(1);
    let mut attempts = 0;

    loop {
        attempts += 1;

        match fetcher().await {
            Ok(data) => return Ok(data),
            Err(e) => {
                if attempts >= max_attempts {
                    return Err(e);
                }

                debug!(
                    "Fetch for {} failed (attempt {}/{}): {}, retrying...",
                    key, attempts, max_attempts, e
                );

                clock.sleep(backoff(retry_delay, attempts)).await;
            }
        }
    }
}

/// Delay before the retry that follows attempt number `attempt` (1-based).
fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor)
}
