//! Time and timer source for staleness and garbage collection.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::Instant;

/// Clock injected into [`QueryCache`](crate::QueryCache).
///
/// Staleness is judged against [`now`](Clock::now) and garbage-collection
/// timers wait on [`sleep`](Clock::sleep). Both must agree on the same
/// timeline.
pub trait Clock: Send + Sync + 'static {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Future resolving after `duration` on this clock's timeline.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Clock backed by the tokio timer.
///
/// Honors `tokio::time::pause()` and `tokio::time::advance()`, which makes
/// time-based behaviour deterministic in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock;
        let start = clock.now();

        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(clock.now() - start, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_sleep() {
        let clock = TokioClock;
        let start = clock.now();
        clock.sleep(Duration::from_millis(250)).await;
        assert!(clock.now() - start >= Duration::from_millis(250));
    }
}
