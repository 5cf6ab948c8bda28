//! Read models handed to observers and mutation callers.

use crate::error::QueryError;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Lifecycle status of a query entry.
///
/// ```text
/// idle ──► loading ──► success
///              │          ▲ │
///              ▼          │ ▼
///            error ◄──── (refetch keeps last data/error)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum QueryStatus {
    /// Entry exists but nothing has been fetched yet.
    #[default]
    Idle,
    /// First fetch in progress, no data to show.
    Loading,
    /// Last fetch succeeded.
    Success,
    /// Last fetch failed.
    Error,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Idle => write!(f, "idle"),
            QueryStatus::Loading => write!(f, "loading"),
            QueryStatus::Success => write!(f, "success"),
            QueryStatus::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of a query as seen by one observer.
///
/// `data` has already gone through the observer's `select` projection.
pub struct QueryState<S> {
    pub status: QueryStatus,
    pub data: Option<Arc<S>>,
    pub error: Option<QueryError>,
    /// A fetch is running, including background refetches of cached data.
    pub is_fetching: bool,
    pub is_stale: bool,
    /// When the current data was fetched.
    pub data_updated_at: Option<Instant>,
    /// Consecutive failed fetches since the last success.
    pub error_count: u32,
}

impl<S> QueryState<S> {
    pub(crate) fn idle() -> Self {
        QueryState {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            is_fetching: false,
            is_stale: true,
            data_updated_at: None,
            error_count: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    /// First load in progress: nothing cached yet.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// Fetching while data is already shown.
    pub fn is_refetching(&self) -> bool {
        self.is_fetching && self.data.is_some()
    }
}

impl<S> Clone for QueryState<S> {
    fn clone(&self) -> Self {
        QueryState {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            is_fetching: self.is_fetching,
            is_stale: self.is_stale,
            data_updated_at: self.data_updated_at,
            error_count: self.error_count,
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for QueryState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("status", &self.status)
            .field("data", &self.data)
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .field("is_fetching", &self.is_fetching)
            .field("is_stale", &self.is_stale)
            .field("error_count", &self.error_count)
            .finish()
    }
}

/// Status of a mutation handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum MutationStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationStatus::Idle => write!(f, "idle"),
            MutationStatus::Loading => write!(f, "loading"),
            MutationStatus::Success => write!(f, "success"),
            MutationStatus::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of the latest call on a [`Mutation`](crate::mutation::Mutation).
pub struct MutationState<V, R> {
    pub status: MutationStatus,
    pub data: Option<Arc<R>>,
    pub error: Option<QueryError>,
    pub variables: Option<Arc<V>>,
}

impl<V, R> MutationState<V, R> {
    pub(crate) fn idle() -> Self {
        MutationState {
            status: MutationStatus::Idle,
            data: None,
            error: None,
            variables: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == MutationStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }
}

impl<V, R> Clone for MutationState<V, R> {
    fn clone(&self) -> Self {
        MutationState {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            variables: self.variables.clone(),
        }
    }
}

impl<V: fmt::Debug, R: fmt::Debug> fmt::Debug for MutationState<V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationState")
            .field("status", &self.status)
            .field("data", &self.data)
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .field("variables", &self.variables)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(QueryStatus::Idle.to_string(), "idle");
        assert_eq!(QueryStatus::Loading.to_string(), "loading");
        assert_eq!(QueryStatus::Success.to_string(), "success");
        assert_eq!(QueryStatus::Error.to_string(), "error");
        assert_eq!(MutationStatus::Loading.to_string(), "loading");
    }

    #[test]
    fn test_idle_state() {
        let state: QueryState<u32> = QueryState::idle();
        assert!(state.is_idle());
        assert!(state.is_stale);
        assert!(!state.is_fetching);
        assert!(state.data.is_none());
    }

    #[test]
    fn test_refetching_requires_data() {
        let mut state: QueryState<u32> = QueryState::idle();
        state.is_fetching = true;
        assert!(!state.is_refetching());

        state.status = QueryStatus::Success;
        state.data = Some(Arc::new(1));
        assert!(state.is_refetching());
    }
}
