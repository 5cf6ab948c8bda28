//! # query-kit
//!
//! An async, client-side query cache for Rust.
//!
//! ## Features
//!
//! - **Deduplicated fetches:** concurrent readers of one key share one fetch
//! - **Stale-while-revalidate:** cached data is served immediately while a
//!   background refetch runs
//! - **Garbage collection:** unobserved entries are dropped after `cache_time`
//! - **Mutations:** writes invalidate (and optionally refetch) the queries
//!   they affect
//! - **Observers with `select`:** every subscriber reads its own projection
//!   of the shared data
//! - **Deterministic time:** staleness and GC run on an injectable [`Clock`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use query_kit::{query_key, MutationOptions, QueryCache, QueryOptions};
//! use std::time::Duration;
//!
//! #[derive(Clone)]
//! struct Hero {
//!     name: String,
//! }
//!
//! async fn fetch_heroes() -> Result<Vec<Hero>, std::io::Error> {
//!     Ok(vec![Hero { name: "Batman".to_string() }])
//! }
//!
//! async fn add_hero(hero: Hero) -> Result<Hero, std::io::Error> {
//!     Ok(hero)
//! }
//!
//! #[tokio::main]
//! async fn main() -> query_kit::Result<()> {
//!     let cache = QueryCache::new();
//!
//!     // 1. Subscribe: fetches once, then serves from cache
//!     let mut names = cache.subscribe(
//!         query_key!["super-heroes"],
//!         fetch_heroes,
//!         QueryOptions::default()
//!             .stale_time(Duration::from_secs(30))
//!             .select(|heroes: &Vec<Hero>| {
//!                 heroes.iter().map(|h| h.name.clone()).collect::<Vec<_>>()
//!             }),
//!     )?;
//!     let state = names.settled().await;
//!     println!("{:?}", state.data);
//!
//!     // 2. Mutate: invalidates and refetches the hero list
//!     cache
//!         .mutate(
//!             add_hero,
//!             Hero { name: "Hulk".to_string() },
//!             MutationOptions::default()
//!                 .invalidate(query_key!["super-heroes"])
//!                 .refetch_active(true),
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! Every operation that may start a fetch must run inside a tokio runtime.

#[macro_use]
extern crate log;

pub mod cache;
pub mod clock;
mod entry;
pub mod error;
pub mod fetcher;
pub mod key;
pub mod mutation;
pub mod observability;
pub mod observer;
pub mod options;
pub mod state;

// Re-exports for convenience
pub use cache::{CacheStats, QueryCache, QueryCacheBuilder};
pub use clock::{Clock, TokioClock};
pub use error::{Error, QueryError, Result};
pub use fetcher::{MutationFn, QueryFn};
pub use key::QueryKey;
pub use mutation::Mutation;
pub use observability::{CacheEvent, ListenerId, LogMetrics, NoOpMetrics, QueryMetrics};
pub use observer::QueryObserver;
pub use options::{MutationOptions, QueryCacheConfig, QueryOptions, RefetchPolicy};
pub use state::{MutationState, MutationStatus, QueryState, QueryStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
