//! Super-heroes walkthrough of the query cache.
//!
//! Simulates a small API with an in-memory "server" and shows
//! deduplication, `select`, parallel and dynamic parallel queries, and a
//! mutation that invalidates the hero list.

use query_kit::{
    query_key, CacheEvent, MutationOptions, QueryCache, QueryCacheConfig, QueryError,
    QueryOptions, Result,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug)]
struct Hero {
    id: u64,
    name: String,
    alter_ego: String,
}

#[derive(Clone, Debug)]
struct Friend {
    name: String,
}

/// Fake backend with a request counter.
#[derive(Clone, Default)]
struct HeroServer {
    heroes: Arc<Mutex<Vec<Hero>>>,
    requests: Arc<AtomicUsize>,
}

impl HeroServer {
    fn new() -> Self {
        let server = HeroServer::default();
        {
            let mut heroes = server.heroes.lock().unwrap_or_else(|e| e.into_inner());
            heroes.push(hero(1, "Batman", "Bruce Wayne"));
            heroes.push(hero(2, "Superman", "Clark Kent"));
            heroes.push(hero(3, "Wonder Woman", "Princess Diana"));
        }
        server
    }

    async fn list(&self) -> std::result::Result<Vec<Hero>, String> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(self.heroes.lock().map_err(|e| e.to_string())?.clone())
    }

    async fn get(&self, id: u64) -> std::result::Result<Hero, String> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.heroes
            .lock()
            .map_err(|e| e.to_string())?
            .iter()
            .find(|h| h.id == id)
            .cloned()
            .ok_or_else(|| format!("Request failed with status code 404 (hero {})", id))
    }

    async fn friends(&self) -> std::result::Result<Vec<Friend>, String> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(vec![
            Friend { name: "Chandler".to_string() },
            Friend { name: "Joey".to_string() },
        ])
    }

    async fn add(&self, name: String, alter_ego: String) -> std::result::Result<Hero, String> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut heroes = self.heroes.lock().map_err(|e| e.to_string())?;
        let created = hero(heroes.len() as u64 + 1, &name, &alter_ego);
        heroes.push(created.clone());
        Ok(created)
    }

    fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

fn hero(id: u64, name: &str, alter_ego: &str) -> Hero {
    Hero {
        id,
        name: name.to_string(),
        alter_ego: alter_ego.to_string(),
    }
}

fn hero_names() -> QueryOptions<Vec<Hero>, Vec<String>> {
    QueryOptions::default()
        .on_success(|heroes: &Vec<Hero>| {
            println!("   [onSuccess] fetched {} heroes", heroes.len());
        })
        .on_error(|error: &QueryError| println!("   [onError] {}", error))
        .select(|heroes: &Vec<Hero>| heroes.iter().map(|h| h.name.clone()).collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== Query Kit - Super Heroes ===\n");

    let server = HeroServer::new();
    let cache = QueryCache::with_config(
        QueryCacheConfig::default()
            .with_stale_time(Duration::from_secs(10))
            .with_cache_time(Duration::from_secs(5)),
    )?;
    cache.on_event(|event| {
        if let CacheEvent::Updated { key, status, is_fetching } = event {
            println!("   [event] {} -> {} (fetching: {})", key, status, is_fetching);
        }
    });

    // 1. Two components mount the hero list at the same time
    println!("1. Two observers of \"super-heroes\":");
    let api = server.clone();
    let mut list = cache.subscribe(
        "super-heroes",
        move || {
            let api = api.clone();
            async move { api.list().await }
        },
        hero_names(),
    )?;
    let api = server.clone();
    let mut list_again = cache.subscribe(
        "super-heroes",
        move || {
            let api = api.clone();
            async move { api.list().await }
        },
        hero_names(),
    )?;

    let names = list.settled().await;
    list_again.settled().await;
    println!("   ✓ Names: {:?}", names.data);
    println!("   ✓ Server requests so far: {}\n", server.request_count());

    // 2. Single hero, including one that does not exist
    println!("2. Single hero queries:");
    for id in [1, 42] {
        let api = server.clone();
        let mut one = cache.subscribe(
            query_key!["super-hero", id],
            move || {
                let api = api.clone();
                async move { api.get(id).await }
            },
            QueryOptions::default(),
        )?;
        let state = one.settled().await;
        match (&state.data, &state.error) {
            (Some(h), _) => println!("   ✓ {}-{}", h.name, h.alter_ego),
            (None, Some(e)) => println!("   ✗ {}", e),
            (None, None) => println!("   … still idle"),
        }
    }
    println!();

    // 3. Parallel queries on unrelated keys
    println!("3. Parallel queries (heroes + friends):");
    let api = server.clone();
    let mut heroes = cache.subscribe(
        "super-heroes",
        move || {
            let api = api.clone();
            async move { api.list().await }
        },
        QueryOptions::default(),
    )?;
    let api = server.clone();
    let mut friends = cache.subscribe(
        "friends",
        move || {
            let api = api.clone();
            async move { api.friends().await }
        },
        QueryOptions::default(),
    )?;
    let (h, f) = tokio::join!(heroes.settled(), friends.settled());
    let hero_count = h.data.map(|d| d.len()).unwrap_or(0);
    let friend_names: Vec<String> = f
        .data
        .map(|d| d.iter().map(|x| x.name.clone()).collect())
        .unwrap_or_default();
    println!("   ✓ {} heroes, friends: {:?}\n", hero_count, friend_names);

    // 4. Dynamic parallel: one query per id, decided at runtime
    println!("4. Dynamic parallel queries for heroes [1, 3]:");
    let queries = [1_u64, 3].into_iter().map(|id| {
        let api = server.clone();
        (query_key!["super-hero", id], move || {
            let api = api.clone();
            async move { api.get(id).await }
        })
    });
    let mut observers = cache.subscribe_many(queries, QueryOptions::default())?;
    for observer in observers.iter_mut() {
        let state = observer.settled().await;
        if let Some(h) = state.data {
            println!("   ✓ {} -> {}", observer.key(), h.name);
        }
    }
    println!();

    // 5. Add a hero: the list is invalidated and refetched for its observers
    println!("5. Adding a hero:");
    let api = server.clone();
    let added = cache
        .mutate(
            move |(name, alter_ego): (String, String)| {
                let api = api.clone();
                async move { api.add(name, alter_ego).await }
            },
            ("Hulk".to_string(), "Bruce Banner".to_string()),
            MutationOptions::default()
                .invalidate("super-heroes")
                .refetch_active(true),
        )
        .await?;
    println!("   ✓ Added {}", added.name);

    let names = list.settled().await;
    println!("   ✓ Names after refetch: {:?}\n", names.data);

    // 6. Unmount everything; entries are collected after cache_time
    println!("6. Unsubscribing all observers:");
    drop((list, list_again, heroes, friends, observers));
    println!("   ✓ {} entries cached", cache.len());
    tokio::time::sleep(Duration::from_secs(6)).await;
    println!("   ✓ {} entries after cache_time\n", cache.len());

    cache.log_stats();
    println!("Total server requests: {}", server.request_count());
    println!("=== Example Complete ===\n");
    Ok(())
}
