//! Cache tests: cap invariants, eviction order, write-through population
//! and the domain relay prefix handling.

use std::sync::Arc;

use crate::cache::Cache;
use crate::error::Error;
use crate::ops::{atomic, version, Hop};
use crate::store::MemStore;

fn fronted(maxmem: u64, maxelem: usize) -> (Arc<MemStore>, Arc<Cache>) {
    let store = MemStore::new();
    let cache = Cache::new(store.clone(), maxmem, maxelem);
    (store, cache)
}

#[tokio::test]
async fn writes_populate_the_cache() {
    let (store, cache) = fronted(1 << 20, 16);

    cache.create("k", "", b"v1").await.unwrap();
    let (elems, mem) = cache.usage();
    assert_eq!(elems, 1);
    assert_eq!(mem, ("k".len() + "v1".len()) as u64);

    // a hit serves without touching the store: remove the backing entry
    // behind the cache's back and the cached value still comes out
    store.remove("k").await.unwrap();
    assert_eq!(cache.get("k", version::ANY).await.unwrap().1, b"v1".to_vec());
}

#[tokio::test]
async fn element_cap_evicts_lru() {
    let (store, cache) = fronted(1 << 20, 2);

    set_through(&cache, &store, "a", b"1").await;
    set_through(&cache, &store, "b", b"2").await;
    set_through(&cache, &store, "c", b"3").await;

    let (elems, _) = cache.usage();
    assert_eq!(elems, 2);

    // "a" was evicted: reads pass through; "c" is still a hit even after
    // the store forgets it
    store.remove("c").await.unwrap();
    assert_eq!(cache.get("c", version::ANY).await.unwrap().1, b"3".to_vec());
    assert_eq!(cache.get("a", version::ANY).await.unwrap().1, b"1".to_vec());
}

#[tokio::test]
async fn byte_cap_holds() {
    let (store, cache) = fronted(24, 100);

    for i in 0..10 {
        let key = format!("key-{}", i); // 5 bytes + 4 value bytes
        store.create(&key, "", b"vvvv").await.unwrap();
        cache.get(&key, version::ANY).await.unwrap();

        let (_, mem) = cache.usage();
        assert!(mem <= 24, "byte cap violated: {}", mem);
    }
}

#[tokio::test]
async fn oversized_value_is_not_cached() {
    let (_store, cache) = fronted(8, 4);

    cache.create("big", "", &[0u8; 64]).await.unwrap();
    let (elems, mem) = cache.usage();
    assert_eq!((elems, mem), (0, 0));
}

#[tokio::test]
async fn get_promotes_recency() {
    let (store, cache) = fronted(1 << 20, 2);

    set_through(&cache, &store, "a", b"1").await;
    set_through(&cache, &store, "b", b"2").await;
    cache.get("a", version::ANY).await.unwrap(); // a becomes MRU
    set_through(&cache, &store, "c", b"3").await; // evicts b

    store.remove("a").await.unwrap();
    assert_eq!(cache.get("a", version::ANY).await.unwrap().1, b"1".to_vec());
    assert_eq!(cache.get("b", version::ANY).await.unwrap().1, b"2".to_vec()); // pass-through
}

#[tokio::test]
async fn stale_cache_refreshes_on_newer_request() {
    let (store, cache) = fronted(1 << 20, 16);

    cache.create("k", "", b"old").await.unwrap();
    let ver = store.set("k", b"new").await.unwrap(); // behind the cache

    // Any still serves the stale copy, asking for the newer version
    // forwards and refreshes
    assert_eq!(cache.get("k", version::ANY).await.unwrap().1, b"old".to_vec());
    assert_eq!(cache.get("k", ver).await.unwrap(), (ver, b"new".to_vec()));
    assert_eq!(cache.get("k", version::ANY).await.unwrap().1, b"new".to_vec());
}

#[tokio::test]
async fn testset_and_atomic_refresh_the_cache() {
    let (store, cache) = fronted(1 << 20, 16);

    cache.create("k", "", b"aaa").await.unwrap();
    cache.testset("k", version::ANY, None, b"bbb").await.unwrap();
    store.remove("k").await.unwrap();
    assert_eq!(cache.get("k", version::ANY).await.unwrap().1, b"bbb".to_vec());

    let (_store2, cache2) = fronted(1 << 20, 16);
    cache2.create("ctr", "", &[0u8]).await.unwrap();
    cache2.atomic("ctr", atomic::ADD, &[vec![5]]).await.unwrap();
    assert_eq!(cache2.get("ctr", version::ANY).await.unwrap().1, vec![5u8]);
}

#[tokio::test]
async fn remove_evicts_locally() {
    let (_store, cache) = fronted(1 << 20, 16);

    cache.create("k", "", b"v").await.unwrap();
    cache.remove("k").await.unwrap();
    assert_eq!(cache.usage().0, 0);
    assert_eq!(cache.get("k", version::ANY).await.unwrap_err(), Error::NoEntry);
}

#[tokio::test]
async fn failed_ops_do_not_pollute_the_cache() {
    let (_store, cache) = fronted(1 << 20, 16);

    assert!(cache.get("missing", version::ANY).await.is_err());
    assert!(cache.set("missing", b"v").await.is_err());
    assert_eq!(cache.usage().0, 0);
}

#[tokio::test]
async fn chop_prefix_strips_domain() {
    let (store, cache) = fronted(1 << 20, 16);
    store.create("k", "", b"v").await.unwrap();

    // incoming domain traffic: "#/chop/D/k" applies to plain "k"
    let (_, val) = cache.get("#/chop/books/k", version::ANY).await.unwrap();
    assert_eq!(val, b"v".to_vec());

    // a chop key without a domain separator is malformed
    assert!(matches!(
        cache.get("#/chop/k", version::ANY).await.unwrap_err(),
        Error::Invalid(_)
    ));
}

#[tokio::test]
async fn cache_prefix_without_relay_passes_through() {
    let (_store, cache) = fronted(1 << 20, 16);

    // no relay configured: "#/cache/..." is just an (unroutable) local key
    assert_eq!(
        cache.get("#/cache/books/k", version::ANY).await.unwrap_err(),
        Error::NoEntry
    );
}

#[tokio::test]
async fn stats_render() {
    let (_store, cache) = fronted(1 << 20, 16);
    cache.create("k", "", b"v").await.unwrap();
    cache.get("k", version::ANY).await.unwrap();

    let stats = cache.stats();
    assert!(stats.contains("Cache Elements: 1"));
    assert!(stats.contains("Cache Hits: 1"));
}

/// Writes through the cache while asserting the store observed it.
async fn set_through(cache: &Arc<Cache>, store: &Arc<MemStore>, key: &str, val: &[u8]) {
    cache.create(key, "", val).await.unwrap();
    assert!(store.get(key, version::ANY).await.is_ok());
}
