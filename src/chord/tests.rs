//! Chord tests: ring arithmetic, node specs, single-node behavior and a
//! three-peer ring that stabilizes, routes and survives a member death.

use std::sync::Arc;
use std::time::Duration;

use crate::chord::hash::get_keyhash;
use crate::chord::node::{between, parse_spec};
use crate::chord::ChordRouter;
use crate::error::Error;
use crate::ops::{version, Hop};
use crate::store::MemStore;

// ============================================================
// RING ARITHMETIC AND NODE SPECS
// ============================================================

#[test]
fn between_handles_wraparound() {
    // plain interval (low, high]
    assert!(between(5, 1, 10));
    assert!(between(10, 1, 10));
    assert!(!between(1, 1, 10));
    assert!(!between(11, 1, 10));

    // interval crossing zero
    assert!(between(u64::MAX, u64::MAX - 10, 5));
    assert!(between(3, u64::MAX - 10, 5));
    assert!(!between(100, u64::MAX - 10, 5));
}

#[test]
fn node_spec_roundtrip() {
    let (id, addr, oncycle) = parse_spec("00000000000000ff 127.0.0.1:9000 true").unwrap();
    assert_eq!(id, 0xff);
    assert_eq!(addr, "127.0.0.1:9000");
    assert!(oncycle);

    // the oncycle field may be omitted and defaults to false
    let (_, _, oncycle) = parse_spec("00000000000000ff 127.0.0.1:9000").unwrap();
    assert!(!oncycle);

    assert!(parse_spec("").is_err());
    assert!(parse_spec("justone").is_err());
    assert!(parse_spec("zz addr").is_err());
    assert!(parse_spec("1 2 3 4").is_err());
}

#[test]
fn keyhash_registry() {
    let fnv1a = get_keyhash("fnv1a").unwrap();
    let fnv1 = get_keyhash("fnv1").unwrap();

    assert_eq!(fnv1a.hash(""), 0xcbf2_9ce4_8422_2325);
    assert_ne!(fnv1a.hash("node"), fnv1.hash("node"));
    assert!(get_keyhash("md5").is_none());
}

// ============================================================
// SINGLE NODE
// ============================================================

async fn start_ring() -> (Arc<MemStore>, Arc<ChordRouter>) {
    let store = MemStore::new();
    let router = ChordRouter::new("tcp", "127.0.0.1:0", "", Some(store.clone()))
        .await
        .unwrap();
    (store, router)
}

async fn join_ring(via: &str) -> (Arc<MemStore>, Arc<ChordRouter>) {
    let store = MemStore::new();
    let router = ChordRouter::new("tcp", "127.0.0.1:0", via, Some(store.clone()))
        .await
        .unwrap();
    (store, router)
}

#[tokio::test]
async fn single_node_serves_locally() {
    let (store, ring) = start_ring().await;
    assert!(ring.oncycle(), "a fresh ring starts strongly stabilized");

    ring.create("k", "", b"v").await.unwrap();
    assert_eq!(ring.get("k", version::ANY).await.unwrap().1, b"v".to_vec());
    assert_eq!(store.get("k", version::ANY).await.unwrap().1, b"v".to_vec());

    // every hash has the lone node as successor
    let nd = ring.find_successor(0xdead_beef).await.unwrap();
    assert_eq!(nd.id, ring.selfnode().id);
}

#[tokio::test]
async fn single_node_meta_entries() {
    let (_store, ring) = start_ring().await;

    let (_, val) = ring.get("#/chord/id", version::ANY).await.unwrap();
    let spec = String::from_utf8(val).unwrap();
    assert!(spec.contains(&ring.addr()));
    assert!(spec.ends_with("true"));

    let (_, val) = ring.get("#/chord/successor", version::ANY).await.unwrap();
    assert_eq!(String::from_utf8(val).unwrap(), ring.selfnode().spec());

    let target = format!("#/chord/successor:{:016x}", 42u64);
    let (_, val) = ring.get(&target, version::ANY).await.unwrap();
    assert_eq!(String::from_utf8(val).unwrap(), ring.selfnode().spec());

    // no predecessor yet
    let (_, val) = ring.get("#/chord/predecessor", version::ANY).await.unwrap();
    assert!(val.is_empty());

    let (_, val) = ring.get("#/chord/finger", version::ANY).await.unwrap();
    assert_eq!(val.split(|&b| b == b'\n').filter(|l| !l.is_empty()).count(), 64);
}

// ============================================================
// MULTI-NODE RING
// ============================================================

async fn wait_oncycle(rings: &[&Arc<ChordRouter>], timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if rings.iter().all(|r| r.oncycle()) {
            return;
        }

        assert!(
            tokio::time::Instant::now() < deadline,
            "ring failed to stabilize in {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_nodes_stabilize_and_route() {
    let (s1, n1) = start_ring().await;
    let (s2, n2) = join_ring(&n1.addr()).await;

    wait_oncycle(&[&n1, &n2], Duration::from_secs(15)).await;

    // each key lands on exactly one store, reachable from both nodes
    for i in 0..8 {
        let key = format!("two-{}", i);
        n1.create(&key, "", key.as_bytes()).await.unwrap();

        let on1 = s1.get(&key, version::ANY).await.is_ok();
        let on2 = s2.get(&key, version::ANY).await.is_ok();
        assert!(on1 ^ on2, "key {} must live on exactly one node", key);

        assert_eq!(n2.get(&key, version::ANY).await.unwrap().1, key.as_bytes());
    }

    n1.close();
    n2.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_ring_stabilizes_and_survives_death() {
    let (s1, n1) = start_ring().await;
    let (s2, n2) = join_ring(&n1.addr()).await;
    let (s3, n3) = join_ring(&n2.addr()).await;

    wait_oncycle(&[&n1, &n2, &n3], Duration::from_secs(20)).await;

    // spread keys over the ring
    let mut owned_by_3 = None;
    let mut owned_elsewhere = None;
    for i in 0..64 {
        let key = format!("ring-{}", i);
        n1.create(&key, "", key.as_bytes()).await.unwrap();

        let placed = [
            s1.get(&key, version::ANY).await.is_ok(),
            s2.get(&key, version::ANY).await.is_ok(),
            s3.get(&key, version::ANY).await.is_ok(),
        ];
        assert_eq!(
            placed.iter().filter(|&&p| p).count(),
            1,
            "key {} must have exactly one owner",
            key
        );

        if placed[2] && owned_by_3.is_none() {
            owned_by_3 = Some(key.clone());
        }
        if !placed[2] && owned_elsewhere.is_none() {
            owned_elsewhere = Some(key.clone());
        }

        // any member resolves any key
        assert_eq!(n3.get(&key, version::ANY).await.unwrap().1, key.as_bytes());
    }

    let (Some(lost_key), Some(kept_key)) = (owned_by_3, owned_elsewhere) else {
        // 64 keys landing all on one node would mean a broken hash
        panic!("keys did not spread across the ring");
    };

    // kill the third node; without replication its keys are gone, but the
    // ring heals around it and the rest stays reachable
    n3.close();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        match n1.get(&lost_key, version::ANY).await {
            Err(Error::NoEntry) => break,
            Ok(_) | Err(_) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "ring did not heal after member death"
                );
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    assert_eq!(
        n1.get(&kept_key, version::ANY).await.unwrap().1,
        kept_key.as_bytes()
    );
    assert_eq!(
        n2.get(&kept_key, version::ANY).await.unwrap().1,
        kept_key.as_bytes()
    );

    n1.close();
    n2.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_routes_without_serving() {
    let (s1, n1) = start_ring().await;
    let (s2, n2) = join_ring(&n1.addr()).await;
    wait_oncycle(&[&n1, &n2], Duration::from_secs(15)).await;

    let clnt = ChordRouter::connect("tcp", &n1.addr()).await.unwrap();

    for i in 0..8 {
        let key = format!("clnt-{}", i);
        clnt.create(&key, "", key.as_bytes()).await.unwrap();
        assert_eq!(clnt.get(&key, version::ANY).await.unwrap().1, key.as_bytes());
    }

    // the client stored nothing itself
    let total = s1.num_entries() + s2.num_entries();
    assert_eq!(total, 8 + 2 * 3, "all keys live on the serving members");

    clnt.close();
    n1.close();
    n2.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ring_walk_lists_every_member() {
    let (_s1, n1) = start_ring().await;
    let (_s2, n2) = join_ring(&n1.addr()).await;
    let (_s3, n3) = join_ring(&n1.addr()).await;
    wait_oncycle(&[&n1, &n2, &n3], Duration::from_secs(20)).await;

    let (_, val) = n1.get("#/chord/ring", version::ANY).await.unwrap();
    let walk = String::from_utf8(val).unwrap();
    for n in [&n1, &n2, &n3] {
        assert!(walk.contains(&n.addr()), "ring walk misses {}", n.addr());
    }

    n1.close();
    n2.close();
    n3.close();
}
