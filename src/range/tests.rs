//! Range router tests: configuration grammar, hashing, the master
//! lifecycle and a two-peer reconfiguration over real sockets.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::ops::{atomic, version, Hop};
use crate::range::conf::{parse_conf, rebalance, search, Range};
use crate::range::hash::get_keyhash;
use crate::range::RangeRouter;
use crate::store::MemStore;

// ============================================================
// HASHES
// ============================================================

#[test]
fn hashes_are_deterministic_and_distinct() {
    let fnv1a = get_keyhash("fnv1a").unwrap();
    let fnv1 = get_keyhash("fnv1").unwrap();
    let adler = get_keyhash("adler32").unwrap();

    assert_eq!(fnv1a.hash("key"), fnv1a.hash("key"));
    assert_eq!(fnv1a.hash(""), 0x811c9dc5);
    assert_eq!(fnv1.hash(""), 0x811c9dc5);
    assert_ne!(fnv1a.hash("key"), fnv1.hash("key"));
    assert_eq!(adler.hash("abc"), 0x024d_0127);

    assert!(get_keyhash("sha1").is_none());
}

// ============================================================
// CONFIGURATION GRAMMAR
// ============================================================

#[test]
fn parse_roundtrip() {
    let text = "127.0.0.1:5000 2\n127.0.0.1:5000 0:2147483647\n127.0.0.1:5001 2147483647:4294967295\n";
    let cf = parse_conf(text.as_bytes()).unwrap();

    assert_eq!(cf.maddr, "127.0.0.1:5000");
    assert_eq!(cf.srvnum, 2);
    assert_eq!(cf.srvaddrs.len(), 2);
    assert_eq!(cf.routes.len(), 2);
    assert_eq!(cf.routes[0].end, 2147483647);

    let again = parse_conf(cf.format().as_bytes()).unwrap();
    assert_eq!(again.routes, cf.routes);
}

#[test]
fn parse_accepts_hex_bounds_and_bare_master_line() {
    let text = "m:1\na:1 0x0:0xffffffff\n";
    let cf = parse_conf(text.as_bytes()).unwrap();
    assert_eq!(cf.maddr, "m:1");
    assert_eq!(cf.srvnum, 1, "peer count defaults to the route count");
    assert_eq!(cf.routes[0].end, u32::MAX);
}

#[test]
fn parse_rejects_garbage() {
    assert!(parse_conf(b"").is_err());
    assert!(parse_conf(b"m:1 2\n").is_err(), "no routes");
    assert!(parse_conf(b"m:1 x\na:1 0:10\n").is_err(), "bad count");
    assert!(parse_conf(b"m:1 1\na:1\n").is_err(), "route without range");
    assert!(parse_conf(b"m:1 1\na:1 10-20\n").is_err(), "bad separator");
    assert!(parse_conf(b"m:1 1\na:1 20:10\n").is_err(), "inverted range");
}

#[test]
fn parse_rejects_overlap_but_tolerates_holes() {
    let overlap = "m 2\na 0:100\nb 50:4294967295\n";
    assert!(parse_conf(overlap.as_bytes()).is_err());

    // a post-removal configuration legally has a hole
    let hole = "m 2\na 0:100\nb 200:4294967295\n";
    let cf = parse_conf(hole.as_bytes()).unwrap();
    assert!(cf.has_holes());
}

#[test]
fn search_finds_owner_and_reports_holes() {
    let routes = vec![
        Range { addr: "a".into(), start: 0, end: 100 },
        Range { addr: "b".into(), start: 200, end: u32::MAX },
    ];

    assert_eq!(search(&routes, 0).unwrap().addr, "a");
    assert_eq!(search(&routes, 100).unwrap().addr, "a");
    assert_eq!(search(&routes, 200).unwrap().addr, "b");
    assert_eq!(search(&routes, u32::MAX).unwrap().addr, "b");
    assert!(matches!(search(&routes, 150), Err(Error::Invalid(_))));
}

#[test]
fn rebalance_partitions_equally() {
    let mut routes = vec![
        Range { addr: "a".into(), start: 0, end: u32::MAX },
        Range { addr: "b".into(), start: 0, end: 0 },
        Range { addr: "c".into(), start: 0, end: 0 },
    ];
    rebalance(&mut routes);

    let rsz = (u32::MAX as usize / 3) as u32;
    assert_eq!((routes[0].start, routes[0].end), (0, rsz));
    assert_eq!((routes[1].start, routes[1].end), (rsz, 2 * rsz));
    assert_eq!(routes[2].start, 2 * rsz);
    assert_eq!(routes[2].end, u32::MAX, "last range absorbs the remainder");
}

// ============================================================
// MASTER LIFECYCLE AND TWO-PEER RECONFIGURATION
// ============================================================

async fn start_master() -> (Arc<MemStore>, Arc<RangeRouter>) {
    let store = MemStore::new();
    let router = RangeRouter::new("tcp", "127.0.0.1:0", "", Some(store.clone()))
        .await
        .unwrap();
    (store, router)
}

/// Picks a key owned by the given half of a two-peer split.
fn key_in_half(upper: bool) -> String {
    let kh = get_keyhash("fnv1a").unwrap();
    let mid = (u32::MAX / 2) as u64;
    for i in 0..10_000 {
        let key = format!("key-{}", i);
        let h = kh.hash(&key) as u64;
        if (h > mid) == upper {
            return key;
        }
    }

    unreachable!("hash never lands in the requested half");
}

#[tokio::test]
async fn master_serves_alone() {
    let (_store, master) = start_master().await;
    assert!(master.is_master());

    master.create("solo", "", b"v").await.unwrap();
    assert_eq!(master.get("solo", version::ANY).await.unwrap().1, b"v".to_vec());

    let cf = master.current_conf();
    assert_eq!(cf.routes.len(), 1);
    assert_eq!(cf.routes[0].end, u32::MAX);
    master.close();
}

#[tokio::test]
async fn peer_join_rebalances_and_routes() {
    let (mstore, master) = start_master().await;
    let (v0, _) = master.get("#/conf", version::ANY).await.unwrap();

    let pstore = MemStore::new();
    let peer = RangeRouter::new("tcp", "127.0.0.1:0", &master.addr(), Some(pstore.clone()))
        .await
        .unwrap();

    // the configuration version advanced and now splits the space
    let (v1, val) = master.get("#/conf", version::ANY).await.unwrap();
    assert!(v1 > v0);
    let cf = parse_conf(&val).unwrap();
    assert_eq!(cf.routes.len(), 2);
    assert!(!cf.has_holes());

    // writes through the master land on the hash owner
    let lower = key_in_half(false);
    let upper = key_in_half(true);
    master.create(&lower, "", b"low").await.unwrap();
    master.create(&upper, "", b"high").await.unwrap();

    assert_eq!(mstore.get(&lower, version::ANY).await.unwrap().1, b"low".to_vec());
    assert_eq!(pstore.get(&upper, version::ANY).await.unwrap().1, b"high".to_vec());

    // and reads through the peer resolve both
    assert_eq!(peer.get(&lower, version::ANY).await.unwrap().1, b"low".to_vec());
    assert_eq!(peer.get(&upper, version::ANY).await.unwrap().1, b"high".to_vec());

    master.close();
    peer.close();
}

#[tokio::test]
async fn conf_long_poll_observes_join() {
    let (_mstore, master) = start_master().await;
    let (v0, _) = master.get("#/conf", version::ANY).await.unwrap();

    let waiter = {
        let master = master.clone();
        tokio::spawn(async move { master.get("#/conf", v0 + 1).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "poll should park until a join");

    let pstore = MemStore::new();
    let peer = RangeRouter::new("tcp", "127.0.0.1:0", &master.addr(), Some(pstore))
        .await
        .unwrap();

    let (v1, val) = waiter.await.unwrap().unwrap();
    assert!(v1 > v0);
    assert!(String::from_utf8_lossy(&val).contains(&peer.addr()));

    master.close();
    peer.close();
}

#[tokio::test]
async fn keys_union_spans_peers() {
    let (_mstore, master) = start_master().await;
    let pstore = MemStore::new();
    let peer = RangeRouter::new("tcp", "127.0.0.1:0", &master.addr(), Some(pstore))
        .await
        .unwrap();

    let lower = key_in_half(false);
    let upper = key_in_half(true);
    master.create(&lower, "", b"1").await.unwrap();
    master.create(&upper, "", b"2").await.unwrap();

    for router in [&master, &peer] {
        let (_, val) = router.get("#/keys", version::ANY).await.unwrap();
        let listing = String::from_utf8_lossy(&val).into_owned();
        let keys: Vec<&str> = listing.split('\0').collect();
        assert!(keys.contains(&lower.as_str()), "union at {} misses {}", router.addr(), lower);
        assert!(keys.contains(&upper.as_str()), "union at {} misses {}", router.addr(), upper);
    }

    master.close();
    peer.close();
}

#[tokio::test]
async fn removing_a_peer_leaves_a_hole() {
    let (_mstore, master) = start_master().await;
    let pstore = MemStore::new();
    let peer = RangeRouter::new("tcp", "127.0.0.1:0", &master.addr(), Some(pstore))
        .await
        .unwrap();
    let peer_addr = peer.addr();

    let (_, _vals) = master
        .atomic("#/conf", atomic::REMOVE, &[peer_addr.clone().into_bytes()])
        .await
        .unwrap();

    let cf = master.current_conf();
    assert!(!cf.srvaddrs.contains(&peer_addr));
    assert!(cf.has_holes(), "removal must not re-partition the remainder");

    // keys hashing into the hole are unroutable until the next join
    let upper = key_in_half(true);
    assert!(master.create(&upper, "", b"v").await.is_err());

    // keys in the master's own range still work
    let lower = key_in_half(false);
    master.create(&lower, "", b"v").await.unwrap();

    master.close();
    peer.close();
}

#[tokio::test]
async fn pure_client_routes_to_both_peers() {
    let (mstore, master) = start_master().await;
    let pstore = MemStore::new();
    let peer = RangeRouter::new("tcp", "127.0.0.1:0", &master.addr(), Some(pstore.clone()))
        .await
        .unwrap();

    let clnt = RangeRouter::connect("tcp", &master.addr()).await.unwrap();
    assert!(!clnt.is_master());

    let lower = key_in_half(false);
    let upper = key_in_half(true);
    clnt.create(&lower, "", b"low").await.unwrap();
    clnt.create(&upper, "", b"high").await.unwrap();

    assert_eq!(mstore.get(&lower, version::ANY).await.unwrap().1, b"low".to_vec());
    assert_eq!(pstore.get(&upper, version::ANY).await.unwrap().1, b"high".to_vec());
    assert_eq!(clnt.get(&upper, version::ANY).await.unwrap().1, b"high".to_vec());

    clnt.close();
    master.close();
    peer.close();
}
