//! Entry store tests: operation semantics, the waiter protocol, meta
//! entries and the atomic operation family.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::ops::{atomic, version, Hop};
use crate::store::MemStore;

// ============================================================
// BASIC OPERATION SEMANTICS
// ============================================================

#[tokio::test]
async fn leaf_roundtrip() {
    let s = MemStore::new();

    assert_eq!(s.create("foo", "", b"bar").await.unwrap(), 1);
    assert_eq!(s.get("foo", 0).await.unwrap(), (1, b"bar".to_vec()));

    let (ver, val) = s.testset("foo", 1, Some(b"bar"), b"baz").await.unwrap();
    assert_eq!((ver, val), (2, b"baz".to_vec()));

    // version mismatch leaves the entry alone and reports the current state
    let (ver, val) = s.testset("foo", 1, None, b"qux").await.unwrap();
    assert_eq!((ver, val), (2, b"baz".to_vec()));

    s.remove("foo").await.unwrap();
    assert_eq!(s.get("foo", 0).await.unwrap_err(), Error::NoEntry);
}

#[tokio::test]
async fn create_existing_key_fails() {
    let s = MemStore::new();
    s.create("k", "", b"v").await.unwrap();
    assert_eq!(s.create("k", "", b"w").await.unwrap_err(), Error::Exists);
}

#[tokio::test]
async fn missing_key_is_noent() {
    let s = MemStore::new();
    assert_eq!(s.get("nope", version::ANY).await.unwrap_err(), Error::NoEntry);
    assert_eq!(s.set("nope", b"v").await.unwrap_err(), Error::NoEntry);
    assert_eq!(
        s.testset("nope", 0, None, b"v").await.unwrap_err(),
        Error::NoEntry
    );
    assert_eq!(s.remove("nope").await.unwrap_err(), Error::NoEntry);
}

#[tokio::test]
async fn reserved_keys_are_protected() {
    let s = MemStore::new();
    assert_eq!(
        s.create("#/mine", "", b"v").await.unwrap_err(),
        Error::Permission
    );
    assert_eq!(s.remove("#/id").await.unwrap_err(), Error::Permission);
    // read-only virtual entries refuse writes
    assert_eq!(s.set("#/keys", b"v").await.unwrap_err(), Error::Permission);
    assert_eq!(s.set("#/id", b"other").await.unwrap_err(), Error::Permission);
    assert_eq!(
        s.atomic("#/id", atomic::APPEND, &[b"x".to_vec()])
            .await
            .unwrap_err(),
        Error::Permission
    );
}

#[tokio::test]
async fn testset_any_nil_is_set() {
    let s = MemStore::new();
    s.create("k", "", b"a").await.unwrap();

    let set_ver = s.set("k", b"b").await.unwrap();
    let (ts_ver, ts_val) = s.testset("k", version::ANY, None, b"c").await.unwrap();

    assert_eq!(set_ver, 2);
    assert_eq!((ts_ver, ts_val), (3, b"c".to_vec()));
}

#[tokio::test]
async fn versions_increase_monotonically() {
    let s = MemStore::new();
    s.create("k", "", b"0").await.unwrap();

    let mut last = 1;
    for i in 0..100u32 {
        let ver = s.set("k", &i.to_le_bytes()).await.unwrap();
        assert!(ver > last);
        last = ver;
    }
}

// ============================================================
// WAITER PROTOCOL
// ============================================================

#[tokio::test]
async fn get_waits_for_future_version() {
    let s = MemStore::new();
    s.create("k", "", b"old").await.unwrap();
    let (cur, _) = s.get("k", version::ANY).await.unwrap();

    let waiter = {
        let s = s.clone();
        tokio::spawn(async move { s.get("k", cur + 1).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished(), "waiter should block");

    let ver = s.set("k", b"new").await.unwrap();
    assert_eq!(ver, cur + 1);

    let got = waiter.await.unwrap().unwrap();
    assert_eq!(got, (cur + 1, b"new".to_vec()));
}

#[tokio::test]
async fn get_past_newest_waits_for_next_mutation() {
    let s = MemStore::new();
    s.create("k", "", b"a").await.unwrap();

    let waiter = {
        let s = s.clone();
        tokio::spawn(async move { s.get("k", version::PAST_NEWEST).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    s.set("k", b"b").await.unwrap();
    assert_eq!(waiter.await.unwrap().unwrap(), (2, b"b".to_vec()));
}

#[tokio::test]
async fn waiting_on_uncreated_key_completes_on_create() {
    let s = MemStore::new();

    let waiter = {
        let s = s.clone();
        tokio::spawn(async move { s.get("later", version::LOWEST).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    assert_eq!(s.create("later", "", b"v").await.unwrap(), 1);
    assert_eq!(waiter.await.unwrap().unwrap(), (1, b"v".to_vec()));
}

#[tokio::test]
async fn placeholder_is_not_a_live_key() {
    let s = MemStore::new();

    let _waiter = {
        let s = s.clone();
        tokio::spawn(async move { s.get("pending", version::LOWEST).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // the placeholder exists in the map but is invisible to everything else
    assert_eq!(
        s.get("pending", version::ANY).await.unwrap_err(),
        Error::NoEntry
    );
    assert_eq!(s.set("pending", b"v").await.unwrap_err(), Error::NoEntry);
    assert_eq!(s.remove("pending").await.unwrap_err(), Error::NoEntry);
}

#[tokio::test]
async fn remove_wakes_waiters_with_noent() {
    let s = MemStore::new();
    s.create("k", "", b"v").await.unwrap();

    let waiter = {
        let s = s.clone();
        tokio::spawn(async move { s.get("k", 100).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    s.remove("k").await.unwrap();
    assert_eq!(waiter.await.unwrap().unwrap_err(), Error::NoEntry);
}

#[tokio::test]
async fn many_waiters_wake_together() {
    let s = MemStore::new();
    s.create("k", "", b"a").await.unwrap();

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let s = s.clone();
            tokio::spawn(async move { s.get("k", 2).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    s.set("k", b"b").await.unwrap();
    for w in waiters {
        assert_eq!(w.await.unwrap().unwrap(), (2, b"b".to_vec()));
    }
}

// ============================================================
// META ENTRIES
// ============================================================

fn keys_of(val: &[u8]) -> Vec<String> {
    if val.is_empty() {
        return vec![];
    }

    String::from_utf8(val.to_vec())
        .unwrap()
        .split('\0')
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn id_entry() {
    let s = MemStore::new();
    let (ver, val) = s.get("#/id", version::ANY).await.unwrap();
    assert_eq!(ver, 1);
    assert_eq!(val, b"mem");
}

#[tokio::test]
async fn keys_listing_tracks_churn() {
    let s = MemStore::new();

    let (v0, val) = s.get("#/keys", version::ANY).await.unwrap();
    assert_eq!(keys_of(&val), vec!["#/id", "#/keynum", "#/keys"]);

    s.create("a", "", b"1").await.unwrap();
    s.create("b", "", b"2").await.unwrap();

    let (v1, val) = s.get("#/keys", version::ANY).await.unwrap();
    assert!(v1 > v0);
    assert_eq!(keys_of(&val), vec!["#/id", "#/keynum", "#/keys", "a", "b"]);

    s.remove("a").await.unwrap();
    let (v2, val) = s.get("#/keys", version::ANY).await.unwrap();
    assert!(v2 > v1);
    assert!(!keys_of(&val).contains(&"a".to_string()));
}

#[tokio::test]
async fn keys_regex_filter_is_anchored() {
    let s = MemStore::new();
    s.create("user/1", "", b"a").await.unwrap();
    s.create("user/2", "", b"b").await.unwrap();
    s.create("user/22", "", b"c").await.unwrap();
    s.create("group/1", "", b"d").await.unwrap();

    let (_, val) = s.get("#/keys:user/.", version::ANY).await.unwrap();
    assert_eq!(keys_of(&val), vec!["user/1", "user/2"]);

    let (_, val) = s.get("#/keys:user/.*", version::ANY).await.unwrap();
    assert_eq!(keys_of(&val), vec!["user/1", "user/2", "user/22"]);

    assert!(matches!(
        s.get("#/keys:(", version::ANY).await.unwrap_err(),
        Error::Invalid(_)
    ));
}

#[tokio::test]
async fn keynum_counts_live_entries() {
    let s = MemStore::new();
    let (_, val) = s.get("#/keynum", version::ANY).await.unwrap();
    assert_eq!(val, b"3"); // #/id #/keys #/keynum

    s.create("a", "", b"1").await.unwrap();
    let (_, val) = s.get("#/keynum", version::ANY).await.unwrap();
    assert_eq!(val, b"4");

    s.remove("a").await.unwrap();
    let (_, val) = s.get("#/keynum", version::ANY).await.unwrap();
    assert_eq!(val, b"3");
}

#[tokio::test]
async fn blocked_keys_reader_observes_churn() {
    let s = MemStore::new();
    let (cur, _) = s.get("#/keys", version::ANY).await.unwrap();

    let waiter = {
        let s = s.clone();
        tokio::spawn(async move { s.get("#/keys", cur + 1).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    s.create("new-key", "", b"v").await.unwrap();
    let (ver, val) = waiter.await.unwrap().unwrap();
    assert!(ver > cur);
    assert!(keys_of(&val).contains(&"new-key".to_string()));
}

// ============================================================
// ATOMIC OPERATIONS
// ============================================================

#[tokio::test]
async fn atomic_add_eight_byte_counter() {
    let s = MemStore::new();
    s.create("ctr", "", &[0u8; 8]).await.unwrap();

    let one = [1u8, 0, 0, 0, 0, 0, 0, 0];
    let (ver, vals) = s.atomic("ctr", atomic::ADD, &[one.to_vec()]).await.unwrap();
    assert_eq!(ver, 2);
    assert_eq!(vals, vec![one.to_vec()]);
}

#[tokio::test]
async fn atomic_add_sub_wrap() {
    let s = MemStore::new();
    s.create("c", "", &[0xffu8]).await.unwrap();

    let (_, vals) = s.atomic("c", atomic::ADD, &[vec![1]]).await.unwrap();
    assert_eq!(vals[0], vec![0]);

    let (_, vals) = s.atomic("c", atomic::SUB, &[vec![1]]).await.unwrap();
    assert_eq!(vals[0], vec![0xff]);
}

#[tokio::test]
async fn atomic_add_length_mismatch_is_invalid() {
    let s = MemStore::new();
    s.create("c", "", &[0u8; 4]).await.unwrap();

    assert!(matches!(
        s.atomic("c", atomic::ADD, &[vec![1]]).await.unwrap_err(),
        Error::Invalid(_)
    ));
    // three-byte integers don't exist
    s.set("c", &[0, 0, 0]).await.unwrap();
    assert!(matches!(
        s.atomic("c", atomic::ADD, &[vec![1, 0, 0]]).await.unwrap_err(),
        Error::Invalid(_)
    ));
}

#[tokio::test]
async fn atomic_bitset_with_mask_is_or() {
    let s = MemStore::new();
    s.create("b", "", &[0b0001, 0b0000]).await.unwrap();

    let (ver, vals) = s
        .atomic("b", atomic::BIT_SET, &[vec![0b0110, 0b1000]])
        .await
        .unwrap();
    assert_eq!(ver, 2);
    assert_eq!(vals, vec![vec![0b0111, 0b1000]]);
}

#[tokio::test]
async fn atomic_bitset_finds_first_zero_bit() {
    let s = MemStore::new();
    s.create("b", "", &[0xff, 0b0000_0111]).await.unwrap();

    let (_, vals) = s.atomic("b", atomic::BIT_SET, &[]).await.unwrap();
    assert_eq!(vals.len(), 2, "no-mask form returns value and bit index");
    assert_eq!(vals[0], vec![0xff, 0b0000_1111]);
    assert_eq!(vals[1], 11u32.to_le_bytes().to_vec());

    // saturated value refuses
    s.set("b", &[0xff]).await.unwrap();
    assert!(matches!(
        s.atomic("b", atomic::BIT_SET, &[]).await.unwrap_err(),
        Error::Invalid(_)
    ));
}

#[tokio::test]
async fn atomic_bitclear_finds_first_one_bit() {
    let s = MemStore::new();
    s.create("b", "", &[0x00, 0b0100_0000]).await.unwrap();

    let (_, vals) = s.atomic("b", atomic::BIT_CLEAR, &[]).await.unwrap();
    assert_eq!(vals[0], vec![0x00, 0x00]);
    assert_eq!(vals[1], 14u32.to_le_bytes().to_vec());

    assert!(matches!(
        s.atomic("b", atomic::BIT_CLEAR, &[]).await.unwrap_err(),
        Error::Invalid(_)
    ));
}

#[tokio::test]
async fn atomic_append_remove_restores() {
    let s = MemStore::new();
    s.create("k", "", b"hello").await.unwrap();

    s.atomic("k", atomic::APPEND, &[b"-x".to_vec()]).await.unwrap();
    let (_, vals) = s.atomic("k", atomic::REMOVE, &[b"-x".to_vec()]).await.unwrap();
    assert_eq!(vals[0], b"hello".to_vec());
}

#[tokio::test]
async fn atomic_remove_no_match_keeps_version() {
    let s = MemStore::new();
    s.create("k", "", b"abc").await.unwrap();

    let (ver, vals) = s.atomic("k", atomic::REMOVE, &[b"zz".to_vec()]).await.unwrap();
    assert_eq!(ver, 1, "no match must not advance the version");
    assert_eq!(vals[0], b"abc".to_vec());
}

#[tokio::test]
async fn atomic_replace_all_matches() {
    let s = MemStore::new();
    s.create("k", "", b"ab-ab-ab").await.unwrap();

    let (ver, vals) = s
        .atomic("k", atomic::REPLACE, &[b"ab".to_vec(), b"xy".to_vec()])
        .await
        .unwrap();
    assert_eq!(ver, 2);
    assert_eq!(vals[0], b"xy-xy-xy".to_vec());

    // identity replacement is a version no-op even when matches exist
    let (ver, _) = s
        .atomic("k", atomic::REPLACE, &[b"xy".to_vec(), b"xy".to_vec()])
        .await
        .unwrap();
    assert_eq!(ver, 2);
}

#[tokio::test]
async fn atomic_unknown_op_is_invalid() {
    let s = MemStore::new();
    s.create("k", "", b"v").await.unwrap();
    assert!(matches!(
        s.atomic("k", 99, &[]).await.unwrap_err(),
        Error::Invalid(_)
    ));
}

#[tokio::test]
async fn atomic_mutation_wakes_waiters() {
    let s = MemStore::new();
    s.create("k", "", b"a").await.unwrap();

    let waiter = {
        let s = s.clone();
        tokio::spawn(async move { s.get("k", 2).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    s.atomic("k", atomic::APPEND, &[b"b".to_vec()]).await.unwrap();
    assert_eq!(waiter.await.unwrap().unwrap(), (2, b"ab".to_vec()));
}

// ============================================================
// EXPORT / IMPORT
// ============================================================

#[tokio::test]
async fn export_import_moves_entries() {
    let src = MemStore::new();
    let dst = MemStore::new();
    src.create("move/a", "", b"1").await.unwrap();
    src.create("move/b", "", b"2").await.unwrap();
    src.set("move/b", b"22").await.unwrap();
    src.create("stay", "", b"3").await.unwrap();

    let packed = src.export_entries(|k| k.starts_with("move/"));
    assert_eq!(src.get("move/a", version::ANY).await.unwrap_err(), Error::NoEntry);
    assert!(src.get("stay", version::ANY).await.is_ok());

    let rejected = dst.import_entries(&packed, false).unwrap();
    assert!(rejected.is_empty());
    assert_eq!(dst.get("move/a", version::ANY).await.unwrap(), (1, b"1".to_vec()));
    // imported entries keep their source versions
    assert_eq!(dst.get("move/b", version::ANY).await.unwrap(), (2, b"22".to_vec()));
}

#[tokio::test]
async fn import_without_replace_reports_collisions() {
    let a = MemStore::new();
    let b = MemStore::new();
    a.create("k", "", b"from-a").await.unwrap();
    b.create("k", "", b"from-b").await.unwrap();

    let packed = a.export_entries(|k| k == "k");
    let rejected = b.import_entries(&packed, false).unwrap();
    assert_eq!(rejected, vec!["k".to_string()]);
    assert_eq!(b.get("k", version::ANY).await.unwrap().1, b"from-b".to_vec());

    let packed = vec![1, 2, 3];
    assert!(b.import_entries(&packed, false).is_err());
}

fn _assert_store_is_send_sync(s: Arc<MemStore>) -> Arc<dyn Hop> {
    s
}
