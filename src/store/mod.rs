//! Versioned entry store: the leaf of every op graph.
//!
//! ## Core concepts
//! - **Entry**: one key's state, a 63-bit monotonically increasing version
//!   and an opaque value, held in a `tokio::sync::watch` channel so that
//!   readers can block until a requested version exists.
//! - **Placeholders**: a `get` for a version of a key that doesn't exist yet
//!   installs an entry at version `ANY` and waits on it; the eventual
//!   `create` upgrades the placeholder in place and wakes the waiters.
//! - **Removal**: waiters of a removed entry observe the `REMOVED` sentinel
//!   and report `NoEntry`; they never re-read entry state afterwards.
//! - **Virtual entries**: `#/...` keys attach an [`EntryOps`] handler to an
//!   ordinary entry; the map lookup and wait protocol run on the entry, the
//!   handler computes the operation against host state.
//!
//! The store installs `#/id`, `#/keys` (with the `#/keys:REGEX` filtered
//! form) and `#/keynum`, bumping the latter two on every successful create
//! or remove so blocked readers observe churn.

pub mod atomic;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use regex::Regex;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::ops::{version, Hop};
use crate::wire::codec::{put_blob, put_str, put_u64, Reader};

#[cfg(test)]
mod tests;

/// The watched portion of an entry: what mutates and what waiters observe.
pub struct EntryState {
    pub version: u64,
    pub value: Vec<u8>,
}

impl EntryState {
    /// Advances the version, wrapping from `HIGHEST` back to `LOWEST`.
    pub fn increase_version(&mut self) {
        self.version += 1;
        if self.version > version::HIGHEST {
            self.version = version::LOWEST;
        }
    }
}

/// Operations a virtual entry can implement. The host entry is passed in so
/// handlers can serve its version and advance it; unimplemented operations
/// fall back to `Permission`, which makes an entry read-only by default.
#[async_trait]
pub trait EntryOps: Send + Sync {
    async fn get(&self, _entry: &Entry, _key: &str, _version: u64) -> Result<(u64, Vec<u8>)> {
        Err(Error::Permission)
    }

    async fn set(&self, _entry: &Entry, _key: &str, _value: &[u8]) -> Result<u64> {
        Err(Error::Permission)
    }

    async fn testset(
        &self,
        _entry: &Entry,
        _key: &str,
        _oldversion: u64,
        _oldvalue: Option<&[u8]>,
        _value: &[u8],
    ) -> Result<(u64, Vec<u8>)> {
        Err(Error::Permission)
    }

    async fn atomic(
        &self,
        _entry: &Entry,
        _key: &str,
        _op: u16,
        _values: &[Vec<u8>],
    ) -> Result<(u64, Vec<Vec<u8>>)> {
        Err(Error::Permission)
    }
}

pub struct Entry {
    state: watch::Sender<EntryState>,
    ops: Option<Arc<dyn EntryOps>>,
}

impl Entry {
    pub fn new(ver: u64, value: Vec<u8>, ops: Option<Arc<dyn EntryOps>>) -> Entry {
        let (state, _) = watch::channel(EntryState {
            version: ver,
            value,
        });

        Entry { state, ops }
    }

    fn placeholder() -> Entry {
        Entry::new(version::ANY, Vec::new(), None)
    }

    pub fn version(&self) -> u64 {
        self.state.borrow().version
    }

    pub fn snapshot(&self) -> (u64, Vec<u8>) {
        let st = self.state.borrow();
        (st.version, st.value.clone())
    }

    fn is_placeholder(&self) -> bool {
        self.version() == version::ANY
    }

    /// Runs `f` against the entry state; `f` returns its result and whether
    /// the state changed (waiters are only woken on a change).
    pub fn modify<R>(&self, f: impl FnOnce(&mut EntryState) -> (R, bool)) -> R {
        let mut ret = None;
        self.state.send_if_modified(|st| {
            let (r, changed) = f(st);
            ret = Some(r);
            changed
        });

        ret.expect("modify closure always runs")
    }

    /// Advances the version in place, waking waiters. Used by the virtual
    /// key-churn counters.
    pub fn bump(&self) {
        self.modify(|st| {
            st.increase_version();
            ((), true)
        });
    }

    /// Stores a new value at the next version, waking waiters.
    pub fn set_value(&self, value: &[u8]) -> u64 {
        self.modify(|st| {
            st.increase_version();
            st.value = value.to_vec();
            (st.version, true)
        })
    }

    /// Overwrites version and value wholesale, waking waiters. Used when
    /// mirroring externally versioned state (a fetched `#/conf`).
    pub fn set_entry(&self, ver: u64, value: &[u8]) {
        self.modify(|st| {
            st.version = ver;
            st.value = value.to_vec();
            ((), true)
        });
    }

    fn mark_removed(&self) {
        self.modify(|st| {
            st.version = version::REMOVED;
            st.value = Vec::new();
            ((), true)
        });
    }

    /// Turns a placeholder into a live entry. Returns false if the entry was
    /// already live.
    fn create_from_placeholder(&self, value: &[u8]) -> bool {
        self.modify(|st| {
            if st.version != version::ANY {
                return (false, false);
            }

            st.version = version::LOWEST;
            st.value = value.to_vec();
            (true, true)
        })
    }

    /// The waiter protocol: blocks until the entry satisfies `requested`.
    /// `ANY`/`NEWEST` never block, `PAST_NEWEST` waits for the version after
    /// the current one, a numeric version waits until the entry reaches it.
    /// Removal while waiting (or a still-placeholder entry) is `NoEntry`.
    pub async fn wait_version(&self, requested: u64) -> Result<(u64, Vec<u8>)> {
        let mut rx = self.state.subscribe();
        let want = {
            let st = rx.borrow();
            match requested {
                version::PAST_NEWEST => st.version.wrapping_add(1),
                version::ANY | version::NEWEST => st.version,
                v => v,
            }
        };

        let st = rx
            .wait_for(|st| st.version == version::REMOVED || st.version >= want)
            .await
            .map_err(|_| Error::NoEntry)?;

        if st.version == version::REMOVED || st.version == version::ANY {
            return Err(Error::NoEntry);
        }

        Ok((st.version, st.value.clone()))
    }

    /// Test-and-set against a data entry. Mismatch leaves the entry
    /// untouched and reports the pre-existing version with the current
    /// value.
    fn apply_testset(
        &self,
        oldversion: u64,
        oldvalue: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(u64, Vec<u8>)> {
        if oldversion != version::ANY
            && !(version::LOWEST..=version::HIGHEST).contains(&oldversion)
        {
            return Err(Error::invalid("invalid version"));
        }

        self.modify(|st| {
            if oldversion != version::ANY && oldversion != st.version {
                return (Ok((st.version, st.value.clone())), false);
            }

            if let Some(old) = oldvalue {
                if old != st.value.as_slice() {
                    return (Ok((st.version, st.value.clone())), false);
                }
            }

            st.increase_version();
            st.value = value.to_vec();
            (Ok((st.version, st.value.clone())), true)
        })
    }

    /// Atomic read-modify-write against a data entry.
    fn apply_atomic(&self, op: u16, values: &[Vec<u8>]) -> Result<(u64, Vec<Vec<u8>>)> {
        self.modify(|st| match atomic::apply(op, &st.value, values) {
            Ok((newval, rets)) => {
                let changed = newval.is_some();
                if let Some(nv) = newval {
                    st.increase_version();
                    st.value = nv;
                }

                (Ok((st.version, rets)), changed)
            }
            Err(e) => (Err(e), false),
        })
    }
}

/// In-memory versioned map with waiters and local meta-entries.
pub struct MemStore {
    entries: DashMap<String, Arc<Entry>>,
    keys_entry: Arc<Entry>,
    keynum_entry: Arc<Entry>,
}

impl MemStore {
    pub fn new() -> Arc<MemStore> {
        MemStore::with_id("mem")
    }

    /// Creates a store whose `#/id` reports the given kind string.
    pub fn with_id(id: &str) -> Arc<MemStore> {
        Arc::new_cyclic(|weak: &Weak<MemStore>| {
            let keys_entry = Arc::new(Entry::new(
                version::LOWEST,
                Vec::new(),
                Some(Arc::new(KeysOps {
                    store: weak.clone(),
                })),
            ));
            let keynum_entry = Arc::new(Entry::new(
                version::LOWEST,
                Vec::new(),
                Some(Arc::new(KeynumOps {
                    store: weak.clone(),
                })),
            ));

            let s = MemStore {
                entries: DashMap::new(),
                keys_entry: keys_entry.clone(),
                keynum_entry: keynum_entry.clone(),
            };

            s.entries.insert(
                "#/id".to_string(),
                Arc::new(Entry::new(
                    version::LOWEST,
                    id.as_bytes().to_vec(),
                    Some(Arc::new(ReadOnlyOps)),
                )),
            );
            s.entries.insert("#/keys".to_string(), keys_entry);
            s.entries.insert("#/keynum".to_string(), keynum_entry);
            s
        })
    }

    /// Installs an entry directly, bypassing the reserved-key check. Used
    /// by layers hosting their own `#/...` entries. Without a handler the
    /// entry is read-only through the op surface; the owning layer mutates
    /// it through the returned handle. A waited-on placeholder upgrades in
    /// place.
    pub fn add_entry(
        &self,
        key: &str,
        value: &[u8],
        ops: Option<Arc<dyn EntryOps>>,
    ) -> Result<Arc<Entry>> {
        let ops = ops.unwrap_or_else(|| Arc::new(ReadOnlyOps));
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(oe) => {
                let e = oe.get().clone();

                if e.create_from_placeholder(value) {
                    Ok(e)
                } else {
                    Err(Error::Exists)
                }
            }
            MapEntry::Vacant(ve) => {
                let e = Arc::new(Entry::new(version::LOWEST, value.to_vec(), Some(ops)));
                ve.insert(e.clone());
                Ok(e)
            }
        }
    }

    /// Removes an entry, waking its waiters with `REMOVED`. Placeholders
    /// don't count as live entries.
    pub fn remove_entry(&self, key: &str) -> Result<()> {
        let (_, e) = self
            .entries
            .remove_if(key, |_, e| !e.is_placeholder())
            .ok_or(Error::NoEntry)?;

        e.mark_removed();
        Ok(())
    }

    /// Number of live (non-placeholder) entries, meta-entries included.
    pub fn num_entries(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.value().is_placeholder())
            .count()
    }

    fn lookup_live(&self, key: &str) -> Result<Arc<Entry>> {
        let e = self.entries.get(key).ok_or(Error::NoEntry)?.value().clone();
        if e.is_placeholder() {
            return Err(Error::NoEntry);
        }

        Ok(e)
    }

    fn keys_modified(&self) {
        self.keys_entry.bump();
        self.keynum_entry.bump();
    }

    /// NUL-separated key listing, optionally filtered by an anchored regex.
    fn keys_value(&self, re: Option<&Regex>) -> Vec<u8> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_placeholder())
            .map(|e| e.key().clone())
            .filter(|k| re.map_or(true, |re| re.is_match(k)))
            .collect();
        keys.sort();

        keys.join("\0").into_bytes()
    }

    fn keys_regex(key: &str) -> Result<Option<Regex>> {
        match key.strip_prefix("#/keys:") {
            Some(pat) => {
                let re = Regex::new(&format!("^(?:{})$", pat))
                    .map_err(|e| Error::invalid(format!("bad key regex: {}", e)))?;
                Ok(Some(re))
            }
            None => Ok(None),
        }
    }

    /// Packs and removes every matching data entry as
    /// `key[s] version[8] value[n]` records; waiters of exported entries are
    /// woken with `REMOVED`. Handler-backed entries stay put.
    pub fn export_entries(&self, matches: impl Fn(&str) -> bool) -> Vec<u8> {
        let victims: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().ops.is_none() && matches(e.key()))
            .map(|e| e.key().clone())
            .collect();

        let mut out = Vec::new();
        let mut removed = false;
        for key in victims {
            let Some((_, e)) = self.entries.remove_if(&key, |_, e| e.ops.is_none()) else {
                continue;
            };

            let (ver, val) = e.snapshot();
            if ver != version::ANY && ver != version::REMOVED {
                let mut rec = Vec::with_capacity(key.len() + val.len() + 14);
                if put_str(&mut rec, &key).is_ok() {
                    put_u64(&mut rec, ver);
                    if put_blob(&mut rec, Some(&val)).is_ok() {
                        out.extend_from_slice(&rec);
                        removed = true;
                    }
                }
            }

            e.mark_removed();
        }

        if removed {
            self.keys_modified();
        }

        out
    }

    /// Re-imports records produced by [`export_entries`]. With `replace`
    /// false, colliding keys are left alone and returned.
    pub fn import_entries(&self, mut data: &[u8], replace: bool) -> Result<Vec<String>> {
        let mut rejected = Vec::new();
        let mut imported = false;

        while !data.is_empty() {
            let mut r = Reader::new(data);
            let key = r.str().map_err(|_| Error::invalid("invalid entries"))?;
            let ver = r.u64().map_err(|_| Error::invalid("invalid entries"))?;
            let val = r
                .blob()
                .map_err(|_| Error::invalid("invalid entries"))?
                .unwrap_or_default();
            data = r.rest();

            match self.entries.entry(key.clone()) {
                MapEntry::Occupied(mut oe) => {
                    if !replace && !oe.get().is_placeholder() {
                        rejected.push(key);
                        continue;
                    }

                    let old = oe.insert(Arc::new(Entry::new(ver, val, None)));
                    old.mark_removed();
                    imported = true;
                }
                MapEntry::Vacant(ve) => {
                    ve.insert(Arc::new(Entry::new(ver, val, None)));
                    imported = true;
                }
            }
        }

        if imported {
            self.keys_modified();
        }

        Ok(rejected)
    }
}

#[async_trait]
impl Hop for MemStore {
    async fn create(&self, key: &str, _flags: &str, value: &[u8]) -> Result<u64> {
        if key.starts_with("#/") {
            return Err(Error::Permission);
        }

        self.add_entry(key, value, None)?;
        self.keys_modified();
        Ok(version::LOWEST)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if key.starts_with("#/") {
            return Err(Error::Permission);
        }

        self.remove_entry(key)?;
        self.keys_modified();
        Ok(())
    }

    async fn get(&self, key: &str, ver: u64) -> Result<(u64, Vec<u8>)> {
        // filtered listings are served directly, without the wait protocol
        if let Some(re) = MemStore::keys_regex(key)? {
            return Ok((self.keys_entry.version(), self.keys_value(Some(&re))));
        }

        let e = match self.entries.get(key) {
            Some(e) => e.value().clone(),
            None => {
                if ver == version::ANY || ver == version::NEWEST {
                    return Err(Error::NoEntry);
                }

                // install a placeholder everybody can wait on
                self.entries
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Entry::placeholder()))
                    .value()
                    .clone()
            }
        };

        let (cur, val) = e.wait_version(ver).await?;
        match &e.ops {
            Some(ops) => ops.get(&e, key, ver).await,
            None => Ok((cur, val)),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<u64> {
        let e = self.lookup_live(key)?;
        match &e.ops {
            Some(ops) => ops.set(&e, key, value).await,
            None => {
                let (ver, _) = e.apply_testset(version::ANY, None, value)?;
                Ok(ver)
            }
        }
    }

    async fn testset(
        &self,
        key: &str,
        oldversion: u64,
        oldvalue: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(u64, Vec<u8>)> {
        let e = self.lookup_live(key)?;
        match &e.ops {
            Some(ops) => ops.testset(&e, key, oldversion, oldvalue, value).await,
            None => e.apply_testset(oldversion, oldvalue, value),
        }
    }

    async fn atomic(&self, key: &str, op: u16, values: &[Vec<u8>]) -> Result<(u64, Vec<Vec<u8>>)> {
        let e = self.lookup_live(key)?;
        match &e.ops {
            Some(ops) => ops.atomic(&e, key, op, values).await,
            None => e.apply_atomic(op, values),
        }
    }
}

/// Installed entries with no handler of their own: readable, and mutated
/// only by the hosting layer through the entry handle.
struct ReadOnlyOps;

#[async_trait]
impl EntryOps for ReadOnlyOps {
    async fn get(&self, entry: &Entry, _key: &str, _version: u64) -> Result<(u64, Vec<u8>)> {
        Ok(entry.snapshot())
    }
}

/// `#/keys` and `#/keys:REGEX`: the current key set, NUL-separated.
struct KeysOps {
    store: Weak<MemStore>,
}

#[async_trait]
impl EntryOps for KeysOps {
    async fn get(&self, entry: &Entry, key: &str, _version: u64) -> Result<(u64, Vec<u8>)> {
        let store = self.store.upgrade().ok_or(Error::NoEntry)?;
        let re = MemStore::keys_regex(key)?;
        Ok((entry.version(), store.keys_value(re.as_ref())))
    }
}

/// `#/keynum`: the live entry count as a decimal string.
struct KeynumOps {
    store: Weak<MemStore>,
}

#[async_trait]
impl EntryOps for KeynumOps {
    async fn get(&self, entry: &Entry, _key: &str, _version: u64) -> Result<(u64, Vec<u8>)> {
        let store = self.store.upgrade().ok_or(Error::NoEntry)?;
        Ok((
            entry.version(),
            store.num_entries().to_string().into_bytes(),
        ))
    }
}
