//! Write-through cache in front of any op graph.
//!
//! Holds recently seen `(version, value)` pairs in an LRU bounded by both
//! element count and byte size (key bytes + value bytes). Reads newer than
//! the cached version pass through and refresh the entry; every successful
//! write refreshes it with the value that was just written, so a client
//! always observes its own writes through the cache.
//!
//! ## Domains
//! With a relay configured, keys written as `#/cache/<D>/KEY` are sent
//! (rewritten to `#/chop/<D>/KEY`) over a collocated range router to the
//! peers publishing domain `D`; a receiving cache strips the prefix and
//! applies the operation to its backing store. Each domain thereby shares
//! one coherent cache fleet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use lru::LruCache;

use crate::error::{Error, Result};
use crate::ops::{atomic, version, Hop};
use crate::range::RangeRouter;

#[cfg(test)]
mod tests;

const CACHE_PREFIX: &str = "#/cache/";
const CHOP_PREFIX: &str = "#/chop/";

struct CacheInner {
    lru: LruCache<String, (u64, Vec<u8>)>,
    memsz: u64,
}

pub struct Cache {
    hop: Arc<dyn Hop>,
    maxmem: u64,
    maxelem: usize,
    inner: Mutex<CacheInner>,
    relay: OnceLock<Arc<RangeRouter>>,

    hits: AtomicU64,
    drops: AtomicU64,
    dsent: AtomicU64,
    drecv: AtomicU64,
}

/// What the key prefix says about an operation.
enum Routing {
    /// Plain key: serve from cache and the backing store.
    Local(String),
    /// `#/cache/...`: relay to the domain's peer group as `#/chop/...`.
    Relay(String),
}

impl Cache {
    pub fn new(hop: Arc<dyn Hop>, maxmem: u64, maxelem: usize) -> Arc<Cache> {
        Arc::new(Cache {
            hop,
            maxmem,
            maxelem,
            inner: Mutex::new(CacheInner {
                lru: LruCache::unbounded(),
                memsz: 0,
            }),
            relay: OnceLock::new(),
            hits: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            dsent: AtomicU64::new(0),
            drecv: AtomicU64::new(0),
        })
    }

    /// A cache participating in a domain fleet: `#/cache/...` keys relay over
    /// a collocated range router whose backing store is this cache.
    pub async fn with_relay(
        hop: Arc<dyn Hop>,
        maxmem: u64,
        maxelem: usize,
        proto: &str,
        listen_addr: &str,
        master_addr: &str,
    ) -> Result<Arc<Cache>> {
        let cache = Cache::new(hop, maxmem, maxelem);
        let relay =
            RangeRouter::new(proto, listen_addr, master_addr, Some(cache.clone() as Arc<dyn Hop>))
                .await?;
        let _ = cache.relay.set(relay);
        Ok(cache)
    }

    pub fn relay(&self) -> Option<&Arc<RangeRouter>> {
        self.relay.get()
    }

    /// Decides where an operation goes and under which key.
    fn route(&self, key: &str) -> Result<Routing> {
        if self.relay.get().is_some() {
            if let Some(rest) = key.strip_prefix(CACHE_PREFIX) {
                self.dsent.fetch_add(1, Ordering::Relaxed);
                return Ok(Routing::Relay(format!("{}{}", CHOP_PREFIX, rest)));
            }
        }

        if let Some(rest) = key.strip_prefix(CHOP_PREFIX) {
            // incoming domain traffic: drop the domain name, apply locally
            let key = rest
                .split_once('/')
                .map(|(_, k)| k)
                .ok_or_else(|| Error::invalid("invalid cache entry"))?;
            self.drecv.fetch_add(1, Ordering::Relaxed);
            return Ok(Routing::Local(key.to_string()));
        }

        Ok(Routing::Local(key.to_string()))
    }

    fn relay_hop(&self) -> Result<Arc<RangeRouter>> {
        self.relay.get().cloned().ok_or(Error::Disconnected)
    }

    fn get_entry(&self, key: &str) -> Option<(u64, Vec<u8>)> {
        let mut inner = self.inner.lock().expect("cache poisoned");
        let hit = inner.lru.get(key).cloned();
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }

        hit
    }

    fn update_entry(&self, key: &str, ver: u64, val: &[u8]) {
        let sz = (key.len() + val.len()) as u64;
        let mut inner = self.inner.lock().expect("cache poisoned");

        if let Some((_, old)) = inner.lru.pop(key) {
            inner.memsz -= (key.len() + old.len()) as u64;
        }

        // an entry that can never fit is not worth evicting everything for
        if sz > self.maxmem {
            self.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        inner.lru.put(key.to_string(), (ver, val.to_vec()));
        inner.memsz += sz;

        while inner.lru.len() > self.maxelem || inner.memsz > self.maxmem {
            let Some((k, (_, v))) = inner.lru.pop_lru() else {
                break;
            };

            inner.memsz -= (k.len() + v.len()) as u64;
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn remove_entry(&self, key: &str) {
        let mut inner = self.inner.lock().expect("cache poisoned");
        if let Some((_, old)) = inner.lru.pop(key) {
            inner.memsz -= (key.len() + old.len()) as u64;
        }
    }

    /// (elements, bytes) currently cached.
    pub fn usage(&self) -> (usize, u64) {
        let inner = self.inner.lock().expect("cache poisoned");
        (inner.lru.len(), inner.memsz)
    }

    pub fn stats(&self) -> String {
        let (elems, mem) = self.usage();
        format!(
            "Cache Elements: {}\nCache Size: {}\nCache Hits: {}\nCache Drops: {}\nCache Domain Sent: {}\nCache Domain Recv: {}\n",
            elems,
            mem,
            self.hits.load(Ordering::Relaxed),
            self.drops.load(Ordering::Relaxed),
            self.dsent.load(Ordering::Relaxed),
            self.drecv.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl Hop for Cache {
    async fn create(&self, key: &str, flags: &str, value: &[u8]) -> Result<u64> {
        let key = match self.route(key)? {
            Routing::Relay(k) => return self.relay_hop()?.create(&k, flags, value).await,
            Routing::Local(k) => k,
        };

        let ver = self.hop.create(&key, flags, value).await?;
        if ver != version::ANY {
            self.update_entry(&key, ver, value);
        }

        Ok(ver)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = match self.route(key)? {
            Routing::Relay(k) => return self.relay_hop()?.remove(&k).await,
            Routing::Local(k) => k,
        };

        self.hop.remove(&key).await?;
        self.remove_entry(&key);
        Ok(())
    }

    async fn get(&self, key: &str, ver: u64) -> Result<(u64, Vec<u8>)> {
        let key = match self.route(key)? {
            Routing::Relay(k) => return self.relay_hop()?.get(&k, ver).await,
            Routing::Local(k) => k,
        };

        if let Some((cver, cval)) = self.get_entry(&key) {
            if ver == version::ANY || cver > ver {
                return Ok((cver, cval));
            }
        }

        let (nver, nval) = self.hop.get(&key, ver).await?;
        if nver != version::ANY {
            self.update_entry(&key, nver, &nval);
        }

        Ok((nver, nval))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<u64> {
        let key = match self.route(key)? {
            Routing::Relay(k) => return self.relay_hop()?.set(&k, value).await,
            Routing::Local(k) => k,
        };

        let ver = self.hop.set(&key, value).await?;
        if ver != version::ANY {
            self.update_entry(&key, ver, value);
        }

        Ok(ver)
    }

    async fn testset(
        &self,
        key: &str,
        oldversion: u64,
        oldvalue: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(u64, Vec<u8>)> {
        let key = match self.route(key)? {
            Routing::Relay(k) => {
                return self
                    .relay_hop()?
                    .testset(&k, oldversion, oldvalue, value)
                    .await
            }
            Routing::Local(k) => k,
        };

        let (ver, val) = self.hop.testset(&key, oldversion, oldvalue, value).await?;
        if ver != version::ANY {
            self.update_entry(&key, ver, &val);
        }

        Ok((ver, val))
    }

    async fn atomic(&self, key: &str, op: u16, values: &[Vec<u8>]) -> Result<(u64, Vec<Vec<u8>>)> {
        let key = match self.route(key)? {
            Routing::Relay(k) => return self.relay_hop()?.atomic(&k, op, values).await,
            Routing::Local(k) => k,
        };

        let (ver, vals) = self.hop.atomic(&key, op, values).await?;
        if ver == version::ANY {
            return Ok((ver, vals));
        }

        // ops whose first result is the entry's new value refresh the cache
        match op {
            atomic::ADD
            | atomic::SUB
            | atomic::BIT_SET
            | atomic::BIT_CLEAR
            | atomic::APPEND
            | atomic::REMOVE
            | atomic::REPLACE => {
                if let Some(val) = vals.first() {
                    self.update_entry(&key, ver, val);
                }
            }
            _ => {}
        }

        Ok((ver, vals))
    }
}
