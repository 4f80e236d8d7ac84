//! Chord router: a 64-bit consistent-hash ring with strong stabilization.
//!
//! ## Ring structure
//! Every peer's id is the hash of its listen address. `finger[k]` holds the
//! successor of `self + 2^k`; `finger[0]` is the immediate successor. A
//! predecessor slot and a second-successor slot (`successor1`) implement
//! the strong stabilization variant: a node only counts as `oncycle` once
//! its successor chain leads back to itself.
//!
//! ## Routing
//! An operation on a key forwards to the closest known node preceding the
//! key's hash; that node routes again, so requests walk the ring in
//! O(log N) hops. `#/...` keys are always resolved locally first.
//!
//! ## Maintenance
//! One background proc per peer alternates stabilization and finger
//! repair. Its period adapts: two consecutive passes with modifications
//! halve it (floor 10 ms), eight quiet passes grow it by a third (cap
//! 1 s); `ring_modified` nudges the proc immediately. A closed connection
//! is scrubbed from every slot it occupies, and the next pass repairs the
//! ring around it.

pub mod entries;
pub mod hash;
pub mod node;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{Client, HopLink};
use crate::error::{Error, Result};
use crate::ops::{atomic, version, Hop};
use crate::chord::hash::{get_keyhash, KeyHash, DEFAULT_KEYHASH};
use crate::chord::node::{between, parse_spec, same_node, Node};
use crate::server::Server;
use crate::store::MemStore;
use crate::transport;

#[cfg(test)]
mod tests;

/// Combined read-predecessor / propose-predecessor atomic op, defined on
/// `#/chord/predecessor`.
pub const PRED_AND_NOTIFY: u16 = atomic::REPLACE + 1;

const FINGERS: usize = 64;
const STABILIZE_START: Duration = Duration::from_millis(20);
const STABILIZE_MIN: Duration = Duration::from_millis(10);
const STABILIZE_MAX: Duration = Duration::from_secs(1);

struct RingState {
    finger: Vec<Option<Arc<Node>>>,
    predecessor: Option<Arc<Node>>,
    successor1: Option<Arc<Node>>,
}

pub struct ChordRouter {
    proto: String,
    serving: bool,
    addr: RwLock<String>,
    hop: Option<Arc<dyn Hop>>,
    srv: OnceLock<Arc<Server>>,
    lents: Arc<MemStore>,
    khash_entry: OnceLock<Arc<crate::store::Entry>>,
    keyhash: RwLock<&'static KeyHash>,
    selfnode: OnceLock<Arc<Node>>,
    ring: RwLock<RingState>,
    nodecache: Mutex<HashMap<String, Arc<Node>>>,
    modtx: mpsc::Sender<()>,
    modrx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    closed: AtomicBool,
    self_weak: OnceLock<Weak<ChordRouter>>,
}

impl ChordRouter {
    /// Creates a ring member. With a `listen_addr` the node serves its arc
    /// of the ring from `hop`; with an empty one it only routes.
    /// `node_addr` names any existing member to join through; empty (or
    /// equal to the listen address) starts a fresh ring.
    pub async fn new(
        proto: &str,
        listen_addr: &str,
        node_addr: &str,
        hop: Option<Arc<dyn Hop>>,
    ) -> Result<Arc<ChordRouter>> {
        let serving = !listen_addr.is_empty();
        if serving && hop.is_none() {
            return Err(Error::invalid("a serving chord router needs a backing store"));
        }

        let id = match &hop {
            Some(h) => match h.get("#/id", version::ANY).await {
                Ok((_, v)) => format!("chord ({})", String::from_utf8_lossy(&v)),
                Err(_) => "chord".to_string(),
            },
            None => "chord".to_string(),
        };

        let keyhash =
            get_keyhash(DEFAULT_KEYHASH).ok_or_else(|| Error::invalid("no default hash"))?;
        let (modtx, modrx) = mpsc::channel(4);
        let router = Arc::new(ChordRouter {
            proto: proto.to_string(),
            serving,
            addr: RwLock::new(String::new()),
            hop,
            srv: OnceLock::new(),
            lents: MemStore::with_id(&id),
            khash_entry: OnceLock::new(),
            keyhash: RwLock::new(keyhash),
            selfnode: OnceLock::new(),
            ring: RwLock::new(RingState {
                finger: vec![None; FINGERS],
                predecessor: None,
                successor1: None,
            }),
            nodecache: Mutex::new(HashMap::new()),
            modtx,
            modrx: tokio::sync::Mutex::new(Some(modrx)),
            closed: AtomicBool::new(false),
            self_weak: OnceLock::new(),
        });
        let _ = router.self_weak.set(Arc::downgrade(&router));
        ChordRouter::install_entries(&router)?;

        if serving {
            let srv = Server::new(router.clone());
            let bound = transport::listen(proto, listen_addr, srv.clone()).await?;
            *router.addr.write().expect("router addr poisoned") = bound;
            let _ = router.srv.set(srv);
        }

        // a boot node hands us the ring's hash function; a fresh ring uses
        // the default and starts out strongly stabilized
        let boot = if node_addr.is_empty() || node_addr == router.addr() {
            None
        } else {
            let clnt = Client::connect(proto, node_addr).await?;
            let (_, khash) = clnt.get("#/keyhash", version::ANY).await?;
            let name =
                String::from_utf8(khash.clone()).map_err(|_| Error::invalid("bad keyhash"))?;
            let kh = get_keyhash(&name)
                .ok_or_else(|| Error::invalid("unknown key hash function"))?;
            *router.keyhash.write().expect("router keyhash poisoned") = kh;
            if let Some(e) = router.khash_entry.get() {
                e.set_value(&khash);
            }

            Some(clnt)
        };

        let addr = router.addr();
        let self_id = router.keyhash.read().expect("router keyhash poisoned").hash(&addr);
        let selfnode = Arc::new(Node::local(
            self_id,
            addr.clone(),
            router.hop.clone().map(HopLink::Local),
        ));
        selfnode.set_oncycle(boot.is_none());
        router
            .nodecache
            .lock()
            .expect("node cache poisoned")
            .insert(addr.clone(), selfnode.clone());
        let _ = router.selfnode.set(selfnode);

        if let Some(clnt) = boot {
            let res = router.join(HopLink::Remote(clnt.clone())).await;
            clnt.close();
            res?;
        }

        let proc = router.clone();
        tokio::spawn(async move { proc.stabilizeproc().await });

        info!(
            "chord node {:016x} up at '{}'",
            router.selfnode().id,
            router.addr()
        );
        Ok(router)
    }

    /// Connects a routing-only client to an existing ring.
    pub async fn connect(proto: &str, addr: &str) -> Result<Arc<ChordRouter>> {
        ChordRouter::new(proto, "", addr, None).await
    }

    fn install_entries(router: &Arc<ChordRouter>) -> Result<()> {
        let weak = Arc::downgrade(router);
        let khash = router
            .lents
            .add_entry("#/keyhash", DEFAULT_KEYHASH.as_bytes(), None)?;
        let _ = router.khash_entry.set(khash);
        router.lents.add_entry(
            "#/chord/id",
            b"",
            Some(Arc::new(entries::IdOps { router: weak.clone() })),
        )?;
        router.lents.add_entry(
            "#/chord/successor",
            b"",
            Some(Arc::new(entries::SuccOps { router: weak.clone() })),
        )?;
        router.lents.add_entry(
            "#/chord/predecessor",
            b"",
            Some(Arc::new(entries::PredOps { router: weak.clone() })),
        )?;
        router.lents.add_entry(
            "#/chord/finger",
            b"",
            Some(Arc::new(entries::FingerOps { router: weak.clone() })),
        )?;
        router.lents.add_entry(
            "#/chord/ring",
            b"",
            Some(Arc::new(entries::RingOps { router: weak.clone() })),
        )?;
        router.lents.add_entry(
            "#/chord/stack",
            b"",
            Some(Arc::new(entries::StackOps { router: weak })),
        )?;
        Ok(())
    }

    pub fn addr(&self) -> String {
        self.addr.read().expect("router addr poisoned").clone()
    }

    pub fn selfnode(&self) -> &Arc<Node> {
        self.selfnode.get().expect("self node set at construction")
    }

    /// True once strong stabilization sees the successor chain cycle back.
    pub fn oncycle(&self) -> bool {
        self.selfnode().oncycle()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(srv) = self.srv.get() {
            srv.shutdown();
        }

        let nodes: Vec<Arc<Node>> = self
            .nodecache
            .lock()
            .expect("node cache poisoned")
            .values()
            .cloned()
            .collect();

        for nd in nodes {
            if let HopLink::Remote(c) = match nd.try_link() {
                Some(l) => l,
                None => continue,
            } {
                c.close();
            }
        }
    }

    /// Finds or creates the cached node for a spec; the cache is the single
    /// owner of every node.
    fn new_node(&self, spec: &str) -> Result<Arc<Node>> {
        let (id, addr, oncycle) = parse_spec(spec)?;
        let mut cache = self.nodecache.lock().expect("node cache poisoned");
        let nd = cache
            .entry(addr.clone())
            .or_insert_with(|| Arc::new(Node::new(id, addr)))
            .clone();

        if oncycle {
            nd.set_oncycle(true);
        }

        Ok(nd)
    }

    async fn node_connect(&self, nd: &Arc<Node>) -> Result<()> {
        nd.connect(&self.proto).await?;
        self.nodecache
            .lock()
            .expect("node cache poisoned")
            .insert(nd.addr.clone(), nd.clone());
        Ok(())
    }

    async fn node_disconnect(&self, nd: &Arc<Node>) {
        if nd.disconnect().await {
            let mut cache = self.nodecache.lock().expect("node cache poisoned");
            if let Some(cur) = cache.get(&nd.addr) {
                if Arc::ptr_eq(cur, nd) {
                    cache.remove(&nd.addr);
                }
            }
        }
    }

    fn hash_key(&self, key: &str) -> u64 {
        self.keyhash.read().expect("router keyhash poisoned").hash(key)
    }

    fn start(&self, k: usize) -> u64 {
        self.selfnode().id.wrapping_add(1u64 << k)
    }

    /// The Chord lookup primitive, local knowledge only. `exact` means the
    /// answer is authoritative and needs no further query.
    fn find_local_successor(&self, id: u64) -> (Arc<Node>, bool) {
        let ring = self.ring.read().expect("ring state poisoned");
        let selfnode = self.selfnode();

        if self.serving {
            if let Some(pred) = &ring.predecessor {
                if between(id, pred.id, selfnode.id) {
                    return (selfnode.clone(), true);
                }
            }
        }

        let Some(succ) = &ring.finger[0] else {
            // the only node in the ring
            return (selfnode.clone(), true);
        };

        if between(id, selfnode.id, succ.id) {
            return (succ.clone(), true);
        }

        // closest preceding node
        for i in (0..FINGERS).rev() {
            if let Some(f) = &ring.finger[i] {
                if between(f.id, selfnode.id, id.wrapping_sub(1)) {
                    return (f.clone(), false);
                }
            }
        }

        (selfnode.clone(), true)
    }

    async fn get_successor_via(&self, link: &HopLink, id: u64) -> Result<Arc<Node>> {
        let (_, val) = link
            .hop()
            .get(&format!("#/chord/successor:{:016x}", id), version::ANY)
            .await?;
        self.new_node(&String::from_utf8_lossy(&val))
    }

    /// Resolves the successor of `id`, querying at most one remote node.
    pub(crate) async fn find_successor(&self, id: u64) -> Result<Arc<Node>> {
        let (nd, exact) = self.find_local_successor(id);
        if exact {
            return Ok(nd);
        }

        let link = match nd.hop_link().await {
            Ok(l) => l,
            Err(e) => {
                self.check_closed(&nd).await;
                return Err(e);
            }
        };

        let res = self.get_successor_via(&link, id).await;
        if res.is_err() {
            self.check_closed(&nd).await;
        }

        res
    }

    /// Strong-stabilization join: walk successors until one is on the
    /// cycle, then build the finger table through it.
    async fn join(&self, boot: HopLink) -> Result<()> {
        let self_id = self.selfnode().id;
        {
            self.ring.write().expect("ring state poisoned").predecessor = None;
        }

        let mut succ = self.get_successor_via(&boot, self_id).await?;
        self.node_connect(&succ).await?;

        while !succ.oncycle() {
            let link = succ.hop_link().await?;
            let next = self.get_successor_via(&link, self_id).await?;
            if Arc::ptr_eq(&next, &succ) {
                break;
            }

            self.node_connect(&next).await?;
            self.node_disconnect(&succ).await;
            succ = next;
        }

        let diff = succ.id.wrapping_sub(self_id);
        let i0 = if diff == 0 { 1 } else { (63 - diff.leading_zeros()) as usize };

        for i in i0.max(1)..FINGERS {
            let link = succ.hop_link().await?;
            let f = match self.get_successor_via(&link, self.start(i)).await {
                Ok(f) => f,
                Err(e) => {
                    self.check_closed(&succ).await;
                    return Err(e);
                }
            };

            self.node_connect(&f).await?;
            let old = {
                let mut ring = self.ring.write().expect("ring state poisoned");
                std::mem::replace(&mut ring.finger[i], Some(f))
            };
            if let Some(old) = old {
                self.node_disconnect(&old).await;
            }
        }

        // the successor fills both the first finger and the backup slot
        self.node_connect(&succ).await?;
        {
            let mut ring = self.ring.write().expect("ring state poisoned");
            ring.finger[0] = Some(succ.clone());
            ring.successor1 = Some(succ);
        }

        Ok(())
    }

    /// One strong-stabilization pass. Returns whether the ring changed.
    async fn stabilize(&self) -> bool {
        let self_id = self.selfnode().id;

        for _ in 0..4 {
            let (succ0, succ1, pred) = {
                let ring = self.ring.read().expect("ring state poisoned");
                (
                    ring.finger[0].clone(),
                    ring.successor1.clone(),
                    ring.predecessor.clone(),
                )
            };

            let Some(succ0) = succ0 else { return false };
            let mut succ1 = succ1.unwrap_or_else(|| succ0.clone());

            // u = successor.find_successor(self)
            let link = match succ0.hop_link().await {
                Ok(l) => l,
                Err(_) => {
                    self.check_closed(&succ0).await;
                    return true;
                }
            };
            let nd = match self.get_successor_via(&link, self_id).await {
                Ok(n) => n,
                Err(_) => {
                    self.check_closed(&succ0).await;
                    return true;
                }
            };

            let oncycle = nd.id == self_id;
            if Arc::ptr_eq(&succ0, &succ1)
                && between(nd.id, self_id, succ1.id.wrapping_sub(1))
                && self.node_connect(&nd).await.is_ok()
            {
                succ1 = nd;
            }

            let (newpred, newsucc0, again) = self.update_notify(&pred, &succ0).await;
            if again {
                continue;
            }

            let (_, newsucc1, again) = self.update_notify(&pred, &succ1).await;
            if again {
                continue;
            }

            // take the successor1 slot's reference up front; released below
            // if the slot ends up not holding succ1
            if self.node_connect(&succ1).await.is_err() {
                return true;
            }

            let mut modified = false;
            let mut succ1_installed = false;
            let mut drops: Vec<Arc<Node>> = Vec::new();
            {
                let mut ring = self.ring.write().expect("ring state poisoned");
                self.selfnode().set_oncycle(oncycle);

                if !same_node(&ring.successor1, &Some(succ1.clone())) {
                    if let Some(old) = ring.successor1.take() {
                        drops.push(old);
                    }
                    ring.successor1 = Some(succ1.clone());
                    succ1_installed = true;
                    modified = true;
                }

                if let Some(ns1) = newsucc1 {
                    if let Some(old) = ring.successor1.take() {
                        drops.push(old);
                    }
                    ring.successor1 = Some(ns1);
                    modified = true;
                }

                if let Some(ns0) = newsucc0 {
                    if let Some(old) = ring.finger[0].take() {
                        drops.push(old);
                    }
                    ring.finger[0] = Some(ns0);
                    modified = true;
                }

                if let Some(np) = newpred {
                    if let Some(old) = ring.predecessor.take() {
                        drops.push(old);
                    }
                    ring.predecessor = Some(np);
                    modified = true;
                }
            }

            if !succ1_installed {
                drops.push(succ1);
            }

            for nd in drops {
                self.node_disconnect(&nd).await;
            }

            return modified;
        }

        true
    }

    /// Asks `succ` for its predecessor while proposing ourselves; decides
    /// whether the answer is a better successor (or, for client nodes, a
    /// better predecessor to track).
    async fn update_notify(
        &self,
        pred: &Option<Arc<Node>>,
        succ: &Arc<Node>,
    ) -> (Option<Arc<Node>>, Option<Arc<Node>>, bool) {
        let self_id = self.selfnode().id;
        let link = match succ.hop_link().await {
            Ok(l) => l,
            Err(_) => {
                self.check_closed(succ).await;
                return (None, None, true);
            }
        };

        let ndval = if self.serving {
            let spec = self.selfnode().spec().into_bytes();
            match link
                .hop()
                .atomic("#/chord/predecessor", PRED_AND_NOTIFY, &[spec])
                .await
            {
                Ok((_, vals)) => vals.into_iter().next().unwrap_or_default(),
                Err(e) => {
                    debug!("stabilize notify error: {}", e);
                    self.check_closed(succ).await;
                    return (None, None, true);
                }
            }
        } else {
            match link.hop().get("#/chord/predecessor", version::ANY).await {
                Ok((_, val)) => val,
                Err(e) => {
                    debug!("stabilize predecessor error: {}", e);
                    self.check_closed(succ).await;
                    return (None, None, true);
                }
            }
        };

        if ndval.is_empty() {
            return (None, None, false);
        }

        let Ok(nd) = self.new_node(&String::from_utf8_lossy(&ndval)) else {
            return (None, None, false);
        };

        if between(nd.id, self_id, succ.id.wrapping_sub(1)) && nd.addr != succ.addr {
            if self.node_connect(&nd).await.is_ok() {
                return (None, Some(nd), false);
            }
        } else if !self.serving && pred.as_ref().map_or(true, |p| p.addr != nd.addr) {
            // client nodes are not on the ring; they track their
            // predecessor themselves
            if self.node_connect(&nd).await.is_ok() {
                return (Some(nd), None, false);
            }
        }

        (None, None, false)
    }

    /// Repairs one finger slot per pass, round-robin.
    async fn fix_finger(&self, n: usize) -> bool {
        let ask = {
            let ring = self.ring.read().expect("ring state poisoned");
            ring.finger[n]
                .clone()
                .or_else(|| (0..=n).rev().filter_map(|i| ring.finger[i].clone()).next())
        };

        let ask = match ask {
            Some(nd) => nd,
            None => match self.try_find_successor().await {
                Some(nd) => nd,
                None => return false, // nobody to talk to
            },
        };

        let link = match ask.hop_link().await {
            Ok(l) => l,
            Err(_) => {
                self.check_closed(&ask).await;
                return true;
            }
        };

        let nd1 = match self.get_successor_via(&link, self.start(n)).await {
            Ok(nd) => nd,
            Err(_) => {
                self.check_closed(&ask).await;
                return true;
            }
        };

        let differs = {
            let ring = self.ring.read().expect("ring state poisoned");
            ring.finger[n]
                .as_ref()
                .map_or(true, |f| f.addr != nd1.addr || f.id != nd1.id)
        };
        if !differs {
            return false;
        }

        if self.node_connect(&nd1).await.is_err() {
            return true;
        }

        let old = {
            let mut ring = self.ring.write().expect("ring state poisoned");
            std::mem::replace(&mut ring.finger[n], Some(nd1))
        };
        if let Some(old) = old {
            self.node_disconnect(&old).await;
        }

        true
    }

    /// With no successor left, promote any other finger, or failing that
    /// the predecessor.
    async fn try_find_successor(&self) -> Option<Arc<Node>> {
        let selfaddr = self.selfnode().addr.clone();
        let candidate = {
            let ring = self.ring.read().expect("ring state poisoned");
            if let Some(s) = &ring.finger[0] {
                return Some(s.clone());
            }

            (1..FINGERS)
                .filter_map(|i| ring.finger[i].clone())
                .find(|n| n.addr != selfaddr)
                .or_else(|| ring.predecessor.clone())
        };

        let cand = candidate?;
        if self.node_connect(&cand).await.is_err() {
            return None;
        }

        let raced = {
            let mut ring = self.ring.write().expect("ring state poisoned");
            if ring.finger[0].is_none() {
                ring.finger[0] = Some(cand.clone());
                false
            } else {
                true
            }
        };

        if raced {
            self.node_disconnect(&cand).await;
        }

        Some(cand)
    }

    /// Scrubs a dead node from every slot it occupies and repairs the
    /// successor if it was the one that died.
    pub(crate) async fn check_closed(&self, nd: &Arc<Node>) {
        if !nd.link_closed().await {
            return;
        }

        let mut dropped = 0;
        {
            let mut ring = self.ring.write().expect("ring state poisoned");
            if ring
                .predecessor
                .as_ref()
                .map_or(false, |p| Arc::ptr_eq(p, nd))
            {
                ring.predecessor = None;
                dropped += 1;
            }

            for i in 0..FINGERS {
                if ring.finger[i].as_ref().map_or(false, |f| Arc::ptr_eq(f, nd)) {
                    ring.finger[i] = None;
                    dropped += 1;
                }
            }
        }

        if dropped == 0 {
            return;
        }

        warn!("node {:016x} {} disconnected, scrubbed {} slots", nd.id, nd.addr, dropped);
        for _ in 0..dropped {
            self.node_disconnect(nd).await;
        }

        let need_succ = self.ring.read().expect("ring state poisoned").finger[0].is_none();
        if need_succ {
            self.try_find_successor().await;
        }

        self.ring_modified();
    }

    /// Nudges the stabilization proc without blocking.
    pub(crate) fn ring_modified(&self) {
        let _ = self.modtx.try_send(());
    }

    async fn stabilizeproc(self: Arc<Self>) {
        let mut rx = self
            .modrx
            .lock()
            .await
            .take()
            .expect("stabilizeproc runs once");

        let mut period = STABILIZE_START;
        let mut modcnt = 0u32; // consecutive passes with modifications
        let mut runcnt = 0u32; // consecutive passes without
        let mut nfinger = 1usize;

        while !self.is_closed() {
            let mut modified = false;
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = rx.recv() => { modified = true }
            }

            if self.is_closed() {
                return;
            }

            // scrub a dead predecessor before anything else
            let pred = self.ring.read().expect("ring state poisoned").predecessor.clone();
            if let Some(p) = pred {
                if p.link_closed().await {
                    let old = {
                        let mut ring = self.ring.write().expect("ring state poisoned");
                        ring.predecessor.take()
                    };
                    if let Some(old) = old {
                        self.node_disconnect(&old).await;
                    }
                    modified = true;
                }
            }

            modified |= self.stabilize().await;
            modified |= self.fix_finger(nfinger).await;
            nfinger = (nfinger + 1) % FINGERS;

            if modified {
                runcnt = 0;
                modcnt += 1;
                if modcnt >= 2 {
                    period = (period / 2).max(STABILIZE_MIN);
                }
            } else {
                modcnt = 0;
                runcnt += 1;
                if runcnt > 7 {
                    period = (period + period / 3).min(STABILIZE_MAX);
                }
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Disconnected);
        }

        Ok(())
    }

    /// The node an operation on `key` should be forwarded to.
    fn get_node(&self, key: &str) -> Arc<Node> {
        self.find_local_successor(self.hash_key(key)).0
    }

    async fn node_link(&self, nd: &Arc<Node>) -> Result<HopLink> {
        match nd.hop_link().await {
            Ok(l) => Ok(l),
            Err(e) => {
                self.check_closed(nd).await;
                Err(e)
            }
        }
    }

    /// `#/chord/successor[:HHHH]` value.
    pub(crate) async fn successor_value(&self, key: &str) -> Result<(u64, Vec<u8>)> {
        let id = match key.strip_prefix("#/chord/successor:") {
            Some(hex) => u64::from_str_radix(hex, 16)
                .map_err(|_| Error::invalid(format!("invalid hash: '{}'", hex)))?,
            None => {
                let ring = self.ring.read().expect("ring state poisoned");
                match &ring.finger[0] {
                    Some(s) => s.id,
                    None => self.selfnode().id,
                }
            }
        };

        let nd = self.find_successor(id).await?;
        Ok((version::LOWEST, nd.spec().into_bytes()))
    }

    /// The `PredAndNotify` atomic: returns the current predecessor while
    /// considering the proposer as a better one.
    pub(crate) async fn pred_and_notify(
        &self,
        values: &[Vec<u8>],
    ) -> Result<(u64, Vec<Vec<u8>>)> {
        let spec = values
            .first()
            .ok_or_else(|| Error::invalid("invalid parameter number"))?;
        let nd = self.new_node(&String::from_utf8_lossy(spec))?;
        let self_id = self.selfnode().id;

        let old_pred = self.ring.read().expect("ring state poisoned").predecessor.clone();
        let mut modified = false;

        let accepts = old_pred
            .as_ref()
            .map_or(true, |p| between(nd.id, p.id, self_id));
        if accepts {
            self.node_connect(&nd).await?;
            let (installed, dropped) = {
                let mut ring = self.ring.write().expect("ring state poisoned");
                let still = ring
                    .predecessor
                    .as_ref()
                    .map_or(true, |p| between(nd.id, p.id, self_id));
                if still {
                    let old = std::mem::replace(&mut ring.predecessor, Some(nd.clone()));
                    (true, old)
                } else {
                    (false, None)
                }
            };

            if let Some(old) = dropped {
                self.node_disconnect(&old).await;
            }

            if installed {
                modified = true;
            } else {
                self.node_disconnect(&nd).await;
            }
        }

        let succ_empty = self.ring.read().expect("ring state poisoned").finger[0].is_none();
        if succ_empty {
            // with no successor at all, the proposer is a start
            self.node_connect(&nd).await?;
            let raced = {
                let mut ring = self.ring.write().expect("ring state poisoned");
                if ring.finger[0].is_none() {
                    ring.finger[0] = Some(nd.clone());
                    false
                } else {
                    true
                }
            };

            if raced {
                self.node_disconnect(&nd).await;
            } else {
                modified = true;
            }
        }

        if modified {
            self.ring_modified();
        }

        let val = old_pred.map(|p| p.spec().into_bytes()).unwrap_or_default();
        Ok((version::LOWEST, vec![val]))
    }

    /// `#/chord/predecessor` value: the predecessor's spec, or empty.
    pub(crate) fn predecessor_value(&self) -> Vec<u8> {
        self.ring
            .read()
            .expect("ring state poisoned")
            .predecessor
            .as_ref()
            .map(|p| p.spec().into_bytes())
            .unwrap_or_default()
    }

    pub(crate) fn finger_dump(&self) -> String {
        let ring = self.ring.read().expect("ring state poisoned");
        let mut out = String::new();
        for (i, nd) in ring.finger.iter().enumerate() {
            let spec = nd.as_ref().map(|n| n.spec()).unwrap_or_default();
            out.push_str(&format!("{:02}:{:016x} {}\n", i, self.start(i), spec));
        }

        out
    }

    pub(crate) async fn ring_dump(&self) -> Result<String> {
        let self_id = self.selfnode().id;
        let mut out = String::new();
        let mut id = self_id.wrapping_add(1);
        // bounded walk: a consistent ring is far smaller than this
        for _ in 0..128 {
            let nd = self.find_successor(id).await?;
            let fingers: Vec<String> = {
                let ring = self.ring.read().expect("ring state poisoned");
                ring.finger
                    .iter()
                    .enumerate()
                    .filter(|(_, f)| f.as_ref().map_or(false, |f| f.addr == nd.addr))
                    .map(|(i, _)| i.to_string())
                    .collect()
            };
            out.push_str(&format!("{} [{}]\n", nd.spec(), fingers.join(",")));

            if nd.id == self_id {
                break;
            }

            id = nd.id.wrapping_add(1);
        }

        Ok(out)
    }

    pub(crate) fn debug_dump(&self) -> String {
        let ring = self.ring.read().expect("ring state poisoned");
        let mut out = format!(
            "node {} serving {} closed {}\n",
            self.selfnode().spec(),
            self.serving,
            self.is_closed()
        );
        if let Some(p) = &ring.predecessor {
            out.push_str(&format!("predecessor {}\n", p.spec()));
        }
        if let Some(s) = &ring.successor1 {
            out.push_str(&format!("successor1 {}\n", s.spec()));
        }

        out
    }
}

#[async_trait]
impl Hop for ChordRouter {
    async fn create(&self, key: &str, flags: &str, value: &[u8]) -> Result<u64> {
        self.ensure_open()?;
        let nd = self.get_node(key);
        let link = self.node_link(&nd).await?;
        let res = link.hop().create(key, flags, value).await;
        if res.is_err() {
            self.check_closed(&nd).await;
        }

        res
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let nd = self.get_node(key);
        let link = self.node_link(&nd).await?;
        let res = link.hop().remove(key).await;
        if res.is_err() {
            self.check_closed(&nd).await;
        }

        res
    }

    async fn get(&self, key: &str, ver: u64) -> Result<(u64, Vec<u8>)> {
        self.ensure_open()?;
        if key.starts_with("#/") {
            if key.starts_with("#/chord/successor:") {
                return self.successor_value(key).await;
            }

            match self.lents.get(key, ver).await {
                Err(Error::NoEntry) => {}
                other => return other,
            }
        }

        let nd = self.get_node(key);
        let link = self.node_link(&nd).await?;
        let res = link.hop().get(key, ver).await;
        if res.is_err() {
            self.check_closed(&nd).await;
        }

        res
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.ensure_open()?;
        if key.starts_with("#/") {
            match self.lents.set(key, value).await {
                Err(Error::NoEntry) => {}
                other => return other,
            }
        }

        let nd = self.get_node(key);
        let link = self.node_link(&nd).await?;
        let res = link.hop().set(key, value).await;
        if res.is_err() {
            self.check_closed(&nd).await;
        }

        res
    }

    async fn testset(
        &self,
        key: &str,
        oldversion: u64,
        oldvalue: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(u64, Vec<u8>)> {
        self.ensure_open()?;
        if key.starts_with("#/") {
            match self.lents.testset(key, oldversion, oldvalue, value).await {
                Err(Error::NoEntry) => {}
                other => return other,
            }
        }

        let nd = self.get_node(key);
        let link = self.node_link(&nd).await?;
        let res = link.hop().testset(key, oldversion, oldvalue, value).await;
        if res.is_err() {
            self.check_closed(&nd).await;
        }

        res
    }

    async fn atomic(&self, key: &str, op: u16, values: &[Vec<u8>]) -> Result<(u64, Vec<Vec<u8>>)> {
        self.ensure_open()?;
        if key.starts_with("#/") {
            match self.lents.atomic(key, op, values).await {
                Err(Error::NoEntry) => {}
                other => return other,
            }
        }

        let nd = self.get_node(key);
        let link = self.node_link(&nd).await?;
        let res = link.hop().atomic(key, op, values).await;
        if res.is_err() {
            self.check_closed(&nd).await;
        }

        res
    }
}
