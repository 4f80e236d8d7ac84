//! Static-range router ("D2"): partitions a 32-bit hash space into
//! contiguous ranges administered by a master.
//!
//! ## Roles
//! - **Master**: owns the configuration. Peers join by
//!   `ATOMIC #/conf Append [addr]` and retire by `Remove`; every
//!   configuration change bumps the `#/conf` entry, which peers long-poll.
//! - **Peer**: serves a slice of the hash space from its backing store and
//!   routes the rest. Peers keep one duplex connection per other peer: the
//!   dialing side sends `SET #/ctl "server <addr>"` so the accepting side
//!   reuses the socket for traffic in the opposite direction.
//! - **Client**: routes only; connects to every peer.
//!
//! Every instance hosts local meta entries (`#/id`, `#/keyhash`, `#/conf`,
//! `#/keys`, `#/ctl`, `#/stack`); `#/...` keys are resolved locally before
//! any routing decision. `#/keys` unions the key sets of all peers.
//!
//! A peer pings its master (the master: every peer) once a minute; two
//! minutes of silence triggers a probe, and a failed probe closes the
//! connection, which removes the peer from the configuration.

pub mod conf;
pub mod entries;
pub mod hash;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::client::{Client, HopLink};
use crate::error::{Error, Result};
use crate::ops::{atomic, version, Hop};
use crate::range::conf::{Conf, Range};
use crate::range::hash::{get_keyhash, KeyHash, DEFAULT_KEYHASH};
use crate::server::{ConnHooks, Server, SrvConn};
use crate::store::{Entry, MemStore};
use crate::transport::{self, Conn};

#[cfg(test)]
mod tests;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const HEARTBEAT_SILENCE: Duration = Duration::from_secs(120);

/// A known peer: its op link (absent until established) and liveness.
pub struct Peer {
    addr: String,
    link: RwLock<Option<HopLink>>,
    alive: Mutex<Instant>,
    srv_conn: Mutex<Option<Arc<SrvConn>>>,
}

impl Peer {
    fn new(addr: String) -> Peer {
        Peer {
            addr,
            link: RwLock::new(None),
            alive: Mutex::new(Instant::now()),
            srv_conn: Mutex::new(None),
        }
    }

    fn with_link(addr: String, link: HopLink) -> Peer {
        let p = Peer::new(addr);
        *p.link.write().expect("peer link poisoned") = Some(link);
        p
    }

    fn link(&self) -> Option<HopLink> {
        self.link.read().expect("peer link poisoned").clone()
    }

    fn set_link(&self, link: HopLink) {
        *self.link.write().expect("peer link poisoned") = Some(link);
    }

    fn touch(&self) {
        *self.alive.lock().expect("peer alive poisoned") = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.alive.lock().expect("peer alive poisoned").elapsed()
    }

    fn set_srv_conn(&self, sc: Arc<SrvConn>) {
        *self.srv_conn.lock().expect("peer conn poisoned") = Some(sc);
    }

    fn owns_conn(&self, sc: &Arc<SrvConn>) -> bool {
        self.srv_conn
            .lock()
            .expect("peer conn poisoned")
            .as_ref()
            .map_or(false, |own| Arc::ptr_eq(own, sc))
    }
}

#[derive(Default)]
struct RouteState {
    conf: Conf,
    routes: Vec<Range>,
    srvmap: HashMap<String, Arc<Peer>>,
    /// Freshly dialed duplex connections awaiting their server-side open.
    cmap: HashMap<usize, Arc<Peer>>,
    master_addr: String,
}

pub struct RangeRouter {
    proto: String,
    serving: bool,
    addr: RwLock<String>,
    hop: Option<Arc<dyn Hop>>,
    srv: OnceLock<Arc<Server>>,
    lents: Arc<MemStore>,
    conf_entry: OnceLock<Arc<Entry>>,
    khash_entry: OnceLock<Arc<Entry>>,
    keyhash: RwLock<&'static KeyHash>,
    state: RwLock<RouteState>,
    closed: AtomicBool,
    self_weak: OnceLock<Weak<RangeRouter>>,
}

fn conn_ptr(conn: &Arc<dyn Conn>) -> usize {
    Arc::as_ptr(conn) as *const () as usize
}

impl RangeRouter {
    /// Creates a router. With a `listen_addr` it serves its slice of the
    /// space from `hop`; with an empty one it is a pure client. An empty
    /// `master_addr` (or one equal to the listen address) makes this
    /// instance the master.
    pub async fn new(
        proto: &str,
        listen_addr: &str,
        master_addr: &str,
        hop: Option<Arc<dyn Hop>>,
    ) -> Result<Arc<RangeRouter>> {
        let serving = !listen_addr.is_empty();
        if serving && hop.is_none() {
            return Err(Error::invalid("a serving range router needs a backing store"));
        }

        let id = match &hop {
            Some(h) => match h.get("#/id", version::ANY).await {
                Ok((_, v)) => format!("range ({})", String::from_utf8_lossy(&v)),
                Err(_) => "range".to_string(),
            },
            None => "range".to_string(),
        };

        let keyhash = get_keyhash(DEFAULT_KEYHASH).ok_or_else(|| Error::invalid("no default hash"))?;
        let router = Arc::new(RangeRouter {
            proto: proto.to_string(),
            serving,
            addr: RwLock::new(String::new()),
            hop,
            srv: OnceLock::new(),
            lents: MemStore::with_id(&id),
            conf_entry: OnceLock::new(),
            khash_entry: OnceLock::new(),
            keyhash: RwLock::new(keyhash),
            state: RwLock::new(RouteState::default()),
            closed: AtomicBool::new(false),
            self_weak: OnceLock::new(),
        });
        let _ = router.self_weak.set(Arc::downgrade(&router));
        RangeRouter::install_entries(&router)?;

        if serving {
            let srv = Server::new(router.clone());
            srv.set_hooks(router.clone());
            let bound = transport::listen(proto, listen_addr, srv.clone()).await?;
            *router.addr.write().expect("router addr poisoned") = bound;
            let _ = router.srv.set(srv);
        }

        let selfpeer = router.hop.as_ref().filter(|_| serving).map(|h| {
            Arc::new(Peer::with_link(router.addr(), HopLink::Local(h.clone())))
        });

        if master_addr.is_empty() || master_addr == router.addr() {
            router.init_master(selfpeer);
        } else {
            let confver = router.init_common(master_addr, selfpeer).await?;
            let watcher = router.clone();
            tokio::spawn(async move { watcher.confproc(confver).await });
        }

        let hb = router.clone();
        tokio::spawn(async move { hb.heartbeatproc().await });

        info!("range router up at '{}' (master: {})", router.addr(), router.is_master());
        Ok(router)
    }

    /// Connects a routing-only client to an existing configuration.
    pub async fn connect(proto: &str, addr: &str) -> Result<Arc<RangeRouter>> {
        RangeRouter::new(proto, "", addr, None).await
    }

    fn install_entries(router: &Arc<RangeRouter>) -> Result<()> {
        let weak = Arc::downgrade(router);
        let conf_entry = router.lents.add_entry(
            "#/conf",
            b"",
            Some(Arc::new(entries::ConfOps {
                router: weak.clone(),
            })),
        )?;
        let _ = router.conf_entry.set(conf_entry);

        let khash = router
            .lents
            .add_entry("#/keyhash", DEFAULT_KEYHASH.as_bytes(), None)?;
        let _ = router.khash_entry.set(khash);

        router.lents.add_entry("#/ctl", b"range", None)?;
        router
            .lents
            .add_entry("#/stack", b"", Some(Arc::new(entries::StackOps { router: weak })))?;
        Ok(())
    }

    pub fn addr(&self) -> String {
        self.addr.read().expect("router addr poisoned").clone()
    }

    fn is_server(&self) -> bool {
        self.serving
    }

    pub fn is_master(&self) -> bool {
        let st = self.state.read().expect("router state poisoned");
        self.serving && !st.master_addr.is_empty() && st.master_addr == self.addr()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn srv(&self) -> &Arc<Server> {
        self.srv.get().expect("server started before init")
    }

    fn conf_entry(&self) -> &Arc<Entry> {
        self.conf_entry.get().expect("entries installed before init")
    }

    fn weak(&self) -> Weak<RangeRouter> {
        self.self_weak
            .get()
            .expect("self reference set at construction")
            .clone()
    }

    /// Currently published configuration (for tests and `#/stack`).
    pub fn current_conf(&self) -> Conf {
        self.state.read().expect("router state poisoned").conf.clone()
    }

    fn init_master(&self, selfpeer: Option<Arc<Peer>>) {
        let addr = self.addr();
        let text = {
            let mut st = self.state.write().expect("router state poisoned");
            st.master_addr = addr.clone();
            st.conf = Conf {
                maddr: addr.clone(),
                srvnum: 1,
                srvaddrs: vec![addr.clone()],
                routes: vec![Range {
                    addr: addr.clone(),
                    start: 0,
                    end: u32::MAX,
                }],
            };
            st.routes = st.conf.routes.clone();
            if let Some(p) = selfpeer {
                st.srvmap.insert(addr.clone(), p);
            }

            st.conf.format()
        };

        self.conf_entry().set_value(text.as_bytes());
    }

    async fn init_common(
        &self,
        master_addr: &str,
        selfpeer: Option<Arc<Peer>>,
    ) -> Result<u64> {
        if let Some(p) = &selfpeer {
            self.state
                .write()
                .expect("router state poisoned")
                .srvmap
                .insert(self.addr(), p.clone());
        }

        let mut master = Client::connect(&self.proto, master_addr).await?;
        let (mut confver, mut confval) = master.get("#/conf", version::ANY).await?;
        let mut cf = conf::parse_conf(&confval)?;

        // we may have been pointed at a peer; follow the real master
        if cf.maddr != master_addr {
            master.close();
            master = Client::connect(&self.proto, &cf.maddr).await?;
            if !self.is_server() {
                let (v, val) = master.get("#/conf", version::ANY).await?;
                confver = v;
                confval = val;
                cf = conf::parse_conf(&confval)?;
            }
        }

        let (_, khash) = master.get("#/keyhash", version::ANY).await?;
        let name = String::from_utf8(khash.clone()).map_err(|_| Error::invalid("bad keyhash"))?;
        let kh = get_keyhash(&name).ok_or_else(|| Error::invalid("unknown key hash function"))?;
        *self.keyhash.write().expect("router keyhash poisoned") = kh;
        if let Some(e) = self.khash_entry.get() {
            e.set_value(&khash);
        }

        let maddr = cf.maddr.clone();
        let master_peer = Arc::new(Peer::with_link(
            maddr.clone(),
            HopLink::Remote(master.clone()),
        ));
        {
            let mut st = self.state.write().expect("router state poisoned");
            st.master_addr = maddr.clone();
            st.srvmap.insert(maddr.clone(), master_peer.clone());
        }

        if self.is_server() {
            // the master connection is duplex: serve requests on it, then
            // join the configuration and hand the master the reverse path
            {
                let mut st = self.state.write().expect("router state poisoned");
                st.cmap.insert(conn_ptr(&master.connection()), master_peer);
            }
            self.srv().new_connection(master.connection());

            let (v, vals) = master
                .atomic("#/conf", atomic::APPEND, &[self.addr().into_bytes()])
                .await?;
            confver = v;
            confval = vals
                .into_iter()
                .next()
                .ok_or_else(|| Error::invalid("empty conf response"))?;

            master
                .set("#/ctl", format!("server {}", self.addr()).as_bytes())
                .await?;
            cf = conf::parse_conf(&confval)?;
        }

        self.update_conf(cf).await?;
        self.conf_entry().set_entry(confver, &confval);
        Ok(confver)
    }

    /// Applies a configuration: dials the peers listed before us (the rest
    /// dial us), hands each a reverse path, and swaps the routing state.
    async fn update_conf(&self, cf: Conf) -> Result<()> {
        let my = self.addr();
        let existing = self
            .state
            .read()
            .expect("router state poisoned")
            .srvmap
            .clone();

        let mut smap: HashMap<String, Arc<Peer>> = HashMap::new();
        let mut idx = 0;
        while idx < cf.srvaddrs.len() {
            let saddr = cf.srvaddrs[idx].clone();
            if saddr == my {
                break;
            }

            if let Some(p) = existing.get(&saddr) {
                smap.insert(saddr, p.clone());
                idx += 1;
                continue;
            }

            let clnt = Client::connect(&self.proto, &saddr).await?;
            let peer = Arc::new(Peer::with_link(
                saddr.clone(),
                HopLink::Remote(clnt.clone()),
            ));

            if self.is_server() {
                {
                    let mut st = self.state.write().expect("router state poisoned");
                    st.cmap.insert(conn_ptr(&clnt.connection()), peer.clone());
                }
                self.srv().new_connection(clnt.connection());
                clnt.set("#/ctl", format!("server {}", my).as_bytes()).await?;
            }

            smap.insert(saddr, peer);
            idx += 1;
        }

        // peers after us connect to us; keep whatever link already exists
        for saddr in &cf.srvaddrs[idx..] {
            if let Some(p) = existing.get(saddr) {
                smap.insert(saddr.clone(), p.clone());
            } else if *saddr != my {
                smap.insert(saddr.clone(), Arc::new(Peer::new(saddr.clone())));
            }
        }

        if let Some(p) = existing.get(&my) {
            smap.insert(my.clone(), p.clone());
        }

        let mut st = self.state.write().expect("router state poisoned");
        st.master_addr = cf.maddr.clone();
        st.routes = cf.routes.clone();
        st.conf = cf;
        st.srvmap = smap;
        Ok(())
    }

    fn master_link(&self) -> Option<HopLink> {
        let st = self.state.read().expect("router state poisoned");
        st.srvmap.get(&st.master_addr).and_then(|p| p.link())
    }

    /// The perpetual `GET #/conf` loop: each round long-polls for the
    /// version after the one we hold.
    async fn confproc(self: Arc<Self>, mut ver: u64) {
        while !self.is_closed() {
            let Some(link) = self.master_link() else {
                warn!("confproc: no master link, giving up");
                return;
            };

            let (nver, val) = match link.hop().get("#/conf", ver + 1).await {
                Ok(r) => r,
                Err(e) => {
                    debug!("confproc exiting: {}", e);
                    return;
                }
            };

            let cf = match conf::parse_conf(&val) {
                Ok(cf) => cf,
                Err(e) => {
                    warn!("confproc: bad configuration: {}", e);
                    return;
                }
            };

            info!("configuration update to version {}", nver);
            if let Err(e) = self.update_conf(cf).await {
                warn!("confproc: update failed: {}", e);
                return;
            }

            self.conf_entry().set_entry(nver, &val);
            ver = nver;
        }
    }

    /// Minute ticks; peers silent for two of them get probed with
    /// `GET #/id` and a failing probe closes the connection.
    async fn heartbeatproc(self: Arc<Self>) {
        let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        tick.tick().await;

        while !self.is_closed() {
            tick.tick().await;

            let my = self.addr();
            let is_master = self.is_master();
            let candidates: Vec<(String, HopLink)> = {
                let st = self.state.read().expect("router state poisoned");
                st.srvmap
                    .iter()
                    .filter(|(addr, peer)| {
                        **addr != my
                            && (is_master || **addr == st.master_addr)
                            && peer.idle() > HEARTBEAT_SILENCE
                    })
                    .filter_map(|(addr, peer)| peer.link().map(|l| (addr.clone(), l)))
                    .collect()
            };

            for (addr, link) in candidates {
                match link.hop().get("#/id", version::ANY).await {
                    Ok(_) => {
                        if let Some(p) = self
                            .state
                            .read()
                            .expect("router state poisoned")
                            .srvmap
                            .get(&addr)
                        {
                            p.touch();
                        }
                    }
                    Err(e) => {
                        warn!("heartbeat to {} failed ({}), closing", addr, e);
                        link.close();
                    }
                }
            }
        }
    }

    /// Registers a peer with the master and republishes the configuration
    /// with equal ranges. Healing any holes left by removals.
    pub(crate) fn master_add_server(&self, addr: &str) {
        let text = {
            let mut st = self.state.write().expect("router state poisoned");
            if !st.conf.srvaddrs.iter().any(|a| a == addr) {
                st.conf.srvaddrs.push(addr.to_string());
                st.conf.routes.push(Range {
                    addr: addr.to_string(),
                    start: 0,
                    end: 0,
                });
            }

            conf::rebalance(&mut st.conf.routes);
            st.conf.srvnum = st.conf.srvaddrs.len();
            st.routes = st.conf.routes.clone();
            st.srvmap
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(Peer::new(addr.to_string())));
            st.conf.format()
        };

        info!("peer {} joined", addr);
        self.conf_entry().set_value(text.as_bytes());
    }

    /// Retires a peer. Its ranges are dropped without re-partitioning the
    /// remainder, so the space keeps a hole until the next join.
    pub(crate) fn master_remove_server(&self, addr: &str) {
        let (text, link, holes) = {
            let mut st = self.state.write().expect("router state poisoned");
            let Some(peer) = st.srvmap.remove(addr) else {
                return;
            };

            st.conf.srvaddrs.retain(|a| a != addr);
            st.conf.routes.retain(|r| r.addr != addr);
            st.conf.srvnum = st.conf.srvaddrs.len();
            st.routes = st.conf.routes.clone();
            (st.conf.format(), peer.link(), st.conf.has_holes())
        };

        if holes {
            warn!(
                "peer {} removed; hash space has uncovered ranges until the next join",
                addr
            );
        } else {
            info!("peer {} removed", addr);
        }

        self.conf_entry().set_value(text.as_bytes());
        if let Some(l) = link {
            l.close();
        }
    }

    /// `SET #/ctl "server <addr>"`: the sender wants this connection to be
    /// duplex: from now on we reach that peer through this socket.
    fn ctl(&self, ops: &RangeConnOps, value: &[u8]) -> Result<u64> {
        let cmd = std::str::from_utf8(value).map_err(|_| Error::invalid("bad ctl command"))?;
        let addr = cmd
            .strip_prefix("server ")
            .ok_or_else(|| Error::invalid("unknown command"))?;

        let sc = ops.sc.upgrade().ok_or(Error::Disconnected)?;
        let clnt = Client::new(sc.connection());

        let peer = {
            let mut st = self.state.write().expect("router state poisoned");
            st.srvmap
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(Peer::new(addr.to_string())))
                .clone()
        };

        peer.set_link(HopLink::Remote(clnt));
        peer.set_srv_conn(sc);
        peer.touch();
        *ops.peer.lock().expect("conn peer poisoned") = Some(peer);

        debug!("duplex link established with {}", addr);
        Ok(version::LOWEST)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Disconnected);
        }

        Ok(())
    }

    /// Resolves the owner of a key.
    fn route(&self, key: &str) -> Result<(Arc<Peer>, HopLink)> {
        let h = self.keyhash.read().expect("router keyhash poisoned").hash(key);
        let (peer, link) = {
            let st = self.state.read().expect("router state poisoned");
            let r = conf::search(&st.routes, h)?;
            let peer = st.srvmap.get(&r.addr).cloned().ok_or(Error::Disconnected)?;
            let link = peer.link().ok_or(Error::Disconnected)?;
            (peer, link)
        };

        if link.is_closed() {
            self.check_closed(&peer);
            return Err(Error::Disconnected);
        }

        Ok((peer, link))
    }

    /// Routing-table repair on a detected dead link: drop the peer from the
    /// server map. The caller still sees the original error.
    fn check_closed(&self, peer: &Arc<Peer>) {
        let closed = peer.link().map_or(false, |l| l.is_closed());
        if !closed {
            return;
        }

        let mut st = self.state.write().expect("router state poisoned");
        if let Some(cur) = st.srvmap.get(&peer.addr) {
            if Arc::ptr_eq(cur, peer) {
                warn!("peer {} disconnected, dropping from server map", peer.addr);
                st.srvmap.remove(&peer.addr);
            }
        }
    }

    fn after_op<T>(&self, peer: &Arc<Peer>, res: &Result<T>) {
        match res {
            Ok(_) => peer.touch(),
            Err(_) => self.check_closed(peer),
        }
    }

    /// Union of this node's own keys: hosted meta entries plus the backing
    /// store. What a peer serves to other peers.
    async fn local_keys(&self, key: &str, _ver: u64) -> Result<(u64, Vec<u8>)> {
        let mut kmap = BTreeSet::new();
        let (mut maxver, val) = self.lents.get(key, version::ANY).await?;
        merge_keys(&mut kmap, &val);

        if let Some(h) = &self.hop {
            let (v, val) = h.get(key, version::ANY).await?;
            merge_keys(&mut kmap, &val);
            maxver = maxver.max(v);
        }

        Ok((maxver, join_keys(&kmap)))
    }

    /// Cross-node `#/keys[:re]`: this node's keys unioned with every
    /// peer's. Peer queries short-circuit to [`local_keys`] on the far
    /// side, so the fan-out never recurses.
    async fn keys_union(&self, key: &str, ver: u64) -> Result<(u64, Vec<u8>)> {
        if ver != version::ANY && ver != version::NEWEST {
            return Err(Error::invalid("unsupported version"));
        }

        let (mut maxver, val) = self.local_keys(key, ver).await?;
        let mut kmap = BTreeSet::new();
        merge_keys(&mut kmap, &val);

        let my = self.addr();
        let peers: Vec<(Arc<Peer>, HopLink)> = {
            let st = self.state.read().expect("router state poisoned");
            st.srvmap
                .iter()
                .filter(|(addr, _)| **addr != my)
                .filter_map(|(_, p)| p.link().map(|l| (p.clone(), l)))
                .filter(|(_, l)| !l.is_local())
                .collect()
        };

        for (peer, link) in peers {
            let res = link.hop().get(key, ver).await;
            self.after_op(&peer, &res);
            let (v, val) = res?;
            merge_keys(&mut kmap, &val);
            maxver = maxver.max(v);
        }

        Ok((maxver, join_keys(&kmap)))
    }

    /// Debug snapshot served under `#/stack`.
    pub(crate) fn debug_dump(&self) -> String {
        let st = self.state.read().expect("router state poisoned");
        let mut out = format!(
            "addr '{}' master '{}' closed {}\n",
            self.addr(),
            st.master_addr,
            self.is_closed()
        );
        out.push_str(&st.conf.format());
        for (addr, peer) in &st.srvmap {
            let link = match peer.link() {
                Some(l) if l.is_local() => "local",
                Some(l) if l.is_closed() => "closed",
                Some(_) => "up",
                None => "none",
            };
            out.push_str(&format!(
                "peer {} link {} idle {:?}\n",
                addr,
                link,
                peer.idle()
            ));
        }

        out
    }

    /// Closes every peer link and stops the maintenance procs.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(srv) = self.srv.get() {
            srv.shutdown();
        }

        let links: Vec<HopLink> = {
            let st = self.state.read().expect("router state poisoned");
            st.srvmap.values().filter_map(|p| p.link()).collect()
        };

        for l in links {
            l.close();
        }
    }
}

fn merge_keys(kmap: &mut BTreeSet<String>, val: &[u8]) {
    if val.is_empty() {
        return;
    }

    for k in val.split(|&b| b == 0) {
        if !k.is_empty() {
            kmap.insert(String::from_utf8_lossy(k).into_owned());
        }
    }
}

fn join_keys(kmap: &BTreeSet<String>) -> Vec<u8> {
    kmap.iter().cloned().collect::<Vec<_>>().join("\0").into_bytes()
}

#[async_trait]
impl Hop for RangeRouter {
    async fn create(&self, key: &str, flags: &str, value: &[u8]) -> Result<u64> {
        self.ensure_open()?;
        let (peer, link) = self.route(key)?;
        let res = link.hop().create(key, flags, value).await;
        self.after_op(&peer, &res);
        res
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let (peer, link) = self.route(key)?;
        let res = link.hop().remove(key).await;
        self.after_op(&peer, &res);
        res
    }

    async fn get(&self, key: &str, ver: u64) -> Result<(u64, Vec<u8>)> {
        self.ensure_open()?;
        if key.starts_with("#/") {
            if key.starts_with("#/keys") {
                return self.keys_union(key, ver).await;
            }

            match self.lents.get(key, ver).await {
                Err(Error::NoEntry) => {}
                other => return other,
            }
        }

        let (peer, link) = self.route(key)?;
        let res = link.hop().get(key, ver).await;
        self.after_op(&peer, &res);
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

        let (peer, link) = self.route(key)?;
        let res = link.hop().set(key, value).await;
        self.after_op(&peer, &res);
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

        let (peer, link) = self.route(key)?;
        let res = link.hop().testset(key, oldversion, oldvalue, value).await;
        self.after_op(&peer, &res);
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

        let (peer, link) = self.route(key)?;
        let res = link.hop().atomic(key, op, values).await;
        self.after_op(&peer, &res);
        res
    }
}

impl ConnHooks for RangeRouter {
    fn conn_opened(&self, sc: &Arc<SrvConn>) {
        let key = conn_ptr(&sc.connection());
        let peer = self
            .state
            .write()
            .expect("router state poisoned")
            .cmap
            .remove(&key);

        if let Some(p) = &peer {
            p.set_srv_conn(sc.clone());
            p.touch();
        }

        sc.set_ops(Arc::new(RangeConnOps {
            router: self.weak(),
            peer: Mutex::new(peer),
            sc: Arc::downgrade(sc),
        }));
    }

    fn conn_closed(&self, sc: &Arc<SrvConn>) {
        let addr = {
            let st = self.state.read().expect("router state poisoned");
            st.srvmap
                .iter()
                .find(|(_, p)| p.owns_conn(sc))
                .map(|(a, _)| a.clone())
        };

        let Some(addr) = addr else { return };
        if self.is_master() {
            self.master_remove_server(&addr);
        } else {
            let mut st = self.state.write().expect("router state poisoned");
            warn!("peer {} connection closed, dropping link", addr);
            st.srvmap.remove(&addr);
        }
    }
}

/// Per-connection ops wrapper: tracks the sender's liveness, gives `#/ctl`
/// its connection-dependent meaning, and serves peer `#/keys` queries
/// without fanning out again.
struct RangeConnOps {
    router: Weak<RangeRouter>,
    peer: Mutex<Option<Arc<Peer>>>,
    sc: Weak<SrvConn>,
}

impl RangeConnOps {
    fn router(&self) -> Result<Arc<RangeRouter>> {
        self.router.upgrade().ok_or(Error::Disconnected)
    }

    fn touch(&self) {
        if let Some(p) = &*self.peer.lock().expect("conn peer poisoned") {
            p.touch();
        }
    }

    fn from_peer(&self) -> bool {
        self.peer.lock().expect("conn peer poisoned").is_some()
    }
}

#[async_trait]
impl Hop for RangeConnOps {
    async fn create(&self, key: &str, flags: &str, value: &[u8]) -> Result<u64> {
        self.touch();
        self.router()?.create(key, flags, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.touch();
        self.router()?.remove(key).await
    }

    async fn get(&self, key: &str, ver: u64) -> Result<(u64, Vec<u8>)> {
        self.touch();
        let router = self.router()?;
        if key.starts_with("#/keys") && self.from_peer() {
            return router.local_keys(key, ver).await;
        }

        router.get(key, ver).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.touch();
        let router = self.router()?;
        if router.is_server() && key == "#/ctl" {
            return router.ctl(self, value);
        }

        router.set(key, value).await
    }

    async fn testset(
        &self,
        key: &str,
        oldversion: u64,
        oldvalue: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(u64, Vec<u8>)> {
        self.touch();
        self.router()?.testset(key, oldversion, oldvalue, value).await
    }

    async fn atomic(&self, key: &str, op: u16, values: &[Vec<u8>]) -> Result<(u64, Vec<Vec<u8>>)> {
        self.touch();
        self.router()?.atomic(key, op, values).await
    }
}
