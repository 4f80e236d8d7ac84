//! Server stub: accepts connections and dispatches requests to an op graph.
//!
//! Each accepted connection gets a [`SrvConn`] whose request handler spawns
//! one task per inbound request; the task runs the operation against the
//! connection's ops reference and sends back `request + 1` or `Rerror`.
//! The ops reference is swappable per connection; the range router swaps
//! in a wrapper that tracks peer liveness and gives `#/ctl` its
//! connection-dependent meaning.

use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::ops::Hop;
use crate::transport::{Conn, Listener, MsgHandler};
use crate::wire::types::*;
use crate::wire::Message;


/// Composition layers implement this to learn about connection lifecycle.
pub trait ConnHooks: Send + Sync {
    fn conn_opened(&self, conn: &Arc<SrvConn>);
    fn conn_closed(&self, conn: &Arc<SrvConn>);
}

pub struct Server {
    ops: Arc<dyn Hop>,
    hooks: RwLock<Option<Arc<dyn ConnHooks>>>,
    conns: Mutex<Vec<Weak<SrvConn>>>,
    refusing: std::sync::atomic::AtomicBool,
}

impl Server {
    pub fn new(ops: Arc<dyn Hop>) -> Arc<Server> {
        Arc::new(Server {
            ops,
            hooks: RwLock::new(None),
            conns: Mutex::new(Vec::new()),
            refusing: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Installs lifecycle hooks. Call before listening.
    pub fn set_hooks(&self, hooks: Arc<dyn ConnHooks>) {
        *self.hooks.write().expect("server hooks poisoned") = Some(hooks);
    }

    /// Attaches a connection to this server, whether accepted by a listener
    /// or established elsewhere (the duplex case).
    pub fn new_connection(&self, conn: Arc<dyn Conn>) {
        if self.refusing.load(std::sync::atomic::Ordering::Relaxed) {
            conn.close();
            return;
        }

        let hooks = self.hooks.read().expect("server hooks poisoned").clone();
        let sc = Arc::new_cyclic(|weak: &Weak<SrvConn>| SrvConn {
            conn: conn.clone(),
            ops: RwLock::new(self.ops.clone()),
            hooks: hooks.clone(),
            id: conn.remote_addr(),
            self_weak: weak.clone(),
        });

        let mut conns = self.conns.lock().expect("server conns poisoned");
        conns.retain(|w| w.strong_count() > 0);
        conns.push(Arc::downgrade(&sc));
        drop(conns);

        debug!("{}: connection opened", sc.id);
        if let Some(h) = &hooks {
            h.conn_opened(&sc);
        }

        conn.set_request_handler(sc);
    }

    /// Stops serving: existing connections close, new ones are refused.
    /// The listening socket itself stays bound for the process lifetime.
    pub fn shutdown(&self) {
        self.refusing
            .store(true, std::sync::atomic::Ordering::Relaxed);
        for sc in self.connections() {
            sc.close();
        }
    }

    /// Live connections, for introspection.
    pub fn connections(&self) -> Vec<Arc<SrvConn>> {
        self.conns
            .lock()
            .expect("server conns poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl Listener for Server {
    fn new_connection(&self, conn: Arc<dyn Conn>) {
        Server::new_connection(self, conn);
    }
}

/// One client connection to the server.
pub struct SrvConn {
    conn: Arc<dyn Conn>,
    ops: RwLock<Arc<dyn Hop>>,
    hooks: Option<Arc<dyn ConnHooks>>,
    id: String,
    self_weak: Weak<SrvConn>,
}

impl SrvConn {
    /// Replaces the ops this connection dispatches to.
    pub fn set_ops(&self, ops: Arc<dyn Hop>) {
        *self.ops.write().expect("conn ops poisoned") = ops;
    }

    pub fn connection(&self) -> Arc<dyn Conn> {
        self.conn.clone()
    }

    pub fn remote_addr(&self) -> String {
        self.conn.remote_addr()
    }

    pub fn close(&self) {
        self.conn.close();
    }
}

impl MsgHandler for SrvConn {
    fn incoming(&self, msg: Message) {
        trace!(">>> {} {}", self.id, msg);

        let ops = self.ops.read().expect("conn ops poisoned").clone();
        let conn = self.conn.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            process(ops, conn, id, msg).await;
        });
    }

    fn conn_error(&self, err: Error) {
        debug!("{}: connection closed: {}", self.id, err);

        if let (Some(hooks), Some(sc)) = (&self.hooks, self.self_weak.upgrade()) {
            hooks.conn_closed(&sc);
        }
    }
}

/// Runs one request to completion and sends the response.
async fn process(ops: Arc<dyn Hop>, conn: Arc<dyn Conn>, id: String, tc: Message) {
    let tag = tc.tag;
    let mut rc = match dispatch(ops, &tc).await {
        Ok(rc) => rc,
        Err(e) => Message::rerror(&e.to_string(), e.ecode()),
    };

    rc.tag = tag;
    trace!("<<< {} {}", id, rc);
    if let Err(e) = conn.send(rc) {
        warn!("{}: response send failed: {}", id, e);
    }
}

async fn dispatch(ops: Arc<dyn Hop>, tc: &Message) -> Result<Message> {
    match tc.mtype {
        TCREATE => {
            let ver = ops
                .create(&tc.key, &tc.flags, tc.value.as_deref().unwrap_or_default())
                .await?;
            Ok(Message::rcreate(ver))
        }
        TREMOVE => {
            ops.remove(&tc.key).await?;
            Ok(Message::rremove())
        }
        TGET => {
            let (ver, val) = ops.get(&tc.key, tc.version).await?;
            Ok(Message::rget(ver, &val))
        }
        TSET => {
            let ver = ops
                .set(&tc.key, tc.value.as_deref().unwrap_or_default())
                .await?;
            Ok(Message::rset(ver))
        }
        TTESTSET => {
            let (ver, val) = ops
                .testset(
                    &tc.key,
                    tc.version,
                    tc.oldval.as_deref(),
                    tc.value.as_deref().unwrap_or_default(),
                )
                .await?;
            Ok(Message::rtestset(ver, &val))
        }
        TATOMIC => {
            let (ver, vals) = ops.atomic(&tc.key, tc.atmop, &tc.vals).await?;
            Ok(Message::ratomic(ver, &vals))
        }
        _ => Err(Error::invalid("unknown message type")),
    }
}
