//! Ring nodes and their refcounted connections.
//!
//! A node is cached per address; the cache is the single owner. Finger,
//! predecessor and successor slots all hold the same `Arc<Node>`, and each
//! install/uninstall bumps the refcount: the underlying RPC client opens
//! on the first reference and closes on the last.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::client::{Client, HopLink};
use crate::error::{Error, Result};

pub struct Node {
    pub id: u64,
    pub addr: String,
    oncycle: AtomicBool,
    link: Mutex<NodeLink>,
}

#[derive(Default)]
struct NodeLink {
    refs: i64,
    link: Option<HopLink>,
}

impl Node {
    pub(super) fn new(id: u64, addr: String) -> Node {
        Node {
            id,
            addr,
            oncycle: AtomicBool::new(false),
            link: Mutex::new(NodeLink::default()),
        }
    }

    /// The local member's node: permanently linked in-process.
    pub(super) fn local(id: u64, addr: String, link: Option<HopLink>) -> Node {
        let nd = Node::new(id, addr);
        nd.oncycle.store(false, Ordering::Relaxed);
        {
            let mut l = nd.link.try_lock().expect("fresh node lock");
            l.refs = 1;
            l.link = link;
        }

        nd
    }

    pub fn oncycle(&self) -> bool {
        self.oncycle.load(Ordering::Relaxed)
    }

    pub(super) fn set_oncycle(&self, v: bool) {
        self.oncycle.store(v, Ordering::Relaxed);
    }

    /// Takes a reference; the first one dials. A link that died since the
    /// last use is replaced rather than handed out again.
    pub(super) async fn connect(&self, proto: &str) -> Result<()> {
        let mut l = self.link.lock().await;
        if let Some(HopLink::Remote(c)) = &l.link {
            if c.is_closed() {
                l.link = None;
            }
        }

        l.refs += 1;
        if l.link.is_none() {
            debug!("node connect {}", self.addr);
            match Client::connect(proto, &self.addr).await {
                Ok(c) => l.link = Some(HopLink::Remote(c)),
                Err(e) => {
                    l.refs -= 1;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Drops a reference; the last one closes the connection. Returns true
    /// when the node went idle (so the cache can forget it).
    pub(super) async fn disconnect(&self) -> bool {
        let mut l = self.link.lock().await;
        l.refs -= 1;
        if l.refs > 0 {
            return false;
        }

        debug!("node disconnect {}", self.addr);
        if let Some(link) = l.link.take() {
            link.close();
        }

        true
    }

    /// Non-blocking link peek, for shutdown paths.
    pub(super) fn try_link(&self) -> Option<HopLink> {
        self.link.try_lock().ok().and_then(|l| l.link.clone())
    }

    /// The node's op link, if connected.
    pub(super) async fn hop_link(&self) -> Result<HopLink> {
        self.link
            .lock()
            .await
            .link
            .clone()
            .ok_or(Error::Disconnected)
    }

    /// True when the node held a remote link and it died.
    pub(super) async fn link_closed(&self) -> bool {
        match &self.link.lock().await.link {
            Some(HopLink::Remote(c)) => c.is_closed(),
            _ => false,
        }
    }

    /// The wire form: `<id_hex_16> <addr> <true|false>`.
    pub fn spec(&self) -> String {
        format!("{:016x} {} {}", self.id, self.addr, self.oncycle())
    }
}

/// Parses a node spec; `oncycle` may be omitted and defaults to false.
pub(super) fn parse_spec(spec: &str) -> Result<(u64, String, bool)> {
    let fields: Vec<&str> = spec.split(' ').collect();
    if fields.len() < 2 || fields.len() > 3 {
        return Err(Error::invalid(format!("invalid node spec: '{}'", spec)));
    }

    let id = u64::from_str_radix(fields[0], 16)
        .map_err(|_| Error::invalid(format!("invalid node id: '{}'", fields[0])))?;
    let oncycle = fields.len() == 3 && fields[2] == "true";
    Ok((id, fields[1].to_string(), oncycle))
}

/// Ring interval test: `n ∈ (low, high]` on the circle.
pub fn between(n: u64, low: u64, high: u64) -> bool {
    if low > high {
        n > low || n <= high
    } else {
        n > low && n <= high
    }
}

pub(super) fn same_node(a: &Option<Arc<Node>>, b: &Option<Arc<Node>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
