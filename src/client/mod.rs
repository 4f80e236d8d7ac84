//! RPC client stub: multiplexes tagged requests over one connection.
//!
//! Every request borrows a tag from a bitmap pool, parks a oneshot in the
//! pending table and waits for the response carrying its tag. A get that
//! blocks server-side (waiting for a future version) simply keeps its tag
//! parked; this is the intended long-poll. When the connection dies, every
//! pending request completes with `Disconnected`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::ops::Hop;
use crate::transport::{self, Conn, MsgHandler};
use crate::wire::types::RERROR;
use crate::wire::{Message, NOTAG};


/// Bitmap allocator over the tag space `0 .. NOTAG`.
struct TagPool {
    words: Mutex<Vec<u64>>,
}

impl TagPool {
    fn new() -> TagPool {
        TagPool {
            words: Mutex::new(vec![0u64; (NOTAG as usize) / 64 + 1]),
        }
    }

    fn acquire(&self) -> Option<u16> {
        let mut words = self.words.lock().expect("tag pool poisoned");
        for (i, w) in words.iter_mut().enumerate() {
            if *w != u64::MAX {
                let bit = w.trailing_ones() as usize;
                let tag = i * 64 + bit;
                if tag >= NOTAG as usize {
                    return None;
                }

                *w |= 1 << bit;
                return Some(tag as u16);
            }
        }

        None
    }

    fn release(&self, tag: u16) {
        let mut words = self.words.lock().expect("tag pool poisoned");
        words[tag as usize / 64] &= !(1 << (tag as usize % 64));
    }
}

struct Pending {
    expected: u16,
    tx: oneshot::Sender<Result<Message>>,
}

/// A connected Hop client. Shares the operation interface with every other
/// layer, so a client can sit at the root of a local op graph.
pub struct Client {
    conn: Arc<dyn Conn>,
    pending: DashMap<u16, Pending>,
    tags: TagPool,
    err: Mutex<Option<Error>>,
}

impl Client {
    /// Wraps an established connection. Used directly when a socket must
    /// carry traffic in both directions.
    pub fn new(conn: Arc<dyn Conn>) -> Arc<Client> {
        let clnt = Arc::new(Client {
            conn: conn.clone(),
            pending: DashMap::new(),
            tags: TagPool::new(),
            err: Mutex::new(None),
        });

        conn.set_response_handler(clnt.clone());
        clnt
    }

    pub async fn connect(proto: &str, addr: &str) -> Result<Arc<Client>> {
        Ok(Client::new(transport::connect(proto, addr).await?))
    }

    pub fn connection(&self) -> Arc<dyn Conn> {
        self.conn.clone()
    }

    pub fn close(&self) {
        self.conn.close();
    }

    pub fn is_closed(&self) -> bool {
        self.err.lock().expect("client state poisoned").is_some() || self.conn.is_closed()
    }

    fn closed_err(&self) -> Error {
        self.err
            .lock()
            .expect("client state poisoned")
            .clone()
            .unwrap_or(Error::Disconnected)
    }

    async fn rpc(&self, mut req: Message) -> Result<Message> {
        if self.is_closed() {
            return Err(self.closed_err());
        }

        let tag = self
            .tags
            .acquire()
            .ok_or_else(|| Error::invalid("tag pool exhausted"))?;
        req.tag = tag;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            tag,
            Pending {
                expected: req.mtype,
                tx,
            },
        );

        trace!("{{{{{{ {} {}", self.conn.remote_addr(), req);
        if let Err(e) = self.conn.send(req) {
            self.pending.remove(&tag);
            self.tags.release(tag);
            return Err(e);
        }

        let res = rx.await;
        self.tags.release(tag);
        match res {
            Ok(r) => r,
            Err(_) => Err(self.closed_err()),
        }
    }
}

impl MsgHandler for Client {
    fn incoming(&self, msg: Message) {
        trace!("}}}}}} {} {}", self.conn.remote_addr(), msg);

        let Some((_, p)) = self.pending.remove(&msg.tag) else {
            warn!("{}: unexpected response tag {}", self.conn.remote_addr(), msg.tag);
            self.conn.close();
            return;
        };

        let res = if msg.mtype == RERROR {
            Err(Error::from_wire(msg.ecode, msg.edescr.clone()))
        } else if msg.mtype != p.expected + 1 {
            Err(Error::invalid("invalid response type"))
        } else {
            Ok(msg)
        };

        let _ = p.tx.send(res);
    }

    fn conn_error(&self, err: Error) {
        *self.err.lock().expect("client state poisoned") = Some(err.clone());

        let tags: Vec<u16> = self.pending.iter().map(|e| *e.key()).collect();
        for tag in tags {
            if let Some((_, p)) = self.pending.remove(&tag) {
                let _ = p.tx.send(Err(err.clone()));
            }
        }
    }
}

#[async_trait]
impl Hop for Client {
    async fn create(&self, key: &str, flags: &str, value: &[u8]) -> Result<u64> {
        let rc = self.rpc(Message::tcreate(key, flags, value)).await?;
        Ok(rc.version)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.rpc(Message::tremove(key)).await?;
        Ok(())
    }

    async fn get(&self, key: &str, version: u64) -> Result<(u64, Vec<u8>)> {
        let rc = self.rpc(Message::tget(key, version)).await?;
        Ok((rc.version, rc.value.unwrap_or_default()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<u64> {
        let rc = self.rpc(Message::tset(key, value)).await?;
        Ok(rc.version)
    }

    async fn testset(
        &self,
        key: &str,
        oldversion: u64,
        oldvalue: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(u64, Vec<u8>)> {
        let rc = self
            .rpc(Message::ttestset(key, oldversion, oldvalue, value))
            .await?;
        Ok((rc.version, rc.value.unwrap_or_default()))
    }

    async fn atomic(&self, key: &str, op: u16, values: &[Vec<u8>]) -> Result<(u64, Vec<Vec<u8>>)> {
        let rc = self.rpc(Message::tatomic(op, key, values)).await?;
        Ok((rc.version, rc.vals))
    }
}

/// A link to a peer's op surface: either in-process (the peer is us) or a
/// remote client. Routers hold these in their tables so the local member
/// short-circuits the network.
#[derive(Clone)]
pub enum HopLink {
    Local(Arc<dyn Hop>),
    Remote(Arc<Client>),
}

impl HopLink {
    pub fn hop(&self) -> &dyn Hop {
        match self {
            HopLink::Local(h) => h.as_ref(),
            HopLink::Remote(c) => c.as_ref(),
        }
    }

    /// Local links never close.
    pub fn is_closed(&self) -> bool {
        match self {
            HopLink::Local(_) => false,
            HopLink::Remote(c) => c.is_closed(),
        }
    }

    pub fn close(&self) {
        if let HopLink::Remote(c) = self {
            c.close();
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, HopLink::Local(_))
    }
}
