//! Pluggable byte transports.
//!
//! A transport moves whole [`Message`] frames between peers. Incoming
//! frames are split by type parity: requests (odd ids) go to the
//! connection's request handler, responses (even ids) to its response
//! handler. Registering both handlers on one socket is what makes a
//! connection duplex; the range router uses this so two peers share a
//! single TCP link for traffic in both directions.
//!
//! The protocol registry is process-wide state: names map to connection
//! factories, with `"tcp"` installed by default. Registration happens once
//! at process start, never from per-request paths.

pub mod net;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::wire::Message;


/// Receiver of one direction of a connection's traffic.
pub trait MsgHandler: Send + Sync {
    /// Called for each complete frame of the handler's parity.
    fn incoming(&self, msg: Message);

    /// Called once when the connection dies; all pending work on the
    /// connection should complete with the error.
    fn conn_error(&self, err: Error);
}

/// One established connection.
pub trait Conn: Send + Sync + std::fmt::Debug {
    /// Queues a message for sending. Fails if the connection is closed.
    fn send(&self, msg: Message) -> Result<()>;

    /// Assigns the handler for incoming requests (T messages).
    fn set_request_handler(&self, h: Arc<dyn MsgHandler>);

    /// Assigns the handler for incoming responses (R messages).
    fn set_response_handler(&self, h: Arc<dyn MsgHandler>);

    fn close(&self);
    fn is_closed(&self) -> bool;
    fn remote_addr(&self) -> String;
    fn local_addr(&self) -> String;
}

/// Accept callback for listening endpoints.
pub trait Listener: Send + Sync {
    fn new_connection(&self, conn: Arc<dyn Conn>);
}

/// A connection factory: one per protocol name.
#[async_trait]
pub trait Protocol: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn Conn>>;

    /// Starts listening and returns the bound address (useful when the
    /// requested address carries port 0).
    async fn listen(&self, addr: &str, listener: Arc<dyn Listener>) -> Result<String>;
}

fn registry() -> &'static RwLock<HashMap<String, Arc<dyn Protocol>>> {
    static PROTOCOLS: OnceLock<RwLock<HashMap<String, Arc<dyn Protocol>>>> = OnceLock::new();

    PROTOCOLS.get_or_init(|| {
        let mut m: HashMap<String, Arc<dyn Protocol>> = HashMap::new();
        m.insert("tcp".to_string(), Arc::new(net::TcpProto));
        RwLock::new(m)
    })
}

/// Registers an additional protocol. Fails if the name is taken.
pub fn register(proto: &str, p: Arc<dyn Protocol>) -> Result<()> {
    let mut m = registry().write().expect("protocol registry poisoned");
    if m.contains_key(proto) {
        return Err(Error::invalid(format!(
            "protocol {} already registered",
            proto
        )));
    }

    m.insert(proto.to_string(), p);
    Ok(())
}

fn get_protocol(proto: &str) -> Result<Arc<dyn Protocol>> {
    registry()
        .read()
        .expect("protocol registry poisoned")
        .get(proto)
        .cloned()
        .ok_or_else(|| Error::invalid(format!("unknown protocol: {}", proto)))
}

/// Dials `addr` over the named protocol.
pub async fn connect(proto: &str, addr: &str) -> Result<Arc<dyn Conn>> {
    get_protocol(proto)?.connect(addr).await
}

/// Listens on `addr` over the named protocol, reporting accepted
/// connections to `listener`. Returns the bound address.
pub async fn listen(proto: &str, addr: &str, listener: Arc<dyn Listener>) -> Result<String> {
    get_protocol(proto)?.listen(addr, listener).await
}
