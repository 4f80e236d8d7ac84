//! TCP stream transport: length-prefixed frames over `tokio::net`.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::{Conn, Listener, MsgHandler, Protocol};
use crate::wire::Message;

/// Hard ceiling on a single frame; anything larger is a corrupt peer.
const MAX_MSIZE: u32 = 64 * 1024 * 1024;

type HandlerSlot = RwLock<Option<Arc<dyn MsgHandler>>>;

pub struct NetConn {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    closed: watch::Sender<bool>,
    req_handler: HandlerSlot,
    rsp_handler: HandlerSlot,
    remote: String,
    local: String,
}

impl std::fmt::Debug for NetConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetConn")
            .field("remote", &self.remote)
            .field("local", &self.local)
            .finish()
    }
}

impl NetConn {
    pub fn new(stream: TcpStream) -> Arc<NetConn> {
        let _ = stream.set_nodelay(true);
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let (rd, mut wr) = stream.into_split();
        let (frames, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();
        let (closed, _) = watch::channel(false);

        let conn = Arc::new(NetConn {
            frames,
            closed,
            req_handler: RwLock::new(None),
            rsp_handler: RwLock::new(None),
            remote,
            local,
        });

        // writer task: drains the outbound queue until close
        let wconn = conn.clone();
        let mut wclosed = conn.closed.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = wclosed.changed() => break,
                    frame = outbound.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = wr.write_all(&frame).await {
                            debug!("{}: write error: {}", wconn.remote, e);
                            wconn.close();
                            break;
                        }
                    }
                }
            }

            let _ = wr.shutdown().await;
        });

        // reader task: frames in, dispatch by parity
        let rconn = conn.clone();
        let mut rclosed = conn.closed.subscribe();
        tokio::spawn(async move {
            let err = tokio::select! {
                _ = rclosed.changed() => Error::Disconnected,
                e = rconn.recv_loop(rd) => e,
            };

            rconn.close();
            rconn.fail_handlers(err);
        });

        conn
    }

    async fn recv_loop(&self, mut rd: OwnedReadHalf) -> Error {
        loop {
            let mut head = [0u8; 4];
            if rd.read_exact(&mut head).await.is_err() {
                return Error::Disconnected;
            }

            let size = u32::from_le_bytes(head);
            if !(8..=MAX_MSIZE).contains(&size) {
                warn!("{}: invalid frame size {}", self.remote, size);
                return Error::invalid("invalid frame size");
            }

            let mut frame = vec![0u8; size as usize];
            frame[0..4].copy_from_slice(&head);
            if rd.read_exact(&mut frame[4..]).await.is_err() {
                return Error::Disconnected;
            }

            let msg = match Message::decode(&frame) {
                Ok(m) => m,
                Err(e) => {
                    warn!("{}: invalid packet: {}", self.remote, e);
                    return e;
                }
            };

            let slot = if msg.is_request() {
                &self.req_handler
            } else {
                &self.rsp_handler
            };

            let handler = slot.read().expect("handler slot poisoned").clone();
            match handler {
                Some(h) => h.incoming(msg),
                None => {
                    warn!("{}: unexpected {} with no handler", self.remote, msg);
                    return Error::invalid("message with no handler");
                }
            }
        }
    }

    /// Delivers the terminal error to both handlers and drops them so the
    /// handler/connection reference cycle is broken.
    fn fail_handlers(&self, err: Error) {
        let req = self.req_handler.write().expect("handler slot poisoned").take();
        let rsp = self.rsp_handler.write().expect("handler slot poisoned").take();

        if let Some(h) = req {
            h.conn_error(err.clone());
        }

        if let Some(h) = rsp {
            h.conn_error(err);
        }
    }
}

impl Conn for NetConn {
    fn send(&self, msg: Message) -> Result<()> {
        if *self.closed.borrow() {
            return Err(Error::Disconnected);
        }

        let frame = msg.encode()?;
        self.frames.send(frame).map_err(|_| Error::Disconnected)
    }

    fn set_request_handler(&self, h: Arc<dyn MsgHandler>) {
        *self.req_handler.write().expect("handler slot poisoned") = Some(h);
    }

    fn set_response_handler(&self, h: Arc<dyn MsgHandler>) {
        *self.rsp_handler.write().expect("handler slot poisoned") = Some(h);
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }
}

pub struct TcpProto;

#[async_trait]
impl Protocol for TcpProto {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn Conn>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::invalid(format!("connect {}: {}", addr, e)))?;

        Ok(NetConn::new(stream) as Arc<dyn Conn>)
    }

    async fn listen(&self, addr: &str, listener: Arc<dyn Listener>) -> Result<String> {
        let sock = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::invalid(format!("listen {}: {}", addr, e)))?;

        let bound = sock
            .local_addr()
            .map_err(|e| Error::invalid(e.to_string()))?
            .to_string();

        tokio::spawn(async move {
            loop {
                match sock.accept().await {
                    Ok((stream, _)) => listener.new_connection(NetConn::new(stream)),
                    Err(e) => warn!("accept error: {}", e),
                }
            }
        });

        Ok(bound)
    }
}
