use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::relay::{ConnectionId, READ_BUFFER_SIZE};

/// Callbacks the listener fires for every inbound connection.
///
/// Implementations must treat an unknown identifier as a no-op on every
/// path: a session may already have torn itself down before the listener
/// reports the close.
#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    /// A client connected. `link` is the only way to write back to it.
    async fn on_accept(&self, id: ConnectionId, link: Arc<ClientLink>);

    /// The client sent a chunk of bytes.
    async fn on_receive(&self, id: ConnectionId, data: Bytes);

    /// The client hung up or its socket failed.
    async fn on_close(&self, id: ConnectionId);
}

/// Write side of one inbound connection.
///
/// Writes are serialized through an async mutex so each client socket has a
/// single writer at a time. Closing it also stops the inbound reader.
pub struct ClientLink {
    id: ConnectionId,
    peer: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: CancellationToken,
}

impl ClientLink {
    pub fn new(id: ConnectionId, peer: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            peer,
            writer: Mutex::new(Some(writer)),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Write `data` to the client, giving up after `io_timeout`.
    pub async fn send(&self, data: &[u8], io_timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(self.id));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed(self.id))?;

        match timeout(io_timeout, writer.write_all(data)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::WriteTimeout(io_timeout)),
        }
    }

    /// Close the client connection. Safe to call more than once.
    ///
    /// If a write is in flight the write half is released when that write
    /// finishes and the link is dropped.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        if let Ok(mut guard) = self.writer.try_lock() {
            guard.take();
        }
        debug!(conn = self.id, peer = %self.peer, "client connection closed");
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Run the accept loop until `shutdown` flips.
///
/// Each accepted connection gets a fresh identifier and its own task that
/// reports its traffic through `events`.
pub async fn run(
    listener: TcpListener,
    events: Arc<dyn ConnectionEvents>,
    tcp_keepalive: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "relay listening");
    }

    let mut next_id: ConnectionId = 1;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "failed to accept TCP connection");
                        continue;
                    }
                };

                let id = next_id;
                next_id += 1;

                tune_socket(&stream, tcp_keepalive);
                info!(conn = id, peer = %peer, "client connected");

                let events = events.clone();
                tokio::spawn(serve_connection(id, stream, peer, events));
            }
            _ = shutdown.changed() => {
                info!("relay listener shutting down");
                return Ok(());
            }
        }
    }
}

async fn serve_connection(
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    events: Arc<dyn ConnectionEvents>,
) {
    let (mut reader, writer) = stream.into_split();
    let link = Arc::new(ClientLink::new(id, peer, writer));

    events.on_accept(id, link.clone()).await;

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);

        tokio::select! {
            biased;
            _ = link.closed() => {
                debug!(conn = id, "inbound reader stopped by teardown");
                break;
            }
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => {
                    info!(conn = id, peer = %peer, "client closed connection");
                    break;
                }
                Ok(_) => events.on_receive(id, buf.split().freeze()).await,
                Err(e) => {
                    debug!(conn = id, error = %e, "client read failed");
                    break;
                }
            }
        }
    }

    events.on_close(id).await;
}

fn tune_socket(stream: &TcpStream, tcp_keepalive: Option<Duration>) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY on client socket");
    }

    if let Some(idle) = tcp_keepalive {
        let keepalive = TcpKeepalive::new().with_time(idle);
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            warn!(error = %e, "failed to enable TCP keepalive on client socket");
        }
    }
}
