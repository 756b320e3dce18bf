//! Transports carrying gossip connections.
//!
//! The gossip server only needs to accept inbound connections and dial a
//! peer with a deadline. Framing lives in `protocol`.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};

const MEMORY_PIPE_CAPACITY: usize = 64 * 1024;
const MEMORY_BACKLOG: usize = 64;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Waits for the next inbound connection and the remote address.
    async fn accept(&self) -> io::Result<(Self::Conn, String)>;

    /// Opens a connection to `address`, failing with `TimedOut` after `timeout`.
    async fn dial(&self, address: &str, timeout: Duration) -> io::Result<Self::Conn>;
}

/// TCP transport used by the node binary.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer.to_string()))
    }

    async fn dial(&self, address: &str, timeout: Duration) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// In-process network of duplex pipes keyed by address.
///
/// Cloning shares the same network. An address marked unreachable can
/// neither be dialed nor dial out, which models a partitioned node. A blocked
/// link only fails dials in one direction.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, mpsc::Sender<(DuplexStream, String)>>>,
    unreachable: Arc<DashSet<String>>,
    blocked_links: Arc<DashSet<(String, String)>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, address: &str) -> io::Result<MemoryTransport> {
        if self.listeners.contains_key(address) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} already bound", address),
            ));
        }

        let (tx, rx) = mpsc::channel(MEMORY_BACKLOG);
        self.listeners.insert(address.to_string(), tx);

        Ok(MemoryTransport {
            address: address.to_string(),
            network: self.clone(),
            incoming: Mutex::new(rx),
        })
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if reachable {
            self.unreachable.remove(address);
        } else {
            self.unreachable.insert(address.to_string());
        }
    }

    pub fn set_link(&self, from: &str, to: &str, up: bool) {
        let link = (from.to_string(), to.to_string());
        if up {
            self.blocked_links.remove(&link);
        } else {
            self.blocked_links.insert(link);
        }
    }

    fn can_dial(&self, from: &str, to: &str) -> bool {
        !self.unreachable.contains(from)
            && !self.unreachable.contains(to)
            && !self
                .blocked_links
                .contains(&(from.to_string(), to.to_string()))
    }
}

pub struct MemoryTransport {
    address: String,
    network: MemoryNetwork,
    incoming: Mutex<mpsc::Receiver<(DuplexStream, String)>>,
}

impl MemoryTransport {
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.listeners.remove(&self.address);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Conn = DuplexStream;

    async fn accept(&self) -> io::Result<(DuplexStream, String)> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "listener closed"))
    }

    async fn dial(&self, address: &str, timeout: Duration) -> io::Result<DuplexStream> {
        let refused = || {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} unreachable", address),
            )
        };

        if !self.network.can_dial(&self.address, address) {
            return Err(refused());
        }
        let listener = self
            .network
            .listeners
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(refused)?;

        let (client, server) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
        tokio::time::timeout(timeout, listener.send((server, self.address.clone())))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))?
            .map_err(|_| refused())?;

        Ok(client)
    }
}
