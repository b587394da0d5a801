use crate::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, trace};

/// Largest datagram the engine will read. IAX2 full frames are bounded far
/// below this by the engine's max payload configuration.
pub const MAX_DATAGRAM: usize = 4096;

/// Transport Layer Events
///
/// One raw datagram received from the network, with its source address.
/// Parsing happens in the engine so the transport stays byte-oriented.
#[derive(Debug)]
pub enum TransportEvent {
    Datagram(Bytes, SocketAddr),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

struct UdpInner {
    conn: UdpSocket,
    local: SocketAddr,
}

/// UDP connection: the only transport IAX2 speaks on the wire.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

impl UdpConnection {
    pub async fn create_connection(local: SocketAddr) -> Result<Self> {
        let conn = UdpSocket::bind(local).await?;
        let local = conn.local_addr()?;
        let t = UdpConnection { inner: Arc::new(UdpInner { conn, local }) };
        info!("created UDP connection: {}", t);
        Ok(t)
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, addr) = match self.inner.conn.recv_from(&mut buf).await {
                Ok((len, addr)) => (len, addr),
                Err(e) => {
                    error!("error receiving UDP packet: {}", e);
                    continue;
                }
            };
            trace!("received {} {} -> {}", len, addr, self.get_addr());
            sender.send(TransportEvent::Datagram(Bytes::copy_from_slice(&buf[..len]), addr))?;
        }
    }

    /// Non-blocking datagram send. A full socket buffer surfaces as an
    /// error the caller counts and otherwise ignores; retransmission
    /// covers the loss.
    pub fn send(&self, buf: &[u8], target: SocketAddr) -> Result<()> {
        trace!("sending {} {} -> {}", buf.len(), self.get_addr(), target);
        self.inner
            .conn
            .try_send_to(buf, target)
            .map_err(|e| crate::Error::TransportError(e.to_string(), target))
            .map(|_| ())
    }

    pub fn get_addr(&self) -> SocketAddr {
        self.inner.local
    }
}

impl std::fmt::Display for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.local)
    }
}

struct ChannelInner {
    addr: SocketAddr,
    incoming: Mutex<Option<TransportReceiver>>,
    incoming_sender: TransportSender,
    routes: Mutex<HashMap<SocketAddr, TransportSender>>,
}

/// In-memory connection for tests and local wiring: datagrams travel over
/// unbounded channels between linked peers under fake addresses.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    pub fn create_connection(addr: SocketAddr) -> Self {
        let (incoming_sender, incoming) = unbounded_channel();
        ChannelConnection {
            inner: Arc::new(ChannelInner {
                addr,
                incoming: Mutex::new(Some(incoming)),
                incoming_sender,
                routes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wire two connections together in both directions.
    pub fn link(&self, other: &ChannelConnection) {
        self.inner
            .routes
            .lock()
            .unwrap()
            .insert(other.get_addr(), other.inner.incoming_sender.clone());
        other
            .inner
            .routes
            .lock()
            .unwrap()
            .insert(self.get_addr(), self.inner.incoming_sender.clone());
    }

    /// Drop the route towards a peer, simulating a dead network path.
    pub fn unlink(&self, peer: SocketAddr) {
        self.inner.routes.lock().unwrap().remove(&peer);
    }

    pub fn send(&self, buf: &[u8], target: SocketAddr) -> Result<()> {
        let routes = self.inner.routes.lock().unwrap();
        match routes.get(&target) {
            Some(tx) => tx
                .send(TransportEvent::Datagram(
                    Bytes::copy_from_slice(buf),
                    self.inner.addr,
                ))
                .map_err(Into::into),
            None => Err(crate::Error::TransportError("no route".to_string(), target)),
        }
    }

    pub fn get_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let incoming = self.inner.incoming.lock().unwrap().take();
        let mut incoming = incoming.ok_or(crate::Error::EngineError(
            "ChannelConnection::serve_loop called twice".to_string(),
        ))?;
        while let Some(event) = incoming.recv().await {
            sender.send(event)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

/// Datagram connection abstraction the engine and transactions send through.
#[derive(Clone)]
pub enum Connection {
    Udp(UdpConnection),
    Channel(ChannelConnection),
}

impl Connection {
    pub fn send(&self, buf: &[u8], target: SocketAddr) -> Result<()> {
        match self {
            Connection::Udp(t) => t.send(buf, target),
            Connection::Channel(t) => t.send(buf, target),
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            Connection::Udp(t) => t.serve_loop(sender).await,
            Connection::Channel(t) => t.serve_loop(sender).await,
        }
    }

    pub fn get_addr(&self) -> SocketAddr {
        match self {
            Connection::Udp(t) => t.get_addr(),
            Connection::Channel(t) => t.get_addr(),
        }
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Udp(t) => write!(f, "UDP {}", t),
            Connection::Channel(t) => write!(f, "CHAN {}", t),
        }
    }
}

impl From<UdpConnection> for Connection {
    fn from(connection: UdpConnection) -> Self {
        Connection::Udp(connection)
    }
}

impl From<ChannelConnection> for Connection {
    fn from(connection: ChannelConnection) -> Self {
        Connection::Channel(connection)
    }
}
