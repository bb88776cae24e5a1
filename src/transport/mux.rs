//! Multiplexed UDP transport
//!
//! One socket carries rendezvous traffic, priming probes and every peer
//! session. A demux task routes each inbound datagram by source address:
//! registered routes get the datagram, unknown sources that open with a
//! handshake record become new inbound sessions, everything else is
//! dropped.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::record::{classify, DatagramKind};
use super::session::{is_client_hello, SecureSession, SessionConfig};
use crate::error::{Error, Result};
use crate::protocol::MAX_DATAGRAM;

/// Datagrams buffered per route before newer ones are dropped
const ROUTE_QUEUE: usize = 1024;

/// Completed inbound sessions waiting for `accept_encrypted`
const ACCEPT_QUEUE: usize = 64;

/// Payload of a priming probe; never parses as a record
pub const PROBE_PAYLOAD: &[u8] = b"wolfmesh-probe";

struct Route {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

enum Delivery {
    Delivered,
    Dropped,
    NoRoute(Bytes),
}

/// Source address -> per-connection inbound queue
#[derive(Default)]
struct RouteTable {
    routes: Mutex<HashMap<SocketAddr, Route>>,
    next_id: AtomicU64,
}

impl RouteTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, Route>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(self: &Arc<Self>, remote: SocketAddr) -> Result<(RouteGuard, mpsc::Receiver<Bytes>)> {
        let mut routes = self.lock();
        if let Some(route) = routes.get(&remote) {
            if !route.tx.is_closed() {
                return Err(Error::RouteInUse(remote));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(ROUTE_QUEUE);
        routes.insert(remote, Route { id, tx });

        Ok((
            RouteGuard {
                table: Arc::clone(self),
                remote,
                id,
            },
            rx,
        ))
    }

    fn deliver(&self, from: SocketAddr, datagram: Bytes) -> Delivery {
        let routes = self.lock();
        match routes.get(&from) {
            None => Delivery::NoRoute(datagram),
            Some(route) => match route.tx.try_send(datagram) {
                Ok(()) => Delivery::Delivered,
                Err(TrySendError::Full(_)) => Delivery::Dropped,
                Err(TrySendError::Closed(datagram)) => Delivery::NoRoute(datagram),
            },
        }
    }

    /// Remove a route, but only the registration identified by `id`
    fn remove(&self, remote: &SocketAddr, id: u64) {
        let mut routes = self.lock();
        if routes.get(remote).map(|route| route.id) == Some(id) {
            routes.remove(remote);
        }
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Keeps a route registered; shared by both halves of a connection
struct RouteGuard {
    table: Arc<RouteTable>,
    remote: SocketAddr,
    id: u64,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.table.remove(&self.remote, self.id);
    }
}

/// Plain datagram connection to one remote over the shared socket
pub struct DatagramConn {
    sender: DatagramSender,
    receiver: DatagramReceiver,
}

impl DatagramConn {
    fn new(socket: Arc<UdpSocket>, remote: SocketAddr, guard: RouteGuard, rx: mpsc::Receiver<Bytes>) -> Self {
        let guard = Arc::new(guard);
        Self {
            sender: DatagramSender {
                socket,
                remote,
                _route: Arc::clone(&guard),
            },
            receiver: DatagramReceiver {
                rx,
                remote,
                _route: guard,
            },
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.sender.remote
    }

    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        self.sender.send(data).await
    }

    /// Next datagram from the remote; `None` once the transport closes
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub fn into_split(self) -> (DatagramSender, DatagramReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a `DatagramConn`
#[derive(Clone)]
pub struct DatagramSender {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    _route: Arc<RouteGuard>,
}

impl DatagramSender {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        Ok(self.socket.send_to(data, self.remote).await?)
    }
}

/// Receiving half of a `DatagramConn`
pub struct DatagramReceiver {
    rx: mpsc::Receiver<Bytes>,
    remote: SocketAddr,
    _route: Arc<RouteGuard>,
}

impl DatagramReceiver {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// The member's single UDP socket, shared by every connection
pub struct MultiplexedConn {
    socket: Arc<UdpSocket>,
    routes: Arc<RouteTable>,
    config: SessionConfig,
    accepted: tokio::sync::Mutex<mpsc::Receiver<SecureSession>>,
    shutdown: CancellationToken,
}

impl MultiplexedConn {
    /// Bind a socket and start demultiplexing
    pub async fn bind(addr: SocketAddr, config: SessionConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket, config))
    }

    /// Take over an already bound socket; must be called inside a runtime
    pub fn from_socket(socket: UdpSocket, config: SessionConfig) -> Self {
        let socket = Arc::new(socket);
        let routes = Arc::new(RouteTable::default());
        let shutdown = CancellationToken::new();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);

        tracing::debug!("Multiplexed transport bound to {:?}", socket.local_addr());

        tokio::spawn(demux_loop(
            Arc::clone(&socket),
            Arc::clone(&routes),
            config.clone(),
            accept_tx,
            shutdown.clone(),
        ));

        Self {
            socket,
            routes,
            config,
            accepted: tokio::sync::Mutex::new(accept_rx),
            shutdown,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a plain connection; datagrams from `remote` are routed to it
    /// until both of its halves are dropped
    pub fn dial_plain(&self, remote: SocketAddr) -> Result<DatagramConn> {
        if self.shutdown.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        let (guard, rx) = self.routes.register(remote)?;
        Ok(DatagramConn::new(Arc::clone(&self.socket), remote, guard, rx))
    }

    /// Dial and run the client handshake
    pub async fn dial_encrypted(&self, remote: SocketAddr) -> Result<SecureSession> {
        let conn = self.dial_plain(remote)?;
        self.upgrade_client(conn).await
    }

    /// Run the client handshake over an existing plain connection
    pub async fn upgrade_client(&self, conn: DatagramConn) -> Result<SecureSession> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::TransportClosed),
            result = SecureSession::connect(conn, &self.config) => result,
        }
    }

    /// Next inbound session that completed its handshake
    pub async fn accept_encrypted(&self) -> Result<SecureSession> {
        let mut accepted = self.accepted.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::TransportClosed),
            session = accepted.recv() => session.ok_or(Error::TransportClosed),
        }
    }

    /// Fire a single non-handshake datagram at `remote` to open our NAT
    /// mapping towards it. No route is left behind.
    pub async fn send_probe(&self, remote: SocketAddr) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::TransportClosed),
            result = self.socket.send_to(PROBE_PAYLOAD, remote) => {
                result?;
                Ok(())
            }
        }
    }

    /// Number of live routes (plain and encrypted)
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop demultiplexing and end every connection
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!("Closing multiplexed transport");
        }
        self.shutdown.cancel();
        self.routes.clear();
    }
}

impl Drop for MultiplexedConn {
    fn drop(&mut self) {
        self.close();
    }
}

async fn demux_loop(
    socket: Arc<UdpSocket>,
    routes: Arc<RouteTable>,
    config: SessionConfig,
    accept_tx: mpsc::Sender<SecureSession>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    let e = Error::from(e);
                    if e.is_transient() {
                        tracing::debug!("Transient receive error: {}", e);
                    } else {
                        tracing::warn!("Receive error on multiplexed socket: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    continue;
                }
            },
        };

        let datagram = Bytes::copy_from_slice(&buf[..len]);

        let datagram = match routes.deliver(from, datagram) {
            Delivery::Delivered => continue,
            Delivery::Dropped => {
                tracing::trace!("Inbound queue for {} full, dropping datagram", from);
                continue;
            }
            Delivery::NoRoute(datagram) => datagram,
        };

        if classify(&datagram) != DatagramKind::Handshake {
            tracing::trace!("Dropping {} byte datagram from unknown source {}", len, from);
            continue;
        }

        if !is_client_hello(&datagram) {
            tracing::trace!("Dropping stray handshake record from {}", from);
            continue;
        }

        let (guard, rx) = match routes.register(from) {
            Ok(registration) => registration,
            Err(e) => {
                tracing::debug!("Cannot accept handshake from {}: {}", from, e);
                continue;
            }
        };
        let conn = DatagramConn::new(Arc::clone(&socket), from, guard, rx);
        routes.deliver(from, datagram);

        tracing::debug!("Inbound handshake from {}", from);

        let config = config.clone();
        let accept_tx = accept_tx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = SecureSession::accept(conn, &config) => result,
            };

            match result {
                Ok(session) => {
                    if accept_tx.send(session).await.is_err() {
                        tracing::debug!("Accept queue closed, dropping session with {}", from);
                    }
                }
                Err(e) => tracing::warn!("Inbound handshake from {} failed: {}", from, e),
            }
        });
    }

    tracing::debug!("Demux loop stopped");
}
