//! Connection multiplexer
//!
//! One TCP listener and one UDP socket per node, shared by every protocol
//! instance. Inbound streams are routed by an integer client id announced
//! in a small handshake: the initiator sends the target id as 4 big-endian
//! bytes, the acceptor answers one byte, `1` when a client is currently
//! waiting on that id and `0` otherwise. Inbound datagrams carry the id in
//! the envelope; unroutable datagrams are dropped without a reply.
//!
//! There is no global instance. A process constructs one [`Multiplexer`]
//! and hands it to every protocol that needs it.

use cloudgossip_core::PeerAddr;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::Connection;
use crate::error::NetError;

/// Maximum serialized datagram size, bounded by what a single UDP packet
/// can carry.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

const HANDSHAKE_ACCEPT: u8 = 1;
const HANDSHAKE_REJECT: u8 = 0;

/// Datagram envelope: source peer, target client id, opaque payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Datagram {
    pub source: PeerAddr,
    pub client_id: u32,
    pub payload: Vec<u8>,
}

struct MuxShared {
    local: PeerAddr,
    udp: Arc<UdpSocket>,
    /// Registered datagram sinks, one per client id.
    clients: Mutex<HashMap<u32, mpsc::Sender<Datagram>>>,
    /// Outstanding accepts, at most one per client id.
    pending_accepts: Mutex<HashMap<u32, oneshot::Sender<Connection>>>,
    shutdown: CancellationToken,
}

/// The per-node connection multiplexer.
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

impl Multiplexer {
    /// Bind the TCP listener and UDP socket on `addr` and start the
    /// background acceptor and datagram router.
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetError> {
        let listener = TcpListener::bind(addr).await?;
        let local = PeerAddr(listener.local_addr()?);
        let udp = Arc::new(UdpSocket::bind(local.addr()).await?);

        let shared = Arc::new(MuxShared {
            local,
            udp: udp.clone(),
            clients: Mutex::new(HashMap::new()),
            pending_accepts: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        info!(addr = %local, "multiplexer listening");
        tokio::spawn(acceptor_loop(listener, shared.clone()));
        tokio::spawn(datagram_loop(udp, shared.clone()));

        Ok(Self { shared })
    }

    /// The bound local address (useful when binding port 0).
    pub fn local_addr(&self) -> PeerAddr {
        self.shared.local
    }

    /// Bind `id` to a new client handle. Fails if the id is already bound.
    pub fn register_client(&self, id: u32) -> Result<MuxClient, NetError> {
        let mut clients = self.shared.clients.lock();
        if clients.contains_key(&id) {
            return Err(NetError::ClientIdInUse(id));
        }
        let (datagram_tx, datagram_rx) = mpsc::channel(64);
        clients.insert(id, datagram_tx);
        debug!(client_id = id, "client registered");
        Ok(MuxClient {
            id,
            shared: self.shared.clone(),
            datagram_rx: tokio::sync::Mutex::new(datagram_rx),
        })
    }

    /// Stop the background tasks and unblock every outstanding accept.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.pending_accepts.lock().clear();
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// Handle held by one protocol instance for one client id.
pub struct MuxClient {
    id: u32,
    shared: Arc<MuxShared>,
    datagram_rx: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
}

impl MuxClient {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn local_addr(&self) -> PeerAddr {
        self.shared.local
    }

    /// Block until an inbound connection for this client id arrives or the
    /// multiplexer terminates. At most one accept may be outstanding per
    /// client id.
    pub async fn accept_connection(&self) -> Result<Connection, NetError> {
        loop {
            let rx = {
                let mut pending = self.shared.pending_accepts.lock();
                if pending.contains_key(&self.id) {
                    return Err(NetError::AcceptInProgress(self.id));
                }
                let (tx, rx) = oneshot::channel();
                pending.insert(self.id, tx);
                rx
            };

            tokio::select! {
                conn = rx => match conn {
                    Ok(conn) => return Ok(conn),
                    // The waiter was claimed but no connection arrived: the
                    // dialer died mid-handshake. Re-arm and keep waiting;
                    // only real termination unblocks the caller.
                    Err(_) if !self.shared.shutdown.is_cancelled() => {
                        debug!(client_id = self.id, "handshake failed, re-arming accept");
                        continue;
                    }
                    Err(_) => return Err(NetError::Terminated),
                },
                _ = self.shared.shutdown.cancelled() => {
                    self.shared.pending_accepts.lock().remove(&self.id);
                    return Err(NetError::Terminated);
                }
            }
        }
    }

    /// Open a connection to `destination` announcing this client id, waiting
    /// up to `timeout` for the remote accept/reject decision.
    pub async fn create_connection(
        &self,
        destination: PeerAddr,
        timeout: Duration,
    ) -> Result<Connection, NetError> {
        let handshake = async {
            let mut stream = TcpStream::connect(destination.addr()).await?;
            stream.write_all(&self.id.to_be_bytes()).await?;
            stream.flush().await?;

            let mut status = [0u8; 1];
            stream.read_exact(&mut status).await?;
            match status[0] {
                HANDSHAKE_ACCEPT => Ok(Connection::new(stream, destination.addr())),
                HANDSHAKE_REJECT => Err(NetError::ConnectionRejected(self.id)),
                other => Err(NetError::HandshakeViolation(format!(
                    "unexpected handshake status byte {other}"
                ))),
            }
        };

        match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(NetError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {destination} timed out"),
            ))),
        }
    }

    /// Fire-and-forget datagram to `destination`. Fails before transmission
    /// if the serialized envelope would not fit in one packet.
    pub async fn send_datagram(
        &self,
        destination: PeerAddr,
        payload: Vec<u8>,
    ) -> Result<(), NetError> {
        let datagram = Datagram {
            source: self.shared.local,
            client_id: self.id,
            payload,
        };
        let bytes = postcard::to_allocvec(&datagram)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(NetError::DatagramTooLarge {
                size: bytes.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        self.shared.udp.send_to(&bytes, destination.addr()).await?;
        Ok(())
    }

    /// Next datagram routed to this client id.
    pub async fn recv_datagram(&self) -> Result<Datagram, NetError> {
        let mut rx = self.datagram_rx.lock().await;
        tokio::select! {
            datagram = rx.recv() => datagram.ok_or(NetError::Terminated),
            _ = self.shared.shutdown.cancelled() => Err(NetError::Terminated),
        }
    }
}

impl Drop for MuxClient {
    fn drop(&mut self) {
        self.shared.clients.lock().remove(&self.id);
        self.shared.pending_accepts.lock().remove(&self.id);
        debug!(client_id = self.id, "client unregistered");
    }
}

async fn acceptor_loop(listener: TcpListener, shared: Arc<MuxShared>) {
    loop {
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = shared.shutdown.cancelled() => {
                debug!("acceptor stopping");
                return;
            }
        };

        // Handshake each connection off the accept path.
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatch_inbound(stream, remote, &shared).await {
                debug!(remote = %remote, error = %e, "inbound dispatch failed");
            }
        });
    }
}

async fn dispatch_inbound(
    mut stream: TcpStream,
    remote: SocketAddr,
    shared: &MuxShared,
) -> Result<(), NetError> {
    let mut id_bytes = [0u8; 4];
    stream.read_exact(&mut id_bytes).await?;
    let client_id = u32::from_be_bytes(id_bytes);

    let waiter = shared.pending_accepts.lock().remove(&client_id);
    match waiter {
        Some(tx) => {
            stream.write_all(&[HANDSHAKE_ACCEPT]).await?;
            stream.flush().await?;
            trace!(remote = %remote, client_id, "inbound connection accepted");
            if tx.send(Connection::new(stream, remote)).is_err() {
                debug!(client_id, "accept caller went away during handshake");
            }
        }
        None => {
            debug!(remote = %remote, client_id, "no client accepting, rejecting");
            stream.write_all(&[HANDSHAKE_REJECT]).await?;
            stream.flush().await?;
        }
    }
    Ok(())
}

async fn datagram_loop(udp: Arc<UdpSocket>, shared: Arc<MuxShared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, remote) = tokio::select! {
            received = udp.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "datagram receive failed");
                    continue;
                }
            },
            _ = shared.shutdown.cancelled() => {
                debug!("datagram router stopping");
                return;
            }
        };

        let datagram: Datagram = match postcard::from_bytes(&buf[..len]) {
            Ok(datagram) => datagram,
            Err(e) => {
                trace!(remote = %remote, error = %e, "dropping malformed datagram");
                continue;
            }
        };

        // Unroutable datagrams are dropped silently.
        let sink = shared.clients.lock().get(&datagram.client_id).cloned();
        match sink {
            Some(tx) => {
                if tx.try_send(datagram).is_err() {
                    trace!("client datagram queue full, dropping");
                }
            }
            None => trace!(client_id = datagram.client_id, "no client for datagram"),
        }
    }
}
