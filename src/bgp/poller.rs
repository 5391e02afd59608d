use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::poll_fn;
use log::{debug, trace, warn};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::time::DelayQueue;

use crate::config::PeerConfig;
use crate::utils::get_host_address;

const TCP_INIT_TIMEOUT_MS: u16 = 1000;

pub type PollerTx = mpsc::UnboundedSender<Arc<PeerConfig>>;
pub type PollerRx = mpsc::UnboundedReceiver<Arc<PeerConfig>>;

#[derive(Debug)]
pub struct IdlePeer(Arc<PeerConfig>);

impl IdlePeer {
    pub fn new(config: Arc<PeerConfig>) -> Self {
        Self(config)
    }

    pub fn get_config(&self) -> Arc<PeerConfig> {
        Arc::clone(&self.0)
    }

    pub fn is_enabled(&self) -> bool {
        self.0.enabled
    }

    pub fn is_passive(&self) -> bool {
        self.0.passive
    }

    async fn connect(
        &self,
        source_addr: SocketAddr,
    ) -> Result<(TcpStream, Arc<PeerConfig>), io::Error> {
        let remote_ip = get_host_address(&self.0.remote_ip).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "Can't dial a peer configured as a network range",
            )
        })?;
        let peer_addr = SocketAddr::new(remote_ip, self.0.dest_port);
        let socket = match peer_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(source_addr)?;
        let connect = timeout(
            Duration::from_millis(TCP_INIT_TIMEOUT_MS.into()),
            socket.connect(peer_addr),
        );
        match connect.await {
            Ok(Ok(stream)) => Ok((stream, self.get_config())),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "TCP connect timed out")),
        }
    }
}

impl fmt::Display for IdlePeer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<IdlePeer {}>", self.0.remote_ip)
    }
}

/// Stores Idle peers and checks every interval if there are peers that the
/// manager can attempt to connect to
pub struct Poller {
    idle_peers: HashMap<IpAddr, IdlePeer>,
    tcp_listener: TcpListener,
    rx: PollerRx,
    interval: Duration,
    delay_queue: DelayQueue<IpAddr>,
}

impl Poller {
    pub fn new(listener: TcpListener, interval: u16 /* seconds */, rx: PollerRx) -> Self {
        let mut delay_queue = DelayQueue::with_capacity(4);
        // Keep a sentinel entry a year out so the queue never empties
        // (an empty DelayQueue yields Ready(None) and busy-loops the select)
        delay_queue.insert_at(
            IpAddr::from(Ipv4Addr::UNSPECIFIED),
            (Instant::now() + Duration::from_secs(31_536_000)).into(),
        );
        Self {
            idle_peers: HashMap::new(),
            tcp_listener: listener,
            interval: Duration::from_secs(interval.into()),
            delay_queue,
            rx,
        }
    }

    pub fn upsert_peer(&mut self, config: Arc<PeerConfig>) {
        let addr = config.remote_ip.ip();
        if self
            .idle_peers
            .insert(addr, IdlePeer::new(config))
            .is_some()
        {
            debug!("Peer config for {} updated", addr);
        }
        self.delay_queue.insert(addr, self.interval);
    }

    /// Wait for the next session-starting event: an inbound connection from
    /// a configured peer, or an outbound dial on a peer whose retry delay
    /// lapsed.
    pub async fn get_connection(
        &mut self,
    ) -> Result<Option<(TcpStream, Arc<PeerConfig>)>, io::Error> {
        let local_outbound_addr = self.tcp_listener.local_addr().expect("Has local address");
        tokio::select! {
            incoming = self.tcp_listener.accept() => {
                if let Ok((stream, socket)) = incoming {
                    let config = self
                        .idle_peers
                        .iter()
                        .find(|(_, peer)| peer.0.remote_ip.contains(socket.ip()))
                        .filter(|(_, peer)| peer.is_enabled())
                        .map(|(addr, peer)| (*addr, peer.get_config()));
                    if let Some((addr, config)) = config {
                        self.idle_peers.remove(&addr);
                        debug!("Incoming new connection from {}", socket.ip());
                        return Ok(Some((stream, config)));
                    }
                    warn!(
                        "Unexpected connection from {}: Not a configured peer",
                        socket.ip(),
                    );
                }
                Ok(None)
            },
            outgoing = poll_fn(|cx| self.delay_queue.poll_expired(cx)) => {
                if let Some(expired) = outgoing {
                    let addr = expired.into_inner();
                    trace!("Poller outbound triggered for {}", addr);
                    // Peer may not be present if an incoming connection
                    // was established simultaneously
                    if let Some(peer) = self.idle_peers.get(&addr) {
                        if peer.is_enabled() && !peer.is_passive() {
                            match peer.connect(SocketAddr::new(local_outbound_addr.ip(), 0u16)).await {
                                Ok(connection) => {
                                    self.idle_peers.remove(&addr);
                                    return Ok(Some(connection));
                                }
                                Err(err) => {
                                    trace!("Error polling {}: {}", addr, err);
                                    self.delay_queue.insert(addr, self.interval);
                                }
                            }
                        }
                    }
                }
                Ok(None)
            },
            peer = self.rx.recv() => {
                if let Some(config) = peer {
                    self.upsert_peer(config);
                }
                Ok(None)
            }
        }
    }
}

impl fmt::Display for Poller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Poller peers={}>", self.idle_peers.len())
    }
}
