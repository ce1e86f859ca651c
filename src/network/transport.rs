//! Transport Host
//!
//! The server core only sees connect, disconnect and receive events and
//! sends framed datagrams on a channel, reliably or not. `UdpHost` is a
//! plain UDP implementation: every datagram carries a one-byte channel
//! header and peers that stay silent time out.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use crate::network::protocol::DisconnectReason;

/// Peers silent for this long are dropped.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest datagram accepted.
pub const MAX_DATAGRAM: usize = 5000;

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket failure.
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque peer handle assigned by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

/// Events the host delivers to the server loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// New peer.
    Connect {
        /// Peer handle.
        peer: PeerId,
        /// Remote address.
        addr: SocketAddr,
    },
    /// Peer gone (timeout or remote disconnect).
    Disconnect {
        /// Peer handle.
        peer: PeerId,
    },
    /// Datagram from a peer.
    Receive {
        /// Peer handle.
        peer: PeerId,
        /// Channel the datagram arrived on.
        channel: u8,
        /// Payload without transport framing.
        data: Vec<u8>,
    },
}

/// Outbound side of a transport.
pub trait Host: Send + Sync {
    /// Send one datagram. Never blocks.
    fn send(&self, peer: PeerId, channel: u8, data: &[u8], reliable: bool);

    /// Drop a peer, telling it why.
    fn disconnect(&self, peer: PeerId, reason: DisconnectReason);
}

// =============================================================================
// UDP HOST
// =============================================================================

/// Channel byte value marking a disconnect notice.
const DISCONNECT_CHANNEL: u8 = 0xFF;

#[derive(Debug)]
struct Peer {
    id: PeerId,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct PeerTable {
    by_addr: BTreeMap<SocketAddr, Peer>,
    addrs: BTreeMap<PeerId, SocketAddr>,
    next_id: u64,
}

impl PeerTable {
    fn remove(&mut self, peer: PeerId) -> Option<SocketAddr> {
        let addr = self.addrs.remove(&peer)?;
        self.by_addr.remove(&addr);
        Some(addr)
    }
}

/// Plain UDP host.
pub struct UdpHost {
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<PeerTable>>,
}

impl UdpHost {
    /// Bind and start the receive and timeout tasks. Events arrive on the
    /// returned channel.
    pub async fn bind(addr: SocketAddr) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<HostEvent>), TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Game transport listening on {}", addr);
        let host = Arc::new(Self {
            socket,
            peers: Arc::new(Mutex::new(PeerTable::default())),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        host.spawn_receiver(tx.clone());
        host.spawn_timeout_checker(tx);
        Ok((host, rx))
    }

    /// Local address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    fn spawn_receiver(&self, tx: mpsc::UnboundedSender<HostEvent>) {
        let socket = Arc::clone(&self.socket);
        let peers = Arc::clone(&self.peers);
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, addr) = match socket.recv_from(&mut buffer).await {
                    Ok(r) => r,
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };
                let Some((&channel, data)) = buffer[..len].split_first() else {
                    continue;
                };
                let events = {
                    let Ok(mut table) = peers.lock() else { break };
                    Self::classify(&mut table, addr, channel, data)
                };
                for event in events {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
        });
    }

    fn classify(table: &mut PeerTable, addr: SocketAddr, channel: u8, data: &[u8]) -> Vec<HostEvent> {
        let mut events = Vec::new();
        let peer = match table.by_addr.get_mut(&addr) {
            Some(p) => {
                p.last_seen = Instant::now();
                p.id
            }
            None => {
                if channel == DISCONNECT_CHANNEL {
                    return events;
                }
                let id = PeerId(table.next_id);
                table.next_id += 1;
                table.by_addr.insert(addr, Peer { id, last_seen: Instant::now() });
                table.addrs.insert(id, addr);
                debug!(?id, %addr, "peer connected");
                events.push(HostEvent::Connect { peer: id, addr });
                id
            }
        };
        if channel == DISCONNECT_CHANNEL {
            table.remove(peer);
            events.push(HostEvent::Disconnect { peer });
        } else if !data.is_empty() {
            events.push(HostEvent::Receive {
                peer,
                channel,
                data: data.to_vec(),
            });
        }
        events
    }

    fn spawn_timeout_checker(&self, tx: mpsc::UnboundedSender<HostEvent>) {
        let peers = Arc::clone(&self.peers);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let timed_out: Vec<PeerId> = {
                    let Ok(mut table) = peers.lock() else { break };
                    let now = Instant::now();
                    let stale: Vec<PeerId> = table
                        .by_addr
                        .values()
                        .filter(|p| now.duration_since(p.last_seen) > PEER_TIMEOUT)
                        .map(|p| p.id)
                        .collect();
                    for id in &stale {
                        table.remove(*id);
                    }
                    stale
                };
                for peer in timed_out {
                    warn!(?peer, "peer timed out");
                    if tx.send(HostEvent::Disconnect { peer }).is_err() {
                        return;
                    }
                }
            }
        });
    }

    fn addr_of(&self, peer: PeerId) -> Option<SocketAddr> {
        self.peers.lock().ok()?.addrs.get(&peer).copied()
    }
}

impl Host for UdpHost {
    fn send(&self, peer: PeerId, channel: u8, data: &[u8], _reliable: bool) {
        let Some(addr) = self.addr_of(peer) else { return };
        let mut datagram = Vec::with_capacity(data.len() + 1);
        datagram.push(channel);
        datagram.extend_from_slice(data);
        if let Err(e) = self.socket.try_send_to(&datagram, addr) {
            debug!(%addr, "send failed: {}", e);
        }
    }

    fn disconnect(&self, peer: PeerId, reason: DisconnectReason) {
        let addr = match self.peers.lock() {
            Ok(mut table) => table.remove(peer),
            Err(_) => None,
        };
        if let Some(addr) = addr {
            let _ = self
                .socket
                .try_send_to(&[DISCONNECT_CHANNEL, reason.code() as u8], addr);
        }
    }
}

// =============================================================================
// TEST HOST
// =============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_first_datagram_connects() {
        let mut table = PeerTable::default();
        let events = UdpHost::classify(&mut table, addr(1000), 1, &[30, 5]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], HostEvent::Connect { peer: PeerId(0), addr: addr(1000) });
        assert_eq!(
            events[1],
            HostEvent::Receive { peer: PeerId(0), channel: 1, data: vec![30, 5] }
        );

        let events = UdpHost::classify(&mut table, addr(1000), 0, &[4]);
        assert_eq!(events.len(), 1);

        let events = UdpHost::classify(&mut table, addr(1001), 1, &[]);
        assert_eq!(events, vec![HostEvent::Connect { peer: PeerId(1), addr: addr(1001) }]);
    }

    #[tokio::test]
    async fn test_disconnect_notice() {
        let mut table = PeerTable::default();
        UdpHost::classify(&mut table, addr(1000), 1, &[]);
        let events = UdpHost::classify(&mut table, addr(1000), DISCONNECT_CHANNEL, &[]);
        assert_eq!(events, vec![HostEvent::Disconnect { peer: PeerId(0) }]);
        assert!(table.addrs.is_empty());
        // unknown address: ignored
        assert!(UdpHost::classify(&mut table, addr(1002), DISCONNECT_CHANNEL, &[]).is_empty());
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let (host, mut events) = UdpHost::bind(addr(0)).await.unwrap();
        let server = host.local_addr().unwrap();
        let client = UdpSocket::bind(addr(0)).await.unwrap();
        client.send_to(&[1, 30, 7], server).await.unwrap();

        let peer = match events.recv().await.unwrap() {
            HostEvent::Connect { peer, .. } => peer,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            events.recv().await.unwrap(),
            HostEvent::Receive { peer, channel: 1, data: vec![30, 7] }
        );

        host.send(peer, 1, &[31, 7], true);
        let mut buf = [0u8; 16];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 31, 7]);
    }
}
