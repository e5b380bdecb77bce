//! Packet transports between a host and a debug target.
//!
//! The session only needs "send a packet" and "receive the next packet".
//! Two implementations: an in-memory channel pair and UDP datagrams carrying
//! one packet each.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, Mutex};

use dinet_core::{Packet, WireError};

/// Largest datagram accepted. Far above any sane packet length.
const MAX_DATAGRAM: usize = 4096;

pub trait Transport: Send + Sync + 'static {
    fn send(&self, packet: Packet) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next packet.
    fn recv(&self) -> impl Future<Output = Result<Packet, TransportError>> + Send;
}

// ── In-memory ─────────────────────────────────────────────────────────────────

/// One end of a bounded in-memory packet channel.
pub struct ChannelTransport {
    tx: mpsc::Sender<Packet>,
    rx: Mutex<mpsc::Receiver<Packet>>,
}

impl ChannelTransport {
    /// Two connected ends, each buffering up to `depth` packets.
    pub fn pair(depth: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(depth);
        let (b_tx, b_rx) = mpsc::channel(depth);
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }

    /// Next packet if one is already waiting.
    pub fn try_recv(&self) -> Result<Option<Packet>, TransportError> {
        let Ok(mut rx) = self.rx.try_lock() else {
            return Ok(None);
        };
        match rx.try_recv() {
            Ok(p) => Ok(Some(p)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }
}

impl Transport for ChannelTransport {
    async fn send(&self, packet: Packet) -> Result<(), TransportError> {
        self.tx.send(packet).await.map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Packet, TransportError> {
        self.rx.lock().await.recv().await.ok_or(TransportError::Closed)
    }
}

// ── UDP ───────────────────────────────────────────────────────────────────────

/// UDP transport to a single target. Each datagram is one packet, every
/// word big-endian.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpTransport {
    pub async fn connect(
        bind: impl ToSocketAddrs,
        target: impl ToSocketAddrs,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;
        let peer = socket.peer_addr()?;
        tracing::info!(local = %socket.local_addr()?, %peer, "udp transport ready");
        Ok(Self { socket, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for UdpTransport {
    async fn send(&self, packet: Packet) -> Result<(), TransportError> {
        let bytes = packet.to_bytes();
        tracing::trace!(peer = %self.peer, data = %hex::encode(&bytes), "udp send");
        self.socket.send(&bytes).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Packet, TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = self.socket.recv(&mut buf).await?;
            let data = &buf[..len];
            match Packet::from_bytes(data) {
                Ok(p) => {
                    tracing::trace!(peer = %self.peer, data = %hex::encode(data), "udp recv");
                    return Ok(p);
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, len, "dropping malformed datagram");
                }
            }
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use dinet_core::{DiAddr, EventKind, PacketKind};

    fn packet() -> Packet {
        Packet::new(
            DiAddr::from_word(1),
            DiAddr::from_word(0x3ff),
            PacketKind::Event(EventKind::LAST),
            vec![0xcafe],
        )
    }

    #[tokio::test]
    async fn channel_pair_is_crossed() {
        let (host, target) = ChannelTransport::pair(4);
        host.send(packet()).await.unwrap();
        assert_eq!(target.recv().await.unwrap(), packet());
        assert!(host.try_recv().unwrap().is_none());
        target.send(packet()).await.unwrap();
        assert_eq!(host.try_recv().unwrap(), Some(packet()));
    }

    #[tokio::test]
    async fn closed_channel_reports_closed() {
        let (host, target) = ChannelTransport::pair(1);
        drop(target);
        assert!(matches!(host.recv().await, Err(TransportError::Closed)));
        assert!(matches!(host.send(packet()).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn udp_round_trip_skips_garbage() {
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let t = UdpTransport::connect("127.0.0.1:0", raw.local_addr().unwrap())
            .await
            .unwrap();
        let host_addr = t.local_addr().unwrap();

        t.send(packet()).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = raw.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, host_addr);
        assert_eq!(Packet::from_bytes(&buf[..len]).unwrap(), packet());

        raw.send_to(&[1, 2, 3], host_addr).await.unwrap();
        raw.send_to(&packet().to_bytes(), host_addr).await.unwrap();
        assert_eq!(t.recv().await.unwrap(), packet());
    }
}
