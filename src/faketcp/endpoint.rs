//! Transport endpoints.
//!
//! The tunnel runs over one of two carriages: plain UDP datagrams, or
//! TCP-shaped raw packets. Both present the same packet-in/packet-out
//! surface so the pipeline above never branches on the mode.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::faketcp::{Dispatcher, FakeTcpConn, State};
use crate::rawsock::MAX_DATAGRAM;

/// A mode-agnostic packet endpoint.
pub enum Endpoint {
    /// Tunnel packets as plain UDP payloads
    Udp(UdpEndpoint),
    /// Tunnel packets inside fake TCP segments
    Raw(RawEndpoint),
}

impl Endpoint {
    /// Send one tunnel packet.
    pub async fn write_packet(&self, packet: &[u8]) -> Result<()> {
        match self {
            Endpoint::Udp(ep) => ep.write_packet(packet).await,
            Endpoint::Raw(ep) => ep.write_packet(packet).await,
        }
    }

    /// Send several tunnel packets back to back.
    ///
    /// The caller paces between packets; this only amortizes the dispatch.
    pub async fn write_batch(&self, packets: &[Vec<u8>]) -> Result<()> {
        for packet in packets {
            self.write_packet(packet).await?;
        }
        Ok(())
    }

    /// Receive one tunnel packet.
    pub async fn read_packet(&self) -> Result<Bytes> {
        match self {
            Endpoint::Udp(ep) => ep.read_packet().await,
            Endpoint::Raw(ep) => ep.read_packet().await,
        }
    }

    /// Receive with a deadline.
    pub async fn read_packet_timeout(&self, timeout: Duration) -> Result<Bytes> {
        tokio::time::timeout(timeout, self.read_packet())
            .await
            .map_err(|_| Error::Timeout(timeout.as_millis() as u64))?
    }

    /// Local address.
    pub fn local_addr(&self) -> SocketAddrV4 {
        match self {
            Endpoint::Udp(ep) => ep.local,
            Endpoint::Raw(ep) => ep.conn.local(),
        }
    }

    /// Peer address, if known yet.
    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        match self {
            Endpoint::Udp(ep) => *ep.peer.lock(),
            Endpoint::Raw(ep) => Some(ep.conn.peer()),
        }
    }

    /// Close the endpoint, notifying the peer where the mode supports it.
    pub async fn close(&self) -> Result<()> {
        match self {
            Endpoint::Udp(_) => Ok(()),
            Endpoint::Raw(ep) => ep.close().await,
        }
    }
}

/// UDP carriage: the sealed tunnel packet is the datagram payload.
pub struct UdpEndpoint {
    sock: UdpSocket,
    local: SocketAddrV4,
    peer: Mutex<Option<SocketAddrV4>>,
}

impl UdpEndpoint {
    /// Bind a UDP endpoint.
    ///
    /// Servers leave `peer` unset and learn it from the first datagram.
    pub async fn bind(local: SocketAddrV4, peer: Option<SocketAddrV4>) -> Result<Self> {
        let sock = UdpSocket::bind(SocketAddr::V4(local)).await?;
        let local = match sock.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => return Err(Error::config("IPv4 bind produced an IPv6 address")),
        };
        Ok(Self {
            sock,
            local,
            peer: Mutex::new(peer),
        })
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<()> {
        let peer = { *self.peer.lock() }.ok_or(Error::Closed)?;
        self.sock.send_to(packet, SocketAddr::V4(peer)).await?;
        Ok(())
    }

    async fn read_packet(&self) -> Result<Bytes> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = self.sock.recv_from(&mut buf).await?;
            let from = match from {
                SocketAddr::V4(addr) => addr,
                SocketAddr::V6(_) => continue,
            };

            let mut peer = self.peer.lock();
            match *peer {
                None => *peer = Some(from),
                Some(known) if known != from => {
                    tracing::trace!(%from, "datagram from unexpected source");
                    continue;
                }
                Some(_) => {}
            }
            return Ok(Bytes::copy_from_slice(&buf[..n]));
        }
    }
}

/// Raw carriage: packets wrapped in fake TCP segments on a shared socket.
pub struct RawEndpoint {
    dispatcher: Arc<Dispatcher>,
    conn: Arc<FakeTcpConn>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl RawEndpoint {
    /// Wrap a registered connection.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        conn: Arc<FakeTcpConn>,
        inbound: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            dispatcher,
            conn,
            inbound: tokio::sync::Mutex::new(inbound),
        }
    }

    /// The underlying connection.
    pub fn conn(&self) -> &Arc<FakeTcpConn> {
        &self.conn
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<()> {
        let seg = self.conn.wrap_payload(Bytes::copy_from_slice(packet))?;
        self.dispatcher.send_segment(&self.conn, &seg).await
    }

    async fn read_packet(&self) -> Result<Bytes> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::Closed)
    }

    async fn close(&self) -> Result<()> {
        if self.conn.state() != State::Closed {
            let fin = self.conn.fin_segment();
            self.dispatcher.send_segment(&self.conn, &fin).await?;
        }
        self.dispatcher.remove(self.conn.peer());
        Ok(())
    }
}
