//! Inbound segment routing.
//!
//! One raw socket carries every peer's traffic. The dispatcher demultiplexes
//! received segments to their owning connection by 4-tuple, accepts new
//! peers on SYN, and silently drops everything else.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::faketcp::{FakeTcpConn, OutSegment, SegmentEvent, INBOUND_CHANNEL_DEPTH};
use crate::rawsock::{tcp_flags, RawSocket};

/// A freshly accepted peer, handed to the session.
pub struct NewPeer {
    /// The server end of the connection
    pub conn: Arc<FakeTcpConn>,
    /// Payloads the dispatcher routes to this peer
    pub inbound: mpsc::Receiver<Bytes>,
}

struct PeerEntry {
    conn: Arc<FakeTcpConn>,
    inbound_tx: mpsc::Sender<Bytes>,
}

/// Counters observed on a dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Frames that failed to parse
    pub parse_errors: AtomicU64,
    /// Segments from unknown tuples without SYN
    pub unknown_dropped: AtomicU64,
    /// Payloads dropped because a peer's inbound buffer was full
    pub inbound_overflow: AtomicU64,
}

/// Routes inbound segments to per-peer connections.
pub struct Dispatcher {
    sock: Arc<RawSocket>,
    local: SocketAddrV4,
    peers: RwLock<HashMap<SocketAddrV4, PeerEntry>>,
    accept_tx: mpsc::Sender<NewPeer>,
    accept_peers: bool,
    stats: DispatchStats,
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// `accept_peers` enables server behavior: an unknown tuple with SYN
    /// creates a connection and emits it on the returned channel. Clients
    /// pass `false` and pre-register their single connection.
    pub fn new(
        sock: Arc<RawSocket>,
        local: SocketAddrV4,
        accept_peers: bool,
    ) -> (Arc<Self>, mpsc::Receiver<NewPeer>) {
        let (accept_tx, accept_rx) = mpsc::channel(16);
        let dispatcher = Arc::new(Self {
            sock,
            local,
            peers: RwLock::new(HashMap::new()),
            accept_tx,
            accept_peers,
            stats: DispatchStats::default(),
        });
        (dispatcher, accept_rx)
    }

    /// Register an existing connection for routing.
    ///
    /// Returns the channel its payloads arrive on.
    pub fn register(&self, conn: Arc<FakeTcpConn>) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_DEPTH);
        self.peers.write().insert(
            conn.peer(),
            PeerEntry {
                conn,
                inbound_tx: tx,
            },
        );
        rx
    }

    /// Receive loop: parse, route, reply. Runs until the socket fails.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.sock.recv().await {
                Ok(dgram) => {
                    if dgram.dport != self.local.port() {
                        continue;
                    }
                    let peer = SocketAddrV4::new(dgram.src, dgram.sport);
                    self.route(peer, dgram.seq, dgram.flags, dgram.payload).await;
                }
                Err(Error::Parse(reason)) => {
                    self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(%reason, "dropped unparseable frame");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn route(&self, peer: SocketAddrV4, seq: u32, flags: u8, payload: Bytes) {
        let entry = {
            let peers = self.peers.read();
            peers
                .get(&peer)
                .map(|e| (e.conn.clone(), e.inbound_tx.clone()))
        };

        match entry {
            Some((conn, inbound_tx)) => {
                match conn.handle_segment(seq, flags, payload) {
                    SegmentEvent::Reply(seg) => {
                        if let Err(e) = self.send_segment(&conn, &seg).await {
                            tracing::debug!(%peer, error = %e, "handshake reply failed");
                        }
                    }
                    SegmentEvent::Deliver(payload) => {
                        if inbound_tx.try_send(payload).is_err() {
                            self.stats.inbound_overflow.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    SegmentEvent::Closed => {
                        tracing::info!(%peer, "peer closed connection");
                        self.peers.write().remove(&peer);
                    }
                    SegmentEvent::Absorbed => {}
                }
            }
            None if self.accept_peers && flags & tcp_flags::SYN != 0 => {
                if let Err(e) = self.accept(peer, seq).await {
                    tracing::warn!(%peer, error = %e, "accept failed");
                    self.peers.write().remove(&peer);
                }
            }
            None => {
                // Unknown tuple without SYN: not ours to answer.
                self.stats.unknown_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn accept(&self, peer: SocketAddrV4, syn_seq: u32) -> Result<()> {
        let (conn, syn_ack) = FakeTcpConn::accept(self.local, peer, syn_seq);
        let conn = Arc::new(conn);
        tracing::info!(%peer, "accepting new peer");

        let inbound = self.register(conn.clone());
        self.send_segment(&conn, &syn_ack).await?;

        if self
            .accept_tx
            .send(NewPeer {
                conn: conn.clone(),
                inbound,
            })
            .await
            .is_err()
        {
            // Session stopped accepting; drop the half-open peer.
            self.peers.write().remove(&peer);
        }
        Ok(())
    }

    /// Transmit one segment on a connection's 4-tuple.
    pub async fn send_segment(&self, conn: &FakeTcpConn, seg: &OutSegment) -> Result<()> {
        let local = conn.local();
        let peer = conn.peer();
        self.sock
            .send(
                *local.ip(),
                local.port(),
                *peer.ip(),
                peer.port(),
                seg.seq,
                seg.ack,
                seg.flags,
                &[],
                &seg.payload,
            )
            .await?;
        conn.mark_tx();
        Ok(())
    }

    /// Close and remove connections idle past `limit`.
    ///
    /// Returns the FINs to transmit, paired with their connections.
    pub fn reap_idle(&self, limit: Duration) -> Vec<(Arc<FakeTcpConn>, OutSegment)> {
        let mut peers = self.peers.write();
        let idle: Vec<SocketAddrV4> = peers
            .iter()
            .filter(|(_, e)| e.conn.idle_expired(limit))
            .map(|(addr, _)| *addr)
            .collect();

        idle.into_iter()
            .filter_map(|addr| peers.remove(&addr))
            .map(|e| {
                tracing::info!(peer = %e.conn.peer(), "closing idle connection");
                let fin = e.conn.fin_segment();
                (e.conn, fin)
            })
            .collect()
    }

    /// Remove one connection from the routing table.
    pub fn remove(&self, peer: SocketAddrV4) {
        self.peers.write().remove(&peer);
    }

    /// Number of live connections.
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Dispatcher counters.
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}
