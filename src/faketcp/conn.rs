//! Connection state machine.
//!
//! Pure state: segment I/O lives in the dispatcher and endpoint so the
//! machine can be driven directly in tests.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::rawsock::tcp_flags;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created, nothing sent yet
    Init,
    /// Handshake in flight
    Handshaking,
    /// Carrying data
    Established,
    /// FIN seen or idle limit exceeded
    Closed,
}

/// Which end of the handshake this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Sends the SYN
    Client,
    /// Replies SYN|ACK
    Server,
}

/// A TCP-shaped segment ready for the raw socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutSegment {
    /// Opaque per-packet counter
    pub seq: u32,
    /// Echo of the peer's last-seen counter
    pub ack: u32,
    /// TCP flag bits
    pub flags: u8,
    /// Tunnel packet riding as TCP payload
    pub payload: Bytes,
}

/// What an inbound segment did to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentEvent {
    /// Send this segment back (handshake replies)
    Reply(OutSegment),
    /// Hand the payload to the tunnel pipeline
    Deliver(Bytes),
    /// Segment absorbed; nothing to do
    Absorbed,
    /// Peer sent FIN; the connection is now closed
    Closed,
}

/// One logical connection keyed by its 4-tuple.
pub struct FakeTcpConn {
    local: SocketAddrV4,
    peer: SocketAddrV4,
    side: Side,
    state: Mutex<State>,
    our_seq: AtomicU32,
    peer_seq: AtomicU32,
    last_rx: Mutex<Instant>,
    last_tx: Mutex<Instant>,
    established: Notify,
}

impl FakeTcpConn {
    /// Create the client end of a connection.
    pub fn client(local: SocketAddrV4, peer: SocketAddrV4) -> Self {
        Self::new(local, peer, Side::Client, State::Init, rand::random())
    }

    /// Accept the server end from an inbound SYN.
    ///
    /// Returns the connection and the SYN|ACK to send.
    pub fn accept(local: SocketAddrV4, peer: SocketAddrV4, syn_seq: u32) -> (Self, OutSegment) {
        let conn = Self::new(local, peer, Side::Server, State::Handshaking, rand::random());
        conn.peer_seq.store(syn_seq, Ordering::Relaxed);
        let reply = OutSegment {
            seq: conn.next_seq(),
            ack: syn_seq,
            flags: tcp_flags::SYN | tcp_flags::ACK,
            payload: Bytes::new(),
        };
        (conn, reply)
    }

    fn new(local: SocketAddrV4, peer: SocketAddrV4, side: Side, state: State, isn: u32) -> Self {
        let now = Instant::now();
        Self {
            local,
            peer,
            side,
            state: Mutex::new(state),
            our_seq: AtomicU32::new(isn),
            peer_seq: AtomicU32::new(0),
            last_rx: Mutex::new(now),
            last_tx: Mutex::new(now),
            established: Notify::new(),
        }
    }

    /// The SYN that opens the connection. Client side only.
    pub fn open_segment(&self) -> Result<OutSegment> {
        let mut state = self.state.lock();
        match (*state, self.side) {
            (State::Init, Side::Client) | (State::Handshaking, Side::Client) => {
                *state = State::Handshaking;
                Ok(OutSegment {
                    seq: self.next_seq(),
                    ack: 0,
                    flags: tcp_flags::SYN,
                    payload: Bytes::new(),
                })
            }
            _ => Err(Error::Closed),
        }
    }

    /// Wrap one tunnel packet into a data segment.
    ///
    /// PSH|ACK is set on every data segment so middleboxes observe a
    /// plausible flow.
    pub fn wrap_payload(&self, payload: Bytes) -> Result<OutSegment> {
        if self.state() == State::Closed {
            return Err(Error::Closed);
        }
        Ok(OutSegment {
            seq: self.next_seq(),
            ack: self.peer_seq.load(Ordering::Relaxed),
            flags: tcp_flags::PSH | tcp_flags::ACK,
            payload,
        })
    }

    /// Close the connection, producing the FIN to send.
    pub fn fin_segment(&self) -> OutSegment {
        *self.state.lock() = State::Closed;
        self.established.notify_waiters();
        OutSegment {
            seq: self.next_seq(),
            ack: self.peer_seq.load(Ordering::Relaxed),
            flags: tcp_flags::FIN | tcp_flags::ACK,
            payload: Bytes::new(),
        }
    }

    /// Feed one inbound segment through the state machine.
    pub fn handle_segment(&self, seq: u32, flags: u8, payload: Bytes) -> SegmentEvent {
        *self.last_rx.lock() = Instant::now();
        self.peer_seq.store(seq, Ordering::Relaxed);

        if flags & tcp_flags::FIN != 0 {
            *self.state.lock() = State::Closed;
            self.established.notify_waiters();
            return SegmentEvent::Closed;
        }

        let mut state = self.state.lock();
        match (*state, self.side) {
            (State::Handshaking, Side::Client) => {
                if flags & (tcp_flags::SYN | tcp_flags::ACK)
                    == tcp_flags::SYN | tcp_flags::ACK
                {
                    *state = State::Established;
                    drop(state);
                    self.established.notify_waiters();
                    tracing::debug!(peer = %self.peer, "connection established");
                    SegmentEvent::Reply(OutSegment {
                        seq: self.next_seq(),
                        ack: seq,
                        flags: tcp_flags::ACK,
                        payload: Bytes::new(),
                    })
                } else {
                    SegmentEvent::Absorbed
                }
            }
            (State::Handshaking, Side::Server) => {
                // Promote on first ACK or first data segment.
                if !payload.is_empty() {
                    *state = State::Established;
                    drop(state);
                    self.established.notify_waiters();
                    SegmentEvent::Deliver(payload)
                } else if flags & tcp_flags::ACK != 0 {
                    *state = State::Established;
                    drop(state);
                    self.established.notify_waiters();
                    tracing::debug!(peer = %self.peer, "connection established");
                    SegmentEvent::Absorbed
                } else {
                    SegmentEvent::Absorbed
                }
            }
            (State::Established, _) => {
                if payload.is_empty() {
                    SegmentEvent::Absorbed
                } else {
                    SegmentEvent::Deliver(payload)
                }
            }
            _ => SegmentEvent::Absorbed,
        }
    }

    /// Suspend until the handshake completes.
    pub async fn wait_established(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.established.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match self.state() {
                    State::Established => return Ok(()),
                    State::Closed => return Err(Error::Closed),
                    _ => {}
                }
                notified.as_mut().await;
            }
        })
        .await
        .map_err(|_| Error::Timeout(timeout.as_millis() as u64))?
    }

    /// Current state.
    pub fn state(&self) -> State {
        *self.state.lock()
    }

    /// Local address of the 4-tuple.
    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    /// Peer address of the 4-tuple.
    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    /// Whether nothing has been received for `limit`.
    pub fn idle_expired(&self, limit: Duration) -> bool {
        self.last_rx.lock().elapsed() >= limit
    }

    /// Time since the last inbound segment.
    pub fn since_last_rx(&self) -> Duration {
        self.last_rx.lock().elapsed()
    }

    /// Time since the last outbound segment.
    pub fn since_last_tx(&self) -> Duration {
        self.last_tx.lock().elapsed()
    }

    /// Record an outbound segment.
    pub fn mark_tx(&self) {
        *self.last_tx.lock() = Instant::now();
    }

    fn next_seq(&self) -> u32 {
        self.our_seq.fetch_add(1, Ordering::Relaxed)
    }
}
