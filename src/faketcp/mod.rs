//! Fake-TCP connection layer.
//!
//! Presents a datagram interface on top of TCP-shaped raw packets. The
//! "connection" is cosmetic: a minimal handshake mimics TCP setup so that
//! middleboxes see a plausible flow, while sequence and acknowledgment
//! numbers are opaque per-packet counters. Loss, reordering and mismatched
//! acks never tear the flow down; only FIN or idle timeout do.
//!
//! ## Handshake
//!
//! ```text
//! client                          server
//!   INIT ── SYN ──────────────────▶  (accept, new connection)
//!   HANDSHAKING ◀────────── SYN|ACK  HANDSHAKING
//!   ESTABLISHED ── ACK ───────────▶  ESTABLISHED
//!   ESTABLISHED ── PSH|ACK + data ─▶
//! ```

mod conn;
mod dispatch;
mod endpoint;

pub use conn::{FakeTcpConn, OutSegment, SegmentEvent, Side, State};
pub use dispatch::{Dispatcher, NewPeer};
pub use endpoint::{Endpoint, RawEndpoint, UdpEndpoint};

use std::time::Duration;

/// Handshake must complete within this window.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Keepalive emission period.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Default idle window before a connection is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-connection inbound buffer in packets; sized for FEC block bursts.
pub const INBOUND_CHANNEL_DEPTH: usize = 2048;
