//! # veiltun
//!
//! A point-to-point user-space tunnel that carries arbitrary IP traffic
//! over a hostile, lossy network. The transport looks like ordinary TCP to
//! any middlebox on the path, while internally running an unreliable
//! datagram protocol hardened with Reed-Solomon FEC and per-endpoint
//! pacing.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              TUN-facing API (send / recv)                │
//! ├─────────────────────────────────────────────────────────┤
//! │  Deadline Queues (bounded, bufferbloat-aware)            │
//! ├─────────────────────────────────────────────────────────┤
//! │  FEC Engine (Reed-Solomon blocks, sliding RX window)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Packet Cipher (ChaCha20-Poly1305)   Pacer (µs gaps)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Fake-TCP Layer (handshake mimicry, 4-tuple dispatch)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  Raw Socket I/O (self-built IPv4+TCP)  Firewall (RST)    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Survive UDP-hostile paths**: middleboxes observe a plausible TCP
//!    flow with handshake, PSH|ACK data and sane checksums
//! 2. **Loss resilience without retransmission**: D+P Reed-Solomon shards
//!    per block recover from up to P losses with zero added RTT
//! 3. **Bounded latency**: every queue entry carries a deadline; stale
//!    data is dropped, never delivered late

#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod faketcp;
pub mod fec;
pub mod firewall;
pub mod mtu;
pub mod pacing;
pub mod queue;
pub mod rawsock;
pub mod session;
pub mod wire;

pub use config::{Mode, Role, TunnelConfig};
pub use error::{Error, Result};
pub use session::{Session, SessionStats};
