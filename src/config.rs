//! Tunnel configuration.

use std::net::SocketAddrV4;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Transport mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Tunnel packets ride as plain UDP payloads
    Udp,
    /// Tunnel packets ride inside self-built IPv4+TCP headers
    Raw,
}

/// Endpoint role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Initiates the handshake
    Client,
    /// Accepts peers
    Server,
}

/// Tunnel configuration.
///
/// Loaded from a JSON file; every field except `role`, `local_addr` and
/// `key` has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Endpoint role
    pub role: Role,
    /// Transport mode
    #[serde(default = "defaults::mode")]
    pub mode: Mode,
    /// Local bind address
    pub local_addr: SocketAddrV4,
    /// Peer address; required for clients
    #[serde(default)]
    pub remote_addr: Option<SocketAddrV4>,
    /// Passphrase the packet key is derived from
    pub key: String,
    /// Send queue capacity in entries
    #[serde(default = "defaults::queue_size")]
    pub send_queue_size: usize,
    /// Receive queue capacity in entries
    #[serde(default = "defaults::queue_size")]
    pub recv_queue_size: usize,
    /// Initial path MTU; refined by discovery when enabled
    #[serde(default = "defaults::mtu")]
    pub mtu: u16,
    /// FEC data shards per block
    #[serde(default = "defaults::fec_data")]
    pub fec_data: u8,
    /// FEC parity shards per block
    #[serde(default = "defaults::fec_parity")]
    pub fec_parity: u8,
    /// Base inter-packet gap in microseconds
    #[serde(default = "defaults::pacing_us")]
    pub faketcp_pacing_us: u64,
    /// Hard cap on the outer payload of one network packet
    #[serde(default = "defaults::max_segment")]
    pub faketcp_max_segment: usize,
    /// Idle seconds before a connection is closed
    #[serde(default = "defaults::idle_timeout_s")]
    pub idle_timeout_s: u64,
}

mod defaults {
    use super::Mode;

    pub fn mode() -> Mode {
        Mode::Raw
    }
    pub fn queue_size() -> usize {
        500
    }
    pub fn mtu() -> u16 {
        1200
    }
    pub fn fec_data() -> u8 {
        8
    }
    pub fn fec_parity() -> u8 {
        2
    }
    pub fn pacing_us() -> u64 {
        200
    }
    pub fn max_segment() -> usize {
        1371
    }
    pub fn idle_timeout_s() -> u64 {
        60
    }
}

impl TunnelConfig {
    /// Load and validate a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("cannot read config file: {}", e)))?;
        let config: TunnelConfig = serde_json::from_str(&content)
            .map_err(|e| Error::config(format!("invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate option ranges and cross-field requirements.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::config("key must not be empty"));
        }
        if self.role == Role::Client && self.remote_addr.is_none() {
            return Err(Error::config("client requires remote_addr"));
        }
        if self.fec_data == 0 || self.fec_parity == 0 {
            return Err(Error::config("fec_data and fec_parity must be positive"));
        }
        if self.fec_data as usize + self.fec_parity as usize > 255 {
            return Err(Error::config("fec_data + fec_parity must not exceed 255"));
        }
        if self.send_queue_size == 0 || self.recv_queue_size == 0 {
            return Err(Error::config("queue sizes must be positive"));
        }
        if !(crate::mtu::MIN_MTU..=crate::mtu::MAX_MTU).contains(&self.mtu) {
            return Err(Error::config(format!(
                "mtu must be within [{}, {}]",
                crate::mtu::MIN_MTU,
                crate::mtu::MAX_MTU
            )));
        }
        if self.idle_timeout_s == 0 {
            return Err(Error::config("idle_timeout_s must be positive"));
        }
        Ok(())
    }

    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_s)
    }

    /// Peer address, failing for servers before any peer is known.
    pub fn require_remote(&self) -> Result<SocketAddrV4> {
        self.remote_addr
            .ok_or_else(|| Error::config("remote_addr is not set"))
    }
}
