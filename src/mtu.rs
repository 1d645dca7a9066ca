//! Path MTU discovery.
//!
//! Binary-searches the largest outer packet size the path carries, then
//! converts it into the payload budget the framing layer may spend. The
//! probe itself is an opaque async predicate; the session wires it to an
//! authenticated in-band echo exchange.

use std::future::Future;
use std::time::Duration;

use crate::crypto::SEAL_OVERHEAD;
use crate::rawsock::{IPV4_HEADER_LEN, TCP_HEADER_LEN};
use crate::wire::KIND_SIZE;

/// IPv4 minimum MTU.
pub const MIN_MTU: u16 = 576;

/// Standard Ethernet MTU.
pub const MAX_MTU: u16 = 1500;

/// Probe attempts before settling.
pub const MAX_PROBES: u32 = 10;

/// Per-probe timeout; an unanswered probe counts as too large.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Floor of the tunnel payload budget.
const MIN_PAYLOAD_BUDGET: u16 = 500;

/// Ceiling of the tunnel payload budget.
const MAX_PAYLOAD_BUDGET: u16 = 1371;

/// Tunnel payload budget for a given path MTU.
///
/// Subtracts the IPv4 and TCP headers, the frame kind byte and the cipher
/// overhead, clamped to `[500, 1371]`.
pub fn payload_budget(path_mtu: u16) -> u16 {
    let overhead = (IPV4_HEADER_LEN + TCP_HEADER_LEN + KIND_SIZE + SEAL_OVERHEAD) as u16;
    path_mtu
        .saturating_sub(overhead)
        .clamp(MIN_PAYLOAD_BUDGET, MAX_PAYLOAD_BUDGET)
}

/// Binary-search prober over the candidate MTU range.
pub struct MtuProber {
    low: u16,
    high: u16,
}

impl MtuProber {
    /// Create a prober over the full `[576, 1500]` range.
    pub fn new() -> Self {
        Self {
            low: MIN_MTU,
            high: MAX_MTU,
        }
    }

    /// Discover the path MTU.
    ///
    /// `probe(size)` resolves to whether an outer packet of `size` bytes
    /// reached the peer. Probes that outlive [`PROBE_TIMEOUT`] count as
    /// failures. Returns the largest size that succeeded, or the range
    /// minimum if nothing did.
    pub async fn discover<F, Fut>(&mut self, mut probe: F) -> u16
    where
        F: FnMut(u16) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut low = self.low;
        let mut high = self.high;
        let mut best = self.low;
        let mut attempts = 0;

        while low <= high && attempts < MAX_PROBES {
            attempts += 1;
            let candidate = low + (high - low) / 2;

            let reached = tokio::time::timeout(PROBE_TIMEOUT, probe(candidate))
                .await
                .unwrap_or(false);

            if reached {
                best = candidate;
                low = candidate + 1;
                tracing::debug!(candidate, "mtu probe passed");
            } else {
                high = candidate - 1;
                tracing::debug!(candidate, "mtu probe failed");
            }
        }

        best
    }
}

impl Default for MtuProber {
    fn default() -> Self {
        Self::new()
    }
}

/// Conservative MTU for a named network type, used when probing is off.
pub fn recommended_mtu(network_type: &str) -> u16 {
    match network_type {
        "ethernet" | "wifi" => 1500,
        "pppoe" => 1492,
        "mobile" => 1350,
        "vpn" => 1400,
        _ => 1500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_budget_arithmetic() {
        // 20 (IP) + 20 (TCP) + 1 (kind) + 28 (cipher) = 69 bytes overhead.
        assert_eq!(payload_budget(1200), 1131);
        assert_eq!(payload_budget(576), 507);
    }

    #[test]
    fn test_payload_budget_clamps() {
        assert_eq!(payload_budget(1500), 1371);
        assert_eq!(payload_budget(540), 500);
        assert_eq!(payload_budget(0), 500);
    }

    #[tokio::test]
    async fn test_discover_converges_on_path_limit() {
        for limit in [576u16, 1200, 1371, 1500] {
            let mut prober = MtuProber::new();
            let found = prober.discover(|size| async move { size <= limit }).await;
            assert_eq!(found, limit, "limit {}", limit);
        }
    }

    #[tokio::test]
    async fn test_discover_all_probes_fail() {
        let mut prober = MtuProber::new();
        let found = prober.discover(|_| async { false }).await;
        assert_eq!(found, MIN_MTU);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probe_counts_as_failure() {
        let mut prober = MtuProber::new();
        let found = prober
            .discover(|_| std::future::pending::<bool>())
            .await;
        assert_eq!(found, MIN_MTU);
    }

    #[test]
    fn test_recommended_mtu_table() {
        assert_eq!(recommended_mtu("ethernet"), 1500);
        assert_eq!(recommended_mtu("pppoe"), 1492);
        assert_eq!(recommended_mtu("unknown"), 1500);
    }
}
