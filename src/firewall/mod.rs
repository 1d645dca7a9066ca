//! Firewall coordination.
//!
//! The kernel answers segments on the impersonated flow with RSTs that
//! would tear the connection down at the first middlebox. Each session
//! installs rules dropping locally-originated RSTs for its ports, and
//! removes them on shutdown. A crashed session leaves rules behind, so
//! startup clears any stale rules for the configured port first.

use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Role;
use crate::error::{Error, Result};

/// Executes rule operations against the host firewall.
///
/// The production implementation shells out to `iptables`; tests inject a
/// recording fake.
pub trait RuleRunner: Send + Sync {
    /// Whether the firewall backend is usable at all.
    fn available(&self) -> bool;

    /// Whether `rule` is currently installed.
    fn exists(&self, rule: &str) -> bool;

    /// Append `rule`.
    fn append(&self, rule: &str) -> Result<()>;

    /// Delete `rule`. `Ok(false)` means the rule was not present, which
    /// callers may treat as success.
    fn delete(&self, rule: &str) -> Result<bool>;
}

/// [`RuleRunner`] backed by the `iptables` binary.
pub struct IptablesRunner;

impl IptablesRunner {
    fn run(&self, action: &str, rule: &str) -> std::io::Result<std::process::Output> {
        Command::new("iptables")
            .arg(action)
            .args(rule.split_whitespace())
            .output()
    }
}

impl RuleRunner for IptablesRunner {
    fn available(&self) -> bool {
        Command::new("iptables")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn exists(&self, rule: &str) -> bool {
        self.run("-C", rule)
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn append(&self, rule: &str) -> Result<()> {
        let output = self.run("-A", rule)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::firewall(format!(
                "iptables -A {} failed: {}",
                rule,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn delete(&self, rule: &str) -> Result<bool> {
        let output = self.run("-D", rule)?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No chain/target/match") || stderr.contains("does not exist") {
            Ok(false)
        } else {
            Err(Error::firewall(format!(
                "iptables -D {} failed: {}",
                rule,
                stderr.trim()
            )))
        }
    }
}

fn port_rule(port: u16) -> String {
    format!("OUTPUT -p tcp --tcp-flags RST RST --sport {} -j DROP", port)
}

fn inbound_port_rule(port: u16) -> String {
    format!("OUTPUT -p tcp --tcp-flags RST RST --dport {} -j DROP", port)
}

fn tuple_rule(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> String {
    format!(
        "OUTPUT -p tcp --tcp-flags RST RST -s {} --sport {} -d {} --dport {} -j DROP",
        src, sport, dst, dport
    )
}

/// Tracks and removes the rules one session installs.
pub struct FirewallGuard {
    runner: Arc<dyn RuleRunner>,
    rules: Mutex<Vec<String>>,
}

impl FirewallGuard {
    /// Create a guard over the given runner.
    ///
    /// Fails with [`Error::Privilege`] when the firewall backend is
    /// unusable; the tunnel cannot run correctly without it.
    pub fn new(runner: Arc<dyn RuleRunner>) -> Result<Self> {
        if !runner.available() {
            return Err(Error::privilege("iptables is not available"));
        }
        Ok(Self {
            runner,
            rules: Mutex::new(Vec::new()),
        })
    }

    /// Install the RST-drop rule for a port. Idempotent.
    pub fn install(&self, port: u16, role: Role) -> Result<()> {
        tracing::debug!(port, ?role, "installing RST suppression");
        self.install_rule(port_rule(port))
    }

    /// Install the RST-drop rule for a specific 4-tuple. Idempotent.
    pub fn install_tuple(
        &self,
        src: Ipv4Addr,
        sport: u16,
        dst: Ipv4Addr,
        dport: u16,
    ) -> Result<()> {
        self.install_rule(tuple_rule(src, sport, dst, dport))
    }

    /// Remove every rule this guard installed.
    ///
    /// Per-rule failures are collected into one aggregate error; the sweep
    /// never stops early.
    pub fn remove_all(&self) -> Result<()> {
        let rules: Vec<String> = self.rules.lock().drain(..).collect();
        let mut failures = Vec::new();

        for rule in rules {
            match self.runner.delete(&rule) {
                Ok(_) => tracing::debug!(rule = %rule, "removed firewall rule"),
                Err(e) => failures.push(format!("{}: {}", rule, e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::firewall(format!(
                "failed to remove {} rule(s): {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }

    /// Best-effort removal of rules a crashed session left for `port`.
    ///
    /// "Rule does not exist" is not an error.
    pub fn clear_stale(&self, port: u16) {
        for rule in [port_rule(port), inbound_port_rule(port)] {
            match self.runner.delete(&rule) {
                Ok(true) => tracing::info!(rule = %rule, "cleared stale firewall rule"),
                Ok(false) => {}
                Err(e) => tracing::warn!(rule = %rule, error = %e, "stale rule removal failed"),
            }
        }
    }

    /// Snapshot of the rules this guard currently owns.
    pub fn rules(&self) -> Vec<String> {
        self.rules.lock().clone()
    }

    fn install_rule(&self, rule: String) -> Result<()> {
        let mut rules = self.rules.lock();
        if rules.contains(&rule) {
            return Ok(());
        }
        // Check-then-add: adopt a rule that already exists so it is still
        // removed on shutdown.
        if !self.runner.exists(&rule) {
            self.runner.append(&rule)?;
        }
        rules.push(rule);
        Ok(())
    }
}
