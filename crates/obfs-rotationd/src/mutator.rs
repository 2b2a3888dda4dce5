//! Port attribute mutator.
//!
//! Translates a rotation decision into concrete changes on one interface:
//! VLAN tag, hardware address, egress delay, ingress policing. The mutator
//! has no awareness of timing or scheduling; callers decide when to invoke
//! it and must treat every failure as recoverable.

use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use obfs_common::{shell, ObfsError, ObfsResult};

use crate::commands::{
    build_clear_policing_cmd, build_clear_vlan_cmd, build_del_qdisc_cmd, build_link_exists_cmd,
    build_set_delay_cmd, build_set_mac_cmd, build_set_policing_cmd, build_set_vlan_cmd,
};
use crate::policy::RotationPolicy;
use crate::types::MacAddr;

/// Bounded timeout for each external mutation call.
///
/// Underlying commands are expected to complete quickly or fail; the
/// timeout keeps a hung command from stalling a whole rotation cycle.
const MUTATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Applies attribute mutations to interfaces via external CLIs
pub struct PortMutator {
    /// Mock mode for testing
    #[cfg(test)]
    mock_mode: bool,

    /// Captured commands in mock mode
    #[cfg(test)]
    captured_commands: Vec<String>,

    /// Substring that makes a mock command fail, for fault injection
    #[cfg(test)]
    fail_pattern: Option<String>,
}

impl PortMutator {
    /// Creates a new mutator
    pub fn new() -> Self {
        Self {
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            captured_commands: Vec::new(),
            #[cfg(test)]
            fail_pattern: None,
        }
    }

    /// Enables mock mode for testing
    #[cfg(test)]
    pub fn with_mock_mode(mut self) -> Self {
        self.mock_mode = true;
        self
    }

    /// Makes mock commands containing the pattern fail
    #[cfg(test)]
    pub fn with_mock_failure(mut self, pattern: impl Into<String>) -> Self {
        self.fail_pattern = Some(pattern.into());
        self
    }

    /// Gets captured commands (for testing)
    #[cfg(test)]
    pub fn captured_commands(&self) -> &[String] {
        &self.captured_commands
    }

    /// Execute a shell command (with mock mode support)
    async fn exec(&mut self, cmd: &str) -> ObfsResult<()> {
        #[cfg(test)]
        if self.mock_mode {
            if let Some(pattern) = &self.fail_pattern {
                if cmd.contains(pattern.as_str()) {
                    return Err(ObfsError::ShellCommandFailed {
                        command: cmd.to_string(),
                        exit_code: 1,
                        output: "mock failure".to_string(),
                    });
                }
            }
            self.captured_commands.push(cmd.to_string());
            info!("Mock exec: {}", cmd);
            return Ok(());
        }

        shell::exec_with_timeout(cmd, MUTATION_TIMEOUT).await?;
        Ok(())
    }

    /// Checks whether the interface exists at the link layer
    pub async fn link_exists(&mut self, iface: &str) -> ObfsResult<bool> {
        match self.exec(&build_link_exists_cmd(iface)).await {
            Ok(()) => Ok(true),
            Err(ObfsError::ShellCommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Assigns a VLAN tag drawn uniformly from the pool.
    ///
    /// A pool of size 1 reselects the same value; that is a valid
    /// rotation, not an error.
    #[instrument(skip(self, policy))]
    pub async fn apply_vlan(&mut self, iface: &str, policy: &RotationPolicy) -> ObfsResult<u16> {
        let tag = pick_vlan(&policy.vlan_pool, &mut rand::thread_rng());
        self.exec(&build_set_vlan_cmd(iface, tag)).await?;

        info!(technique = "vlan", tag = tag, "Rotated VLAN tag on {}", iface);
        Ok(tag)
    }

    /// Assigns a generated hardware address with a plausible vendor prefix.
    #[instrument(skip(self, policy))]
    pub async fn apply_mac(&mut self, iface: &str, policy: &RotationPolicy) -> ObfsResult<MacAddr> {
        let mac = generate_mac(&policy.mac_oui_pool, &mut rand::thread_rng());
        self.exec(&build_set_mac_cmd(iface, &mac.to_string())).await?;

        info!(technique = "mac", mac = %mac, "Rotated MAC address on {}", iface);
        Ok(mac)
    }

    /// Installs a randomized egress delay.
    #[instrument(skip(self, policy))]
    pub async fn apply_delay(&mut self, iface: &str, policy: &RotationPolicy) -> ObfsResult<u64> {
        let delay_ms = pick_delay_ms(policy.max_delay_ms, &mut rand::thread_rng());
        self.exec(&build_set_delay_cmd(iface, delay_ms)).await?;

        info!(
            technique = "timing",
            delay_ms = delay_ms,
            "Applied egress delay on {}",
            iface
        );
        Ok(delay_ms)
    }

    /// Installs randomized ingress policing.
    ///
    /// The rate is drawn from [50%, 100%] of the configured baseline with
    /// a burst proportional to it. Returns (rate, burst) in kbps.
    #[instrument(skip(self, policy))]
    pub async fn apply_shaping(
        &mut self,
        iface: &str,
        policy: &RotationPolicy,
    ) -> ObfsResult<(u64, u64)> {
        let (rate_kbps, burst_kbps) =
            pick_shaping_kbps(policy.shaping_rate_mbps, &mut rand::thread_rng());
        self.exec(&build_set_policing_cmd(iface, rate_kbps, burst_kbps))
            .await?;

        info!(
            technique = "shaping",
            rate_kbps = rate_kbps,
            burst_kbps = burst_kbps,
            "Applied ingress policing on {}",
            iface
        );
        Ok((rate_kbps, burst_kbps))
    }

    /// Reverts applied state: clears the VLAN tag and policing, deletes
    /// the delay qdisc. The MAC address is left as last set.
    ///
    /// Idempotent and best-effort: an interface with no applied state, or
    /// one that is already gone, is not an error.
    #[instrument(skip(self))]
    pub async fn remove(&mut self, iface: &str) -> ObfsResult<()> {
        if let Err(e) = self.exec(&build_clear_vlan_cmd(iface)).await {
            debug!("VLAN clear on {} skipped: {}", iface, e);
        }
        if let Err(e) = self.exec(&build_clear_policing_cmd(iface)).await {
            debug!("Policing clear on {} skipped: {}", iface, e);
        }
        if let Err(e) = self.exec(&build_del_qdisc_cmd(iface)).await {
            // Expected whenever no delay qdisc was installed
            debug!("Qdisc delete on {} skipped: {}", iface, e);
        }

        info!("Cleared obfuscation state from {}", iface);
        Ok(())
    }
}

impl Default for PortMutator {
    fn default() -> Self {
        Self::new()
    }
}

/// Uniform selection from the VLAN pool
fn pick_vlan<R: Rng>(pool: &[u16], rng: &mut R) -> u16 {
    pool[rng.gen_range(0..pool.len())]
}

/// Builds a MAC from a random pool OUI plus three random octets.
///
/// The all-zero and broadcast addresses are rejected and regenerated.
fn generate_mac<R: Rng>(oui_pool: &[[u8; 3]], rng: &mut R) -> MacAddr {
    loop {
        let oui = oui_pool[rng.gen_range(0..oui_pool.len())];
        let mac = MacAddr::from_octets([oui[0], oui[1], oui[2], rng.gen(), rng.gen(), rng.gen()]);
        if !mac.is_reserved() {
            return mac;
        }
        warn!(mac = %mac, "Regenerating reserved MAC address");
    }
}

/// Uniform delay in [1, max_delay_ms]
fn pick_delay_ms<R: Rng>(max_delay_ms: u64, rng: &mut R) -> u64 {
    rng.gen_range(1..=max_delay_ms)
}

/// Rate in [50%, 100%] of the baseline, burst at a tenth of the rate.
/// Both in kbps as OVS expects.
fn pick_shaping_kbps<R: Rng>(base_mbps: u64, rng: &mut R) -> (u64, u64) {
    let low = (base_mbps / 2).max(1);
    let rate_kbps = rng.gen_range(low..=base_mbps) * 1000;
    let burst_kbps = rate_kbps / 10;
    (rate_kbps, burst_kbps)
}
