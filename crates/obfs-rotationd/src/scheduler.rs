//! Rotation scheduler.
//!
//! The only stateful, long-running part of the subsystem. Owns the
//! persisted-state store and the exclusive operation lock, drives the
//! polling rotation loop, and exposes the attach/detach hook entry points
//! plus the manual rotate operation.
//!
//! Per interface and technique the lifecycle is: Unmanaged -> (apply) ->
//! Active -> (elapsed >= interval: rotate, self-loop) -> (remove) ->
//! Unmanaged. VLAN and MAC rotate on independent intervals; timing and
//! shaping are applied once at attach and never re-rotated.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

use obfs_common::{shell, ObfsResult, OpLock};

use crate::commands::build_list_ports_cmd;
use crate::mutator::PortMutator;
use crate::policy::RotationPolicy;
use crate::state::{InterfaceState, StateStore};
use crate::types::{MacAddr, ManagedInterface, Technique};

/// Bounded timeout for bridge port enumeration.
const ENUMERATE_TIMEOUT: Duration = Duration::from_secs(5);

/// External lifecycle entry points.
///
/// Invoked once per interface lifecycle event by a collaborator outside
/// this subsystem (e.g. a udev/systemd trigger shelling into the CLI).
#[async_trait]
pub trait AttachHooks {
    /// An interface appeared on the bridge.
    async fn on_interface_attached(&mut self, iface: &str, bridge: &str) -> ObfsResult<()>;

    /// An interface was detached from the bridge.
    async fn on_interface_detached(&mut self, iface: &str, bridge: &str) -> ObfsResult<()>;
}

/// Drives periodic attribute rotation for managed interfaces
pub struct RotationScheduler {
    /// Immutable rotation policy, loaded once at startup
    policy: RotationPolicy,

    /// Attribute mutator
    mutator: PortMutator,

    /// Persisted last-rotation state
    store: StateStore,

    /// Exclusive operation lock
    lock: OpLock,

    /// In-memory state view. Authoritative for the process lifetime so
    /// persistence failures degrade to redundant rotation after restart
    /// instead of stopping rotation now.
    cache: HashMap<String, InterfaceState>,

    /// Mock bridge port listing for tests
    #[cfg(test)]
    mock_ports: Option<Vec<String>>,
}

impl RotationScheduler {
    /// Creates a scheduler from a loaded policy and storage paths
    pub fn new(policy: RotationPolicy, store: StateStore, lock: OpLock) -> Self {
        Self {
            policy,
            mutator: PortMutator::new(),
            store,
            lock,
            cache: HashMap::new(),
            #[cfg(test)]
            mock_ports: None,
        }
    }

    /// Enables mock mode on the underlying mutator
    #[cfg(test)]
    pub fn with_mock_mode(mut self) -> Self {
        self.mutator = PortMutator::new().with_mock_mode();
        self
    }

    /// Makes mock commands containing the pattern fail
    #[cfg(test)]
    pub fn with_mock_failure(mut self, pattern: impl Into<String>) -> Self {
        self.mutator = PortMutator::new().with_mock_mode().with_mock_failure(pattern);
        self
    }

    /// Substitutes the bridge port enumeration in tests
    #[cfg(test)]
    pub fn with_mock_ports(mut self, ports: Vec<&str>) -> Self {
        self.mock_ports = Some(ports.into_iter().map(String::from).collect());
        self
    }

    /// Captured mutator commands (for testing)
    #[cfg(test)]
    pub fn captured_commands(&self) -> &[String] {
        self.mutator.captured_commands()
    }

    /// The loaded policy
    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    /// Ensures lock infrastructure is usable. Fatal at daemon startup.
    pub fn ensure_lock_dir(&self) -> ObfsResult<()> {
        self.lock.ensure_parent_dir()
    }

    fn load_state(&mut self, iface: &str) -> InterfaceState {
        if let Some(state) = self.cache.get(iface) {
            return state.clone();
        }
        let state = match self.store.interface_state(iface) {
            Ok(state) => state,
            Err(e) => {
                warn!("State read failed, assuming never rotated: {}", e);
                InterfaceState::default()
            }
        };
        self.cache.insert(iface.to_string(), state.clone());
        state
    }

    fn persist_vlan(&self, iface: &str, tag: u16, now: u64) {
        if let Err(e) = self.store.record_vlan(iface, tag, now) {
            warn!("State write failed, continuing in memory: {}", e);
        }
    }

    fn persist_mac(&self, iface: &str, mac: &MacAddr, now: u64) {
        if let Err(e) = self.store.record_mac(iface, mac, now) {
            warn!("State write failed, continuing in memory: {}", e);
        }
    }

    /// Applies every enabled technique to a newly attached interface.
    ///
    /// A single technique failure is logged and does not stop the
    /// remaining techniques; the first failure is reported to the caller
    /// once all have been attempted.
    async fn apply_at(&mut self, iface: &str, now: u64) -> ObfsResult<()> {
        let mut state = self.load_state(iface);
        let mut first_err = None;

        if self.policy.is_enabled(Technique::Vlan) {
            match self.mutator.apply_vlan(iface, &self.policy).await {
                Ok(tag) => {
                    state.current_vlan = Some(tag);
                    state.last_vlan_rotation = now;
                    self.persist_vlan(iface, tag, now);
                }
                Err(e) => {
                    warn!(interface = %iface, technique = "vlan", "Apply failed: {}", e);
                    first_err.get_or_insert(e);
                }
            }
        }

        if self.policy.is_enabled(Technique::Mac) {
            match self.mutator.apply_mac(iface, &self.policy).await {
                Ok(mac) => {
                    state.current_mac = Some(mac);
                    state.last_mac_rotation = now;
                    self.persist_mac(iface, &mac, now);
                }
                Err(e) => {
                    warn!(interface = %iface, technique = "mac", "Apply failed: {}", e);
                    first_err.get_or_insert(e);
                }
            }
        }

        if self.policy.is_enabled(Technique::Timing) {
            if let Err(e) = self.mutator.apply_delay(iface, &self.policy).await {
                warn!(interface = %iface, technique = "timing", "Apply failed: {}", e);
                first_err.get_or_insert(e);
            }
        }

        if self.policy.is_enabled(Technique::Shaping) {
            if let Err(e) = self.mutator.apply_shaping(iface, &self.policy).await {
                warn!(interface = %iface, technique = "shaping", "Apply failed: {}", e);
                first_err.get_or_insert(e);
            }
        }

        self.cache.insert(iface.to_string(), state);

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Re-rotates techniques whose interval has elapsed.
    ///
    /// Both technique checks run against the same snapshot of `now`.
    /// Returns true when at least one mutation was applied.
    async fn rotate_at(&mut self, iface: &str, now: u64) -> ObfsResult<bool> {
        let mut state = self.load_state(iface);
        let mut rotated = false;
        let mut first_err = None;

        if self.policy.is_enabled(Technique::Vlan)
            && now.saturating_sub(state.last_vlan_rotation) >= self.policy.vlan_interval.as_secs()
        {
            match self.mutator.apply_vlan(iface, &self.policy).await {
                Ok(tag) => {
                    state.current_vlan = Some(tag);
                    state.last_vlan_rotation = now;
                    self.persist_vlan(iface, tag, now);
                    rotated = true;
                }
                Err(e) => {
                    warn!(interface = %iface, technique = "vlan", "Rotation failed: {}", e);
                    first_err.get_or_insert(e);
                }
            }
        }

        if self.policy.is_enabled(Technique::Mac)
            && now.saturating_sub(state.last_mac_rotation) >= self.policy.mac_interval.as_secs()
        {
            match self.mutator.apply_mac(iface, &self.policy).await {
                Ok(mac) => {
                    state.current_mac = Some(mac);
                    state.last_mac_rotation = now;
                    self.persist_mac(iface, &mac, now);
                    rotated = true;
                }
                Err(e) => {
                    warn!(interface = %iface, technique = "mac", "Rotation failed: {}", e);
                    first_err.get_or_insert(e);
                }
            }
        }

        self.cache.insert(iface.to_string(), state);

        match first_err {
            None => Ok(rotated),
            Some(e) => Err(e),
        }
    }

    /// Reverts an interface and discards its state as one group.
    async fn remove_at(&mut self, iface: &str) -> ObfsResult<()> {
        self.mutator.remove(iface).await?;
        self.cache.remove(iface);
        if let Err(e) = self.store.forget_interface(iface) {
            warn!("State cleanup failed for {}: {}", iface, e);
        }
        Ok(())
    }

    /// Applies obfuscation to one interface (attach hook / manual CLI).
    ///
    /// Fails fast with a busy error when another operation holds the
    /// exclusive lock.
    #[instrument(skip(self))]
    pub async fn apply(&mut self, iface: &str, bridge: &str) -> ObfsResult<()> {
        let _guard = self.lock.acquire()?;
        info!(bridge = %bridge, "Applying obfuscation to {}", iface);
        self.apply_at(iface, unix_now()).await
    }

    /// Rotates due techniques on one interface (manual CLI).
    #[instrument(skip(self))]
    pub async fn rotate(&mut self, iface: &str, bridge: &str) -> ObfsResult<bool> {
        let _guard = self.lock.acquire()?;
        self.rotate_at(iface, unix_now()).await
    }

    /// Reverts one interface (detach hook / manual CLI). Idempotent.
    #[instrument(skip(self))]
    pub async fn remove(&mut self, iface: &str, bridge: &str) -> ObfsResult<()> {
        let _guard = self.lock.acquire()?;
        info!(bridge = %bridge, "Removing obfuscation from {}", iface);
        self.remove_at(iface).await
    }

    async fn list_bridge_ports(&mut self) -> ObfsResult<Vec<String>> {
        #[cfg(test)]
        if let Some(ports) = &self.mock_ports {
            return Ok(ports.clone());
        }

        let cmd = build_list_ports_cmd(&self.policy.bridge);
        let output = shell::exec_with_timeout(&cmd, ENUMERATE_TIMEOUT).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Ports on the managed bridge whose name matches the policy prefix.
    async fn list_managed_ports(&mut self) -> ObfsResult<Vec<String>> {
        let prefix = self.policy.interface_prefix.clone();
        let ports = self.list_bridge_ports().await?;
        Ok(ports
            .into_iter()
            .filter(|p| p.starts_with(&prefix))
            .collect())
    }

    /// One rotation pass over every managed interface.
    ///
    /// A contended lock skips the pass (retried next poll). A failure on
    /// one interface never prevents the others from being processed.
    /// Returns the number of interfaces that had at least one mutation.
    pub async fn run_cycle(&mut self, now: u64) -> usize {
        let _guard = match self.lock.acquire() {
            Ok(guard) => guard,
            Err(e) if e.is_contention() => {
                debug!("Rotation cycle skipped: {}", e);
                return 0;
            }
            Err(e) => {
                warn!("Could not acquire rotation lock: {}", e);
                return 0;
            }
        };

        let ports = match self.list_managed_ports().await {
            Ok(ports) => ports,
            Err(e) => {
                warn!(bridge = %self.policy.bridge, "Port enumeration failed: {}", e);
                return 0;
            }
        };

        let mut rotated = 0;
        for iface in ports {
            match self.mutator.link_exists(&iface).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Link {} is gone, skipping", iface);
                    continue;
                }
                Err(e) => {
                    warn!("Link check failed for {}: {}", iface, e);
                    continue;
                }
            }

            match self.rotate_at(&iface, now).await {
                Ok(true) => rotated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(interface = %iface, "Rotation failed: {}", e);
                }
            }
        }
        rotated
    }

    /// The continuous rotation loop.
    ///
    /// Runs cycles until the shutdown future resolves; the in-flight
    /// cycle always completes before exit, and the lock is released
    /// between cycles.
    pub async fn run_until(&mut self, shutdown: impl Future<Output = ()>) {
        let poll = self.policy.poll_interval();
        info!(
            bridge = %self.policy.bridge,
            poll_secs = poll.as_secs(),
            "Starting rotation loop"
        );

        tokio::pin!(shutdown);
        loop {
            let rotated = self.run_cycle(unix_now()).await;
            debug!(rotated = rotated, "Rotation cycle complete");

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = &mut shutdown => {
                    info!("Shutdown requested, rotation loop exiting");
                    break;
                }
            }
        }
    }

    /// Persisted view of every managed interface.
    pub fn status(&self) -> ObfsResult<Vec<ManagedInterface>> {
        let mut interfaces = Vec::new();
        for name in self.store.interfaces()? {
            let state = self.store.interface_state(&name)?;
            interfaces.push(ManagedInterface {
                name,
                bridge: self.policy.bridge.clone(),
                current_vlan: state.current_vlan,
                current_mac: state.current_mac,
                last_vlan_rotation: state.last_vlan_rotation,
                last_mac_rotation: state.last_mac_rotation,
            });
        }
        Ok(interfaces)
    }
}

#[async_trait]
impl AttachHooks for RotationScheduler {
    async fn on_interface_attached(&mut self, iface: &str, bridge: &str) -> ObfsResult<()> {
        self.apply(iface, bridge).await
    }

    async fn on_interface_detached(&mut self, iface: &str, bridge: &str) -> ObfsResult<()> {
        self.remove(iface, bridge).await
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
