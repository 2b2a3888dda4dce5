//! Persisted rotation state.
//!
//! A flat `key=value` file maps `<technique>_<interface>` and
//! `<technique>_rotation_<interface>` to the last-applied value and
//! timestamp. Persistence exists so a daemon restart does not immediately
//! re-rotate every interface; losing it degrades to redundant rotation,
//! never to incorrect behavior.
//!
//! Updates are atomic (write-temp-then-rename) and grouped: a value entry
//! and its timestamp entry are written in the same update, and all entries
//! for an interface are removed in a single update.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use obfs_common::{ObfsError, ObfsResult};

use crate::types::MacAddr;

/// Per-interface snapshot of the persisted state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceState {
    /// Currently assigned VLAN tag
    pub current_vlan: Option<u16>,
    /// Unix seconds of the last VLAN mutation (0 = never)
    pub last_vlan_rotation: u64,
    /// Currently assigned MAC address
    pub current_mac: Option<MacAddr>,
    /// Unix seconds of the last MAC mutation (0 = never)
    pub last_mac_rotation: u64,
}

/// Reader/writer for the flat key=value state file
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Creates a store backed by the given path.
    ///
    /// The file is created lazily on first write; a missing file reads as
    /// empty state.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn vlan_key(iface: &str) -> String {
        format!("vlan_{}", iface)
    }

    fn vlan_ts_key(iface: &str) -> String {
        format!("vlan_rotation_{}", iface)
    }

    fn mac_key(iface: &str) -> String {
        format!("mac_{}", iface)
    }

    fn mac_ts_key(iface: &str) -> String {
        format!("mac_rotation_{}", iface)
    }

    /// Extracts the interface name from a state key.
    fn key_interface(key: &str) -> Option<&str> {
        // Timestamp prefixes first: "vlan_" is a prefix of "vlan_rotation_"
        for prefix in ["vlan_rotation_", "mac_rotation_", "vlan_", "mac_"] {
            if let Some(iface) = key.strip_prefix(prefix) {
                return Some(iface);
            }
        }
        None
    }

    fn read_all(&self) -> ObfsResult<BTreeMap<String, String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(ObfsError::persistence(
                    self.path.display().to_string(),
                    e.to_string(),
                ))
            }
        };

        let mut entries = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Ok(entries)
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> ObfsResult<()> {
        let to_persistence = |e: std::io::Error| {
            ObfsError::persistence(self.path.display().to_string(), e.to_string())
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(to_persistence)?;
        }

        let mut content = String::new();
        for (key, value) in entries {
            content.push_str(key);
            content.push('=');
            content.push_str(value);
            content.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content).map_err(to_persistence)?;
        fs::rename(&tmp, &self.path).map_err(to_persistence)?;
        Ok(())
    }

    /// Loads the persisted snapshot for one interface.
    ///
    /// Absent entries read as "never rotated" (timestamp 0), which forces
    /// an immediate first rotation.
    pub fn interface_state(&self, iface: &str) -> ObfsResult<InterfaceState> {
        let entries = self.read_all()?;

        let current_vlan = entries
            .get(&Self::vlan_key(iface))
            .and_then(|v| v.parse::<u16>().ok());
        let last_vlan_rotation = entries
            .get(&Self::vlan_ts_key(iface))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let current_mac = entries
            .get(&Self::mac_key(iface))
            .and_then(|v| v.parse::<MacAddr>().ok());
        let last_mac_rotation = entries
            .get(&Self::mac_ts_key(iface))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(InterfaceState {
            current_vlan,
            last_vlan_rotation,
            current_mac,
            last_mac_rotation,
        })
    }

    /// Records a VLAN mutation: tag and timestamp in one update.
    pub fn record_vlan(&self, iface: &str, tag: u16, now: u64) -> ObfsResult<()> {
        let mut entries = self.read_all()?;
        entries.insert(Self::vlan_key(iface), tag.to_string());
        entries.insert(Self::vlan_ts_key(iface), now.to_string());
        self.write_all(&entries)
    }

    /// Records a MAC mutation: address and timestamp in one update.
    pub fn record_mac(&self, iface: &str, mac: &MacAddr, now: u64) -> ObfsResult<()> {
        let mut entries = self.read_all()?;
        entries.insert(Self::mac_key(iface), mac.to_string());
        entries.insert(Self::mac_ts_key(iface), now.to_string());
        self.write_all(&entries)
    }

    /// Removes every entry for an interface in a single update.
    ///
    /// A no-op when the interface has no entries; the file is not created
    /// just to record its absence.
    pub fn forget_interface(&self, iface: &str) -> ObfsResult<()> {
        let mut entries = self.read_all()?;
        let before = entries.len();
        entries.retain(|key, _| Self::key_interface(key) != Some(iface));
        if entries.len() == before {
            return Ok(());
        }
        self.write_all(&entries)
    }

    /// Distinct interface names present in the store.
    pub fn interfaces(&self) -> ObfsResult<Vec<String>> {
        let entries = self.read_all()?;
        let mut names: Vec<String> = entries
            .keys()
            .filter_map(|k| Self::key_interface(k))
            .map(String::from)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}
