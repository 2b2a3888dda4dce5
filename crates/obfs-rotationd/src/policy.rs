//! Rotation policy loaded once at daemon start.
//!
//! The policy is parsed from a flat shell-assignment config file
//! (`KEY=value`, `#` comments, optional `export ` prefix) and is immutable
//! for the lifetime of the process. Changing it requires a restart.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use obfs_common::{ObfsError, ObfsResult};

use crate::types::Technique;

/// Config file keys
pub mod keys {
    pub const ENABLE_OBFUSCATION: &str = "ENABLE_OBFUSCATION";
    pub const BRIDGE_NAME: &str = "BRIDGE_NAME";
    pub const INTERFACE_PREFIX: &str = "INTERFACE_PREFIX";
    pub const ENABLED_TECHNIQUES: &str = "ENABLED_TECHNIQUES";
    pub const VLAN_POOL: &str = "VLAN_POOL";
    pub const VLAN_ROTATION_INTERVAL: &str = "VLAN_ROTATION_INTERVAL";
    pub const MAC_ROTATION_INTERVAL: &str = "MAC_ROTATION_INTERVAL";
    pub const MAC_OUI_POOL: &str = "MAC_OUI_POOL";
    pub const MAX_DELAY_MS: &str = "MAX_DELAY_MS";
    pub const SHAPING_RATE_MBPS: &str = "SHAPING_RATE_MBPS";
}

/// Default values applied for absent keys
pub mod defaults {
    /// Default managed bridge
    pub const BRIDGE_NAME: &str = "ovsbr0";

    /// Default managed interface name prefix (Netmaker-created ports)
    pub const INTERFACE_PREFIX: &str = "nm-";

    /// Default enabled techniques
    pub const ENABLED_TECHNIQUES: &str = "vlan,mac,timing,shaping";

    /// Default VLAN tag pool
    pub const VLAN_POOL: &str = "100,200,300,400,500";

    /// Default VLAN rotation interval in seconds
    pub const VLAN_ROTATION_INTERVAL_SECS: u64 = 300;

    /// Default MAC rotation interval in seconds
    pub const MAC_ROTATION_INTERVAL_SECS: u64 = 1800;

    /// Default OUI pool: common virtualization vendor prefixes
    pub const MAC_OUI_POOL: &str = "00:16:3e,52:54:00,00:0c:29,00:50:56,08:00:27";

    /// Default upper bound for the egress delay perturbation
    pub const MAX_DELAY_MS: u64 = 50;

    /// Default shaping rate baseline in Mbps (effective rate is drawn
    /// from 50-100% of this)
    pub const SHAPING_RATE_MBPS: u64 = 100;
}

/// Process-wide rotation policy, immutable after load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationPolicy {
    /// Managed OVS bridge
    pub bridge: String,
    /// Name prefix identifying managed interfaces
    pub interface_prefix: String,
    /// Candidate VLAN tags
    pub vlan_pool: Vec<u16>,
    /// Interval between VLAN re-rotations
    pub vlan_interval: Duration,
    /// Interval between MAC re-rotations
    pub mac_interval: Duration,
    /// Vendor prefixes for generated MAC addresses
    pub mac_oui_pool: Vec<[u8; 3]>,
    /// Upper bound for the egress delay perturbation
    pub max_delay_ms: u64,
    /// Shaping rate baseline in Mbps
    pub shaping_rate_mbps: u64,
    /// Enabled techniques
    pub enabled: BTreeSet<Technique>,
}

impl RotationPolicy {
    /// Checks whether a technique is enabled
    pub fn is_enabled(&self, technique: Technique) -> bool {
        self.enabled.contains(&technique)
    }

    /// Sleep between scheduler cycles.
    ///
    /// Polling at 4x the fastest rotation frequency bounds worst-case
    /// staleness to 25% of the shortest configured interval.
    pub fn poll_interval(&self) -> Duration {
        self.vlan_interval.min(self.mac_interval) / 4
    }
}

/// Loads the rotation policy from a config file.
///
/// Returns [`ObfsError::ObfuscationDisabled`] when the enable flag is
/// absent or not truthy; callers treat that as a valid "do nothing"
/// configuration, not a defect.
pub fn load(path: &Path) -> ObfsResult<RotationPolicy> {
    let content = std::fs::read_to_string(path).map_err(|e| ObfsError::ConfigLoad {
        path: path.display().to_string(),
        source: e,
    })?;
    parse(&content)
}

/// Parses config file content into a validated policy.
pub fn parse(content: &str) -> ObfsResult<RotationPolicy> {
    let assignments = parse_assignments(content);

    let enabled_flag = assignments
        .get(keys::ENABLE_OBFUSCATION)
        .map(|v| is_truthy(v))
        .unwrap_or(false);
    if !enabled_flag {
        return Err(ObfsError::ObfuscationDisabled);
    }

    let bridge = assignments
        .get(keys::BRIDGE_NAME)
        .cloned()
        .unwrap_or_else(|| defaults::BRIDGE_NAME.to_string());

    let interface_prefix = assignments
        .get(keys::INTERFACE_PREFIX)
        .cloned()
        .unwrap_or_else(|| defaults::INTERFACE_PREFIX.to_string());

    let enabled = parse_techniques(
        assignments
            .get(keys::ENABLED_TECHNIQUES)
            .map(String::as_str)
            .unwrap_or(defaults::ENABLED_TECHNIQUES),
    )?;

    let vlan_pool = parse_vlan_pool(
        assignments
            .get(keys::VLAN_POOL)
            .map(String::as_str)
            .unwrap_or(defaults::VLAN_POOL),
    )?;

    let vlan_interval = Duration::from_secs(parse_positive_secs(
        &assignments,
        keys::VLAN_ROTATION_INTERVAL,
        defaults::VLAN_ROTATION_INTERVAL_SECS,
    )?);

    let mac_interval = Duration::from_secs(parse_positive_secs(
        &assignments,
        keys::MAC_ROTATION_INTERVAL,
        defaults::MAC_ROTATION_INTERVAL_SECS,
    )?);

    let mac_oui_pool = parse_oui_pool(
        assignments
            .get(keys::MAC_OUI_POOL)
            .map(String::as_str)
            .unwrap_or(defaults::MAC_OUI_POOL),
    )?;

    let max_delay_ms = parse_u64(&assignments, keys::MAX_DELAY_MS, defaults::MAX_DELAY_MS)?;

    let shaping_rate_mbps = parse_u64(
        &assignments,
        keys::SHAPING_RATE_MBPS,
        defaults::SHAPING_RATE_MBPS,
    )?;

    let policy = RotationPolicy {
        bridge,
        interface_prefix,
        vlan_pool,
        vlan_interval,
        mac_interval,
        mac_oui_pool,
        max_delay_ms,
        shaping_rate_mbps,
        enabled,
    };

    validate(&policy)?;
    Ok(policy)
}

/// Splits config content into KEY=value assignments.
///
/// Blank lines and `#` comments are skipped; an `export ` prefix and
/// matching surrounding quotes on values are tolerated, since the
/// reference format is a sourced shell fragment.
fn parse_assignments(content: &str) -> BTreeMap<String, String> {
    let mut assignments = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().to_string();
            let value = unquote(value.trim()).to_string();
            assignments.insert(key, value);
        }
    }
    assignments
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn parse_techniques(value: &str) -> ObfsResult<BTreeSet<Technique>> {
    let mut techniques = BTreeSet::new();
    for part in value.split(',').filter(|p| !p.trim().is_empty()) {
        let technique = part
            .parse::<Technique>()
            .map_err(|e| ObfsError::invalid_config(keys::ENABLED_TECHNIQUES, e))?;
        techniques.insert(technique);
    }
    Ok(techniques)
}

fn parse_vlan_pool(value: &str) -> ObfsResult<Vec<u16>> {
    let mut pool = Vec::new();
    for part in value.split(',').filter(|p| !p.trim().is_empty()) {
        let tag = part.trim().parse::<u16>().map_err(|_| {
            ObfsError::invalid_config(keys::VLAN_POOL, format!("invalid VLAN tag '{}'", part))
        })?;
        if !(1..=4094).contains(&tag) {
            return Err(ObfsError::invalid_config(
                keys::VLAN_POOL,
                format!("VLAN tag {} outside [1,4094]", tag),
            ));
        }
        pool.push(tag);
    }
    Ok(pool)
}

fn parse_oui_pool(value: &str) -> ObfsResult<Vec<[u8; 3]>> {
    let mut pool = Vec::new();
    for part in value.split(',').filter(|p| !p.trim().is_empty()) {
        pool.push(parse_oui(part.trim())?);
    }
    Ok(pool)
}

fn parse_oui(value: &str) -> ObfsResult<[u8; 3]> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 3 {
        return Err(ObfsError::invalid_config(
            keys::MAC_OUI_POOL,
            format!("invalid OUI '{}'", value),
        ));
    }
    let mut oui = [0u8; 3];
    for (i, part) in parts.iter().enumerate() {
        oui[i] = u8::from_str_radix(part, 16).map_err(|_| {
            ObfsError::invalid_config(keys::MAC_OUI_POOL, format!("invalid OUI octet '{}'", part))
        })?;
    }
    Ok(oui)
}

fn parse_u64(assignments: &BTreeMap<String, String>, key: &str, default: u64) -> ObfsResult<u64> {
    match assignments.get(key) {
        None => Ok(default),
        Some(value) => value.trim().parse::<u64>().map_err(|_| {
            ObfsError::invalid_config(key, format!("expected an integer, got '{}'", value))
        }),
    }
}

fn parse_positive_secs(
    assignments: &BTreeMap<String, String>,
    key: &str,
    default: u64,
) -> ObfsResult<u64> {
    let secs = parse_u64(assignments, key, default)?;
    if secs == 0 {
        return Err(ObfsError::invalid_config(key, "interval must be positive"));
    }
    Ok(secs)
}

fn validate(policy: &RotationPolicy) -> ObfsResult<()> {
    if policy.is_enabled(Technique::Vlan) && policy.vlan_pool.is_empty() {
        return Err(ObfsError::invalid_config(
            keys::VLAN_POOL,
            "VLAN rotation enabled with an empty pool",
        ));
    }
    if policy.is_enabled(Technique::Mac) && policy.mac_oui_pool.is_empty() {
        return Err(ObfsError::invalid_config(
            keys::MAC_OUI_POOL,
            "MAC rotation enabled with an empty OUI pool",
        ));
    }
    if policy.is_enabled(Technique::Timing) && policy.max_delay_ms == 0 {
        return Err(ObfsError::invalid_config(
            keys::MAX_DELAY_MS,
            "timing perturbation enabled with a zero delay bound",
        ));
    }
    if policy.is_enabled(Technique::Shaping) && policy.shaping_rate_mbps == 0 {
        return Err(ObfsError::invalid_config(
            keys::SHAPING_RATE_MBPS,
            "shaping enabled with a zero rate baseline",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
# Obfuscation rotation settings
ENABLE_OBFUSCATION=true
BRIDGE_NAME=br-mesh
INTERFACE_PREFIX=nm-
ENABLED_TECHNIQUES=vlan,mac
VLAN_POOL=100,200,300
VLAN_ROTATION_INTERVAL=300
MAC_ROTATION_INTERVAL=1800
MAC_OUI_POOL=02:00:00
MAX_DELAY_MS=40
SHAPING_RATE_MBPS=100
"#;

    #[test]
    fn test_parse_full_config() {
        let policy = parse(FULL_CONFIG).unwrap();
        assert_eq!(policy.bridge, "br-mesh");
        assert_eq!(policy.interface_prefix, "nm-");
        assert_eq!(policy.vlan_pool, vec![100, 200, 300]);
        assert_eq!(policy.vlan_interval, Duration::from_secs(300));
        assert_eq!(policy.mac_interval, Duration::from_secs(1800));
        assert_eq!(policy.mac_oui_pool, vec![[0x02, 0x00, 0x00]]);
        assert!(policy.is_enabled(Technique::Vlan));
        assert!(policy.is_enabled(Technique::Mac));
        assert!(!policy.is_enabled(Technique::Timing));
        assert!(!policy.is_enabled(Technique::Shaping));
    }

    #[test]
    fn test_absent_enable_flag_is_disabled() {
        let result = parse("VLAN_POOL=100,200\n");
        assert!(matches!(result, Err(ObfsError::ObfuscationDisabled)));
    }

    #[test]
    fn test_explicit_disable() {
        let result = parse("ENABLE_OBFUSCATION=false\n");
        assert!(matches!(result, Err(ObfsError::ObfuscationDisabled)));
    }

    #[test]
    fn test_defaults_applied() {
        let policy = parse("ENABLE_OBFUSCATION=true\n").unwrap();
        assert_eq!(policy.bridge, defaults::BRIDGE_NAME);
        assert_eq!(policy.interface_prefix, defaults::INTERFACE_PREFIX);
        assert_eq!(policy.vlan_pool, vec![100, 200, 300, 400, 500]);
        assert_eq!(
            policy.vlan_interval,
            Duration::from_secs(defaults::VLAN_ROTATION_INTERVAL_SECS)
        );
        assert_eq!(
            policy.mac_interval,
            Duration::from_secs(defaults::MAC_ROTATION_INTERVAL_SECS)
        );
        assert_eq!(policy.mac_oui_pool.len(), 5);
        assert_eq!(policy.max_delay_ms, defaults::MAX_DELAY_MS);
        assert_eq!(policy.shaping_rate_mbps, defaults::SHAPING_RATE_MBPS);
        assert_eq!(policy.enabled.len(), 4);
    }

    #[test]
    fn test_shell_fragment_tolerance() {
        let policy = parse(
            "export ENABLE_OBFUSCATION=\"true\"\nexport BRIDGE_NAME='br0'\n# comment\n\n",
        )
        .unwrap();
        assert_eq!(policy.bridge, "br0");
    }

    #[test]
    fn test_vlan_tag_out_of_range() {
        let result = parse("ENABLE_OBFUSCATION=true\nVLAN_POOL=100,4095\n");
        assert!(matches!(result, Err(ObfsError::InvalidConfig { .. })));
    }

    #[test]
    fn test_vlan_tag_zero_rejected() {
        let result = parse("ENABLE_OBFUSCATION=true\nVLAN_POOL=0\n");
        assert!(matches!(result, Err(ObfsError::InvalidConfig { .. })));
    }

    #[test]
    fn test_empty_vlan_pool_with_vlan_enabled() {
        let result = parse("ENABLE_OBFUSCATION=true\nENABLED_TECHNIQUES=vlan\nVLAN_POOL=\n");
        assert!(matches!(result, Err(ObfsError::InvalidConfig { .. })));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = parse("ENABLE_OBFUSCATION=true\nVLAN_ROTATION_INTERVAL=0\n");
        assert!(matches!(result, Err(ObfsError::InvalidConfig { .. })));
    }

    #[test]
    fn test_unknown_technique_rejected() {
        let result = parse("ENABLE_OBFUSCATION=true\nENABLED_TECHNIQUES=vlan,onion\n");
        assert!(matches!(result, Err(ObfsError::InvalidConfig { .. })));
    }

    #[test]
    fn test_bad_oui_rejected() {
        let result = parse("ENABLE_OBFUSCATION=true\nMAC_OUI_POOL=02:00\n");
        assert!(matches!(result, Err(ObfsError::InvalidConfig { .. })));
    }

    #[test]
    fn test_poll_interval_quarter_of_fastest() {
        // intervals 300/1800 -> poll sleep 75s
        let policy = parse(FULL_CONFIG).unwrap();
        assert_eq!(policy.poll_interval(), Duration::from_secs(75));
    }

    #[test]
    fn test_single_tag_pool_is_valid() {
        let policy = parse("ENABLE_OBFUSCATION=true\nVLAN_POOL=100\n").unwrap();
        assert_eq!(policy.vlan_pool, vec![100]);
    }

    #[test]
    fn test_load_missing_file() {
        let result = load(Path::new("/nonexistent/rotation.conf"));
        assert!(matches!(result, Err(ObfsError::ConfigLoad { .. })));
    }
}
