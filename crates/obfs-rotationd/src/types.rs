//! Type definitions for the rotation daemon

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Obfuscation technique applied to a managed interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Technique {
    /// VLAN tag rotation on the OVS port
    Vlan,
    /// MAC address rotation on the interface
    Mac,
    /// Egress delay perturbation (applied once at attach)
    Timing,
    /// Ingress rate shaping perturbation (applied once at attach)
    Shaping,
}

impl Technique {
    /// All techniques, in the order they are applied at attach time
    pub const ALL: [Technique; 4] = [
        Technique::Vlan,
        Technique::Mac,
        Technique::Timing,
        Technique::Shaping,
    ];

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Technique::Vlan => "vlan",
            Technique::Mac => "mac",
            Technique::Timing => "timing",
            Technique::Shaping => "shaping",
        }
    }

    /// Returns true for techniques the scheduler re-rotates periodically.
    ///
    /// Timing and shaping are applied once when an interface attaches and
    /// are not revisited by the rotation loop.
    pub fn is_rotating(&self) -> bool {
        matches!(self, Technique::Vlan | Technique::Mac)
    }
}

impl FromStr for Technique {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vlan" => Ok(Technique::Vlan),
            "mac" => Ok(Technique::Mac),
            "timing" => Ok(Technique::Timing),
            "shaping" => Ok(Technique::Shaping),
            other => Err(format!("unknown technique '{}'", other)),
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 6-octet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Create from raw octets
    pub fn from_octets(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// The all-zero address
    pub fn is_all_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }

    /// The broadcast address ff:ff:ff:ff:ff:ff
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xffu8; 6]
    }

    /// Reserved patterns that must never be assigned to an interface
    pub fn is_reserved(&self) -> bool {
        self.is_all_zero() || self.is_broadcast()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("invalid MAC address '{}'", s));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            octets[i] =
                u8::from_str_radix(part, 16).map_err(|_| format!("invalid MAC octet '{}'", part))?;
        }
        Ok(MacAddr(octets))
    }
}

/// One virtual port under obfuscation control
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedInterface {
    /// Interface name (matches the configured prefix, e.g. "nm-")
    pub name: String,
    /// Parent bridge the port belongs to
    pub bridge: String,
    /// Currently assigned VLAN tag, if VLAN rotation is active
    pub current_vlan: Option<u16>,
    /// Currently assigned MAC address, if MAC rotation is active
    pub current_mac: Option<MacAddr>,
    /// Unix seconds of the last VLAN mutation (0 = never)
    pub last_vlan_rotation: u64,
    /// Unix seconds of the last MAC mutation (0 = never)
    pub last_mac_rotation: u64,
}

impl ManagedInterface {
    /// Create a fresh record with no applied state
    pub fn new(name: impl Into<String>, bridge: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bridge: bridge.into(),
            current_vlan: None,
            current_mac: None,
            last_vlan_rotation: 0,
            last_mac_rotation: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_technique_from_str() {
        assert_eq!("vlan".parse::<Technique>().unwrap(), Technique::Vlan);
        assert_eq!("MAC".parse::<Technique>().unwrap(), Technique::Mac);
        assert_eq!(" timing ".parse::<Technique>().unwrap(), Technique::Timing);
        assert_eq!("shaping".parse::<Technique>().unwrap(), Technique::Shaping);
        assert!("onion".parse::<Technique>().is_err());
    }

    #[test]
    fn test_technique_rotating() {
        assert!(Technique::Vlan.is_rotating());
        assert!(Technique::Mac.is_rotating());
        assert!(!Technique::Timing.is_rotating());
        assert!(!Technique::Shaping.is_rotating());
    }

    #[test]
    fn test_mac_display() {
        let mac = MacAddr::from_octets([0x02, 0x00, 0x00, 0xab, 0xcd, 0xef]);
        assert_eq!(mac.to_string(), "02:00:00:ab:cd:ef");
    }

    #[test]
    fn test_mac_parse_roundtrip() {
        let mac: MacAddr = "52:54:00:12:34:56".parse().unwrap();
        assert_eq!(mac.to_string(), "52:54:00:12:34:56");

        assert!("52:54:00".parse::<MacAddr>().is_err());
        assert!("zz:54:00:12:34:56".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_mac_reserved_patterns() {
        assert!(MacAddr::from_octets([0; 6]).is_reserved());
        assert!(MacAddr::from_octets([0xff; 6]).is_reserved());
        assert!(!MacAddr::from_octets([0x02, 0, 0, 0, 0, 1]).is_reserved());
    }

    #[test]
    fn test_managed_interface_new() {
        let iface = ManagedInterface::new("nm-wg0", "ovsbr0");
        assert_eq!(iface.name, "nm-wg0");
        assert_eq!(iface.bridge, "ovsbr0");
        assert!(iface.current_vlan.is_none());
        assert!(iface.current_mac.is_none());
        assert_eq!(iface.last_vlan_rotation, 0);
        assert_eq!(iface.last_mac_rotation, 0);
    }
}
