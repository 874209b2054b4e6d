//! Static bus topology
//!
//! The device graph is supplied by configuration, never discovered. Each
//! [`BridgeGroup`] names one top-level bridge and everything behind it; the
//! flat sequences the operator works with are derived from the groups, so
//! every GPU belongs to exactly one top-level bridge by construction.
//!
//! ```text
//! root port (top-level bridge) ── removed as one node
//!   └─ switch upstream / downstream ports (bridge chain)
//!        └─ GPU function (.0) + companion audio function (.1)
//! ```

use crate::error::{RebarError, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// PCI device address `domain:bus:device.function`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Address as used in sysfs paths
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = RebarError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason| RebarError::InvalidAddress {
            input: s.to_string(),
            reason,
        };

        let trimmed = s.trim();
        let (domain, rest) = trimmed.split_once(':').ok_or_else(|| invalid("missing domain"))?;
        let (bus, rest) = rest.split_once(':').ok_or_else(|| invalid("missing bus"))?;
        let (device, function) = rest.split_once('.').ok_or_else(|| invalid("missing function"))?;

        let hex = |field: &str, width: usize| {
            field.len() == width && field.chars().all(|c| c.is_ascii_hexdigit())
        };

        if !hex(domain, 4) {
            return Err(invalid("domain must be 4 hex digits"));
        }
        if !hex(bus, 2) {
            return Err(invalid("bus must be 2 hex digits"));
        }
        if !hex(device, 2) || u8::from_str_radix(device, 16).map_or(true, |d| d > 0x1f) {
            return Err(invalid("device must be 2 hex digits, at most 1f"));
        }
        if !matches!(function, "0" | "1" | "2" | "3" | "4" | "5" | "6" | "7") {
            return Err(invalid("function must be 0-7"));
        }

        Ok(Self(trimmed.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = RebarError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One top-level bridge and the devices behind it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeGroup {
    /// Top-level bridge; removing it removes the whole group
    pub bridge: DeviceAddress,
    /// Intermediate bridges between `bridge` and the GPU, top-down
    #[serde(default)]
    pub chain: Vec<DeviceAddress>,
    /// GPU function whose BAR is resized
    pub gpu: DeviceAddress,
    /// Companion function (HDMI audio) sharing the slot
    #[serde(default)]
    pub companion: Option<DeviceAddress>,
}

impl BridgeGroup {
    fn descendants(&self) -> impl Iterator<Item = &DeviceAddress> {
        self.chain
            .iter()
            .chain(std::iter::once(&self.gpu))
            .chain(self.companion.iter())
    }
}

/// Read-only device graph for one machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    groups: Vec<BridgeGroup>,
    gpu_devices: Vec<DeviceAddress>,
    companion_devices: Vec<DeviceAddress>,
    top_level_bridges: Vec<DeviceAddress>,
    bridge_chain: Vec<DeviceAddress>,
}

impl Topology {
    /// Build and validate a topology from its groups
    ///
    /// # Errors
    ///
    /// Returns `RebarError::Config` if the topology is empty or lists an
    /// address more than once.
    pub fn from_groups(groups: Vec<BridgeGroup>) -> Result<Self> {
        if groups.is_empty() {
            return Err(RebarError::config("topology has no groups"));
        }

        let mut seen = HashSet::new();
        for group in &groups {
            for address in std::iter::once(&group.bridge).chain(group.descendants()) {
                if !seen.insert(address) {
                    return Err(RebarError::config(format!(
                        "{address} appears more than once in the topology"
                    )));
                }
            }
        }

        let gpu_devices = groups.iter().map(|g| g.gpu.clone()).collect();
        let companion_devices = groups.iter().filter_map(|g| g.companion.clone()).collect();
        let top_level_bridges = groups.iter().map(|g| g.bridge.clone()).collect();
        let bridge_chain = groups
            .iter()
            .flat_map(|g| std::iter::once(&g.bridge).chain(g.chain.iter()))
            .cloned()
            .collect();

        Ok(Self {
            groups,
            gpu_devices,
            companion_devices,
            top_level_bridges,
            bridge_chain,
        })
    }

    /// GPU functions, in configuration order
    #[must_use]
    pub fn gpu_devices(&self) -> &[DeviceAddress] {
        &self.gpu_devices
    }

    /// Companion functions, in configuration order
    #[must_use]
    pub fn companion_devices(&self) -> &[DeviceAddress] {
        &self.companion_devices
    }

    /// Bridges removed to tear down each subtree
    #[must_use]
    pub fn top_level_bridges(&self) -> &[DeviceAddress] {
        &self.top_level_bridges
    }

    /// Every bridge, top-level first within each group
    #[must_use]
    pub fn bridge_chain(&self) -> &[DeviceAddress] {
        &self.bridge_chain
    }

    /// Configured groups
    #[must_use]
    pub fn groups(&self) -> &[BridgeGroup] {
        &self.groups
    }

    /// Group containing `gpu`
    #[must_use]
    pub fn group_of(&self, gpu: &DeviceAddress) -> Option<&BridgeGroup> {
        self.groups.iter().find(|g| &g.gpu == gpu)
    }

    /// Top-level bridge above `gpu`
    #[must_use]
    pub fn top_level_bridge_of(&self, gpu: &DeviceAddress) -> Option<&DeviceAddress> {
        self.group_of(gpu).map(|g| &g.bridge)
    }

    /// Everything that disappears when `bridge` is removed
    #[must_use]
    pub fn descendants_of(&self, bridge: &DeviceAddress) -> Vec<&DeviceAddress> {
        self.groups
            .iter()
            .find(|g| &g.bridge == bridge)
            .map(|g| g.descendants().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> DeviceAddress {
        s.parse().unwrap()
    }

    fn group(n: u8) -> BridgeGroup {
        BridgeGroup {
            bridge: addr(&format!("0000:{n:02x}:01.1")),
            chain: vec![addr(&format!("0000:{:02x}:00.0", n + 1))],
            gpu: addr(&format!("0000:{:02x}:00.0", n + 3)),
            companion: Some(addr(&format!("0000:{:02x}:00.1", n + 3))),
        }
    }

    #[test]
    fn parses_addresses() {
        assert_eq!(addr("0000:0A:00.0").as_str(), "0000:0a:00.0");
        assert!("0000:0a:00".parse::<DeviceAddress>().is_err());
        assert!("0a:00.0".parse::<DeviceAddress>().is_err());
        assert!("0000:0a:20.0".parse::<DeviceAddress>().is_err());
        assert!("0000:0a:00.8".parse::<DeviceAddress>().is_err());
        assert!("0000:zz:00.0".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn flattens_groups_in_order() {
        let topo = Topology::from_groups(vec![group(0x00), group(0x20)]).unwrap();
        assert_eq!(topo.gpu_devices(), &[addr("0000:03:00.0"), addr("0000:23:00.0")]);
        assert_eq!(topo.companion_devices().len(), 2);
        assert_eq!(topo.top_level_bridges(), &[addr("0000:00:01.1"), addr("0000:20:01.1")]);
        assert_eq!(
            topo.bridge_chain(),
            &[
                addr("0000:00:01.1"),
                addr("0000:01:00.0"),
                addr("0000:20:01.1"),
                addr("0000:21:00.0")
            ]
        );
    }

    #[test]
    fn cascade_relationship() {
        let topo = Topology::from_groups(vec![group(0x00), group(0x20)]).unwrap();
        let gpu = addr("0000:23:00.0");
        assert_eq!(topo.top_level_bridge_of(&gpu), Some(&addr("0000:20:01.1")));

        let below = topo.descendants_of(&addr("0000:20:01.1"));
        assert!(below.contains(&&gpu));
        assert!(below.contains(&&addr("0000:23:00.1")));
        assert!(topo.descendants_of(&gpu).is_empty());
    }

    #[test]
    fn rejects_duplicates_and_empty() {
        assert!(Topology::from_groups(vec![]).is_err());
        assert!(Topology::from_groups(vec![group(0x00), group(0x00)]).is_err());

        let mut shared = group(0x20);
        shared.gpu = addr("0000:03:00.0");
        assert!(Topology::from_groups(vec![group(0x00), shared]).is_err());
    }
}
