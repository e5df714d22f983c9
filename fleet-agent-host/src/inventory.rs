//! Host inventory for node self-description
//!
//! This module handles:
//! - Network interface enumeration with MAC and IP addresses
//! - Host identification (hostname, OS, architecture, kernel release)
//! - CPU and memory snapshot, taken once at startup
//! - Load samples for the periodic heartbeat

use crate::model::NodeCandidate;
use crate::store::Patch;
use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sysinfo::System;
use tracing::{debug, info, warn};

/// Network interface information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: Option<String>,
    pub ip: String,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
}

/// Interface type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Bridge,
    Loopback,
    Other,
}

/// One-shot snapshot of the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    pub hostname: String,
    pub os_type: String,
    pub os_platform: String,
    pub os_arch: String,
    pub os_release: String,
    pub cpu_model: String,
    pub cpu_count: usize,
    pub memory_total_mb: u64,
    pub primary_mac: Option<String>,
    pub interfaces: Vec<NetworkInterface>,
}

impl Inventory {
    /// Collect the snapshot. Interface enumeration failures degrade to an empty list.
    pub fn collect() -> Self {
        info!("Collecting host inventory...");

        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();

        let interfaces = match discover_interfaces() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("Network interface enumeration failed: {:#}", e);
                Vec::new()
            }
        };
        let primary_mac = select_primary_mac(&interfaces);

        let inventory = Inventory {
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            os_type: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            os_platform: std::env::consts::OS.to_string(),
            os_arch: std::env::consts::ARCH.to_string(),
            os_release: System::kernel_version().unwrap_or_default(),
            cpu_model: sys.cpus().first().map(|c| c.brand().trim().to_string()).unwrap_or_default(),
            cpu_count: sys.cpus().len(),
            memory_total_mb: sys.total_memory() / (1024 * 1024),
            primary_mac,
            interfaces,
        };

        info!(
            "Inventory complete - Hostname: {}, OS: {} {}, {} CPUs, {} MB",
            inventory.hostname,
            inventory.os_type,
            inventory.os_release,
            inventory.cpu_count,
            inventory.memory_total_mb
        );
        inventory
    }

    /// Descriptor appended to the candidate list by an unregistered node
    pub fn candidate(&self, node_id: &str) -> NodeCandidate {
        NodeCandidate {
            id: node_id.to_string(),
            hostname: self.hostname.clone(),
            ostype: self.os_type.clone(),
            osplatform: self.os_platform.clone(),
            osarch: self.os_arch.clone(),
            osrelease: self.os_release.clone(),
        }
    }

    /// Self-description written into the node document once it exists
    pub fn descriptor_patch(&self) -> Patch {
        Patch::new()
            .set("hostname", self.hostname.clone())
            .set(
                "os",
                json!({
                    "type": self.os_type,
                    "platform": self.os_platform,
                    "arch": self.os_arch,
                    "release": self.os_release,
                }),
            )
            .set("cpu", json!({ "model": self.cpu_model, "count": self.cpu_count }))
            .set("memory", json!({ "totalMb": self.memory_total_mb }))
            .set("network", json!({ "primaryMac": self.primary_mac, "interfaces": self.interfaces }))
            .set("agentVersion", env!("CARGO_PKG_VERSION"))
    }
}

/// Point-in-time load figures for the heartbeat
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSample {
    pub uptime_seconds: u64,
    pub load1: f64,
    pub memory_used_mb: u64,
}

impl LoadSample {
    pub fn collect(sys: &mut System) -> Self {
        sys.refresh_memory();
        let load1 = if cfg!(unix) { System::load_average().one } else { 0.0 };
        let used = sys.total_memory().saturating_sub(sys.available_memory());
        LoadSample {
            uptime_seconds: System::uptime(),
            load1,
            memory_used_mb: used / (1024 * 1024),
        }
    }
}

fn discover_interfaces() -> Result<Vec<NetworkInterface>> {
    debug!("Enumerating network interfaces...");

    let addrs = get_if_addrs().context("Failed to enumerate network interfaces")?;
    let mut interfaces = Vec::new();
    for if_addr in addrs {
        let ip = match &if_addr.addr {
            IfAddr::V4(v4) => v4.ip.to_string(),
            IfAddr::V6(v6) => v6.ip.to_string(),
        };
        let interface_type = if if_addr.is_loopback() {
            InterfaceType::Loopback
        } else {
            classify_interface(&if_addr.name)
        };
        let interface = NetworkInterface {
            mac: interface_mac(&if_addr.name),
            name: if_addr.name,
            ip,
            interface_type,
        };
        debug!("Found interface: {} ({})", interface.name, interface.ip);
        interfaces.push(interface);
    }
    Ok(interfaces)
}

fn interface_mac(name: &str) -> Option<String> {
    match mac_address::mac_address_by_name(name) {
        Ok(Some(mac)) => Some(mac.to_string().to_lowercase()),
        Ok(None) => None,
        Err(e) => {
            debug!("Error getting MAC for {}: {}", name, e);
            None
        }
    }
}

/// Classify interface type based on name patterns
fn classify_interface(name: &str) -> InterfaceType {
    let name = name.to_lowercase();

    if name == "lo" || name.starts_with("lo0") {
        return InterfaceType::Loopback;
    }
    if ["wlan", "wlp", "wlo", "wifi"].iter().any(|p| name.starts_with(p)) {
        return InterfaceType::Wireless;
    }
    if ["br", "virbr", "docker", "cni", "vmbr"].iter().any(|p| name.starts_with(p)) {
        return InterfaceType::Bridge;
    }
    if name.starts_with("eth") || name.starts_with("en") || name.starts_with("bond") {
        return InterfaceType::Ethernet;
    }
    InterfaceType::Other
}

/// Ethernet first, then wireless, then anything that is not loopback
fn select_primary_mac(interfaces: &[NetworkInterface]) -> Option<String> {
    let with_mac = |kind: InterfaceType| {
        interfaces
            .iter()
            .find(|i| i.interface_type == kind && i.mac.is_some())
            .and_then(|i| i.mac.clone())
    };
    with_mac(InterfaceType::Ethernet)
        .or_else(|| with_mac(InterfaceType::Wireless))
        .or_else(|| {
            interfaces
                .iter()
                .filter(|i| i.interface_type != InterfaceType::Loopback)
                .find_map(|i| i.mac.clone())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FieldOp;

    fn interface(name: &str, mac: Option<&str>) -> NetworkInterface {
        NetworkInterface {
            name: name.to_string(),
            mac: mac.map(String::from),
            ip: "10.0.0.2".to_string(),
            interface_type: classify_interface(name),
        }
    }

    #[test]
    fn test_interface_classification() {
        assert_eq!(classify_interface("eth0"), InterfaceType::Ethernet);
        assert_eq!(classify_interface("enp3s0"), InterfaceType::Ethernet);
        assert_eq!(classify_interface("wlan0"), InterfaceType::Wireless);
        assert_eq!(classify_interface("virbr0"), InterfaceType::Bridge);
        assert_eq!(classify_interface("lo"), InterfaceType::Loopback);
        assert_eq!(classify_interface("tun0"), InterfaceType::Other);
    }

    #[test]
    fn test_primary_mac_priority() {
        let interfaces = vec![
            interface("lo", Some("00:00:00:00:00:00")),
            interface("virbr0", Some("52:54:00:00:00:01")),
            interface("wlan0", Some("aa:bb:cc:00:00:02")),
            interface("eth0", None),
            interface("eno1", Some("aa:bb:cc:00:00:03")),
        ];
        assert_eq!(select_primary_mac(&interfaces).as_deref(), Some("aa:bb:cc:00:00:03"));
        assert_eq!(select_primary_mac(&interfaces[..3]).as_deref(), Some("aa:bb:cc:00:00:02"));
        assert_eq!(select_primary_mac(&interfaces[..2]).as_deref(), Some("52:54:00:00:00:01"));
        assert_eq!(select_primary_mac(&interfaces[..1]), None);
    }

    #[test]
    fn test_candidate_and_descriptor() {
        let inventory = Inventory {
            hostname: "hv-01".into(),
            os_type: "Ubuntu".into(),
            os_platform: "linux".into(),
            os_arch: "x86_64".into(),
            os_release: "6.8.0".into(),
            cpu_model: "EPYC".into(),
            cpu_count: 32,
            memory_total_mb: 131072,
            primary_mac: Some("aa:bb:cc:00:00:03".into()),
            interfaces: vec![interface("eno1", Some("aa:bb:cc:00:00:03"))],
        };

        let candidate = inventory.candidate("n1");
        assert_eq!(candidate.id, "n1");
        assert_eq!(candidate.osplatform, "linux");
        assert_eq!(candidate.osrelease, "6.8.0");

        let patch = inventory.descriptor_patch();
        let network = patch.ops.iter().find_map(|op| match op {
            FieldOp::Set { field, value } if field == "network" => Some(value.clone()),
            _ => None,
        });
        let network = network.unwrap();
        assert_eq!(network["primaryMac"], "aa:bb:cc:00:00:03");
        assert_eq!(network["interfaces"][0]["type"], "ethernet");
    }

    #[test]
    fn test_collect_local_host() {
        let inventory = Inventory::collect();
        assert!(!inventory.hostname.is_empty());
        assert_eq!(inventory.os_platform, std::env::consts::OS);
        assert!(inventory.cpu_count > 0);
    }
}
