//! Host PCIe device inventory
//!
//! Reads the PCI topology that the kernel exposes under sysfs: every function's
//! class, vendor, bound driver and IOMMU group. Probing is a pure read; nothing
//! here ever binds, unbinds or otherwise touches host state. Results are never
//! cached, callers probe again for every planning pass.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default sysfs mount point
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// PCI base class for display controllers
const CLASS_DISPLAY: u32 = 0x03;

/// PCI class/subclass for PCI-to-PCI bridges
const CLASS_PCI_BRIDGE: u32 = 0x0604;

static PCI_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9a-fA-F]{4}):([0-9a-fA-F]{2}):([0-9a-fA-F]{2})\.([0-7])$").unwrap()
});

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed sysfs attribute {path}: '{value}'")]
    Malformed { path: PathBuf, value: String },
}

// ============================================================================
// PCI addresses
// ============================================================================

/// A PCIe function address (`domain:bus:device.function`)
///
/// Field order gives the natural ordering used for tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = PCI_ADDRESS
            .captures(s)
            .ok_or_else(|| format!("'{}' is not a PCI address (dddd:bb:dd.f)", s))?;
        let hex = |i: usize| u32::from_str_radix(&caps[i], 16).unwrap_or_default();
        Ok(PciAddress {
            domain: hex(1) as u16,
            bus: hex(2) as u8,
            device: hex(3) as u8,
            function: hex(4) as u8,
        })
    }
}

impl Serialize for PciAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PciAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Host devices
// ============================================================================

/// One PCIe function as seen at probe time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDevice {
    pub address: PciAddress,
    /// `None` when the IOMMU is disabled or the function is not isolated
    pub iommu_group: Option<u32>,
    /// 24-bit class code (base, subclass, prog-if)
    pub class: u32,
    pub vendor: u16,
    pub device: u16,
    /// Bound kernel driver, `None` when unbound
    pub driver: Option<String>,
}

impl HostDevice {
    pub fn is_gpu(&self) -> bool {
        self.class >> 16 == CLASS_DISPLAY
    }

    pub fn is_bridge(&self) -> bool {
        self.class >> 8 == CLASS_PCI_BRIDGE
    }

    /// Bound to a vfio driver and therefore safe to hand to a guest
    pub fn is_passthrough_ready(&self) -> bool {
        self.driver.as_deref().is_some_and(is_vfio_driver)
    }
}

pub fn is_vfio_driver(driver: &str) -> bool {
    driver.starts_with("vfio")
}

/// Source of host device snapshots
pub trait DeviceProbe: Send + Sync {
    fn probe(&self) -> Result<Vec<HostDevice>, ProbeError>;
}

/// Reads devices from a sysfs tree
#[derive(Debug, Clone)]
pub struct SysfsProber {
    root: PathBuf,
}

impl SysfsProber {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn devices_dir(&self) -> PathBuf {
        self.root.join("bus/pci/devices")
    }

    /// Read one device; `Ok(None)` if it vanished while being read
    fn read_device(&self, dir: &Path, address: PciAddress) -> Result<Option<HostDevice>, ProbeError> {
        let class = match read_hex_attr(&dir.join("class"))? {
            Some(c) => c,
            None => return Ok(None),
        };
        let vendor = read_hex_attr(&dir.join("vendor"))?.unwrap_or_default() as u16;
        let device = read_hex_attr(&dir.join("device"))?.unwrap_or_default() as u16;

        let driver = read_link_name(&dir.join("driver"))?;
        let iommu_group = match read_link_name(&dir.join("iommu_group"))? {
            Some(name) => Some(name.parse::<u32>().map_err(|_| ProbeError::Malformed {
                path: dir.join("iommu_group"),
                value: name,
            })?),
            None => None,
        };

        Ok(Some(HostDevice {
            address,
            iommu_group,
            class,
            vendor,
            device,
            driver,
        }))
    }
}

impl Default for SysfsProber {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl DeviceProbe for SysfsProber {
    fn probe(&self) -> Result<Vec<HostDevice>, ProbeError> {
        let dir = self.devices_dir();
        let entries = std::fs::read_dir(&dir).map_err(|source| ProbeError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ProbeError::Io {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(address) = name.parse::<PciAddress>() else {
                debug!(entry = %name, "Skipping non-PCI entry");
                continue;
            };
            match self.read_device(&entry.path(), address)? {
                Some(device) => devices.push(device),
                None => debug!(address = %address, "Device disappeared during probe"),
            }
        }

        devices.sort_by_key(|d| d.address);
        debug!(count = devices.len(), root = %self.root.display(), "Probed PCI devices");
        Ok(devices)
    }
}

/// A fixed snapshot, for dry runs and tests
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    devices: Vec<HostDevice>,
}

impl StaticInventory {
    pub fn new(devices: Vec<HostDevice>) -> Self {
        Self { devices }
    }
}

impl DeviceProbe for StaticInventory {
    fn probe(&self) -> Result<Vec<HostDevice>, ProbeError> {
        Ok(self.devices.clone())
    }
}

// ============================================================================
// sysfs helpers
// ============================================================================

/// Parse a `0x`-prefixed hex attribute; `None` if the file is gone
fn read_hex_attr(path: &Path) -> Result<Option<u32>, ProbeError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ProbeError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let value = raw.trim();
    u32::from_str_radix(value.trim_start_matches("0x"), 16)
        .map(Some)
        .map_err(|_| ProbeError::Malformed {
            path: path.to_path_buf(),
            value: value.to_string(),
        })
}

/// Final path component of a symlink target; `None` if there is no link
fn read_link_name(path: &Path) -> Result<Option<String>, ProbeError> {
    match std::fs::read_link(path) {
        Ok(target) => Ok(target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ProbeError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Current driver of one function, read directly from sysfs
pub fn read_driver(root: &Path, address: PciAddress) -> Result<Option<String>, ProbeError> {
    read_link_name(
        &root
            .join("bus/pci/devices")
            .join(address.to_string())
            .join("driver"),
    )
}
