//! Cluster configuration schema
//!
//! Two layers live here:
//! - [`RawClusterConfig`]: the document exactly as written, loosely typed so that
//!   every mistake can be reported by the validator instead of failing in serde.
//! - [`ClusterSpec`]: the validated, typed model. Immutable once produced.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Schema versions this build understands
pub const SUPPORTED_VERSIONS: &[&str] = &["1", "1.0"];

// ============================================================================
// Raw document (as parsed)
// ============================================================================

/// The cluster document before validation
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawClusterConfig {
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    /// Template image that node volumes are cloned from
    #[serde(default)]
    pub image: Option<String>,

    #[serde(default)]
    pub storage: Option<RawStorage>,

    #[serde(default)]
    pub networks: Vec<RawNetwork>,

    #[serde(default)]
    pub nodes: Vec<RawNode>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawStorage {
    #[serde(default)]
    pub backend: Option<String>,

    #[serde(default)]
    pub pool_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawNetwork {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub subnet: Option<String>,

    #[serde(default)]
    pub bridge: Option<String>,
}

/// A node entry. Numbers are signed so negative values reach the validator.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawNode {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub role: Option<String>,

    #[serde(default)]
    pub count: Option<i64>,

    #[serde(default)]
    pub vcpus: Option<i64>,

    #[serde(default)]
    pub memory_mb: Option<i64>,

    #[serde(default)]
    pub disk_gb: Option<i64>,

    #[serde(default)]
    pub gpu: Option<RawGpu>,

    #[serde(default)]
    pub networks: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawGpu {
    #[serde(default)]
    pub count: Option<i64>,

    #[serde(default)]
    pub vendor: Option<String>,
}

// ============================================================================
// Typed model (validated)
// ============================================================================

/// Validated cluster document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    pub version: String,
    pub image: PathBuf,
    pub storage: StorageSpec,
    pub networks: Vec<NetworkSpec>,
    /// Expanded nodes, controller first, then compute nodes in name order
    pub nodes: Vec<NodeSpec>,
}

impl ClusterSpec {
    /// The single controller node
    pub fn controller(&self) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.role == NodeRole::Controller)
    }

    /// All compute nodes in name order
    pub fn compute_nodes(&self) -> Vec<&NodeSpec> {
        self.nodes
            .iter()
            .filter(|n| n.role == NodeRole::Compute)
            .collect()
    }

    pub fn node_by_name(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn network_by_name(&self, name: &str) -> Option<&NetworkSpec> {
        self.networks.iter().find(|n| n.name == name)
    }

    /// GPU requests for every node that asks for at least one GPU
    pub fn gpu_requests(&self) -> Vec<GpuRequest> {
        self.nodes
            .iter()
            .filter(|n| n.resources.gpus.count > 0)
            .map(|n| GpuRequest {
                node: n.name.clone(),
                count: n.resources.gpus.count,
                vendor: n.resources.gpus.vendor,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Controller,
    Compute,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Controller => write!(f, "controller"),
            NodeRole::Compute => write!(f, "compute"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(NodeRole::Controller),
            "compute" => Ok(NodeRole::Compute),
            other => Err(format!(
                "unknown role '{}', expected one of: controller, compute",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub role: NodeRole,
    pub resources: NodeResources,
    /// Networks this node attaches to, in declaration order
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    #[serde(default)]
    pub gpus: GpuSpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSpec {
    pub count: u32,
    /// PCI vendor id filter (e.g. 0x10de)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<u16>,
}

/// A node's request for passthrough GPUs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuRequest {
    pub node: String,
    pub count: u32,
    pub vendor: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Qcow2,
    Raw,
}

impl StorageBackend {
    pub const ALL: &'static [&'static str] = &["qcow2", "raw"];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Qcow2 => "qcow2",
            StorageBackend::Raw => "raw",
        }
    }
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qcow2" => Ok(StorageBackend::Qcow2),
            "raw" => Ok(StorageBackend::Raw),
            other => Err(format!(
                "unsupported storage backend '{}', expected one of: {}",
                other,
                Self::ALL.join(", ")
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSpec {
    pub backend: StorageBackend,
    /// Pool directory; `None` means `<state_dir>/pools/<cluster>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub subnet: Ipv4Cidr,
    pub bridge: String,
}

/// An IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    pub network: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    /// Host address at `offset` inside the network, if it fits below broadcast
    pub fn host(&self, offset: u32) -> Option<Ipv4Addr> {
        if offset == 0 || u64::from(offset) >= self.size().saturating_sub(1) {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network) + offset))
    }

    /// Total number of addresses in the network
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.host(1)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        };
        Ipv4Addr::from(mask)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("'{}' is not in CIDR notation (a.b.c.d/n)", s))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| format!("'{}' is not a valid IPv4 address", addr))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("'{}' is not a valid prefix length", prefix))?;
        if prefix > 32 {
            return Err(format!("prefix length {} exceeds 32", prefix));
        }
        let cidr = Ipv4Cidr {
            network: addr,
            prefix,
        };
        if u32::from(addr) & !u32::from(cidr.netmask()) != 0 {
            return Err(format!("'{}' has host bits set", s));
        }
        Ok(cidr)
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
