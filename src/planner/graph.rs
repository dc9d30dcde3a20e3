//! Desired-state graph
//!
//! Expands a validated [`ClusterSpec`] plus its passthrough allocations into a
//! DAG of networks, a storage pool, volumes and VM definitions. Expansion is a
//! pure function: the same inputs always serialize to the same bytes, so the
//! reconciler can diff fingerprints instead of comparing semantics.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::passthrough::PassthroughAllocation;
use crate::config::validation::FIRST_NODE_HOST;
use crate::config::{ClusterSpec, Ipv4Cidr, NodeRole, StorageBackend};

/// Pool root used when neither the cluster document nor the settings name one
pub const DEFAULT_POOL_ROOT: &str = "/var/lib/vmforge/pools";

#[derive(Error, Debug, PartialEq)]
pub enum GraphError {
    #[error("Dependency cycle between: {}", .0.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", "))]
    Cycle(Vec<ResourceId>),
}

// ============================================================================
// Identifiers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Network,
    Pool,
    Volume,
    Vm,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Network => "network",
            ResourceKind::Pool => "pool",
            ResourceKind::Volume => "volume",
            ResourceKind::Vm => "vm",
        };
        write!(f, "{}", s)
    }
}

/// Stable resource key: `<kind>/<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn network(name: &str) -> Self {
        Self(format!("network/{}", name))
    }

    pub fn pool(cluster: &str) -> Self {
        Self(format!("pool/{}", cluster))
    }

    pub fn volume(node: &str) -> Self {
        Self(format!("volume/{}", node))
    }

    pub fn vm(node: &str) -> Self {
        Self(format!("vm/{}", node))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name part after the kind prefix
    pub fn local_name(&self) -> &str {
        self.0.split_once('/').map(|(_, n)| n).unwrap_or(&self.0)
    }

    pub fn kind(&self) -> Option<ResourceKind> {
        match self.0.split_once('/')?.0 {
            "network" => Some(ResourceKind::Network),
            "pool" => Some(ResourceKind::Pool),
            "volume" => Some(ResourceKind::Volume),
            "vm" => Some(ResourceKind::Vm),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Resource definitions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDef {
    pub name: String,
    pub bridge: String,
    pub subnet: Ipv4Cidr,
    pub gateway: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDef {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDef {
    pub name: String,
    pub pool: String,
    pub capacity_gb: u64,
    pub format: StorageBackend,
    /// Template image the volume is cloned from
    pub template: PathBuf,
}

/// One NIC of a VM, with its static DHCP lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDef {
    pub network: String,
    pub bridge: String,
    pub mac: String,
    pub ip: Ipv4Addr,
}

/// Fully resolved domain description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDefinition {
    pub name: String,
    pub node: String,
    pub role: NodeRole,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub volume: String,
    pub pool: String,
    pub disk_format: StorageBackend,
    pub interfaces: Vec<InterfaceDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passthrough: Vec<PassthroughAllocation>,
}

impl VmDefinition {
    /// Address on the first attached network
    pub fn primary_ip(&self) -> Option<Ipv4Addr> {
        self.interfaces.first().map(|i| i.ip)
    }

    pub fn gpu_count(&self) -> usize {
        self.passthrough.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResourceSpec {
    Network(NetworkDef),
    Pool(PoolDef),
    Volume(VolumeDef),
    Vm(VmDefinition),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Network(_) => ResourceKind::Network,
            ResourceSpec::Pool(_) => ResourceKind::Pool,
            ResourceSpec::Volume(_) => ResourceKind::Volume,
            ResourceSpec::Vm(_) => ResourceKind::Vm,
        }
    }

    /// Name of the live object in the control plane
    pub fn live_name(&self) -> &str {
        match self {
            ResourceSpec::Network(n) => &n.name,
            ResourceSpec::Pool(p) => &p.name,
            ResourceSpec::Volume(v) => &v.name,
            ResourceSpec::Vm(vm) => &vm.name,
        }
    }

    pub fn as_vm(&self) -> Option<&VmDefinition> {
        match self {
            ResourceSpec::Vm(vm) => Some(vm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub id: ResourceId,
    pub depends_on: Vec<ResourceId>,
    pub spec: ResourceSpec,
    /// SHA-256 over the canonical JSON of `spec` and `depends_on`
    pub fingerprint: String,
}

impl ResourceNode {
    fn new(id: ResourceId, mut depends_on: Vec<ResourceId>, spec: ResourceSpec) -> Self {
        depends_on.sort();
        depends_on.dedup();
        let fingerprint = sha256_json(&(&spec, &depends_on));
        Self {
            id,
            depends_on,
            spec,
            fingerprint,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }
}

/// The complete desired state of one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredStateGraph {
    pub cluster: String,
    pub nodes: BTreeMap<ResourceId, ResourceNode>,
}

impl DesiredStateGraph {
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// SHA-256 over the canonical JSON of the whole graph
    pub fn hash(&self) -> String {
        graph_hash(self)
    }

    /// Dependencies first
    pub fn order(&self) -> Result<Vec<ResourceId>, GraphError> {
        topological_order(&self.edges())
    }

    pub fn edges(&self) -> BTreeMap<ResourceId, Vec<ResourceId>> {
        self.nodes
            .iter()
            .map(|(id, n)| (id.clone(), n.depends_on.clone()))
            .collect()
    }

    pub fn vms(&self) -> impl Iterator<Item = &VmDefinition> {
        self.nodes.values().filter_map(|n| n.spec.as_vm())
    }
}

// ============================================================================
// SBIO: Pure expansion logic (no I/O)
// ============================================================================

/// Expand with the default pool root
pub fn expand(spec: &ClusterSpec, allocations: &[PassthroughAllocation]) -> DesiredStateGraph {
    expand_in(spec, allocations, Path::new(DEFAULT_POOL_ROOT))
}

/// Expand a cluster into its desired-state graph.
///
/// `pool_root` is used only when the document does not set `storage.pool_path`.
pub fn expand_in(
    spec: &ClusterSpec,
    allocations: &[PassthroughAllocation],
    pool_root: &Path,
) -> DesiredStateGraph {
    let cluster = spec.name.as_str();
    let mut nodes = BTreeMap::new();

    for net in &spec.networks {
        let id = ResourceId::network(&net.name);
        let def = NetworkDef {
            name: live_name(cluster, &net.name),
            bridge: net.bridge.clone(),
            subnet: net.subnet,
            gateway: net.subnet.gateway().unwrap_or(net.subnet.network),
        };
        nodes.insert(id.clone(), ResourceNode::new(id, Vec::new(), ResourceSpec::Network(def)));
    }

    let pool_id = ResourceId::pool(cluster);
    let pool = PoolDef {
        name: cluster.to_string(),
        path: spec
            .storage
            .pool_path
            .clone()
            .unwrap_or_else(|| pool_root.to_path_buf())
            .join(cluster),
    };
    nodes.insert(
        pool_id.clone(),
        ResourceNode::new(pool_id.clone(), Vec::new(), ResourceSpec::Pool(pool)),
    );

    let controller_vm = spec.controller().map(|c| ResourceId::vm(&c.name));

    for (index, node) in spec.nodes.iter().enumerate() {
        let volume_id = ResourceId::volume(&node.name);
        let volume = VolumeDef {
            name: volume_name(cluster, &node.name, spec.storage.backend),
            pool: cluster.to_string(),
            capacity_gb: node.resources.disk_gb,
            format: spec.storage.backend,
            template: spec.image.clone(),
        };
        let volume_name = volume.name.clone();
        nodes.insert(
            volume_id.clone(),
            ResourceNode::new(
                volume_id.clone(),
                vec![pool_id.clone()],
                ResourceSpec::Volume(volume),
            ),
        );

        let mut deps = vec![volume_id];
        let mut interfaces = Vec::new();
        for net_name in &node.networks {
            let Some(net) = spec.network_by_name(net_name) else {
                continue;
            };
            deps.push(ResourceId::network(net_name));
            interfaces.push(InterfaceDef {
                network: live_name(cluster, net_name),
                bridge: net.bridge.clone(),
                mac: mac_address(cluster, &node.name, net_name),
                ip: node_address(&net.subnet, index).unwrap_or(net.subnet.network),
            });
        }
        if node.role == NodeRole::Compute {
            if let Some(ctl) = &controller_vm {
                deps.push(ctl.clone());
            }
        }

        let mut passthrough: Vec<PassthroughAllocation> = allocations
            .iter()
            .filter(|a| a.node == node.name)
            .cloned()
            .collect();
        passthrough.sort_by_key(|a| a.primary);

        let vm = VmDefinition {
            name: live_name(cluster, &node.name),
            node: node.name.clone(),
            role: node.role,
            vcpus: node.resources.vcpus,
            memory_mb: node.resources.memory_mb,
            volume: volume_name,
            pool: cluster.to_string(),
            disk_format: spec.storage.backend,
            interfaces,
            passthrough,
        };
        let vm_id = ResourceId::vm(&node.name);
        nodes.insert(vm_id.clone(), ResourceNode::new(vm_id, deps, ResourceSpec::Vm(vm)));
    }

    DesiredStateGraph {
        cluster: cluster.to_string(),
        nodes,
    }
}

/// Live object name, prefixed with the cluster
pub fn live_name(cluster: &str, name: &str) -> String {
    format!("{}-{}", cluster, name)
}

fn volume_name(cluster: &str, node: &str, backend: StorageBackend) -> String {
    let ext = match backend {
        StorageBackend::Qcow2 => "qcow2",
        StorageBackend::Raw => "img",
    };
    format!("{}-{}.{}", cluster, node, ext)
}

/// Locally administered unicast MAC derived from the interface identity
pub fn mac_address(cluster: &str, node: &str, network: &str) -> String {
    let digest = Sha256::digest(format!("{}/{}/{}", cluster, node, network).as_bytes());
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(&digest[..6]);
    bytes[0] = (bytes[0] | 0x02) & 0xfe;
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Static address of the node at `index` (controller is index 0)
pub fn node_address(subnet: &Ipv4Cidr, index: usize) -> Option<Ipv4Addr> {
    let offset = u32::try_from(index).ok()?.checked_add(FIRST_NODE_HOST)?;
    subnet.host(offset)
}

/// SHA-256 over the canonical JSON of the whole graph
pub fn graph_hash(graph: &DesiredStateGraph) -> String {
    sha256_json(graph)
}

fn sha256_json<T: Serialize>(value: &T) -> String {
    // Struct fields serialize in declaration order and maps are BTreeMaps,
    // so the byte stream is canonical.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

/// Kahn's algorithm over `node -> dependencies`, lowest id first among ready nodes.
///
/// Dependencies that are not themselves keys are ignored.
pub fn topological_order(
    edges: &BTreeMap<ResourceId, Vec<ResourceId>>,
) -> Result<Vec<ResourceId>, GraphError> {
    let mut remaining: BTreeMap<&ResourceId, BTreeSet<&ResourceId>> = edges
        .iter()
        .map(|(id, deps)| {
            (
                id,
                deps.iter().filter(|d| edges.contains_key(*d)).collect(),
            )
        })
        .collect();

    let mut order = Vec::with_capacity(edges.len());
    loop {
        let ready: Vec<&ResourceId> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            break;
        }
        for id in ready {
            remaining.remove(id);
            for deps in remaining.values_mut() {
                deps.remove(id);
            }
            order.push(id.clone());
        }
    }

    if remaining.is_empty() {
        Ok(order)
    } else {
        Err(GraphError::Cycle(
            remaining.keys().map(|id| (*id).clone()).collect(),
        ))
    }
}

/// Reverse edges: `node -> nodes that depend on it`
pub fn dependents(
    edges: &BTreeMap<ResourceId, Vec<ResourceId>>,
) -> BTreeMap<ResourceId, BTreeSet<ResourceId>> {
    let mut out: BTreeMap<ResourceId, BTreeSet<ResourceId>> =
        edges.keys().map(|id| (id.clone(), BTreeSet::new())).collect();
    for (id, deps) in edges {
        for dep in deps {
            if let Some(set) = out.get_mut(dep) {
                set.insert(id.clone());
            }
        }
    }
    out
}
