//! Inventory emitter
//!
//! Turns a lifecycle record into a host inventory. Every READY VM is polled for
//! an address until it answers or the timeout runs out; a VM that never answers
//! is `unreachable`, which is a different thing from a VM that failed to
//! provision.

pub mod formatters;

pub use formatters::{to_ini, to_json, to_yaml};

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::NodeRole;
use crate::control::AddressResolver;
use crate::devices::PciAddress;
use crate::planner::graph::{ResourceId, ResourceSpec, VmDefinition};
use crate::state::{LifecycleRecord, ResourceRecord, ResourceStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct InventorySettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for InventorySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    /// READY and answering at `address`
    Reachable,
    /// READY but never answered within the timeout
    Unreachable,
    /// Still PENDING, CREATING or DESTROYING
    NotReady,
    /// Provisioning failed
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuFact {
    pub address: PciAddress,
    pub iommu_group: u32,
    pub vendor: String,
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFacts {
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub gpu_count: usize,
    pub gpus: Vec<GpuFact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryNode {
    pub role: NodeRole,
    pub address: Option<Ipv4Addr>,
    pub outcome: NodeOutcome,
    /// Live domain name
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub facts: NodeFacts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub cluster: String,
    pub generated_at: DateTime<Utc>,
    pub nodes: BTreeMap<String, InventoryNode>,
}

impl InventoryRecord {
    /// Nodes with the given outcome, by name
    pub fn with_outcome(&self, outcome: NodeOutcome) -> impl Iterator<Item = (&String, &InventoryNode)> {
        self.nodes.iter().filter(move |(_, n)| n.outcome == outcome)
    }

    pub fn all_reachable(&self) -> bool {
        self.nodes.values().all(|n| n.outcome == NodeOutcome::Reachable)
    }

    /// Resolved addresses by VM resource id
    pub fn addresses(&self) -> BTreeMap<ResourceId, Ipv4Addr> {
        self.nodes
            .iter()
            .filter_map(|(name, n)| n.address.map(|a| (ResourceId::vm(name), a)))
            .collect()
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

fn facts_for(record: &LifecycleRecord, vm: &VmDefinition) -> NodeFacts {
    let disk_gb = match record.resources.get(&ResourceId::volume(&vm.node)).map(|r| &r.spec) {
        Some(ResourceSpec::Volume(v)) => v.capacity_gb,
        _ => 0,
    };
    NodeFacts {
        vcpus: vm.vcpus,
        memory_mb: vm.memory_mb,
        disk_gb,
        gpu_count: vm.gpu_count(),
        gpus: vm
            .passthrough
            .iter()
            .map(|a| GpuFact {
                address: a.primary,
                iommu_group: a.iommu_group,
                vendor: format!("{:04x}", a.vendor),
                device: format!("{:04x}", a.device),
            })
            .collect(),
    }
}

fn entry(
    record: &LifecycleRecord,
    rec: &ResourceRecord,
    vm: &VmDefinition,
    outcome: NodeOutcome,
    address: Option<Ipv4Addr>,
) -> InventoryNode {
    InventoryNode {
        role: vm.role,
        address,
        outcome,
        domain: vm.name.clone(),
        error: match outcome {
            NodeOutcome::Failed => rec.last_error.clone(),
            _ => None,
        },
        facts: facts_for(record, vm),
    }
}

// ============================================================================
// SBIO: I/O operations
// ============================================================================

/// Poll `resolver` every `poll_interval` until the VM answers or `timeout` passes
pub async fn wait_for_address(
    resolver: &dyn AddressResolver,
    vm: &VmDefinition,
    settings: &InventorySettings,
) -> Option<Ipv4Addr> {
    let poll = async {
        let mut interval = tokio::time::interval(settings.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match resolver.resolve(vm).await {
                Ok(Some(address)) => return address,
                Ok(None) => debug!(vm = %vm.name, "No address yet"),
                Err(e) => debug!(vm = %vm.name, error = %e, "Address lookup failed"),
            }
        }
    };
    tokio::time::timeout(settings.timeout, poll).await.ok()
}

/// Build the inventory for `record`, polling all READY VMs concurrently
pub async fn emit(
    record: &LifecycleRecord,
    resolver: &dyn AddressResolver,
    settings: &InventorySettings,
) -> InventoryRecord {
    let ready: Vec<(&ResourceRecord, &VmDefinition)> = record
        .vms()
        .filter(|(_, rec, _)| rec.status == ResourceStatus::Ready)
        .map(|(_, rec, vm)| (rec, vm))
        .collect();
    info!(cluster = %record.cluster, vms = ready.len(), "Resolving node addresses");

    let resolved = join_all(
        ready
            .iter()
            .map(|(_, vm)| async move { (vm.node.clone(), wait_for_address(resolver, vm, settings).await) }),
    )
    .await;
    let resolved: BTreeMap<String, Option<Ipv4Addr>> = resolved.into_iter().collect();

    let mut nodes = BTreeMap::new();
    for (_, rec, vm) in record.vms() {
        let node = match rec.status {
            ResourceStatus::Ready => match resolved.get(&vm.node).copied().flatten() {
                Some(address) => entry(record, rec, vm, NodeOutcome::Reachable, Some(address)),
                None => {
                    warn!(node = %vm.node, timeout_secs = settings.timeout.as_secs(), "Node did not answer");
                    entry(record, rec, vm, NodeOutcome::Unreachable, None)
                }
            },
            ResourceStatus::Failed => entry(record, rec, vm, NodeOutcome::Failed, None),
            _ => entry(record, rec, vm, NodeOutcome::NotReady, None),
        };
        nodes.insert(vm.node.clone(), node);
    }

    InventoryRecord {
        cluster: record.cluster.clone(),
        generated_at: Utc::now(),
        nodes,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::{parse_cluster_config, DocumentFormat};
    use crate::planner::graph::expand_in;
    use crate::planner::PassthroughAllocation;
    use std::path::Path;

    /// A record for a one-controller, two-compute cluster with every resource
    /// READY; compute-01 carries one GPU.
    pub fn ready_record() -> LifecycleRecord {
        let spec = parse_cluster_config(
            r#"
version: "1"
name: lab
image: /img/base.qcow2
storage: {backend: qcow2}
networks: [{name: mgmt, subnet: 10.0.0.0/24}]
nodes:
  - {name: head, role: controller, vcpus: 2, memory_mb: 2048, disk_gb: 20}
  - {name: compute, role: compute, count: 2, vcpus: 4, memory_mb: 4096, disk_gb: 40}
"#,
            DocumentFormat::Yaml,
        )
        .unwrap();
        let gpu = "0000:02:00.0".parse().unwrap();
        let alloc = PassthroughAllocation {
            node: "compute-01".to_string(),
            iommu_group: 14,
            primary: gpu,
            vendor: 0x10de,
            device: 0x2204,
            functions: vec![gpu],
        };
        let graph = expand_in(&spec, &[alloc], Path::new("/pools"));
        let mut record = LifecycleRecord::new("lab", &graph.hash());
        for (id, node) in &graph.nodes {
            let mut r = ResourceRecord::pending(node);
            r.set_status(ResourceStatus::Ready);
            record.resources.insert(id.clone(), r);
        }
        record
    }
}
