//! GPU passthrough planning
//!
//! Maps GPU requests onto whole IOMMU groups. A group is handed out only if it
//! is complete (every non-bridge function bound to vfio) and not owned by any
//! other VM. Groups are never split: the allocation carries every function the
//! guest must receive.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::GpuRequest;
use crate::devices::{HostDevice, PciAddress, ProbeError};
use crate::planner::graph::ResourceSpec;
use crate::state::LifecycleRecord;

/// One IOMMU group granted to one VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassthroughAllocation {
    pub node: String,
    pub iommu_group: u32,
    /// Lowest-addressed GPU function of the group
    pub primary: PciAddress,
    pub vendor: u16,
    pub device: u16,
    /// Every non-bridge function of the group, primary included, sorted
    pub functions: Vec<PciAddress>,
}

/// A request that could not be met, with everything that stood in the way
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmetRequest {
    pub node: String,
    pub requested: u32,
    pub found: u32,
    pub blockers: Vec<String>,
}

impl fmt::Display for UnmetRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} needs {} GPU group(s), found {}",
            self.node, self.requested, self.found
        )?;
        if !self.blockers.is_empty() {
            write!(f, ": {}", self.blockers.join("; "))?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Unsatisfied GPU request(s): {}", .0.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(" | "))]
    Unsatisfied(Vec<UnmetRequest>),

    #[error("GPU passthrough requested but no device reports an IOMMU group (is the IOMMU enabled?)")]
    IommuDisabled,

    #[error("Failed to read host devices: {0}")]
    Probe(#[from] ProbeError),

    #[error("Cannot determine device ownership: {0}")]
    Claims(String),

    #[error("{node}: device {address} is bound to '{driver}' instead of vfio, re-planning did not resolve it")]
    AllocationConflict {
        node: String,
        address: PciAddress,
        driver: String,
    },
}

/// Who owns a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub cluster: String,
    pub node: String,
}

/// Device ownership derived from every lifecycle record on disk.
///
/// Claims of the planning cluster itself are not exclusions: they tell the
/// planner which groups each node held before.
#[derive(Debug, Clone, Default)]
pub struct DeviceClaims {
    cluster: String,
    owners: BTreeMap<PciAddress, Claim>,
}

impl DeviceClaims {
    pub fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            owners: BTreeMap::new(),
        }
    }

    /// Collect claims from VM resources in any status
    pub fn from_records(cluster: &str, records: &[LifecycleRecord]) -> Self {
        let mut claims = Self::new(cluster);
        for record in records {
            for resource in record.resources.values() {
                if let ResourceSpec::Vm(vm) = &resource.spec {
                    for alloc in &vm.passthrough {
                        for function in &alloc.functions {
                            claims.insert(*function, &record.cluster, &vm.node);
                        }
                    }
                }
            }
        }
        claims
    }

    pub fn insert(&mut self, address: PciAddress, cluster: &str, node: &str) {
        self.owners.insert(
            address,
            Claim {
                cluster: cluster.to_string(),
                node: node.to_string(),
            },
        );
    }

    fn foreign_owner(&self, address: &PciAddress) -> Option<&Claim> {
        self.owners.get(address).filter(|c| c.cluster != self.cluster)
    }

    fn previously_owned_by(&self, address: &PciAddress, node: &str) -> bool {
        self.owners
            .get(address)
            .is_some_and(|c| c.cluster == self.cluster && c.node == node)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

// ============================================================================
// SBIO: Pure planning logic (no I/O)
// ============================================================================

struct IommuGroup<'a> {
    id: u32,
    primary: &'a HostDevice,
    /// Non-bridge functions, sorted by address
    functions: Vec<&'a HostDevice>,
}

impl IommuGroup<'_> {
    fn label(&self) -> String {
        format!("IOMMU group {} ({})", self.id, self.primary.address)
    }

    fn matches(&self, vendor: Option<u16>) -> bool {
        vendor.is_none_or(|v| self.primary.vendor == v)
    }

    fn addresses(&self) -> Vec<PciAddress> {
        self.functions.iter().map(|d| d.address).collect()
    }

    /// Conditions that make this group unusable, independent of plan state
    fn blockers(&self, claims: &DeviceClaims) -> Vec<String> {
        let mut out = Vec::new();
        for f in &self.functions {
            if let Some(owner) = claims.foreign_owner(&f.address) {
                out.push(format!(
                    "{} owned by {}/{}",
                    self.label(),
                    owner.cluster,
                    owner.node
                ));
                return out;
            }
        }
        for f in &self.functions {
            if f.is_passthrough_ready() {
                continue;
            }
            let is_primary = f.address == self.primary.address;
            let msg = match (&f.driver, is_primary) {
                (None, true) => format!("{} not ready - GPU {} unbound", self.label(), f.address),
                (Some(d), true) => format!(
                    "{} not ready - GPU {} bound to {} instead of vfio",
                    self.label(),
                    f.address,
                    d
                ),
                (None, false) => format!(
                    "{} incomplete - sibling function {} unbound",
                    self.label(),
                    f.address
                ),
                (Some(d), false) => format!(
                    "{} incomplete - sibling function {} still host-bound ({})",
                    self.label(),
                    f.address,
                    d
                ),
            };
            out.push(msg);
        }
        out
    }

    fn allocate(&self, node: &str) -> PassthroughAllocation {
        PassthroughAllocation {
            node: node.to_string(),
            iommu_group: self.id,
            primary: self.primary.address,
            vendor: self.primary.vendor,
            device: self.primary.device,
            functions: self.addresses(),
        }
    }
}

/// GPU-bearing IOMMU groups, ordered by their primary GPU address
fn gpu_groups(inventory: &[HostDevice]) -> Vec<IommuGroup<'_>> {
    let mut by_group: BTreeMap<u32, Vec<&HostDevice>> = BTreeMap::new();
    for dev in inventory {
        if let Some(group) = dev.iommu_group {
            by_group.entry(group).or_default().push(dev);
        }
    }

    let mut groups: Vec<IommuGroup<'_>> = by_group
        .into_iter()
        .filter_map(|(id, mut members)| {
            members.sort_by_key(|d| d.address);
            let primary = *members.iter().find(|d| d.is_gpu())?;
            let functions = members.into_iter().filter(|d| !d.is_bridge()).collect();
            Some(IommuGroup {
                id,
                primary,
                functions,
            })
        })
        .collect();
    groups.sort_by_key(|g| g.primary.address);
    groups
}

/// Resolve GPU requests to whole IOMMU groups.
///
/// Each node first keeps the groups it held before, then takes free groups by
/// lowest PCI address. Requests are handled in node-name order. Either every
/// request is met or nothing is allocated.
pub fn plan(
    requests: &[GpuRequest],
    inventory: &[HostDevice],
    claims: &DeviceClaims,
) -> Result<Vec<PassthroughAllocation>, PlanError> {
    let mut requests: Vec<&GpuRequest> = requests.iter().filter(|r| r.count > 0).collect();
    if requests.is_empty() {
        return Ok(Vec::new());
    }
    requests.sort_by(|a, b| a.node.cmp(&b.node));

    if inventory.iter().all(|d| d.iommu_group.is_none()) {
        return Err(PlanError::IommuDisabled);
    }

    let groups = gpu_groups(inventory);
    let blockers: Vec<Vec<String>> = groups.iter().map(|g| g.blockers(claims)).collect();
    let mut taken: BTreeMap<usize, &str> = BTreeMap::new();
    let mut granted: BTreeMap<&str, Vec<usize>> = BTreeMap::new();

    // Pass 1: keep previously held groups
    for req in &requests {
        for (idx, group) in groups.iter().enumerate() {
            let held = granted.get(req.node.as_str()).map_or(0, Vec::len);
            if held as u32 >= req.count {
                break;
            }
            let owned = group
                .functions
                .iter()
                .any(|f| claims.previously_owned_by(&f.address, &req.node));
            if owned
                && group.matches(req.vendor)
                && blockers[idx].is_empty()
                && !taken.contains_key(&idx)
            {
                taken.insert(idx, &req.node);
                granted.entry(&req.node).or_default().push(idx);
            }
        }
    }

    // Pass 2: fill from free groups
    let mut unmet = Vec::new();
    for req in &requests {
        let mut reasons = Vec::new();
        for (idx, group) in groups.iter().enumerate() {
            let held = granted.get(req.node.as_str()).map_or(0, Vec::len);
            if held as u32 >= req.count {
                break;
            }
            if !group.matches(req.vendor) {
                continue;
            }
            if let Some(owner) = taken.get(&idx) {
                if *owner != req.node {
                    reasons.push(format!("{} allocated to {}", group.label(), owner));
                }
                continue;
            }
            if !blockers[idx].is_empty() {
                reasons.extend(blockers[idx].iter().cloned());
                continue;
            }
            taken.insert(idx, &req.node);
            granted.entry(&req.node).or_default().push(idx);
        }

        let held = granted.get(req.node.as_str()).map_or(0, Vec::len) as u32;
        if held < req.count {
            if reasons.is_empty() {
                reasons.push(match req.vendor {
                    Some(v) => format!("no GPU group with vendor {:04x} on this host", v),
                    None => "no GPU groups on this host".to_string(),
                });
            }
            unmet.push(UnmetRequest {
                node: req.node.clone(),
                requested: req.count,
                found: held,
                blockers: reasons,
            });
        }
    }

    if !unmet.is_empty() {
        return Err(PlanError::Unsatisfied(unmet));
    }

    let mut allocations = Vec::new();
    for (node, idxs) in &granted {
        for idx in idxs {
            allocations.push(groups[*idx].allocate(node));
        }
    }
    allocations.sort_by(|a, b| a.node.cmp(&b.node).then(a.primary.cmp(&b.primary)));

    debug!(
        allocations = allocations.len(),
        groups = groups.len(),
        "Passthrough plan complete"
    );
    Ok(allocations)
}

/// Every function address across a set of allocations
pub fn allocated_functions(allocations: &[PassthroughAllocation]) -> BTreeSet<PciAddress> {
    allocations
        .iter()
        .flat_map(|a| a.functions.iter().copied())
        .collect()
}
