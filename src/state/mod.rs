//! Lifecycle records
//!
//! A [`LifecycleRecord`] is the durable account of what has been provisioned
//! for one cluster and where each resource is in its lifecycle. It is the only
//! source of truth for "already provisioned": live listings are used to detect
//! conflicts and leftovers, never to adopt resources.

mod store;
mod writer;

pub use store::{StateError, StateStore, RECORD_FORMAT};
pub use writer::StateWriter;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::planner::graph::{ResourceId, ResourceKind, ResourceNode, ResourceSpec, VmDefinition};

/// Per-resource lifecycle status. `ABSENT` is represented by having no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    Pending,
    Creating,
    Ready,
    Destroying,
    Failed,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::Pending => "PENDING",
            ResourceStatus::Creating => "CREATING",
            ResourceStatus::Ready => "READY",
            ResourceStatus::Destroying => "DESTROYING",
            ResourceStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::Running => write!(f, "running"),
            PowerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// When each lifecycle step was last entered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTimestamps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creating_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destroying_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub status: ResourceStatus,
    pub fingerprint: String,
    /// Live object name, set once the control plane has created it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<ResourceId>,
    pub spec: ResourceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<PowerState>,
    /// Address last resolved for a VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub timestamps: StepTimestamps,
}

impl ResourceRecord {
    /// A fresh PENDING entry for a desired resource
    pub fn pending(node: &ResourceNode) -> Self {
        let mut record = Self {
            kind: node.kind(),
            status: ResourceStatus::Pending,
            fingerprint: node.fingerprint.clone(),
            handle: None,
            depends_on: node.depends_on.clone(),
            spec: node.spec.clone(),
            power: None,
            address: None,
            attempts: 0,
            last_error: None,
            timestamps: StepTimestamps::default(),
        };
        record.set_status(ResourceStatus::Pending);
        record
    }

    /// Move to `status` and stamp the step time
    pub fn set_status(&mut self, status: ResourceStatus) {
        let now = Some(Utc::now());
        match status {
            ResourceStatus::Pending => self.timestamps.pending_at = now,
            ResourceStatus::Creating => self.timestamps.creating_at = now,
            ResourceStatus::Ready => {
                self.timestamps.ready_at = now;
                self.last_error = None;
            }
            ResourceStatus::Destroying => self.timestamps.destroying_at = now,
            ResourceStatus::Failed => self.timestamps.failed_at = now,
        }
        self.status = status;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.set_status(ResourceStatus::Failed);
    }

    pub fn live_name(&self) -> &str {
        self.spec.live_name()
    }

    pub fn as_vm(&self) -> Option<&VmDefinition> {
        self.spec.as_vm()
    }
}

/// Durable record for one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub cluster: String,
    /// Identifies the run that last wrote the record
    pub run_id: Uuid,
    pub graph_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub resources: BTreeMap<ResourceId, ResourceRecord>,
}

impl LifecycleRecord {
    pub fn new(cluster: &str, graph_hash: &str) -> Self {
        let now = Utc::now();
        Self {
            cluster: cluster.to_string(),
            run_id: Uuid::new_v4(),
            graph_hash: graph_hash.to_string(),
            created_at: now,
            updated_at: now,
            resources: BTreeMap::new(),
        }
    }

    pub fn status_of(&self, id: &ResourceId) -> Option<ResourceStatus> {
        self.resources.get(id).map(|r| r.status)
    }

    pub fn is_ready(&self, id: &ResourceId) -> bool {
        self.status_of(id) == Some(ResourceStatus::Ready)
    }

    /// VM entries with their definitions
    pub fn vms(&self) -> impl Iterator<Item = (&ResourceId, &ResourceRecord, &VmDefinition)> {
        self.resources
            .iter()
            .filter_map(|(id, r)| r.as_vm().map(|vm| (id, r, vm)))
    }

    pub fn count_by_status(&self) -> BTreeMap<ResourceStatus, usize> {
        let mut counts = BTreeMap::new();
        for r in self.resources.values() {
            *counts.entry(r.status).or_insert(0) += 1;
        }
        counts
    }

    /// Everything recorded is READY
    pub fn all_ready(&self) -> bool {
        self.resources
            .values()
            .all(|r| r.status == ResourceStatus::Ready)
    }

    /// `resource -> dependencies` for recorded resources
    pub fn edges(&self) -> BTreeMap<ResourceId, Vec<ResourceId>> {
        self.resources
            .iter()
            .map(|(id, r)| (id.clone(), r.depends_on.clone()))
            .collect()
    }

    /// Structural checks run on every load
    pub fn check_consistency(&self) -> Result<(), String> {
        let ids: BTreeSet<&ResourceId> = self.resources.keys().collect();
        for (id, r) in &self.resources {
            if id.kind() != Some(r.kind) || r.spec.kind() != r.kind {
                return Err(format!("resource {} has mismatched kind '{}'", id, r.kind));
            }
            for dep in &r.depends_on {
                // Dependencies are removed only after their dependents
                if r.status == ResourceStatus::Ready && !ids.contains(dep) {
                    return Err(format!(
                        "resource {} is READY but its dependency {} is not recorded",
                        id, dep
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::planner::graph::{NetworkDef, ResourceNode};

    pub fn network_node(name: &str) -> ResourceNode {
        let subnet = "10.0.0.0/24".parse().unwrap();
        let spec = ResourceSpec::Network(NetworkDef {
            name: format!("lab-{}", name),
            bridge: format!("vf-lab-{}", name),
            subnet,
            gateway: "10.0.0.1".parse().unwrap(),
        });
        ResourceNode {
            id: ResourceId::network(name),
            depends_on: Vec::new(),
            spec,
            fingerprint: format!("fp-{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_record_stamps_time() {
        let node = testing::network_node("mgmt");
        let r = ResourceRecord::pending(&node);
        assert_eq!(r.status, ResourceStatus::Pending);
        assert!(r.timestamps.pending_at.is_some());
        assert_eq!(r.live_name(), "lab-mgmt");
    }

    #[test]
    fn test_ready_clears_last_error() {
        let mut r = ResourceRecord::pending(&testing::network_node("mgmt"));
        r.fail("boom");
        assert_eq!(r.status, ResourceStatus::Failed);
        assert_eq!(r.last_error.as_deref(), Some("boom"));
        r.set_status(ResourceStatus::Ready);
        assert!(r.last_error.is_none());
        assert!(r.timestamps.failed_at.is_some());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&ResourceStatus::Destroying).unwrap();
        assert_eq!(json, "\"DESTROYING\"");
    }

    #[test]
    fn test_consistency_rejects_ready_with_missing_dependency() {
        let mut record = LifecycleRecord::new("lab", "h");
        let mut node = testing::network_node("mgmt");
        node.depends_on = vec![ResourceId::pool("lab")];
        let mut r = ResourceRecord::pending(&node);
        r.set_status(ResourceStatus::Ready);
        record.resources.insert(node.id.clone(), r);
        assert!(record.check_consistency().is_err());
    }

    #[test]
    fn test_consistency_rejects_kind_mismatch() {
        let mut record = LifecycleRecord::new("lab", "h");
        let node = testing::network_node("mgmt");
        record
            .resources
            .insert(ResourceId::vm("mgmt"), ResourceRecord::pending(&node));
        assert!(record.check_consistency().is_err());
    }
}
