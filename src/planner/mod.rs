//! Planning: passthrough allocation and desired-state expansion

pub mod capacity;
pub mod graph;
pub mod passthrough;

pub use capacity::{check_host_capacity, HostCapacity};
pub use graph::{
    expand, expand_in, graph_hash, topological_order, DesiredStateGraph, GraphError, ResourceId,
    ResourceKind, ResourceNode, ResourceSpec, VmDefinition,
};
pub use passthrough::{plan, DeviceClaims, PassthroughAllocation, PlanError, UnmetRequest};
